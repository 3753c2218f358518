//! Systemic risk veto, evaluated for non-EXTREME regimes.
//!
//! A check whose inputs are absent is reported as unevaluable, never as safe.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use common::config::RiskConfig;
use common::{HorizonView, ReasonTag};

/// A triggered veto
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RiskVeto {
    LiquidationPhase { price_move: f64, oi_change: f64 },
    Crowding { funding_rate: f64, oi_growth: f64 },
    AbnormalVolume { volume_ratio: f64 },
}

impl RiskVeto {
    pub fn reason_tag(&self) -> ReasonTag {
        match self {
            RiskVeto::LiquidationPhase { .. } => ReasonTag::LiquidationPhase,
            RiskVeto::Crowding { .. } => ReasonTag::Crowding,
            RiskVeto::AbnormalVolume { .. } => ReasonTag::AbnormalVolume,
        }
    }
}

impl std::fmt::Display for RiskVeto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskVeto::LiquidationPhase { price_move, oi_change } => {
                write!(f, "Liquidation phase: price moved {:.4} while OI changed {:.4}", price_move, oi_change)
            }
            RiskVeto::Crowding { funding_rate, oi_growth } => {
                write!(f, "Crowding: funding {:.5} with OI growth {:.4}", funding_rate, oi_growth)
            }
            RiskVeto::AbnormalVolume { volume_ratio } => {
                write!(f, "Abnormal volume: {:.2}x trailing average", volume_ratio)
            }
        }
    }
}

/// Result of the risk gate
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RiskOutcome {
    pub vetoes: Vec<RiskVeto>,
    /// Checks that could not run, with the missing input
    pub unevaluable: Vec<String>,
}

impl RiskOutcome {
    pub fn is_vetoed(&self) -> bool {
        !self.vetoes.is_empty()
    }

    pub fn is_evaluable(&self) -> bool {
        self.unevaluable.is_empty()
    }

    /// Only a complete evaluation with no veto counts as passed
    pub fn passed(&self) -> bool {
        !self.is_vetoed() && self.is_evaluable()
    }

    pub fn tags(&self) -> Vec<ReasonTag> {
        let mut tags: Vec<ReasonTag> = self.vetoes.iter().map(RiskVeto::reason_tag).collect();
        if !self.is_evaluable() {
            tags.push(ReasonTag::RiskUnevaluable);
        }
        tags
    }

    pub fn summary(&self) -> String {
        let mut parts: Vec<String> = self.vetoes.iter().map(|v| v.to_string()).collect();
        parts.extend(self.unevaluable.iter().map(|u| format!("cannot evaluate {}", u)));
        if parts.is_empty() {
            "no systemic risk".to_string()
        } else {
            parts.join("; ")
        }
    }
}

pub struct RiskGate {
    config: RiskConfig,
}

impl RiskGate {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    pub fn evaluate(&self, view: &HorizonView) -> RiskOutcome {
        let mut outcome = RiskOutcome::default();

        // Liquidation: large fast move while OI contracts
        match (view.fast.price_change, view.fast.oi_change) {
            (Some(price_move), Some(oi_change)) => {
                if price_move.abs() >= self.config.liquidation_price_move
                    && oi_change <= -self.config.liquidation_oi_drop
                {
                    outcome.vetoes.push(RiskVeto::LiquidationPhase { price_move, oi_change });
                }
            }
            _ => outcome
                .unevaluable
                .push(format!("liquidation phase (price/OI change {})", view.windows.fast)),
        }

        // Crowding: extreme funding with strong OI build-up
        match (view.funding_rate, view.trend_metrics().oi_change) {
            (Some(funding_rate), Some(oi_growth)) => {
                if funding_rate.abs() >= self.config.crowding_funding_rate
                    && oi_growth >= self.config.crowding_oi_growth
                {
                    outcome.vetoes.push(RiskVeto::Crowding { funding_rate, oi_growth });
                }
            }
            (None, _) => outcome.unevaluable.push("crowding (funding_rate)".to_string()),
            (_, None) => outcome
                .unevaluable
                .push(format!("crowding (oi_change_{})", view.trend_window())),
        }

        match view.volume_ratio {
            Some(volume_ratio) => {
                if volume_ratio >= self.config.abnormal_volume_multiple {
                    outcome.vetoes.push(RiskVeto::AbnormalVolume { volume_ratio });
                }
            }
            None => outcome.unevaluable.push("abnormal volume (volume ratio)".to_string()),
        }

        if !outcome.is_evaluable() {
            warn!(symbol = %view.symbol, missing = ?outcome.unevaluable, "Risk checks could not be evaluated");
        }
        if outcome.is_vetoed() {
            warn!(symbol = %view.symbol, vetoes = %outcome.summary(), "Systemic risk veto");
        } else {
            debug!(symbol = %view.symbol, "Risk gate passed");
        }
        outcome
    }
}

impl Default for RiskGate {
    fn default() -> Self {
        Self::new(RiskConfig::default())
    }
}
