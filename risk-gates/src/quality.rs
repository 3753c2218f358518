//! Opportunity quality grading.
//!
//! POOR stops the pipeline. UNCERTAIN lets evaluation continue under a
//! confidence cap, so the two must never be conflated.

use serde::{Deserialize, Serialize};
use tracing::debug;

use common::config::QualityConfig;
use common::{HorizonView, Quality, ReasonTag, Regime};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityAssessment {
    pub quality: Quality,
    pub tags: Vec<ReasonTag>,
    pub notes: Vec<String>,
}

impl QualityAssessment {
    pub fn is_poor(&self) -> bool {
        self.quality == Quality::Poor
    }
}

pub struct QualityGate {
    config: QualityConfig,
}

impl QualityGate {
    pub fn new(config: QualityConfig) -> Self {
        Self { config }
    }

    pub fn assess(&self, view: &HorizonView, regime: Regime) -> QualityAssessment {
        let mut poor = Vec::new();
        let mut uncertain = Vec::new();
        let mut notes = Vec::new();
        let mut incomplete = false;

        // Absorption: one-sided flow that fails to move volume
        match (view.fast.imbalance, view.volume_ratio) {
            (Some(imbalance), Some(ratio)) => {
                if imbalance.abs() >= self.config.absorption_imbalance && ratio <= self.config.absorption_volume_ratio {
                    poor.push(ReasonTag::AbsorptionRisk);
                    notes.push(format!("imbalance {:.2} absorbed at volume ratio {:.2}", imbalance, ratio));
                }
            }
            _ => {
                incomplete = true;
                notes.push("absorption check missing imbalance or volume ratio".to_string());
            }
        }

        // Divergence: price and OI moving hard in opposite directions
        let trend = view.trend_metrics();
        match (trend.price_change, trend.oi_change) {
            (Some(price), Some(oi)) => {
                if price.abs() >= self.config.divergence_price_move
                    && oi.abs() >= self.config.divergence_oi_move
                    && price.signum() != oi.signum()
                {
                    poor.push(ReasonTag::OiDivergence);
                    notes.push(format!(
                        "price {:+.4} diverges from OI {:+.4} on {}",
                        price,
                        oi,
                        view.trend_window()
                    ));
                }
            }
            _ => {
                incomplete = true;
                notes.push(format!("divergence check missing {} inputs", view.trend_window()));
            }
        }

        if !poor.is_empty() {
            debug!(symbol = %view.symbol, tags = ?poor, "Quality POOR");
            return QualityAssessment {
                quality: Quality::Poor,
                tags: poor,
                notes,
            };
        }

        match view.funding_rate {
            Some(funding) if funding.abs() >= self.config.funding_noise_rate => {
                uncertain.push(ReasonTag::FundingNoise);
                notes.push(format!("funding {:.5} is noisy", funding));
            }
            Some(_) => {}
            None => {
                incomplete = true;
                notes.push("funding_rate absent".to_string());
            }
        }

        if regime == Regime::Range {
            match view.fast.imbalance {
                Some(imbalance) if imbalance.abs() < self.config.weak_range_imbalance => {
                    uncertain.push(ReasonTag::WeakRangeSignal);
                    notes.push(format!("range imbalance {:.2} is weak", imbalance));
                }
                _ => {}
            }
        }

        if incomplete {
            uncertain.push(ReasonTag::DataIncomplete);
        }

        let quality = if uncertain.is_empty() {
            Quality::Good
        } else {
            Quality::Uncertain
        };
        debug!(symbol = %view.symbol, quality = %quality, tags = ?uncertain, "Quality graded");

        QualityAssessment {
            quality,
            tags: uncertain,
            notes,
        }
    }
}

impl Default for QualityGate {
    fn default() -> Self {
        Self::new(QualityConfig::default())
    }
}
