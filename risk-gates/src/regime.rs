//! Market regime classification: EXTREME > TREND > RANGE

use serde::{Deserialize, Serialize};
use tracing::debug;

use common::config::RegimeConfig;
use common::{HorizonView, Regime, Window};

/// Regime plus the evidence it was decided on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeAssessment {
    pub regime: Regime,
    /// Window whose move decided TREND vs RANGE
    pub trend_window: Window,
    /// Trend read from the fast window because the slow one is missing
    pub degraded: bool,
    pub message: String,
}

pub struct RegimeClassifier {
    config: RegimeConfig,
}

impl RegimeClassifier {
    pub fn new(config: RegimeConfig) -> Self {
        Self { config }
    }

    pub fn classify(&self, view: &HorizonView) -> RegimeAssessment {
        let fast_window = view.windows.fast;
        let trend_window = view.trend_window();
        let degraded = view.is_degraded();

        if let Some(fast_move) = view.fast.price_change {
            let limit = self.config.extreme_move.get(fast_window);
            if fast_move.abs() >= limit {
                debug!(symbol = %view.symbol, window = %fast_window, fast_move, limit, "EXTREME regime");
                return RegimeAssessment {
                    regime: Regime::Extreme,
                    trend_window,
                    degraded,
                    message: format!("|price_change_{}| {:.4} >= {:.4}", fast_window, fast_move.abs(), limit),
                };
            }
        }

        let limit = self.config.trend_move.get(trend_window);
        let (regime, message) = match view.trend_metrics().price_change {
            Some(trend_move) if trend_move.abs() >= limit => (
                Regime::Trend,
                format!("|price_change_{}| {:.4} >= {:.4}", trend_window, trend_move.abs(), limit),
            ),
            Some(trend_move) => (
                Regime::Range,
                format!("|price_change_{}| {:.4} < {:.4}", trend_window, trend_move.abs(), limit),
            ),
            None => (Regime::Range, format!("price_change_{} absent", trend_window)),
        };

        let message = if degraded {
            format!("{} (slow window {} missing, read from {})", message, view.windows.slow, trend_window)
        } else {
            message
        };
        debug!(symbol = %view.symbol, regime = %regime, degraded, "Regime classified");

        RegimeAssessment {
            regime,
            trend_window,
            degraded,
            message,
        }
    }
}

impl Default for RegimeClassifier {
    fn default() -> Self {
        Self::new(RegimeConfig::default())
    }
}
