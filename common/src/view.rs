//! Horizon-resolved view of a normalized sample, as read by the gates

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::sample::{Metric, Window};

/// Fast and slow lookback windows of one horizon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HorizonWindows {
    pub fast: Window,
    pub slow: Window,
}

/// Metrics of one window; each may be absent
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowMetrics {
    pub price_change: Option<f64>,
    pub oi_change: Option<f64>,
    pub imbalance: Option<f64>,
}

impl WindowMetrics {
    pub fn from_fields(fields: &BTreeMap<String, f64>, window: Window) -> Self {
        let get = |metric: Metric| fields.get(&metric.key(window)).copied();
        Self {
            price_change: get(Metric::PriceChange),
            oi_change: get(Metric::OiChange),
            imbalance: get(Metric::Imbalance),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.price_change.is_some() && self.oi_change.is_some() && self.imbalance.is_some()
    }

    /// Names of the absent metrics, for trace messages
    pub fn missing(&self, window: Window) -> Vec<String> {
        let mut missing = Vec::new();
        if self.price_change.is_none() {
            missing.push(Metric::PriceChange.key(window));
        }
        if self.oi_change.is_none() {
            missing.push(Metric::OiChange.key(window));
        }
        if self.imbalance.is_none() {
            missing.push(Metric::Imbalance.key(window));
        }
        missing
    }
}

/// Everything the regime, risk, quality and direction stages read for one horizon.
///
/// `slow` is `None` when the horizon runs degraded on its fast window only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HorizonView {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub windows: HorizonWindows,
    pub fast: WindowMetrics,
    pub slow: Option<WindowMetrics>,
    pub funding_rate: Option<f64>,
    /// Current volume over trailing average volume
    pub volume_ratio: Option<f64>,
}

impl HorizonView {
    pub fn is_degraded(&self) -> bool {
        self.slow.is_none()
    }

    /// Window used for trend decisions: slow, or fast when degraded
    pub fn trend_window(&self) -> Window {
        if self.slow.is_some() {
            self.windows.slow
        } else {
            self.windows.fast
        }
    }

    pub fn trend_metrics(&self) -> &WindowMetrics {
        self.slow.as_ref().unwrap_or(&self.fast)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_metrics_completeness() {
        let mut fields = BTreeMap::new();
        fields.insert("price_change_1h".to_string(), 0.01);
        fields.insert("oi_change_1h".to_string(), 0.02);
        let metrics = WindowMetrics::from_fields(&fields, Window::H1);
        assert!(!metrics.is_complete());
        assert_eq!(metrics.missing(Window::H1), vec!["imbalance_1h".to_string()]);

        fields.insert("imbalance_1h".to_string(), 0.3);
        assert!(WindowMetrics::from_fields(&fields, Window::H1).is_complete());
    }

    #[test]
    fn test_degraded_view_uses_fast_window_for_trend() {
        let fast = WindowMetrics {
            price_change: Some(0.02),
            oi_change: Some(0.01),
            imbalance: Some(0.4),
        };
        let view = HorizonView {
            symbol: "ETHUSDT".to_string(),
            timestamp: Utc::now(),
            windows: HorizonWindows { fast: Window::H1, slow: Window::H6 },
            fast,
            slow: None,
            funding_rate: None,
            volume_ratio: None,
        };
        assert!(view.is_degraded());
        assert_eq!(view.trend_window(), Window::H1);
        assert_eq!(view.trend_metrics().price_change, Some(0.02));
    }
}
