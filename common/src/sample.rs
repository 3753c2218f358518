//! Market telemetry samples and lookback windows

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::levels::ParseLevelError;

/// Lookback window supported by the cache and the window-keyed metric fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Window {
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "6h")]
    H6,
}

impl Window {
    pub const ALL: [Window; 4] = [Window::M5, Window::M15, Window::H1, Window::H6];

    pub fn seconds(self) -> i64 {
        match self {
            Window::M5 => 300,
            Window::M15 => 900,
            Window::H1 => 3_600,
            Window::H6 => 21_600,
        }
    }

    pub fn duration(self) -> Duration {
        Duration::seconds(self.seconds())
    }

    /// Suffix used in metric field names, e.g. `price_change_1h`
    pub fn suffix(self) -> &'static str {
        match self {
            Window::M5 => "5m",
            Window::M15 => "15m",
            Window::H1 => "1h",
            Window::H6 => "6h",
        }
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.suffix())
    }
}

impl FromStr for Window {
    type Err = ParseLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "5m" => Ok(Window::M5),
            "15m" => Ok(Window::M15),
            "1h" => Ok(Window::H1),
            "6h" => Ok(Window::H6),
            other => Err(ParseLevelError::new("window", other)),
        }
    }
}

/// Encoding of percentage-change fields in an incoming sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PercentFormat {
    /// 1.5 means 1.5%
    #[serde(rename = "scaled_by_100")]
    ScaledBy100,
    /// 0.015 means 1.5%
    Fractional,
}

impl PercentFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            PercentFormat::ScaledBy100 => "scaled_by_100",
            PercentFormat::Fractional => "fractional",
        }
    }
}

impl fmt::Display for PercentFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for PercentFormat {
    type Err = ParseLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scaled_by_100" => Ok(PercentFormat::ScaledBy100),
            "fractional" => Ok(PercentFormat::Fractional),
            other => Err(ParseLevelError::new("percent format", other)),
        }
    }
}

/// Window-keyed metric families carried in [`Sample::fields`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    PriceChange,
    OiChange,
    Imbalance,
}

impl Metric {
    pub fn key(self, window: Window) -> String {
        match self {
            Metric::PriceChange => format!("price_change_{}", window.suffix()),
            Metric::OiChange => format!("oi_change_{}", window.suffix()),
            Metric::Imbalance => format!("imbalance_{}", window.suffix()),
        }
    }
}

/// One timestamped telemetry record for a symbol.
///
/// Every numeric input is optional: an absent value is never read as zero.
/// Window metrics live in `fields` under `<metric>_change_<window>` and
/// `imbalance_<window>` keys so that new windows need no schema change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub price: Option<f64>,
    /// Volume traded in the latest aggregation bucket
    #[serde(default)]
    pub volume: Option<f64>,
    /// Trailing average volume, when the feed provides one
    #[serde(default)]
    pub avg_volume: Option<f64>,
    #[serde(default)]
    pub open_interest: Option<f64>,
    /// Always fractional (0.0001 = 0.01%)
    #[serde(default)]
    pub funding_rate: Option<f64>,
    #[serde(default)]
    pub fields: BTreeMap<String, f64>,
    /// Declared encoding of percentage fields: `scaled_by_100` or `fractional`
    #[serde(default)]
    pub pct_format: Option<String>,
}

impl Sample {
    pub fn new(symbol: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.into(),
            timestamp,
            price: None,
            volume: None,
            avg_volume: None,
            open_interest: None,
            funding_rate: None,
            fields: BTreeMap::new(),
            pct_format: None,
        }
    }

    pub fn with_price(mut self, price: f64) -> Self {
        self.price = Some(price);
        self
    }

    pub fn with_volume(mut self, volume: f64, avg_volume: Option<f64>) -> Self {
        self.volume = Some(volume);
        self.avg_volume = avg_volume;
        self
    }

    pub fn with_open_interest(mut self, open_interest: f64) -> Self {
        self.open_interest = Some(open_interest);
        self
    }

    pub fn with_funding_rate(mut self, funding_rate: f64) -> Self {
        self.funding_rate = Some(funding_rate);
        self
    }

    pub fn with_format(mut self, format: PercentFormat) -> Self {
        self.pct_format = Some(format.as_str().to_string());
        self
    }

    pub fn with_metric(mut self, metric: Metric, window: Window, value: f64) -> Self {
        self.fields.insert(metric.key(window), value);
        self
    }

    pub fn metric(&self, metric: Metric, window: Window) -> Option<f64> {
        self.fields.get(&metric.key(window)).copied()
    }
}
