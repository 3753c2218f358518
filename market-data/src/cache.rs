//! Temporal Cache
//! Per-symbol bounded sample history with floor-only trailing lookups.
//!
//! A lookup never returns a sample stamped after its target time, and fails
//! outright when the nearest earlier sample is further away than the window's
//! tolerance. Each symbol's history sits behind its own lock, so writers for
//! different symbols never contend.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use common::config::CacheConfig;
use common::{Metric, Sample, Window};

type Series = Arc<RwLock<VecDeque<Sample>>>;

/// Rejected writes
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CacheError {
    #[error("sample for {symbol} at {received} is older than the latest stored sample at {latest}")]
    OutOfOrder {
        symbol: String,
        latest: DateTime<Utc>,
        received: DateTime<Utc>,
    },

    #[error("sample for {sample_symbol} stored under {symbol}")]
    SymbolMismatch { symbol: String, sample_symbol: String },
}

/// Why a floor lookup returned nothing
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LookupMiss {
    #[error("no history for symbol")]
    UnknownSymbol,

    #[error("no sample at or before {target}")]
    NoSampleBefore { target: DateTime<Utc> },

    #[error("nearest sample is {gap_secs}s before target, tolerance {tolerance_secs}s")]
    GapExceeded { gap_secs: i64, tolerance_secs: i64 },
}

/// Successful floor lookup
#[derive(Debug, Clone, PartialEq)]
pub struct FloorHit {
    pub sample: Sample,
    /// target − stored time, never negative
    pub gap_secs: i64,
}

/// Lookup outcome for one window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowCoverage {
    /// Achieved gap, when any earlier sample exists
    pub gap_secs: Option<i64>,
    pub valid: bool,
}

/// Per-window coverage at one instant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coverage {
    pub symbol: String,
    pub at: DateTime<Utc>,
    pub windows: BTreeMap<Window, WindowCoverage>,
}

impl Coverage {
    pub fn is_valid(&self, window: Window) -> bool {
        self.windows.get(&window).map(|c| c.valid).unwrap_or(false)
    }

    pub fn invalid_windows(&self) -> Vec<Window> {
        self.windows
            .iter()
            .filter(|(_, c)| !c.valid)
            .map(|(w, _)| *w)
            .collect()
    }
}

/// A window metric computed from cached history rather than supplied by the feed
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedChange {
    pub key: String,
    pub window: Window,
    pub value: f64,
    pub gap_secs: i64,
}

/// `(current − floor) / floor`, or `None` when undefined
pub fn fractional_change(current: f64, floor: f64) -> Option<f64> {
    if floor == 0.0 || !floor.is_finite() || !current.is_finite() {
        return None;
    }
    let change = (current - floor) / floor;
    change.is_finite().then_some(change)
}

pub struct TemporalCache {
    config: CacheConfig,
    series: DashMap<String, Series>,
}

impl TemporalCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            series: DashMap::new(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn tolerance(&self, window: Window) -> Duration {
        Duration::seconds(self.config.tolerance_secs.get(window))
    }

    fn series_for(&self, symbol: &str) -> Option<Series> {
        self.series.get(symbol).map(|entry| Arc::clone(entry.value()))
    }

    /// Append a sample. Equal timestamps are accepted; earlier ones are not.
    pub fn store(&self, symbol: &str, sample: Sample, timestamp: DateTime<Utc>) -> Result<(), CacheError> {
        if sample.symbol != symbol {
            return Err(CacheError::SymbolMismatch {
                symbol: symbol.to_string(),
                sample_symbol: sample.symbol,
            });
        }

        let series = Arc::clone(
            self.series
                .entry(symbol.to_string())
                .or_insert_with(|| Arc::new(RwLock::new(VecDeque::new())))
                .value(),
        );

        let mut samples = series.write();
        if let Some(latest) = samples.back() {
            if timestamp < latest.timestamp {
                warn!(symbol = %symbol, latest = %latest.timestamp, received = %timestamp, "Out-of-order sample rejected");
                return Err(CacheError::OutOfOrder {
                    symbol: symbol.to_string(),
                    latest: latest.timestamp,
                    received: timestamp,
                });
            }
        }

        let mut sample = sample;
        sample.timestamp = timestamp;
        samples.push_back(sample);

        let cutoff = timestamp - Duration::seconds(self.config.retention_secs);
        let mut evicted = 0usize;
        while samples.front().map(|s| s.timestamp < cutoff).unwrap_or(false) {
            samples.pop_front();
            evicted += 1;
        }
        while samples.len() > self.config.max_samples_per_symbol {
            samples.pop_front();
            evicted += 1;
        }
        if evicted > 0 {
            debug!(symbol = %symbol, evicted, retained = samples.len(), "Evicted cached samples");
        }
        Ok(())
    }

    /// Most recent sample with `timestamp <= target`, within `tolerance`
    pub fn lookup_floor(
        &self,
        symbol: &str,
        target: DateTime<Utc>,
        tolerance: Duration,
    ) -> Result<FloorHit, LookupMiss> {
        let series = self.series_for(symbol).ok_or(LookupMiss::UnknownSymbol)?;
        let samples = series.read();

        let idx = samples.partition_point(|s| s.timestamp <= target);
        if idx == 0 {
            return Err(LookupMiss::NoSampleBefore { target });
        }
        let floor = &samples[idx - 1];
        let gap = target - floor.timestamp;
        if gap > tolerance {
            return Err(LookupMiss::GapExceeded {
                gap_secs: gap.num_seconds(),
                tolerance_secs: tolerance.num_seconds(),
            });
        }
        Ok(FloorHit {
            sample: floor.clone(),
            gap_secs: gap.num_seconds(),
        })
    }

    /// Floor lookup for `at − window` with that window's tolerance
    pub fn lookup_window(&self, symbol: &str, at: DateTime<Utc>, window: Window) -> Result<FloorHit, LookupMiss> {
        self.lookup_floor(symbol, at - window.duration(), self.tolerance(window))
    }

    /// Run a window lookup for every supported window
    pub fn coverage(&self, symbol: &str, at: DateTime<Utc>) -> Coverage {
        let windows = Window::ALL
            .iter()
            .map(|window| {
                let coverage = match self.lookup_window(symbol, at, *window) {
                    Ok(hit) => WindowCoverage {
                        gap_secs: Some(hit.gap_secs),
                        valid: true,
                    },
                    Err(LookupMiss::GapExceeded { gap_secs, .. }) => WindowCoverage {
                        gap_secs: Some(gap_secs),
                        valid: false,
                    },
                    Err(_) => WindowCoverage {
                        gap_secs: None,
                        valid: false,
                    },
                };
                (*window, coverage)
            })
            .collect();

        Coverage {
            symbol: symbol.to_string(),
            at,
            windows,
        }
    }

    /// Price and OI window changes the sample does not carry itself but the
    /// cache can supply. Windows without a valid floor are left absent.
    pub fn derive_window_changes(&self, sample: &Sample) -> Vec<DerivedChange> {
        let mut derived = Vec::new();
        for window in Window::ALL {
            let wanted = [
                (Metric::PriceChange, sample.price),
                (Metric::OiChange, sample.open_interest),
            ];
            let missing: Vec<(Metric, f64)> = wanted
                .into_iter()
                .filter(|(metric, _)| sample.metric(*metric, window).is_none())
                .filter_map(|(metric, current)| current.map(|value| (metric, value)))
                .collect();
            if missing.is_empty() {
                continue;
            }

            let hit = match self.lookup_window(&sample.symbol, sample.timestamp, window) {
                Ok(hit) => hit,
                Err(miss) => {
                    debug!(symbol = %sample.symbol, window = %window, reason = %miss, "No floor for derived change");
                    continue;
                }
            };

            for (metric, current) in missing {
                let floor = match metric {
                    Metric::PriceChange => hit.sample.price,
                    Metric::OiChange => hit.sample.open_interest,
                    Metric::Imbalance => None,
                };
                if let Some(value) = floor.and_then(|floor| fractional_change(current, floor)) {
                    derived.push(DerivedChange {
                        key: metric.key(window),
                        window,
                        value,
                        gap_secs: hit.gap_secs,
                    });
                }
            }
        }
        derived
    }

    /// Mean cached volume over `[at − volume_window, at)`
    pub fn trailing_avg_volume(&self, symbol: &str, at: DateTime<Utc>) -> Option<f64> {
        let series = self.series_for(symbol)?;
        let samples = series.read();
        let start = at - Duration::seconds(self.config.volume_window_secs);

        let from = samples.partition_point(|s| s.timestamp < start);
        let to = samples.partition_point(|s| s.timestamp < at);
        let volumes: Vec<f64> = samples
            .range(from..to)
            .filter_map(|s| s.volume)
            .filter(|v| v.is_finite())
            .collect();
        if volumes.is_empty() {
            return None;
        }
        let mean = volumes.iter().mean();
        mean.is_finite().then_some(mean)
    }

    pub fn latest_timestamp(&self, symbol: &str) -> Option<DateTime<Utc>> {
        let series = self.series_for(symbol)?;
        let samples = series.read();
        samples.back().map(|s| s.timestamp)
    }

    pub fn symbol_count(&self) -> usize {
        self.series.len()
    }

    /// Number of samples held for `symbol`
    pub fn len(&self, symbol: &str) -> usize {
        self.series_for(symbol).map(|s| s.read().len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }
}

impl Default for TemporalCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}
