//! Engine configuration.
//!
//! Loading is two-step: TOML (plus `ADVISOR__*` environment overrides) is
//! deserialized into [`RawEngineConfig`], whose level and tag fields are plain
//! strings, then [`EngineConfig::from_raw`] parses those strings into closed
//! variants and checks every startup invariant. Any failure is fatal.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use tracing::info;

use crate::advisory::ReconciliationPolicy;
use crate::levels::{ConfidenceLevel, Executability, ParseLevelError};
use crate::sample::Window;
use crate::tags::{ExecutabilityTable, ReasonTag};
use crate::view::HorizonWindows;

/// Startup configuration errors. Always fatal.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("{name} = {value} looks scaled by 100; percentage thresholds must be fractional (0.015 = 1.5%)")]
    ScaledPercentage { name: String, value: f64 },

    #[error("{name} = {value} is invalid: {reason}")]
    InvalidThreshold {
        name: String,
        value: f64,
        reason: &'static str,
    },

    #[error("{section}: {source}")]
    UnknownName {
        section: &'static str,
        #[source]
        source: ParseLevelError,
    },

    #[error("score thresholds must ascend: medium {medium} < high {high} < ultra {ultra}")]
    ThresholdsNotAscending { medium: u8, high: u8, ultra: u8 },

    #[error("score weight {name} = {value} exceeds its maximum {max}")]
    ScoreWeightOutOfRange { name: &'static str, value: u8, max: u8 },

    #[error("reduced threshold {reduced} exceeds cap {cap} from {origin}; the reduced path could never execute")]
    ReducedAboveCap {
        reduced: ConfidenceLevel,
        cap: ConfidenceLevel,
        origin: String,
    },

    #[error("{origin} = LOW would pin directional advisories at LOW confidence")]
    CapAtLowest { origin: String },

    #[error("reduced threshold {reduced} exceeds normal threshold {normal}")]
    ReducedAboveNormal {
        reduced: ConfidenceLevel,
        normal: ConfidenceLevel,
    },

    #[error("flip cooldown {flip_cooldown_secs}s must not be shorter than the minimum interval {min_interval_secs}s")]
    FlipCooldownTooShort {
        min_interval_secs: i64,
        flip_cooldown_secs: i64,
    },

    #[error("degraded slow-window evaluation must be capped below {top}; effective cap is {effective}")]
    DegradedPathUncapped {
        top: ConfidenceLevel,
        effective: String,
    },

    #[error("horizon {horizon}: fast window {fast} must be shorter than slow window {slow}")]
    InvalidHorizonWindows {
        horizon: &'static str,
        fast: Window,
        slow: Window,
    },

    #[error("cache: {0}")]
    InvalidCache(String),
}

/// One value per supported window
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerWindow<T> {
    #[serde(rename = "5m")]
    pub m5: T,
    #[serde(rename = "15m")]
    pub m15: T,
    #[serde(rename = "1h")]
    pub h1: T,
    #[serde(rename = "6h")]
    pub h6: T,
}

impl<T: Copy> PerWindow<T> {
    pub fn get(&self, window: Window) -> T {
        match window {
            Window::M5 => self.m5,
            Window::M15 => self.m15,
            Window::H1 => self.h1,
            Window::H6 => self.h6,
        }
    }

    pub fn entries(&self) -> [(Window, T); 4] {
        [
            (Window::M5, self.m5),
            (Window::M15, self.m15),
            (Window::H1, self.h1),
            (Window::H6, self.h6),
        ]
    }
}

/// Temporal cache sizing and lookup tolerances
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Samples older than newest − retention are evicted
    #[serde(default = "default_retention_secs")]
    pub retention_secs: i64,

    /// Hard per-symbol bound on stored samples
    #[serde(default = "default_max_samples")]
    pub max_samples_per_symbol: usize,

    /// Maximum gap between a lookup target and the returned sample
    #[serde(default = "default_tolerance_secs")]
    pub tolerance_secs: PerWindow<i64>,

    /// Lookback used for the trailing average volume
    #[serde(default = "default_volume_window_secs")]
    pub volume_window_secs: i64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            retention_secs: default_retention_secs(),
            max_samples_per_symbol: default_max_samples(),
            tolerance_secs: default_tolerance_secs(),
            volume_window_secs: default_volume_window_secs(),
        }
    }
}

fn default_retention_secs() -> i64 {
    7 * 3_600
}

fn default_max_samples() -> usize {
    20_000
}

fn default_tolerance_secs() -> PerWindow<i64> {
    PerWindow {
        m5: 90,
        m15: 180,
        h1: 600,
        h6: 1_800,
    }
}

fn default_volume_window_secs() -> i64 {
    3_600
}

/// What the normalizer does when a sample carries no format tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingFormatPolicy {
    /// Assume scaled-by-100 and record a warning
    AssumeScaled,
    /// Reject the sample
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizerConfig {
    #[serde(default = "default_missing_format")]
    pub missing_format: MissingFormatPolicy,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            missing_format: default_missing_format(),
        }
    }
}

fn default_missing_format() -> MissingFormatPolicy {
    MissingFormatPolicy::AssumeScaled
}

/// Regime classification thresholds (fractional moves)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeConfig {
    /// |fast-window price change| at or above this is EXTREME
    #[serde(default = "default_extreme_move")]
    pub extreme_move: PerWindow<f64>,

    /// |trend-window price change| at or above this is TREND
    #[serde(default = "default_trend_move")]
    pub trend_move: PerWindow<f64>,
}

impl Default for RegimeConfig {
    fn default() -> Self {
        Self {
            extreme_move: default_extreme_move(),
            trend_move: default_trend_move(),
        }
    }
}

fn default_extreme_move() -> PerWindow<f64> {
    PerWindow {
        m5: 0.03,
        m15: 0.045,
        h1: 0.08,
        h6: 0.15,
    }
}

fn default_trend_move() -> PerWindow<f64> {
    PerWindow {
        m5: 0.004,
        m15: 0.008,
        h1: 0.015,
        h6: 0.03,
    }
}

/// Systemic risk veto thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// |fast price change| counted as a large move
    #[serde(default = "default_liquidation_price_move")]
    pub liquidation_price_move: f64,

    /// Fast OI contraction (positive number) that marks forced unwinds
    #[serde(default = "default_liquidation_oi_drop")]
    pub liquidation_oi_drop: f64,

    /// |funding rate| counted as extreme
    #[serde(default = "default_crowding_funding_rate")]
    pub crowding_funding_rate: f64,

    /// Trend-window OI growth that, with extreme funding, marks crowding
    #[serde(default = "default_crowding_oi_growth")]
    pub crowding_oi_growth: f64,

    /// Volume at or above this multiple of its trailing average is abnormal
    #[serde(default = "default_abnormal_volume_multiple")]
    pub abnormal_volume_multiple: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            liquidation_price_move: default_liquidation_price_move(),
            liquidation_oi_drop: default_liquidation_oi_drop(),
            crowding_funding_rate: default_crowding_funding_rate(),
            crowding_oi_growth: default_crowding_oi_growth(),
            abnormal_volume_multiple: default_abnormal_volume_multiple(),
        }
    }
}

fn default_liquidation_price_move() -> f64 {
    0.02
}

fn default_liquidation_oi_drop() -> f64 {
    0.03
}

fn default_crowding_funding_rate() -> f64 {
    0.001
}

fn default_crowding_oi_growth() -> f64 {
    0.08
}

fn default_abnormal_volume_multiple() -> f64 {
    5.0
}

/// Opportunity quality thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityConfig {
    /// |fast imbalance| considered one-sided
    #[serde(default = "default_absorption_imbalance")]
    pub absorption_imbalance: f64,

    /// Volume ratio at or below this, with one-sided flow, is absorption
    #[serde(default = "default_absorption_volume_ratio")]
    pub absorption_volume_ratio: f64,

    /// Trend-window price move that must not diverge from OI
    #[serde(default = "default_divergence_price_move")]
    pub divergence_price_move: f64,

    /// Opposite-signed OI move counted as divergence
    #[serde(default = "default_divergence_oi_move")]
    pub divergence_oi_move: f64,

    /// |funding| above this (but below crowding) is noise
    #[serde(default = "default_funding_noise_rate")]
    pub funding_noise_rate: f64,

    /// RANGE with |fast imbalance| below this is a weak signal
    #[serde(default = "default_weak_range_imbalance")]
    pub weak_range_imbalance: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            absorption_imbalance: default_absorption_imbalance(),
            absorption_volume_ratio: default_absorption_volume_ratio(),
            divergence_price_move: default_divergence_price_move(),
            divergence_oi_move: default_divergence_oi_move(),
            funding_noise_rate: default_funding_noise_rate(),
            weak_range_imbalance: default_weak_range_imbalance(),
        }
    }
}

fn default_absorption_imbalance() -> f64 {
    0.6
}

fn default_absorption_volume_ratio() -> f64 {
    0.5
}

fn default_divergence_price_move() -> f64 {
    0.005
}

fn default_divergence_oi_move() -> f64 {
    0.02
}

fn default_funding_noise_rate() -> f64 {
    0.0005
}

fn default_weak_range_imbalance() -> f64 {
    0.2
}

/// Direction (long/short) condition thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectionConfig {
    #[serde(default = "default_trend_oi_growth")]
    pub trend_oi_growth: f64,

    #[serde(default = "default_trend_imbalance")]
    pub trend_imbalance: f64,

    #[serde(default = "default_range_strong_imbalance")]
    pub range_strong_imbalance: f64,

    #[serde(default = "default_range_oi_growth")]
    pub range_oi_growth: f64,

    #[serde(default = "default_range_min_move")]
    pub range_min_move: f64,

    #[serde(default = "default_range_min_imbalance")]
    pub range_min_imbalance: f64,

    /// N in the N-of-M range confluence rule
    #[serde(default = "default_range_min_confirmations")]
    pub range_min_confirmations: usize,
}

impl Default for DirectionConfig {
    fn default() -> Self {
        Self {
            trend_oi_growth: default_trend_oi_growth(),
            trend_imbalance: default_trend_imbalance(),
            range_strong_imbalance: default_range_strong_imbalance(),
            range_oi_growth: default_range_oi_growth(),
            range_min_move: default_range_min_move(),
            range_min_imbalance: default_range_min_imbalance(),
            range_min_confirmations: default_range_min_confirmations(),
        }
    }
}

fn default_trend_oi_growth() -> f64 {
    0.005
}

fn default_trend_imbalance() -> f64 {
    0.15
}

fn default_range_strong_imbalance() -> f64 {
    0.5
}

fn default_range_oi_growth() -> f64 {
    0.01
}

fn default_range_min_move() -> f64 {
    0.002
}

fn default_range_min_imbalance() -> f64 {
    0.2
}

fn default_range_min_confirmations() -> usize {
    3
}

/// Score contributions. Ranges: regime 0–3, quality 0–2, active 0–1, strong 0–2.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub trend: u8,
    pub range: u8,
    pub extreme: u8,
    pub good: u8,
    pub uncertain: u8,
    pub poor: u8,
    pub active: u8,
    pub strong_signal: u8,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            trend: 3,
            range: 1,
            extreme: 0,
            good: 2,
            uncertain: 1,
            poor: 0,
            active: 1,
            strong_signal: 2,
        }
    }
}

/// Minimum score for each level above LOW
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreThresholds {
    pub medium: u8,
    pub high: u8,
    pub ultra: u8,
}

impl Default for ScoreThresholds {
    fn default() -> Self {
        Self {
            medium: 3,
            high: 5,
            ultra: 7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTagCap {
    pub tag: String,
    pub cap: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawExecutabilityOverride {
    pub tag: String,
    pub level: String,
}

/// Confidence section as written in the file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawConfidenceConfig {
    #[serde(default)]
    pub weights: ScoreWeights,

    #[serde(default)]
    pub thresholds: ScoreThresholds,

    /// Minimum confidence to execute under ALLOW
    #[serde(default = "default_normal_min")]
    pub normal_min: String,

    /// Minimum confidence to execute under ALLOW_REDUCED
    #[serde(default = "default_reduced_min")]
    pub reduced_min: String,

    /// Cap applied when quality is UNCERTAIN
    #[serde(default = "default_uncertain_cap")]
    pub uncertain_cap: String,

    /// Cap for DEGRADE tags without a tag cap; falls back to `uncertain_cap`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_cap: Option<String>,

    #[serde(default = "default_tag_caps")]
    pub tag_caps: Vec<RawTagCap>,

    #[serde(default = "default_strong_signal_tags")]
    pub strong_signal_tags: Vec<String>,

    #[serde(default = "default_boost_strong_signal")]
    pub boost_strong_signal: bool,

    /// Volume ratio at or above which the market counts as active
    #[serde(default = "default_active_volume_ratio")]
    pub active_volume_ratio: f64,
}

impl Default for RawConfidenceConfig {
    fn default() -> Self {
        Self {
            weights: ScoreWeights::default(),
            thresholds: ScoreThresholds::default(),
            normal_min: default_normal_min(),
            reduced_min: default_reduced_min(),
            uncertain_cap: default_uncertain_cap(),
            default_cap: None,
            tag_caps: default_tag_caps(),
            strong_signal_tags: default_strong_signal_tags(),
            boost_strong_signal: default_boost_strong_signal(),
            active_volume_ratio: default_active_volume_ratio(),
        }
    }
}

fn default_normal_min() -> String {
    "HIGH".to_string()
}

fn default_reduced_min() -> String {
    "MEDIUM".to_string()
}

fn default_uncertain_cap() -> String {
    "MEDIUM".to_string()
}

fn default_tag_caps() -> Vec<RawTagCap> {
    vec![RawTagCap {
        tag: "SLOW_WINDOW_DEGRADED".to_string(),
        cap: "HIGH".to_string(),
    }]
}

fn default_strong_signal_tags() -> Vec<String> {
    vec![
        "LONG_TREND_CONFIRMED".to_string(),
        "SHORT_TREND_CONFIRMED".to_string(),
    ]
}

fn default_boost_strong_signal() -> bool {
    true
}

fn default_active_volume_ratio() -> f64 {
    1.2
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawExecutabilityConfig {
    #[serde(default)]
    pub overrides: Vec<RawExecutabilityOverride>,
}

/// Debounce intervals
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrequencyConfig {
    /// Any directional repeat inside this interval is suppressed
    #[serde(default = "default_min_interval_secs")]
    pub min_interval_secs: i64,

    /// A direction reversal inside this interval is suppressed
    #[serde(default = "default_flip_cooldown_secs")]
    pub flip_cooldown_secs: i64,
}

impl Default for FrequencyConfig {
    fn default() -> Self {
        Self {
            min_interval_secs: default_min_interval_secs(),
            flip_cooldown_secs: default_flip_cooldown_secs(),
        }
    }
}

fn default_min_interval_secs() -> i64 {
    300
}

fn default_flip_cooldown_secs() -> i64 {
    900
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawHorizonWindows {
    pub fast: String,
    pub slow: String,
}

impl RawHorizonWindows {
    fn new(fast: Window, slow: Window) -> Self {
        Self {
            fast: fast.suffix().to_string(),
            slow: slow.suffix().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawHorizonsConfig {
    #[serde(default = "default_standard_windows")]
    pub standard: RawHorizonWindows,

    #[serde(default = "default_short_windows")]
    pub short: RawHorizonWindows,

    #[serde(default = "default_medium_windows")]
    pub medium: RawHorizonWindows,

    #[serde(default = "default_policy")]
    pub reconciliation: String,
}

impl Default for RawHorizonsConfig {
    fn default() -> Self {
        Self {
            standard: default_standard_windows(),
            short: default_short_windows(),
            medium: default_medium_windows(),
            reconciliation: default_policy(),
        }
    }
}

fn default_standard_windows() -> RawHorizonWindows {
    RawHorizonWindows::new(Window::M15, Window::H1)
}

fn default_short_windows() -> RawHorizonWindows {
    RawHorizonWindows::new(Window::M5, Window::M15)
}

fn default_medium_windows() -> RawHorizonWindows {
    RawHorizonWindows::new(Window::H1, Window::H6)
}

fn default_policy() -> String {
    ReconciliationPolicy::NoTradeOnConflict.as_str().to_string()
}

/// Configuration exactly as read from TOML / environment
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawEngineConfig {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub normalizer: NormalizerConfig,
    #[serde(default)]
    pub regime: RegimeConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub quality: QualityConfig,
    #[serde(default)]
    pub direction: DirectionConfig,
    #[serde(default)]
    pub confidence: RawConfidenceConfig,
    #[serde(default)]
    pub executability: RawExecutabilityConfig,
    #[serde(default)]
    pub frequency: FrequencyConfig,
    #[serde(default)]
    pub horizons: RawHorizonsConfig,
}

impl RawEngineConfig {
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let raw: RawEngineConfig = toml::from_str(content).context("Failed to parse engine configuration")?;
        Ok(raw)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Typed confidence scoring configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ConfidenceConfig {
    pub weights: ScoreWeights,
    pub thresholds: ScoreThresholds,
    pub normal_min: ConfidenceLevel,
    pub reduced_min: ConfidenceLevel,
    pub uncertain_cap: ConfidenceLevel,
    pub default_cap: Option<ConfidenceLevel>,
    pub tag_caps: HashMap<ReasonTag, ConfidenceLevel>,
    pub strong_signal_tags: Vec<ReasonTag>,
    pub boost_strong_signal: bool,
    pub active_volume_ratio: f64,
}

impl ConfidenceConfig {
    /// Cap contributed by a present tag: its own cap, else for DEGRADE tags
    /// the default cap, falling back to the uncertain cap.
    pub fn cap_for(&self, tag: ReasonTag, level: Executability) -> Option<ConfidenceLevel> {
        if let Some(cap) = self.tag_caps.get(&tag) {
            return Some(*cap);
        }
        match level {
            Executability::Degrade => Some(self.default_cap.unwrap_or(self.uncertain_cap)),
            _ => None,
        }
    }

    pub fn is_strong_signal(&self, tag: ReasonTag) -> bool {
        self.strong_signal_tags.contains(&tag)
    }
}

/// Fast/slow windows for each horizon
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HorizonsConfig {
    pub standard: HorizonWindows,
    pub short: HorizonWindows,
    pub medium: HorizonWindows,
}

/// Validated engine configuration; only constructed through [`EngineConfig::from_raw`]
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub cache: CacheConfig,
    pub missing_format: MissingFormatPolicy,
    pub regime: RegimeConfig,
    pub risk: RiskConfig,
    pub quality: QualityConfig,
    pub direction: DirectionConfig,
    pub confidence: ConfidenceConfig,
    pub executability: ExecutabilityTable,
    pub frequency: FrequencyConfig,
    pub horizons: HorizonsConfig,
    pub reconciliation: ReconciliationPolicy,
}

impl EngineConfig {
    pub fn from_raw(raw: RawEngineConfig) -> Result<Self, ConfigError> {
        validate_cache(&raw.cache)?;
        validate_thresholds(&raw)?;

        let executability = parse_executability(&raw.executability)?;
        let confidence = parse_confidence(&raw.confidence)?;
        validate_confidence(&confidence, &executability)?;

        let frequency = raw.frequency;
        if frequency.min_interval_secs < 0 {
            return Err(ConfigError::InvalidThreshold {
                name: "frequency.min_interval_secs".to_string(),
                value: frequency.min_interval_secs as f64,
                reason: "must not be negative",
            });
        }
        if frequency.flip_cooldown_secs < frequency.min_interval_secs {
            return Err(ConfigError::FlipCooldownTooShort {
                min_interval_secs: frequency.min_interval_secs,
                flip_cooldown_secs: frequency.flip_cooldown_secs,
            });
        }

        let horizons = HorizonsConfig {
            standard: parse_windows("standard", &raw.horizons.standard)?,
            short: parse_windows("short", &raw.horizons.short)?,
            medium: parse_windows("medium", &raw.horizons.medium)?,
        };
        let reconciliation = raw
            .horizons
            .reconciliation
            .parse::<ReconciliationPolicy>()
            .map_err(|source| ConfigError::UnknownName {
                section: "horizons.reconciliation",
                source,
            })?;

        Ok(Self {
            cache: raw.cache,
            missing_format: raw.normalizer.missing_format,
            regime: raw.regime,
            risk: raw.risk,
            quality: raw.quality,
            direction: raw.direction,
            confidence,
            executability,
            frequency,
            horizons,
            reconciliation,
        })
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_raw(RawEngineConfig::default()).expect("built-in engine defaults must validate")
    }
}

fn validate_cache(cache: &CacheConfig) -> Result<(), ConfigError> {
    if cache.retention_secs <= 0 {
        return Err(ConfigError::InvalidCache("retention_secs must be positive".to_string()));
    }
    if cache.max_samples_per_symbol == 0 {
        return Err(ConfigError::InvalidCache("max_samples_per_symbol must be positive".to_string()));
    }
    if cache.volume_window_secs <= 0 {
        return Err(ConfigError::InvalidCache("volume_window_secs must be positive".to_string()));
    }
    for (window, tolerance) in cache.tolerance_secs.entries() {
        if tolerance <= 0 {
            return Err(ConfigError::InvalidCache(format!(
                "tolerance for {} must be positive",
                window
            )));
        }
    }
    let tolerances = cache.tolerance_secs.entries();
    if tolerances.windows(2).any(|pair| pair[0].1 > pair[1].1) {
        return Err(ConfigError::InvalidCache(
            "tolerances must not loosen for smaller windows".to_string(),
        ));
    }
    if cache.retention_secs < Window::H6.seconds() {
        return Err(ConfigError::InvalidCache(
            "retention_secs must cover the 6h window".to_string(),
        ));
    }
    Ok(())
}

fn check_percentage(name: &str, value: f64) -> Result<(), ConfigError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(ConfigError::InvalidThreshold {
            name: name.to_string(),
            value,
            reason: "must be a positive finite fraction",
        });
    }
    if value > 1.0 {
        return Err(ConfigError::ScaledPercentage {
            name: name.to_string(),
            value,
        });
    }
    Ok(())
}

fn check_unit_interval(name: &str, value: f64) -> Result<(), ConfigError> {
    if !value.is_finite() || value <= 0.0 || value > 1.0 {
        return Err(ConfigError::InvalidThreshold {
            name: name.to_string(),
            value,
            reason: "must lie in (0, 1]",
        });
    }
    Ok(())
}

fn check_positive(name: &str, value: f64) -> Result<(), ConfigError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(ConfigError::InvalidThreshold {
            name: name.to_string(),
            value,
            reason: "must be positive",
        });
    }
    Ok(())
}

fn validate_thresholds(raw: &RawEngineConfig) -> Result<(), ConfigError> {
    for (window, value) in raw.regime.extreme_move.entries() {
        check_percentage(&format!("regime.extreme_move.{}", window), value)?;
    }
    for (window, value) in raw.regime.trend_move.entries() {
        check_percentage(&format!("regime.trend_move.{}", window), value)?;
        if value >= raw.regime.extreme_move.get(window) {
            return Err(ConfigError::InvalidThreshold {
                name: format!("regime.trend_move.{}", window),
                value,
                reason: "must be below the extreme move for the same window",
            });
        }
    }

    let risk = &raw.risk;
    check_percentage("risk.liquidation_price_move", risk.liquidation_price_move)?;
    check_percentage("risk.liquidation_oi_drop", risk.liquidation_oi_drop)?;
    check_percentage("risk.crowding_funding_rate", risk.crowding_funding_rate)?;
    check_percentage("risk.crowding_oi_growth", risk.crowding_oi_growth)?;
    check_positive("risk.abnormal_volume_multiple", risk.abnormal_volume_multiple)?;

    let quality = &raw.quality;
    check_unit_interval("quality.absorption_imbalance", quality.absorption_imbalance)?;
    check_positive("quality.absorption_volume_ratio", quality.absorption_volume_ratio)?;
    check_percentage("quality.divergence_price_move", quality.divergence_price_move)?;
    check_percentage("quality.divergence_oi_move", quality.divergence_oi_move)?;
    check_percentage("quality.funding_noise_rate", quality.funding_noise_rate)?;
    check_unit_interval("quality.weak_range_imbalance", quality.weak_range_imbalance)?;
    if quality.funding_noise_rate >= risk.crowding_funding_rate {
        return Err(ConfigError::InvalidThreshold {
            name: "quality.funding_noise_rate".to_string(),
            value: quality.funding_noise_rate,
            reason: "must be below risk.crowding_funding_rate",
        });
    }

    let direction = &raw.direction;
    check_percentage("direction.trend_oi_growth", direction.trend_oi_growth)?;
    check_unit_interval("direction.trend_imbalance", direction.trend_imbalance)?;
    check_unit_interval("direction.range_strong_imbalance", direction.range_strong_imbalance)?;
    check_percentage("direction.range_oi_growth", direction.range_oi_growth)?;
    check_percentage("direction.range_min_move", direction.range_min_move)?;
    check_unit_interval("direction.range_min_imbalance", direction.range_min_imbalance)?;
    if direction.range_min_confirmations == 0 || direction.range_min_confirmations > 4 {
        return Err(ConfigError::InvalidThreshold {
            name: "direction.range_min_confirmations".to_string(),
            value: direction.range_min_confirmations as f64,
            reason: "must be between 1 and 4",
        });
    }

    check_positive("confidence.active_volume_ratio", raw.confidence.active_volume_ratio)?;
    Ok(())
}

fn parse_level(section: &'static str, value: &str) -> Result<ConfidenceLevel, ConfigError> {
    value
        .parse::<ConfidenceLevel>()
        .map_err(|source| ConfigError::UnknownName { section, source })
}

fn parse_tag(section: &'static str, value: &str) -> Result<ReasonTag, ConfigError> {
    value
        .parse::<ReasonTag>()
        .map_err(|source| ConfigError::UnknownName { section, source })
}

fn parse_executability(raw: &RawExecutabilityConfig) -> Result<ExecutabilityTable, ConfigError> {
    let mut overrides = HashMap::new();
    for entry in &raw.overrides {
        let tag = parse_tag("executability.overrides", &entry.tag)?;
        let level = entry
            .level
            .parse::<Executability>()
            .map_err(|source| ConfigError::UnknownName {
                section: "executability.overrides",
                source,
            })?;
        overrides.insert(tag, level);
    }
    Ok(ExecutabilityTable::with_overrides(&overrides))
}

fn parse_confidence(raw: &RawConfidenceConfig) -> Result<ConfidenceConfig, ConfigError> {
    let mut tag_caps = HashMap::new();
    for entry in &raw.tag_caps {
        let tag = parse_tag("confidence.tag_caps", &entry.tag)?;
        let cap = parse_level("confidence.tag_caps", &entry.cap)?;
        tag_caps.insert(tag, cap);
    }

    let strong_signal_tags = raw
        .strong_signal_tags
        .iter()
        .map(|name| parse_tag("confidence.strong_signal_tags", name))
        .collect::<Result<Vec<_>, _>>()?;

    let default_cap = raw
        .default_cap
        .as_deref()
        .map(|value| parse_level("confidence.default_cap", value))
        .transpose()?;

    Ok(ConfidenceConfig {
        weights: raw.weights.clone(),
        thresholds: raw.thresholds.clone(),
        normal_min: parse_level("confidence.normal_min", &raw.normal_min)?,
        reduced_min: parse_level("confidence.reduced_min", &raw.reduced_min)?,
        uncertain_cap: parse_level("confidence.uncertain_cap", &raw.uncertain_cap)?,
        default_cap,
        tag_caps,
        strong_signal_tags,
        boost_strong_signal: raw.boost_strong_signal,
        active_volume_ratio: raw.active_volume_ratio,
    })
}

fn validate_confidence(
    confidence: &ConfidenceConfig,
    executability: &ExecutabilityTable,
) -> Result<(), ConfigError> {
    let weights = &confidence.weights;
    let bounded = [
        ("trend", weights.trend, 3),
        ("range", weights.range, 3),
        ("extreme", weights.extreme, 3),
        ("good", weights.good, 2),
        ("uncertain", weights.uncertain, 2),
        ("poor", weights.poor, 2),
        ("active", weights.active, 1),
        ("strong_signal", weights.strong_signal, 2),
    ];
    for (name, value, max) in bounded {
        if value > max {
            return Err(ConfigError::ScoreWeightOutOfRange { name, value, max });
        }
    }

    let thresholds = &confidence.thresholds;
    if !(thresholds.medium < thresholds.high && thresholds.high < thresholds.ultra) {
        return Err(ConfigError::ThresholdsNotAscending {
            medium: thresholds.medium,
            high: thresholds.high,
            ultra: thresholds.ultra,
        });
    }

    let reduced = confidence.reduced_min;
    if reduced > confidence.normal_min {
        return Err(ConfigError::ReducedAboveNormal {
            reduced,
            normal: confidence.normal_min,
        });
    }

    let mut caps: Vec<(ConfidenceLevel, String)> = confidence
        .tag_caps
        .iter()
        .map(|(tag, cap)| (*cap, format!("tag cap {}", tag)))
        .collect();
    caps.push((confidence.uncertain_cap, "uncertain_cap".to_string()));
    if let Some(cap) = confidence.default_cap {
        caps.push((cap, "default_cap".to_string()));
    }
    for (cap, origin) in caps {
        if cap == ConfidenceLevel::Low {
            return Err(ConfigError::CapAtLowest { origin });
        }
        if reduced > cap {
            return Err(ConfigError::ReducedAboveCap { reduced, cap, origin });
        }
    }

    let degraded = ReasonTag::SlowWindowDegraded;
    match confidence.cap_for(degraded, executability.level(degraded)) {
        Some(cap) if cap < ConfidenceLevel::TOP => Ok(()),
        effective => Err(ConfigError::DegradedPathUncapped {
            top: ConfidenceLevel::TOP,
            effective: effective
                .map(|cap| cap.to_string())
                .unwrap_or_else(|| "none".to_string()),
        }),
    }
}

fn parse_windows(horizon: &'static str, raw: &RawHorizonWindows) -> Result<HorizonWindows, ConfigError> {
    let fast = raw
        .fast
        .parse::<Window>()
        .map_err(|source| ConfigError::UnknownName { section: "horizons", source })?;
    let slow = raw
        .slow
        .parse::<Window>()
        .map_err(|source| ConfigError::UnknownName { section: "horizons", source })?;
    if fast >= slow {
        return Err(ConfigError::InvalidHorizonWindows { horizon, fast, slow });
    }
    Ok(HorizonWindows { fast, slow })
}

/// Load and validate configuration from a TOML file, with `ADVISOR__*`
/// environment overrides (e.g. `ADVISOR__FREQUENCY__MIN_INTERVAL_SECS=600`)
pub fn load_config(path: impl AsRef<Path>) -> anyhow::Result<EngineConfig> {
    let path = path.as_ref();
    let raw: RawEngineConfig = config::Config::builder()
        .add_source(config::File::from(path).format(config::FileFormat::Toml))
        .add_source(
            config::Environment::with_prefix("ADVISOR")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("Failed to read configuration from {}", path.display()))?
        .try_deserialize()
        .with_context(|| format!("Failed to deserialize configuration from {}", path.display()))?;

    let config = EngineConfig::from_raw(raw)
        .with_context(|| format!("Invalid configuration in {}", path.display()))?;
    info!(path = %path.display(), "Engine configuration loaded");
    Ok(config)
}

/// Write the default configuration as a TOML template
pub fn create_config_template(path: impl AsRef<Path>) -> anyhow::Result<()> {
    let content = RawEngineConfig::default().to_toml_string()?;
    std::fs::write(path.as_ref(), content)
        .with_context(|| format!("Failed to write {}", path.as_ref().display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        let config = EngineConfig::from_raw(RawEngineConfig::default()).unwrap();
        assert_eq!(config.confidence.normal_min, ConfidenceLevel::High);
        assert_eq!(config.confidence.reduced_min, ConfidenceLevel::Medium);
        assert_eq!(config.horizons.medium.slow, Window::H6);
        assert_eq!(config.reconciliation, ReconciliationPolicy::NoTradeOnConflict);
        assert_eq!(
            config.confidence.tag_caps.get(&ReasonTag::SlowWindowDegraded),
            Some(&ConfidenceLevel::High)
        );
    }

    #[test]
    fn test_scaled_percentage_rejected() {
        let mut raw = RawEngineConfig::default();
        raw.risk.liquidation_price_move = 2.0;
        let err = EngineConfig::from_raw(raw).unwrap_err();
        assert!(matches!(err, ConfigError::ScaledPercentage { ref name, .. } if name == "risk.liquidation_price_move"));
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let mut raw = RawEngineConfig::default();
        raw.confidence.tag_caps.push(RawTagCap {
            tag: "FUNDING_NOIZE".to_string(),
            cap: "MEDIUM".to_string(),
        });
        let err = EngineConfig::from_raw(raw).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownName { section: "confidence.tag_caps", .. }));
    }

    #[test]
    fn test_unknown_confidence_level_rejected() {
        let mut raw = RawEngineConfig::default();
        raw.confidence.uncertain_cap = "MID".to_string();
        let err = EngineConfig::from_raw(raw).unwrap_err();
        assert_eq!(
            err.to_string(),
            "confidence.uncertain_cap: unrecognized confidence level 'MID'"
        );
    }

    #[test]
    fn test_reduced_threshold_above_cap_rejected() {
        let mut raw = RawEngineConfig::default();
        raw.confidence.reduced_min = "HIGH".to_string();
        let err = EngineConfig::from_raw(raw).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::ReducedAboveCap {
                reduced: ConfidenceLevel::High,
                cap: ConfidenceLevel::Medium,
                ..
            }
        ));
    }

    #[test]
    fn test_low_caps_rejected() {
        let mut raw = RawEngineConfig::default();
        raw.confidence.reduced_min = "LOW".to_string();
        raw.confidence.uncertain_cap = "LOW".to_string();
        let err = EngineConfig::from_raw(raw).unwrap_err();
        assert!(matches!(err, ConfigError::CapAtLowest { ref origin } if origin == "uncertain_cap"));

        let mut raw = RawEngineConfig::default();
        raw.confidence.reduced_min = "LOW".to_string();
        raw.confidence.tag_caps.push(RawTagCap {
            tag: "FUNDING_NOISE".to_string(),
            cap: "LOW".to_string(),
        });
        assert!(matches!(
            EngineConfig::from_raw(raw).unwrap_err(),
            ConfigError::CapAtLowest { .. }
        ));

        let mut raw = RawEngineConfig::default();
        raw.confidence.reduced_min = "LOW".to_string();
        raw.confidence.default_cap = Some("LOW".to_string());
        assert!(matches!(
            EngineConfig::from_raw(raw).unwrap_err(),
            ConfigError::CapAtLowest { ref origin } if origin == "default_cap"
        ));
    }

    #[test]
    fn test_degraded_path_must_stay_below_top() {
        let mut raw = RawEngineConfig::default();
        raw.confidence.tag_caps = vec![RawTagCap {
            tag: "SLOW_WINDOW_DEGRADED".to_string(),
            cap: "ULTRA".to_string(),
        }];
        let err = EngineConfig::from_raw(raw).unwrap_err();
        assert!(matches!(err, ConfigError::DegradedPathUncapped { .. }));

        // Reclassified as informational with no cap of its own: nothing caps it
        let mut raw = RawEngineConfig::default();
        raw.confidence.tag_caps.clear();
        raw.executability.overrides.push(RawExecutabilityOverride {
            tag: "SLOW_WINDOW_DEGRADED".to_string(),
            level: "ALLOW".to_string(),
        });
        assert!(matches!(
            EngineConfig::from_raw(raw).unwrap_err(),
            ConfigError::DegradedPathUncapped { .. }
        ));
    }

    #[test]
    fn test_flip_cooldown_must_cover_min_interval() {
        let mut raw = RawEngineConfig::default();
        raw.frequency.flip_cooldown_secs = 60;
        assert!(matches!(
            EngineConfig::from_raw(raw).unwrap_err(),
            ConfigError::FlipCooldownTooShort { .. }
        ));
    }

    #[test]
    fn test_cap_resolution_order() {
        let mut raw = RawEngineConfig::default();
        raw.confidence.default_cap = Some("HIGH".to_string());
        let config = EngineConfig::from_raw(raw).unwrap();
        let confidence = &config.confidence;

        // Tag cap beats default cap
        assert_eq!(
            confidence.cap_for(ReasonTag::SlowWindowDegraded, Executability::Degrade),
            Some(ConfidenceLevel::High)
        );
        // DEGRADE tag without its own cap uses the default cap
        assert_eq!(
            confidence.cap_for(ReasonTag::FundingNoise, Executability::Degrade),
            Some(ConfidenceLevel::High)
        );
        // Informational tags are uncapped
        assert_eq!(confidence.cap_for(ReasonTag::ActiveMarket, Executability::Allow), None);

        // Without a default cap, the uncertain cap applies
        let config = EngineConfig::default();
        assert_eq!(
            config.confidence.cap_for(ReasonTag::FundingNoise, Executability::Degrade),
            Some(ConfidenceLevel::Medium)
        );
    }

    #[test]
    fn test_toml_parsing_and_template() {
        let content = r#"
            [frequency]
            min_interval_secs = 120
            flip_cooldown_secs = 600

            [confidence]
            reduced_min = "LOW"
            tag_caps = [{ tag = "SLOW_WINDOW_DEGRADED", cap = "MEDIUM" }]

            [executability]
            overrides = [{ tag = "FUNDING_NOISE", level = "BLOCK" }]

            [horizons]
            reconciliation = "follow_higher_confidence"
        "#;
        let raw = RawEngineConfig::from_toml_str(content).unwrap();
        let config = EngineConfig::from_raw(raw).unwrap();
        assert_eq!(config.frequency.min_interval_secs, 120);
        assert_eq!(config.confidence.reduced_min, ConfidenceLevel::Low);
        assert_eq!(config.executability.level(ReasonTag::FundingNoise), Executability::Block);
        assert_eq!(config.reconciliation, ReconciliationPolicy::FollowHigherConfidence);
        assert_eq!(config.regime.trend_move.get(Window::H1), 0.015);

        let template = RawEngineConfig::default().to_toml_string().unwrap();
        let reparsed = RawEngineConfig::from_toml_str(&template).unwrap();
        assert!(EngineConfig::from_raw(reparsed).is_ok());
    }

    #[test]
    fn test_shipped_example_matches_defaults() {
        let raw = RawEngineConfig::from_toml_str(include_str!("../../config/advisor.example.toml")).unwrap();
        assert_eq!(
            raw.to_toml_string().unwrap(),
            RawEngineConfig::default().to_toml_string().unwrap()
        );
        assert!(EngineConfig::from_raw(raw).is_ok());
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("advisor.toml");
        create_config_template(&path).unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.frequency.flip_cooldown_secs, 900);
        assert_eq!(config.missing_format, MissingFormatPolicy::AssumeScaled);
    }
}
