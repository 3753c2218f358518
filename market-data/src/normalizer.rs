//! Metrics Normalizer
//! Brings every percentage-change field to fractional form and validates
//! plausible ranges, recording what it did in a [`NormalizationTrace`].
//!
//! Percentage fields are recognised by name (`<metric>_change_<window>`), so
//! a feed adding a new window needs no code change here.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use common::config::MissingFormatPolicy;
use common::{PercentFormat, ReasonTag, Sample};

lazy_static! {
    static ref PERCENT_FIELD: Regex =
        Regex::new(r"^(?P<metric>[a-z][a-z0-9]*)_change_(?P<window>\d+[mhd])$").expect("valid percent field pattern");
    static ref IMBALANCE_FIELD: Regex =
        Regex::new(r"^imbalance_(?P<window>\d+[mhd])$").expect("valid imbalance field pattern");
}

/// Any converted magnitude above this (1000%) is a unit error
pub const ANOMALY_LIMIT: f64 = 10.0;

/// |funding rate| above this per period is implausible
pub const FUNDING_RATE_LIMIT: f64 = 0.05;

/// Plausible |value| for a percentage family with no limit of its own
pub const DEFAULT_PERCENT_LIMIT: f64 = 2.0;

/// Plausible |value| for a percentage field family, fractional
fn percent_limit(metric: &str, window: &str) -> f64 {
    match (metric, window) {
        ("price", "5m") => 0.10,
        ("price", "15m") => 0.15,
        ("price", "1h") => 0.20,
        ("price", "6h") => 0.40,
        ("price", _) => 0.50,
        ("oi", "5m") => 0.50,
        ("oi", "15m") => 0.75,
        ("oi", _) => 1.0,
        ("volume", _) => 5.0,
        _ => DEFAULT_PERCENT_LIMIT,
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum NormalizeError {
    #[error("unrecognized percent format '{0}'")]
    UnknownFormat(String),

    #[error("sample declares no percent format")]
    FormatRequired,

    #[error("{field} = {value} is an implausible magnitude (unit confusion?)")]
    UnitAnomaly { field: String, value: f64 },

    #[error("{field} = {value} outside plausible range ±{limit}")]
    OutOfRange { field: String, value: f64, limit: f64 },

    #[error("{field} is not a finite number")]
    NonFinite { field: String },
}

impl NormalizeError {
    pub fn reason_tag(&self) -> ReasonTag {
        match self {
            NormalizeError::UnknownFormat(_) => ReasonTag::UnknownFormatTag,
            NormalizeError::FormatRequired => ReasonTag::FormatRequired,
            NormalizeError::UnitAnomaly { .. } => ReasonTag::UnitAnomaly,
            NormalizeError::OutOfRange { .. } | NormalizeError::NonFinite { .. } => ReasonTag::ValueOutOfRange,
        }
    }
}

/// Audit record of one normalization
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizationTrace {
    /// Format declared by the sample, if any
    pub declared: Option<String>,
    /// Format the values were read as
    pub applied: Option<PercentFormat>,
    /// True when `applied` was assumed rather than declared
    pub assumed: bool,
    pub converted: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<String>,
    pub warnings: Vec<String>,
}

/// Sample in canonical fractional form
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub sample: Sample,
    pub trace: NormalizationTrace,
}

impl Normalized {
    /// Informational tags produced while normalizing
    pub fn tags(&self) -> Vec<ReasonTag> {
        if self.trace.assumed {
            vec![ReasonTag::FormatAssumed]
        } else {
            Vec::new()
        }
    }
}

/// Whole-sample rejection, with the trace up to the failure
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{error}")]
pub struct Rejected {
    pub error: NormalizeError,
    pub trace: NormalizationTrace,
}

pub struct MetricsNormalizer {
    missing_format: MissingFormatPolicy,
}

impl MetricsNormalizer {
    pub fn new(missing_format: MissingFormatPolicy) -> Self {
        Self { missing_format }
    }

    pub fn is_percent_field(name: &str) -> bool {
        PERCENT_FIELD.is_match(name)
    }

    /// Resolve the format the sample's percentages are encoded in
    fn resolve_format(&self, sample: &Sample, trace: &mut NormalizationTrace) -> Result<PercentFormat, NormalizeError> {
        trace.declared = sample.pct_format.clone();
        match sample.pct_format.as_deref() {
            Some(text) => text
                .parse::<PercentFormat>()
                .map_err(|_| NormalizeError::UnknownFormat(text.to_string())),
            None => match self.missing_format {
                MissingFormatPolicy::Reject => Err(NormalizeError::FormatRequired),
                MissingFormatPolicy::AssumeScaled => {
                    trace.assumed = true;
                    trace
                        .warnings
                        .push("no percent format declared; assumed scaled_by_100".to_string());
                    warn!(symbol = %sample.symbol, "Percent format missing, assuming scaled_by_100");
                    Ok(PercentFormat::ScaledBy100)
                }
            },
        }
    }

    pub fn normalize(&self, sample: &Sample) -> Result<Normalized, Rejected> {
        let mut trace = NormalizationTrace::default();
        let format = match self.resolve_format(sample, &mut trace) {
            Ok(format) => format,
            Err(error) => return Err(Rejected { error, trace }),
        };
        trace.applied = Some(format);

        let mut output = sample.clone();
        let mut anomalies = Vec::new();
        let mut out_of_range = Vec::new();

        for (name, value) in output.fields.iter_mut() {
            if !value.is_finite() {
                trace.failed.push(name.clone());
                out_of_range.push(NormalizeError::NonFinite { field: name.clone() });
                continue;
            }

            if let Some(caps) = PERCENT_FIELD.captures(name) {
                if format == PercentFormat::ScaledBy100 {
                    *value /= 100.0;
                    trace.converted.push(name.clone());
                } else {
                    trace.skipped.push(name.clone());
                }

                if value.abs() > ANOMALY_LIMIT {
                    trace.failed.push(name.clone());
                    anomalies.push(NormalizeError::UnitAnomaly {
                        field: name.clone(),
                        value: *value,
                    });
                    continue;
                }
                let limit = percent_limit(&caps["metric"], &caps["window"]);
                if value.abs() > limit {
                    trace.failed.push(name.clone());
                    out_of_range.push(NormalizeError::OutOfRange {
                        field: name.clone(),
                        value: *value,
                        limit,
                    });
                }
            } else if IMBALANCE_FIELD.is_match(name) {
                trace.skipped.push(name.clone());
                if value.abs() > 1.0 {
                    trace.failed.push(name.clone());
                    out_of_range.push(NormalizeError::OutOfRange {
                        field: name.clone(),
                        value: *value,
                        limit: 1.0,
                    });
                }
            } else {
                trace.skipped.push(name.clone());
                trace.warnings.push(format!("unrecognized field {} left as-is", name));
            }
        }

        if let Some(funding) = output.funding_rate {
            if !funding.is_finite() {
                trace.failed.push("funding_rate".to_string());
                out_of_range.push(NormalizeError::NonFinite {
                    field: "funding_rate".to_string(),
                });
            } else if funding.abs() > FUNDING_RATE_LIMIT {
                trace.failed.push("funding_rate".to_string());
                out_of_range.push(NormalizeError::OutOfRange {
                    field: "funding_rate".to_string(),
                    value: funding,
                    limit: FUNDING_RATE_LIMIT,
                });
            }
        }

        for (field, value) in [
            ("price", output.price),
            ("volume", output.volume),
            ("avg_volume", output.avg_volume),
            ("open_interest", output.open_interest),
        ] {
            if let Some(value) = value {
                if !value.is_finite() || value < 0.0 {
                    trace.failed.push(field.to_string());
                    out_of_range.push(NormalizeError::OutOfRange {
                        field: field.to_string(),
                        value,
                        limit: f64::INFINITY,
                    });
                }
            }
        }

        // Unit confusion outranks ordinary range violations
        if let Some(error) = anomalies.into_iter().next().or_else(|| out_of_range.into_iter().next()) {
            warn!(symbol = %sample.symbol, error = %error, "Sample rejected by normalizer");
            return Err(Rejected { error, trace });
        }

        debug!(
            symbol = %sample.symbol,
            format = %format,
            converted = trace.converted.len(),
            skipped = trace.skipped.len(),
            "Sample normalized"
        );
        Ok(Normalized { sample: output, trace })
    }
}

impl Default for MetricsNormalizer {
    fn default() -> Self {
        Self::new(MissingFormatPolicy::AssumeScaled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use common::{Metric, Window};

    fn sample() -> Sample {
        Sample::new("BTCUSDT", Utc::now())
            .with_price(64_000.0)
            .with_funding_rate(0.0001)
            .with_metric(Metric::PriceChange, Window::H1, 1.2)
            .with_metric(Metric::OiChange, Window::H1, 3.5)
            .with_metric(Metric::Imbalance, Window::H1, 0.4)
    }

    #[test]
    fn test_fractional_is_a_no_op() {
        let input = Sample::new("BTCUSDT", Utc::now())
            .with_format(PercentFormat::Fractional)
            .with_metric(Metric::PriceChange, Window::M5, 0.0123)
            .with_metric(Metric::OiChange, Window::H6, -0.31)
            .with_metric(Metric::Imbalance, Window::M5, -0.2);
        let normalized = MetricsNormalizer::default().normalize(&input).unwrap();
        assert_eq!(normalized.sample, input);
        assert!(normalized.trace.converted.is_empty());
        assert_eq!(normalized.trace.skipped.len(), 3);
    }

    #[test]
    fn test_scaled_divides_percent_fields_by_exactly_100() {
        let input = sample().with_format(PercentFormat::ScaledBy100);
        let normalized = MetricsNormalizer::default().normalize(&input).unwrap();
        let out = &normalized.sample;
        assert_eq!(out.metric(Metric::PriceChange, Window::H1), Some(1.2 / 100.0));
        assert_eq!(out.metric(Metric::OiChange, Window::H1), Some(3.5 / 100.0));
        // Imbalance and funding are never scaled
        assert_eq!(out.metric(Metric::Imbalance, Window::H1), Some(0.4));
        assert_eq!(out.funding_rate, Some(0.0001));
        assert_eq!(normalized.trace.converted, vec!["oi_change_1h", "price_change_1h"]);
        assert!(!normalized.trace.assumed);
    }

    #[test]
    fn test_new_window_needs_no_code_change() {
        let mut input = sample().with_format(PercentFormat::ScaledBy100);
        input.fields.insert("price_change_30m".to_string(), 2.0);
        input.fields.insert("volume_change_4h".to_string(), 40.0);
        let normalized = MetricsNormalizer::default().normalize(&input).unwrap();
        assert_eq!(normalized.sample.fields["price_change_30m"], 0.02);
        assert_eq!(normalized.sample.fields["volume_change_4h"], 0.4);
    }

    #[test]
    fn test_missing_format_assumes_scaled_with_warning() {
        let normalized = MetricsNormalizer::default().normalize(&sample()).unwrap();
        assert!(normalized.trace.assumed);
        assert_eq!(normalized.trace.applied, Some(PercentFormat::ScaledBy100));
        assert_eq!(normalized.tags(), vec![ReasonTag::FormatAssumed]);
        assert_eq!(normalized.sample.fields["price_change_1h"], 1.2 / 100.0);
    }

    #[test]
    fn test_missing_format_rejected_under_strict_policy() {
        let rejected = MetricsNormalizer::new(MissingFormatPolicy::Reject)
            .normalize(&sample())
            .unwrap_err();
        assert_eq!(rejected.error, NormalizeError::FormatRequired);
        assert_eq!(rejected.error.reason_tag(), ReasonTag::FormatRequired);
    }

    #[test]
    fn test_unknown_format_rejected() {
        let mut input = sample();
        input.pct_format = Some("basis_points".to_string());
        let rejected = MetricsNormalizer::default().normalize(&input).unwrap_err();
        assert_eq!(rejected.error.reason_tag(), ReasonTag::UnknownFormatTag);
    }

    #[test]
    fn test_1500_scaled_is_unit_anomaly_before_range() {
        let input = Sample::new("BTCUSDT", Utc::now())
            .with_format(PercentFormat::ScaledBy100)
            .with_metric(Metric::PriceChange, Window::H1, 1500.0)
            .with_metric(Metric::OiChange, Window::M5, 80.0);
        let rejected = MetricsNormalizer::default().normalize(&input).unwrap_err();
        assert_eq!(
            rejected.error,
            NormalizeError::UnitAnomaly {
                field: "price_change_1h".to_string(),
                value: 15.0
            }
        );
        assert_eq!(rejected.error.reason_tag(), ReasonTag::UnitAnomaly);
        assert!(rejected.trace.failed.contains(&"price_change_1h".to_string()));
        assert!(rejected.trace.failed.contains(&"oi_change_5m".to_string()));
    }

    #[test]
    fn test_range_violation_names_the_field() {
        let input = Sample::new("BTCUSDT", Utc::now())
            .with_format(PercentFormat::Fractional)
            .with_metric(Metric::PriceChange, Window::H1, 0.25);
        let rejected = MetricsNormalizer::default().normalize(&input).unwrap_err();
        assert_eq!(
            rejected.error,
            NormalizeError::OutOfRange {
                field: "price_change_1h".to_string(),
                value: 0.25,
                limit: 0.20
            }
        );

        let input = Sample::new("BTCUSDT", Utc::now())
            .with_format(PercentFormat::Fractional)
            .with_metric(Metric::Imbalance, Window::M15, 1.4);
        let rejected = MetricsNormalizer::default().normalize(&input).unwrap_err();
        assert!(matches!(rejected.error, NormalizeError::OutOfRange { ref field, .. } if field == "imbalance_15m"));
    }

    #[test]
    fn test_unit_anomaly_applies_to_fractional_samples() {
        let input = Sample::new("BTCUSDT", Utc::now())
            .with_format(PercentFormat::Fractional)
            .with_metric(Metric::PriceChange, Window::H1, 12.0);
        let rejected = MetricsNormalizer::default().normalize(&input).unwrap_err();
        assert_eq!(
            rejected.error,
            NormalizeError::UnitAnomaly {
                field: "price_change_1h".to_string(),
                value: 12.0
            }
        );
        assert!(rejected.trace.converted.is_empty());
    }

    #[test]
    fn test_other_families_are_range_checked() {
        let mut input = Sample::new("BTCUSDT", Utc::now()).with_format(PercentFormat::Fractional);
        input.fields.insert("volume_change_1h".to_string(), 6.0);
        let rejected = MetricsNormalizer::default().normalize(&input).unwrap_err();
        assert_eq!(
            rejected.error,
            NormalizeError::OutOfRange {
                field: "volume_change_1h".to_string(),
                value: 6.0,
                limit: 5.0
            }
        );

        let mut input = Sample::new("BTCUSDT", Utc::now()).with_format(PercentFormat::ScaledBy100);
        input.fields.insert("spread_change_15m".to_string(), 300.0);
        let rejected = MetricsNormalizer::default().normalize(&input).unwrap_err();
        assert_eq!(rejected.error.reason_tag(), ReasonTag::ValueOutOfRange);
        assert!(matches!(
            rejected.error,
            NormalizeError::OutOfRange { ref field, limit, .. }
                if field == "spread_change_15m" && limit == DEFAULT_PERCENT_LIMIT
        ));
    }

    #[test]
    fn test_field_family_pattern() {
        assert!(MetricsNormalizer::is_percent_field("price_change_5m"));
        assert!(MetricsNormalizer::is_percent_field("oi_change_6h"));
        assert!(MetricsNormalizer::is_percent_field("price_change_1d"));
        assert!(!MetricsNormalizer::is_percent_field("imbalance_1h"));
        assert!(!MetricsNormalizer::is_percent_field("price_change"));
        assert!(!MetricsNormalizer::is_percent_field("Price_change_1h"));
    }
}
