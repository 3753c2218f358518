// Decision Pipeline
// Sequences completeness, regime, risk, quality, direction, debounce and
// confidence into one advisory for one horizon

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use common::{
    Advisory, ConfidenceLevel, Decision, EngineConfig, Evaluation, HorizonLabel, HorizonView, HorizonWindows, PipelineTrace, Quality,
    ReasonTag, Regime, Sample, Stage, TagSet, WindowMetrics,
};
use market_data::Coverage;
use risk_gates::{QualityGate, RegimeClassifier, RiskGate};

use super::confidence::{ConfidenceInputs, ConfidenceResolver};
use super::frequency::FrequencyController;
use super::signals::{resolve_priority, DirectionEvaluator};

/// Which windows a pipeline reads and how it treats missing ones
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HorizonProfile {
    pub label: HorizonLabel,
    pub windows: HorizonWindows,
    /// Evaluate on the fast window alone when only the slow one is missing
    pub allow_slow_degrade: bool,
    /// Tag attached when the horizon cannot be evaluated for missing fields
    pub incomplete_tag: ReasonTag,
}

impl HorizonProfile {
    pub fn standard(windows: HorizonWindows) -> Self {
        Self {
            label: HorizonLabel::Standard,
            windows,
            allow_slow_degrade: true,
            incomplete_tag: ReasonTag::FieldsIncomplete,
        }
    }

    /// No degraded mode: either window missing stops the horizon
    pub fn short(windows: HorizonWindows) -> Self {
        Self {
            label: HorizonLabel::Short,
            windows,
            allow_slow_degrade: false,
            incomplete_tag: ReasonTag::ShortFieldsIncomplete,
        }
    }

    pub fn medium(windows: HorizonWindows) -> Self {
        Self {
            label: HorizonLabel::Medium,
            windows,
            allow_slow_degrade: true,
            incomplete_tag: ReasonTag::MediumFieldsIncomplete,
        }
    }
}

/// Normalized sample plus everything the ingest stage learned about it
#[derive(Debug, Clone)]
pub struct PreparedSample {
    /// Fractional fields, with cache-derived changes merged in
    pub sample: Sample,
    pub coverage: Coverage,
    /// Volume over its trailing average
    pub volume_ratio: Option<f64>,
    /// Tags raised before the pipeline (e.g. FORMAT_ASSUMED)
    pub tags: TagSet,
    pub trace: PipelineTrace,
}

pub struct DecisionPipeline {
    profile: HorizonProfile,
    regime: RegimeClassifier,
    risk: RiskGate,
    quality: QualityGate,
    direction: DirectionEvaluator,
    frequency: FrequencyController,
    confidence: ConfidenceResolver,
}

impl DecisionPipeline {
    pub fn new(profile: HorizonProfile, config: &EngineConfig) -> Self {
        info!(
            horizon = %profile.label,
            fast = %profile.windows.fast,
            slow = %profile.windows.slow,
            "Creating decision pipeline"
        );
        Self {
            profile,
            regime: RegimeClassifier::new(config.regime.clone()),
            risk: RiskGate::new(config.risk.clone()),
            quality: QualityGate::new(config.quality.clone()),
            direction: DirectionEvaluator::with_default_rules(&config.direction),
            frequency: FrequencyController::new(&config.frequency),
            confidence: ConfidenceResolver::new(config.confidence.clone(), config.executability.clone()),
        }
    }

    /// Replace the direction rules
    pub fn with_direction_evaluator(mut self, direction: DirectionEvaluator) -> Self {
        info!("Setting direction evaluator with {} rules", direction.rule_count());
        self.direction = direction;
        self
    }

    pub fn profile(&self) -> &HorizonProfile {
        &self.profile
    }

    pub fn frequency(&self) -> &FrequencyController {
        &self.frequency
    }

    pub fn resolver(&self) -> &ConfidenceResolver {
        &self.confidence
    }

    /// NO_TRADE advisory carrying `tags`, for input rejected before the pipeline
    pub fn reject(&self, symbol: &str, timestamp: DateTime<Utc>, tags: TagSet, trace: PipelineTrace) -> Evaluation {
        self.short_circuit(symbol, timestamp, tags, Regime::Range, Quality::Poor, trace)
    }

    fn short_circuit(
        &self,
        symbol: &str,
        timestamp: DateTime<Utc>,
        tags: TagSet,
        regime: Regime,
        quality: Quality,
        trace: PipelineTrace,
    ) -> Evaluation {
        let permission = self.confidence.permission(&tags);
        let advisory = Advisory::no_trade(symbol, self.profile.label, timestamp, regime, quality, tags, permission);
        info!(
            symbol = %symbol,
            horizon = %self.profile.label,
            reasons = ?advisory.reasons.as_slice(),
            "Advisory short-circuited to NO_TRADE"
        );
        Evaluation { advisory, trace }
    }

    pub fn evaluate(&self, input: &PreparedSample) -> Result<Evaluation> {
        let sample = &input.sample;
        let symbol = sample.symbol.as_str();
        let timestamp = sample.timestamp;
        let windows = self.profile.windows;
        let mut tags = input.tags.clone();
        let mut trace = input.trace.clone();

        // Completeness: each horizon only ever reads its own windows
        let fast = WindowMetrics::from_fields(&sample.fields, windows.fast);
        let slow = WindowMetrics::from_fields(&sample.fields, windows.slow);

        let fast_ok = fast.is_complete();
        let slow_ok = slow.is_complete();
        if !fast_ok || (!slow_ok && !self.profile.allow_slow_degrade) {
            tags.insert(self.profile.incomplete_tag);
            let mut missing = Vec::new();
            for (window, metrics) in [(windows.fast, &fast), (windows.slow, &slow)] {
                if metrics.is_complete() {
                    continue;
                }
                missing.extend(metrics.missing(window));
                if !input.coverage.is_valid(window) {
                    tags.insert(ReasonTag::coverage_insufficient(window));
                }
            }
            trace.fail(Stage::Completeness, format!("missing {}", missing.join(", ")));
            return Ok(self.short_circuit(symbol, timestamp, tags, Regime::Range, Quality::Poor, trace));
        }

        let slow = if slow_ok {
            trace.pass(Stage::Completeness, format!("{} and {} complete", windows.fast, windows.slow));
            Some(slow)
        } else {
            tags.insert(ReasonTag::SlowWindowDegraded);
            let coverage_note = if input.coverage.is_valid(windows.slow) {
                String::new()
            } else {
                format!(", {} coverage insufficient", windows.slow)
            };
            trace.warn(
                Stage::Completeness,
                format!(
                    "missing {}{}; evaluating on {} only",
                    slow.missing(windows.slow).join(", "),
                    coverage_note,
                    windows.fast
                ),
            );
            None
        };

        let view = HorizonView {
            symbol: symbol.to_string(),
            timestamp,
            windows,
            fast,
            slow,
            funding_rate: sample.funding_rate,
            volume_ratio: input.volume_ratio,
        };

        // Regime
        let regime = self.regime.classify(&view);
        if regime.regime == Regime::Extreme {
            tags.insert(ReasonTag::ExtremeRegime);
            trace.fail(Stage::Regime, format!("EXTREME: {}", regime.message));
            return Ok(self.short_circuit(symbol, timestamp, tags, Regime::Extreme, Quality::Poor, trace));
        }
        trace.pass(Stage::Regime, format!("{}: {}", regime.regime, regime.message));

        // Systemic risk
        let risk = self.risk.evaluate(&view);
        tags.extend(risk.tags());
        if risk.is_vetoed() {
            trace.fail(Stage::Risk, risk.summary());
            return Ok(self.short_circuit(symbol, timestamp, tags, regime.regime, Quality::Poor, trace));
        }
        if risk.is_evaluable() {
            trace.pass(Stage::Risk, risk.summary());
        } else {
            trace.warn(Stage::Risk, risk.summary());
        }
        let risk_passed = risk.passed();

        // Quality
        let quality = self.quality.assess(&view, regime.regime);
        tags.extend(quality.tags.iter().copied());
        let quality_message = if quality.notes.is_empty() {
            quality.quality.to_string()
        } else {
            format!("{}: {}", quality.quality, quality.notes.join("; "))
        };
        match quality.quality {
            Quality::Poor => {
                trace.fail(Stage::Quality, quality_message);
                return Ok(self.short_circuit(symbol, timestamp, tags, regime.regime, Quality::Poor, trace));
            }
            Quality::Uncertain => trace.warn(Stage::Quality, quality_message),
            Quality::Good => trace.pass(Stage::Quality, quality_message),
        }

        // Activity feeds the score; unknown activity never counts as active
        let active = match view.volume_ratio {
            Some(ratio) if ratio >= self.confidence.config().active_volume_ratio => {
                tags.insert(ReasonTag::ActiveMarket);
                true
            }
            Some(_) => false,
            None => {
                tags.insert(ReasonTag::DataIncomplete);
                false
            }
        };

        // Direction
        let outcome = self.direction.evaluate(&view, regime.regime);
        trace.pass(
            Stage::Signal,
            format!(
                "long {}, short {}",
                if outcome.long_qualifies() { "qualifies" } else { "no" },
                if outcome.short_qualifies() { "qualifies" } else { "no" }
            ),
        );
        let resolution = resolve_priority(&outcome);
        tags.extend(resolution.tags.iter().copied());
        trace.pass(Stage::Priority, format!("{}: {}", resolution.decision, resolution.message));
        let mut decision = resolution.decision;

        // A directional call below MEDIUM stands aside before it reaches decision memory
        if decision.is_directional() {
            let conviction = self.confidence.confidence(&ConfidenceInputs {
                decision,
                regime: regime.regime,
                quality: quality.quality,
                active,
                tags: &tags,
            });
            if conviction.level == ConfidenceLevel::Low {
                trace.warn(
                    Stage::Priority,
                    format!(
                        "{} scored {} ({}), below {}; standing aside",
                        decision,
                        conviction.score,
                        conviction.raw,
                        ConfidenceLevel::Medium
                    ),
                );
                tags.insert(ReasonTag::InsufficientConfidence);
                decision = Decision::NoTrade;
            }
        }

        // Debounce marks, never rewrites
        if decision.is_directional() {
            let check = self.frequency.check_and_record(symbol, decision, timestamp);
            if check.is_suppressed() {
                trace.warn(Stage::Frequency, check.message());
            } else {
                trace.pass(Stage::Frequency, check.message());
            }
            tags.extend(check.tags);
        } else {
            trace.skip(Stage::Frequency, "no directional decision");
        }

        // Confidence and permission
        let breakdown = self.confidence.confidence(&ConfidenceInputs {
            decision,
            regime: regime.regime,
            quality: quality.quality,
            active,
            tags: &tags,
        });
        let permission = self.confidence.permission(&tags);
        let executable = self
            .confidence
            .is_executable(decision, risk_passed, permission, breakdown.level);
        trace.pass(
            Stage::Confidence,
            format!(
                "score {} -> {}, cap {}, boosted {}; permission {}, executable {}",
                breakdown.score,
                breakdown.raw,
                breakdown
                    .cap
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "none".to_string()),
                breakdown.boosted,
                permission,
                executable
            ),
        );

        let advisory = Advisory {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            horizon: self.profile.label,
            decision,
            confidence: breakdown.level,
            regime: regime.regime,
            quality: quality.quality,
            execution_permission: permission,
            executable,
            risk_passed,
            reasons: tags,
            timestamp,
        };
        debug_assert!(advisory.satisfies_invariants());

        info!(
            symbol = %symbol,
            horizon = %self.profile.label,
            decision = %advisory.decision,
            confidence = %advisory.confidence,
            permission = %advisory.execution_permission,
            executable = advisory.executable,
            "Advisory generated"
        );
        debug!(reasons = ?advisory.reasons.as_slice(), "Advisory reasons");
        Ok(Evaluation { advisory, trace })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use common::{ConfidenceLevel, Decision, ExecutionPermission, Metric, Window};
    use market_data::WindowCoverage;
    use std::collections::BTreeMap;

    fn full_coverage(symbol: &str, at: DateTime<Utc>) -> Coverage {
        Coverage {
            symbol: symbol.to_string(),
            at,
            windows: Window::ALL
                .iter()
                .map(|w| (*w, WindowCoverage { gap_secs: Some(0), valid: true }))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap()
    }

    /// Fractional sample: fast (15m) and slow (1h) window metrics
    fn sample(fast: (f64, f64, f64), slow: Option<(f64, f64, f64)>, funding: Option<f64>) -> Sample {
        let mut sample = Sample::new("BTCUSDT", at())
            .with_metric(Metric::PriceChange, Window::M15, fast.0)
            .with_metric(Metric::OiChange, Window::M15, fast.1)
            .with_metric(Metric::Imbalance, Window::M15, fast.2);
        if let Some((p, oi, imb)) = slow {
            sample = sample
                .with_metric(Metric::PriceChange, Window::H1, p)
                .with_metric(Metric::OiChange, Window::H1, oi)
                .with_metric(Metric::Imbalance, Window::H1, imb);
        }
        sample.funding_rate = funding;
        sample
    }

    fn prepared(sample: Sample, volume_ratio: Option<f64>) -> PreparedSample {
        PreparedSample {
            coverage: full_coverage(&sample.symbol, sample.timestamp),
            sample,
            volume_ratio,
            tags: TagSet::new(),
            trace: PipelineTrace::new(),
        }
    }

    fn pipeline() -> DecisionPipeline {
        let config = EngineConfig::default();
        DecisionPipeline::new(HorizonProfile::standard(config.horizons.standard), &config)
    }

    const TREND_FAST: (f64, f64, f64) = (0.006, 0.01, 0.3);
    const TREND_SLOW: (f64, f64, f64) = (0.02, 0.02, 0.2);

    #[test]
    fn test_confirmed_trend_is_executable() {
        let evaluation = pipeline()
            .evaluate(&prepared(sample(TREND_FAST, Some(TREND_SLOW), Some(0.0001)), Some(1.5)))
            .unwrap();
        let advisory = &evaluation.advisory;
        assert_eq!(advisory.decision, Decision::Long);
        assert_eq!(advisory.regime, Regime::Trend);
        assert_eq!(advisory.quality, Quality::Good);
        assert_eq!(advisory.confidence, ConfidenceLevel::Ultra);
        assert_eq!(advisory.execution_permission, ExecutionPermission::Allow);
        assert!(advisory.executable);
        assert!(advisory.has_reason(ReasonTag::LongTrendConfirmed));
        assert!(advisory.has_reason(ReasonTag::ActiveMarket));
        assert_eq!(evaluation.trace.stage(Stage::Regime).unwrap().status, common::StageStatus::Pass);
    }

    #[test]
    fn test_missing_fast_window_stops_with_coverage_tag() {
        let mut input = sample(TREND_FAST, Some(TREND_SLOW), Some(0.0001));
        input.fields.remove("imbalance_15m");
        let mut prepared = prepared(input, Some(1.5));
        prepared.coverage.windows.insert(Window::M15, WindowCoverage { gap_secs: Some(400), valid: false });

        let advisory = pipeline().evaluate(&prepared).unwrap().advisory;
        assert_eq!(advisory.decision, Decision::NoTrade);
        assert_eq!(advisory.confidence, ConfidenceLevel::Low);
        assert!(advisory.has_reason(ReasonTag::FieldsIncomplete));
        assert!(advisory.has_reason(ReasonTag::Coverage15mInsufficient));
        assert_eq!(advisory.execution_permission, ExecutionPermission::Deny);
    }

    #[test]
    fn test_missing_slow_window_degrades() {
        let advisory = pipeline()
            .evaluate(&prepared(sample((0.012, 0.01, 0.3), None, Some(0.0001)), Some(1.5)))
            .unwrap()
            .advisory;
        assert_eq!(advisory.decision, Decision::Long);
        assert!(advisory.has_reason(ReasonTag::SlowWindowDegraded));
        assert!(advisory.confidence < ConfidenceLevel::Ultra);
        assert_eq!(advisory.execution_permission, ExecutionPermission::AllowReduced);
    }

    #[test]
    fn test_extreme_regime_short_circuits() {
        let advisory = pipeline()
            .evaluate(&prepared(sample((0.06, 0.01, 0.3), Some(TREND_SLOW), Some(0.0001)), Some(1.5)))
            .unwrap()
            .advisory;
        assert_eq!(advisory.decision, Decision::NoTrade);
        assert_eq!(advisory.regime, Regime::Extreme);
        assert!(advisory.has_reason(ReasonTag::ExtremeRegime));
    }

    #[test]
    fn test_risk_veto_short_circuits() {
        let advisory = pipeline()
            .evaluate(&prepared(sample(TREND_FAST, Some(TREND_SLOW), Some(0.0001)), Some(6.5)))
            .unwrap()
            .advisory;
        assert_eq!(advisory.decision, Decision::NoTrade);
        assert!(advisory.has_reason(ReasonTag::AbnormalVolume));
        assert!(!advisory.risk_passed);
    }

    #[test]
    fn test_unevaluable_risk_is_not_a_pass() {
        let advisory = pipeline()
            .evaluate(&prepared(sample(TREND_FAST, Some(TREND_SLOW), None), Some(1.5)))
            .unwrap()
            .advisory;
        // Direction survives, execution does not
        assert_eq!(advisory.decision, Decision::Long);
        assert!(advisory.has_reason(ReasonTag::RiskUnevaluable));
        assert!(!advisory.risk_passed);
        assert_eq!(advisory.execution_permission, ExecutionPermission::Deny);
        assert!(!advisory.executable);
    }

    #[test]
    fn test_poor_quality_short_circuits() {
        // Price up 2% while OI drops 3%
        let advisory = pipeline()
            .evaluate(&prepared(sample(TREND_FAST, Some((0.02, -0.03, 0.2)), Some(0.0001)), Some(1.5)))
            .unwrap()
            .advisory;
        assert_eq!(advisory.decision, Decision::NoTrade);
        assert_eq!(advisory.quality, Quality::Poor);
        assert!(advisory.has_reason(ReasonTag::OiDivergence));
    }

    #[test]
    fn test_uncertain_quality_takes_reduced_path() {
        let advisory = pipeline()
            .evaluate(&prepared(sample(TREND_FAST, Some(TREND_SLOW), Some(0.0007)), Some(1.5)))
            .unwrap()
            .advisory;
        assert_eq!(advisory.decision, Decision::Long);
        assert_eq!(advisory.quality, Quality::Uncertain);
        assert_eq!(advisory.confidence, ConfidenceLevel::Medium);
        assert_eq!(advisory.execution_permission, ExecutionPermission::AllowReduced);
        assert!(advisory.executable);
    }

    #[test]
    fn test_weak_directional_score_stands_aside() {
        // RANGE imbalance long, funding noise, inactive market: 1 + 1 + 0 + 0 = 2
        let pipeline = pipeline();
        let advisory = pipeline
            .evaluate(&prepared(sample((0.003, 0.015, 0.55), Some((0.004, 0.01, 0.3)), Some(0.0007)), Some(1.0)))
            .unwrap()
            .advisory;
        assert_eq!(advisory.regime, Regime::Range);
        assert_eq!(advisory.quality, Quality::Uncertain);
        assert_eq!(advisory.decision, Decision::NoTrade);
        assert_eq!(advisory.confidence, ConfidenceLevel::Low);
        assert!(advisory.has_reason(ReasonTag::LongRangeImbalance));
        assert!(advisory.has_reason(ReasonTag::InsufficientConfidence));
        assert!(!advisory.executable);
        assert!(advisory.satisfies_invariants());
        // Never recorded as a directional decision
        assert!(pipeline.frequency().memory("BTCUSDT").is_none());
    }

    #[test]
    fn test_no_clear_direction() {
        let advisory = pipeline()
            .evaluate(&prepared(sample((0.0005, 0.001, 0.05), Some((0.001, 0.001, 0.0)), Some(0.0001)), Some(1.0)))
            .unwrap()
            .advisory;
        assert_eq!(advisory.decision, Decision::NoTrade);
        assert!(advisory.has_reason(ReasonTag::NoClearDirection));
        assert_eq!(advisory.confidence, ConfidenceLevel::Low);
        assert!(!advisory.executable);
    }

    #[test]
    fn test_invariants_hold_across_input_grid() {
        let pipeline = pipeline();
        let moves = [-0.05, -0.012, -0.003, 0.0, 0.003, 0.012, 0.05];
        let imbalances = [-0.7, -0.3, 0.0, 0.3, 0.7];
        let ratios = [None, Some(0.3), Some(1.5), Some(7.0)];
        let mut minute = 0;
        for price in moves {
            for imbalance in imbalances {
                for ratio in ratios {
                    minute += 10;
                    let mut input = sample(
                        (price / 3.0, 0.01, imbalance),
                        Some((price, 0.02, imbalance / 2.0)),
                        Some(0.0001),
                    );
                    input.timestamp = at() + chrono::Duration::minutes(minute);
                    let advisory = pipeline.evaluate(&prepared(input, ratio)).unwrap().advisory;

                    assert!(advisory.satisfies_invariants(), "{:?}", advisory);
                    if advisory.decision == Decision::NoTrade {
                        assert_eq!(advisory.confidence, ConfidenceLevel::Low);
                    } else {
                        assert_ne!(advisory.confidence, ConfidenceLevel::Low);
                    }
                    let blocked = advisory
                        .reasons
                        .iter()
                        .any(|tag| pipeline.resolver().table().level(tag) == common::Executability::Block);
                    if blocked {
                        assert_eq!(advisory.execution_permission, ExecutionPermission::Deny);
                        assert!(!advisory.executable);
                    }
                }
            }
        }
    }
}
