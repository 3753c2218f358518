// Advisory Engine
// Owns the temporal cache, normalizer and decision memory; turns one sample
// into one advisory and never lets a failure escape to the caller

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use common::{EngineConfig, Evaluation, PipelineTrace, ReasonTag, Sample, Stage, TagSet};
use market_data::{CacheError, Coverage, MetricsNormalizer, TemporalCache};

use super::pipeline::{DecisionPipeline, HorizonProfile, PreparedSample};
use super::signals::DirectionEvaluator;
use super::storage::AdvisorySink;

/// Result of the shared ingest stage
#[derive(Debug, Clone)]
pub enum Ingested {
    Ready(PreparedSample),
    /// Input-invalid: the sample never reaches a pipeline
    Rejected { tags: TagSet, trace: PipelineTrace },
}

/// Validate, normalize, cache and enrich incoming samples
pub struct SampleIngestor {
    cache: TemporalCache,
    normalizer: MetricsNormalizer,
}

impl SampleIngestor {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            cache: TemporalCache::new(config.cache.clone()),
            normalizer: MetricsNormalizer::new(config.missing_format),
        }
    }

    pub fn cache(&self) -> &TemporalCache {
        &self.cache
    }

    fn rejected(tag: ReasonTag, trace: PipelineTrace) -> Ingested {
        Ingested::Rejected {
            tags: [tag].into_iter().collect(),
            trace,
        }
    }

    /// Runs the ingest stages in order: required fields, normalize, store,
    /// coverage, derived changes, volume ratio.
    ///
    /// Callers must hold the symbol's lock.
    pub fn ingest(&self, sample: &Sample) -> Ingested {
        let mut trace = PipelineTrace::new();
        let mut tags = TagSet::new();

        if let Some(missing) = missing_required(sample) {
            warn!(symbol = %sample.symbol, missing = %missing, "Sample missing required field");
            trace.fail(Stage::Ingest, format!("missing required field: {}", missing));
            return Self::rejected(ReasonTag::MissingRequiredField, trace);
        }

        let normalized = match self.normalizer.normalize(sample) {
            Ok(normalized) => normalized,
            Err(rejected) => {
                debug!(symbol = %sample.symbol, field_failures = ?rejected.trace.failed, "Normalization failed");
                trace.fail(Stage::Normalize, rejected.error.to_string());
                return Self::rejected(rejected.error.reason_tag(), trace);
            }
        };
        let applied = normalized
            .trace
            .applied
            .map(|format| format.to_string())
            .unwrap_or_else(|| "none".to_string());
        let message = format!(
            "{} converted, {} skipped, read as {}",
            normalized.trace.converted.len(),
            normalized.trace.skipped.len(),
            applied
        );
        if normalized.trace.warnings.is_empty() {
            trace.pass(Stage::Normalize, message);
        } else {
            trace.warn(Stage::Normalize, format!("{}; {}", message, normalized.trace.warnings.join("; ")));
        }
        tags.extend(normalized.tags());

        let mut prepared = normalized.sample;
        let symbol = prepared.symbol.clone();
        let at = prepared.timestamp;

        match self.cache.store(&symbol, prepared.clone(), at) {
            Ok(()) => trace.pass(Stage::Ingest, format!("stored at {}", at)),
            Err(err @ CacheError::OutOfOrder { .. }) => {
                trace.fail(Stage::Ingest, err.to_string());
                return Self::rejected(ReasonTag::StaleSample, trace);
            }
            Err(err) => {
                error!(symbol = %symbol, error = %err, "Cache rejected sample");
                trace.fail(Stage::Ingest, err.to_string());
                return Self::rejected(ReasonTag::InvalidData, trace);
            }
        }

        let coverage = self.cache.coverage(&symbol, at);
        let invalid = coverage.invalid_windows();
        if invalid.is_empty() {
            trace.pass(Stage::Coverage, "all windows covered");
        } else {
            let names: Vec<String> = invalid.iter().map(|w| w.to_string()).collect();
            trace.warn(Stage::Coverage, format!("no floor within tolerance for {}", names.join(", ")));
        }

        let derived = self.cache.derive_window_changes(&prepared);
        if !derived.is_empty() {
            let keys: Vec<&str> = derived.iter().map(|d| d.key.as_str()).collect();
            debug!(symbol = %symbol, derived = ?keys, "Derived window changes from cache");
            trace.pass(Stage::Coverage, format!("derived {} from cached history", keys.join(", ")));
            for change in derived {
                prepared.fields.insert(change.key, change.value);
            }
        }

        let volume_ratio = self.volume_ratio(&prepared);

        Ingested::Ready(PreparedSample {
            sample: prepared,
            coverage,
            volume_ratio,
            tags,
            trace,
        })
    }

    /// Volume over the feed's average, or over the cached trailing average
    fn volume_ratio(&self, sample: &Sample) -> Option<f64> {
        let volume = sample.volume?;
        let average = sample
            .avg_volume
            .filter(|avg| *avg > 0.0)
            .or_else(|| self.cache.trailing_avg_volume(&sample.symbol, sample.timestamp))
            .filter(|avg| *avg > 0.0)?;
        let ratio = volume / average;
        ratio.is_finite().then_some(ratio)
    }
}

fn missing_required(sample: &Sample) -> Option<&'static str> {
    if sample.symbol.trim().is_empty() {
        return Some("symbol");
    }
    if sample.fields.is_empty() && sample.price.is_none() && sample.open_interest.is_none() {
        return Some("market data (no price, open interest or window fields)");
    }
    None
}

/// Per-symbol evaluation locks. Ticks for one symbol are serialized; other
/// symbols never contend.
#[derive(Default)]
pub struct SymbolLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SymbolLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_for(&self, symbol: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.locks
                .entry(symbol.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run `f`, turning both `Err` and panics into an error message
pub(crate) fn guarded<T>(f: impl FnOnce() -> Result<T>) -> std::result::Result<T, String> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(format!("{:#}", err)),
        Err(payload) => Err(format!("panic: {}", panic_message(payload.as_ref()))),
    }
}

/// Single-horizon advisory engine
pub struct AdvisoryEngine {
    ingestor: SampleIngestor,
    pipeline: DecisionPipeline,
    locks: SymbolLocks,
    sink: Option<Arc<dyn AdvisorySink>>,
}

impl AdvisoryEngine {
    pub fn new(config: EngineConfig) -> Self {
        info!("Creating advisory engine");
        Self {
            ingestor: SampleIngestor::new(&config),
            pipeline: DecisionPipeline::new(HorizonProfile::standard(config.horizons.standard), &config),
            locks: SymbolLocks::new(),
            sink: None,
        }
    }

    /// Set the sink every evaluation from [`AdvisoryEngine::process`] is published to
    pub fn with_sink(mut self, sink: Arc<dyn AdvisorySink>) -> Self {
        info!("Setting advisory sink");
        self.sink = Some(sink);
        self
    }

    pub fn with_direction_evaluator(mut self, direction: DirectionEvaluator) -> Self {
        self.pipeline = self.pipeline.with_direction_evaluator(direction);
        self
    }

    pub fn pipeline(&self) -> &DecisionPipeline {
        &self.pipeline
    }

    pub fn cache(&self) -> &TemporalCache {
        self.ingestor.cache()
    }

    pub fn coverage(&self, symbol: &str, at: DateTime<Utc>) -> Coverage {
        self.ingestor.cache().coverage(symbol, at)
    }

    /// Evaluate one sample. Always returns an advisory; failures become
    /// NO_TRADE with INVALID_DATA.
    pub fn evaluate(&self, sample: &Sample) -> Evaluation {
        let lock = self.locks.lock_for(&sample.symbol);
        let _guard = lock.lock();

        let result = guarded(|| match self.ingestor.ingest(sample) {
            Ingested::Ready(prepared) => self.pipeline.evaluate(&prepared),
            Ingested::Rejected { tags, trace } => {
                Ok(self.pipeline.reject(&sample.symbol, sample.timestamp, tags, trace))
            }
        });

        match result {
            Ok(evaluation) => evaluation,
            Err(message) => {
                error!(symbol = %sample.symbol, error = %message, "Internal error during evaluation");
                internal_failure(&self.pipeline, sample, &message)
            }
        }
    }

    /// Evaluate and publish to the sink, if any
    pub async fn process(&self, sample: &Sample) -> Result<Evaluation> {
        let evaluation = self.evaluate(sample);

        if let Some(sink) = &self.sink {
            if let Err(e) = sink.publish(&evaluation).await {
                warn!("Failed to publish advisory {}: {}", evaluation.advisory.id, e);
            }
        }

        Ok(evaluation)
    }
}

pub(crate) fn internal_failure(pipeline: &DecisionPipeline, sample: &Sample, message: &str) -> Evaluation {
    let mut trace = PipelineTrace::new();
    trace.fail(Stage::Ingest, format!("internal error: {}", message));
    pipeline.reject(
        &sample.symbol,
        sample.timestamp,
        [ReasonTag::InvalidData].into_iter().collect(),
        trace,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::{DirectionRule, Qualification, TrendConfirmationRule};
    use crate::storage::{AdvisoryStore, InMemoryAdvisoryStore};
    use chrono::{Duration, TimeZone};
    use common::config::DirectionConfig;
    use common::{
        ConfidenceLevel, Decision, ExecutionPermission, HorizonView, Metric, PercentFormat, Regime, StageStatus,
        Window,
    };

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    /// Fractional sample with 15m and 1h metrics plus funding and volume
    fn trend_sample(symbol: &str, at: DateTime<Utc>, sign: f64) -> Sample {
        Sample::new(symbol, at)
            .with_format(PercentFormat::Fractional)
            .with_price(64000.0)
            .with_open_interest(1.0e9)
            .with_funding_rate(0.0001)
            .with_volume(150.0, Some(100.0))
            .with_metric(Metric::PriceChange, Window::M15, 0.006 * sign)
            .with_metric(Metric::OiChange, Window::M15, 0.01)
            .with_metric(Metric::Imbalance, Window::M15, 0.3 * sign)
            .with_metric(Metric::PriceChange, Window::H1, 0.02 * sign)
            .with_metric(Metric::OiChange, Window::H1, 0.01)
            .with_metric(Metric::Imbalance, Window::H1, 0.2 * sign)
    }

    fn engine() -> AdvisoryEngine {
        AdvisoryEngine::new(EngineConfig::default())
    }

    #[test]
    fn test_trend_sample_is_executable() {
        let evaluation = engine().evaluate(&trend_sample("BTCUSDT", t0(), 1.0));
        let advisory = &evaluation.advisory;
        assert_eq!(advisory.decision, Decision::Long);
        assert_eq!(advisory.confidence, ConfidenceLevel::Ultra);
        assert!(advisory.executable);
        assert!(!advisory.has_reason(ReasonTag::FormatAssumed));
        assert_eq!(evaluation.trace.stage(Stage::Normalize).unwrap().status, StageStatus::Pass);
    }

    #[test]
    fn test_repeat_inside_min_interval_keeps_direction() {
        let engine = engine();
        let first = engine.evaluate(&trend_sample("BTCUSDT", t0(), 1.0)).advisory;
        let second = engine
            .evaluate(&trend_sample("BTCUSDT", t0() + Duration::seconds(120), 1.0))
            .advisory;

        assert!(first.executable);
        assert_eq!(second.decision, first.decision);
        assert!(!second.executable);
        assert!(second.has_reason(ReasonTag::MinIntervalBlock));
        assert_eq!(second.execution_permission, ExecutionPermission::Deny);
    }

    #[test]
    fn test_flip_inside_cooldown_keeps_direction() {
        let engine = engine();
        let first = engine.evaluate(&trend_sample("BTCUSDT", t0(), 1.0)).advisory;
        let flipped = engine
            .evaluate(&trend_sample("BTCUSDT", t0() + Duration::seconds(600), -1.0))
            .advisory;

        assert_eq!(first.decision, Decision::Long);
        assert_eq!(flipped.decision, Decision::Short);
        assert!(!flipped.executable);
        assert!(flipped.has_reason(ReasonTag::FlipCooldownBlock));
        assert!(!flipped.has_reason(ReasonTag::MinIntervalBlock));
    }

    #[test]
    fn test_scaled_anomaly_is_rejected() {
        let sample = Sample::new("BTCUSDT", t0())
            .with_format(PercentFormat::ScaledBy100)
            .with_price(64000.0)
            .with_metric(Metric::PriceChange, Window::H1, 1500.0);
        let evaluation = engine().evaluate(&sample);

        assert_eq!(evaluation.advisory.decision, Decision::NoTrade);
        assert!(evaluation.advisory.has_reason(ReasonTag::UnitAnomaly));
        assert_eq!(evaluation.advisory.execution_permission, ExecutionPermission::Deny);
        assert_eq!(evaluation.trace.stage(Stage::Normalize).unwrap().status, StageStatus::Fail);
    }

    #[test]
    fn test_input_invalid_short_circuits() {
        let engine = engine();

        let unnamed = engine.evaluate(&trend_sample("", t0(), 1.0)).advisory;
        assert!(unnamed.has_reason(ReasonTag::MissingRequiredField));

        let empty = engine.evaluate(&Sample::new("BTCUSDT", t0())).advisory;
        assert!(empty.has_reason(ReasonTag::MissingRequiredField));

        let unknown = engine
            .evaluate(&Sample {
                pct_format: Some("basis_points".to_string()),
                ..trend_sample("BTCUSDT", t0(), 1.0)
            })
            .advisory;
        assert!(unknown.has_reason(ReasonTag::UnknownFormatTag));

        for advisory in [&unnamed, &empty, &unknown] {
            assert_eq!(advisory.decision, Decision::NoTrade);
            assert!(!advisory.executable);
        }
    }

    #[test]
    fn test_stale_sample_is_rejected() {
        let engine = engine();
        engine.evaluate(&trend_sample("BTCUSDT", t0(), 1.0));
        let stale = engine
            .evaluate(&trend_sample("BTCUSDT", t0() - Duration::seconds(30), 1.0))
            .advisory;
        assert_eq!(stale.decision, Decision::NoTrade);
        assert!(stale.has_reason(ReasonTag::StaleSample));
        assert_eq!(engine.cache().len("BTCUSDT"), 1);
    }

    #[test]
    fn test_window_changes_derived_from_history() {
        let engine = engine();
        let base = |at: DateTime<Utc>, price: f64, oi: f64| {
            Sample::new("ETHUSDT", at)
                .with_format(PercentFormat::Fractional)
                .with_price(price)
                .with_open_interest(oi)
                .with_funding_rate(0.0001)
        };
        engine.evaluate(&base(t0(), 100.0, 1000.0).with_volume(100.0, None));
        engine.evaluate(&base(t0() + Duration::seconds(2700), 101.4, 1010.0).with_volume(100.0, None));

        let now = t0() + Duration::seconds(3600);
        let evaluation = engine.evaluate(
            &base(now, 102.0, 1020.0)
                .with_volume(150.0, None)
                .with_metric(Metric::Imbalance, Window::M15, 0.3)
                .with_metric(Metric::Imbalance, Window::H1, 0.2),
        );

        let coverage = engine.coverage("ETHUSDT", now);
        assert!(coverage.is_valid(Window::M15));
        assert!(coverage.is_valid(Window::H1));
        assert!(!coverage.is_valid(Window::H6));

        let advisory = evaluation.advisory;
        assert_eq!(advisory.decision, Decision::Long);
        assert_eq!(advisory.regime, Regime::Trend);
        assert!(advisory.has_reason(ReasonTag::ActiveMarket));
    }

    struct PanickingRule;

    impl DirectionRule for PanickingRule {
        fn name(&self) -> &'static str {
            "panicking"
        }

        fn regime(&self) -> Regime {
            Regime::Trend
        }

        fn evaluate(&self, view: &HorizonView, _direction: Decision) -> Option<Qualification> {
            if view.symbol == "BOOMUSDT" {
                panic!("rule exploded");
            }
            None
        }
    }

    #[test]
    fn test_internal_error_is_isolated() {
        let engine = engine().with_direction_evaluator(
            DirectionEvaluator::new()
                .add_rule(Box::new(PanickingRule))
                .add_rule(Box::new(TrendConfirmationRule::new(DirectionConfig::default()))),
        );

        let failed = engine.evaluate(&trend_sample("BOOMUSDT", t0(), 1.0));
        assert_eq!(failed.advisory.decision, Decision::NoTrade);
        assert!(failed.advisory.has_reason(ReasonTag::InvalidData));
        assert!(failed.trace.entries()[0].message.contains("rule exploded"));

        // Same symbol recovers on the next tick, others are untouched
        let healthy = engine.evaluate(&trend_sample("BTCUSDT", t0(), 1.0));
        assert_eq!(healthy.advisory.decision, Decision::Long);
        let again = engine.evaluate(&trend_sample("BOOMUSDT", t0() + Duration::seconds(60), 1.0));
        assert!(again.advisory.has_reason(ReasonTag::InvalidData));
    }

    #[test]
    fn test_concurrent_symbols_are_isolated() {
        let engine = engine();
        let symbols = ["BTCUSDT", "ETHUSDT", "SOLUSDT", "XRPUSDT"];

        std::thread::scope(|scope| {
            for (i, symbol) in symbols.iter().enumerate() {
                let engine = &engine;
                scope.spawn(move || {
                    let sign = if i % 2 == 0 { 1.0 } else { -1.0 };
                    for step in 0..20 {
                        let at = t0() + Duration::seconds(step * 60);
                        let advisory = engine.evaluate(&trend_sample(symbol, at, sign)).advisory;
                        assert!(advisory.satisfies_invariants());
                        assert_eq!(advisory.symbol, *symbol);
                    }
                });
            }
        });

        for (i, symbol) in symbols.iter().enumerate() {
            let memory = engine.pipeline().frequency().memory(symbol).unwrap();
            let expected = if i % 2 == 0 { Decision::Long } else { Decision::Short };
            assert_eq!(memory.decision, expected);
            assert_eq!(memory.at, t0() + Duration::seconds(19 * 60));
            assert_eq!(engine.cache().len(symbol), 20);
        }
    }

    #[tokio::test]
    async fn test_process_publishes_to_sink() {
        let store = Arc::new(InMemoryAdvisoryStore::new());
        let engine = engine().with_sink(store.clone());

        engine.process(&trend_sample("BTCUSDT", t0(), 1.0)).await.unwrap();
        engine
            .process(&trend_sample("BTCUSDT", t0() + Duration::seconds(900), 1.0))
            .await
            .unwrap();

        let stored = store.get_by_symbol("BTCUSDT").await.unwrap();
        assert_eq!(stored.len(), 2);
        assert!(stored.iter().all(|a| a.executable));
    }
}
