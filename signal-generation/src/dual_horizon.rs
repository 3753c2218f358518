//! Dual-horizon evaluation.
//!
//! One ingest, two independent pipelines (short and medium), then an
//! alignment classification and a single reconciled action. Both horizon
//! evaluations are returned exactly as their pipelines produced them.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use common::{
    Advisory, Alignment, ConfidenceLevel, Decision, DualHorizonResult, EngineConfig, Evaluation, Reconciliation,
    ReconciliationPolicy, Sample,
};
use market_data::{Coverage, TemporalCache};

use super::engine::{guarded, internal_failure, Ingested, SampleIngestor, SymbolLocks};
use super::pipeline::{DecisionPipeline, HorizonProfile};
use super::storage::AdvisorySink;

fn follow(policy: ReconciliationPolicy, advisory: &Advisory, rationale: String) -> Reconciliation {
    Reconciliation {
        policy,
        action: advisory.decision,
        source: Some(advisory.horizon),
        confidence: advisory.confidence,
        executable: advisory.executable,
        rationale,
    }
}

fn stand_aside(policy: ReconciliationPolicy, rationale: String) -> Reconciliation {
    Reconciliation {
        policy,
        action: Decision::NoTrade,
        source: None,
        confidence: ConfidenceLevel::Low,
        executable: false,
        rationale,
    }
}

/// Derive one recommended action from the two horizon advisories.
///
/// `follow_short` and `follow_medium` always take the named horizon. The
/// other two policies take the directional side of a partial alignment and
/// the more confident side of a full one (medium on ties); they differ only
/// on conflict.
pub fn reconcile(policy: ReconciliationPolicy, short: &Advisory, medium: &Advisory) -> Reconciliation {
    let alignment = Alignment::classify(short.decision, medium.decision);

    match policy {
        ReconciliationPolicy::FollowShort => {
            return follow(policy, short, format!("following short horizon ({})", short.decision));
        }
        ReconciliationPolicy::FollowMedium => {
            return follow(policy, medium, format!("following medium horizon ({})", medium.decision));
        }
        ReconciliationPolicy::NoTradeOnConflict | ReconciliationPolicy::FollowHigherConfidence => {}
    }

    match alignment {
        Alignment::BothNoTrade => stand_aside(policy, "neither horizon is directional".to_string()),
        Alignment::PartialLong | Alignment::PartialShort => {
            let directional = if short.decision.is_directional() { short } else { medium };
            follow(
                policy,
                directional,
                format!("only the {} horizon is directional", directional.horizon),
            )
        }
        Alignment::BothLong | Alignment::BothShort => {
            let source = if short.confidence > medium.confidence { short } else { medium };
            follow(
                policy,
                source,
                format!("horizons agree on {}; taking {} confidence", source.decision, source.horizon),
            )
        }
        Alignment::ConflictLongShort => {
            if policy == ReconciliationPolicy::NoTradeOnConflict {
                return stand_aside(
                    policy,
                    format!("short {} conflicts with medium {}", short.decision, medium.decision),
                );
            }
            if short.confidence > medium.confidence {
                follow(
                    policy,
                    short,
                    format!("conflict; short {} more confident than medium", short.confidence),
                )
            } else if medium.confidence > short.confidence {
                follow(
                    policy,
                    medium,
                    format!("conflict; medium {} more confident than short", medium.confidence),
                )
            } else {
                stand_aside(policy, format!("conflict at equal confidence {}", short.confidence))
            }
        }
    }
}

pub struct DualHorizonEngine {
    ingestor: SampleIngestor,
    short: DecisionPipeline,
    medium: DecisionPipeline,
    policy: ReconciliationPolicy,
    locks: SymbolLocks,
    sink: Option<Arc<dyn AdvisorySink>>,
}

impl DualHorizonEngine {
    pub fn new(config: EngineConfig) -> Self {
        info!(policy = %config.reconciliation, "Creating dual-horizon engine");
        Self {
            ingestor: SampleIngestor::new(&config),
            short: DecisionPipeline::new(HorizonProfile::short(config.horizons.short), &config),
            medium: DecisionPipeline::new(HorizonProfile::medium(config.horizons.medium), &config),
            policy: config.reconciliation,
            locks: SymbolLocks::new(),
            sink: None,
        }
    }

    pub fn with_policy(mut self, policy: ReconciliationPolicy) -> Self {
        info!("Setting reconciliation policy: {}", policy);
        self.policy = policy;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn AdvisorySink>) -> Self {
        info!("Setting advisory sink");
        self.sink = Some(sink);
        self
    }

    pub fn policy(&self) -> ReconciliationPolicy {
        self.policy
    }

    pub fn short_pipeline(&self) -> &DecisionPipeline {
        &self.short
    }

    pub fn medium_pipeline(&self) -> &DecisionPipeline {
        &self.medium
    }

    pub fn cache(&self) -> &TemporalCache {
        self.ingestor.cache()
    }

    pub fn coverage(&self, symbol: &str, at: DateTime<Utc>) -> Coverage {
        self.ingestor.cache().coverage(symbol, at)
    }

    fn run(&self, pipeline: &DecisionPipeline, sample: &Sample, ingested: &Ingested) -> Evaluation {
        let result = guarded(|| match ingested {
            Ingested::Ready(prepared) => pipeline.evaluate(prepared),
            Ingested::Rejected { tags, trace } => Ok(pipeline.reject(
                &sample.symbol,
                sample.timestamp,
                tags.clone(),
                trace.clone(),
            )),
        });
        match result {
            Ok(evaluation) => evaluation,
            Err(message) => {
                error!(
                    symbol = %sample.symbol,
                    horizon = %pipeline.profile().label,
                    error = %message,
                    "Internal error during horizon evaluation"
                );
                internal_failure(pipeline, sample, &message)
            }
        }
    }

    /// Evaluate both horizons for one sample. A failure in one horizon
    /// leaves the other intact.
    pub fn evaluate(&self, sample: &Sample) -> DualHorizonResult {
        let lock = self.locks.lock_for(&sample.symbol);
        let _guard = lock.lock();

        let (short, medium) = match guarded(|| Ok(self.ingestor.ingest(sample))) {
            Ok(ingested) => (
                self.run(&self.short, sample, &ingested),
                self.run(&self.medium, sample, &ingested),
            ),
            Err(message) => {
                error!(symbol = %sample.symbol, error = %message, "Internal error during ingest");
                (
                    internal_failure(&self.short, sample, &message),
                    internal_failure(&self.medium, sample, &message),
                )
            }
        };

        let alignment = Alignment::classify(short.advisory.decision, medium.advisory.decision);
        let reconciliation = reconcile(self.policy, &short.advisory, &medium.advisory);
        info!(
            symbol = %sample.symbol,
            alignment = ?alignment,
            action = %reconciliation.action,
            executable = reconciliation.executable,
            "Horizons reconciled"
        );

        DualHorizonResult {
            symbol: sample.symbol.clone(),
            timestamp: sample.timestamp,
            short,
            medium,
            alignment,
            reconciliation,
        }
    }

    /// Evaluate and publish to the sink, if any
    pub async fn process(&self, sample: &Sample) -> Result<DualHorizonResult> {
        let result = self.evaluate(sample);

        if let Some(sink) = &self.sink {
            if let Err(e) = sink.publish_dual(&result).await {
                warn!("Failed to publish dual-horizon result for {}: {}", result.symbol, e);
            }
        }

        Ok(result)
    }
}
