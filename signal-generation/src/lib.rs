// Signal Generation Framework (Layer 2)
// Turns normalized market telemetry into explainable trading advisories

pub mod confidence;
pub mod dual_horizon;
pub mod engine;
pub mod frequency;
pub mod pipeline;
pub mod signals;
pub mod storage;

pub use confidence::{ConfidenceBreakdown, ConfidenceInputs, ConfidenceResolver};
pub use dual_horizon::{reconcile, DualHorizonEngine};
pub use engine::{AdvisoryEngine, Ingested, SampleIngestor, SymbolLocks};
pub use frequency::{DecisionMemory, FrequencyCheck, FrequencyController};
pub use pipeline::{DecisionPipeline, HorizonProfile, PreparedSample};
pub use signals::{
    resolve_priority, DirectionEvaluator, DirectionRule, Qualification, RangeConfluenceRule, RangeImbalanceRule,
    Resolution, SignalOutcome, TrendConfirmationRule,
};
pub use storage::{AdvisorySink, AdvisoryStore, InMemoryAdvisoryStore, SinkStats};
