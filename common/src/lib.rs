//! Shared types for the advisory engine: samples, closed level types,
//! reason tags, advisory output and configuration.

pub mod advisory;
pub mod config;
pub mod levels;
pub mod sample;
pub mod tags;
pub mod view;

pub use advisory::{
    Advisory, Alignment, DualHorizonResult, Evaluation, PipelineTrace, Reconciliation,
    ReconciliationPolicy, Stage, StageStatus, StageTrace,
};
pub use config::{load_config, ConfigError, EngineConfig, RawEngineConfig};
pub use levels::{
    ConfidenceLevel, Decision, Executability, ExecutionPermission, HorizonLabel, ParseLevelError,
    Quality, Regime,
};
pub use sample::{Metric, PercentFormat, Sample, Window};
pub use tags::{ExecutabilityTable, ReasonTag, TagSet};
pub use view::{HorizonView, HorizonWindows, WindowMetrics};
