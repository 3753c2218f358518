// Market Data Layer
// Temporal cache and metrics normalization for incoming telemetry

pub mod cache;
pub mod normalizer;

pub use cache::{CacheError, Coverage, DerivedChange, FloorHit, LookupMiss, TemporalCache, WindowCoverage};
pub use normalizer::{MetricsNormalizer, NormalizationTrace, NormalizeError, Normalized, Rejected};
