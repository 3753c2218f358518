// Risk Gates Layer
// Regime classification, systemic risk veto and opportunity quality grading

pub mod quality;
pub mod regime;
pub mod risk;

pub use quality::{QualityAssessment, QualityGate};
pub use regime::{RegimeAssessment, RegimeClassifier};
pub use risk::{RiskGate, RiskOutcome, RiskVeto};
