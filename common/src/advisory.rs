//! Advisory output types and the per-stage trace

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::levels::{
    ConfidenceLevel, Decision, ExecutionPermission, HorizonLabel, ParseLevelError, Quality, Regime,
};
use crate::tags::{ReasonTag, TagSet};

/// Explainable trading opinion for one symbol at one instant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Advisory {
    pub id: Uuid,
    pub symbol: String,
    pub horizon: HorizonLabel,
    pub decision: Decision,
    pub confidence: ConfidenceLevel,
    pub regime: Regime,
    pub quality: Quality,
    pub execution_permission: ExecutionPermission,
    pub executable: bool,
    /// False when the risk gate vetoed or could not evaluate
    pub risk_passed: bool,
    pub reasons: TagSet,
    pub timestamp: DateTime<Utc>,
}

impl Advisory {
    /// Short-circuit advisory: NO_TRADE, LOW confidence, never executable
    pub fn no_trade(
        symbol: impl Into<String>,
        horizon: HorizonLabel,
        timestamp: DateTime<Utc>,
        regime: Regime,
        quality: Quality,
        reasons: TagSet,
        execution_permission: ExecutionPermission,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            symbol: symbol.into(),
            horizon,
            decision: Decision::NoTrade,
            confidence: ConfidenceLevel::Low,
            regime,
            quality,
            execution_permission,
            executable: false,
            risk_passed: false,
            reasons,
            timestamp,
        }
    }

    pub fn has_reason(&self, tag: ReasonTag) -> bool {
        self.reasons.contains(tag)
    }

    /// Structural invariants every emitted advisory must hold
    pub fn satisfies_invariants(&self) -> bool {
        // NO_TRADE exactly when LOW
        let no_trade_ok = if self.decision.is_directional() {
            self.confidence != ConfidenceLevel::Low
        } else {
            self.confidence == ConfidenceLevel::Low && !self.executable
        };
        let executable_ok = !self.executable
            || (self.decision.is_directional()
                && self.risk_passed
                && self.execution_permission != ExecutionPermission::Deny);
        no_trade_ok && executable_ok
    }
}

/// Pipeline stage names used in traces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Ingest,
    Coverage,
    Normalize,
    Completeness,
    Regime,
    Risk,
    Quality,
    Signal,
    Priority,
    Frequency,
    Confidence,
}

/// Outcome of one stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    Pass,
    Warn,
    Fail,
    Skip,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTrace {
    pub stage: Stage,
    pub status: StageStatus,
    pub message: String,
}

/// Ordered record of stage outcomes for one evaluation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelineTrace(Vec<StageTrace>);

impl PipelineTrace {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn record(&mut self, stage: Stage, status: StageStatus, message: impl Into<String>) {
        self.0.push(StageTrace {
            stage,
            status,
            message: message.into(),
        });
    }

    pub fn pass(&mut self, stage: Stage, message: impl Into<String>) {
        self.record(stage, StageStatus::Pass, message);
    }

    pub fn warn(&mut self, stage: Stage, message: impl Into<String>) {
        self.record(stage, StageStatus::Warn, message);
    }

    pub fn fail(&mut self, stage: Stage, message: impl Into<String>) {
        self.record(stage, StageStatus::Fail, message);
    }

    pub fn skip(&mut self, stage: Stage, message: impl Into<String>) {
        self.record(stage, StageStatus::Skip, message);
    }

    pub fn entries(&self) -> &[StageTrace] {
        &self.0
    }

    pub fn stage(&self, stage: Stage) -> Option<&StageTrace> {
        self.0.iter().find(|entry| entry.stage == stage)
    }

    pub fn append(&mut self, other: PipelineTrace) {
        self.0.extend(other.0);
    }
}

/// Advisory plus the trace that produced it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub advisory: Advisory,
    pub trace: PipelineTrace,
}

/// Agreement between the short and medium horizon decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Alignment {
    BothLong,
    BothShort,
    PartialLong,
    PartialShort,
    ConflictLongShort,
    BothNoTrade,
}

impl Alignment {
    pub fn classify(short: Decision, medium: Decision) -> Self {
        use Decision::*;
        match (short, medium) {
            (Long, Long) => Alignment::BothLong,
            (Short, Short) => Alignment::BothShort,
            (Long, NoTrade) | (NoTrade, Long) => Alignment::PartialLong,
            (Short, NoTrade) | (NoTrade, Short) => Alignment::PartialShort,
            (Long, Short) | (Short, Long) => Alignment::ConflictLongShort,
            (NoTrade, NoTrade) => Alignment::BothNoTrade,
        }
    }
}

/// How a single recommended action is derived from two horizons
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationPolicy {
    #[default]
    NoTradeOnConflict,
    FollowShort,
    FollowMedium,
    FollowHigherConfidence,
}

impl ReconciliationPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            ReconciliationPolicy::NoTradeOnConflict => "no_trade_on_conflict",
            ReconciliationPolicy::FollowShort => "follow_short",
            ReconciliationPolicy::FollowMedium => "follow_medium",
            ReconciliationPolicy::FollowHigherConfidence => "follow_higher_confidence",
        }
    }
}

impl fmt::Display for ReconciliationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for ReconciliationPolicy {
    type Err = ParseLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "no_trade_on_conflict" => Ok(ReconciliationPolicy::NoTradeOnConflict),
            "follow_short" => Ok(ReconciliationPolicy::FollowShort),
            "follow_medium" => Ok(ReconciliationPolicy::FollowMedium),
            "follow_higher_confidence" => Ok(ReconciliationPolicy::FollowHigherConfidence),
            other => Err(ParseLevelError::new("reconciliation policy", other)),
        }
    }
}

/// Single recommended action derived from both horizons
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reconciliation {
    pub policy: ReconciliationPolicy,
    pub action: Decision,
    /// Horizon the action was taken from, if any
    pub source: Option<HorizonLabel>,
    pub confidence: ConfidenceLevel,
    pub executable: bool,
    pub rationale: String,
}

/// Both horizon advisories, untouched, plus their reconciliation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DualHorizonResult {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub short: Evaluation,
    pub medium: Evaluation,
    pub alignment: Alignment,
    pub reconciliation: Reconciliation,
}
