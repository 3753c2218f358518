//! Confidence scoring and execution permission.
//!
//! Confidence: weighted score → level → hard cap → strong-signal boost
//! (never above the cap). Permission comes only from the executability
//! levels of the present tags, looked up in the startup table.

use serde::{Deserialize, Serialize};
use tracing::debug;

use common::config::ConfidenceConfig;
use common::{
    ConfidenceLevel, Decision, Executability, ExecutabilityTable, ExecutionPermission, Quality, ReasonTag, Regime,
    TagSet,
};

/// Inputs to one confidence computation
#[derive(Debug, Clone, Copy)]
pub struct ConfidenceInputs<'a> {
    pub decision: Decision,
    pub regime: Regime,
    pub quality: Quality,
    pub active: bool,
    pub tags: &'a TagSet,
}

/// How the final level was reached
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceBreakdown {
    pub score: u8,
    pub raw: ConfidenceLevel,
    pub cap: Option<ConfidenceLevel>,
    pub boosted: bool,
    pub level: ConfidenceLevel,
}

pub struct ConfidenceResolver {
    config: ConfidenceConfig,
    table: ExecutabilityTable,
}

impl ConfidenceResolver {
    pub fn new(config: ConfidenceConfig, table: ExecutabilityTable) -> Self {
        Self { config, table }
    }

    pub fn config(&self) -> &ConfidenceConfig {
        &self.config
    }

    pub fn table(&self) -> &ExecutabilityTable {
        &self.table
    }

    pub fn has_strong_signal(&self, tags: &TagSet) -> bool {
        tags.iter().any(|tag| self.config.is_strong_signal(tag))
    }

    pub fn score(&self, regime: Regime, quality: Quality, active: bool, strong_signal: bool) -> u8 {
        let weights = &self.config.weights;
        let regime_score = match regime {
            Regime::Trend => weights.trend,
            Regime::Range => weights.range,
            Regime::Extreme => weights.extreme,
        };
        let quality_score = match quality {
            Quality::Good => weights.good,
            Quality::Uncertain => weights.uncertain,
            Quality::Poor => weights.poor,
        };
        let active_score = if active { weights.active } else { 0 };
        let strong_score = if strong_signal { weights.strong_signal } else { 0 };
        regime_score + quality_score + active_score + strong_score
    }

    pub fn level_for_score(&self, score: u8) -> ConfidenceLevel {
        let thresholds = &self.config.thresholds;
        if score >= thresholds.ultra {
            ConfidenceLevel::Ultra
        } else if score >= thresholds.high {
            ConfidenceLevel::High
        } else if score >= thresholds.medium {
            ConfidenceLevel::Medium
        } else {
            ConfidenceLevel::Low
        }
    }

    /// Lowest cap contributed by quality and the present tags
    pub fn cap(&self, quality: Quality, tags: &TagSet) -> Option<ConfidenceLevel> {
        let quality_cap = (quality == Quality::Uncertain).then_some(self.config.uncertain_cap);
        tags.iter()
            .filter_map(|tag| self.config.cap_for(tag, self.table.level(tag)))
            .chain(quality_cap)
            .min()
    }

    pub fn confidence(&self, inputs: &ConfidenceInputs<'_>) -> ConfidenceBreakdown {
        if !inputs.decision.is_directional() {
            return ConfidenceBreakdown {
                score: 0,
                raw: ConfidenceLevel::Low,
                cap: None,
                boosted: false,
                level: ConfidenceLevel::Low,
            };
        }

        let strong = self.has_strong_signal(inputs.tags);
        let score = self.score(inputs.regime, inputs.quality, inputs.active, strong);
        let raw = self.level_for_score(score);
        let cap = self.cap(inputs.quality, inputs.tags);
        let capped = cap.map(|c| raw.min(c)).unwrap_or(raw);

        let (level, boosted) = if strong && self.config.boost_strong_signal {
            let raised = capped.raised();
            let raised = cap.map(|c| raised.min(c)).unwrap_or(raised);
            (raised, raised > capped)
        } else {
            (capped, false)
        };

        debug!(score, raw = %raw, cap = ?cap, boosted, level = %level, "Confidence resolved");
        ConfidenceBreakdown {
            score,
            raw,
            cap,
            boosted,
            level,
        }
    }

    /// BLOCK ⇒ DENY, else DEGRADE ⇒ ALLOW_REDUCED, else ALLOW
    pub fn permission<'a, I>(&self, tags: I) -> ExecutionPermission
    where
        I: IntoIterator<Item = &'a ReasonTag>,
    {
        match self.table.strictest(tags) {
            Executability::Block => ExecutionPermission::Deny,
            Executability::Degrade => ExecutionPermission::AllowReduced,
            Executability::Allow => ExecutionPermission::Allow,
        }
    }

    pub fn minimum_for(&self, permission: ExecutionPermission) -> Option<ConfidenceLevel> {
        match permission {
            ExecutionPermission::Allow => Some(self.config.normal_min),
            ExecutionPermission::AllowReduced => Some(self.config.reduced_min),
            ExecutionPermission::Deny => None,
        }
    }

    pub fn is_executable(
        &self,
        decision: Decision,
        risk_passed: bool,
        permission: ExecutionPermission,
        confidence: ConfidenceLevel,
    ) -> bool {
        if !decision.is_directional() || !risk_passed {
            return false;
        }
        self.minimum_for(permission)
            .map(|minimum| confidence >= minimum)
            .unwrap_or(false)
    }
}
