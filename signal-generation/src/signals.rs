// Direction Evaluation
// Long and short conditions evaluated independently, then priority-resolved

use common::config::DirectionConfig;
use common::{Decision, HorizonView, ReasonTag, Regime};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A direction condition that was met
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Qualification {
    pub tag: ReasonTag,
    pub detail: String,
}

/// A rule that can qualify one direction under a given regime
pub trait DirectionRule: Send + Sync {
    fn name(&self) -> &'static str;

    /// Regime this rule applies in
    fn regime(&self) -> Regime;

    fn evaluate(&self, view: &HorizonView, direction: Decision) -> Option<Qualification>;
}

/// Long and short qualifications side by side
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalOutcome {
    pub long: Vec<Qualification>,
    pub short: Vec<Qualification>,
}

impl SignalOutcome {
    pub fn long_qualifies(&self) -> bool {
        !self.long.is_empty()
    }

    pub fn short_qualifies(&self) -> bool {
        !self.short.is_empty()
    }
}

/// Final direction and its causal tags
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub decision: Decision,
    pub tags: Vec<ReasonTag>,
    pub message: String,
}

fn signed(direction: Decision) -> f64 {
    match direction {
        Decision::Long => 1.0,
        Decision::Short => -1.0,
        Decision::NoTrade => 0.0,
    }
}

/// TREND: trend move, fast move, OI build-up and order flow must all agree
pub struct TrendConfirmationRule {
    config: DirectionConfig,
}

impl TrendConfirmationRule {
    pub fn new(config: DirectionConfig) -> Self {
        Self { config }
    }
}

impl DirectionRule for TrendConfirmationRule {
    fn name(&self) -> &'static str {
        "trend_confirmation"
    }

    fn regime(&self) -> Regime {
        Regime::Trend
    }

    fn evaluate(&self, view: &HorizonView, direction: Decision) -> Option<Qualification> {
        let sign = signed(direction);
        let trend = view.trend_metrics();
        let trend_move = trend.price_change?;
        let fast_move = view.fast.price_change?;
        let oi_growth = trend.oi_change?;
        let imbalance = view.fast.imbalance?;

        let confirmed = trend_move * sign > 0.0
            && fast_move * sign > 0.0
            && oi_growth >= self.config.trend_oi_growth
            && imbalance * sign >= self.config.trend_imbalance;
        if !confirmed {
            return None;
        }

        let tag = match direction {
            Decision::Long => ReasonTag::LongTrendConfirmed,
            _ => ReasonTag::ShortTrendConfirmed,
        };
        Some(Qualification {
            tag,
            detail: format!(
                "trend {:+.4} on {}, fast {:+.4}, OI {:+.4}, imbalance {:+.2}",
                trend_move,
                view.trend_window(),
                fast_move,
                oi_growth,
                imbalance
            ),
        })
    }
}

/// RANGE, conservative: strong imbalance backed by OI growth
pub struct RangeImbalanceRule {
    config: DirectionConfig,
}

impl RangeImbalanceRule {
    pub fn new(config: DirectionConfig) -> Self {
        Self { config }
    }
}

impl DirectionRule for RangeImbalanceRule {
    fn name(&self) -> &'static str {
        "range_imbalance"
    }

    fn regime(&self) -> Regime {
        Regime::Range
    }

    fn evaluate(&self, view: &HorizonView, direction: Decision) -> Option<Qualification> {
        let sign = signed(direction);
        let imbalance = view.fast.imbalance?;
        let oi_growth = view.fast.oi_change?;

        if imbalance * sign < self.config.range_strong_imbalance || oi_growth < self.config.range_oi_growth {
            return None;
        }
        let tag = match direction {
            Decision::Long => ReasonTag::LongRangeImbalance,
            _ => ReasonTag::ShortRangeImbalance,
        };
        Some(Qualification {
            tag,
            detail: format!("imbalance {:+.2} with OI growth {:+.4}", imbalance, oi_growth),
        })
    }
}

/// RANGE, opportunistic: N of four short-term signals line up
pub struct RangeConfluenceRule {
    config: DirectionConfig,
}

impl RangeConfluenceRule {
    pub fn new(config: DirectionConfig) -> Self {
        Self { config }
    }

    fn confirmations(&self, view: &HorizonView, sign: f64) -> Vec<&'static str> {
        let mut hits = Vec::new();
        if view.fast.price_change.map(|p| p * sign >= self.config.range_min_move).unwrap_or(false) {
            hits.push("fast move");
        }
        if view.fast.imbalance.map(|i| i * sign >= self.config.range_min_imbalance).unwrap_or(false) {
            hits.push("order flow");
        }
        if view.fast.oi_change.map(|oi| oi > 0.0).unwrap_or(false) {
            hits.push("OI rising");
        }
        if view.trend_metrics().price_change.map(|p| p * sign > 0.0).unwrap_or(false) {
            hits.push("slow drift");
        }
        hits
    }
}

impl DirectionRule for RangeConfluenceRule {
    fn name(&self) -> &'static str {
        "range_confluence"
    }

    fn regime(&self) -> Regime {
        Regime::Range
    }

    fn evaluate(&self, view: &HorizonView, direction: Decision) -> Option<Qualification> {
        let hits = self.confirmations(view, signed(direction));
        if hits.len() < self.config.range_min_confirmations {
            return None;
        }
        let tag = match direction {
            Decision::Long => ReasonTag::LongRangeConfluence,
            _ => ReasonTag::ShortRangeConfluence,
        };
        Some(Qualification {
            tag,
            detail: format!("{}/4 confirmations: {}", hits.len(), hits.join(", ")),
        })
    }
}

/// Runs the registered rules for both directions.
///
/// Rules are tried in registration order; for each direction the first rule
/// that qualifies wins, so conservative patterns should be added first.
pub struct DirectionEvaluator {
    rules: Vec<Box<dyn DirectionRule>>,
}

impl DirectionEvaluator {
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    /// Trend confirmation, range imbalance, then range confluence
    pub fn with_default_rules(config: &DirectionConfig) -> Self {
        Self::new()
            .add_rule(Box::new(TrendConfirmationRule::new(config.clone())))
            .add_rule(Box::new(RangeImbalanceRule::new(config.clone())))
            .add_rule(Box::new(RangeConfluenceRule::new(config.clone())))
    }

    pub fn add_rule(mut self, rule: Box<dyn DirectionRule>) -> Self {
        debug!("Adding direction rule: {}", rule.name());
        self.rules.push(rule);
        self
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    fn qualify(&self, view: &HorizonView, regime: Regime, direction: Decision) -> Vec<Qualification> {
        self.rules
            .iter()
            .filter(|rule| rule.regime() == regime)
            .find_map(|rule| rule.evaluate(view, direction))
            .into_iter()
            .collect()
    }

    pub fn evaluate(&self, view: &HorizonView, regime: Regime) -> SignalOutcome {
        let outcome = SignalOutcome {
            long: self.qualify(view, regime, Decision::Long),
            short: self.qualify(view, regime, Decision::Short),
        };
        debug!(
            symbol = %view.symbol,
            regime = %regime,
            long = outcome.long_qualifies(),
            short = outcome.short_qualifies(),
            "Direction conditions evaluated"
        );
        outcome
    }
}

impl Default for DirectionEvaluator {
    fn default() -> Self {
        Self::with_default_rules(&DirectionConfig::default())
    }
}

/// Both directions ⇒ conflict; exactly one ⇒ that direction; none ⇒ no clear direction
pub fn resolve_priority(outcome: &SignalOutcome) -> Resolution {
    match (outcome.long_qualifies(), outcome.short_qualifies()) {
        (true, true) => Resolution {
            decision: Decision::NoTrade,
            tags: vec![ReasonTag::DirectionConflict],
            message: format!(
                "long ({}) and short ({}) both qualify",
                describe(&outcome.long),
                describe(&outcome.short)
            ),
        },
        (true, false) => Resolution {
            decision: Decision::Long,
            tags: outcome.long.iter().map(|q| q.tag).collect(),
            message: describe(&outcome.long),
        },
        (false, true) => Resolution {
            decision: Decision::Short,
            tags: outcome.short.iter().map(|q| q.tag).collect(),
            message: describe(&outcome.short),
        },
        (false, false) => Resolution {
            decision: Decision::NoTrade,
            tags: vec![ReasonTag::NoClearDirection],
            message: "no direction qualifies".to_string(),
        },
    }
}

fn describe(qualifications: &[Qualification]) -> String {
    qualifications
        .iter()
        .map(|q| format!("{}: {}", q.tag, q.detail))
        .collect::<Vec<_>>()
        .join("; ")
}
