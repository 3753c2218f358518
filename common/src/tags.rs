//! Reason tags and their executability classification.
//!
//! The [`ExecutabilityTable`] built at startup is the single place a tag's
//! effect on execution is looked up. Stages only attach tags.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::levels::{Executability, ParseLevelError};
use crate::sample::Window;

macro_rules! reason_tags {
    ($($variant:ident => ($text:literal, $level:ident)),+ $(,)?) => {
        /// Named cause attached to an advisory
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub enum ReasonTag {
            $(#[serde(rename = $text)] $variant),+
        }

        impl ReasonTag {
            pub const ALL: &'static [ReasonTag] = &[$(ReasonTag::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $(ReasonTag::$variant => $text),+
                }
            }

            /// Built-in classification, before configuration overrides
            pub fn default_executability(self) -> Executability {
                match self {
                    $(ReasonTag::$variant => Executability::$level),+
                }
            }
        }

        impl FromStr for ReasonTag {
            type Err = ParseLevelError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(ReasonTag::$variant),)+
                    other => Err(ParseLevelError::new("reason tag", other)),
                }
            }
        }
    };
}

reason_tags! {
    InvalidData => ("INVALID_DATA", Block),
    MissingRequiredField => ("MISSING_REQUIRED_FIELD", Block),
    UnknownFormatTag => ("UNKNOWN_FORMAT_TAG", Block),
    FormatRequired => ("FORMAT_REQUIRED", Block),
    FormatAssumed => ("FORMAT_ASSUMED", Allow),
    ValueOutOfRange => ("VALUE_OUT_OF_RANGE", Block),
    UnitAnomaly => ("UNIT_ANOMALY", Block),
    StaleSample => ("STALE_SAMPLE", Block),
    Coverage5mInsufficient => ("COVERAGE_5M_INSUFFICIENT", Block),
    Coverage15mInsufficient => ("COVERAGE_15M_INSUFFICIENT", Block),
    Coverage1hInsufficient => ("COVERAGE_1H_INSUFFICIENT", Block),
    Coverage6hInsufficient => ("COVERAGE_6H_INSUFFICIENT", Block),
    DataIncomplete => ("DATA_INCOMPLETE", Degrade),
    FieldsIncomplete => ("FIELDS_INCOMPLETE", Block),
    ShortFieldsIncomplete => ("SHORT_FIELDS_INCOMPLETE", Block),
    MediumFieldsIncomplete => ("MEDIUM_FIELDS_INCOMPLETE", Block),
    SlowWindowDegraded => ("SLOW_WINDOW_DEGRADED", Degrade),
    ExtremeRegime => ("EXTREME_REGIME", Block),
    LiquidationPhase => ("LIQUIDATION_PHASE", Block),
    Crowding => ("CROWDING", Block),
    AbnormalVolume => ("ABNORMAL_VOLUME", Block),
    RiskUnevaluable => ("RISK_UNEVALUABLE", Block),
    AbsorptionRisk => ("ABSORPTION_RISK", Block),
    OiDivergence => ("OI_DIVERGENCE", Block),
    FundingNoise => ("FUNDING_NOISE", Degrade),
    WeakRangeSignal => ("WEAK_RANGE_SIGNAL", Degrade),
    ActiveMarket => ("ACTIVE_MARKET", Allow),
    LongTrendConfirmed => ("LONG_TREND_CONFIRMED", Allow),
    ShortTrendConfirmed => ("SHORT_TREND_CONFIRMED", Allow),
    LongRangeImbalance => ("LONG_RANGE_IMBALANCE", Allow),
    ShortRangeImbalance => ("SHORT_RANGE_IMBALANCE", Allow),
    LongRangeConfluence => ("LONG_RANGE_CONFLUENCE", Degrade),
    ShortRangeConfluence => ("SHORT_RANGE_CONFLUENCE", Degrade),
    DirectionConflict => ("DIRECTION_CONFLICT", Allow),
    NoClearDirection => ("NO_CLEAR_DIRECTION", Allow),
    InsufficientConfidence => ("INSUFFICIENT_CONFIDENCE", Allow),
    MinIntervalBlock => ("MIN_INTERVAL_BLOCK", Block),
    FlipCooldownBlock => ("FLIP_COOLDOWN_BLOCK", Block),
}

impl ReasonTag {
    /// Per-window coverage failure tag
    pub fn coverage_insufficient(window: Window) -> ReasonTag {
        match window {
            Window::M5 => ReasonTag::Coverage5mInsufficient,
            Window::M15 => ReasonTag::Coverage15mInsufficient,
            Window::H1 => ReasonTag::Coverage1hInsufficient,
            Window::H6 => ReasonTag::Coverage6hInsufficient,
        }
    }
}

impl fmt::Display for ReasonTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Insertion-ordered set of reason tags
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagSet(Vec<ReasonTag>);

impl TagSet {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Adds the tag unless already present; returns whether it was added
    pub fn insert(&mut self, tag: ReasonTag) -> bool {
        if self.0.contains(&tag) {
            return false;
        }
        self.0.push(tag);
        true
    }

    pub fn extend<I: IntoIterator<Item = ReasonTag>>(&mut self, tags: I) {
        for tag in tags {
            self.insert(tag);
        }
    }

    pub fn contains(&self, tag: ReasonTag) -> bool {
        self.0.contains(&tag)
    }

    pub fn iter(&self) -> impl Iterator<Item = ReasonTag> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[ReasonTag] {
        &self.0
    }
}

impl FromIterator<ReasonTag> for TagSet {
    fn from_iter<I: IntoIterator<Item = ReasonTag>>(iter: I) -> Self {
        let mut set = TagSet::new();
        set.extend(iter);
        set
    }
}

impl<'a> IntoIterator for &'a TagSet {
    type Item = &'a ReasonTag;
    type IntoIter = std::slice::Iter<'a, ReasonTag>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Tag → executability level lookup, defaults plus configured overrides
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutabilityTable {
    levels: HashMap<ReasonTag, Executability>,
}

impl ExecutabilityTable {
    pub fn with_overrides(overrides: &HashMap<ReasonTag, Executability>) -> Self {
        let levels = ReasonTag::ALL
            .iter()
            .map(|tag| {
                let level = overrides
                    .get(tag)
                    .copied()
                    .unwrap_or_else(|| tag.default_executability());
                (*tag, level)
            })
            .collect();
        Self { levels }
    }

    pub fn level(&self, tag: ReasonTag) -> Executability {
        self.levels
            .get(&tag)
            .copied()
            .unwrap_or_else(|| tag.default_executability())
    }

    /// Most restrictive level among the given tags (ALLOW when empty)
    pub fn strictest<'a, I>(&self, tags: I) -> Executability
    where
        I: IntoIterator<Item = &'a ReasonTag>,
    {
        tags.into_iter()
            .map(|tag| self.level(*tag))
            .max()
            .unwrap_or(Executability::Allow)
    }
}

impl Default for ExecutabilityTable {
    fn default() -> Self {
        Self::with_overrides(&HashMap::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_tag_parses_back() {
        for tag in ReasonTag::ALL {
            assert_eq!(tag.as_str().parse::<ReasonTag>().unwrap(), *tag);
            let json = serde_json::to_string(tag).unwrap();
            assert_eq!(json, format!("\"{}\"", tag.as_str()));
        }
        assert!("LIQUIDATION".parse::<ReasonTag>().is_err());
    }

    #[test]
    fn test_tag_set_keeps_first_insertion_order() {
        let mut tags = TagSet::new();
        assert!(tags.insert(ReasonTag::ActiveMarket));
        assert!(tags.insert(ReasonTag::FundingNoise));
        assert!(!tags.insert(ReasonTag::ActiveMarket));
        assert_eq!(tags.as_slice(), &[ReasonTag::ActiveMarket, ReasonTag::FundingNoise]);
    }

    #[test]
    fn test_strictest_level() {
        let table = ExecutabilityTable::default();
        let tags = [ReasonTag::ActiveMarket, ReasonTag::FundingNoise];
        assert_eq!(table.strictest(&tags), Executability::Degrade);

        let tags = [ReasonTag::FundingNoise, ReasonTag::MinIntervalBlock];
        assert_eq!(table.strictest(&tags), Executability::Block);
        assert_eq!(table.strictest(&[] as &[ReasonTag]), Executability::Allow);
    }

    #[test]
    fn test_overrides_replace_defaults() {
        let mut overrides = HashMap::new();
        overrides.insert(ReasonTag::FundingNoise, Executability::Block);
        let table = ExecutabilityTable::with_overrides(&overrides);
        assert_eq!(table.level(ReasonTag::FundingNoise), Executability::Block);
        assert_eq!(table.level(ReasonTag::WeakRangeSignal), Executability::Degrade);
    }
}
