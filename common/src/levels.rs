//! Closed level types shared by every pipeline stage.
//!
//! Configuration strings are parsed into these variants once at startup;
//! there is no fallback for an unrecognized name.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A string did not name any variant of the expected level type
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unrecognized {kind} '{value}'")]
pub struct ParseLevelError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseLevelError {
    pub fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

macro_rules! string_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.pad(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseLevelError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(ParseLevelError::new($kind, other)),
                }
            }
        }
    };
}

/// Advisory direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Long,
    Short,
    NoTrade,
}

string_enum!(Decision, "decision", {
    Long => "LONG",
    Short => "SHORT",
    NoTrade => "NO_TRADE",
});

impl Decision {
    pub fn is_directional(self) -> bool {
        !matches!(self, Decision::NoTrade)
    }

    pub fn opposite(self) -> Decision {
        match self {
            Decision::Long => Decision::Short,
            Decision::Short => Decision::Long,
            Decision::NoTrade => Decision::NoTrade,
        }
    }
}

/// Discrete confidence, totally ordered LOW < MEDIUM < HIGH < ULTRA
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfidenceLevel {
    Low,
    Medium,
    High,
    Ultra,
}

string_enum!(ConfidenceLevel, "confidence level", {
    Low => "LOW",
    Medium => "MEDIUM",
    High => "HIGH",
    Ultra => "ULTRA",
});

impl ConfidenceLevel {
    pub const TOP: ConfidenceLevel = ConfidenceLevel::Ultra;

    /// One level up, saturating at ULTRA
    pub fn raised(self) -> ConfidenceLevel {
        match self {
            ConfidenceLevel::Low => ConfidenceLevel::Medium,
            ConfidenceLevel::Medium => ConfidenceLevel::High,
            ConfidenceLevel::High | ConfidenceLevel::Ultra => ConfidenceLevel::Ultra,
        }
    }
}

/// Market regime classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Regime {
    Trend,
    Range,
    Extreme,
}

string_enum!(Regime, "regime", {
    Trend => "TREND",
    Range => "RANGE",
    Extreme => "EXTREME",
});

/// Opportunity quality grade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Quality {
    Good,
    Uncertain,
    Poor,
}

string_enum!(Quality, "quality", {
    Good => "GOOD",
    Uncertain => "UNCERTAIN",
    Poor => "POOR",
});

/// Tri-state execution verdict derived from reason tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionPermission {
    Allow,
    AllowReduced,
    Deny,
}

string_enum!(ExecutionPermission, "execution permission", {
    Allow => "ALLOW",
    AllowReduced => "ALLOW_REDUCED",
    Deny => "DENY",
});

/// How strongly a reason tag restricts execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Executability {
    /// Informational only
    Allow,
    /// Execution permitted on the reduced path
    Degrade,
    /// Execution vetoed regardless of confidence
    Block,
}

string_enum!(Executability, "executability level", {
    Allow => "ALLOW",
    Degrade => "DEGRADE",
    Block => "BLOCK",
});

/// Which pipeline produced an advisory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HorizonLabel {
    Standard,
    Short,
    Medium,
}

string_enum!(HorizonLabel, "horizon", {
    Standard => "STANDARD",
    Short => "SHORT",
    Medium => "MEDIUM",
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confidence_is_totally_ordered() {
        assert!(ConfidenceLevel::Low < ConfidenceLevel::Medium);
        assert!(ConfidenceLevel::Medium < ConfidenceLevel::High);
        assert!(ConfidenceLevel::High < ConfidenceLevel::Ultra);
        assert_eq!(ConfidenceLevel::High.raised(), ConfidenceLevel::Ultra);
        assert_eq!(ConfidenceLevel::Ultra.raised(), ConfidenceLevel::Ultra);
    }

    #[test]
    fn test_strict_parsing() {
        assert_eq!("HIGH".parse::<ConfidenceLevel>().unwrap(), ConfidenceLevel::High);
        assert!("high".parse::<ConfidenceLevel>().is_err());
        assert!("MEDIUM_HIGH".parse::<ConfidenceLevel>().is_err());
        assert_eq!("ALLOW_REDUCED".parse::<ExecutionPermission>().unwrap(), ExecutionPermission::AllowReduced);

        let err = "SAFE".parse::<Executability>().unwrap_err();
        assert_eq!(err.kind, "executability level");
        assert_eq!(err.to_string(), "unrecognized executability level 'SAFE'");
    }

    #[test]
    fn test_serde_matches_display() {
        let json = serde_json::to_string(&Decision::NoTrade).unwrap();
        assert_eq!(json, "\"NO_TRADE\"");
        let permission: ExecutionPermission = serde_json::from_str("\"ALLOW_REDUCED\"").unwrap();
        assert_eq!(permission.to_string(), "ALLOW_REDUCED");
    }
}
