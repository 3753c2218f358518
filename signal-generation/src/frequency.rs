// Frequency Control
// Per-symbol decision memory with minimum-interval and flip-cooldown debounce

use chrono::{DateTime, Duration, Utc};
use common::config::FrequencyConfig;
use common::{Decision, ReasonTag};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Last directional decision seen for a symbol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionMemory {
    pub decision: Decision,
    pub at: DateTime<Utc>,
}

/// Outcome of a debounce check. The decision itself is never changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrequencyCheck {
    pub tags: Vec<ReasonTag>,
    pub previous: Option<DecisionMemory>,
}

impl FrequencyCheck {
    pub fn is_suppressed(&self) -> bool {
        !self.tags.is_empty()
    }

    pub fn message(&self) -> String {
        match (&self.previous, self.tags.is_empty()) {
            (None, _) => "first directional decision".to_string(),
            (Some(prev), true) => format!("previous {} at {} outside cooldowns", prev.decision, prev.at),
            (Some(prev), false) => {
                let tags: Vec<&str> = self.tags.iter().map(|t| t.as_str()).collect();
                format!("suppressed by {} (previous {} at {})", tags.join(", "), prev.decision, prev.at)
            }
        }
    }
}

pub struct FrequencyController {
    min_interval: Duration,
    flip_cooldown: Duration,
    memory: DashMap<String, DecisionMemory>,
}

impl FrequencyController {
    pub fn new(config: &FrequencyConfig) -> Self {
        Self {
            min_interval: Duration::seconds(config.min_interval_secs),
            flip_cooldown: Duration::seconds(config.flip_cooldown_secs),
            memory: DashMap::new(),
        }
    }

    /// Check `decision` against the symbol's memory and record it.
    ///
    /// NO_TRADE is neither checked nor recorded. Every directional decision,
    /// suppressed or not, becomes the new memory.
    pub fn check_and_record(&self, symbol: &str, decision: Decision, at: DateTime<Utc>) -> FrequencyCheck {
        if !decision.is_directional() {
            return FrequencyCheck::default();
        }

        let current = DecisionMemory { decision, at };
        match self.memory.entry(symbol.to_string()) {
            Entry::Vacant(entry) => {
                entry.insert(current);
                debug!(symbol = %symbol, decision = %decision, "Decision memory created");
                FrequencyCheck::default()
            }
            Entry::Occupied(mut entry) => {
                let previous = *entry.get();
                let elapsed = at - previous.at;
                let mut tags = Vec::new();

                // Any directional repeat, same direction or not
                if elapsed < self.min_interval {
                    tags.push(ReasonTag::MinIntervalBlock);
                }
                if previous.decision != decision && elapsed < self.flip_cooldown {
                    tags.push(ReasonTag::FlipCooldownBlock);
                }
                entry.insert(current);

                if !tags.is_empty() {
                    info!(
                        symbol = %symbol,
                        decision = %decision,
                        previous = %previous.decision,
                        elapsed_secs = elapsed.num_seconds(),
                        "Directional decision debounced"
                    );
                }
                FrequencyCheck {
                    tags,
                    previous: Some(previous),
                }
            }
        }
    }

    pub fn memory(&self, symbol: &str) -> Option<DecisionMemory> {
        self.memory.get(symbol).map(|entry| *entry.value())
    }

    pub fn tracked_symbols(&self) -> usize {
        self.memory.len()
    }

    pub fn forget(&self, symbol: &str) -> Option<DecisionMemory> {
        self.memory.remove(symbol).map(|(_, memory)| memory)
    }
}

impl Default for FrequencyController {
    fn default() -> Self {
        Self::new(&FrequencyConfig::default())
    }
}
