// Advisory Sink Interface
// Hands finished advisories to downstream persistence and API layers

use anyhow::Result;
use chrono::{DateTime, Utc};
use common::{Advisory, DualHorizonResult, Evaluation};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Receives every advisory the engine emits
#[async_trait::async_trait]
pub trait AdvisorySink: Send + Sync {
    /// Publish a single-horizon evaluation
    async fn publish(&self, evaluation: &Evaluation) -> Result<()>;

    /// Publish a dual-horizon result. Defaults to publishing both horizons.
    async fn publish_dual(&self, result: &DualHorizonResult) -> Result<()> {
        self.publish(&result.short).await?;
        self.publish(&result.medium).await
    }
}

/// A sink that can also be queried
#[async_trait::async_trait]
pub trait AdvisoryStore: AdvisorySink {
    /// Retrieve an advisory by ID
    async fn get(&self, advisory_id: Uuid) -> Result<Option<Advisory>>;

    /// Retrieve all advisories for a symbol, oldest first
    async fn get_by_symbol(&self, symbol: &str) -> Result<Vec<Advisory>>;

    /// Retrieve advisories within a time range
    async fn get_by_time_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<Advisory>>;

    /// Get store statistics
    async fn stats(&self) -> Result<SinkStats>;
}

/// Store statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SinkStats {
    pub total_advisories: usize,
    pub advisories_by_decision: HashMap<String, usize>,
    pub executable_advisories: usize,
    pub dual_results: usize,
    pub oldest_advisory: Option<DateTime<Utc>>,
    pub newest_advisory: Option<DateTime<Utc>>,
}

/// In-memory advisory store (for testing and replay)
pub struct InMemoryAdvisoryStore {
    advisories: tokio::sync::RwLock<HashMap<Uuid, Advisory>>,
    dual_results: tokio::sync::RwLock<Vec<DualHorizonResult>>,
}

impl InMemoryAdvisoryStore {
    pub fn new() -> Self {
        Self {
            advisories: tokio::sync::RwLock::new(HashMap::new()),
            dual_results: tokio::sync::RwLock::new(Vec::new()),
        }
    }

    pub async fn dual_results_for(&self, symbol: &str) -> Vec<DualHorizonResult> {
        let results = self.dual_results.read().await;
        results.iter().filter(|r| r.symbol == symbol).cloned().collect()
    }
}

impl Default for InMemoryAdvisoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl AdvisorySink for InMemoryAdvisoryStore {
    async fn publish(&self, evaluation: &Evaluation) -> Result<()> {
        let mut advisories = self.advisories.write().await;
        advisories.insert(evaluation.advisory.id, evaluation.advisory.clone());
        Ok(())
    }

    async fn publish_dual(&self, result: &DualHorizonResult) -> Result<()> {
        self.publish(&result.short).await?;
        self.publish(&result.medium).await?;
        let mut results = self.dual_results.write().await;
        results.push(result.clone());
        Ok(())
    }
}

#[async_trait::async_trait]
impl AdvisoryStore for InMemoryAdvisoryStore {
    async fn get(&self, advisory_id: Uuid) -> Result<Option<Advisory>> {
        let advisories = self.advisories.read().await;
        Ok(advisories.get(&advisory_id).cloned())
    }

    async fn get_by_symbol(&self, symbol: &str) -> Result<Vec<Advisory>> {
        let advisories = self.advisories.read().await;
        let mut symbol_advisories: Vec<Advisory> = advisories
            .values()
            .filter(|a| a.symbol == symbol)
            .cloned()
            .collect();
        symbol_advisories.sort_by_key(|a| a.timestamp);
        Ok(symbol_advisories)
    }

    async fn get_by_time_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<Advisory>> {
        let advisories = self.advisories.read().await;
        let range_advisories = advisories
            .values()
            .filter(|a| a.timestamp >= start && a.timestamp <= end)
            .cloned()
            .collect();
        Ok(range_advisories)
    }

    async fn stats(&self) -> Result<SinkStats> {
        let advisories = self.advisories.read().await;

        let mut stats = SinkStats {
            total_advisories: advisories.len(),
            dual_results: self.dual_results.read().await.len(),
            ..SinkStats::default()
        };

        for advisory in advisories.values() {
            *stats
                .advisories_by_decision
                .entry(advisory.decision.to_string())
                .or_insert(0) += 1;
            if advisory.executable {
                stats.executable_advisories += 1;
            }

            stats.oldest_advisory = Some(match stats.oldest_advisory {
                Some(oldest) => oldest.min(advisory.timestamp),
                None => advisory.timestamp,
            });
            stats.newest_advisory = Some(match stats.newest_advisory {
                Some(newest) => newest.max(advisory.timestamp),
                None => advisory.timestamp,
            });
        }

        Ok(stats)
    }
}
