// Example: Dual-Horizon Advisory
// Feeds a short tick history through both engines and prints the advisories

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use common::{EngineConfig, Metric, PercentFormat, ReconciliationPolicy, Sample, Window};
use signal_generation::{AdvisoryEngine, AdvisoryStore, DualHorizonEngine, InMemoryAdvisoryStore};

fn tick(minutes: i64, drift: f64) -> Sample {
    let at = Utc.with_ymd_and_hms(2024, 6, 3, 14, 0, 0).unwrap() + Duration::minutes(minutes);
    Sample::new("BTCUSDT", at)
        .with_format(PercentFormat::ScaledBy100)
        .with_price(67000.0 * (1.0 + drift / 100.0))
        .with_open_interest(8.2e9)
        .with_funding_rate(0.0001)
        .with_volume(180.0, Some(120.0))
        .with_metric(Metric::PriceChange, Window::M5, 0.25 * drift.signum())
        .with_metric(Metric::OiChange, Window::M5, 0.3)
        .with_metric(Metric::Imbalance, Window::M5, 0.35 * drift.signum())
        .with_metric(Metric::PriceChange, Window::M15, 0.6 * drift.signum())
        .with_metric(Metric::OiChange, Window::M15, 0.9)
        .with_metric(Metric::Imbalance, Window::M15, 0.3 * drift.signum())
        .with_metric(Metric::PriceChange, Window::H1, drift)
        .with_metric(Metric::OiChange, Window::H1, 1.5)
        .with_metric(Metric::Imbalance, Window::H1, 0.25 * drift.signum())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_max_level(tracing::Level::WARN).init();

    println!("=== Advisory Engine - Dual-Horizon Example ===\n");

    let store = Arc::new(InMemoryAdvisoryStore::new());
    let engine = AdvisoryEngine::new(EngineConfig::default()).with_sink(store.clone());

    println!("Single horizon (15m / 1h):");
    for (minutes, drift) in [(0, 2.0), (2, 2.0), (12, -2.0), (40, -2.2)] {
        let evaluation = engine.process(&tick(minutes, drift)).await?;
        let advisory = &evaluation.advisory;
        println!(
            "  t+{:>2}m  {:<8} {:<6} {:<13} executable={}",
            minutes, advisory.decision, advisory.confidence, advisory.execution_permission, advisory.executable
        );
        let reasons: Vec<&str> = advisory.reasons.iter().map(|t| t.as_str()).collect();
        println!("         reasons: {}", reasons.join(", "));
    }

    let stats = store.stats().await?;
    println!("\nStored {} advisories ({} executable)\n", stats.total_advisories, stats.executable_advisories);

    println!("Dual horizon (5m/15m vs 1h/6h, 6h missing):");
    let dual = DualHorizonEngine::new(EngineConfig::default()).with_policy(ReconciliationPolicy::FollowHigherConfidence);
    let result = dual.process(&tick(0, 2.0)).await?;
    for evaluation in [&result.short, &result.medium] {
        let advisory = &evaluation.advisory;
        println!(
            "  {:<6} {:<8} {:<6} {:<13} executable={}",
            advisory.horizon, advisory.decision, advisory.confidence, advisory.execution_permission, advisory.executable
        );
        for stage in evaluation.trace.entries() {
            println!("         {:?} {:?}: {}", stage.stage, stage.status, stage.message);
        }
    }
    println!(
        "  alignment {:?} -> {} ({})",
        result.alignment, result.reconciliation.action, result.reconciliation.rationale
    );

    println!("\n{}", serde_json::to_string_pretty(&result.reconciliation)?);

    Ok(())
}
