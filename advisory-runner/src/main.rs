//! Advisory Runner CLI
//!
//! Replays JSONL market samples through the advisory engine and prints one
//! JSON line per advisory (or dual-horizon result) to stdout. Logs go to stderr.
//!
//! Usage:
//!   advisory-runner --input samples.jsonl
//!   advisory-runner --config advisor.toml --mode dual --input - < samples.jsonl
//!   advisory-runner --write-template advisor.toml

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use common::config::create_config_template;
use common::{load_config, DualHorizonResult, EngineConfig, Evaluation, Sample};
use signal_generation::{AdvisoryEngine, AdvisorySink, DualHorizonEngine};
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt;

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Standard 15m/1h horizon
    Single,
    /// Short (5m/15m) and medium (1h/6h) horizons, reconciled
    Dual,
}

#[derive(Parser, Debug)]
#[command(name = "advisory-runner")]
#[command(about = "Replay market samples through the advisory engine")]
struct Args {
    /// Path to TOML configuration (built-in defaults when omitted)
    #[arg(long, env = "ADVISOR_CONFIG")]
    config: Option<PathBuf>,

    /// JSONL sample file, or `-` for stdin
    #[arg(long, default_value = "-")]
    input: String,

    #[arg(long, value_enum, default_value_t = Mode::Single)]
    mode: Mode,

    /// Write the default configuration to this path and exit
    #[arg(long)]
    write_template: Option<PathBuf>,

    /// Debug-level logging
    #[arg(long, default_value = "false")]
    verbose: bool,
}

/// Prints every published result as one JSON line
struct StdoutSink;

impl StdoutSink {
    fn emit<T: serde::Serialize>(&self, value: &T) -> Result<()> {
        let line = serde_json::to_string(value)?;
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        writeln!(out, "{}", line)?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl AdvisorySink for StdoutSink {
    async fn publish(&self, evaluation: &Evaluation) -> Result<()> {
        self.emit(evaluation)
    }

    async fn publish_dual(&self, result: &DualHorizonResult) -> Result<()> {
        self.emit(result)
    }
}

enum Output {
    Single(Evaluation),
    Dual(DualHorizonResult),
}

impl Output {
    fn executable(&self) -> bool {
        match self {
            Output::Single(evaluation) => evaluation.advisory.executable,
            Output::Dual(result) => result.reconciliation.executable,
        }
    }
}

fn read_samples(input: &str) -> Result<Vec<Sample>> {
    let reader: Box<dyn BufRead> = if input == "-" {
        Box::new(BufReader::new(std::io::stdin()))
    } else {
        let file = std::fs::File::open(input).with_context(|| format!("Failed to open {}", input))?;
        Box::new(BufReader::new(file))
    };

    let mut samples = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read line {}", index + 1))?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Sample>(line) {
            Ok(sample) => samples.push(sample),
            Err(e) => warn!("Skipping malformed sample on line {}: {}", index + 1, e),
        }
    }
    Ok(samples)
}

/// Per-symbol series in timestamp order
fn group_by_symbol(samples: Vec<Sample>) -> BTreeMap<String, Vec<Sample>> {
    let mut grouped: BTreeMap<String, Vec<Sample>> = BTreeMap::new();
    for sample in samples {
        grouped.entry(sample.symbol.clone()).or_default().push(sample);
    }
    for series in grouped.values_mut() {
        series.sort_by_key(|s| s.timestamp);
    }
    grouped
}

/// Engine selected by `--mode`, shared by every symbol worker
#[derive(Clone)]
enum Evaluator {
    Single(Arc<AdvisoryEngine>),
    Dual(Arc<DualHorizonEngine>),
}

impl Evaluator {
    fn for_mode(mode: Mode, config: EngineConfig) -> Self {
        match mode {
            Mode::Single => Evaluator::Single(Arc::new(AdvisoryEngine::new(config))),
            Mode::Dual => Evaluator::Dual(Arc::new(DualHorizonEngine::new(config))),
        }
    }

    fn evaluate(&self, sample: &Sample) -> Output {
        match self {
            Evaluator::Single(engine) => Output::Single(engine.evaluate(sample)),
            Evaluator::Dual(engine) => Output::Dual(engine.evaluate(sample)),
        }
    }
}

async fn run(mode: Mode, config: EngineConfig, grouped: BTreeMap<String, Vec<Sample>>) -> Result<Vec<Output>> {
    let evaluator = Evaluator::for_mode(mode, config);

    // Symbols in parallel, each symbol's series in order
    let mut handles = Vec::new();
    for (symbol, series) in grouped {
        let evaluator = evaluator.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            let outputs: Vec<Output> = series.iter().map(|sample| evaluator.evaluate(sample)).collect();
            (symbol, outputs)
        }));
    }

    let mut outputs = Vec::new();
    for handle in handles {
        let (symbol, symbol_outputs) = handle.await.context("Symbol worker failed")?;
        info!(symbol = %symbol, advisories = symbol_outputs.len(), "Symbol replay complete");
        outputs.extend(symbol_outputs);
    }
    Ok(outputs)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    fmt().with_max_level(level).with_writer(std::io::stderr).init();

    if let Some(path) = &args.write_template {
        create_config_template(path)?;
        info!("Wrote default configuration to {}", path.display());
        return Ok(());
    }

    // Configuration errors are fatal
    let config = match &args.config {
        Some(path) => load_config(path).with_context(|| format!("Invalid configuration {}", path.display()))?,
        None => EngineConfig::default(),
    };
    info!(mode = ?args.mode, policy = %config.reconciliation, "Starting advisory replay");

    let samples = read_samples(&args.input)?;
    let total = samples.len();
    let grouped = group_by_symbol(samples);
    let symbols = grouped.len();

    let outputs = run(args.mode, config, grouped).await?;

    let sink = StdoutSink;
    let mut executable = 0usize;
    for output in &outputs {
        if output.executable() {
            executable += 1;
        }
        let published = match output {
            Output::Single(evaluation) => sink.publish(evaluation).await,
            Output::Dual(result) => sink.publish_dual(result).await,
        };
        if let Err(e) = published {
            warn!("Failed to publish result: {}", e);
        }
    }

    info!(
        samples = total,
        symbols,
        executable,
        "Replay finished"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    #[test]
    fn test_group_by_symbol_sorts_series() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let samples = vec![
            Sample::new("ETHUSDT", at + Duration::minutes(5)).with_price(3000.0),
            Sample::new("BTCUSDT", at).with_price(64000.0),
            Sample::new("ETHUSDT", at).with_price(2990.0),
        ];
        let grouped = group_by_symbol(samples);
        assert_eq!(grouped.len(), 2);
        let eth = &grouped["ETHUSDT"];
        assert_eq!(eth[0].timestamp, at);
        assert_eq!(eth[1].price, Some(3000.0));
    }

    #[tokio::test]
    async fn test_run_emits_one_output_per_sample() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let samples = vec![
            Sample::new("BTCUSDT", at).with_price(64000.0),
            Sample::new("BTCUSDT", at + Duration::minutes(1)).with_price(64100.0),
            Sample::new("ETHUSDT", at).with_price(3000.0),
        ];
        let outputs = run(Mode::Dual, EngineConfig::default(), group_by_symbol(samples))
            .await
            .unwrap();
        assert_eq!(outputs.len(), 3);
        assert!(outputs.iter().all(|o| matches!(o, Output::Dual(_))));
        assert!(outputs.iter().all(|o| !o.executable()));
    }

    #[test]
    fn test_mode_builds_only_its_engine() {
        assert!(matches!(
            Evaluator::for_mode(Mode::Single, EngineConfig::default()),
            Evaluator::Single(_)
        ));
        assert!(matches!(
            Evaluator::for_mode(Mode::Dual, EngineConfig::default()),
            Evaluator::Dual(_)
        ));
    }
}
