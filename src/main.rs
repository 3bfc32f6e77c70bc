//! ChainSight: EVTX triage CLI
//!
//! Runs SIGMA-style detection and chain correlation over a batch of
//! decoded Windows Event Log records (NDJSON, one record per line) and
//! writes matches, statistics and correlated chains as JSON.

use anyhow::{Context, Result};
use chainsight::config::AppConfig;
use chainsight::correlation::{Correlator, CorrelatorConfig};
use chainsight::matcher::Matcher;
use chainsight::models::{assign_ids, LogEntry};
use chainsight::proctree::build_process_tree;
use chainsight::rules::load_rules_dir;
use clap::{Parser, Subcommand};
use serde_json::json;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_appender::rolling;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser)]
#[command(name = "chainsight")]
#[command(about = "EVTX triage: SIGMA detection and correlation chains", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Override logging level (e.g., error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Match rules against decoded events and correlate chains
    Analyze {
        /// Decoded events, NDJSON (one LogEntry JSON object per line)
        #[arg(long, value_name = "FILE")]
        events: PathBuf,
        /// Rules directory (overrides configuration)
        #[arg(long, value_name = "DIR")]
        rules: Option<PathBuf>,
        /// Output file; stdout when omitted
        #[arg(long, value_name = "FILE")]
        out: Option<PathBuf>,
        /// Include per-chain process trees in the output
        #[arg(long)]
        trees: bool,
    },
    /// Validate that every rule file in a directory loads
    ValidateRules {
        /// Rules directory (overrides configuration)
        #[arg(long, value_name = "DIR")]
        rules: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::new().context("Failed to load configuration")?;
    let _guard = init_logging(&config, cli.log_level.as_deref())?;

    match cli.command {
        Commands::Analyze {
            events,
            rules,
            out,
            trees,
        } => run_analyze(&config, &events, rules.as_deref(), out.as_deref(), trees),
        Commands::ValidateRules { rules } => run_validate(&config, rules.as_deref()),
    }
}

/// Installs the fmt subscriber: console layer plus a daily-rolling file.
fn init_logging(
    config: &AppConfig,
    override_level: Option<&str>,
) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    let level = override_level.unwrap_or(&config.logging.level).to_string();
    let file_appender = rolling::daily(&config.logging.directory, &config.logging.filename);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_filter(EnvFilter::new(level.clone()));
    let console_layer = config.logging.console_output.then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(EnvFilter::new(level))
    });

    tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .init();

    Ok(guard)
}

fn run_analyze(
    config: &AppConfig,
    events_path: &Path,
    rules_override: Option<&Path>,
    out: Option<&Path>,
    trees: bool,
) -> Result<()> {
    let rules_dir = rules_override.unwrap_or(&config.rules.path);
    let loaded = load_rules_dir(rules_dir)?;
    if loaded.rules.is_empty() {
        warn!("No rules loaded from {:?}; matching will be empty", rules_dir);
    }

    let mut events = read_events(events_path)?;
    assign_ids(&mut events);
    info!(
        events = events.len(),
        rules = loaded.rules.len(),
        "Starting analysis"
    );

    let matcher = Matcher::new(loaded.rules);
    let results = matcher.match_all(&events);
    let stats = results.stats();

    let correlator = Correlator::new(CorrelatorConfig {
        window_ms: config.correlation.window_seconds as i64 * 1000,
    });
    let mut on_progress = |current: usize, total: usize| {
        info!(current, total, "Correlation checkpoint");
    };
    let chains = correlator.correlate(&events, &results, Some(&mut on_progress));

    info!(
        matches = stats.total_matches,
        chains = chains.len(),
        "Analysis finished"
    );

    let forests: Option<Vec<serde_json::Value>> = trees.then(|| {
        chains
            .iter()
            .map(|chain| {
                json!({
                    "chainId": chain.id,
                    "forest": build_process_tree(chain, &events),
                })
            })
            .collect()
    });

    let output = json!({
        "stats": stats,
        "matches": results.by_rule,
        "chains": chains,
        "processTrees": forests,
    });

    write_output(out, &output)
}

fn run_validate(config: &AppConfig, rules_override: Option<&Path>) -> Result<()> {
    let rules_dir = rules_override.unwrap_or(&config.rules.path);
    let loaded = load_rules_dir(rules_dir)?;

    println!("Loaded {} rule(s)", loaded.rules.len());
    for (path, err) in &loaded.failed {
        println!("FAILED {}: {}", path, err);
    }
    if !loaded.failed.is_empty() {
        anyhow::bail!("{} rule file(s) failed to load", loaded.failed.len());
    }
    Ok(())
}

/// Reads NDJSON events; a malformed line is logged and skipped, never
/// fatal.
fn read_events(path: &Path) -> Result<Vec<LogEntry>> {
    let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    let reader = BufReader::new(file);

    let mut events = Vec::new();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read line {}", line_no + 1))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<LogEntry>(&line) {
            Ok(event) => events.push(event),
            Err(e) => {
                warn!(line = line_no + 1, error = %e, "Skipping malformed event line");
            }
        }
    }
    Ok(events)
}

fn write_output(out: Option<&Path>, output: &serde_json::Value) -> Result<()> {
    let rendered = serde_json::to_string_pretty(output).context("Failed to serialize output")?;
    match out {
        Some(path) => {
            let mut file =
                File::create(path).with_context(|| format!("Failed to create {:?}", path))?;
            writeln!(file, "{}", rendered)?;
            info!("Results written to {:?}", path);
        }
        None => println!("{}", rendered),
    }
    Ok(())
}
