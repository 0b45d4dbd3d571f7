//! Stormweaver command line runner
//!
//! Thin wrapper around stormweaver-core: loads a JSON workload config, runs
//! the Lua scripts it names and prints the run summary.
//!
//! ## Usage
//!
//! ```bash
//! # Run a workload
//! stormweaver run scenarios/bank.json
//!
//! # Override config values
//! stormweaver run scenarios/bank.json --workers 16 --seed 42 --duration-ms 60000
//!
//! # Write the outcome stream and a markdown report
//! stormweaver run scenarios/bank.json --output outcomes.jsonl --report report.md
//!
//! # Re-check the invariants of a recorded run
//! stormweaver check outcomes.jsonl --config scenarios/bank.json
//! ```
//!
//! Exit codes: 0 when the run passed, 1 when a worker failed or an invariant
//! was violated, 2 when the run could not be set up.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use stormweaver_core::logging::{write_run_metadata, JsonlLayer, RunMetadata};
use stormweaver_core::report::write_report;
use stormweaver_core::{
    evaluate, read_outcomes, Invariant, RunSummary, Scheduler, Violation, WorkloadConfig,
};
use stormweaver_scenarios::{LuaFactory, DEFAULT_INSTRUCTION_BUDGET};

/// Stormweaver - scriptable concurrent SQL workloads
#[derive(Parser)]
#[command(name = "stormweaver")]
#[command(version)]
#[command(about = "Run scripted concurrent SQL workloads and check their invariants")]
struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workload
    Run {
        /// Workload configuration (JSON)
        config: PathBuf,

        /// Number of workers
        #[arg(short, long)]
        workers: Option<usize>,

        /// Run seed
        #[arg(short, long)]
        seed: Option<u64>,

        /// Global deadline in milliseconds
        #[arg(long)]
        duration_ms: Option<u64>,

        /// Maximum steps per worker
        #[arg(long)]
        iterations: Option<u64>,

        /// Script files, replacing the ones in the config
        #[arg(long = "script")]
        scripts: Vec<PathBuf>,

        /// JSONL file receiving one record per outcome
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Write a markdown report here
        #[arg(long)]
        report: Option<PathBuf>,

        /// Instructions a single script call may execute
        #[arg(long, default_value_t = DEFAULT_INSTRUCTION_BUDGET)]
        instruction_budget: u64,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Re-check invariants over a recorded outcome stream
    Check {
        /// Outcome stream (JSONL)
        outcomes: PathBuf,

        /// Take the scripts from this workload configuration
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Script files declaring the invariants
        #[arg(long = "script")]
        scripts: Vec<PathBuf>,
    },
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli);

    let result = match cli.command {
        Commands::Run {
            config,
            workers,
            seed,
            duration_ms,
            iterations,
            scripts,
            output,
            report,
            instruction_budget,
            json,
        } => {
            let overrides = Overrides {
                workers,
                seed,
                duration_ms,
                iterations,
                scripts,
                output,
            };
            run(&config, overrides, report.as_deref(), instruction_budget, json).await
        }
        Commands::Check {
            outcomes,
            config,
            scripts,
        } => check(&outcomes, config.as_deref(), scripts),
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::from(2)
        }
    }
}

fn init_tracing(cli: &Cli) {
    let filter = match cli.verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    let stream = match &cli.command {
        Commands::Run { config, .. } => stream_name(config),
        Commands::Check { .. } => "check".to_string(),
    };

    // Optional JSONL logging next to the console output
    let jsonl = std::env::var("STORMWEAVER_LOGS_DIR")
        .ok()
        .map(|dir| JsonlLayer::new(&dir, &stream).map(|layer| (dir, layer)));

    // Built per arm: the fmt layer's type depends on the subscriber it wraps.
    macro_rules! console {
        () => {
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr)
        };
    }

    match jsonl {
        Some(Ok((dir, layer))) => {
            tracing_subscriber::registry()
                .with(layer)
                .with(console!())
                .with(filter)
                .init();
            tracing::info!(logs_dir = %dir, stream = %stream, "JSONL logging enabled");
        }
        Some(Err(e)) => {
            tracing_subscriber::registry().with(console!()).with(filter).init();
            tracing::warn!("Failed to initialize JSONL logging: {}", e);
        }
        None => {
            tracing_subscriber::registry().with(console!()).with(filter).init();
        }
    }
}

fn stream_name(config: &Path) -> String {
    config
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "stormweaver".to_string())
}

/// Command line values that replace config file values.
struct Overrides {
    workers: Option<usize>,
    seed: Option<u64>,
    duration_ms: Option<u64>,
    iterations: Option<u64>,
    scripts: Vec<PathBuf>,
    output: Option<PathBuf>,
}

/// Load a workload config; script paths are relative to the config file.
fn load_config(path: &Path) -> Result<WorkloadConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    let mut config = WorkloadConfig::from_json(&text)
        .with_context(|| format!("Invalid config {}", path.display()))?;

    let base = path.parent().unwrap_or_else(|| Path::new("."));
    config.scripts = config
        .scripts
        .iter()
        .map(|s| if s.is_relative() { base.join(s) } else { s.clone() })
        .collect();
    Ok(config)
}

async fn run(
    config_path: &Path,
    overrides: Overrides,
    report: Option<&Path>,
    instruction_budget: u64,
    json: bool,
) -> Result<bool> {
    let mut config = load_config(config_path)?;
    if let Some(workers) = overrides.workers {
        config = config.with_workers(workers);
    }
    if let Some(seed) = overrides.seed {
        config = config.with_seed(seed);
    }
    if let Some(ms) = overrides.duration_ms {
        config = config.with_duration(Duration::from_millis(ms));
    }
    if let Some(iterations) = overrides.iterations {
        config = config.with_iterations(iterations);
    }
    if !overrides.scripts.is_empty() {
        config.scripts = overrides.scripts;
    }
    if let Some(output) = overrides.output {
        config = config.with_output(output);
    }
    if config.scripts.is_empty() {
        bail!("No scripts configured; add \"scripts\" to the config or pass --script");
    }

    let factory = LuaFactory::from_paths(&config.scripts)
        .context("Failed to load scripts")?
        .with_instruction_budget(instruction_budget)
        .with_actions(config.actions.clone())
        .context("Invalid random action settings")?;

    let scheduler = Scheduler::new(config.clone()).context("Invalid workload configuration")?;

    // Ctrl+C cancels the run; workers drain within the grace period
    let cancel = scheduler.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling run");
            cancel.cancel();
        }
    });

    let summary = scheduler
        .run(Arc::new(factory.clone()))
        .await
        .context("Workload run failed")?;

    if let Ok(dir) = std::env::var("STORMWEAVER_LOGS_DIR") {
        let mut metadata = RunMetadata::new(&summary.run_id, &summary.name, summary.seed);
        metadata.started_at = summary.started_at.clone();
        metadata.workers = config.workers;
        metadata.backends = config.backends.iter().map(|b| b.name.clone()).collect();
        metadata.scripts = factory.script_names();
        if let Err(e) = write_run_metadata(&dir, &metadata) {
            tracing::warn!("Failed to write run metadata: {}", e);
        }
    }

    if let Some(path) = report {
        write_report(path, &summary)
            .with_context(|| format!("Failed to write report {}", path.display()))?;
        tracing::info!(path = %path.display(), "Report written");
    }

    for cause in summary.failure_causes() {
        tracing::warn!(kind = cause.kind(), "Run failed: {}", cause);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }

    Ok(summary.is_success())
}

fn print_summary(summary: &RunSummary) {
    println!(
        "Run {} ({}) seed={} elapsed={}ms",
        summary.run_id, summary.name, summary.seed, summary.elapsed_ms
    );
    if let Some(setup) = &summary.setup {
        println!(
            "  setup: {} actions={} errors={}",
            setup.terminal, setup.actions, setup.errors
        );
    }
    for worker in &summary.workers {
        println!(
            "  worker {} [script {}]: {} actions={} errors={}",
            worker.worker, worker.variant, worker.terminal, worker.actions, worker.errors
        );
    }
    println!("Actions: {}", summary.total_actions());
    print_violations(summary.invariants.len(), &summary.violations);
    if summary.cancelled {
        println!("Run was cancelled");
    }
    if let Some(e) = &summary.recorder_error {
        println!("Outcomes were not fully persisted: {}", e);
    }
    println!(
        "Result: {}",
        if summary.is_success() { "PASSED" } else { "FAILED" }
    );
}

fn print_violations(checked: usize, violations: &[Violation]) {
    println!("Invariants: {} checked, {} violations", checked, violations.len());
    for violation in violations {
        let refs: Vec<String> = violation.outcomes.iter().take(10).map(|r| r.to_string()).collect();
        println!(
            "  VIOLATION {}: {} [{}]",
            violation.invariant,
            violation.explanation,
            refs.join(", ")
        );
    }
}

fn check(outcomes_path: &Path, config: Option<&Path>, scripts: Vec<PathBuf>) -> Result<bool> {
    let scripts = match (config, scripts.is_empty()) {
        (_, false) => scripts,
        (Some(path), true) => load_config(path)?.scripts,
        (None, true) => Vec::new(),
    };

    let mut invariants = vec![Invariant::sequence_integrity()];
    if !scripts.is_empty() {
        let factory = LuaFactory::from_paths(&scripts).context("Failed to load scripts")?;
        invariants.extend(factory.declared_invariants()?);
    }

    let outcomes = read_outcomes(outcomes_path)
        .with_context(|| format!("Failed to read outcomes {}", outcomes_path.display()))?;
    let violations = evaluate(&invariants, &outcomes);

    println!("Outcomes: {}", outcomes.len());
    print_violations(invariants.len(), &violations);
    println!("Result: {}", if violations.is_empty() { "PASSED" } else { "FAILED" });
    Ok(violations.is_empty())
}
