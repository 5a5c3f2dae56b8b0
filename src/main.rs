//! Parlance - Spoken-Submission Analysis Coordinator
//!
//! Runs the coordinator over an in-process bus with simulated stage workers.
//!
//! # Usage
//!
//! ```bash
//! # Push 20 submissions through the pipeline with 10% worker failures
//! parlance run --submissions 20 --failure-rate 0.1
//!
//! # Same, without touching disk
//! parlance run --in-memory
//!
//! # Inspect the tracker left in the data directory
//! parlance status --data-dir ./data
//! ```
//!
//! # Environment Variables
//!
//! - `PARLANCE_CONFIG`: Path to a TOML config file (default: `./parlance.toml`)
//! - `PARLANCE_LOG_FORMAT`: Set to "json" for JSON log lines
//! - `RUST_LOG`: Logging level (default: info)

use anyhow::{Context, Result};
use clap::Parser;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use parlance::background::TimeoutSweeper;
use parlance::bus::{publish_json, InMemoryBus, MessageBus};
use parlance::config::PipelineConfig;
use parlance::pipeline::{subscribe_coordinator, CoordinatorSettings, PipelineCoordinator};
use parlance::simulation::{spawn_workers, WorkerBehavior};
use parlance::storage::{SledTracker, SubmissionTracker};
use parlance::types::{topics, CompletionResult, OverallStatus, Submission};

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "parlance")]
#[command(about = "Spoken-submission analysis coordinator")]
#[command(version)]
struct CliArgs {
    /// Path to the TOML config file
    #[arg(long, global = true, env = "PARLANCE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: SubCommand,
}

#[derive(clap::Subcommand, Debug)]
enum SubCommand {
    /// Run the coordinator with simulated workers until every submission finishes
    Run {
        /// Number of synthetic submissions to publish
        #[arg(long, default_value = "10")]
        submissions: usize,

        /// Probability that a simulated stage attempt fails (0.0 - 1.0)
        #[arg(long, default_value = "0.0")]
        failure_rate: f64,

        /// Override the tracker data directory
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Keep tracker state in memory only
        #[arg(long)]
        in_memory: bool,
    },
    /// Print tracker statistics
    Status {
        /// Override the tracker data directory
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

// ============================================================================
// Task Names
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum TaskName {
    TimeoutSweeper,
    Intake,
}

impl std::fmt::Display for TaskName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskName::TimeoutSweeper => write!(f, "TimeoutSweeper"),
            TaskName::Intake => write!(f, "Intake"),
        }
    }
}

// ============================================================================
// Logging
// ============================================================================

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let json = std::env::var("PARLANCE_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

// ============================================================================
// Tracker
// ============================================================================

fn open_tracker(config: &PipelineConfig, in_memory: bool) -> Result<SubmissionTracker> {
    let tracker = if in_memory {
        SubmissionTracker::in_memory()
    } else {
        let data_dir = &config.storage.data_dir;
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("creating data directory {}", data_dir.display()))?;
        let sled = SledTracker::open(config.storage.tracker_path())
            .context("opening submission tracker")?;
        SubmissionTracker::new(Arc::new(sled))
    };
    Ok(tracker.with_max_cas_retries(config.storage.max_cas_retries))
}

// ============================================================================
// Tasks
// ============================================================================

/// Distinct submission ids that have a published completion.
fn finished_ids(bus: &InMemoryBus) -> HashSet<String> {
    bus.published_payloads::<CompletionResult>(topics::SUBMISSION_COMPLETED)
        .into_iter()
        .map(|c| c.submission_id)
        .collect()
}

/// Publish `count` synthetic submissions, then wait for all of them to finish.
fn spawn_intake(
    task_set: &mut JoinSet<Result<TaskName>>,
    bus: Arc<InMemoryBus>,
    count: usize,
    cancel_token: CancellationToken,
) {
    task_set.spawn(async move {
        let run_id = uuid::Uuid::new_v4().simple().to_string();
        for n in 0..count {
            let id = format!("{}-{n:04}", &run_id[..8]);
            let audio = (1..=1 + n % 3)
                .map(|take| format!("https://cdn.parlance.local/{id}/take-{take}.wav"))
                .collect();
            publish_json(bus.as_ref(), topics::SUBMISSION_CREATED, &Submission::new(id, audio))
                .await
                .context("publishing submission.created")?;
        }
        info!("[Intake] Published {} submissions", count);

        let mut progress = tokio::time::interval(Duration::from_secs(5));
        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    info!("[Intake] Shutdown before all submissions finished");
                    return Ok(TaskName::Intake);
                }
                _ = progress.tick() => {
                    info!("[Intake] {}/{} submissions finished", finished_ids(&bus).len(), count);
                }
                _ = bus.wait_for(topics::SUBMISSION_COMPLETED, count, Duration::from_millis(200)) => {
                    if finished_ids(&bus).len() >= count {
                        info!("[Intake] All {} submissions finished", count);
                        cancel_token.cancel();
                        return Ok(TaskName::Intake);
                    }
                }
            }
        }
    });
}

fn spawn_sweeper(
    task_set: &mut JoinSet<Result<TaskName>>,
    sweeper: TimeoutSweeper,
    cancel_token: CancellationToken,
) {
    task_set.spawn(async move {
        sweeper.run(cancel_token).await;
        Ok(TaskName::TimeoutSweeper)
    });
}

/// Run the supervisor loop: monitor tasks, cancel everything on failure.
async fn run_supervisor(
    task_set: &mut JoinSet<Result<TaskName>>,
    cancel_token: CancellationToken,
) -> Result<()> {
    info!("Supervisor: all tasks spawned, monitoring...");

    while let Some(result) = task_set.join_next().await {
        match result {
            Ok(Ok(task_name)) => {
                info!("Supervisor: task {} completed", task_name);
            }
            Ok(Err(e)) => {
                error!("Supervisor: task failed with error: {:#}", e);
                cancel_token.cancel();
                return Err(e);
            }
            Err(e) => {
                error!("Supervisor: task panicked: {}", e);
                cancel_token.cancel();
                return Err(anyhow::anyhow!("Task panicked: {}", e));
            }
        }
    }

    info!("Supervisor: all tasks completed");
    Ok(())
}

// ============================================================================
// Subcommands
// ============================================================================

async fn run(
    config: PipelineConfig,
    submissions: usize,
    failure_rate: f64,
    in_memory: bool,
) -> Result<()> {
    let tracker = open_tracker(&config, in_memory)?;
    let bus = Arc::new(InMemoryBus::new(config.bus.clone()));
    let bus_handle: Arc<dyn MessageBus> = bus.clone();

    let coordinator = Arc::new(PipelineCoordinator::new(
        tracker.clone(),
        Arc::clone(&bus_handle),
        CoordinatorSettings::from(&config),
    ));
    subscribe_coordinator(bus_handle.as_ref(), &coordinator)
        .await
        .context("subscribing coordinator")?;
    let behavior = Arc::new(WorkerBehavior::new(failure_rate));
    spawn_workers(Arc::clone(&bus_handle), Arc::clone(&behavior))
        .await
        .context("starting simulated workers")?;

    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received Ctrl+C, initiating shutdown...");
        shutdown_token.cancel();
    });

    let mut task_set: JoinSet<Result<TaskName>> = JoinSet::new();
    spawn_sweeper(
        &mut task_set,
        TimeoutSweeper::new(Arc::clone(&coordinator), &config),
        cancel_token.clone(),
    );
    spawn_intake(&mut task_set, Arc::clone(&bus), submissions, cancel_token.clone());

    let outcome = run_supervisor(&mut task_set, cancel_token).await;

    bus.shutdown().await;
    if let Err(e) = tracker.flush() {
        warn!(error = %e, "Tracker flush on shutdown failed");
    }

    let completions = bus.published_payloads::<CompletionResult>(topics::SUBMISSION_COMPLETED);
    let failed = completions
        .iter()
        .filter(|c| c.overall_status == OverallStatus::Failed)
        .count();
    let stats = coordinator.stats();
    info!(
        completions = completions.len(),
        failed,
        dispatched = stats.stages_dispatched,
        retries = stats.retries,
        timeouts = stats.timeouts,
        duplicates = stats.duplicates,
        stale = stats.stale_events,
        dead_letters = bus.dead_letters().len(),
        worker_answers = behavior.handled(),
        "Run finished"
    );
    println!("{}", serde_json::to_string_pretty(&stats)?);

    outcome
}

fn status(config: &PipelineConfig) -> Result<()> {
    let path = config.storage.tracker_path();
    if !path.exists() {
        anyhow::bail!("no tracker database at {}", path.display());
    }
    let sled = Arc::new(SledTracker::open(&path).context("opening submission tracker")?);
    let size_bytes = sled.size_bytes();
    let tracker = SubmissionTracker::new(sled);

    let stats = tracker.stats()?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    println!("database size: {} bytes", size_bytes);
    for entry in tracker.active()? {
        println!(
            "{}  {:?}  updated {}",
            entry.state.id(),
            entry.state.overall_status,
            entry.updated_at.to_rfc3339()
        );
    }
    Ok(())
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let args = CliArgs::parse();

    let mut config = PipelineConfig::load(args.config.as_deref());

    match args.command {
        SubCommand::Run {
            submissions,
            failure_rate,
            data_dir,
            in_memory,
        } => {
            if let Some(dir) = data_dir {
                config.storage.data_dir = dir;
            }
            if !(0.0..=1.0).contains(&failure_rate) {
                anyhow::bail!("--failure-rate must be between 0.0 and 1.0");
            }
            run(config, submissions, failure_rate, in_memory).await
        }
        SubCommand::Status { data_dir } => {
            if let Some(dir) = data_dir {
                config.storage.data_dir = dir;
            }
            status(&config)
        }
    }
}
