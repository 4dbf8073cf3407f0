//! Hive CLI - run workloads against a supervised agent pool.

mod sink;
mod workload;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use hive_agent::CommandExecutor;
use hive_core::{CommitmentStatus, Events, FanoutSink, HiveConfig, ItemId, ItemStatus, TaskId, TracingSink};
use hive_supervisor::{ShutdownReport, Supervisor};
use hive_verify::CommitmentVerifier;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::sink::JsonLinesSink;
use crate::workload::Workload;

#[derive(Parser)]
#[command(name = "hive")]
#[command(about = "Claim-based multi-agent work orchestration", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workload to completion
    Run {
        /// Configuration file (JSON)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Workload file (JSON)
        #[arg(long)]
        workload: PathBuf,
        /// Write every event to this JSON-lines file
        #[arg(long)]
        events: Option<PathBuf>,
        /// Give up waiting for the pool after this many seconds
        #[arg(long, default_value = "3600")]
        timeout_secs: u64,
    },
    /// Check a configuration file
    Validate {
        /// Configuration file (JSON)
        #[arg(long)]
        config: PathBuf,
    },
    /// Verify an output against a workload item's commitments
    Verify {
        /// Workload file (JSON)
        #[arg(long)]
        workload: PathBuf,
        /// Item index, counting across queues in file order
        #[arg(long)]
        item: usize,
        /// File holding the output to check
        #[arg(long)]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, workload, events, timeout_secs } => {
            run(config.as_deref(), &workload, events.as_deref(), Duration::from_secs(timeout_secs)).await
        }
        Commands::Validate { config } => {
            let config = load_config(Some(&config))?;
            println!("Configuration OK");
            println!("  Agents: {}..{}", config.pool.min_agents, config.pool.max_agents);
            println!("  Pool budget: {} tokens", config.pool.token_budget);
            println!("  Agent budget: {} tokens", config.agent.token_budget);
            println!("  Max attempts: {}", config.queue.max_attempts);
            Ok(())
        }
        Commands::Verify { workload, item, output } => verify(&workload, item, &output).await,
    }
}

fn load_config(path: Option<&Path>) -> Result<HiveConfig> {
    match path {
        Some(path) => {
            HiveConfig::from_file(path).with_context(|| format!("invalid configuration {}", path.display()))
        }
        None => Ok(HiveConfig::default()),
    }
}

async fn run(config: Option<&Path>, workload: &Path, events: Option<&Path>, timeout: Duration) -> Result<()> {
    let config = load_config(config)?;
    let workload = Workload::from_file(workload)?;

    if config.executor.program.is_empty() {
        bail!("executor.program is not configured");
    }
    let executor = Arc::new(CommandExecutor::new(config.executor.program.clone(), config.executor.args.clone()));

    let log = events.map(JsonLinesSink::create).transpose()?.map(Arc::new);
    let mut fanout = FanoutSink::new().with(Arc::new(TracingSink));
    if let Some(log) = &log {
        fanout = fanout.with(log.clone());
    }
    let events: Events = Arc::new(fanout);

    let mut supervisor = Supervisor::new(config.clone(), executor, events);
    if let Some(profile) = workload.profile.clone() {
        supervisor = supervisor.with_profile(profile);
    }
    let pool = supervisor.start();

    let task_id = TaskId::new();
    let mut total = 0;
    for queue in &workload.queues {
        let handle = pool.add_queue(queue.spec(&config.queue, task_id)).await?;
        for item in &queue.items {
            pool.enqueue(handle.id(), item.request(workload.profile.as_ref())).await?;
            total += 1;
        }
    }
    info!(queues = workload.queues.len(), items = total, "workload enqueued");

    if let Err(err) = pool.wait_drained(timeout).await {
        warn!(error = %err, "stopping before the workload finished");
    }
    let report = pool.shutdown().await?;

    if let Some(log) = &log {
        log.flush()?;
    }
    print_summary(&report);

    if report.snapshot.live_items() > 0 {
        bail!("{} items did not finish", report.snapshot.live_items());
    }
    Ok(())
}

fn print_summary(report: &ShutdownReport) {
    println!("Queues");
    for queue in &report.snapshot.queues {
        println!(
            "  {} (priority {}) | completed {} | dead-lettered {} | unfinished {}",
            queue.name,
            queue.priority,
            queue.depth.completed,
            queue.depth.dead_lettered,
            queue.depth.live(),
        );
    }

    println!("Agents ({})", report.exits.len());
    for exit in &report.exits {
        println!(
            "  {} | {} | {} tokens | {} operations",
            exit.agent, exit.reason, exit.usage.tokens, exit.usage.operations
        );
    }
    println!(
        "Pool tokens: {} used, {} remaining",
        report.snapshot.tokens_used, report.snapshot.tokens_remaining
    );

    if !report.dead_letters.is_empty() {
        println!("Dead letters ({})", report.dead_letters.len());
        for item in &report.dead_letters {
            println!(
                "  {} | {} attempts | {}",
                item.id,
                item.attempts,
                item.last_error.as_deref().unwrap_or("no reason recorded")
            );
        }
    }

    let unfinished: Vec<_> = report.items.iter().filter(|i| !i.is_terminal()).collect();
    if !unfinished.is_empty() {
        println!("Unfinished ({})", unfinished.len());
        for item in unfinished {
            let status = if item.status == ItemStatus::Pending { "pending" } else { "held" };
            println!("  {} | {} | {} attempts", item.id, status, item.attempts);
        }
    }
}

async fn verify(workload: &Path, index: usize, output: &Path) -> Result<()> {
    let workload = Workload::from_file(workload)?;
    let item = workload
        .items()
        .nth(index)
        .with_context(|| format!("workload has no item {}", index))?;
    let output = std::fs::read_to_string(output)
        .with_context(|| format!("failed to read output {}", output.display()))?;

    let mut commitments = item.commitments.clone();
    if let Some(profile) = &workload.profile {
        commitments.extend(profile.default_commitments.iter().cloned());
    }

    let verdict = CommitmentVerifier::default()
        .verify_output(ItemId::new(), &commitments, &output)
        .await;

    for result in &verdict.results {
        let mark = match result.status {
            CommitmentStatus::Passed => "PASS",
            CommitmentStatus::Failed => "FAIL",
            CommitmentStatus::Pending => "SKIP",
        };
        match &result.detail {
            Some(detail) => println!("  {} {} - {}", mark, result.description, detail),
            None => println!("  {} {}", mark, result.description),
        }
    }

    if !verdict.passed() {
        bail!("{} of {} commitments failed", verdict.failures().count(), verdict.results.len());
    }
    println!("All {} commitments passed", verdict.results.len());
    Ok(())
}
