//! eventline - CLI for the on-device event pipeline
//!
//! This tool provides commands for:
//! - Inspecting pipeline configuration and store contents
//! - Emitting events from JSON files or stdin
//! - Forcing a sync, sweeping retention, and requeueing failed batches
//! - Running the sync and retention timers until interrupted
//!
//! Uses XDG Base Directory specification for file locations:
//! - Database: $XDG_DATA_HOME/eventline/<database_name>.db
//! - Logs: $XDG_STATE_HOME/eventline/eventline.YYYY-MM-DD.log
//! - Config: $XDG_CONFIG_HOME/eventline/config.toml

mod process_lock;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use eventline_core::{BatchStatus, Config, Event, Pipeline, SyncReport};
use process_lock::RunnerLock;
use std::io::Read;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "eventline")]
#[command(about = "Durable, privacy-filtered event pipeline")]
#[command(version)]
struct Args {
    /// Config file (default: $XDG_CONFIG_HOME/eventline/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show pipeline configuration and store statistics
    Status,

    /// Store events read as JSON (one event object or an array)
    Emit {
        /// Read from this file instead of stdin
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Deliver all pending batches now, ignoring retry backoff
    Sync,

    /// Delete delivered batches older than the retention window
    Sweep,

    /// List batches
    Batches {
        /// Only batches with this status (pending, sending, complete, failed)
        #[arg(short, long)]
        status: Option<BatchStatus>,
    },

    /// Return a failed batch to pending with a fresh retry budget
    Requeue {
        /// Batch ID
        batch_id: String,
    },

    /// Print an aggregate, or list aggregates of a type
    Aggregate {
        /// Aggregate ID (e.g. impressions_2024-01-31)
        id: Option<String>,

        /// List all aggregates of this type instead
        #[arg(short = 't', long = "type")]
        aggregate_type: Option<String>,
    },

    /// Run the sync and retention timers until Ctrl+C
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => Config::load().context("failed to load configuration")?,
    };

    let _log_guard =
        eventline_core::logging::init(&config.logging).context("failed to initialize logging")?;

    match args.command {
        Command::Status => cmd_status(&config),
        Command::Emit { file } => cmd_emit(&config, file).await,
        Command::Sync => cmd_sync(&config).await,
        Command::Sweep => cmd_sweep(&config),
        Command::Batches { status } => cmd_batches(&config, status),
        Command::Requeue { batch_id } => cmd_requeue(&config, &batch_id),
        Command::Aggregate { id, aggregate_type } => {
            cmd_aggregate(&config, id.as_deref(), aggregate_type.as_deref())
        }
        Command::Run => cmd_run(&config).await,
    }
}

fn open_pipeline(config: &Config) -> Result<Pipeline> {
    Pipeline::open(config)
        .with_context(|| format!("failed to open pipeline at {}", config.database_path().display()))
}

fn cmd_status(config: &Config) -> Result<()> {
    let pipeline_config = &config.pipeline;

    println!("Event Pipeline Configuration");
    println!("============================");
    println!();
    println!("Database:        {}", config.database_path().display());
    println!(
        "Mode:            {}",
        if pipeline_config.is_batched() {
            "batched"
        } else {
            "immediate"
        }
    );
    println!(
        "Endpoint:        {}",
        pipeline_config.api_endpoint.as_deref().unwrap_or("<not set>")
    );
    println!(
        "API Key:         {}",
        if pipeline_config.api_key.is_some() {
            "<set>"
        } else {
            "<not set>"
        }
    );
    println!("Privacy Mode:    {}", pipeline_config.privacy_mode.as_str());
    println!("Batch Size:      {}", pipeline_config.batch_size);
    println!("Sync Interval:   {}s", pipeline_config.sync_interval);
    println!("Max Retries:     {}", pipeline_config.max_retries);
    println!("Retention:       {} days", pipeline_config.retention_days);

    let pipeline = open_pipeline(config)?;
    let stats = pipeline.stats()?;

    println!();
    println!("Store");
    println!("-----");
    println!("Events:          {}", stats.total_events);
    println!("Unbatched:       {}", stats.unbatched_events);
    println!("Pending:         {}", stats.pending_batches);
    println!("Sending:         {}", stats.sending_batches);
    println!("Complete:        {}", stats.complete_batches);
    println!("Failed:          {}", stats.failed_batches);
    println!("Aggregates:      {}", stats.aggregates);
    println!("Size:            {} bytes", stats.database_size_bytes);

    if stats.failed_batches > 0 {
        println!();
        println!(
            "{} batch(es) failed. Run 'batches --status failed' to inspect.",
            stats.failed_batches
        );
    }

    Ok(())
}

async fn cmd_emit(config: &Config, file: Option<PathBuf>) -> Result<()> {
    let input = match &file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("failed to read stdin")?;
            buf
        }
    };

    let events = parse_events(&input)?;
    let submitted = events.len();

    let pipeline = open_pipeline(config)?;
    let ids = pipeline.store_events(events).await;

    for id in &ids {
        println!("{}", id);
    }
    println!("Accepted {} of {} event(s)", ids.len(), submitted);

    tracing::info!(submitted, accepted = ids.len(), "Events emitted from CLI");
    Ok(())
}

/// Accept either a single event object or an array of events
fn parse_events(input: &str) -> Result<Vec<Event>> {
    let value: serde_json::Value =
        serde_json::from_str(input).context("input is not valid JSON")?;

    let events = match value {
        serde_json::Value::Array(items) => items
            .into_iter()
            .map(serde_json::from_value)
            .collect::<std::result::Result<Vec<Event>, _>>()
            .context("invalid event in array")?,
        other => vec![serde_json::from_value(other).context("invalid event")?],
    };

    Ok(events)
}

async fn cmd_sync(config: &Config) -> Result<()> {
    if !config.pipeline.is_batched() {
        println!("No api_endpoint configured; nothing is queued in immediate mode.");
        return Ok(());
    }

    let _lock = RunnerLock::acquire(&config.database_path())
        .context("refusing to sync while 'eventline run' owns this database")?;

    let pipeline = open_pipeline(config)?;
    let recovered = pipeline.recover_in_flight()?;
    if recovered > 0 {
        println!("Recovered {} interrupted batch(es)", recovered);
    }

    let report = pipeline.force_sync().await.context("sync failed")?;
    print_sync_report(&report);
    Ok(())
}

fn print_sync_report(report: &SyncReport) {
    println!("Sync complete:");
    println!("  Batches attempted: {}", report.batches_attempted);
    println!("  Completed:         {}", report.batches_completed);
    println!("  Retrying:          {}", report.batches_retrying);
    println!("  Failed:            {}", report.batches_failed);
    println!("  Interrupted:       {}", report.batches_interrupted);
    println!("  Events delivered:  {}", report.events_delivered);
}

fn cmd_sweep(config: &Config) -> Result<()> {
    let pipeline = open_pipeline(config)?;
    let deleted = pipeline.sweep_retention().context("retention sweep failed")?;
    println!(
        "Deleted {} delivered batch(es) older than {} days",
        deleted, config.pipeline.retention_days
    );
    Ok(())
}

fn cmd_batches(config: &Config, status: Option<BatchStatus>) -> Result<()> {
    let pipeline = open_pipeline(config)?;
    let batches = pipeline.list_batches(status)?;

    if batches.is_empty() {
        println!("No batches found.");
        return Ok(());
    }

    println!(
        "{:<38} {:>9} {:>7} {:>8} {:>20}",
        "Batch ID", "Status", "Events", "Attempts", "Created"
    );
    println!("{:-<86}", "");

    for batch in &batches {
        println!(
            "{:<38} {:>9} {:>7} {:>8} {:>20}",
            batch.batch_id,
            batch.status,
            batch.event_ids.len(),
            batch.attempts,
            batch.created_at.format("%Y-%m-%d %H:%M:%S")
        );
        if let Some(error) = &batch.last_error {
            println!("    last error: {}", error);
        }
    }

    Ok(())
}

fn cmd_requeue(config: &Config, batch_id: &str) -> Result<()> {
    let pipeline = open_pipeline(config)?;
    let batch = pipeline
        .requeue_batch(batch_id)
        .with_context(|| format!("failed to requeue batch {}", batch_id))?;
    println!(
        "Requeued batch {} ({} event(s))",
        batch.batch_id,
        batch.event_ids.len()
    );
    Ok(())
}

fn cmd_aggregate(config: &Config, id: Option<&str>, aggregate_type: Option<&str>) -> Result<()> {
    let pipeline = open_pipeline(config)?;

    match (id, aggregate_type) {
        (Some(id), _) => {
            let value: Option<serde_json::Value> = pipeline.get_aggregate_data(id)?;
            match value {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                None => bail!("aggregate not found: {}", id),
            }
        }
        (None, aggregate_type) => {
            let aggregates = pipeline.aggregates().list(aggregate_type)?;
            if aggregates.is_empty() {
                println!("No aggregates found.");
            }
            for aggregate in aggregates {
                println!(
                    "{:<40} {:<20} {}",
                    aggregate.id,
                    aggregate.aggregate_type,
                    aggregate.last_updated.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
    }

    Ok(())
}

async fn cmd_run(config: &Config) -> Result<()> {
    let _lock = RunnerLock::acquire(&config.database_path())
        .context("failed to start: another 'eventline run' or 'eventline sync' owns this database")?;

    let mut pipeline = open_pipeline(config)?;
    pipeline.start().context("failed to start pipeline timers")?;

    println!(
        "Pipeline running ({} mode, sync every {}s). Press Ctrl+C to stop.",
        if pipeline.is_batched() {
            "batched"
        } else {
            "immediate"
        },
        config.pipeline.sync_interval
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;

    eprintln!("\nShutting down...");
    pipeline.close().await;
    println!("Pipeline stopped.");
    Ok(())
}
