//! Courier: durable background jobs for a messaging client
//!
//! Main binary with subcommands:
//! - `enqueue`: store a job for the next run
//! - `pending`: list stored jobs
//! - `cancel`: cancel a stored job before it runs again
//! - `run`: replay pending jobs and execute them until interrupted

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use courier_jobs::{
    BackoffPolicy, Dispatcher, DispatcherConfig, JobHandlers, JobId, JobKind, JobStatus,
};
use courier_store::FileJobStore;
use miette::Result;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod handlers;
mod run;

use handlers::SimulatedHandler;

#[derive(Parser)]
#[command(name = "courier")]
#[command(about = "Durable background job runner", long_about = None)]
struct Cli {
    /// Directory holding one JSON file per job
    #[arg(long, global = true, env = "COURIER_DATA_DIR", default_value = "courier-data")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a new job; it executes on the next `run`
    Enqueue {
        /// Job kind (e.g. message_send, attachment-upload)
        #[arg(long)]
        kind: JobKind,

        /// Job payload as JSON
        #[arg(long, default_value = "{}")]
        payload: String,
    },

    /// List stored jobs that have not finished
    Pending {
        /// Include succeeded, failed and canceled jobs
        #[arg(long)]
        all: bool,
    },

    /// Cancel a job so it is not executed or retried again
    Cancel {
        /// Job id as printed by `enqueue` or `pending`
        id: JobId,
    },

    /// Resume pending jobs and execute them until interrupted
    Run(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Exit after this many seconds with no job running or awaiting retry
    #[arg(long, env = "COURIER_IDLE_EXIT_SECS")]
    idle_exit_secs: Option<u64>,

    /// Base delay before the first retry, in milliseconds
    #[arg(long, env = "COURIER_BASE_DELAY_MS", default_value = "250")]
    base_delay_ms: u64,

    /// Upper bound on the exponential backoff multiplier
    #[arg(long, env = "COURIER_MAX_BACKOFF_MULTIPLIER", default_value = "600")]
    max_backoff_multiplier: u64,

    /// Scheduled retries held in memory before deferring to the next run
    #[arg(long, env = "COURIER_MAX_PENDING_RETRIES", default_value = "10000")]
    max_pending_retries: usize,

    /// Seconds a job may run before it counts as a failed attempt
    #[arg(long, env = "COURIER_JOB_TIMEOUT_SECS", default_value = "600")]
    job_timeout_secs: u64,
}

impl RunArgs {
    fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            backoff: BackoffPolicy {
                base_delay_ms: self.base_delay_ms,
                max_multiplier: self.max_backoff_multiplier,
            },
            max_pending_retries: self.max_pending_retries,
            job_timeout_secs: self.job_timeout_secs,
            ..DispatcherConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "courier=info,courier_jobs=info,courier_store=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Enqueue { kind, payload } => enqueue(&cli.data_dir, kind, &payload).await,
        Commands::Pending { all } => list_jobs(&cli.data_dir, all).await,
        Commands::Cancel { id } => cancel(&cli.data_dir, id).await,
        Commands::Run(args) => {
            let config = args.dispatcher_config();
            run::run(&cli.data_dir, config, args.idle_exit_secs).await
        }
    }
}

async fn open_store(data_dir: &Path) -> Result<Arc<FileJobStore>> {
    let store = FileJobStore::open(data_dir)
        .await
        .map_err(|e| miette::miette!("Failed to open job store: {}", e))?;
    Ok(Arc::new(store))
}

async fn enqueue(data_dir: &Path, kind: JobKind, payload: &str) -> Result<()> {
    let payload: serde_json::Value =
        serde_json::from_str(payload).map_err(|e| miette::miette!("Invalid payload: {}", e))?;

    let store = open_store(data_dir).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let dispatcher = Dispatcher::spawn(
        store,
        JobHandlers::all(Arc::new(SimulatedHandler)),
        DispatcherConfig::default(),
        shutdown_rx,
    )
    .map_err(|e| miette::miette!("{}", e))?;

    let result = dispatcher.add_without_executing(kind, payload).await;
    let _ = shutdown_tx.send(true);
    dispatcher.join().await;

    let id = result.map_err(|e| miette::miette!("Failed to enqueue job: {}", e))?;
    info!(id = %id, kind = %kind, "job stored");
    println!("{id}");
    Ok(())
}

async fn list_jobs(data_dir: &Path, all: bool) -> Result<()> {
    let store = open_store(data_dir).await?;
    let records = store
        .list()
        .await
        .map_err(|e| miette::miette!("Failed to list jobs: {}", e))?;

    for record in records
        .iter()
        .filter(|r| all || !r.status.is_terminal())
    {
        let error = record.last_error.as_deref().unwrap_or("");
        println!(
            "{}  {:<20} {:<10} {:>2}/{:<2}  {}  {}",
            record.id,
            record.kind.key(),
            record.status.to_string(),
            record.failure_count,
            record.max_failure_count,
            record.created_at.format("%Y-%m-%d %H:%M:%S"),
            error
        );
    }
    Ok(())
}

async fn cancel(data_dir: &Path, id: JobId) -> Result<()> {
    let store = open_store(data_dir).await?;
    let canceled = store
        .cancel_job(id)
        .await
        .map_err(|e| miette::miette!("Failed to cancel job: {}", e))?;

    if canceled {
        println!("canceled {id}");
        return Ok(());
    }

    match store.get(id).await {
        Ok(Some(record)) if record.status == JobStatus::Canceled => {
            println!("{id} was already canceled");
            Ok(())
        }
        Ok(Some(record)) => Err(miette::miette!("Job {} already {}", id, record.status)),
        Ok(None) => Err(miette::miette!("Job not found: {}", id)),
        Err(e) => Err(miette::miette!("Failed to read job: {}", e)),
    }
}
