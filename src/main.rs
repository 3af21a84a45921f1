//! mediaq server: priority job scheduler for media retrieval.
//!
//! Reads one request per line on stdin and writes one JSON response per
//! line on stdout:
//!
//! - a JSON job spec enqueues a job
//! - `cancel <job_id>` cancels a job
//! - `status <job_id>` prints a job record
//! - `progress <job_id>` prints the job's progress summary
//! - `stats` prints scheduler statistics
//!
//! On end of input the server waits for outstanding jobs, then shuts down.
//! Ctrl+C or SIGTERM shuts down at once.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{EnvFilter, fmt};

use mediaq_core::config::SchedulerConfig;
use mediaq_core::{AppError, JobId};
use mediaq_entity::JobSpec;
use mediaq_worker::jobs::CommandJobHandler;
use mediaq_worker::{MemoryJobStore, Scheduler};

/// Command-line arguments.
#[derive(Debug, Parser)]
#[command(name = "mediaq-server", version, about = "Priority job scheduler for media retrieval")]
struct Args {
    /// Configuration file; overrides `config/default.toml` + `config/<env>.toml`
    #[arg(short, long)]
    config: Option<String>,

    /// Environment overlay to load from `config/<env>.toml`
    #[arg(short, long, default_value = "development")]
    env: String,

    /// Cancel running jobs on shutdown instead of letting them finish
    #[arg(long)]
    no_drain: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match load_configuration(&args) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    init_logging(&config);

    if let Err(e) = run(config, !args.no_drain).await {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }
}

/// Load configuration from file and environment
fn load_configuration(args: &Args) -> Result<SchedulerConfig, AppError> {
    match &args.config {
        Some(path) => SchedulerConfig::load_file(path),
        None => SchedulerConfig::load(&args.env),
    }
}

/// Initialize tracing/logging
fn init_logging(config: &SchedulerConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format.as_str() {
        "json" => {
            fmt()
                .json()
                .with_env_filter(filter)
                .with_target(true)
                .with_thread_ids(true)
                .with_writer(std::io::stderr)
                .init();
        }
        _ => {
            fmt()
                .pretty()
                .with_env_filter(filter)
                .with_target(true)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

/// Main server run function
async fn run(config: SchedulerConfig, drain: bool) -> Result<(), AppError> {
    tracing::info!("Starting mediaq v{}", env!("CARGO_PKG_VERSION"));
    let poll_interval = config.worker.poll_interval();

    let store = Arc::new(MemoryJobStore::new());
    let scheduler = Scheduler::builder(config)
        .handler(Arc::new(CommandJobHandler::new()))
        .store(store.clone())
        .start()?;

    let restored = scheduler.restore(store.as_ref()).await?;
    if restored > 0 {
        tracing::info!("Recovered {} job(s) from the job store", restored);
    }

    tokio::select! {
        result = serve_stdin(&scheduler, poll_interval) => result?,
        _ = shutdown_signal() => {
            tracing::info!("Shutdown signal received, starting graceful shutdown...");
        }
    }

    let report = scheduler.shutdown(drain).await;
    tracing::info!(
        "Server stopped (force_cancelled={}, left_queued={}, left_retrying={})",
        report.force_cancelled,
        report.left_queued,
        report.left_retrying
    );
    Ok(())
}

/// Handle requests from stdin until it closes, then wait for outstanding
/// jobs.
async fn serve_stdin(scheduler: &Scheduler, poll_interval: Duration) -> Result<(), AppError> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| AppError::internal(format!("Failed to read stdin: {e}")))?
    {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let response = match handle_request(scheduler, line).await {
            Ok(value) => value,
            Err(e) => json!({ "error": { "kind": e.kind, "message": e.message } }),
        };
        println!("{response}");
    }

    tracing::info!("Input closed, waiting for outstanding jobs");
    loop {
        let stats = scheduler.stats().await;
        let outstanding: usize = ["pending", "queued", "running", "retrying"]
            .iter()
            .filter_map(|status| stats.queue.by_status.get(*status))
            .sum();
        if outstanding == 0 {
            return Ok(());
        }
        tokio::time::sleep(poll_interval).await;
    }
}

async fn handle_request(scheduler: &Scheduler, line: &str) -> Result<Value, AppError> {
    if line.starts_with('{') {
        let spec: JobSpec = serde_json::from_str(line)
            .map_err(|e| AppError::invalid_spec(format!("Malformed job spec: {e}")))?;
        let job_id = scheduler.enqueue(spec).await?;
        return Ok(json!({ "job_id": job_id }));
    }

    let (command, arg) = line.split_once(' ').unwrap_or((line, ""));
    match command {
        "stats" => Ok(serde_json::to_value(scheduler.stats().await)?),
        "cancel" => {
            let job_id = parse_job_id(arg)?;
            let cancelled = scheduler.cancel(job_id).await?;
            Ok(json!({ "job_id": job_id, "cancelled": cancelled }))
        }
        "status" => Ok(serde_json::to_value(scheduler.status(parse_job_id(arg)?).await?)?),
        "progress" => Ok(serde_json::to_value(scheduler.progress(parse_job_id(arg)?)?)?),
        other => Err(AppError::invalid_spec(format!("Unknown command '{other}'"))),
    }
}

fn parse_job_id(raw: &str) -> Result<JobId, AppError> {
    raw.trim()
        .parse()
        .map_err(|_| AppError::invalid_spec(format!("Invalid job id '{}'", raw.trim())))
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
