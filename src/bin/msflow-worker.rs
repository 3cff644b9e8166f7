//! msflow queue worker
//!
//! Pulls workflow jobs from the distributed queue and executes them.
//!
//! # Usage
//!
//! ```bash
//! # Work until interrupted
//! msflow-worker --config /etc/msflow/config.toml
//!
//! # Drain the queue, then exit
//! msflow-worker --burst
//! ```

use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use msflow::config::ConfigManager;
use msflow::queue::worker::QueueWorker;
use msflow::queue::QueueManager;
use msflow::utils::logging::init_logging;

/// Execute queued msflow workflows
#[derive(Parser, Debug)]
#[command(name = "msflow-worker")]
#[command(version)]
#[command(about = "Executes workflow jobs from the msflow queue")]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "MSFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Worker name shown in queue statistics
    #[arg(long)]
    name: Option<String>,

    /// Exit when the queue is empty
    #[arg(long)]
    burst: bool,

    /// Emit JSON log records
    #[arg(long)]
    json_logs: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let manager = ConfigManager::load(args.config.as_deref()).await?;
    let config = manager.config().clone();
    let _guard = init_logging(
        args.verbose,
        args.json_logs,
        config.log_dir.as_deref(),
        "msflow-worker.log",
    )?;

    let validation = manager.validate();
    if !validation.is_valid {
        bail!("Invalid configuration: {}", validation.errors.join("; "));
    }

    let queue = Arc::new(QueueManager::connect(&config).await);
    if !queue.is_available() {
        bail!("No reachable queue backend; configure [redis] or REDIS_URL");
    }

    let mut worker = QueueWorker::new(Arc::clone(&queue), config)?.burst(args.burst);
    if let Some(name) = &args.name {
        worker = worker.with_name(name);
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested, finishing the current job");
            flag.store(true, Ordering::Relaxed);
        }
    });

    let handled = worker.run(shutdown).await?;
    tracing::info!("Worker {} stopped after {} jobs", worker.name(), handled);

    if let Some(factory) = queue.factory() {
        factory.close().await;
    }
    Ok(())
}
