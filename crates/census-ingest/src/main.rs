//! Census ingest service binary.
//!
//! Hosts the write scheduler for one process: a single `PostgreSQL` pool,
//! connection manager, and task queue, plus their background maintenance.
//!
//! # Startup Sequence
//!
//! 1. Load configuration (first CLI argument, else `CENSUS_INGEST_CONFIG`,
//!    else `census-ingest.yaml`; defaults when the file is missing)
//! 2. Initialize structured logging (tracing)
//! 3. Connect to `PostgreSQL` and start the lock sweeper and watchdog
//! 4. Log queue stats periodically until Ctrl-C
//! 5. Stop background tasks and close the pool

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use census_ingest::{IngestConfig, IngestService};
use census_types::BackgroundTask;

/// Config file used when neither an argument nor the environment names one.
const DEFAULT_CONFIG_PATH: &str = "census-ingest.yaml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Load configuration.
    let config_path = config_path();
    let file_found = config_path.exists();
    let config = if file_found {
        IngestConfig::from_file(&config_path)
            .with_context(|| format!("loading {}", config_path.display()))?
    } else {
        IngestConfig::from_env()
    };

    // 2. Initialize structured logging.
    init_logging(&config.logging.level, config.logging.json);
    info!("census-ingest starting");
    if file_found {
        info!(path = %config_path.display(), "Configuration loaded");
    } else {
        info!(path = %config_path.display(), "Config file not found, using defaults");
    }

    // 3. Connect.
    let service = IngestService::connect(&config)
        .await
        .context("connecting to PostgreSQL")?;
    service.health_check().await.context("database health check")?;
    info!(
        concurrency = service.queue().config().concurrency,
        max_connections = config.database.max_connections,
        "Database reachable"
    );

    // 4. Periodic stats until Ctrl-C.
    let queue = service.queue().clone();
    let stats = BackgroundTask::spawn_periodic(
        "queue-stats",
        Duration::from_secs(config.logging.stats_interval_secs.max(1)),
        move || {
            let stats = queue.stats();
            async move {
                info!(
                    size = stats.size,
                    pending = stats.pending,
                    in_flight = stats.in_flight,
                    active_locks = stats.active_locks,
                    "Queue stats"
                );
            }
        },
    );

    tokio::signal::ctrl_c()
        .await
        .context("listening for Ctrl-C")?;
    info!("Shutdown requested");

    // 5. Shut down.
    stats.stop().await;
    service.shutdown().await;
    info!("census-ingest stopped");
    Ok(())
}

/// Resolve the config path from the command line or the environment.
fn config_path() -> PathBuf {
    std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("CENSUS_INGEST_CONFIG").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// `RUST_LOG` wins over the configured level.
fn init_logging(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    }
}
