//! Feature-extraction analysis worker.
//!
//! Consumes analysis jobs from the Redis queue and runs per-track feature
//! extraction on a dynamically-sized worker pool, with stale-row maintenance
//! and a pub/sub control plane (pause/resume/stop/set_workers).

mod control;
mod pool;
mod worker;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use audioscope_core::config::{AnalysisConfig, DatabaseConfig, RedisConfig};
use audioscope_core::observability::{init_logging, shutdown_signal};
use audioscope_core::queue::QueueClient;
use audioscope_core::store::Store;

pub(crate) const ANALYSIS_QUEUE: &str = "audio:analysis:queue";
pub(crate) const CONTROL_CHANNEL: &str = "audio:analysis:control";
pub(crate) const HEARTBEAT_KEY: &str = "audio:worker:heartbeat";

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_logging()?;

    let redis_config = RedisConfig::from_env()?;
    let db_config = DatabaseConfig::from_env()?;
    let config = AnalysisConfig::from_env()?;

    let queue = QueueClient::connect(&redis_config).await?;
    let store = Store::connect(&db_config).await?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let (command_tx, command_rx) = tokio::sync::mpsc::unbounded_channel();

    let control_task = tokio::spawn(control::run_control_listener(
        queue.clone(),
        command_tx,
        shutdown.clone(),
    ));

    let worker = worker::AnalysisWorker::new(
        queue.clone(),
        store.clone(),
        config,
        command_rx,
        shutdown.clone(),
    );
    let mut worker_task = tokio::spawn(worker.run());

    let worker_done = tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutdown signal received, stopping analysis worker...");
            false
        }
        _ = &mut worker_task => {
            info!("Worker loop exited (stop command)");
            true
        }
    };
    shutdown.store(true, Ordering::SeqCst);

    let drain = async {
        if !worker_done {
            let _ = worker_task.await;
        }
        let _ = control_task.await;
    };
    if tokio::time::timeout(Duration::from_secs(10), drain).await.is_err() {
        warn!("Shutdown drain timed out; some tasks were still running");
    }

    info!("Analysis worker stopped");
    Ok(())
}
