//! Vibe embedding worker.
//!
//! Consumes audio-embedding jobs from the Redis queue, generates
//! 512-dimensional vibe embeddings, and persists them to Postgres. Also runs
//! the synchronous text-embedding responder (Redis Streams consumer group)
//! and a control-channel listener.

mod control;
mod text_embed;
mod worker;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use audioscope_core::config::{DatabaseConfig, ModelConfig, RedisConfig, VibeWorkerConfig};
use audioscope_core::observability::{init_logging, shutdown_signal};
use audioscope_core::queue::QueueClient;
use audioscope_core::store::Store;
use audioscope_core::vibe::{MODEL_VERSION, ModelHandle};

pub(crate) const VIBE_QUEUE: &str = "audio:vibe:queue";
pub(crate) const HEARTBEAT_KEY: &str = "vibe:worker:heartbeat";
pub(crate) const CONTROL_CHANNEL: &str = "audio:vibe:control";
pub(crate) const TEXT_EMBED_STREAM: &str = "audio:text:embed:requests";

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_logging()?;

    let redis_config = RedisConfig::from_env()?;
    let db_config = DatabaseConfig::from_env()?;
    let config = Arc::new(VibeWorkerConfig::from_env()?);
    let model_config = Arc::new(ModelConfig::from_env()?);

    info!(
        model_version = MODEL_VERSION,
        music_path = %config.music_path,
        num_workers = config.num_workers,
        sleep_interval_secs = config.sleep_interval.as_secs(),
        model_idle_timeout_secs = model_config.idle_timeout.as_secs(),
        "Starting vibe embedding worker"
    );

    let queue = QueueClient::connect(&redis_config).await?;
    let store = Store::connect(&db_config).await?;

    // One model instance shared across all workers; encodes serialize under
    // its mutex.
    let model = ModelHandle::spectral();
    if let Err(e) = tokio::task::block_in_place(|| model.ensure_loaded()) {
        warn!(error = %e, "Initial model load failed; will retry on first job");
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let mut tasks = Vec::new();

    for worker_id in 0..config.num_workers {
        let worker = worker::VibeWorker::new(
            worker_id,
            queue.clone(),
            store.clone(),
            model.clone(),
            config.clone(),
            model_config.clone(),
            shutdown.clone(),
        );
        tasks.push(tokio::spawn(worker.run()));
        info!(worker_id, "Started embedding worker");
    }

    let responder = text_embed::TextEmbedResponder::new(
        queue.clone(),
        model.clone(),
        config.clone(),
        shutdown.clone(),
    );
    tasks.push(tokio::spawn(responder.run()));
    info!("Started text embed responder");

    tasks.push(tokio::spawn(control::run_control_listener(
        queue.clone(),
        shutdown.clone(),
    )));

    tasks.push(tokio::spawn(idle_monitor(
        queue.clone(),
        store.clone(),
        model.clone(),
        config.clone(),
        model_config.clone(),
        shutdown.clone(),
    )));

    shutdown_signal().await;
    info!("Shutdown signal received, stopping workers...");
    shutdown.store(true, Ordering::SeqCst);

    // Allow in-flight work to complete, capped at 10 seconds.
    let drain = async {
        for task in tasks {
            let _ = task.await;
        }
    };
    if tokio::time::timeout(Duration::from_secs(10), drain).await.is_err() {
        warn!("Shutdown drain timed out; some tasks were still running");
    }

    info!("Vibe embedding worker stopped");
    Ok(())
}

/// Unload the model when no work is pending.
///
/// Two triggers: the idle timeout, or (sooner) every track with a file path
/// already has an embedding and the queue is empty.
async fn idle_monitor(
    queue: QueueClient,
    store: Store,
    model: Arc<ModelHandle>,
    config: Arc<VibeWorkerConfig>,
    model_config: Arc<ModelConfig>,
    shutdown: Arc<AtomicBool>,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(5));
    while !shutdown.load(Ordering::SeqCst) {
        ticker.tick().await;
        if !model.is_loaded() {
            continue;
        }

        let idle = model.idle_for();
        if idle >= model_config.idle_timeout && !model_config.idle_timeout.is_zero() {
            model.unload();
            info!(
                idle_secs = idle.as_secs(),
                "Model idle past timeout, unloaded to free memory (will reload when work arrives)"
            );
            continue;
        }

        if idle >= config.sleep_interval * 2 {
            let remaining = match store.count_missing_embeddings().await {
                Ok(n) => n,
                Err(e) => {
                    warn!(error = %e, "Idle check failed");
                    continue;
                }
            };
            let queue_len = match queue.queue_len(VIBE_QUEUE).await {
                Ok(n) => n,
                Err(e) => {
                    warn!(error = %e, "Idle queue check failed");
                    continue;
                }
            };
            if remaining == 0 && queue_len == 0 {
                model.unload();
                info!("All tracks have embeddings, model unloaded (will reload when work arrives)");
            }
        }
    }
}
