//! Queue worker that processes audio files and stores vibe embeddings.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use tracing::{error, info, warn};

use audioscope_core::audio::{load_audio_window, middle_offset, probe_duration};
use audioscope_core::config::{ModelConfig, VibeWorkerConfig};
use audioscope_core::errors::JobError;
use audioscope_core::jobs::VibeJob;
use audioscope_core::paths::resolve_track_path;
use audioscope_core::queue::QueueClient;
use audioscope_core::store::{FAILURE_ENTITY_AUDIO, Store, TrackStatus};
use audioscope_core::vibe::{MODEL_VERSION, ModelHandle};

use crate::{HEARTBEAT_KEY, VIBE_QUEUE};

pub struct VibeWorker {
    worker_id: usize,
    queue: QueueClient,
    store: Store,
    model: Arc<ModelHandle>,
    config: Arc<VibeWorkerConfig>,
    model_config: Arc<ModelConfig>,
    shutdown: Arc<AtomicBool>,
    http: reqwest::Client,
}

impl VibeWorker {
    pub fn new(
        worker_id: usize,
        queue: QueueClient,
        store: Store,
        model: Arc<ModelHandle>,
        config: Arc<VibeWorkerConfig>,
        model_config: Arc<ModelConfig>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("failed to build HTTP client");
        Self {
            worker_id,
            queue,
            store,
            model,
            config,
            model_config,
            shutdown,
            http,
        }
    }

    pub async fn run(self) {
        info!(worker_id = self.worker_id, "Embedding worker loop starting");

        while !self.shutdown.load(Ordering::SeqCst) {
            self.queue.set_heartbeat(HEARTBEAT_KEY).await;

            if let Err(e) = self.process_one().await {
                // Infra errors (queue/DB unreachable) back off and retry;
                // the pool and connection manager handle reconnection.
                error!(worker_id = self.worker_id, error = %e, "Worker iteration failed");
                tokio::time::sleep(self.config.sleep_interval).await;
            }
        }

        info!(worker_id = self.worker_id, "Embedding worker stopped");
    }

    /// Pop and process a single job. Job-level failures are persisted here;
    /// only infrastructure errors propagate.
    async fn process_one(&self) -> Result<()> {
        let Some(payload) = self
            .queue
            .blocking_pop(VIBE_QUEUE, self.config.sleep_interval)
            .await?
        else {
            return Ok(());
        };

        let job: VibeJob = match serde_json::from_str(&payload) {
            Ok(job) => job,
            Err(e) => {
                warn!(error = %e, payload = %payload, "Dropping malformed vibe job");
                return Ok(());
            }
        };

        info!(
            worker_id = self.worker_id,
            track_id = %job.track_id,
            "Processing track"
        );

        self.store
            .set_vibe_status(&job.track_id, TrackStatus::Processing)
            .await?;

        match self.embed(&job).await {
            Ok(embedding) => {
                self.store
                    .save_embedding(&job.track_id, &embedding, MODEL_VERSION)
                    .await?;
                self.store
                    .set_vibe_status(&job.track_id, TrackStatus::Completed)
                    .await?;
                info!(
                    worker_id = self.worker_id,
                    track_id = %job.track_id,
                    "Completed track"
                );
            }
            Err(job_error) => {
                self.mark_failed(&job.track_id, &job_error.to_string())
                    .await?;
            }
        }

        Ok(())
    }

    /// Decode the middle window and run it through the model.
    async fn embed(&self, job: &VibeJob) -> Result<Vec<f32>, JobError> {
        let full_path = resolve_track_path(&self.config.music_path, &job.file_path)?;

        let model = self.model.clone();
        let model_config = self.model_config.clone();
        let duration_hint = job.duration;

        let result = tokio::task::spawn_blocking(move || -> Result<Vec<f32>, JobError> {
            // A provided duration skips the file probe.
            let duration = match duration_hint {
                Some(d) if d > 0.0 => d,
                _ => probe_duration(&full_path)
                    .map_err(|e| JobError::from_message(format!("{:#}", e)))?,
            };

            let offset = middle_offset(duration, model_config.audio_window_secs);
            let samples = load_audio_window(
                &full_path,
                model_config.sample_rate,
                offset,
                model_config.audio_window_secs,
            )
            .map_err(|e| JobError::from_message(format!("{:#}", e)))?;

            model
                .encode_audio(&samples, model_config.sample_rate)
                .map_err(|e| JobError::from_message(format!("{:#}", e)))
        })
        .await;

        match result {
            Ok(inner) => inner,
            Err(join_error) => Err(JobError::recoverable(format!(
                "Embedding task failed: {}",
                join_error
            ))),
        }
    }

    /// Record the failure on the row and the failure table, then notify the
    /// platform backend best-effort.
    async fn mark_failed(&self, track_id: &str, error: &str) -> Result<()> {
        let retry_count = self.store.mark_vibe_failed(track_id, error).await?;
        error!(track_id, retry_count, error, "Track embedding failed");

        let context = self.store.track_context(track_id).await.unwrap_or(None);
        let track_name = context.as_ref().and_then(|c| c.title.clone());

        self.store
            .upsert_failure(
                FAILURE_ENTITY_AUDIO,
                track_id,
                track_name.as_deref(),
                error,
                serde_json::json!({
                    "filePath": context.as_ref().and_then(|c| c.file_path.clone()),
                    "errorCode": "VIBE_EMBEDDING_FAILED",
                }),
            )
            .await?;

        self.report_failure(track_id, track_name.as_deref(), error)
            .await;
        Ok(())
    }

    /// Failure reports are informational; errors are swallowed after logging.
    async fn report_failure(&self, track_id: &str, track_name: Option<&str>, error: &str) {
        let url = format!("{}/api/analysis/vibe/failure", self.config.backend_url);
        let body = serde_json::json!({
            "trackId": track_id,
            "trackName": track_name,
            "errorMessage": audioscope_core::errors::truncate_error(error),
            "errorCode": "VIBE_EMBEDDING_FAILED",
        });

        let result = self
            .http
            .post(&url)
            .header("X-Internal-Secret", &self.config.internal_api_secret)
            .json(&body)
            .send()
            .await;

        if let Err(e) = result {
            warn!(error = %e, track_id, "Failed to report failure to backend");
        }
    }
}
