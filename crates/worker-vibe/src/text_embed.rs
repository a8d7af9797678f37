//! Real-time text embedding over a Redis Streams consumer group.
//!
//! Consumes request entries, generates embeddings, writes each response to a
//! request-scoped list key, then acknowledges the entry — response and ack
//! travel in one pipeline so callers never observe an ack without a queued
//! response. Delivery is at-least-once: entries orphaned by crashed
//! consumers are auto-claimed after an idle window.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use audioscope_core::config::VibeWorkerConfig;
use audioscope_core::jobs::{TextEmbedRequest, TextEmbedResponse};
use audioscope_core::queue::{QueueClient, StreamEntry};
use audioscope_core::vibe::{MODEL_VERSION, ModelHandle};

use crate::TEXT_EMBED_STREAM;

const CLAIM_CHECK_INTERVAL: Duration = Duration::from_secs(5);

pub struct TextEmbedResponder {
    queue: QueueClient,
    model: Arc<ModelHandle>,
    config: Arc<VibeWorkerConfig>,
    consumer_name: String,
    shutdown: Arc<AtomicBool>,
}

impl TextEmbedResponder {
    pub fn new(
        queue: QueueClient,
        model: Arc<ModelHandle>,
        config: Arc<VibeWorkerConfig>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        // Process-unique consumer name so replicas never collide.
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let consumer_name = format!(
            "{}-{}-{}",
            config.text_embed_consumer_prefix,
            std::process::id(),
            &suffix[..8]
        );
        Self {
            queue,
            model,
            config,
            consumer_name,
            shutdown,
        }
    }

    pub async fn run(self) {
        if let Err(e) = self
            .queue
            .ensure_group(TEXT_EMBED_STREAM, &self.config.text_embed_group)
            .await
        {
            error!(error = %e, "Failed to create text embed consumer group");
        }

        info!(
            stream = TEXT_EMBED_STREAM,
            group = %self.config.text_embed_group,
            consumer = %self.consumer_name,
            "Text embed consumer ready"
        );

        let mut last_claim_check = Instant::now() - CLAIM_CHECK_INTERVAL;

        while !self.shutdown.load(Ordering::SeqCst) {
            if last_claim_check.elapsed() >= CLAIM_CHECK_INTERVAL {
                self.claim_stale_entries().await;
                last_claim_check = Instant::now();
            }

            match self
                .queue
                .read_group_one(
                    TEXT_EMBED_STREAM,
                    &self.config.text_embed_group,
                    &self.consumer_name,
                    Duration::from_secs(1),
                )
                .await
            {
                Ok(Some(entry)) => self.handle_entry(entry).await,
                Ok(None) => {}
                Err(e) => {
                    error!(error = %e, "Text embed read failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }

        info!("Text embed responder stopped");
    }

    /// Recover requests left pending by crashed consumers.
    async fn claim_stale_entries(&self) {
        match self
            .queue
            .auto_claim(
                TEXT_EMBED_STREAM,
                &self.config.text_embed_group,
                &self.consumer_name,
                self.config.claim_idle_ms,
                self.config.claim_batch,
            )
            .await
        {
            Ok(entries) => {
                if !entries.is_empty() {
                    info!(count = entries.len(), "Claimed stale text embed request(s)");
                }
                for entry in entries {
                    self.handle_entry(entry).await;
                }
            }
            Err(e) => warn!(error = %e, "Auto-claim of stale text embed requests failed"),
        }
    }

    async fn handle_entry(&self, entry: StreamEntry) {
        let Some(request) = TextEmbedRequest::from_fields(
            entry.field("requestId"),
            entry.field("text"),
            entry.field("responseKey"),
        ) else {
            warn!(entry_id = %entry.id, "Text embed request missing requestId; dropping");
            if let Err(e) = self
                .queue
                .ack(TEXT_EMBED_STREAM, &self.config.text_embed_group, &entry.id)
                .await
            {
                warn!(error = %e, "Failed to ack invalid text embed request");
            }
            return;
        };

        info!(request_id = %request.request_id, "Processing text embed request");

        let model = self.model.clone();
        let text = request.text.clone();
        let encode_result = tokio::task::spawn_blocking(move || model.encode_text(&text)).await;

        let response = match encode_result {
            Ok(Ok(embedding)) => {
                TextEmbedResponse::ok(request.request_id.clone(), embedding, MODEL_VERSION)
            }
            Ok(Err(e)) => TextEmbedResponse::failed(
                request.request_id.clone(),
                MODEL_VERSION,
                format!("{:#}", e),
            ),
            Err(join_error) => TextEmbedResponse::failed(
                request.request_id.clone(),
                MODEL_VERSION,
                format!("Embedding task failed: {}", join_error),
            ),
        };

        let payload = match serde_json::to_string(&response) {
            Ok(p) => p,
            Err(e) => {
                error!(error = %e, "Failed to serialize text embed response");
                return;
            }
        };

        if let Err(e) = self
            .queue
            .publish_response(
                &request.response_key,
                &payload,
                self.config.response_ttl_secs,
                TEXT_EMBED_STREAM,
                &self.config.text_embed_group,
                &entry.id,
            )
            .await
        {
            error!(
                error = %e,
                request_id = %request.request_id,
                "Failed to publish text embed response"
            );
            return;
        }

        info!(request_id = %request.request_id, success = response.success, "Text embed response sent");
    }
}
