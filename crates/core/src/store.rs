//! Typed Postgres access for the track / embedding / failure tables.
//!
//! All SQL lives in query constants and goes through `query_as` with runtime
//! binding; status transitions are compare-and-set so that each resource has
//! at most one in-flight analysis at a time. Connection recovery is delegated
//! to the pool; callers treat `sqlx::Error` as transient infrastructure.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, Pool, Postgres, Row};
use tracing::instrument;
use uuid::Uuid;

use crate::analysis::TrackFeatures;
use crate::config::DatabaseConfig;
use crate::errors::truncate_error;

/// Lifecycle states for both analysis pipelines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TrackStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackStatus::Pending => "pending",
            TrackStatus::Processing => "processing",
            TrackStatus::Completed => "completed",
            TrackStatus::Failed => "failed",
        }
    }
}

/// Entity type recorded on failure rows written by the analyzers.
pub const FAILURE_ENTITY_AUDIO: &str = "audio";

/// A pending track surfaced by DB reconciliation.
#[derive(Debug, Clone, FromRow)]
pub struct PendingTrack {
    pub id: String,
    pub file_path: Option<String>,
}

/// Context attached to failure rows and failure reports.
#[derive(Debug, Clone, FromRow)]
pub struct TrackContext {
    pub title: Option<String>,
    pub file_path: Option<String>,
    pub album_id: Option<String>,
    pub artist_id: Option<String>,
}

const UPDATE_VIBE_STATUS_QUERY: &str = r#"
    UPDATE tracks SET vibe_status = $2, updated_at = now() WHERE id = $1
"#;

const MARK_VIBE_FAILED_QUERY: &str = r#"
    UPDATE tracks
    SET vibe_status = 'failed',
        vibe_error = $2,
        vibe_retry_count = vibe_retry_count + 1,
        updated_at = now()
    WHERE id = $1
    RETURNING vibe_retry_count
"#;

const UPSERT_EMBEDDING_QUERY: &str = r#"
    INSERT INTO track_embeddings (track_id, embedding, model_version, analyzed_at)
    VALUES ($1, $2, $3, $4)
    ON CONFLICT (track_id)
    DO UPDATE SET
        embedding = EXCLUDED.embedding,
        model_version = EXCLUDED.model_version,
        analyzed_at = EXCLUDED.analyzed_at
"#;

const TRACK_CONTEXT_QUERY: &str = r#"
    SELECT title, file_path, album_id, artist_id FROM tracks WHERE id = $1
"#;

const CLAIM_BATCH_QUERY: &str = r#"
    UPDATE tracks
    SET analysis_status = 'processing',
        analysis_started_at = COALESCE(analysis_started_at, now()),
        updated_at = now()
    WHERE id = ANY($1)
    AND analysis_status IN ('pending', 'processing')
    RETURNING id
"#;

const SAVE_FEATURES_QUERY: &str = r#"
    UPDATE tracks
    SET bpm = $2,
        beats_count = $3,
        key_name = $4,
        key_scale = $5,
        key_strength = $6,
        energy = $7,
        loudness = $8,
        dynamic_range = $9,
        danceability = $10,
        valence = $11,
        arousal = $12,
        instrumentalness = $13,
        acousticness = $14,
        speechiness = $15,
        mood_tags = $16,
        analysis_mode = $17,
        analysis_status = 'completed',
        analysis_started_at = NULL,
        analysis_version = $18,
        analyzed_at = now(),
        analysis_error = NULL,
        updated_at = now()
    WHERE id = $1
"#;

const MARK_ANALYSIS_FAILED_QUERY: &str = r#"
    UPDATE tracks
    SET analysis_status = 'failed',
        analysis_error = $2,
        analysis_retry_count = analysis_retry_count + 1,
        analysis_started_at = NULL,
        updated_at = now()
    WHERE id = $1
    RETURNING analysis_retry_count
"#;

const MARK_ANALYSIS_FAILED_PERMANENT_QUERY: &str = r#"
    UPDATE tracks
    SET analysis_status = 'failed',
        analysis_error = $2,
        analysis_retry_count = $3,
        analysis_started_at = NULL,
        updated_at = now()
    WHERE id = $1
    RETURNING analysis_retry_count
"#;

const UPSERT_FAILURE_QUERY: &str = r#"
    INSERT INTO enrichment_failures (
        id, entity_type, entity_id, entity_name, error_message,
        last_failed_at, retry_count, metadata
    ) VALUES ($1, $2, $3, $4, $5, now(), 1, $6)
    ON CONFLICT (entity_type, entity_id)
    DO UPDATE SET
        error_message = EXCLUDED.error_message,
        last_failed_at = now(),
        retry_count = enrichment_failures.retry_count + 1,
        metadata = EXCLUDED.metadata,
        resolved = false,
        skipped = false
"#;

const RESOLVE_FAILURES_QUERY: &str = r#"
    UPDATE enrichment_failures
    SET resolved = true, resolved_at = now()
    WHERE entity_type = $1 AND entity_id = ANY($2) AND resolved = false
"#;

const REQUEUE_PROCESSING_QUERY: &str = r#"
    UPDATE tracks
    SET analysis_status = 'pending',
        analysis_started_at = NULL,
        analysis_error = $2,
        updated_at = now()
    WHERE id = ANY($1)
    AND analysis_status = 'processing'
    RETURNING id
"#;

const RECLAIM_COMPLETED_STALE_QUERY: &str = r#"
    UPDATE tracks t
    SET analysis_status = 'completed',
        analysis_error = NULL,
        analysis_started_at = NULL,
        updated_at = now()
    FROM track_embeddings te
    WHERE t.id = te.track_id
    AND t.analysis_status = 'processing'
    AND (
        (t.analysis_started_at IS NOT NULL AND t.analysis_started_at < now() - make_interval(mins => $1))
        OR
        (t.analysis_started_at IS NULL AND t.updated_at < now() - make_interval(mins => $1))
    )
    RETURNING t.id
"#;

const RESET_STALE_PROCESSING_QUERY: &str = r#"
    UPDATE tracks t
    SET analysis_status = 'pending',
        analysis_started_at = NULL,
        analysis_retry_count = t.analysis_retry_count + 1,
        updated_at = now()
    WHERE t.analysis_status = 'processing'
    AND (
        (t.analysis_started_at IS NOT NULL AND t.analysis_started_at < now() - make_interval(mins => $1))
        OR
        (t.analysis_started_at IS NULL AND t.updated_at < now() - make_interval(mins => $1))
    )
    AND t.analysis_retry_count < $2
    AND NOT EXISTS (SELECT 1 FROM track_embeddings te WHERE te.track_id = t.id)
    RETURNING t.id
"#;

const RECOVER_MISFAILED_QUERY: &str = r#"
    UPDATE tracks t
    SET analysis_status = 'completed',
        analysis_error = NULL,
        analysis_started_at = NULL,
        updated_at = now()
    FROM track_embeddings te
    WHERE t.id = te.track_id
    AND t.analysis_status = 'failed'
    RETURNING t.id
"#;

const REQUEUE_FAILED_QUERY: &str = r#"
    UPDATE tracks t
    SET analysis_status = 'pending',
        analysis_error = NULL,
        updated_at = now()
    WHERE t.analysis_status = 'failed'
    AND t.analysis_retry_count < $1
    AND NOT EXISTS (SELECT 1 FROM track_embeddings te WHERE te.track_id = t.id)
    RETURNING t.id
"#;

const COUNT_PERMANENTLY_FAILED_QUERY: &str = r#"
    SELECT COUNT(*) FROM tracks
    WHERE analysis_status = 'failed' AND analysis_retry_count >= $1
"#;

const SELECT_PENDING_QUERY: &str = r#"
    SELECT id, file_path FROM tracks
    WHERE analysis_status = 'pending'
    AND analysis_retry_count < $1
    ORDER BY file_modified DESC NULLS LAST
    LIMIT $2
"#;

const COUNT_MISSING_EMBEDDINGS_QUERY: &str = r#"
    SELECT COUNT(*) FROM tracks t
    LEFT JOIN track_embeddings te ON t.id = te.track_id
    WHERE te.track_id IS NULL AND t.file_path IS NOT NULL
"#;

#[derive(Clone)]
pub struct Store {
    pool: Pool<Postgres>,
}

impl Store {
    /// Connect, apply session timeouts, and run the embedded migration.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .max_lifetime(config.max_lifetime)
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    sqlx::query("SET statement_timeout = '30s'")
                        .execute(&mut *conn)
                        .await?;
                    sqlx::query("SET idle_in_transaction_session_timeout = '60s'")
                        .execute(&mut *conn)
                        .await?;
                    Ok(())
                })
            })
            .connect(&config.url)
            .await
            .context("Failed to connect to Postgres")?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("Failed to run database migrations")?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }

    // ── Vibe-embedding lifecycle ─────────────────────────────────────────

    #[instrument(skip(self), err)]
    pub async fn set_vibe_status(&self, track_id: &str, status: TrackStatus) -> Result<()> {
        sqlx::query(UPDATE_VIBE_STATUS_QUERY)
            .bind(track_id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Mark the vibe analysis failed and return the new retry count.
    #[instrument(skip(self, error), err)]
    pub async fn mark_vibe_failed(&self, track_id: &str, error: &str) -> Result<i32> {
        let row = sqlx::query(MARK_VIBE_FAILED_QUERY)
            .bind(track_id)
            .bind(truncate_error(error))
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<i32, _>(0)).unwrap_or(0))
    }

    #[instrument(skip(self, embedding), err)]
    pub async fn save_embedding(
        &self,
        track_id: &str,
        embedding: &[f32],
        model_version: &str,
    ) -> Result<()> {
        sqlx::query(UPSERT_EMBEDDING_QUERY)
            .bind(track_id)
            .bind(embedding)
            .bind(model_version)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn track_context(&self, track_id: &str) -> Result<Option<TrackContext>> {
        let ctx = sqlx::query_as::<_, TrackContext>(TRACK_CONTEXT_QUERY)
            .bind(track_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(ctx)
    }

    // ── Feature-analysis lifecycle ───────────────────────────────────────

    /// Flip a batch to `processing`, honoring producers that pre-claim.
    /// Returns the ids that actually transitioned.
    #[instrument(skip(self, track_ids), err)]
    pub async fn claim_batch(&self, track_ids: &[String]) -> Result<Vec<String>> {
        let rows = sqlx::query(CLAIM_BATCH_QUERY)
            .bind(track_ids)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.get(0)).collect())
    }

    #[instrument(skip(self, features), err)]
    pub async fn save_features(
        &self,
        track_id: &str,
        features: &TrackFeatures,
        version: &str,
    ) -> Result<()> {
        sqlx::query(SAVE_FEATURES_QUERY)
            .bind(track_id)
            .bind(features.bpm)
            .bind(features.beats_count)
            .bind(&features.key_name)
            .bind(&features.key_scale)
            .bind(features.key_strength)
            .bind(features.energy)
            .bind(features.loudness)
            .bind(features.dynamic_range)
            .bind(features.danceability)
            .bind(features.valence)
            .bind(features.arousal)
            .bind(features.instrumentalness)
            .bind(features.acousticness)
            .bind(features.speechiness)
            .bind(&features.mood_tags)
            .bind(&features.analysis_mode)
            .bind(version)
            .execute(&self.pool)
            .await?;

        // A successful analysis clears stale unresolved failures so failure
        // counts stay accurate across reruns.
        let ids = [track_id.to_string()];
        self.resolve_failures(FAILURE_ENTITY_AUDIO, &ids).await?;
        Ok(())
    }

    /// Mark a track's analysis failed; permanent failures exhaust the retry
    /// budget. Returns the resulting retry count.
    #[instrument(skip(self, error), err)]
    pub async fn mark_analysis_failed(
        &self,
        track_id: &str,
        error: &str,
        permanent: bool,
        max_retries: i32,
    ) -> Result<i32> {
        let row = if permanent {
            sqlx::query(MARK_ANALYSIS_FAILED_PERMANENT_QUERY)
                .bind(track_id)
                .bind(truncate_error(error))
                .bind(max_retries)
                .fetch_optional(&self.pool)
                .await?
        } else {
            sqlx::query(MARK_ANALYSIS_FAILED_QUERY)
                .bind(track_id)
                .bind(truncate_error(error))
                .fetch_optional(&self.pool)
                .await?
        };
        Ok(row.map(|r| r.get::<i32, _>(0)).unwrap_or(0))
    }

    // ── Failure rows ─────────────────────────────────────────────────────

    #[instrument(skip(self, error_message, metadata), err)]
    pub async fn upsert_failure(
        &self,
        entity_type: &str,
        entity_id: &str,
        entity_name: Option<&str>,
        error_message: &str,
        metadata: serde_json::Value,
    ) -> Result<()> {
        sqlx::query(UPSERT_FAILURE_QUERY)
            .bind(Uuid::new_v4().to_string())
            .bind(entity_type)
            .bind(entity_id)
            .bind(entity_name.unwrap_or("Unknown Track"))
            .bind(truncate_error(error_message))
            .bind(metadata)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn resolve_failures(&self, entity_type: &str, entity_ids: &[String]) -> Result<u64> {
        if entity_ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(RESOLVE_FAILURES_QUERY)
            .bind(entity_type)
            .bind(entity_ids)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // ── Maintenance ──────────────────────────────────────────────────────

    /// Reset still-processing rows back to pending after an infrastructure
    /// failure, without consuming retry budget. Returns the eligible ids.
    #[instrument(skip(self, track_ids, reason), err)]
    pub async fn requeue_processing(
        &self,
        track_ids: &[String],
        reason: &str,
    ) -> Result<Vec<String>> {
        let rows = sqlx::query(REQUEUE_PROCESSING_QUERY)
            .bind(track_ids)
            .bind(truncate_error(reason))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.get(0)).collect())
    }

    /// Recover stale `processing` rows that already have embeddings.
    pub async fn reclaim_completed_stale(&self, stale_minutes: i64) -> Result<Vec<String>> {
        let rows = sqlx::query(RECLAIM_COMPLETED_STALE_QUERY)
            .bind(stale_minutes as i32)
            .fetch_all(&self.pool)
            .await?;
        let ids: Vec<String> = rows.into_iter().map(|r| r.get(0)).collect();
        self.resolve_failures(FAILURE_ENTITY_AUDIO, &ids).await?;
        Ok(ids)
    }

    /// Reset truly stale `processing` rows (no embedding, under budget)
    /// back to pending, consuming one retry.
    pub async fn reset_stale_processing(
        &self,
        stale_minutes: i64,
        max_retries: i32,
    ) -> Result<u64> {
        let rows = sqlx::query(RESET_STALE_PROCESSING_QUERY)
            .bind(stale_minutes as i32)
            .bind(max_retries)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.len() as u64)
    }

    /// Flip `failed` rows that actually have embeddings back to completed.
    pub async fn recover_misfailed(&self) -> Result<Vec<String>> {
        let rows = sqlx::query(RECOVER_MISFAILED_QUERY)
            .fetch_all(&self.pool)
            .await?;
        let ids: Vec<String> = rows.into_iter().map(|r| r.get(0)).collect();
        self.resolve_failures(FAILURE_ENTITY_AUDIO, &ids).await?;
        Ok(ids)
    }

    /// Re-queue failed rows that still have budget and no embedding.
    pub async fn requeue_failed(&self, max_retries: i32) -> Result<u64> {
        let rows = sqlx::query(REQUEUE_FAILED_QUERY)
            .bind(max_retries)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.len() as u64)
    }

    pub async fn count_permanently_failed(&self, max_retries: i32) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(COUNT_PERMANENTLY_FAILED_QUERY)
            .bind(max_retries)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Select pending rows for DB reconciliation (queue-loss recovery).
    pub async fn select_pending(
        &self,
        max_retries: i32,
        limit: i64,
    ) -> Result<Vec<PendingTrack>> {
        let tracks = sqlx::query_as::<_, PendingTrack>(SELECT_PENDING_QUERY)
            .bind(max_retries)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(tracks)
    }

    /// Tracks with a file path but no embedding yet (idle-unload probe).
    pub async fn count_missing_embeddings(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(COUNT_MISSING_EMBEDDINGS_QUERY)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

/// Metadata blob recorded alongside analysis failure rows.
pub fn failure_metadata(
    file_path: Option<&str>,
    artist_id: Option<&str>,
    permanent: bool,
    retry_count: i32,
    max_retries: i32,
) -> serde_json::Value {
    serde_json::json!({
        "filePath": file_path,
        "artistId": artist_id,
        "permanent": permanent,
        "retryCount": retry_count,
        "maxRetries": max_retries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        assert_eq!(TrackStatus::Pending.as_str(), "pending");
        assert_eq!(TrackStatus::Processing.as_str(), "processing");
        assert_eq!(TrackStatus::Completed.as_str(), "completed");
        assert_eq!(TrackStatus::Failed.as_str(), "failed");
    }

    #[test]
    fn test_failure_metadata_shape() {
        let meta = failure_metadata(Some("a/b.flac"), None, true, 3, 3);
        assert_eq!(meta["filePath"], "a/b.flac");
        assert_eq!(meta["permanent"], true);
        assert_eq!(meta["retryCount"], 3);
        assert!(meta["artistId"].is_null());
    }
}
