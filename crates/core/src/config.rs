//! Centralized configuration management.
//!
//! All configuration is loaded from environment variables at startup.
//! This provides a single source of truth and fails fast if required config is missing.

use anyhow::{Context, Result};
use std::env;
use std::time::Duration;

/// Redis connection configuration shared by every service.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
}

impl RedisConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            url: env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string()),
        })
    }
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            url: env::var("DATABASE_URL").context("DATABASE_URL is required")?,
            max_connections: env_parsed("DB_MAX_CONNECTIONS", "10")?,
            min_connections: env_parsed("DB_MIN_CONNECTIONS", "2")?,
            acquire_timeout: Duration::from_secs(env_parsed("DB_ACQUIRE_TIMEOUT_SECS", "5")?),
            idle_timeout: Duration::from_secs(env_parsed("DB_IDLE_TIMEOUT_SECS", "300")?),
            max_lifetime: Duration::from_secs(env_parsed("DB_MAX_LIFETIME_SECS", "1800")?),
        })
    }
}

/// Vibe model configuration (shared by both analyzers).
#[derive(Debug, Clone)]
pub struct ModelConfig {
    /// Seconds of inactivity before the model is unloaded to free memory.
    pub idle_timeout: Duration,
    /// Window extracted from the middle of longer tracks.
    pub audio_window_secs: f64,
    /// Model-native sample rate for embeddings.
    pub sample_rate: u32,
}

impl ModelConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            idle_timeout: Duration::from_secs(env_parsed("MODEL_IDLE_TIMEOUT", "300")?),
            audio_window_secs: env_parsed("MAX_AUDIO_DURATION", "60")?,
            sample_rate: env_parsed("VIBE_SAMPLE_RATE", "48000")?,
        })
    }
}

/// Embedding worker (worker-vibe) configuration.
#[derive(Debug, Clone)]
pub struct VibeWorkerConfig {
    pub music_path: String,
    pub sleep_interval: Duration,
    pub num_workers: usize,
    /// Platform backend used for best-effort failure reports.
    pub backend_url: String,
    pub internal_api_secret: String,
    pub text_embed_group: String,
    pub text_embed_consumer_prefix: String,
    pub response_ttl_secs: u64,
    pub claim_idle_ms: u64,
    pub claim_batch: usize,
}

impl VibeWorkerConfig {
    pub fn from_env() -> Result<Self> {
        let consumer_prefix = env::var("TEXT_EMBED_CONSUMER_PREFIX")
            .or_else(|_| env::var("HOSTNAME"))
            .unwrap_or_else(|_| "vibe".to_string());

        Ok(Self {
            music_path: env::var("MUSIC_PATH").unwrap_or_else(|_| "/music".to_string()),
            sleep_interval: Duration::from_secs(env_parsed("SLEEP_INTERVAL", "5")?),
            num_workers: env_parsed("NUM_WORKERS", "2")?,
            backend_url: env::var("BACKEND_URL")
                .unwrap_or_else(|_| "http://backend:3006".to_string()),
            internal_api_secret: env::var("INTERNAL_API_SECRET").unwrap_or_default(),
            text_embed_group: env::var("TEXT_EMBED_GROUP")
                .unwrap_or_else(|_| "vibe:text:embed:group".to_string()),
            text_embed_consumer_prefix: consumer_prefix,
            response_ttl_secs: env_parsed("TEXT_EMBED_RESPONSE_TTL_SECONDS", "120")?,
            claim_idle_ms: env_parsed("TEXT_EMBED_CLAIM_IDLE_MS", "60000")?,
            claim_batch: env_parsed("TEXT_EMBED_CLAIM_BATCH", "10")?,
        })
    }
}

/// Feature-extraction worker (worker-analysis) configuration.
#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    pub music_path: String,
    pub batch_size: usize,
    /// Blocking-pop timeout; also the DB reconciliation interval.
    pub brpop_timeout: Duration,
    pub num_workers: usize,
    pub max_retries: i32,
    pub stale_processing_minutes: i64,
    /// Oversized files are permanently failed. 0 disables the guardrail.
    pub max_file_size_mb: u64,
    /// Hard wall-clock limit for one analysis batch.
    pub batch_timeout: Duration,
    /// At most this many seconds of audio are analyzed per track.
    pub max_analyze_secs: f64,
    pub model_idle_timeout: Duration,
    /// Debounce window for worker-count changes from the control plane.
    pub resize_debounce: Duration,
}

impl AnalysisConfig {
    pub fn from_env() -> Result<Self> {
        let sleep_interval: u64 = env_parsed("SLEEP_INTERVAL", "5")?;
        let brpop_timeout: u64 = env::var("BRPOP_TIMEOUT")
            .ok()
            .map(|v| v.parse().context("BRPOP_TIMEOUT must be a number"))
            .transpose()?
            .unwrap_or(sleep_interval)
            .max(5);

        Ok(Self {
            music_path: env::var("MUSIC_PATH").unwrap_or_else(|_| "/music".to_string()),
            batch_size: env_parsed("BATCH_SIZE", "10")?,
            brpop_timeout: Duration::from_secs(brpop_timeout),
            num_workers: clamp_workers(env_parsed("NUM_WORKERS", "2")?),
            max_retries: env_parsed("MAX_RETRIES", "3")?,
            stale_processing_minutes: env_parsed("STALE_PROCESSING_MINUTES", "15")?,
            max_file_size_mb: env_parsed("MAX_FILE_SIZE_MB", "500")?,
            batch_timeout: Duration::from_secs(env_parsed(
                "BATCH_ANALYSIS_TIMEOUT_SECONDS",
                "900",
            )?),
            max_analyze_secs: env_parsed("MAX_ANALYZE_SECONDS", "90")?,
            model_idle_timeout: Duration::from_secs(env_parsed("MODEL_IDLE_TIMEOUT", "300")?),
            resize_debounce: Duration::from_secs(env_parsed("RESIZE_DEBOUNCE_SECONDS", "5")?),
        })
    }
}

/// Worker counts from the control plane are bounded to a sane range.
pub fn clamp_workers(count: usize) -> usize {
    count.clamp(1, 8)
}

/// Streamer sidecar configuration.
#[derive(Debug, Clone)]
pub struct StreamerConfig {
    pub bind_address: String,
    pub port: u16,
    pub music_path: String,
    /// Catalog provider API base (REST).
    pub provider_base_url: String,
    /// Provider OAuth/device-auth base.
    pub provider_auth_url: String,
    pub provider_client_id: String,
    pub provider_client_secret: String,
    pub batch_concurrency: usize,
    pub batch_delay_min: f64,
    pub batch_delay_max: f64,
    pub extract_delay_min: f64,
    pub extract_delay_max: f64,
    pub stream_cache_ttl: Duration,
    pub search_cache_ttl: Duration,
    /// Pause between tracks during album downloads.
    pub track_delay: Duration,
}

impl StreamerConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env_parsed("PORT", "8585")?,
            music_path: env::var("MUSIC_PATH").unwrap_or_else(|_| "/music".to_string()),
            provider_base_url: env::var("PROVIDER_BASE_URL")
                .unwrap_or_else(|_| "https://api.tidal.com/v1".to_string()),
            provider_auth_url: env::var("PROVIDER_AUTH_URL")
                .unwrap_or_else(|_| "https://auth.tidal.com/v1/oauth2".to_string()),
            provider_client_id: env::var("PROVIDER_CLIENT_ID").unwrap_or_default(),
            provider_client_secret: env::var("PROVIDER_CLIENT_SECRET").unwrap_or_default(),
            batch_concurrency: env_parsed("BATCH_CONCURRENCY", "3")?,
            batch_delay_min: env_parsed("BATCH_DELAY_MIN", "0.3")?,
            batch_delay_max: env_parsed("BATCH_DELAY_MAX", "1.0")?,
            extract_delay_min: env_parsed("EXTRACT_DELAY_MIN", "0.5")?,
            extract_delay_max: env_parsed("EXTRACT_DELAY_MAX", "2.0")?,
            stream_cache_ttl: Duration::from_secs(env_parsed("STREAM_CACHE_TTL_SECONDS", "600")?),
            search_cache_ttl: Duration::from_secs(env_parsed("SEARCH_CACHE_TTL_SECONDS", "300")?),
            track_delay: Duration::from_secs(env_parsed("TRACK_DELAY_SECONDS", "3")?),
        })
    }
}

fn env_parsed<T>(name: &str, default: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .with_context(|| format!("{} must be a valid number", name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_workers_bounds() {
        assert_eq!(clamp_workers(0), 1);
        assert_eq!(clamp_workers(3), 3);
        assert_eq!(clamp_workers(100), 8);
    }

    #[test]
    fn test_env_parsed_default() {
        let v: u64 = env_parsed("AUDIOSCOPE_TEST_UNSET_VAR", "42").unwrap();
        assert_eq!(v, 42);
    }
}
