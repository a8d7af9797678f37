//! Streaming sidecar for the music platform backend.
//!
//! Serves per-user catalog search, stream-URL extraction, byte-range
//! proxying, and downloads against the third-party provider, with per-user
//! authenticated session caching and rate-paced outbound requests.

mod api;
mod download;
mod errors;
mod governor;
mod provider;
mod search_cache;
mod sessions;
mod state;
mod stream_cache;
mod streaming;

use actix_web::{App, HttpServer, web};
use anyhow::{Context, Result};
use tracing::info;

use audioscope_core::config::StreamerConfig;
use audioscope_core::observability::init_logging;

use crate::state::AppState;

#[actix_web::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_logging()?;

    let config = StreamerConfig::from_env()?;
    let bind = (config.bind_address.clone(), config.port);

    info!(
        port = config.port,
        music_path = %config.music_path,
        batch_concurrency = config.batch_concurrency,
        stream_cache_ttl_secs = config.stream_cache_ttl.as_secs(),
        "Starting streamer API (multi-user mode)"
    );
    info!(
        batch_delay = format!("{}-{}s", config.batch_delay_min, config.batch_delay_max),
        extract_delay = format!("{}-{}s", config.extract_delay_min, config.extract_delay_max),
        "Rate-pacing config"
    );

    let data = web::Data::new(AppState::new(config));

    HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .configure(api::configure)
    })
    .bind(bind.clone())
    .with_context(|| format!("Failed to bind {}:{}", bind.0, bind.1))?
    .run()
    .await?;

    info!("Streamer API shutting down");
    Ok(())
}
