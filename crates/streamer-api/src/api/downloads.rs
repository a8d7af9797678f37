//! Download endpoints (track and whole-album).

use actix_web::{HttpResponse, post, web};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, error};

use crate::download::{DEFAULT_TEMPLATE, album_track_ids, download_track as download_one};
use crate::errors::ApiError;
use crate::state::AppState;
use crate::stream_cache::StreamQuality;

use super::auth::UserQuery;

#[derive(Deserialize)]
pub struct DownloadTrackRequest {
    pub track_id: Value,
    #[serde(default)]
    pub quality: Option<String>,
    #[serde(default)]
    pub output_template: Option<String>,
}

#[derive(Deserialize)]
pub struct DownloadAlbumRequest {
    pub album_id: Value,
    #[serde(default)]
    pub quality: Option<String>,
    #[serde(default)]
    pub output_template: Option<String>,
}

fn id_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[post("/download/track")]
pub async fn download_track(
    state: web::Data<AppState>,
    query: web::Query<UserQuery>,
    body: web::Json<DownloadTrackRequest>,
) -> Result<HttpResponse, ApiError> {
    let track_id = id_string(&body.track_id);
    let quality = StreamQuality::normalize(body.quality.as_deref());
    let template = body.output_template.as_deref().unwrap_or(DEFAULT_TEMPLATE);

    let result = download_one(&state, &query.user_id, &track_id, quality, template).await?;
    Ok(HttpResponse::Ok().json(result))
}

/// Download every track of an album, pacing between tracks to stay inside
/// provider limits. Per-track failures are collected, not fatal.
#[post("/download/album")]
pub async fn download_album(
    state: web::Data<AppState>,
    query: web::Query<UserQuery>,
    body: web::Json<DownloadAlbumRequest>,
) -> Result<HttpResponse, ApiError> {
    let album_id = id_string(&body.album_id);
    let quality = StreamQuality::normalize(body.quality.as_deref());
    let template = body.output_template.as_deref().unwrap_or(DEFAULT_TEMPLATE);

    let album = state
        .sessions
        .run_with_refresh(&query.user_id, |session| {
            let album_id = album_id.clone();
            async move { session.client.get_album(&album_id).await }
        })
        .await?;

    let track_ids = album_track_ids(&state, &query.user_id, &album_id).await?;

    let mut results = Vec::new();
    let mut errors = Vec::new();

    for (index, track_id) in track_ids.iter().enumerate() {
        if index > 0 {
            debug!(
                delay_secs = state.config.track_delay.as_secs(),
                track = index + 1,
                total = track_ids.len(),
                "Pacing before next track"
            );
            tokio::time::sleep(state.config.track_delay).await;
        }

        match download_one(&state, &query.user_id, track_id, quality, template).await {
            Ok(result) => results.push(result),
            Err(e) => {
                error!(track_id = %track_id, error = %e, "Failed to download track");
                errors.push(serde_json::json!({
                    "track_id": track_id,
                    "error": e.to_string(),
                }));
            }
        }
    }

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "album_id": album_id,
        "album_title": album.get("title"),
        "artist": album.get("artist").and_then(|a| a.get("name")),
        "total_tracks": track_ids.len(),
        "downloaded": results.len(),
        "failed": errors.len(),
        "tracks": results,
        "errors": errors,
    })))
}
