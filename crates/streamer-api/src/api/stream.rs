//! Stream-info and byte-range proxy endpoints.

use actix_web::{HttpRequest, HttpResponse, get, web};
use serde::Deserialize;

use crate::errors::ApiError;
use crate::state::AppState;
use crate::stream_cache::StreamQuality;
use crate::streaming::{proxy_track, resolve_stream_url, stream_info_payload};

#[derive(Deserialize)]
pub struct StreamQuery {
    pub user_id: String,
    #[serde(default)]
    pub quality: Option<String>,
}

/// Stream metadata only (no proxying).
#[get("/user/stream-info/{id}")]
pub async fn user_stream_info(
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<StreamQuery>,
) -> Result<HttpResponse, ApiError> {
    let track_id = path.into_inner();
    let quality = StreamQuality::normalize(query.quality.as_deref());
    let entry = resolve_stream_url(&state, &query.user_id, &track_id, quality, false).await?;
    Ok(HttpResponse::Ok().json(stream_info_payload(&track_id, &entry)))
}

/// Byte-range proxy. Stream URLs are IP-locked to this host, so the backend
/// pipes this response to the player.
#[get("/user/stream/{id}")]
pub async fn user_stream(
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<StreamQuery>,
    request: HttpRequest,
) -> Result<HttpResponse, ApiError> {
    let track_id = path.into_inner();
    let range = request
        .headers()
        .get("range")
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    proxy_track(
        &state,
        &query.user_id,
        &track_id,
        query.quality.as_deref(),
        range.as_deref(),
    )
    .await
}

/// Alias for the byte-range proxy.
#[get("/proxy/{id}")]
pub async fn proxy(
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<StreamQuery>,
    request: HttpRequest,
) -> Result<HttpResponse, ApiError> {
    let track_id = path.into_inner();
    let range = request
        .headers()
        .get("range")
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    proxy_track(
        &state,
        &query.user_id,
        &track_id,
        query.quality.as_deref(),
        range.as_deref(),
    )
    .await
}
