//! Stream-URL resolution and the byte-range proxy.
//!
//! Stream URLs are IP-locked to this host and expire quickly, so clients
//! never see them; bytes are proxied through. A cached URL that the CDN
//! rejects with 401/403 is evicted and re-extracted exactly once before the
//! request fails.

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, web};
use futures_util::StreamExt;
use tracing::{info, warn};

use crate::errors::ApiError;
use crate::provider::is_age_restricted_message;
use crate::state::AppState;
use crate::stream_cache::{StreamKey, StreamQuality, StreamUrlEntry};

/// Proxy chunk size: 64 KiB.
const CHUNK_SIZE: usize = 65_536;

/// Resolve a stream URL for `(user, track, quality)`, via the cache unless
/// `force` is set. Extraction goes through the governor and the session
/// registry's refresh-once path.
pub async fn resolve_stream_url(
    state: &AppState,
    user_id: &str,
    track_id: &str,
    quality: StreamQuality,
    force: bool,
) -> Result<std::sync::Arc<StreamUrlEntry>, ApiError> {
    let key = StreamKey {
        user_id: user_id.to_string(),
        track_id: track_id.to_string(),
        quality,
    };

    if !force && let Some(entry) = state.urls.get(&key) {
        return Ok(entry);
    }

    state.governor.pace_extraction().await;

    let manifest = state
        .sessions
        .run_with_refresh(user_id, |session| {
            let track_id = track_id.to_string();
            async move { session.client.track_stream(&track_id, quality).await }
        })
        .await
        .map_err(|e| {
            let message = e.to_string();
            if is_age_restricted_message(&message) {
                ApiError::AgeRestricted(message)
            } else {
                e
            }
        })?;

    let entry = StreamUrlEntry {
        url: manifest.primary_url().unwrap_or_default().to_string(),
        urls: manifest.urls.clone(),
        content_type: manifest.content_type.clone(),
        codec: manifest.codec.clone(),
        quality: manifest.quality.clone(),
        bit_depth: manifest.bit_depth,
        sample_rate: manifest.sample_rate,
        expires_at: state.urls.expiry_from_now(),
    };
    Ok(state.urls.insert(key, entry))
}

/// Open the upstream stream, refreshing the URL once on 401/403.
pub async fn open_upstream(
    state: &AppState,
    user_id: &str,
    track_id: &str,
    quality: StreamQuality,
    range: Option<&str>,
) -> Result<(reqwest::Response, std::sync::Arc<StreamUrlEntry>), ApiError> {
    let key = StreamKey {
        user_id: user_id.to_string(),
        track_id: track_id.to_string(),
        quality,
    };

    for attempt in 0..2 {
        let force = attempt == 1;
        if force {
            state.urls.clear_exact(&key);
        }

        let entry = resolve_stream_url(state, user_id, track_id, quality, force).await?;
        if entry.url.is_empty() {
            return Err(ApiError::NotFound("No stream URL available".to_string()));
        }

        let mut request = state
            .upstream
            .get(&entry.url)
            .header("Accept", "*/*")
            .header("Accept-Language", "en-US,en;q=0.9");
        if let Some(range) = range {
            request = request.header("Range", range);
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(track_id, error = %e, "Upstream stream request failed");
                return Err(ApiError::BadGateway("Failed to fetch stream".to_string()));
            }
        };

        let status = response.status().as_u16();
        if attempt == 0 && (status == 401 || status == 403) {
            info!(
                track_id,
                status, "Cached stream URL rejected; refreshing once"
            );
            drop(response);
            continue;
        }

        return Ok((response, entry));
    }

    Err(ApiError::BadGateway(
        "Unable to refresh stream URL".to_string(),
    ))
}

/// Build the proxied response: forward status, Content-Type (falling back to
/// the cache's hint), Content-Range, and Accept-Ranges. Content-Length is
/// never forwarded — the body is chunked so a mid-stream upstream failure
/// ends the response cleanly and the client retries with a new Range.
pub fn proxy_response(upstream: reqwest::Response, entry: &StreamUrlEntry) -> HttpResponse {
    let status = StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::OK);
    let mut builder = HttpResponse::build(status);
    builder.insert_header(("Accept-Ranges", "bytes"));
    builder.insert_header(("Cache-Control", "no-cache"));

    let content_type = upstream
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or(&entry.content_type)
        .to_string();
    builder.insert_header(("Content-Type", content_type));

    if let Some(content_range) = upstream
        .headers()
        .get("content-range")
        .and_then(|v| v.to_str().ok())
    {
        builder.insert_header(("Content-Range", content_range.to_string()));
    }

    let body = async_stream::stream! {
        let mut bytes_stream = upstream.bytes_stream();
        while let Some(next) = bytes_stream.next().await {
            match next {
                Ok(bytes) => {
                    // Re-slice into bounded chunks.
                    let mut offset = 0;
                    while offset < bytes.len() {
                        let end = (offset + CHUNK_SIZE).min(bytes.len());
                        yield Ok::<_, actix_web::Error>(bytes.slice(offset..end));
                        offset = end;
                    }
                }
                Err(e) => {
                    // End the stream gracefully; the client retries with a
                    // new Range request.
                    warn!(error = %e, "Upstream read error during stream");
                    break;
                }
            }
        }
    };

    builder.streaming(body)
}

/// Stream-info payload for a resolved URL entry.
pub fn stream_info_payload(track_id: &str, entry: &StreamUrlEntry) -> serde_json::Value {
    serde_json::json!({
        "trackId": track_id,
        "quality": entry.quality,
        "codec": entry.codec,
        "content_type": entry.content_type,
        "bit_depth": entry.bit_depth,
        "sample_rate": entry.sample_rate,
        "expires_at": entry.expires_at,
    })
}

/// Shared handler body for the byte-range proxy endpoints.
pub async fn proxy_track(
    state: &web::Data<AppState>,
    user_id: &str,
    track_id: &str,
    quality: Option<&str>,
    range: Option<&str>,
) -> Result<HttpResponse, ApiError> {
    let quality = StreamQuality::normalize(quality);
    let (upstream, entry) = open_upstream(state, user_id, track_id, quality, range).await?;
    Ok(proxy_response(upstream, &entry))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_info_payload_shape() {
        let entry = StreamUrlEntry {
            url: "https://cdn/x".into(),
            urls: vec!["https://cdn/x".into()],
            content_type: "audio/flac".into(),
            codec: "FLAC".into(),
            quality: "LOSSLESS".into(),
            bit_depth: Some(24),
            sample_rate: Some(96_000),
            expires_at: 1_700_000_000,
        };
        let payload = stream_info_payload("t1", &entry);
        assert_eq!(payload["trackId"], "t1");
        assert_eq!(payload["codec"], "FLAC");
        assert_eq!(payload["bit_depth"], 24);
        assert_eq!(payload["expires_at"], 1_700_000_000u64);
        // The raw URL never leaks into client payloads.
        assert!(payload.get("url").is_none());
    }
}
