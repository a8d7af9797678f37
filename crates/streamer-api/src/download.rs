//! Track and album downloads.
//!
//! Downloads write into the mounted music path using a configurable path
//! template. Each path component is sanitized, bytes land in a temp file
//! that is renamed into place, and album downloads pace between tracks to
//! stay inside provider limits.

use std::path::PathBuf;

use serde_json::Value;
use tracing::{debug, warn};

use audioscope_core::paths::sanitize_path_component;
use audioscope_core::retry::{RetryPolicy, retry_with_policy};

use crate::errors::ApiError;
use crate::state::AppState;
use crate::stream_cache::StreamQuality;
use crate::streaming::resolve_stream_url;

pub const DEFAULT_TEMPLATE: &str = "{artist}/{album}/{number}. {title}";

/// Metadata extracted from provider track/album payloads.
#[derive(Debug, Clone)]
pub struct TrackMeta {
    pub title: String,
    pub artist: String,
    pub album: String,
    pub number: u32,
}

impl TrackMeta {
    /// Pull the fields the path template needs out of a track payload.
    pub fn from_payloads(track: &Value, album: &Value) -> Self {
        let title = track
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or("Unknown Track")
            .to_string();
        let artist = track
            .get("artists")
            .and_then(Value::as_array)
            .and_then(|a| a.first())
            .and_then(|a| a.get("name"))
            .or_else(|| track.get("artist").and_then(|a| a.get("name")))
            .and_then(Value::as_str)
            .unwrap_or("Unknown")
            .to_string();
        let album_title = album
            .get("title")
            .and_then(Value::as_str)
            .or_else(|| {
                track
                    .get("album")
                    .and_then(|a| a.get("title"))
                    .and_then(Value::as_str)
            })
            .unwrap_or("Unknown Album")
            .to_string();
        let number = track
            .get("trackNumber")
            .and_then(Value::as_u64)
            .unwrap_or(1) as u32;

        Self {
            title,
            artist,
            album: album_title,
            number,
        }
    }
}

/// Render a path template, sanitizing each component. The track number is
/// zero-padded to two digits.
pub fn render_template(template: &str, meta: &TrackMeta) -> String {
    let rendered = template
        .replace("{artist}", &meta.artist)
        .replace("{album}", &meta.album)
        .replace("{number}", &format!("{:02}", meta.number))
        .replace("{title}", &meta.title);

    rendered
        .split('/')
        .map(sanitize_path_component)
        .filter(|c| !c.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

pub fn extension_for_codec(codec: &str) -> &'static str {
    let upper = codec.to_uppercase();
    if upper.contains("FLAC") || upper.contains("LOSSLESS") {
        ".flac"
    } else {
        ".m4a"
    }
}

/// Download one track to the music mount. Returns the file-info payload.
pub async fn download_track(
    state: &AppState,
    user_id: &str,
    track_id: &str,
    quality: StreamQuality,
    template: &str,
) -> Result<Value, ApiError> {
    let track = state
        .sessions
        .run_with_refresh(user_id, |session| {
            let track_id = track_id.to_string();
            async move { session.client.get_track(&track_id).await }
        })
        .await?;

    let album_id = track
        .get("album")
        .and_then(|a| a.get("id"))
        .map(|id| match id {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        });

    let album = match album_id {
        Some(album_id) => {
            state
                .sessions
                .run_with_refresh(user_id, |session| {
                    let album_id = album_id.clone();
                    async move { session.client.get_album(&album_id).await }
                })
                .await
                .unwrap_or(Value::Null)
        }
        None => Value::Null,
    };

    let meta = TrackMeta::from_payloads(&track, &album);
    let entry = resolve_stream_url(state, user_id, track_id, quality, true).await?;
    if entry.urls.is_empty() {
        return Err(ApiError::NotFound("No stream URL available".to_string()));
    }

    // Segmented streams arrive as multiple URLs; fetch in order and append.
    // Transient CDN failures (5xx, timeouts) retry with backoff.
    let policy = RetryPolicy::default();
    let mut data: Vec<u8> = Vec::new();
    for url in &entry.urls {
        let bytes = retry_with_policy(&policy, "download_segment", || async {
            let response = state
                .upstream
                .get(url)
                .send()
                .await
                .map_err(|e| anyhow::anyhow!("Download failed: {e}"))?;
            if !response.status().is_success() {
                anyhow::bail!("Download failed with status {}", response.status());
            }
            response
                .bytes()
                .await
                .map_err(|e| anyhow::anyhow!("Download read failed: {e}"))
        })
        .await
        .map_err(|e| ApiError::BadGateway(format!("{e:#}")))?;
        data.extend_from_slice(&bytes);
    }

    let relative = format!(
        "{}{}",
        render_template(template, &meta),
        extension_for_codec(&entry.codec)
    );
    let dest = PathBuf::from(&state.config.music_path).join(&relative);
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ApiError::Internal(format!("Failed to create directory: {e}")))?;
    }

    // Temp file first, then rename.
    let tmp = dest.with_extension(format!(
        "{}.tmp",
        dest.extension().and_then(|e| e.to_str()).unwrap_or("bin")
    ));
    tokio::fs::write(&tmp, &data)
        .await
        .map_err(|e| ApiError::Internal(format!("Failed to write file: {e}")))?;
    tokio::fs::rename(&tmp, &dest)
        .await
        .map_err(|e| ApiError::Internal(format!("Failed to move file into place: {e}")))?;

    debug!(track_id, path = %dest.display(), bytes = data.len(), "Track downloaded");

    Ok(serde_json::json!({
        "track_id": track_id,
        "title": meta.title,
        "artist": meta.artist,
        "album": meta.album,
        "quality": entry.quality,
        "file_path": dest.to_string_lossy(),
        "relative_path": relative,
        "file_size": data.len(),
    }))
}

/// Collect the track ids of an album by paging through its items.
pub async fn album_track_ids(
    state: &AppState,
    user_id: &str,
    album_id: &str,
) -> Result<Vec<String>, ApiError> {
    let mut ids = Vec::new();
    let mut offset = 0usize;
    let limit = 100usize;

    loop {
        let page = state
            .sessions
            .run_with_refresh(user_id, |session| {
                let album_id = album_id.to_string();
                async move {
                    session
                        .client
                        .get_album_items(&album_id, limit, offset)
                        .await
                }
            })
            .await?;

        let items = page
            .get("items")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for item in &items {
            let track = item.get("item").unwrap_or(item);
            if let Some(id) = track.get("id") {
                let id = match id {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                ids.push(id);
            }
        }

        let total = page
            .get("totalNumberOfItems")
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize;
        offset += limit;
        if items.is_empty() || offset >= total {
            break;
        }
    }

    if ids.is_empty() {
        warn!(album_id, "Album has no downloadable tracks");
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_template_pads_number_and_sanitizes() {
        let meta = TrackMeta {
            title: "What? A Song".into(),
            artist: "AC/DC".into(),
            album: "Back In Black".into(),
            number: 3,
        };
        let rendered = render_template(DEFAULT_TEMPLATE, &meta);
        assert_eq!(rendered, "AC_DC/Back In Black/03. What_ A Song");
    }

    #[test]
    fn test_extension_for_codec() {
        assert_eq!(extension_for_codec("FLAC"), ".flac");
        assert_eq!(extension_for_codec("aac"), ".m4a");
    }

    #[test]
    fn test_track_meta_extraction() {
        let track = json!({
            "title": "Song",
            "trackNumber": 7,
            "artists": [{"name": "Artist"}],
            "album": {"id": 9, "title": "Fallback Album"}
        });
        let meta = TrackMeta::from_payloads(&track, &Value::Null);
        assert_eq!(meta.title, "Song");
        assert_eq!(meta.artist, "Artist");
        assert_eq!(meta.album, "Fallback Album");
        assert_eq!(meta.number, 7);
    }

    #[test]
    fn test_track_meta_defaults() {
        let meta = TrackMeta::from_payloads(&json!({}), &Value::Null);
        assert_eq!(meta.title, "Unknown Track");
        assert_eq!(meta.artist, "Unknown");
        assert_eq!(meta.album, "Unknown Album");
        assert_eq!(meta.number, 1);
    }
}
