//! Queue payload types.
//!
//! Payloads are JSON with a loose shape at the wire; parsing validates the
//! required fields at the queue boundary and malformed entries are dropped
//! and logged by the consumers.

use serde::{Deserialize, Serialize};

/// Job pushed onto the vibe-embedding queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VibeJob {
    pub track_id: String,
    #[serde(default)]
    pub file_path: String,
    /// Pre-computed duration in seconds; skips the file probe when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

/// Job pushed onto the feature-analysis queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisJob {
    pub track_id: String,
    #[serde(default)]
    pub file_path: String,
}

/// One entry on the text-embedding request stream.
///
/// Stream entries are flat field maps rather than a single JSON blob; this
/// struct is assembled from those fields by the responder.
#[derive(Debug, Clone)]
pub struct TextEmbedRequest {
    pub request_id: String,
    pub text: String,
    pub response_key: String,
}

impl TextEmbedRequest {
    pub const RESPONSE_KEY_PREFIX: &'static str = "audio:text:embed:response:";

    /// Build a request from raw stream fields. Returns `None` when the
    /// mandatory `requestId` field is missing (the entry is acked and dropped).
    pub fn from_fields(
        request_id: Option<String>,
        text: Option<String>,
        response_key: Option<String>,
    ) -> Option<Self> {
        let request_id = request_id.filter(|id| !id.is_empty())?;
        let response_key = response_key
            .filter(|key| !key.is_empty())
            .unwrap_or_else(|| format!("{}{}", Self::RESPONSE_KEY_PREFIX, request_id));
        Some(Self {
            request_id,
            text: text.unwrap_or_default(),
            response_key,
        })
    }
}

/// Response pushed onto the per-request list key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextEmbedResponse {
    pub request_id: String,
    pub success: bool,
    pub embedding: Option<Vec<f32>>,
    pub model_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TextEmbedResponse {
    pub fn ok(request_id: String, embedding: Vec<f32>, model_version: &str) -> Self {
        Self {
            request_id,
            success: true,
            embedding: Some(embedding),
            model_version: model_version.to_string(),
            error: None,
        }
    }

    pub fn failed(request_id: String, model_version: &str, error: impl Into<String>) -> Self {
        Self {
            request_id,
            success: false,
            embedding: None,
            model_version: model_version.to_string(),
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vibe_job_parses_with_optional_duration() {
        let job: VibeJob =
            serde_json::from_str(r#"{"trackId":"t1","filePath":"a/b.flac","duration":42.0}"#)
                .unwrap();
        assert_eq!(job.track_id, "t1");
        assert_eq!(job.duration, Some(42.0));

        let job: VibeJob = serde_json::from_str(r#"{"trackId":"t2","filePath":"x.mp3"}"#).unwrap();
        assert!(job.duration.is_none());
    }

    #[test]
    fn test_vibe_job_rejects_missing_track_id() {
        assert!(serde_json::from_str::<VibeJob>(r#"{"filePath":"x.mp3"}"#).is_err());
    }

    #[test]
    fn test_text_request_derives_response_key() {
        let req = TextEmbedRequest::from_fields(
            Some("r1".to_string()),
            Some("warm synthwave".to_string()),
            None,
        )
        .unwrap();
        assert_eq!(req.response_key, "audio:text:embed:response:r1");

        let req = TextEmbedRequest::from_fields(
            Some("r2".to_string()),
            None,
            Some("custom:key".to_string()),
        )
        .unwrap();
        assert_eq!(req.response_key, "custom:key");
    }

    #[test]
    fn test_text_request_requires_request_id() {
        assert!(TextEmbedRequest::from_fields(None, Some("text".into()), None).is_none());
        assert!(TextEmbedRequest::from_fields(Some(String::new()), None, None).is_none());
    }

    #[test]
    fn test_response_serializes_camel_case() {
        let resp = TextEmbedResponse::ok("r1".into(), vec![0.0; 4], "vibe-spectral-v1");
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["requestId"], "r1");
        assert_eq!(json["modelVersion"], "vibe-spectral-v1");
        assert!(json.get("error").is_none());
    }
}
