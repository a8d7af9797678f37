//! Catalog provider REST client.
//!
//! Thin reqwest wrapper over the provider's OAuth device-code flow and
//! catalog/stream endpoints. Catalog payloads pass through as JSON; only the
//! shapes the proxy depends on (session info, stream manifests, token
//! grants) are typed. Token expiry is recognized by the provider-specific
//! 401 sub-status or message markers and surfaced as a distinct error so the
//! session registry can refresh-and-retry exactly once.

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use audioscope_core::config::StreamerConfig;

use crate::stream_cache::StreamQuality;

/// Browser-like User-Agent so CDN requests look like a normal session.
pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// Provider sub-status that accompanies expired access tokens.
const SUB_STATUS_TOKEN_EXPIRED: i64 = 11003;

#[derive(Debug, Error)]
pub enum ProviderError {
    /// Access token expired; refresh and retry once.
    #[error("token expired: {0}")]
    TokenExpired(String),
    /// Device-code authorization not yet completed.
    #[error("{0}")]
    Pending(String),
    /// The native client context was rejected; the TV fallback may work.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("provider error ({status}): {message}")]
    Api {
        status: u16,
        sub_status: Option<i64>,
        message: String,
    },
    #[error("provider request failed: {0}")]
    Transport(String),
}

impl ProviderError {
    pub fn is_token_expired(&self) -> bool {
        matches!(self, ProviderError::TokenExpired(_))
    }

    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, ProviderError::InvalidArgument(_))
    }

    /// Classify an error response from status code, sub-status, and message.
    pub fn classify(status: u16, sub_status: Option<i64>, message: String) -> Self {
        let lower = message.to_lowercase();
        if status == 401
            && (sub_status == Some(SUB_STATUS_TOKEN_EXPIRED)
                || lower.contains("token has expired")
                || lower.contains("expired on time"))
        {
            return ProviderError::TokenExpired(message);
        }
        if status == 400 && lower.contains("invalid argument") {
            return ProviderError::InvalidArgument(message);
        }
        ProviderError::Api {
            status,
            sub_status,
            message,
        }
    }
}

/// Client context used for catalog calls. The TV context is the fallback
/// for users whose native-context requests are rejected with an
/// invalid-argument error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientContext {
    Native,
    Tv,
}

// ─────────────────────────────────────────────────────────────────────────────
// OAuth / device-code flow
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceAuthorization {
    #[serde(rename = "deviceCode")]
    pub device_code: String,
    #[serde(rename = "userCode")]
    pub user_code: String,
    #[serde(rename = "verificationUri")]
    pub verification_uri: String,
    #[serde(rename = "verificationUriComplete", default)]
    pub verification_uri_complete: Option<String>,
    #[serde(rename = "expiresIn", default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub interval: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GrantUser {
    #[serde(rename = "userId")]
    user_id: Value,
    #[serde(rename = "countryCode", default)]
    pub country_code: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

impl GrantUser {
    /// Provider user ids arrive as numbers; normalize to a string.
    pub fn id_string(&self) -> String {
        match &self.user_id {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    pub user: GrantUser,
}

/// OAuth endpoints (no session required).
#[derive(Clone)]
pub struct AuthApi {
    http: reqwest::Client,
    auth_url: String,
    client_id: String,
    client_secret: String,
}

impl AuthApi {
    pub fn new(config: &StreamerConfig) -> Self {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build auth HTTP client");
        Self {
            http,
            auth_url: config.provider_auth_url.clone(),
            client_id: config.provider_client_id.clone(),
            client_secret: config.provider_client_secret.clone(),
        }
    }

    /// Step 1: initiate the device-code flow.
    pub async fn device_authorization(&self) -> Result<DeviceAuthorization, ProviderError> {
        let response = self
            .http
            .post(format!("{}/device_authorization", self.auth_url))
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("scope", "r_usr w_usr"),
            ])
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        decode_json(response).await
    }

    /// Step 2: poll for the token after the user authorizes the device code.
    pub async fn token(&self, device_code: &str) -> Result<TokenGrant, ProviderError> {
        let response = self
            .http
            .post(format!("{}/token", self.auth_url))
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("device_code", device_code),
                (
                    "grant_type",
                    "urn:ietf:params:oauth:grant-type:device_code",
                ),
                ("scope", "r_usr w_usr"),
            ])
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        decode_grant(response).await
    }

    /// Exchange a refresh token for a fresh access token.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, ProviderError> {
        let response = self
            .http
            .post(format!("{}/token", self.auth_url))
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        decode_grant(response).await
    }
}

async fn decode_grant(response: reqwest::Response) -> Result<TokenGrant, ProviderError> {
    let status = response.status().as_u16();
    let body: Value = response
        .json()
        .await
        .map_err(|e| ProviderError::Transport(e.to_string()))?;

    if let Some(error) = body.get("error").and_then(Value::as_str) {
        // Expected while the user has not finished authorizing.
        if error == "authorization_pending" || error == "slow_down" {
            return Err(ProviderError::Pending(error.to_string()));
        }
        let description = body
            .get("error_description")
            .and_then(Value::as_str)
            .unwrap_or(error);
        return Err(ProviderError::classify(
            status.max(400),
            body.get("sub_status").and_then(Value::as_i64),
            description.to_string(),
        ));
    }

    serde_json::from_value(body).map_err(|e| ProviderError::Transport(e.to_string()))
}

async fn decode_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, ProviderError> {
    let status = response.status();
    if !status.is_success() {
        return Err(error_from_response(status.as_u16(), response).await);
    }
    response
        .json()
        .await
        .map_err(|e| ProviderError::Transport(e.to_string()))
}

async fn error_from_response(status: u16, response: reqwest::Response) -> ProviderError {
    let body: Value = response.json().await.unwrap_or(Value::Null);
    let sub_status = body
        .get("subStatus")
        .or_else(|| body.get("sub_status"))
        .and_then(Value::as_i64);
    let message = body
        .get("userMessage")
        .or_else(|| body.get("error_description"))
        .or_else(|| body.get("message"))
        .and_then(Value::as_str)
        .unwrap_or("request rejected")
        .to_string();
    ProviderError::classify(status, sub_status, message)
}

// ─────────────────────────────────────────────────────────────────────────────
// Session-scoped catalog client
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct SessionInfo {
    #[serde(rename = "sessionId", default)]
    pub session_id: Option<String>,
    #[serde(rename = "userId", default)]
    pub user_id: Option<Value>,
    #[serde(rename = "countryCode", default)]
    pub country_code: Option<String>,
}

/// Decoded stream manifest for one (track, quality) extraction.
#[derive(Debug, Clone)]
pub struct StreamManifest {
    pub urls: Vec<String>,
    pub quality: String,
    pub codec: String,
    pub content_type: String,
    pub bit_depth: Option<u32>,
    pub sample_rate: Option<u32>,
}

impl StreamManifest {
    pub fn primary_url(&self) -> Option<&str> {
        self.urls.first().map(String::as_str)
    }
}

/// Map a codec/quality label to a response content type.
pub fn content_type_for_codec(codec: &str) -> &'static str {
    let upper = codec.to_uppercase();
    if upper.contains("FLAC") || upper.contains("LOSSLESS") {
        "audio/flac"
    } else {
        "audio/mp4"
    }
}

/// Authenticated client bound to one user's session.
#[derive(Debug)]
pub struct ProviderClient {
    http: reqwest::Client,
    base_url: String,
    access_token: String,
    principal_id: String,
    region: String,
    context: ClientContext,
}

impl ProviderClient {
    pub fn new(
        base_url: &str,
        access_token: &str,
        principal_id: &str,
        region: &str,
    ) -> Self {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build provider HTTP client");
        Self {
            http,
            base_url: base_url.to_string(),
            access_token: access_token.to_string(),
            principal_id: principal_id.to_string(),
            region: region.to_string(),
            context: ClientContext::Native,
        }
    }

    async fn get(&self, path: &str, params: &[(&str, String)]) -> Result<Value, ProviderError> {
        self.get_with_context(path, params, self.context).await
    }

    async fn get_with_context(
        &self,
        path: &str,
        params: &[(&str, String)],
        context: ClientContext,
    ) -> Result<Value, ProviderError> {
        let mut request = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.access_token)
            .query(&[("countryCode", self.region.as_str())]);
        if context == ClientContext::Tv {
            request = request.query(&[("deviceType", "TV")]);
        }
        for (key, value) in params {
            request = request.query(&[(*key, value.as_str())]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(error_from_response(status.as_u16(), response).await);
        }
        response
            .json()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))
    }

    /// Lightweight session call used to verify stored tokens.
    pub async fn verify_session(&self) -> Result<SessionInfo, ProviderError> {
        let value = self.get("/sessions", &[]).await?;
        serde_json::from_value(value).map_err(|e| ProviderError::Transport(e.to_string()))
    }

    pub async fn search(&self, query: &str, limit: usize) -> Result<Value, ProviderError> {
        self.search_with(query, limit, self.context).await
    }

    /// Search with an explicit client context (used by the public-search
    /// fallback path).
    pub async fn search_with(
        &self,
        query: &str,
        limit: usize,
        context: ClientContext,
    ) -> Result<Value, ProviderError> {
        self.get_with_context(
            "/search",
            &[("query", query.to_string()), ("limit", limit.to_string())],
            context,
        )
        .await
    }

    pub async fn get_track(&self, track_id: &str) -> Result<Value, ProviderError> {
        self.get(&format!("/tracks/{track_id}"), &[]).await
    }

    pub async fn get_album(&self, album_id: &str) -> Result<Value, ProviderError> {
        self.get(&format!("/albums/{album_id}"), &[]).await
    }

    pub async fn get_album_items(
        &self,
        album_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Value, ProviderError> {
        self.get(
            &format!("/albums/{album_id}/items"),
            &[
                ("limit", limit.to_string()),
                ("offset", offset.to_string()),
            ],
        )
        .await
    }

    pub async fn get_artist(&self, artist_id: &str) -> Result<Value, ProviderError> {
        self.get(&format!("/artists/{artist_id}"), &[]).await
    }

    pub async fn library_tracks(&self, limit: usize) -> Result<Value, ProviderError> {
        self.get(
            &format!("/users/{}/favorites/tracks", self.principal_id),
            &[
                ("limit", limit.to_string()),
                ("order", "DATE".to_string()),
                ("orderDirection", "DESC".to_string()),
            ],
        )
        .await
    }

    pub async fn library_albums(&self, limit: usize) -> Result<Value, ProviderError> {
        self.get(
            &format!("/users/{}/favorites/albums", self.principal_id),
            &[
                ("limit", limit.to_string()),
                ("order", "DATE".to_string()),
                ("orderDirection", "DESC".to_string()),
            ],
        )
        .await
    }

    /// Fetch the playback manifest for a track at the requested quality.
    pub async fn track_stream(
        &self,
        track_id: &str,
        quality: StreamQuality,
    ) -> Result<StreamManifest, ProviderError> {
        let value = self
            .get(
                &format!("/tracks/{track_id}/playbackinfo"),
                &[
                    ("audioquality", quality.as_str().to_string()),
                    ("playbackmode", "STREAM".to_string()),
                    ("assetpresentation", "FULL".to_string()),
                ],
            )
            .await?;
        Ok(parse_stream_manifest(&value, quality))
    }
}

/// Decode the playback-info payload into a manifest. Tolerates both a flat
/// `urls` array and a nested `manifest.urls` list.
pub fn parse_stream_manifest(value: &Value, requested: StreamQuality) -> StreamManifest {
    let urls: Vec<String> = value
        .get("urls")
        .or_else(|| value.get("manifest").and_then(|m| m.get("urls")))
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();

    let quality = value
        .get("audioQuality")
        .and_then(Value::as_str)
        .unwrap_or(requested.as_str())
        .to_string();
    let codec = value
        .get("codec")
        .or_else(|| value.get("manifest").and_then(|m| m.get("codecs")))
        .and_then(Value::as_str)
        .unwrap_or(if quality.contains("LOSSLESS") {
            "FLAC"
        } else {
            "AAC"
        })
        .to_string();

    StreamManifest {
        content_type: content_type_for_codec(&codec).to_string(),
        urls,
        quality,
        codec,
        bit_depth: value
            .get("bitDepth")
            .and_then(Value::as_u64)
            .map(|v| v as u32),
        sample_rate: value
            .get("sampleRate")
            .and_then(Value::as_u64)
            .map(|v| v as u32),
    }
}

/// Age-restriction markers in provider/extraction errors.
pub fn is_age_restricted_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("age") && (lower.contains("confirm") || lower.contains("restricted"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classify_token_expired_by_sub_status() {
        let err = ProviderError::classify(401, Some(11003), "The token has expired".into());
        assert!(err.is_token_expired());
    }

    #[test]
    fn test_classify_token_expired_by_message() {
        let err = ProviderError::classify(401, None, "Token expired on time".into());
        assert!(err.is_token_expired());
        let err = ProviderError::classify(401, None, "missing scope".into());
        assert!(!err.is_token_expired());
    }

    #[test]
    fn test_classify_invalid_argument() {
        let err =
            ProviderError::classify(400, None, "Request contains an invalid argument".into());
        assert!(err.is_invalid_argument());
    }

    #[test]
    fn test_grant_user_numeric_id() {
        let user: GrantUser =
            serde_json::from_value(json!({"userId": 123456, "countryCode": "US"})).unwrap();
        assert_eq!(user.id_string(), "123456");

        let user: GrantUser = serde_json::from_value(json!({"userId": "abc"})).unwrap();
        assert_eq!(user.id_string(), "abc");
    }

    #[test]
    fn test_content_type_for_codec() {
        assert_eq!(content_type_for_codec("FLAC"), "audio/flac");
        assert_eq!(content_type_for_codec("HI_RES_LOSSLESS"), "audio/flac");
        assert_eq!(content_type_for_codec("AAC"), "audio/mp4");
    }

    #[test]
    fn test_parse_stream_manifest_flat_urls() {
        let value = json!({
            "urls": ["https://cdn.example/a.flac"],
            "audioQuality": "LOSSLESS",
            "bitDepth": 16,
            "sampleRate": 44100
        });
        let manifest = parse_stream_manifest(&value, StreamQuality::Lossless);
        assert_eq!(manifest.primary_url(), Some("https://cdn.example/a.flac"));
        assert_eq!(manifest.content_type, "audio/flac");
        assert_eq!(manifest.bit_depth, Some(16));
    }

    #[test]
    fn test_parse_stream_manifest_empty() {
        let manifest = parse_stream_manifest(&json!({}), StreamQuality::High);
        assert!(manifest.primary_url().is_none());
        assert_eq!(manifest.content_type, "audio/mp4");
    }

    #[test]
    fn test_age_restricted_detection() {
        assert!(is_age_restricted_message(
            "Sign in to confirm your age before streaming"
        ));
        assert!(!is_age_restricted_message("not found"));
    }
}
