//! Per-user streaming session registry.
//!
//! Each user gets an authenticated provider client plus their stored
//! credentials. A per-user mutex serializes session creation and refresh so
//! concurrent requests never stampede the token endpoint; whichever request
//! wins the race refreshes, the rest re-verify and reuse the new handle.
//! Refreshing or invalidating a session also drops the user's cached stream
//! URLs, which are tied to the prior auth state.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{info, warn};

use crate::errors::ApiError;
use crate::provider::{AuthApi, ProviderClient, ProviderError};
use crate::stream_cache::StreamUrlCache;

#[derive(Debug, Clone)]
pub struct SessionTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub principal_id: String,
    pub region: String,
}

#[derive(Debug)]
pub struct Session {
    pub client: ProviderClient,
    pub tokens: SessionTokens,
}

struct UserEntry {
    /// Serializes restore/refresh for this user.
    gate: tokio::sync::Mutex<()>,
    session: RwLock<Option<Arc<Session>>>,
    /// Public-search fallback: once the native client context is rejected
    /// with an invalid-argument error, this user sticks to the TV context
    /// until logout or credential restore.
    fallback: AtomicBool,
}

impl UserEntry {
    fn new() -> Self {
        Self {
            gate: tokio::sync::Mutex::new(()),
            session: RwLock::new(None),
            fallback: AtomicBool::new(false),
        }
    }
}

/// Outcome of a credential restore.
pub struct RestoreOutcome {
    pub refreshed: bool,
    pub tokens: SessionTokens,
}

pub struct SessionRegistry {
    users: RwLock<HashMap<String, Arc<UserEntry>>>,
    auth: AuthApi,
    base_url: String,
    urls: Arc<StreamUrlCache>,
}

impl SessionRegistry {
    pub fn new(auth: AuthApi, base_url: &str, urls: Arc<StreamUrlCache>) -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
            auth,
            base_url: base_url.to_string(),
            urls,
        }
    }

    fn entry(&self, user_id: &str) -> Arc<UserEntry> {
        if let Some(entry) = self.users.read().expect("registry lock").get(user_id) {
            return entry.clone();
        }
        self.users
            .write()
            .expect("registry lock")
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(UserEntry::new()))
            .clone()
    }

    pub fn get(&self, user_id: &str) -> Result<Arc<Session>, ApiError> {
        self.users
            .read()
            .expect("registry lock")
            .get(user_id)
            .and_then(|entry| entry.session.read().expect("session lock").clone())
            .ok_or_else(|| {
                ApiError::Unauthenticated(format!(
                    "No session for user {user_id}. Restore credentials first."
                ))
            })
    }

    pub fn is_authenticated(&self, user_id: &str) -> bool {
        self.get(user_id).is_ok()
    }

    pub fn authenticated_count(&self) -> usize {
        self.users
            .read()
            .expect("registry lock")
            .values()
            .filter(|entry| entry.session.read().expect("session lock").is_some())
            .count()
    }

    // ── Fallback flag (public search) ────────────────────────────────────

    pub fn uses_fallback(&self, user_id: &str) -> bool {
        self.users
            .read()
            .expect("registry lock")
            .get(user_id)
            .map(|entry| entry.fallback.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    pub fn set_fallback(&self, user_id: &str) {
        self.entry(user_id).fallback.store(true, Ordering::Relaxed);
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    /// Build and verify a session from stored credentials. When the access
    /// token is already expired, refresh once and retry the verify.
    pub async fn restore(
        &self,
        user_id: &str,
        tokens: SessionTokens,
    ) -> Result<RestoreOutcome, ApiError> {
        let entry = self.entry(user_id);
        let _guard = entry.gate.lock().await;

        let client = ProviderClient::new(
            &self.base_url,
            &tokens.access_token,
            &tokens.principal_id,
            &tokens.region,
        );

        let (session, refreshed) = match client.verify_session().await {
            Ok(_) => (
                Arc::new(Session {
                    client,
                    tokens: tokens.clone(),
                }),
                false,
            ),
            Err(e) if e.is_token_expired() => {
                warn!(user_id, "Session expired during restore, attempting refresh");
                let session = self
                    .refresh_session(user_id, &tokens.refresh_token)
                    .await?;
                (session, true)
            }
            Err(e) => {
                return Err(ApiError::Unauthenticated(format!(
                    "Invalid credentials: {e}"
                )));
            }
        };

        *entry.session.write().expect("session lock") = Some(session.clone());
        entry.fallback.store(false, Ordering::Relaxed);
        self.urls.clear_user(user_id);

        info!(
            user_id,
            principal = %session.tokens.principal_id,
            refreshed,
            "Restored streaming session"
        );
        Ok(RestoreOutcome {
            refreshed,
            tokens: session.tokens.clone(),
        })
    }

    /// Drop the user's session, credentials, fallback flag, and cached URLs.
    pub fn invalidate(&self, user_id: &str) {
        if let Some(entry) = self.users.read().expect("registry lock").get(user_id) {
            *entry.session.write().expect("session lock") = None;
            entry.fallback.store(false, Ordering::Relaxed);
        }
        self.urls.clear_user(user_id);
        info!(user_id, "Cleared streaming session");
    }

    /// Execute `op` against the user's session; when the provider signals an
    /// expired token, refresh under the user's mutex and re-run once.
    pub async fn run_with_refresh<T, F, Fut>(&self, user_id: &str, op: F) -> Result<T, ApiError>
    where
        F: Fn(Arc<Session>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let session = self.get(user_id)?;

        match op(session.clone()).await {
            Ok(value) => Ok(value),
            Err(e) if e.is_token_expired() => {
                warn!(user_id, "Token expired mid-request; refreshing and retrying once");
                let refreshed = self.refresh_under_gate(user_id, &session).await?;
                op(refreshed).await.map_err(map_provider_error)
            }
            Err(e) => Err(map_provider_error(e)),
        }
    }

    /// Refresh holding the per-user gate. Another request may already have
    /// refreshed while we waited, so the current handle is re-verified first.
    async fn refresh_under_gate(
        &self,
        user_id: &str,
        observed: &Arc<Session>,
    ) -> Result<Arc<Session>, ApiError> {
        let entry = self.entry(user_id);
        let _guard = entry.gate.lock().await;

        let current = entry
            .session
            .read()
            .expect("session lock")
            .clone()
            .ok_or_else(|| {
                ApiError::Unauthenticated(format!("No session for user {user_id}"))
            })?;

        // A different handle than the one that failed means someone else
        // already refreshed.
        if !Arc::ptr_eq(&current, observed) {
            return Ok(current);
        }

        match current.client.verify_session().await {
            Ok(_) => return Ok(current),
            Err(e) if e.is_token_expired() => {}
            Err(e) => return Err(map_provider_error(e)),
        }

        let session = self
            .refresh_session(user_id, &current.tokens.refresh_token)
            .await?;
        *entry.session.write().expect("session lock") = Some(session.clone());
        self.urls.clear_user(user_id);
        info!(user_id, "Refreshed streaming session");
        Ok(session)
    }

    /// Exchange the refresh token, build a new client, and verify it.
    async fn refresh_session(
        &self,
        user_id: &str,
        refresh_token: &str,
    ) -> Result<Arc<Session>, ApiError> {
        if refresh_token.is_empty() {
            self.invalidate(user_id);
            return Err(ApiError::Unauthenticated(format!(
                "No refresh token available for user {user_id}"
            )));
        }

        let grant = match self.auth.refresh(refresh_token).await {
            Ok(grant) => grant,
            Err(e) => {
                warn!(user_id, error = %e, "Token refresh failed");
                self.invalidate(user_id);
                return Err(ApiError::Unauthenticated(
                    "Session expired and token refresh failed".to_string(),
                ));
            }
        };

        let principal_id = grant.user.id_string();
        let region = grant.user.country_code.clone().unwrap_or_default();
        let client =
            ProviderClient::new(&self.base_url, &grant.access_token, &principal_id, &region);

        if let Err(e) = client.verify_session().await {
            self.invalidate(user_id);
            return Err(ApiError::Unauthenticated(format!(
                "Refreshed session failed verification: {e}"
            )));
        }

        Ok(Arc::new(Session {
            client,
            tokens: SessionTokens {
                access_token: grant.access_token,
                refresh_token: refresh_token.to_string(),
                principal_id,
                region,
            },
        }))
    }
}

/// Map provider errors onto client-facing API errors.
pub fn map_provider_error(e: ProviderError) -> ApiError {
    match e {
        ProviderError::TokenExpired(msg) => ApiError::Unauthenticated(msg),
        ProviderError::Pending(msg) => ApiError::AuthPending(msg),
        ProviderError::InvalidArgument(msg) => ApiError::BadRequest(msg),
        ProviderError::Api { status: 404, message, .. } => ApiError::NotFound(message),
        ProviderError::Api { status, message, .. } if status >= 500 => {
            ApiError::BadGateway(message)
        }
        ProviderError::Api { status, message, .. } => {
            ApiError::Internal(format!("provider error ({status}): {message}"))
        }
        ProviderError::Transport(msg) => ApiError::BadGateway(msg),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use audioscope_core::config::StreamerConfig;
    use std::time::Duration;

    fn test_registry() -> SessionRegistry {
        let config = StreamerConfig {
            bind_address: "127.0.0.1".into(),
            port: 8585,
            music_path: "/music".into(),
            provider_base_url: "http://localhost:9".into(),
            provider_auth_url: "http://localhost:9".into(),
            provider_client_id: String::new(),
            provider_client_secret: String::new(),
            batch_concurrency: 3,
            batch_delay_min: 0.0,
            batch_delay_max: 0.0,
            extract_delay_min: 0.0,
            extract_delay_max: 0.0,
            stream_cache_ttl: Duration::from_secs(600),
            search_cache_ttl: Duration::from_secs(300),
            track_delay: Duration::from_secs(0),
        };
        let urls = Arc::new(StreamUrlCache::new(config.stream_cache_ttl));
        SessionRegistry::new(AuthApi::new(&config), &config.provider_base_url, urls)
    }

    #[test]
    fn test_get_without_session_is_unauthenticated() {
        let registry = test_registry();
        let err = registry.get("u1").unwrap_err();
        assert!(matches!(err, ApiError::Unauthenticated(_)));
        assert!(!registry.is_authenticated("u1"));
        assert_eq!(registry.authenticated_count(), 0);
    }

    #[test]
    fn test_fallback_flag_lifecycle() {
        let registry = test_registry();
        assert!(!registry.uses_fallback("u1"));
        registry.set_fallback("u1");
        assert!(registry.uses_fallback("u1"));

        // Logout clears the flag.
        registry.invalidate("u1");
        assert!(!registry.uses_fallback("u1"));
    }

    #[test]
    fn test_map_provider_errors() {
        assert!(matches!(
            map_provider_error(ProviderError::TokenExpired("x".into())),
            ApiError::Unauthenticated(_)
        ));
        assert!(matches!(
            map_provider_error(ProviderError::Api {
                status: 404,
                sub_status: None,
                message: "gone".into()
            }),
            ApiError::NotFound(_)
        ));
        assert!(matches!(
            map_provider_error(ProviderError::Api {
                status: 503,
                sub_status: None,
                message: "down".into()
            }),
            ApiError::BadGateway(_)
        ));
        assert!(matches!(
            map_provider_error(ProviderError::Pending("authorization_pending".into())),
            ApiError::AuthPending(_)
        ));
    }
}
