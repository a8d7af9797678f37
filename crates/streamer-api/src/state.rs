//! Shared application state for the streamer API.

use std::sync::Arc;
use std::time::Duration;

use audioscope_core::config::StreamerConfig;

use crate::governor::RequestGovernor;
use crate::provider::{AuthApi, USER_AGENT};
use crate::search_cache::SearchCache;
use crate::sessions::SessionRegistry;
use crate::stream_cache::StreamUrlCache;

pub struct AppState {
    pub config: StreamerConfig,
    pub sessions: Arc<SessionRegistry>,
    pub urls: Arc<StreamUrlCache>,
    pub searches: Arc<SearchCache>,
    pub governor: Arc<RequestGovernor>,
    pub auth: AuthApi,
    /// Client for upstream CDN byte streams: bounded connect and read
    /// timeouts, no total-request timeout (streams stay open).
    pub upstream: reqwest::Client,
}

impl AppState {
    pub fn new(config: StreamerConfig) -> Self {
        let urls = Arc::new(StreamUrlCache::new(config.stream_cache_ttl));
        let auth = AuthApi::new(&config);
        let sessions = Arc::new(SessionRegistry::new(
            auth.clone(),
            &config.provider_base_url,
            urls.clone(),
        ));
        let searches = Arc::new(SearchCache::new(config.search_cache_ttl));
        let governor = Arc::new(RequestGovernor::new(
            config.batch_concurrency,
            (config.extract_delay_min, config.extract_delay_max),
            (config.batch_delay_min, config.batch_delay_max),
        ));
        let upstream = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(30))
            .read_timeout(Duration::from_secs(300))
            .build()
            .expect("failed to build upstream HTTP client");

        Self {
            config,
            sessions,
            urls,
            searches,
            governor,
            auth,
            upstream,
        }
    }
}
