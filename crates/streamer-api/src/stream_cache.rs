//! TTL cache of short-lived stream URLs.
//!
//! Keyed by `(user, track, normalized quality)`. The TTL is sized below the
//! provider's URL lifetime so entries never outlive the URLs they hold.
//! Invalidation supports any prefix subset: whole user, user+track, or the
//! exact key.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use moka::sync::Cache;

/// Supported stream qualities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamQuality {
    Low,
    High,
    Lossless,
    HiResLossless,
}

impl StreamQuality {
    /// Normalize a raw quality string: trimmed and uppercased, with the
    /// `MAX` alias mapped to hi-res; anything unknown falls back to HIGH.
    pub fn normalize(input: Option<&str>) -> Self {
        let normalized = input.unwrap_or("HIGH").trim().to_uppercase();
        match normalized.as_str() {
            "LOW" => StreamQuality::Low,
            "HIGH" => StreamQuality::High,
            "LOSSLESS" => StreamQuality::Lossless,
            "HI_RES_LOSSLESS" | "MAX" => StreamQuality::HiResLossless,
            _ => StreamQuality::High,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamQuality::Low => "LOW",
            StreamQuality::High => "HIGH",
            StreamQuality::Lossless => "LOSSLESS",
            StreamQuality::HiResLossless => "HI_RES_LOSSLESS",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub user_id: String,
    pub track_id: String,
    pub quality: StreamQuality,
}

/// Cached extraction result.
#[derive(Debug, Clone)]
pub struct StreamUrlEntry {
    pub url: String,
    pub urls: Vec<String>,
    pub content_type: String,
    pub codec: String,
    pub quality: String,
    pub bit_depth: Option<u32>,
    pub sample_rate: Option<u32>,
    /// Unix seconds; exposed to clients in stream-info payloads.
    pub expires_at: u64,
}

pub struct StreamUrlCache {
    cache: Cache<StreamKey, Arc<StreamUrlEntry>>,
    ttl: Duration,
}

impl StreamUrlCache {
    pub fn new(ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(10_000)
            .time_to_live(ttl)
            .support_invalidation_closures()
            .build();
        Self { cache, ttl }
    }

    pub fn expiry_from_now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
            + self.ttl.as_secs()
    }

    pub fn get(&self, key: &StreamKey) -> Option<Arc<StreamUrlEntry>> {
        self.cache.get(key)
    }

    pub fn insert(&self, key: StreamKey, entry: StreamUrlEntry) -> Arc<StreamUrlEntry> {
        let entry = Arc::new(entry);
        self.cache.insert(key, entry.clone());
        entry
    }

    /// Evict the exact `(user, track, quality)` key.
    pub fn clear_exact(&self, key: &StreamKey) {
        self.cache.invalidate(key);
    }

    /// Evict all entries for a user's track, any quality.
    pub fn clear_track(&self, user_id: &str, track_id: &str) {
        let user_id = user_id.to_string();
        let track_id = track_id.to_string();
        let _ = self
            .cache
            .invalidate_entries_if(move |key, _| {
                key.user_id == user_id && key.track_id == track_id
            });
    }

    /// Evict every entry for a user (logout / token refresh).
    pub fn clear_user(&self, user_id: &str) {
        let user_id = user_id.to_string();
        let _ = self
            .cache
            .invalidate_entries_if(move |key, _| key.user_id == user_id);
    }

    /// Number of live entries (health endpoint).
    pub fn len(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(url: &str) -> StreamUrlEntry {
        StreamUrlEntry {
            url: url.to_string(),
            urls: vec![url.to_string()],
            content_type: "audio/flac".to_string(),
            codec: "FLAC".to_string(),
            quality: "LOSSLESS".to_string(),
            bit_depth: Some(16),
            sample_rate: Some(44_100),
            expires_at: 0,
        }
    }

    fn key(user: &str, track: &str, quality: StreamQuality) -> StreamKey {
        StreamKey {
            user_id: user.to_string(),
            track_id: track.to_string(),
            quality,
        }
    }

    #[test]
    fn test_quality_normalization() {
        assert_eq!(StreamQuality::normalize(Some("MAX")), StreamQuality::HiResLossless);
        assert_eq!(StreamQuality::normalize(Some(" lossless ")), StreamQuality::Lossless);
        assert_eq!(StreamQuality::normalize(Some("ultra")), StreamQuality::High);
        assert_eq!(StreamQuality::normalize(None), StreamQuality::High);
        assert_eq!(StreamQuality::normalize(Some("low")), StreamQuality::Low);
    }

    #[test]
    fn test_get_insert_and_exact_eviction() {
        let cache = StreamUrlCache::new(Duration::from_secs(600));
        let k = key("u1", "t1", StreamQuality::High);
        cache.insert(k.clone(), entry("https://cdn/a"));
        assert!(cache.get(&k).is_some());

        cache.clear_exact(&k);
        assert!(cache.get(&k).is_none());
    }

    #[test]
    fn test_clear_user_scopes_to_that_user() {
        let cache = StreamUrlCache::new(Duration::from_secs(600));
        let mine = key("u1", "t1", StreamQuality::High);
        let other = key("u2", "t1", StreamQuality::High);
        cache.insert(mine.clone(), entry("https://cdn/a"));
        cache.insert(other.clone(), entry("https://cdn/b"));

        cache.clear_user("u1");
        cache.cache.run_pending_tasks();
        assert!(cache.get(&mine).is_none());
        assert!(cache.get(&other).is_some());
    }

    #[test]
    fn test_clear_track_leaves_other_tracks() {
        let cache = StreamUrlCache::new(Duration::from_secs(600));
        let high = key("u1", "t1", StreamQuality::High);
        let lossless = key("u1", "t1", StreamQuality::Lossless);
        let other_track = key("u1", "t2", StreamQuality::High);
        cache.insert(high.clone(), entry("https://cdn/a"));
        cache.insert(lossless.clone(), entry("https://cdn/b"));
        cache.insert(other_track.clone(), entry("https://cdn/c"));

        cache.clear_track("u1", "t1");
        cache.cache.run_pending_tasks();
        assert!(cache.get(&high).is_none());
        assert!(cache.get(&lossless).is_none());
        assert!(cache.get(&other_track).is_some());
    }
}
