//! Short-TTL cache for provider search results.
//!
//! Identical queries inside the TTL window are served from memory instead of
//! re-issuing provider requests.

use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;
use serde_json::Value;

pub struct SearchCache {
    cache: Cache<String, Arc<Value>>,
}

impl SearchCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(5_000)
                .time_to_live(ttl)
                .build(),
        }
    }

    pub fn key(user_id: &str, query: &str, limit: usize) -> String {
        format!("{user_id}:{query}:{limit}")
    }

    pub fn get(&self, key: &str) -> Option<Arc<Value>> {
        self.cache.get(key)
    }

    pub fn insert(&self, key: String, value: Value) -> Arc<Value> {
        let value = Arc::new(value);
        self.cache.insert(key, value.clone());
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_is_user_scoped() {
        assert_ne!(
            SearchCache::key("u1", "query", 20),
            SearchCache::key("u2", "query", 20)
        );
    }

    #[test]
    fn test_round_trip() {
        let cache = SearchCache::new(Duration::from_secs(300));
        let key = SearchCache::key("u1", "warm jazz", 20);
        assert!(cache.get(&key).is_none());
        cache.insert(key.clone(), json!({"tracks": []}));
        assert!(cache.get(&key).is_some());
    }
}
