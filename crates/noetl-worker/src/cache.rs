//! TTL cache for resolved credentials.
//!
//! The catalog remains authoritative; this only shaves repeated lookups
//! inside one worker process.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;

pub struct TtlCache {
    entries: DashMap<String, (Value, Instant)>,
    ttl: Duration,
}

impl TtlCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let entry = self.entries.get(key)?;
        let (value, stored_at) = entry.value();
        if stored_at.elapsed() > self.ttl {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        Some(value.clone())
    }

    pub fn put(&self, key: impl Into<String>, value: Value) {
        self.entries.insert(key.into(), (value, Instant::now()));
    }

    pub fn invalidate(&self, key: &str) {
        self.entries.remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_put_get() {
        let cache = TtlCache::new(Duration::from_secs(60));
        cache.put("pg_main", json!({"user": "noetl"}));
        assert_eq!(cache.get("pg_main"), Some(json!({"user": "noetl"})));
        assert_eq!(cache.get("missing"), None);
    }

    #[test]
    fn test_expiry() {
        let cache = TtlCache::new(Duration::ZERO);
        cache.put("k", json!(1));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get("k"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_invalidate() {
        let cache = TtlCache::new(Duration::from_secs(60));
        cache.put("k", json!(1));
        cache.invalidate("k");
        assert_eq!(cache.get("k"), None);
    }
}
