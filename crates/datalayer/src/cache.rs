//! TTL cache for resolved references.
//!
//! Keyed by `(collection, id)`.  An entry read after its `expires_at` is a
//! miss and is evicted on that read; an entry read at exactly `expires_at`
//! is still a hit.
//!
//! There is no capacity bound and no eviction beyond TTL expiry: a
//! long-lived process that keeps touching new ids grows this map without
//! limit until [`ReferenceCache::purge_expired`], `clear` or `reset` is
//! called.  Bounded eviction is not provided.
//!
//! Writes are last-write-wins.  A resolver that suspends between a miss and
//! its `set` may find the entry already written by another task; the second
//! write simply replaces the first.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use store::Document;

use crate::clock::{Clock, SystemClock};
use crate::config::CacheConfig;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub collection: String,
    pub id: String,
}

impl CacheKey {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Document,
    expires_at: DateTime<Utc>,
}

/// Point-in-time counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

impl CacheStats {
    /// Hit rate in `0.0..=1.0`; `0.0` before any lookup.
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Shared reference cache.  Construct once and pass an `Arc` to every
/// resolver that should share it.
pub struct ReferenceCache {
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ReferenceCache {
    pub fn new(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            config,
            clock,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn with_system_clock(config: CacheConfig) -> Self {
        Self::new(config, Arc::new(SystemClock))
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<CacheKey, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// TTL configured for `collection`.
    pub fn ttl_for(&self, collection: &str) -> Duration {
        self.config.ttl_for(collection)
    }

    pub fn get(&self, key: &CacheKey) -> Option<Document> {
        let now = self.clock.now();
        let mut entries = self.entries();
        let lookup = entries
            .get(key)
            .map(|entry| (now <= entry.expires_at).then(|| entry.value.clone()));
        match lookup {
            Some(Some(value)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            Some(None) => {
                entries.remove(key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!(collection = %key.collection, id = %key.id, "cache entry expired");
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn set(&self, key: CacheKey, value: Document, ttl: Duration) {
        let now = self.clock.now();
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.entries().insert(key, CacheEntry { value, expires_at });
    }

    /// Store a document under its own id with the collection's TTL.
    pub fn put(&self, collection: &str, value: Document) {
        let ttl = self.ttl_for(collection);
        self.set(CacheKey::new(collection, value.id.clone()), value, ttl);
    }

    pub fn evict(&self, key: &CacheKey) -> bool {
        self.entries().remove(key).is_some()
    }

    /// Drop every entry of one collection.  Returns how many were removed.
    pub fn evict_collection(&self, collection: &str) -> usize {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|key, _| key.collection != collection);
        before - entries.len()
    }

    /// Eagerly drop every expired entry.  Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, entry| now <= entry.expires_at);
        before - entries.len()
    }

    pub fn clear(&self) {
        self.entries().clear();
    }

    /// Clear entries and counters.
    pub fn reset(&self) {
        self.clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;
    use serde_json::json;

    fn fixture() -> (ReferenceCache, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap());
        let cache = ReferenceCache::new(CacheConfig::default(), Arc::new(clock.clone()));
        (cache, clock)
    }

    fn venue(id: &str) -> Document {
        Document::new(id, json!({ "name": format!("venue {id}") }))
    }

    #[test]
    fn repeated_reads_return_the_same_value() {
        let (cache, _) = fixture();
        cache.put("venues", venue("v1"));
        let key = CacheKey::new("venues", "v1");
        let first = cache.get(&key).unwrap();
        let second = cache.get(&key).unwrap();
        assert_eq!(first, second);
        assert_eq!(cache.stats().hits, 2);
    }

    #[test]
    fn hit_at_ttl_boundary_miss_after() {
        let (cache, clock) = fixture();
        let key = CacheKey::new("venues", "v1");
        cache.set(key.clone(), venue("v1"), Duration::from_secs(60));

        clock.advance(Duration::from_secs(60));
        assert!(cache.get(&key).is_some(), "exactly at ttl is still a hit");

        clock.advance(Duration::from_millis(1));
        assert!(cache.get(&key).is_none());
        // Lazily evicted by the expired read.
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn collection_ttl_applies_on_put() {
        let (cache, clock) = fixture();
        cache.put("form_submissions", venue("f1"));
        cache.put("structures", venue("s1"));

        clock.advance(Duration::from_secs(31));
        assert!(cache.get(&CacheKey::new("form_submissions", "f1")).is_none());
        assert!(cache.get(&CacheKey::new("structures", "s1")).is_some());
    }

    #[test]
    fn last_write_wins() {
        let (cache, _) = fixture();
        cache.put("venues", venue("v1"));
        cache.put("venues", Document::new("v1", json!({ "name": "renamed" })));
        let got = cache.get(&CacheKey::new("venues", "v1")).unwrap();
        assert_eq!(got.str_field("name"), Some("renamed"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn evict_collection_and_purge() {
        let (cache, clock) = fixture();
        cache.put("venues", venue("v1"));
        cache.put("venues", venue("v2"));
        cache.put("contacts", venue("p1"));
        cache.set(CacheKey::new("tmp", "t1"), venue("t1"), Duration::from_secs(1));

        assert_eq!(cache.evict_collection("venues"), 2);
        assert!(cache.evict(&CacheKey::new("contacts", "p1")));
        assert!(!cache.evict(&CacheKey::new("contacts", "p1")));

        clock.advance(Duration::from_secs(2));
        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn reset_clears_counters() {
        let (cache, _) = fixture();
        cache.put("venues", venue("v1"));
        let _ = cache.get(&CacheKey::new("venues", "v1"));
        let _ = cache.get(&CacheKey::new("venues", "nope"));
        assert!((cache.stats().hit_rate() - 0.5).abs() < f64::EPSILON);

        cache.reset();
        assert_eq!(
            cache.stats(),
            CacheStats {
                hits: 0,
                misses: 0,
                entries: 0
            }
        );
    }
}
