//! Bounded in-memory response store.
//!
//! Entries are kept in an `LruCache` behind a single `RwLock`, with a running
//! byte total so the store honours both an entry limit and a size budget.
//! Under FIFO eviction lookups use `peek`, so hits never promote an entry.

use std::sync::{Arc, RwLock};

use lru::LruCache;
use metrics::{counter, gauge};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::config::{CacheConfig, EvictionPolicy};
use super::entry::{CacheEntry, Freshness};
use super::keys::CacheKey;
use super::lock::{rw_read, rw_write};
use super::stats::{
    CacheStats, METRIC_CACHE_BYTES, METRIC_CACHE_ENTRIES, METRIC_CACHE_EVICT, METRIC_CACHE_STORE,
};

const SOURCE: &str = "cache::store";

/// Result of looking a key up at a given instant.
#[derive(Debug, Clone)]
pub enum Lookup {
    Fresh(Arc<CacheEntry>),
    Stale(Arc<CacheEntry>),
    Miss,
}

struct Inner {
    entries: LruCache<CacheKey, Arc<CacheEntry>>,
    bytes: u64,
}

impl Inner {
    fn remove(&mut self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        let removed = self.entries.pop(key)?;
        self.bytes = self.bytes.saturating_sub(removed.size());
        Some(removed)
    }

    fn reset(&mut self) {
        self.entries.clear();
        self.bytes = 0;
    }
}

/// Shared response store.
pub struct ResponseStore {
    inner: RwLock<Inner>,
    config: CacheConfig,
}

impl ResponseStore {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            inner: RwLock::new(Inner {
                entries: LruCache::new(config.max_entries_non_zero()),
                bytes: 0,
            }),
            config: config.clone(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Look up `key` as of `now`.
    ///
    /// Expired and inconsistent entries are removed on the way and reported as
    /// a miss. A poisoned lock drops the whole store.
    pub fn lookup(&self, key: &CacheKey, now: Instant) -> Lookup {
        match self.config.eviction {
            EvictionPolicy::Lru => self.lookup_promoting(key, now),
            EvictionPolicy::Fifo => self.lookup_shared(key, now),
        }
    }

    /// LRU lookups reorder the list, so they hold the write lock.
    fn lookup_promoting(&self, key: &CacheKey, now: Instant) -> Lookup {
        let acquired = rw_write(&self.inner, SOURCE, "lookup");
        let mut inner = acquired.guard;
        if acquired.recovered {
            inner.reset();
            publish_gauges(&inner);
            return Lookup::Miss;
        }

        let Some(entry) = inner.entries.get(key).cloned() else {
            return Lookup::Miss;
        };
        match inspect(key, entry, now) {
            Some(found) => found,
            None => {
                inner.remove(key);
                publish_gauges(&inner);
                Lookup::Miss
            }
        }
    }

    /// FIFO lookups only `peek`; the write lock is taken just to drop a dead entry.
    fn lookup_shared(&self, key: &CacheKey, now: Instant) -> Lookup {
        let found = {
            let acquired = rw_read(&self.inner, SOURCE, "lookup");
            if acquired.recovered {
                None
            } else {
                Some(acquired.guard.entries.peek(key).cloned())
            }
        };
        let Some(found) = found else {
            self.invalidate_all();
            return Lookup::Miss;
        };
        let Some(entry) = found else {
            return Lookup::Miss;
        };

        match inspect(key, Arc::clone(&entry), now) {
            Some(found) => found,
            None => {
                self.invalidate_entry(key, &entry);
                Lookup::Miss
            }
        }
    }

    /// Store `entry` under `key`, replacing any previous object and evicting
    /// until both limits hold. Returns `false` when the object is too large to
    /// be stored at all.
    pub fn insert(&self, key: CacheKey, entry: CacheEntry) -> bool {
        let size = entry.size();
        if size > self.config.max_object_bytes || size > self.config.max_total_bytes {
            debug!(
                source = SOURCE,
                key = %key,
                size,
                max_object_bytes = self.config.max_object_bytes,
                "Object exceeds size limit, not stored"
            );
            return false;
        }

        let acquired = rw_write(&self.inner, SOURCE, "insert");
        let mut inner = acquired.guard;
        if acquired.recovered {
            inner.reset();
        }

        inner.remove(&key);

        let mut evicted = 0u64;
        while inner.bytes + size > self.config.max_total_bytes {
            let Some((_, victim)) = inner.entries.pop_lru() else {
                break;
            };
            inner.bytes = inner.bytes.saturating_sub(victim.size());
            evicted += 1;
        }

        if let Some((_, victim)) = inner.entries.push(key, Arc::new(entry)) {
            inner.bytes = inner.bytes.saturating_sub(victim.size());
            evicted += 1;
        }
        inner.bytes += size;

        if evicted > 0 {
            counter!(METRIC_CACHE_EVICT).increment(evicted);
        }
        counter!(METRIC_CACHE_STORE).increment(1);
        publish_gauges(&inner);
        true
    }

    /// Remove the object under `key`. Returns whether one was present.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        let acquired = rw_write(&self.inner, SOURCE, "invalidate");
        let mut inner = acquired.guard;
        if acquired.recovered {
            inner.reset();
            publish_gauges(&inner);
            return false;
        }
        let removed = inner.remove(key).is_some();
        publish_gauges(&inner);
        removed
    }

    /// Remove the object under `key` only if it is still `expected`.
    pub fn invalidate_entry(&self, key: &CacheKey, expected: &Arc<CacheEntry>) -> bool {
        let acquired = rw_write(&self.inner, SOURCE, "invalidate_entry");
        let mut inner = acquired.guard;
        if acquired.recovered {
            inner.reset();
            publish_gauges(&inner);
            return false;
        }
        let current = inner
            .entries
            .peek(key)
            .is_some_and(|entry| Arc::ptr_eq(entry, expected));
        if current {
            inner.remove(key);
            publish_gauges(&inner);
        }
        current
    }

    /// Drop every object. Returns how many were removed.
    pub fn invalidate_all(&self) -> usize {
        let acquired = rw_write(&self.inner, SOURCE, "invalidate_all");
        let mut inner = acquired.guard;
        let removed = if acquired.recovered {
            0
        } else {
            inner.entries.len()
        };
        inner.reset();
        publish_gauges(&inner);
        removed
    }

    /// Remove entries past their grace window. Returns how many were removed.
    pub fn purge_expired(&self, now: Instant) -> usize {
        let acquired = rw_write(&self.inner, SOURCE, "purge_expired");
        let mut inner = acquired.guard;
        if acquired.recovered {
            inner.reset();
            publish_gauges(&inner);
            return 0;
        }

        let doomed: Vec<CacheKey> = inner
            .entries
            .iter()
            .filter(|(_, entry)| {
                entry.freshness(now) == Freshness::Expired || !entry.is_consistent()
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            inner.remove(key);
        }
        publish_gauges(&inner);
        doomed.len()
    }

    pub fn len(&self) -> usize {
        rw_read(&self.inner, SOURCE, "len").guard.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes(&self) -> u64 {
        rw_read(&self.inner, SOURCE, "bytes").guard.bytes
    }

    pub fn stats(&self) -> CacheStats {
        let acquired = rw_read(&self.inner, SOURCE, "stats");
        let (entries, bytes) = if acquired.recovered {
            (0, 0)
        } else {
            (acquired.guard.entries.len(), acquired.guard.bytes)
        };
        CacheStats {
            entries,
            bytes,
            max_entries: self.config.max_entries,
            max_total_bytes: self.config.max_total_bytes,
            eviction: match self.config.eviction {
                EvictionPolicy::Lru => "lru",
                EvictionPolicy::Fifo => "fifo",
            },
        }
    }
}

/// Classify a found entry; `None` means it must be dropped.
fn inspect(key: &CacheKey, entry: Arc<CacheEntry>, now: Instant) -> Option<Lookup> {
    if !entry.is_consistent() {
        warn!(
            source = SOURCE,
            key = %key,
            stored_bytes = entry.size(),
            "Dropping cache entry whose Content-Length disagrees with its body"
        );
        return None;
    }
    match entry.freshness(now) {
        Freshness::Fresh => Some(Lookup::Fresh(entry)),
        Freshness::Stale => Some(Lookup::Stale(entry)),
        Freshness::Expired => None,
    }
}

fn publish_gauges(inner: &Inner) {
    gauge!(METRIC_CACHE_ENTRIES).set(inner.entries.len() as f64);
    gauge!(METRIC_CACHE_BYTES).set(inner.bytes as f64);
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use std::time::Duration;

    use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
    use bytes::Bytes;

    use super::*;
    use crate::cache::directives::Lifetime;

    fn key(url: &str) -> CacheKey {
        CacheKey::new(Method::GET, url)
    }

    fn entry(body: &'static [u8], ttl: u64, grace: u64) -> CacheEntry {
        CacheEntry::new(
            StatusCode::OK,
            HeaderMap::new(),
            Bytes::from_static(body),
            Lifetime::new(Duration::from_secs(ttl), Duration::from_secs(grace)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn lookup_reports_fresh_stale_and_miss() {
        let store = ResponseStore::new(&CacheConfig::default());
        store.insert(key("/a"), entry(b"a", 10, 5));

        assert!(matches!(
            store.lookup(&key("/a"), Instant::now()),
            Lookup::Fresh(_)
        ));

        tokio::time::advance(Duration::from_secs(12)).await;
        assert!(matches!(
            store.lookup(&key("/a"), Instant::now()),
            Lookup::Stale(_)
        ));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(matches!(
            store.lookup(&key("/a"), Instant::now()),
            Lookup::Miss
        ));
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn entry_limit_evicts_least_recently_used() {
        let config = CacheConfig {
            max_entries: 2,
            ..Default::default()
        };
        let store = ResponseStore::new(&config);
        store.insert(key("/1"), entry(b"1", 60, 0));
        store.insert(key("/2"), entry(b"2", 60, 0));

        // Touch /1 so /2 becomes the eviction candidate.
        assert!(matches!(
            store.lookup(&key("/1"), Instant::now()),
            Lookup::Fresh(_)
        ));
        store.insert(key("/3"), entry(b"3", 60, 0));

        let now = Instant::now();
        assert!(matches!(store.lookup(&key("/1"), now), Lookup::Fresh(_)));
        assert!(matches!(store.lookup(&key("/2"), now), Lookup::Miss));
        assert!(matches!(store.lookup(&key("/3"), now), Lookup::Fresh(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn fifo_ignores_hits_when_evicting() {
        let config = CacheConfig {
            max_entries: 2,
            eviction: EvictionPolicy::Fifo,
            ..Default::default()
        };
        let store = ResponseStore::new(&config);
        store.insert(key("/1"), entry(b"1", 60, 0));
        store.insert(key("/2"), entry(b"2", 60, 0));
        store.lookup(&key("/1"), Instant::now());
        store.insert(key("/3"), entry(b"3", 60, 0));

        let now = Instant::now();
        assert!(matches!(store.lookup(&key("/1"), now), Lookup::Miss));
        assert!(matches!(store.lookup(&key("/2"), now), Lookup::Fresh(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn fifo_lookup_drops_expired_entry() {
        let config = CacheConfig {
            eviction: EvictionPolicy::Fifo,
            ..Default::default()
        };
        let store = ResponseStore::new(&config);
        store.insert(key("/a"), entry(b"a", 1, 1));
        store.insert(key("/b"), entry(b"b", 60, 0));

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(matches!(
            store.lookup(&key("/a"), Instant::now()),
            Lookup::Miss
        ));
        assert_eq!(store.len(), 1);
        assert_eq!(store.bytes(), 1);
        assert!(matches!(
            store.lookup(&key("/b"), Instant::now()),
            Lookup::Fresh(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn fifo_lookup_recovers_from_poisoned_lock() {
        let config = CacheConfig {
            eviction: EvictionPolicy::Fifo,
            ..Default::default()
        };
        let store = ResponseStore::new(&config);
        store.insert(key("/a"), entry(b"a", 60, 0));

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = store.inner.write().expect("store lock should be acquired");
            panic!("poison store lock");
        }));

        assert!(matches!(
            store.lookup(&key("/a"), Instant::now()),
            Lookup::Miss
        ));
        assert!(store.is_empty());
        assert!(store.insert(key("/b"), entry(b"b", 60, 0)));
        assert!(matches!(
            store.lookup(&key("/b"), Instant::now()),
            Lookup::Fresh(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn byte_budget_is_enforced() {
        let config = CacheConfig {
            max_total_bytes: 10,
            max_object_bytes: 8,
            ..Default::default()
        };
        let store = ResponseStore::new(&config);

        assert!(store.insert(key("/a"), entry(b"aaaa", 60, 0)));
        assert!(store.insert(key("/b"), entry(b"bbbb", 60, 0)));
        assert_eq!(store.bytes(), 8);

        assert!(store.insert(key("/c"), entry(b"cccc", 60, 0)));
        assert_eq!(store.len(), 2);
        assert_eq!(store.bytes(), 8);
        assert!(matches!(
            store.lookup(&key("/a"), Instant::now()),
            Lookup::Miss
        ));

        assert!(!store.insert(key("/big"), entry(b"123456789", 60, 0)));
        assert_eq!(store.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn replacing_an_entry_keeps_byte_total_accurate() {
        let store = ResponseStore::new(&CacheConfig::default());
        store.insert(key("/a"), entry(b"long body", 60, 0));
        store.insert(key("/a"), entry(b"short", 60, 0));

        assert_eq!(store.len(), 1);
        assert_eq!(store.bytes(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn inconsistent_entry_is_dropped_on_lookup() {
        let store = ResponseStore::new(&CacheConfig::default());
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("100"));
        store.insert(
            key("/torn"),
            CacheEntry::new(
                StatusCode::OK,
                headers,
                Bytes::from_static(b"partial"),
                Lifetime::new(Duration::from_secs(60), Duration::ZERO),
            ),
        );

        assert!(matches!(
            store.lookup(&key("/torn"), Instant::now()),
            Lookup::Miss
        ));
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn invalidate_entry_only_removes_matching_object() {
        let store = ResponseStore::new(&CacheConfig::default());
        store.insert(key("/a"), entry(b"old", 60, 0));
        let Lookup::Fresh(old) = store.lookup(&key("/a"), Instant::now()) else {
            panic!("expected fresh entry");
        };

        store.insert(key("/a"), entry(b"new", 60, 0));
        assert!(!store.invalidate_entry(&key("/a"), &old));
        assert_eq!(store.len(), 1);

        let Lookup::Fresh(current) = store.lookup(&key("/a"), Instant::now()) else {
            panic!("expected fresh entry");
        };
        assert!(store.invalidate_entry(&key("/a"), &current));
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn purge_expired_removes_only_dead_entries() {
        let store = ResponseStore::new(&CacheConfig::default());
        store.insert(key("/short"), entry(b"s", 1, 1));
        store.insert(key("/long"), entry(b"l", 60, 0));

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(store.purge_expired(Instant::now()), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.bytes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn invalidate_and_invalidate_all() {
        let store = ResponseStore::new(&CacheConfig::default());
        store.insert(key("/a"), entry(b"a", 60, 0));
        store.insert(key("/b"), entry(b"b", 60, 0));

        assert!(store.invalidate(&key("/a")));
        assert!(!store.invalidate(&key("/a")));
        assert_eq!(store.invalidate_all(), 1);
        assert!(store.is_empty());
        assert_eq!(store.stats().bytes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn poisoned_lock_drops_the_store() {
        let store = ResponseStore::new(&CacheConfig::default());
        store.insert(key("/a"), entry(b"a", 60, 0));

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = store.inner.write().expect("store lock should be acquired");
            panic!("poison store lock");
        }));

        assert!(matches!(
            store.lookup(&key("/a"), Instant::now()),
            Lookup::Miss
        ));
        assert!(store.insert(key("/b"), entry(b"b", 60, 0)));
        assert!(matches!(
            store.lookup(&key("/b"), Instant::now()),
            Lookup::Fresh(_)
        ));
    }
}
