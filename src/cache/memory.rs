//! In-memory byte-budget cache with strict LRU eviction.
//!
//! [`ByteBudgetCache`] maps string keys to byte buffers and keeps the sum of
//! entry sizes at or below a configured budget. Eviction always removes the
//! least recently accessed entry first.
//!
//! The cache is owned by a single manager (a [`TileStreamer`](crate::TileStreamer)
//! or a [`ProgressiveLoader`](crate::ProgressiveLoader)) and shared by `Arc`
//! only when the caller constructs it that way. All mutations happen under
//! one lock that is never held across an `.await`, so the budget invariant
//! holds at every suspension point.

use std::sync::{Mutex, MutexGuard};
use std::time::{Instant, SystemTime};

use bytes::Bytes;
use lru::LruCache;
use tracing::debug;

use crate::telemetry;
use crate::{Result, TesseraError};

/// A cached buffer and its bookkeeping.
///
/// Immutable once inserted except for `last_accessed`.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Cache key (tile key or resource key).
    pub key: String,
    /// Cached bytes. Cloning shares the underlying allocation.
    pub data: Bytes,
    /// Size of `data` in bytes.
    pub size_bytes: usize,
    /// Wall-clock insertion time, used for TTL checks.
    pub inserted_at: SystemTime,
    /// Last time the entry was read or written.
    pub last_accessed: Instant,
    /// Quality level the data was produced at (0 for tiles).
    pub quality_level: u32,
}

/// Statistics about cache usage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Total bytes currently cached.
    pub size_bytes: usize,
    /// Number of entries currently cached.
    pub entry_count: usize,
    /// Configured byte budget.
    pub max_bytes: usize,
    /// Number of lookups that found an entry.
    pub hits: u64,
    /// Number of lookups that found nothing.
    pub misses: u64,
    /// Number of entries evicted to make room.
    pub evictions: u64,
}

impl CacheStats {
    /// Cache hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Budget utilisation (0.0 to 1.0)
    pub fn utilization(&self) -> f64 {
        if self.max_bytes == 0 {
            0.0
        } else {
            self.size_bytes as f64 / self.max_bytes as f64
        }
    }
}

struct CacheState {
    /// Iteration order runs from most to least recently used.
    lru: LruCache<String, CacheEntry>,
    size_bytes: usize,
    max_bytes: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl CacheState {
    fn new(max_bytes: usize) -> Self {
        Self {
            lru: LruCache::unbounded(),
            size_bytes: 0,
            max_bytes,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    fn touch(&mut self, key: &str) -> Option<&CacheEntry> {
        let entry = self.lru.get_mut(key)?;
        entry.last_accessed = Instant::now();
        Some(&*entry)
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.lru.pop(key)?;
        self.size_bytes = self.size_bytes.saturating_sub(entry.size_bytes);
        Some(entry)
    }

    fn evict_lru(&mut self) -> bool {
        let Some((key, entry)) = self.lru.pop_lru() else {
            self.size_bytes = 0;
            return false;
        };
        self.size_bytes = self.size_bytes.saturating_sub(entry.size_bytes);
        self.evictions += 1;
        metrics::counter!(telemetry::CACHE_EVICTIONS_TOTAL, "tier" => "memory").increment(1);
        debug!(key = %key, size = entry.size_bytes, "evicted cache entry");
        true
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            size_bytes: self.size_bytes,
            entry_count: self.lru.len(),
            max_bytes: self.max_bytes,
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
        }
    }
}

/// Byte-bounded in-memory cache with LRU eviction.
///
/// ```
/// use bytes::Bytes;
/// use tessera::ByteBudgetCache;
///
/// let cache = ByteBudgetCache::new(1024);
/// cache.put("12/654/1583", Bytes::from(vec![0u8; 512])).unwrap();
///
/// assert!(cache.get("12/654/1583").is_some());
/// assert_eq!(cache.stats().size_bytes, 512);
/// ```
pub struct ByteBudgetCache {
    state: Mutex<CacheState>,
}

impl ByteBudgetCache {
    /// Create an empty cache holding at most `max_bytes`.
    pub fn new(max_bytes: usize) -> Self {
        Self {
            state: Mutex::new(CacheState::new(max_bytes)),
        }
    }

    /// Create an empty cache with a budget given in megabytes.
    pub fn with_megabytes(max_mb: usize) -> Self {
        Self::new(max_mb * 1024 * 1024)
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Look up a buffer, marking it most recently used.
    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.get_entry(key).map(|entry| entry.data)
    }

    /// Look up an entry with its metadata, marking it most recently used.
    pub fn get_entry(&self, key: &str) -> Option<CacheEntry> {
        let mut state = self.state();
        match state.touch(key).cloned() {
            Some(entry) => {
                state.hits += 1;
                metrics::counter!(telemetry::CACHE_HITS_TOTAL, "tier" => "memory").increment(1);
                Some(entry)
            }
            None => {
                state.misses += 1;
                metrics::counter!(telemetry::CACHE_MISSES_TOTAL, "tier" => "memory").increment(1);
                None
            }
        }
    }

    /// Whether `key` is cached. Does not affect recency or statistics.
    pub fn contains(&self, key: &str) -> bool {
        self.state().lru.contains(key)
    }

    /// Insert a buffer at quality level 0.
    ///
    /// See [`put_with_level`](Self::put_with_level).
    pub fn put(&self, key: impl Into<String>, data: Bytes) -> Result<()> {
        self.put_with_level(key, data, 0)
    }

    /// Insert a buffer, evicting least recently used entries until it fits.
    ///
    /// Inserting an existing key replaces it. A buffer larger than the whole
    /// budget empties the cache and is rejected with
    /// [`TesseraError::CacheCapacityExceeded`]; callers bypass the cache in
    /// that case.
    pub fn put_with_level(
        &self,
        key: impl Into<String>,
        data: Bytes,
        quality_level: u32,
    ) -> Result<()> {
        let key = key.into();
        let size = data.len();
        let mut state = self.state();

        if size > state.max_bytes {
            while state.evict_lru() {}
            return Err(TesseraError::CacheCapacityExceeded {
                size,
                max: state.max_bytes,
            });
        }

        state.remove(&key);
        while state.size_bytes + size > state.max_bytes {
            if !state.evict_lru() {
                break;
            }
        }

        state.size_bytes += size;
        state.lru.put(
            key.clone(),
            CacheEntry {
                key,
                data,
                size_bytes: size,
                inserted_at: SystemTime::now(),
                last_accessed: Instant::now(),
                quality_level,
            },
        );
        Ok(())
    }

    /// Remove an entry, returning its buffer. No-op for unknown keys.
    pub fn remove(&self, key: &str) -> Option<Bytes> {
        self.state().remove(key).map(|entry| entry.data)
    }

    /// Drop every entry. Hit/miss counters are kept.
    pub fn clear(&self) {
        let mut state = self.state();
        state.lru.clear();
        state.size_bytes = 0;
    }

    /// Snapshot of current usage and counters.
    pub fn stats(&self) -> CacheStats {
        self.state().stats()
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.state().lru.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured byte budget.
    pub fn max_bytes(&self) -> usize {
        self.state().max_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buf(size: usize) -> Bytes {
        Bytes::from(vec![7u8; size])
    }

    #[test]
    fn put_then_get_round_trip() {
        let cache = ByteBudgetCache::new(100);
        cache.put("a", buf(10)).unwrap();
        assert_eq!(cache.get("a").unwrap().len(), 10);
        assert_eq!(cache.stats().entry_count, 1);
    }

    #[test]
    fn replacing_a_key_adjusts_size() {
        let cache = ByteBudgetCache::new(100);
        cache.put("a", buf(40)).unwrap();
        cache.put("a", buf(10)).unwrap();
        let stats = cache.stats();
        assert_eq!(stats.size_bytes, 10);
        assert_eq!(stats.entry_count, 1);
        assert_eq!(stats.evictions, 0);
    }

    #[test]
    fn evicts_least_recently_used_first() {
        let cache = ByteBudgetCache::new(100);
        cache.put("a", buf(50)).unwrap();
        cache.put("b", buf(50)).unwrap();
        cache.get("a");
        cache.put("d", buf(50)).unwrap();

        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert!(cache.contains("d"));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn replaced_key_becomes_most_recent() {
        let cache = ByteBudgetCache::new(90);
        cache.put("a", buf(30)).unwrap();
        cache.put("b", buf(30)).unwrap();
        cache.put("c", buf(30)).unwrap();
        cache.put("a", buf(30)).unwrap();
        cache.put("d", buf(30)).unwrap();

        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert!(cache.contains("c"));
        assert!(cache.contains("d"));
        assert_eq!(cache.stats().size_bytes, 90);
    }

    #[test]
    fn oversized_item_empties_cache_and_is_rejected() {
        let cache = ByteBudgetCache::new(100);
        cache.put("a", buf(30)).unwrap();
        let err = cache.put("huge", buf(101)).unwrap_err();
        assert!(matches!(
            err,
            TesseraError::CacheCapacityExceeded { size: 101, max: 100 }
        ));
        assert!(cache.is_empty());
        assert_eq!(cache.stats().size_bytes, 0);
    }

    #[test]
    fn item_exactly_at_budget_fits() {
        let cache = ByteBudgetCache::new(64);
        cache.put("a", buf(64)).unwrap();
        assert_eq!(cache.stats().size_bytes, 64);
    }

    #[test]
    fn budget_holds_after_every_put() {
        let cache = ByteBudgetCache::new(1000);
        for i in 0..200usize {
            let size = (i * 37) % 300 + 1;
            cache.put(format!("k{i}"), buf(size)).unwrap();
            assert!(cache.stats().size_bytes <= 1000);
        }
    }

    #[test]
    fn hits_and_misses_are_counted() {
        let cache = ByteBudgetCache::new(100);
        cache.put("a", buf(1)).unwrap();
        cache.get("a");
        cache.get("missing");
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn contains_does_not_refresh_recency() {
        let cache = ByteBudgetCache::new(100);
        cache.put("a", buf(50)).unwrap();
        cache.put("b", buf(50)).unwrap();
        assert!(cache.contains("a"));
        cache.put("c", buf(50)).unwrap();
        assert!(!cache.contains("a"));
    }

    #[test]
    fn entry_carries_quality_level() {
        let cache = ByteBudgetCache::new(100);
        cache.put_with_level("r", buf(5), 8).unwrap();
        assert_eq!(cache.get_entry("r").unwrap().quality_level, 8);
    }

    #[test]
    fn remove_and_clear() {
        let cache = ByteBudgetCache::new(100);
        cache.put("a", buf(5)).unwrap();
        cache.put("b", buf(5)).unwrap();
        assert!(cache.remove("a").is_some());
        assert!(cache.remove("a").is_none());
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.stats().size_bytes, 0);
    }
}
