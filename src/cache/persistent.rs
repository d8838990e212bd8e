//! Durable second cache tier.
//!
//! [`PersistentBlobStore`] wraps a [`BlobStore`] backend (a directory on disk,
//! an embedded database, a browser-side store behind FFI) with the policies the
//! loaders rely on:
//!
//! - **Lazy TTL expiry** — entries older than [`PersistentConfig::ttl`] are
//!   treated as absent on read and removed; [`sweep_expired`](PersistentBlobStore::sweep_expired)
//!   is available as an explicit sweep.
//! - **Byte budget** — an in-process index tracks entry sizes and evicts the
//!   least recently used entries before a write would exceed
//!   [`PersistentConfig::max_bytes`].
//! - **Failure isolation** — any backend error degrades to a cache miss on
//!   read and a logged, dropped write on `put`. Nothing here is fatal to the
//!   caller; the fetch path simply falls through to the network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::memory::CacheStats;
use crate::telemetry;
use crate::{Result, TesseraError};

/// A buffer as held by a persistent backend.
#[derive(Debug, Clone)]
pub struct StoredBlob {
    pub data: Bytes,
    pub inserted_at: SystemTime,
    pub quality_level: u32,
}

impl StoredBlob {
    /// Wrap freshly produced data, stamped with the current time.
    pub fn new(data: Bytes, quality_level: u32) -> Self {
        Self {
            data,
            inserted_at: SystemTime::now(),
            quality_level,
        }
    }

    /// Metadata record describing this blob under `key`.
    pub fn meta(&self, key: &str) -> BlobMeta {
        BlobMeta {
            key: key.to_owned(),
            size_bytes: self.data.len(),
            inserted_at_ms: system_time_to_millis(self.inserted_at),
            quality_level: self.quality_level,
        }
    }
}

/// Metadata for one stored blob, as listed by a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobMeta {
    pub key: String,
    pub size_bytes: usize,
    /// Insertion time in milliseconds since the Unix epoch.
    pub inserted_at_ms: u64,
    pub quality_level: u32,
}

impl BlobMeta {
    pub fn inserted_at(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.inserted_at_ms)
    }
}

pub(crate) fn system_time_to_millis(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Durable key-value store for cached buffers.
///
/// Implementations only move bytes; TTL, budget and error absorption are
/// handled by [`PersistentBlobStore`].
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Backend name for logging.
    fn name(&self) -> &str;

    /// Prepare the backend (create directories, open handles).
    async fn open(&self) -> Result<()> {
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<StoredBlob>>;

    async fn put(&self, key: &str, blob: &StoredBlob) -> Result<()>;

    /// Remove one entry. Unknown keys are not an error.
    async fn remove(&self, key: &str) -> Result<()>;

    async fn clear(&self) -> Result<()>;

    /// Metadata for every stored entry, used to rebuild the index on open.
    async fn list(&self) -> Result<Vec<BlobMeta>>;
}

/// Process-local [`BlobStore`], useful for tests and hosts without a disk.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, StoredBlob>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn blobs(&self) -> MutexGuard<'_, HashMap<String, StoredBlob>> {
        self.blobs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<StoredBlob>> {
        Ok(self.blobs().get(key).cloned())
    }

    async fn put(&self, key: &str, blob: &StoredBlob) -> Result<()> {
        self.blobs().insert(key.to_owned(), blob.clone());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.blobs().remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.blobs().clear();
        Ok(())
    }

    async fn list(&self) -> Result<Vec<BlobMeta>> {
        Ok(self
            .blobs()
            .iter()
            .map(|(key, blob)| blob.meta(key))
            .collect())
    }
}

/// Configuration for the persistent tier.
///
/// ```rust
/// # use tessera::PersistentConfig;
/// # use std::time::Duration;
/// let config = PersistentConfig::new()
///     .ttl(Duration::from_secs(3600))
///     .max_bytes(64 * 1024 * 1024);
/// ```
#[derive(Debug, Clone)]
pub struct PersistentConfig {
    /// Entries older than this are treated as absent. Default: 24 hours.
    pub ttl: Duration,
    /// Byte budget across all entries. Default: 1 GiB.
    pub max_bytes: usize,
}

impl Default for PersistentConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 3600),
            max_bytes: 1024 * 1024 * 1024,
        }
    }
}

impl PersistentConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the time-to-live for stored entries.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set the byte budget.
    pub fn max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }
}

struct IndexEntry {
    size_bytes: usize,
    inserted_at: SystemTime,
    /// Write stamp, so a stale failure never drops a newer write.
    generation: u64,
}

struct IndexState {
    /// Iteration order runs from most to least recently used.
    lru: LruCache<String, IndexEntry>,
    next_generation: u64,
    size_bytes: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl IndexState {
    fn new() -> Self {
        Self {
            lru: LruCache::unbounded(),
            next_generation: 0,
            size_bytes: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    fn insert(&mut self, key: String, size_bytes: usize, inserted_at: SystemTime) -> u64 {
        self.remove(&key);
        let generation = self.next_generation;
        self.next_generation += 1;
        self.size_bytes += size_bytes;
        self.lru.put(
            key,
            IndexEntry {
                size_bytes,
                inserted_at,
                generation,
            },
        );
        generation
    }

    fn generation_of(&self, key: &str) -> Option<u64> {
        self.lru.peek(key).map(|entry| entry.generation)
    }

    fn remove(&mut self, key: &str) -> Option<IndexEntry> {
        let entry = self.lru.pop(key)?;
        self.size_bytes = self.size_bytes.saturating_sub(entry.size_bytes);
        Some(entry)
    }

    /// Pop least recently used keys until `incoming` more bytes fit in `max`.
    fn evict_for(&mut self, incoming: usize, max: usize) -> Vec<String> {
        let mut victims = Vec::new();
        while self.size_bytes + incoming > max {
            let Some((key, entry)) = self.lru.pop_lru() else {
                self.size_bytes = 0;
                break;
            };
            self.size_bytes = self.size_bytes.saturating_sub(entry.size_bytes);
            self.evictions += 1;
            victims.push(key);
        }
        victims
    }

    fn clear(&mut self) {
        self.lru.clear();
        self.size_bytes = 0;
    }
}

/// Budgeted, TTL-aware persistent cache tier over a [`BlobStore`].
pub struct PersistentBlobStore {
    backend: Arc<dyn BlobStore>,
    config: PersistentConfig,
    index: Mutex<IndexState>,
    available: AtomicBool,
}

impl PersistentBlobStore {
    /// Open `backend` and rebuild the size index from its listing.
    ///
    /// Backend failures are logged and leave the store in a degraded state
    /// where every lookup misses and every write is dropped.
    pub async fn open(backend: Arc<dyn BlobStore>, config: PersistentConfig) -> Self {
        let store = Self {
            backend,
            config,
            index: Mutex::new(IndexState::new()),
            available: AtomicBool::new(true),
        };

        let listing = match store.backend.open().await {
            Ok(()) => store.backend.list().await,
            Err(e) => Err(e),
        };

        match listing {
            Ok(mut metas) => {
                // Oldest insertions become the first eviction candidates.
                metas.sort_by_key(|m| m.inserted_at_ms);
                let mut index = store.index();
                for meta in metas {
                    let inserted_at = meta.inserted_at();
                    index.insert(meta.key, meta.size_bytes, inserted_at);
                }
                debug!(
                    backend = store.backend.name(),
                    entries = index.lru.len(),
                    bytes = index.size_bytes,
                    "opened persistent store"
                );
            }
            Err(e) => {
                store.record_error("open", &e);
                store.available.store(false, Ordering::Release);
            }
        }

        store
    }

    fn index(&self) -> MutexGuard<'_, IndexState> {
        self.index.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record_error(&self, operation: &'static str, error: &TesseraError) {
        metrics::counter!(telemetry::PERSISTENT_STORE_ERRORS_TOTAL, "operation" => operation)
            .increment(1);
        warn!(
            backend = self.backend.name(),
            operation,
            error = %TesseraError::PersistentStoreUnavailable(error.to_string()),
            "persistent store error, treating as cache miss"
        );
    }

    fn record_miss(&self) {
        self.index().misses += 1;
        metrics::counter!(telemetry::CACHE_MISSES_TOTAL, "tier" => "persistent").increment(1);
    }

    fn is_expired(&self, inserted_at: SystemTime) -> bool {
        SystemTime::now()
            .duration_since(inserted_at)
            .map(|age| age >= self.config.ttl)
            .unwrap_or(false)
    }

    /// Whether the backend opened successfully.
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    /// Look up an unexpired entry. Errors and expired entries read as `None`.
    pub async fn get(&self, key: &str) -> Option<StoredBlob> {
        if !self.is_available() {
            self.record_miss();
            return None;
        }

        let indexed = {
            let index = self.index();
            index
                .lru
                .peek(key)
                .map(|entry| (entry.generation, entry.inserted_at))
        };
        let Some((generation, inserted_at)) = indexed else {
            self.record_miss();
            return None;
        };

        if self.is_expired(inserted_at) {
            self.expire(key).await;
            self.record_miss();
            return None;
        }

        match self.backend.get(key).await {
            Ok(Some(blob)) if !self.is_expired(blob.inserted_at) => {
                let mut index = self.index();
                index.lru.promote(key);
                index.hits += 1;
                metrics::counter!(telemetry::CACHE_HITS_TOTAL, "tier" => "persistent")
                    .increment(1);
                Some(blob)
            }
            Ok(Some(_)) => {
                self.expire(key).await;
                self.record_miss();
                None
            }
            Ok(None) => {
                // Only forget the entry if no write replaced it meanwhile.
                let mut index = self.index();
                if index.generation_of(key) == Some(generation) {
                    index.remove(key);
                }
                drop(index);
                self.record_miss();
                None
            }
            Err(e) => {
                self.record_error("get", &e);
                self.record_miss();
                None
            }
        }
    }

    async fn expire(&self, key: &str) {
        self.index().remove(key);
        debug!(key = %key, "persistent entry expired");
        if let Err(e) = self.backend.remove(key).await {
            self.record_error("remove", &e);
        }
    }

    /// Store `data` under `key`, evicting least recently used entries first.
    ///
    /// Failures are logged and dropped.
    pub async fn put(&self, key: &str, data: Bytes, quality_level: u32) {
        if !self.is_available() {
            return;
        }

        let size = data.len();
        if size > self.config.max_bytes {
            let err = TesseraError::CacheCapacityExceeded {
                size,
                max: self.config.max_bytes,
            };
            warn!(key = %key, error = %err, "not persisting oversized entry");
            return;
        }

        let blob = StoredBlob::new(data, quality_level);
        let (victims, generation) = {
            let mut index = self.index();
            index.remove(key);
            let victims = index.evict_for(size, self.config.max_bytes);
            let generation = index.insert(key.to_owned(), size, blob.inserted_at);
            (victims, generation)
        };

        for victim in &victims {
            metrics::counter!(telemetry::CACHE_EVICTIONS_TOTAL, "tier" => "persistent")
                .increment(1);
            debug!(key = %victim, "evicted persistent entry");
            if let Err(e) = self.backend.remove(victim).await {
                self.record_error("remove", &e);
            }
        }

        if let Err(e) = self.backend.put(key, &blob).await {
            self.record_error("put", &e);
            let mut index = self.index();
            if index.generation_of(key) == Some(generation) {
                index.remove(key);
            }
        }
    }

    /// Remove one entry. No-op for unknown keys.
    pub async fn remove(&self, key: &str) {
        if self.index().remove(key).is_none() {
            return;
        }
        if let Err(e) = self.backend.remove(key).await {
            self.record_error("remove", &e);
        }
    }

    /// Drop every entry.
    pub async fn clear(&self) {
        self.index().clear();
        if let Err(e) = self.backend.clear().await {
            self.record_error("clear", &e);
        }
    }

    /// Remove every expired entry now rather than on next read.
    ///
    /// Returns the number of entries removed.
    pub async fn sweep_expired(&self) -> usize {
        let expired: Vec<String> = {
            let index = self.index();
            index
                .lru
                .iter()
                .filter(|(_, entry)| self.is_expired(entry.inserted_at))
                .map(|(key, _)| key.clone())
                .collect()
        };
        for key in &expired {
            self.expire(key).await;
        }
        expired.len()
    }

    /// Snapshot of current usage and counters.
    pub fn stats(&self) -> CacheStats {
        let index = self.index();
        CacheStats {
            size_bytes: index.size_bytes,
            entry_count: index.lru.len(),
            max_bytes: self.config.max_bytes,
            hits: index.hits,
            misses: index.misses,
            evictions: index.evictions,
        }
    }

    /// The configured TTL.
    pub fn ttl(&self) -> Duration {
        self.config.ttl
    }
}
