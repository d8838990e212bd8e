//! Progressive whole-resource loading.
//!
//! [`ProgressiveLoader`] serves a resource from the memory cache or the
//! persistent store when it can, and otherwise fetches it at increasing
//! quality levels, reporting each level as it arrives. Only the highest
//! configured level is persisted under the resource's own key; every level
//! is kept in memory under a level-qualified key.
//!
//! Per key, a load moves through [`LoadState`]:
//!
//! ```text
//! Idle → CheckingCache → ServedFromCache
//!                      → FetchingLevel(l1) → … → FetchingLevel(ln) → Complete | Failed
//! ```
//!
//! A failed level is logged and skipped. The load fails only when every
//! level fails. Concurrent loads of the same key are not coalesced.

mod builder;

pub use builder::ProgressiveLoaderBuilder;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use futures_util::stream::{FuturesUnordered, StreamExt};
use reqwest::Url;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{ByteBudgetCache, CacheStats, PersistentBlobStore};
use crate::events::{CallbackSink, EventSink, EventStream, event_channel};
use crate::fetch::{FetchRequest, Fetcher, RetryConfig, with_retry};
use crate::telemetry;
use crate::{Result, TesseraError};

/// Query parameter stripped from URLs before deriving cache keys.
const CACHE_BUST_PARAM: &str = "_t";

/// Loader configuration.
#[derive(Debug, Clone)]
pub struct ProgressiveConfig {
    /// Quality levels, fetched in ascending order. Default: `[1, 2, 4, 8]`.
    pub levels: Vec<u32>,
    /// Memory cache budget in bytes. Default: 200 MiB.
    pub cache_bytes: usize,
    /// Entries older than this are ignored in both tiers. Default: 24 hours.
    pub ttl: Duration,
    /// Per-level retry and timeout policy.
    pub retry: RetryConfig,
    /// `Cache-Control: max-age` sent with level requests. Default: 1 day.
    pub request_max_age: Option<Duration>,
    /// Buffer size for [`ProgressiveLoader::load_progressive_events`]. Default: 64.
    pub event_buffer: usize,
}

impl Default for ProgressiveConfig {
    fn default() -> Self {
        Self {
            levels: vec![1, 2, 4, 8],
            cache_bytes: 200 * 1024 * 1024,
            ttl: Duration::from_secs(24 * 3600),
            retry: RetryConfig::default(),
            request_max_age: Some(Duration::from_secs(86_400)),
            event_buffer: crate::events::DEFAULT_EVENT_BUFFER,
        }
    }
}

impl ProgressiveConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn levels(mut self, levels: impl Into<Vec<u32>>) -> Self {
        self.levels = levels.into();
        self
    }

    pub fn cache_bytes(mut self, bytes: usize) -> Self {
        self.cache_bytes = bytes;
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn request_max_age(mut self, max_age: Option<Duration>) -> Self {
        self.request_max_age = max_age;
        self
    }

    pub fn event_buffer(mut self, n: usize) -> Self {
        self.event_buffer = n;
        self
    }

    /// Levels sorted ascending without duplicates.
    fn ordered_levels(&self) -> Vec<u32> {
        let mut levels = self.levels.clone();
        levels.sort_unstable();
        levels.dedup();
        levels
    }
}

/// Where a load's final data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    MemoryCache,
    PersistentCache,
    Network,
}

/// Progress of the most recent load for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Idle,
    CheckingCache,
    ServedFromCache,
    FetchingLevel(u32),
    Complete,
    Failed,
}

/// Successful load.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressiveResult {
    pub data: Bytes,
    /// Quality level of `data`, when known.
    pub level: Option<u32>,
    pub source: LoadSource,
    /// Whether `data` is the highest configured level (or a cached copy of it).
    pub complete: bool,
}

/// Event emitted while a load runs.
#[derive(Debug, Clone)]
pub enum ProgressiveEvent {
    /// One level arrived from the network.
    Level { level: u32, data: Bytes },
    /// Terminal success.
    Complete(ProgressiveResult),
    /// Terminal failure.
    Failed { error: String },
}

/// Memory and persistent cache statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressiveStats {
    pub memory: CacheStats,
    pub persistent: Option<CacheStats>,
}

/// Derive the cache key for `url`: the URL with cache-busting `_t`
/// parameters removed.
pub fn cache_key(url: &str) -> Result<String> {
    let mut parsed = Url::parse(url).map_err(|e| TesseraError::InvalidUrl(format!("{url}: {e}")))?;
    let kept: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(k, _)| k != CACHE_BUST_PARAM)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        parsed.set_query(None);
    } else {
        parsed.query_pairs_mut().clear().extend_pairs(kept);
    }
    Ok(parsed.into())
}

/// URL for one quality level: `level=<n>&format=progressive`, replacing any
/// existing values of those parameters.
pub fn level_url(url: &str, level: u32) -> Result<String> {
    let mut parsed = Url::parse(url).map_err(|e| TesseraError::InvalidUrl(format!("{url}: {e}")))?;
    let mut pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(k, _)| k != "level" && k != "format")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.push(("level".into(), level.to_string()));
    pairs.push(("format".into(), "progressive".into()));
    parsed.query_pairs_mut().clear().extend_pairs(pairs);
    Ok(parsed.into())
}

/// Memory-cache key of one level.
pub fn level_key(key: &str, level: u32) -> String {
    format!("{key}#level={level}")
}

/// Memory-cache key of a preloaded preview.
pub fn preview_key(key: &str) -> String {
    format!("{key}#preview")
}

struct Inner {
    config: ProgressiveConfig,
    fetcher: Arc<dyn Fetcher>,
    cache: Arc<ByteBudgetCache>,
    persistent: Option<Arc<PersistentBlobStore>>,
    states: Mutex<HashMap<String, LoadState>>,
    session: Mutex<CancellationToken>,
}

/// Loads whole resources level by level, two cache tiers first.
///
/// Cheap to clone; clones share caches and state.
#[derive(Clone)]
pub struct ProgressiveLoader {
    inner: Arc<Inner>,
}

impl ProgressiveLoader {
    pub fn builder(fetcher: Arc<dyn Fetcher>) -> ProgressiveLoaderBuilder {
        ProgressiveLoaderBuilder::new(fetcher)
    }

    pub fn config(&self) -> &ProgressiveConfig {
        &self.inner.config
    }

    pub fn cache(&self) -> &Arc<ByteBudgetCache> {
        &self.inner.cache
    }

    pub fn persistent(&self) -> Option<&Arc<PersistentBlobStore>> {
        self.inner.persistent.as_ref()
    }

    fn states(&self) -> MutexGuard<'_, HashMap<String, LoadState>> {
        self.inner.states.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, key: &str, state: LoadState) {
        self.states().insert(key.to_owned(), state);
    }

    /// State of the most recent load of `url`.
    pub fn load_state(&self, url: &str) -> LoadState {
        let Ok(key) = cache_key(url) else {
            return LoadState::Idle;
        };
        self.states().get(&key).copied().unwrap_or(LoadState::Idle)
    }

    /// Abort running loads and start a fresh session.
    pub fn cancel(&self) {
        let mut session = self
            .inner
            .session
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        session.cancel();
        *session = CancellationToken::new();
    }

    fn session_token(&self) -> CancellationToken {
        self.inner
            .session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Load `url`, calling `on_progress(level, data)` for every level that
    /// arrives from the network.
    ///
    /// Returns the best data obtained. Fails with
    /// [`TesseraError::ProgressiveLoadFailed`] when every level failed.
    pub async fn load_progressive<P>(&self, url: &str, mut on_progress: P) -> Result<ProgressiveResult>
    where
        P: FnMut(u32, &Bytes) + Send,
    {
        let mut sink = CallbackSink(|event: ProgressiveEvent| {
            if let ProgressiveEvent::Level { level, data } = event {
                on_progress(level, &data);
            }
        });
        self.run(url, &mut sink).await
    }

    /// Load `url`, reporting every [`ProgressiveEvent`] to `on_event`.
    pub async fn load_progressive_with<F>(&self, url: &str, on_event: F) -> Result<ProgressiveResult>
    where
        F: FnMut(ProgressiveEvent) + Send,
    {
        self.run(url, &mut CallbackSink(on_event)).await
    }

    /// Load `url` as a bounded event stream ending in
    /// [`ProgressiveEvent::Complete`] or [`ProgressiveEvent::Failed`].
    pub fn load_progressive_events(&self, url: impl Into<String>) -> EventStream<ProgressiveEvent> {
        let (mut tx, rx) = event_channel(self.inner.config.event_buffer);
        let loader = self.clone();
        let url = url.into();
        tokio::spawn(async move {
            let _ = loader.run(&url, &mut tx).await;
        });
        rx
    }

    async fn run<S: EventSink<ProgressiveEvent>>(
        &self,
        url: &str,
        sink: &mut S,
    ) -> Result<ProgressiveResult> {
        let key = match cache_key(url) {
            Ok(key) => key,
            Err(e) => {
                sink.emit(ProgressiveEvent::Failed { error: e.to_string() }).await;
                return Err(e);
            }
        };

        self.set_state(&key, LoadState::CheckingCache);
        if let Some(result) = self.lookup(&key).await {
            self.set_state(&key, LoadState::ServedFromCache);
            metrics::counter!(telemetry::PROGRESSIVE_LOADS_TOTAL, "outcome" => "cache").increment(1);
            debug!(key = %key, source = ?result.source, "served from cache");
            sink.emit(ProgressiveEvent::Complete(result.clone())).await;
            return Ok(result);
        }

        match self.fetch_levels(url, &key, sink).await {
            Ok(result) => {
                self.set_state(&key, LoadState::Complete);
                let outcome = if result.complete { "complete" } else { "partial" };
                metrics::counter!(telemetry::PROGRESSIVE_LOADS_TOTAL, "outcome" => outcome)
                    .increment(1);
                info!(url = %url, level = ?result.level, complete = result.complete, "progressive load finished");
                sink.emit(ProgressiveEvent::Complete(result.clone())).await;
                Ok(result)
            }
            Err(e) => {
                self.set_state(&key, LoadState::Failed);
                metrics::counter!(telemetry::PROGRESSIVE_LOADS_TOTAL, "outcome" => "failed")
                    .increment(1);
                warn!(url = %url, error = %e, "progressive load failed");
                sink.emit(ProgressiveEvent::Failed { error: e.to_string() }).await;
                Err(e)
            }
        }
    }

    fn is_fresh(&self, inserted_at: SystemTime) -> bool {
        SystemTime::now()
            .duration_since(inserted_at)
            .map(|age| age < self.inner.config.ttl)
            .unwrap_or(true)
    }

    /// Memory tier, then persistent tier. Persistent hits are promoted.
    async fn lookup(&self, key: &str) -> Option<ProgressiveResult> {
        if let Some(entry) = self.inner.cache.get_entry(key) {
            if self.is_fresh(entry.inserted_at) {
                return Some(ProgressiveResult {
                    data: entry.data,
                    level: Some(entry.quality_level),
                    source: LoadSource::MemoryCache,
                    complete: true,
                });
            }
            self.inner.cache.remove(key);
        }

        let store = self.inner.persistent.as_ref()?;
        let blob = store.get(key).await?;
        if !self.is_fresh(blob.inserted_at) {
            return None;
        }
        if let Err(e) = self
            .inner
            .cache
            .put_with_level(key, blob.data.clone(), blob.quality_level)
        {
            debug!(key = %key, error = %e, "persistent hit not promoted");
        }
        Some(ProgressiveResult {
            data: blob.data,
            level: Some(blob.quality_level),
            source: LoadSource::PersistentCache,
            complete: true,
        })
    }

    async fn fetch_level(&self, url: &str, level: u32, token: &CancellationToken) -> Result<Bytes> {
        let mut request = FetchRequest::new(level_url(url, level)?);
        if let Some(max_age) = self.inner.config.request_max_age {
            request = request.max_age(max_age);
        }
        with_retry(&self.inner.config.retry, "progressive", token, |_| {
            self.inner.fetcher.fetch(&request)
        })
        .await
    }

    async fn fetch_levels<S: EventSink<ProgressiveEvent>>(
        &self,
        url: &str,
        key: &str,
        sink: &mut S,
    ) -> Result<ProgressiveResult> {
        let token = self.session_token();
        let levels = self.inner.config.ordered_levels();
        let highest = levels.last().copied();
        let mut best: Option<(u32, Bytes)> = None;
        let mut failures = Vec::new();

        for level in levels {
            self.set_state(key, LoadState::FetchingLevel(level));
            match self.fetch_level(url, level, &token).await {
                Ok(data) => {
                    if let Err(e) =
                        self.inner
                            .cache
                            .put_with_level(level_key(key, level), data.clone(), level)
                    {
                        warn!(key = %key, level, error = %e, "level not cached");
                    }
                    sink.emit(ProgressiveEvent::Level {
                        level,
                        data: data.clone(),
                    })
                    .await;

                    if Some(level) == highest {
                        if let Err(e) = self.inner.cache.put_with_level(key, data.clone(), level) {
                            warn!(key = %key, error = %e, "final level not cached in memory");
                        }
                        if let Some(store) = &self.inner.persistent {
                            store.put(key, data.clone(), level).await;
                        }
                    }
                    best = Some((level, data));
                }
                Err(TesseraError::Cancelled) => return Err(TesseraError::Cancelled),
                Err(e) => {
                    let err = TesseraError::ProgressiveLevelFailed {
                        level,
                        reason: e.to_string(),
                    };
                    warn!(url = %url, level, error = %err, "level failed, continuing");
                    failures.push(err);
                }
            }
        }

        match best {
            Some((level, data)) => Ok(ProgressiveResult {
                data,
                level: Some(level),
                source: LoadSource::Network,
                complete: Some(level) == highest,
            }),
            None => Err(TesseraError::ProgressiveLoadFailed {
                url: url.to_owned(),
                failures,
            }),
        }
    }

    /// Fetch the lowest level of every uncached URL concurrently.
    ///
    /// Previews are kept in memory under [`preview_key`]. Failures are
    /// logged and otherwise ignored. Returns the number of previews fetched.
    pub async fn preload<I, U>(&self, urls: I) -> usize
    where
        I: IntoIterator<Item = U>,
        U: AsRef<str>,
    {
        let Some(level) = self.inner.config.ordered_levels().first().copied() else {
            return 0;
        };
        let token = self.session_token();

        let mut tasks: FuturesUnordered<_> = urls
            .into_iter()
            .map(|url| {
                let url = url.as_ref().to_owned();
                let token = token.clone();
                async move {
                    match self.preload_one(&url, level, &token).await {
                        Ok(fetched) => fetched,
                        Err(e) => {
                            warn!(url = %url, error = %e, "preload failed");
                            false
                        }
                    }
                }
            })
            .collect();

        let mut fetched = 0;
        while let Some(ok) = tasks.next().await {
            fetched += usize::from(ok);
        }
        fetched
    }

    async fn preload_one(&self, url: &str, level: u32, token: &CancellationToken) -> Result<bool> {
        let key = cache_key(url)?;
        if self.inner.cache.contains(&key) {
            return Ok(false);
        }
        if let Some(store) = &self.inner.persistent {
            if store.get(&key).await.is_some() {
                return Ok(false);
            }
        }
        let data = self.fetch_level(url, level, token).await?;
        self.inner.cache.put_with_level(preview_key(&key), data, level)?;
        Ok(true)
    }

    /// Clear the memory cache and the persistent store.
    pub async fn clear_cache(&self) {
        self.inner.cache.clear();
        if let Some(store) = &self.inner.persistent {
            store.clear().await;
        }
    }

    pub fn stats(&self) -> ProgressiveStats {
        ProgressiveStats {
            memory: self.inner.cache.stats(),
            persistent: self.inner.persistent.as_ref().map(|s| s.stats()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_drops_cache_buster() {
        assert_eq!(
            cache_key("https://host/a.tif?_t=123&band=2").unwrap(),
            "https://host/a.tif?band=2"
        );
        assert_eq!(cache_key("https://host/a.tif?_t=1").unwrap(), "https://host/a.tif");
        assert_eq!(
            cache_key("https://host/a.tif?_t=1").unwrap(),
            cache_key("https://host/a.tif?_t=2").unwrap()
        );
    }

    #[test]
    fn invalid_url_is_rejected() {
        assert!(matches!(cache_key("not a url"), Err(TesseraError::InvalidUrl(_))));
    }

    #[test]
    fn level_url_sets_parameters() {
        assert_eq!(
            level_url("https://host/a.tif?band=2&level=9", 4).unwrap(),
            "https://host/a.tif?band=2&level=4&format=progressive"
        );
    }

    #[test]
    fn levels_are_ordered() {
        let config = ProgressiveConfig::new().levels(vec![8, 1, 4, 1]);
        assert_eq!(config.ordered_levels(), vec![1, 4, 8]);
    }

    #[test]
    fn qualified_keys() {
        assert_eq!(level_key("k", 2), "k#level=2");
        assert_eq!(preview_key("k"), "k#preview");
    }
}
