//! Viewport tile streaming.
//!
//! [`TileStreamer`] turns a viewport into a prioritized batch of tile
//! fetches. Each tile moves through [`TileState`]: `Queued → Fetching →
//! {Cached | Failed}`. Tiles already in the memory cache are reported
//! without touching the network.
//!
//! A batch never aborts because one tile failed; the failure is logged,
//! reported as an event, and counted towards progress. Fetches are started
//! strictly in priority order, at most [`StreamerConfig::max_in_flight`] at
//! a time, so completions may arrive out of order.
//!
//! # Cancellation
//!
//! Every batch runs under the streamer's current cancellation token.
//! [`TileStreamer::cancel()`] fires that token and installs a fresh one for
//! the next batch. A cancelled batch starts no further tiles, drops its
//! in-flight requests, and keeps whatever it already cached.

mod builder;

pub use builder::TileStreamerBuilder;

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::{ByteBudgetCache, CacheStats};
use crate::events::{CallbackSink, EventSink, EventStream, event_channel};
use crate::fetch::{FetchRequest, Fetcher, RetryConfig, TileLocator, with_retry};
use crate::telemetry;
use crate::tile::{self, TileCoord, Viewport};
use crate::{Result, TesseraError};

/// Streamer configuration.
#[derive(Debug, Clone)]
pub struct StreamerConfig {
    /// Tile edge in pixels. Informational; passed through to hosts. Default: 256.
    pub tile_size: u32,
    /// Highest zoom that will be requested. Default: 18.
    pub max_zoom: u8,
    /// Memory cache budget in bytes. Default: 100 MiB.
    pub cache_bytes: usize,
    /// Coarser zooms streamed after the current-zoom tiles. Default: none.
    pub overview_zooms: Vec<u8>,
    /// Maximum concurrent tile fetches. Default: 4.
    pub max_in_flight: usize,
    /// Yield to the runtime after this many processed tiles. Default: 5.
    pub yield_every: usize,
    /// Per-tile retry and timeout policy.
    pub retry: RetryConfig,
    /// Buffer size for [`TileStreamer::stream_tiles_events`]. Default: 64.
    pub event_buffer: usize,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            tile_size: 256,
            max_zoom: tile::DEFAULT_MAX_ZOOM,
            cache_bytes: 100 * 1024 * 1024,
            overview_zooms: Vec::new(),
            max_in_flight: 4,
            yield_every: 5,
            retry: RetryConfig::default(),
            event_buffer: crate::events::DEFAULT_EVENT_BUFFER,
        }
    }
}

impl StreamerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tile_size(mut self, size: u32) -> Self {
        self.tile_size = size;
        self
    }

    pub fn max_zoom(mut self, zoom: u8) -> Self {
        self.max_zoom = zoom;
        self
    }

    /// Set the memory cache budget in megabytes.
    pub fn cache_megabytes(mut self, mb: usize) -> Self {
        self.cache_bytes = mb * 1024 * 1024;
        self
    }

    pub fn cache_bytes(mut self, bytes: usize) -> Self {
        self.cache_bytes = bytes;
        self
    }

    pub fn overview_zooms(mut self, zooms: impl Into<Vec<u8>>) -> Self {
        self.overview_zooms = zooms.into();
        self
    }

    /// Set the concurrency bound; values below 1 are treated as 1.
    pub fn max_in_flight(mut self, n: usize) -> Self {
        self.max_in_flight = n.max(1);
        self
    }

    pub fn yield_every(mut self, n: usize) -> Self {
        self.yield_every = n;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn event_buffer(mut self, n: usize) -> Self {
        self.event_buffer = n;
        self
    }
}

/// Lifecycle of one tile within a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileState {
    Queued,
    Fetching,
    /// Delivered, from cache or network.
    Cached,
    Failed,
    /// Was in flight when the batch was cancelled.
    Cancelled,
}

/// Outcome of one streaming batch.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSummary {
    pub total: usize,
    /// Tiles processed, successful or not.
    pub loaded: usize,
    pub failed: usize,
    pub cache_hits: usize,
    pub cancelled: bool,
    /// Final state of every tile, in priority order.
    pub tiles: Vec<(TileCoord, TileState)>,
}

impl StreamSummary {
    /// Tiles delivered to the caller.
    pub fn succeeded(&self) -> usize {
        self.loaded - self.failed
    }

    pub fn state_of(&self, coord: &TileCoord) -> Option<TileState> {
        self.tiles
            .iter()
            .find(|(c, _)| c == coord)
            .map(|(_, state)| *state)
    }
}

/// Event emitted while a batch runs.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    TileLoaded {
        key: String,
        coord: TileCoord,
        data: Bytes,
        from_cache: bool,
    },
    TileFailed {
        key: String,
        coord: TileCoord,
        error: String,
    },
    Progress {
        loaded: usize,
        total: usize,
    },
    /// Last event of every batch.
    Finished(StreamSummary),
}

/// Order `tiles` for fetching.
///
/// Tiles at the viewport's integer zoom come first. Within each group, tiles
/// are ordered by Manhattan distance from the tile under the viewport center
/// at that tile's zoom. Remaining ties keep a stable coordinate order.
pub fn prioritize_tiles(tiles: &mut [TileCoord], viewport: &Viewport, max_zoom: u8) {
    let current = viewport.tile_zoom(max_zoom);
    let (lon, lat) = viewport.bounds.center();
    tiles.sort_by_cached_key(|t| {
        let center = TileCoord::containing(lon, lat, t.zoom);
        (t.zoom != current, t.manhattan_distance(&center), *t)
    });
}

struct Inner {
    config: StreamerConfig,
    fetcher: Arc<dyn Fetcher>,
    locator: Arc<dyn TileLocator>,
    cache: Arc<ByteBudgetCache>,
    session: Mutex<CancellationToken>,
}

/// Streams the tiles covering a viewport, cache first.
///
/// Cheap to clone; clones share the cache and the cancellation session.
#[derive(Clone)]
pub struct TileStreamer {
    inner: Arc<Inner>,
}

impl TileStreamer {
    /// Create a builder around `fetcher`.
    pub fn builder(fetcher: Arc<dyn Fetcher>) -> TileStreamerBuilder {
        TileStreamerBuilder::new(fetcher)
    }

    /// Streamer with default locator and a private cache.
    pub fn new(fetcher: Arc<dyn Fetcher>, config: StreamerConfig) -> Self {
        Self::builder(fetcher).config(config).build()
    }

    pub fn config(&self) -> &StreamerConfig {
        &self.inner.config
    }

    /// The tile cache, for sharing with other components.
    pub fn cache(&self) -> &Arc<ByteBudgetCache> {
        &self.inner.cache
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    pub fn clear_cache(&self) {
        self.inner.cache.clear();
    }

    /// Cancel the running batch, if any, and start a fresh session.
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

    /// Tiles for `viewport` plus configured overview zooms, in fetch order.
    pub fn plan(&self, viewport: &Viewport) -> Vec<TileCoord> {
        let max_zoom = self.inner.config.max_zoom;
        let current = viewport.tile_zoom(max_zoom);
        let mut tiles = tile::required_tiles(viewport, max_zoom);
        for &zoom in &self.inner.config.overview_zooms {
            if zoom != current && zoom <= max_zoom {
                tiles.extend(tile::tiles_in_bounds(&viewport.bounds, zoom));
            }
        }
        prioritize_tiles(&mut tiles, viewport, max_zoom);
        tiles
    }

    /// Stream every tile covering `viewport`.
    ///
    /// `on_tile_load` receives each delivered tile with its key;
    /// `on_progress` receives `(loaded, total)` after every processed tile,
    /// including failures. Completes once every tile is processed or the
    /// batch is cancelled.
    pub async fn stream_tiles<L, P>(
        &self,
        url: &str,
        viewport: &Viewport,
        mut on_tile_load: L,
        mut on_progress: P,
    ) -> StreamSummary
    where
        L: FnMut(&Bytes, &str) + Send,
        P: FnMut(usize, usize) + Send,
    {
        let mut sink = CallbackSink(|event: StreamEvent| match event {
            StreamEvent::TileLoaded { key, data, .. } => on_tile_load(&data, &key),
            StreamEvent::Progress { loaded, total } => on_progress(loaded, total),
            StreamEvent::TileFailed { .. } | StreamEvent::Finished(_) => {}
        });
        self.run(url, viewport, &mut sink).await
    }

    /// Stream tiles, reporting every [`StreamEvent`] to `on_event`.
    pub async fn stream_tiles_with<F>(&self, url: &str, viewport: &Viewport, on_event: F) -> StreamSummary
    where
        F: FnMut(StreamEvent) + Send,
    {
        self.run(url, viewport, &mut CallbackSink(on_event)).await
    }

    /// Stream tiles as a bounded event stream, ending with
    /// [`StreamEvent::Finished`].
    ///
    /// Dropping the stream stops the batch from starting further tiles.
    pub fn stream_tiles_events(&self, url: impl Into<String>, viewport: Viewport) -> EventStream<StreamEvent> {
        let (mut tx, rx) = event_channel(self.inner.config.event_buffer);
        let streamer = self.clone();
        let url = url.into();
        tokio::spawn(async move {
            streamer.run(&url, &viewport, &mut tx).await;
        });
        rx
    }

    async fn run<S: EventSink<StreamEvent>>(
        &self,
        url: &str,
        viewport: &Viewport,
        sink: &mut S,
    ) -> StreamSummary {
        let token = self.session_token();
        let config = &self.inner.config;
        let tiles = self.plan(viewport);
        let total = tiles.len();

        let mut states: Vec<(TileCoord, TileState)> =
            tiles.iter().map(|t| (*t, TileState::Queued)).collect();
        let mut pending = tiles.into_iter().enumerate();
        let mut in_flight = FuturesUnordered::new();
        let mut loaded = 0;
        let mut failed = 0;
        let mut cache_hits = 0;
        let mut consumer_gone = false;

        debug!(url = %url, total, "streaming tiles");

        loop {
            while in_flight.len() < config.max_in_flight.max(1)
                && !token.is_cancelled()
                && !consumer_gone
            {
                let Some((idx, coord)) = pending.next() else {
                    break;
                };
                let key = coord.key();

                if let Some(data) = self.inner.cache.get(&key) {
                    states[idx].1 = TileState::Cached;
                    loaded += 1;
                    cache_hits += 1;
                    consumer_gone |= !sink
                        .emit(StreamEvent::TileLoaded {
                            key,
                            coord,
                            data,
                            from_cache: true,
                        })
                        .await;
                    consumer_gone |= !sink.emit(StreamEvent::Progress { loaded, total }).await;
                    self.maybe_yield(loaded).await;
                    continue;
                }

                states[idx].1 = TileState::Fetching;
                in_flight.push(self.fetch_tile(url, idx, coord, token.clone()));
            }

            let Some((idx, coord, result)) = in_flight.next().await else {
                break;
            };
            let key = coord.key();

            match result {
                Ok(data) => {
                    metrics::counter!(telemetry::TILE_FETCHES_TOTAL, "status" => "ok").increment(1);
                    if let Err(e) = self.inner.cache.put(key.clone(), data.clone()) {
                        warn!(key = %key, error = %e, "tile not cached");
                    }
                    states[idx].1 = TileState::Cached;
                    loaded += 1;
                    consumer_gone |= !sink
                        .emit(StreamEvent::TileLoaded {
                            key,
                            coord,
                            data,
                            from_cache: false,
                        })
                        .await;
                }
                Err(TesseraError::Cancelled) => {
                    metrics::counter!(telemetry::TILE_FETCHES_TOTAL, "status" => "cancelled")
                        .increment(1);
                    states[idx].1 = TileState::Cancelled;
                    continue;
                }
                Err(e) => {
                    metrics::counter!(telemetry::TILE_FETCHES_TOTAL, "status" => "error")
                        .increment(1);
                    let err = TesseraError::TileFetchFailed {
                        key: key.clone(),
                        reason: e.to_string(),
                    };
                    warn!(key = %key, error = %err, "failed to load tile");
                    states[idx].1 = TileState::Failed;
                    loaded += 1;
                    failed += 1;
                    consumer_gone |= !sink
                        .emit(StreamEvent::TileFailed {
                            key,
                            coord,
                            error: err.to_string(),
                        })
                        .await;
                }
            }

            consumer_gone |= !sink.emit(StreamEvent::Progress { loaded, total }).await;
            self.maybe_yield(loaded).await;
        }

        let summary = StreamSummary {
            total,
            loaded,
            failed,
            cache_hits,
            cancelled: token.is_cancelled(),
            tiles: states,
        };
        debug!(
            url = %url,
            total,
            loaded,
            failed,
            cache_hits,
            cancelled = summary.cancelled,
            "tile batch finished"
        );
        sink.emit(StreamEvent::Finished(summary.clone())).await;
        summary
    }

    async fn maybe_yield(&self, processed: usize) {
        let every = self.inner.config.yield_every;
        if every > 0 && processed % every == 0 {
            tokio::task::yield_now().await;
        }
    }

    async fn fetch_tile(
        &self,
        url: &str,
        idx: usize,
        coord: TileCoord,
        token: CancellationToken,
    ) -> (usize, TileCoord, Result<Bytes>) {
        let request = FetchRequest::new(self.inner.locator.tile_url(url, &coord))
            .range(self.inner.locator.byte_range(&coord));
        let result = with_retry(&self.inner.config.retry, "tile", &token, |_| {
            self.inner.fetcher.fetch(&request)
        })
        .await;
        (idx, coord, result)
    }
}
