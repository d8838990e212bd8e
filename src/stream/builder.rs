//! Builder for configuring streamer instances

use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use super::{Inner, StreamerConfig, TileStreamer};
use crate::cache::ByteBudgetCache;
use crate::fetch::{Fetcher, QueryTileLocator, TileLocator};

/// Builder for [`TileStreamer`].
pub struct TileStreamerBuilder {
    fetcher: Arc<dyn Fetcher>,
    config: StreamerConfig,
    locator: Option<Arc<dyn TileLocator>>,
    cache: Option<Arc<ByteBudgetCache>>,
}

impl TileStreamerBuilder {
    pub fn new(fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            fetcher,
            config: StreamerConfig::default(),
            locator: None,
            cache: None,
        }
    }

    pub fn config(mut self, config: StreamerConfig) -> Self {
        self.config = config;
        self
    }

    /// Resolve tile URLs and byte ranges with `locator`.
    ///
    /// Defaults to [`QueryTileLocator`].
    pub fn locator(mut self, locator: Arc<dyn TileLocator>) -> Self {
        self.locator = Some(locator);
        self
    }

    /// Use an existing cache instead of a private one sized by
    /// [`StreamerConfig::cache_bytes`].
    pub fn cache(mut self, cache: Arc<ByteBudgetCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn build(self) -> TileStreamer {
        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(ByteBudgetCache::new(self.config.cache_bytes)));
        let locator = self
            .locator
            .unwrap_or_else(|| Arc::new(QueryTileLocator::new()));

        TileStreamer {
            inner: Arc::new(Inner {
                config: self.config,
                fetcher: self.fetcher,
                locator,
                cache,
                session: Mutex::new(CancellationToken::new()),
            }),
        }
    }
}
