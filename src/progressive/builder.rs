//! Builder for configuring loader instances

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Inner, ProgressiveConfig, ProgressiveLoader};
use crate::cache::{ByteBudgetCache, PersistentBlobStore};
use crate::fetch::Fetcher;

/// Builder for [`ProgressiveLoader`].
pub struct ProgressiveLoaderBuilder {
    fetcher: Arc<dyn Fetcher>,
    config: ProgressiveConfig,
    cache: Option<Arc<ByteBudgetCache>>,
    persistent: Option<Arc<PersistentBlobStore>>,
}

impl ProgressiveLoaderBuilder {
    pub fn new(fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            fetcher,
            config: ProgressiveConfig::default(),
            cache: None,
            persistent: None,
        }
    }

    pub fn config(mut self, config: ProgressiveConfig) -> Self {
        self.config = config;
        self
    }

    /// Use an existing memory cache instead of a private one sized by
    /// [`ProgressiveConfig::cache_bytes`].
    pub fn cache(mut self, cache: Arc<ByteBudgetCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Add a persistent tier. Without one, only the memory cache is used.
    pub fn persistent(mut self, store: Arc<PersistentBlobStore>) -> Self {
        self.persistent = Some(store);
        self
    }

    /// Build the loader.
    ///
    /// With a persistent tier attached, both tiers use the shorter of
    /// [`ProgressiveConfig::ttl`] and the store's TTL.
    pub fn build(mut self) -> ProgressiveLoader {
        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(ByteBudgetCache::new(self.config.cache_bytes)));

        if let Some(store) = &self.persistent {
            if store.ttl() < self.config.ttl {
                debug!(
                    loader_ttl = ?self.config.ttl,
                    store_ttl = ?store.ttl(),
                    "using persistent store TTL for both tiers"
                );
                self.config.ttl = store.ttl();
            }
        }

        ProgressiveLoader {
            inner: Arc::new(Inner {
                config: self.config,
                fetcher: self.fetcher,
                cache,
                persistent: self.persistent,
                states: Mutex::new(HashMap::new()),
                session: Mutex::new(CancellationToken::new()),
            }),
        }
    }
}
