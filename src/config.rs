//! Configuration loading.
//!
//! Configuration is loaded from TOML files with the following resolution order:
//! 1. An explicit path passed by the host
//! 2. `~/.tessera/config.toml` (user)
//! 3. `/etc/tessera/config.toml` (system)
//!
//! Every section is optional; missing fields take the component defaults.
//!
//! ```toml
//! [streamer]
//! max_zoom = 16
//! cache_megabytes = 64
//!
//! [retry]
//! max_attempts = 5
//!
//! [memory]
//! max_total_megabytes = 256
//! max_layers = 3
//! ```

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::{DiskBlobStore, PersistentConfig};
use crate::fetch::RetryConfig;
use crate::memory::MemoryLimits;
use crate::progressive::ProgressiveConfig;
use crate::stream::StreamerConfig;
use crate::{Result, TesseraError};

const MIB: usize = 1024 * 1024;

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub streamer: StreamerSection,
    #[serde(default)]
    pub progressive: ProgressiveSection,
    #[serde(default)]
    pub persistent: PersistentSection,
    #[serde(default)]
    pub memory: MemorySection,
    /// Retry policy shared by the tile streamer and the progressive loader.
    #[serde(default)]
    pub retry: RetrySection,
}

/// `[streamer]`: tile fetch pipeline.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StreamerSection {
    /// Tile edge in pixels (default: 256).
    #[serde(default = "default_tile_size")]
    pub tile_size: u32,
    /// Highest requested zoom (default: 18).
    #[serde(default = "default_max_zoom")]
    pub max_zoom: u8,
    /// Tile cache budget in megabytes (default: 100).
    #[serde(default = "default_tile_cache_mb")]
    pub cache_megabytes: usize,
    /// Coarser zooms streamed after the current zoom (default: none).
    #[serde(default)]
    pub overview_zooms: Vec<u8>,
    /// Concurrent tile fetches (default: 4).
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// Yield to the runtime after this many tiles (default: 5).
    #[serde(default = "default_yield_every")]
    pub yield_every: usize,
}

impl Default for StreamerSection {
    fn default() -> Self {
        Self {
            tile_size: default_tile_size(),
            max_zoom: default_max_zoom(),
            cache_megabytes: default_tile_cache_mb(),
            overview_zooms: Vec::new(),
            max_in_flight: default_max_in_flight(),
            yield_every: default_yield_every(),
        }
    }
}

fn default_tile_size() -> u32 {
    256
}

fn default_max_zoom() -> u8 {
    crate::tile::DEFAULT_MAX_ZOOM
}

fn default_tile_cache_mb() -> usize {
    100
}

fn default_max_in_flight() -> usize {
    4
}

fn default_yield_every() -> usize {
    5
}

/// `[progressive]`: multi-level loader.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProgressiveSection {
    /// Quality levels (default: [1, 2, 4, 8]).
    #[serde(default = "default_levels")]
    pub levels: Vec<u32>,
    /// Memory cache budget in megabytes (default: 200).
    #[serde(default = "default_progressive_cache_mb")]
    pub cache_megabytes: usize,
    /// Cache entry lifetime in seconds for the memory and persistent tiers
    /// (default: 86400).
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    /// `Cache-Control: max-age` for level requests; 0 disables (default: 86400).
    #[serde(default = "default_ttl_secs")]
    pub request_max_age_secs: u64,
}

impl Default for ProgressiveSection {
    fn default() -> Self {
        Self {
            levels: default_levels(),
            cache_megabytes: default_progressive_cache_mb(),
            ttl_secs: default_ttl_secs(),
            request_max_age_secs: default_ttl_secs(),
        }
    }
}

fn default_levels() -> Vec<u32> {
    vec![1, 2, 4, 8]
}

fn default_progressive_cache_mb() -> usize {
    200
}

fn default_ttl_secs() -> u64 {
    24 * 3600
}

/// `[persistent]`: durable blob store.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PersistentSection {
    /// Store directory (default: `<cache_dir>/tessera/blobs`).
    #[serde(default)]
    pub dir: Option<PathBuf>,
    /// Byte budget in megabytes (default: 1024). Entry lifetime is
    /// `progressive.ttl_secs`, shared by both cache tiers.
    #[serde(default = "default_persistent_mb")]
    pub max_megabytes: usize,
}

impl Default for PersistentSection {
    fn default() -> Self {
        Self {
            dir: None,
            max_megabytes: default_persistent_mb(),
        }
    }
}

fn default_persistent_mb() -> usize {
    1024
}

impl PersistentSection {
    /// Disk store at the configured directory, or the default one.
    pub fn disk_store(&self) -> Result<DiskBlobStore> {
        match &self.dir {
            Some(dir) => Ok(DiskBlobStore::new(dir)),
            None => DiskBlobStore::with_default_dir(),
        }
    }
}

/// `[memory]`: layer memory manager.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemorySection {
    /// Layer budget in megabytes (default: 512).
    #[serde(default = "default_layer_mb")]
    pub max_total_megabytes: usize,
    /// Maximum concurrent layers (default: 4).
    #[serde(default = "default_max_layers")]
    pub max_layers: usize,
    /// Thumbnail budget in megabytes (default: 50).
    #[serde(default = "default_thumbnail_mb")]
    pub thumbnail_budget_megabytes: usize,
    /// Pressure check interval in seconds (default: 5).
    #[serde(default = "default_pressure_secs")]
    pub pressure_interval_secs: u64,
    /// Usage ratio that triggers pressure handling (default: 0.9).
    #[serde(default = "default_high_water")]
    pub high_water_ratio: f64,
    /// Usage ratio pressure handling evicts down to (default: 0.8).
    #[serde(default = "default_target_ratio")]
    pub target_ratio: f64,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            max_total_megabytes: default_layer_mb(),
            max_layers: default_max_layers(),
            thumbnail_budget_megabytes: default_thumbnail_mb(),
            pressure_interval_secs: default_pressure_secs(),
            high_water_ratio: default_high_water(),
            target_ratio: default_target_ratio(),
        }
    }
}

fn default_layer_mb() -> usize {
    512
}

fn default_max_layers() -> usize {
    4
}

fn default_thumbnail_mb() -> usize {
    50
}

fn default_pressure_secs() -> u64 {
    5
}

fn default_high_water() -> f64 {
    0.9
}

fn default_target_ratio() -> f64 {
    0.8
}

/// `[retry]`: fetch retry policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetrySection {
    /// Attempts including the first (default: 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// First backoff in milliseconds; doubles per retry (default: 1000).
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Backoff cap in milliseconds (default: 30000).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Per-attempt timeout in seconds (default: 30).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_timeout_secs() -> u64 {
    30
}

impl Config {
    /// Load configuration from the standard locations.
    ///
    /// Resolution order:
    /// 1. Explicit path (if provided)
    /// 2. `~/.tessera/config.toml`
    /// 3. `/etc/tessera/config.toml`
    ///
    /// Returns the defaults when no explicit path is given and no file exists.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let Some(path) = Self::resolve_config_path(explicit_path)? else {
            return Ok(Self::default());
        };
        let content = fs::read_to_string(&path).map_err(|e| {
            TesseraError::Configuration(format!("Failed to read config file {path:?}: {e}"))
        })?;
        Self::from_toml(&content).map_err(|e| match e {
            TesseraError::Configuration(msg) => {
                TesseraError::Configuration(format!("{msg} in {path:?}"))
            }
            other => other,
        })
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| TesseraError::Configuration(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn resolve_config_path(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit {
            if path.exists() {
                return Ok(Some(path.to_path_buf()));
            }
            return Err(TesseraError::Configuration(format!(
                "Config file not found: {path:?}"
            )));
        }

        // User config
        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".tessera").join("config.toml");
            if user_config.exists() {
                return Ok(Some(user_config));
            }
        }

        // System config
        let system_config = PathBuf::from("/etc/tessera/config.toml");
        if system_config.exists() {
            return Ok(Some(system_config));
        }

        Ok(None)
    }

    fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(TesseraError::Configuration(msg.to_string()));

        if self.streamer.max_zoom > crate::tile::MAX_SUPPORTED_ZOOM {
            return invalid("streamer.max_zoom exceeds the supported maximum");
        }
        if self.streamer.max_in_flight == 0 {
            return invalid("streamer.max_in_flight must be at least 1");
        }
        if self.progressive.levels.is_empty() {
            return invalid("progressive.levels must not be empty");
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1");
        }
        if self.memory.pressure_interval_secs == 0 {
            return invalid("memory.pressure_interval_secs must be at least 1");
        }
        let ratios = [self.memory.high_water_ratio, self.memory.target_ratio];
        if ratios.iter().any(|r| !(0.0..=1.0).contains(r)) {
            return invalid("memory ratios must be within 0.0..=1.0");
        }
        if self.memory.target_ratio > self.memory.high_water_ratio {
            return invalid("memory.target_ratio must not exceed memory.high_water_ratio");
        }
        Ok(())
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new()
            .max_attempts(self.retry.max_attempts)
            .initial_delay(Duration::from_millis(self.retry.initial_delay_ms))
            .max_delay(Duration::from_millis(self.retry.max_delay_ms))
            .timeout(Duration::from_secs(self.retry.timeout_secs))
    }

    pub fn streamer_config(&self) -> StreamerConfig {
        let s = &self.streamer;
        StreamerConfig::new()
            .tile_size(s.tile_size)
            .max_zoom(s.max_zoom)
            .cache_bytes(s.cache_megabytes * MIB)
            .overview_zooms(s.overview_zooms.clone())
            .max_in_flight(s.max_in_flight)
            .yield_every(s.yield_every)
            .retry(self.retry_config())
    }

    pub fn progressive_config(&self) -> ProgressiveConfig {
        let p = &self.progressive;
        let max_age = (p.request_max_age_secs > 0).then(|| Duration::from_secs(p.request_max_age_secs));
        ProgressiveConfig::new()
            .levels(p.levels.clone())
            .cache_bytes(p.cache_megabytes * MIB)
            .ttl(Duration::from_secs(p.ttl_secs))
            .request_max_age(max_age)
            .retry(self.retry_config())
    }

    pub fn persistent_config(&self) -> PersistentConfig {
        PersistentConfig::new()
            .ttl(Duration::from_secs(self.progressive.ttl_secs))
            .max_bytes(self.persistent.max_megabytes * MIB)
    }

    pub fn memory_limits(&self) -> MemoryLimits {
        let m = &self.memory;
        MemoryLimits::new()
            .max_total_memory(m.max_total_megabytes * MIB)
            .max_layers(m.max_layers)
            .thumbnail_budget(m.thumbnail_budget_megabytes * MIB)
            .pressure_interval(Duration::from_secs(m.pressure_interval_secs))
            .high_water_ratio(m.high_water_ratio)
            .target_ratio(m.target_ratio)
    }
}
