//! Memory accounting for decoded raster layers.
//!
//! [`LayerMemoryManager`] owns the render buffers of every layer currently
//! on screen (or about to be) and keeps their total size within
//! [`MemoryLimits::max_total_memory`] and their count within
//! [`MemoryLimits::max_layers`].
//!
//! # Admission
//!
//! [`add_layer`](LayerMemoryManager::add_layer) plans evictions before
//! touching anything. Candidates are taken hidden layers first, then by
//! ascending priority, then least recently accessed. High-priority visible
//! layers are never candidates. If the plan cannot make room the layer is
//! rejected with [`TesseraError::InsufficientMemory`] and no existing layer
//! is disturbed; otherwise the planned victims are dropped and the layer is
//! admitted.
//!
//! # Pressure
//!
//! [`check_memory_pressure`](LayerMemoryManager::check_memory_pressure)
//! runs when usage exceeds the high-water ratio, either on demand or from
//! the interval task started by
//! [`start_pressure_monitor`](LayerMemoryManager::start_pressure_monitor).
//! It drops thumbnails of hidden layers, evicts down to the target ratio,
//! and notifies every observer.

pub mod thumbnail;

pub use thumbnail::{
    DEFAULT_THUMBNAIL_MAX_BYTES, DownsampleRenderer, ThumbnailRenderer, ThumbnailRequest,
    ThumbnailWorker, spawn_thumbnail_worker,
};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::fetch::{FetchRequest, Fetcher};
use crate::telemetry;
use crate::{Result, TesseraError};

/// Layer retention priority. Ordered `Low < Medium < High`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum LayerPriority {
    Low,
    #[default]
    Medium,
    High,
}

/// Memory pressure level from a usage ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MemoryPressure {
    /// Below 50% of the budget.
    Low,
    /// 50% to 75%.
    Moderate,
    /// 75% to 90%.
    High,
    /// 90% and above.
    Critical,
}

impl MemoryPressure {
    pub fn from_utilization(utilization: f64) -> Self {
        if utilization < 0.5 {
            MemoryPressure::Low
        } else if utilization < 0.75 {
            MemoryPressure::Moderate
        } else if utilization < 0.90 {
            MemoryPressure::High
        } else {
            MemoryPressure::Critical
        }
    }
}

/// Limits for the layer manager.
#[derive(Debug, Clone)]
pub struct MemoryLimits {
    /// Byte budget across all render buffers. Default: 512 MiB.
    pub max_total_memory: usize,
    /// Maximum number of layers held at once. Default: 4.
    pub max_layers: usize,
    /// Byte budget across all thumbnails. Default: 50 MiB.
    pub thumbnail_budget: usize,
    /// Upper bound on one thumbnail. Default: 1 MiB.
    pub thumbnail_max_bytes: usize,
    /// Interval of the pressure monitor. Default: 5s.
    pub pressure_interval: Duration,
    /// Usage ratio above which pressure handling runs. Default: 0.9.
    pub high_water_ratio: f64,
    /// Usage ratio pressure handling evicts down to. Default: 0.8.
    pub target_ratio: f64,
}

/// Shortest interval the pressure monitor runs at.
pub const MIN_PRESSURE_INTERVAL: Duration = Duration::from_millis(100);

impl Default for MemoryLimits {
    fn default() -> Self {
        Self {
            max_total_memory: 512 * 1024 * 1024,
            max_layers: 4,
            thumbnail_budget: 50 * 1024 * 1024,
            thumbnail_max_bytes: DEFAULT_THUMBNAIL_MAX_BYTES,
            pressure_interval: Duration::from_secs(5),
            high_water_ratio: 0.9,
            target_ratio: 0.8,
        }
    }
}

impl MemoryLimits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_total_memory(mut self, bytes: usize) -> Self {
        self.max_total_memory = bytes;
        self
    }

    pub fn max_layers(mut self, n: usize) -> Self {
        self.max_layers = n;
        self
    }

    pub fn thumbnail_budget(mut self, bytes: usize) -> Self {
        self.thumbnail_budget = bytes;
        self
    }

    pub fn thumbnail_max_bytes(mut self, bytes: usize) -> Self {
        self.thumbnail_max_bytes = bytes;
        self
    }

    /// Set the pressure monitor interval, raised to at least
    /// [`MIN_PRESSURE_INTERVAL`].
    pub fn pressure_interval(mut self, interval: Duration) -> Self {
        self.pressure_interval = interval.max(MIN_PRESSURE_INTERVAL);
        self
    }

    pub fn high_water_ratio(mut self, ratio: f64) -> Self {
        self.high_water_ratio = ratio;
        self
    }

    pub fn target_ratio(mut self, ratio: f64) -> Self {
        self.target_ratio = ratio;
        self
    }
}

/// What a pressure pass did. Delivered to every observer.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryPressureEvent {
    pub usage_before: usize,
    pub usage_after: usize,
    pub max_total_memory: usize,
    /// Thumbnail bytes released from hidden layers.
    pub thumbnail_bytes_freed: usize,
    /// Layers evicted, in eviction order.
    pub evicted: Vec<String>,
    pub pressure: MemoryPressure,
}

/// Read-only usage snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryStats {
    pub current_usage: usize,
    pub max_usage: usize,
    pub layer_count: usize,
    /// Usage as a percentage of the budget, 0 to 100.
    pub usage_percentage: f64,
    pub thumbnail_bytes: usize,
    pub pressure: MemoryPressure,
}

/// Summary of one tracked layer.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerInfo {
    pub id: String,
    pub size_bytes: usize,
    pub priority: LayerPriority,
    pub visible: bool,
    pub has_thumbnail: bool,
    pub last_accessed: Instant,
}

type PressureCallback = Arc<dyn Fn(&MemoryPressureEvent) + Send + Sync>;

struct LayerRecord {
    size_bytes: usize,
    priority: LayerPriority,
    visible: bool,
    render_data: Bytes,
    thumbnail: Option<Bytes>,
    last_accessed: Instant,
    /// Logical access clock; breaks ties that `Instant` cannot.
    access_tick: u64,
    /// Distinguishes a re-added layer from its predecessor.
    generation: u64,
}

impl LayerRecord {
    fn evictable(&self) -> bool {
        !(self.priority == LayerPriority::High && self.visible)
    }

    /// Eviction order key: hidden first, then low priority, then oldest.
    fn eviction_key(&self) -> (bool, LayerPriority, u64) {
        (self.visible, self.priority, self.access_tick)
    }
}

#[derive(Default)]
struct State {
    layers: HashMap<String, LayerRecord>,
    usage: usize,
    thumbnail_usage: usize,
    tick: u64,
    next_generation: u64,
    observers: HashMap<u64, PressureCallback>,
    next_observer: u64,
    monitor: Option<AbortHandle>,
}

impl State {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn touch(&mut self, id: &str) -> Option<&LayerRecord> {
        let tick = self.next_tick();
        let layer = self.layers.get_mut(id)?;
        layer.access_tick = tick;
        layer.last_accessed = Instant::now();
        Some(layer)
    }

    fn remove(&mut self, id: &str) -> Option<LayerRecord> {
        let layer = self.layers.remove(id)?;
        self.usage -= layer.size_bytes;
        if let Some(thumb) = &layer.thumbnail {
            self.thumbnail_usage -= thumb.len();
        }
        Some(layer)
    }

    /// Evictable layers other than `exclude`, in eviction order.
    fn eviction_candidates(&self, exclude: Option<&str>) -> Vec<(String, usize)> {
        let mut candidates: Vec<(&String, &LayerRecord)> = self
            .layers
            .iter()
            .filter(|(id, layer)| layer.evictable() && Some(id.as_str()) != exclude)
            .collect();
        candidates.sort_by_key(|(_, layer)| layer.eviction_key());
        candidates
            .into_iter()
            .map(|(id, layer)| (id.clone(), layer.size_bytes))
            .collect()
    }

    fn evict(&mut self, id: &str) {
        if let Some(layer) = self.remove(id) {
            metrics::counter!(telemetry::LAYER_EVICTIONS_TOTAL).increment(1);
            debug!(layer = %id, size = layer.size_bytes, priority = ?layer.priority, "evicted layer");
        }
    }

    /// Drop thumbnails of hidden layers, returning bytes freed.
    fn drop_hidden_thumbnails(&mut self) -> usize {
        let mut freed = 0;
        for layer in self.layers.values_mut().filter(|l| !l.visible) {
            if let Some(thumb) = layer.thumbnail.take() {
                freed += thumb.len();
            }
        }
        self.thumbnail_usage -= freed;
        freed
    }
}

struct Shared {
    limits: MemoryLimits,
    state: Mutex<State>,
    thumbnails: Option<ThumbnailWorker>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(monitor) = state.monitor.take() {
            monitor.abort();
        }
    }
}

/// Tracks and bounds memory held by concurrently displayed layers.
///
/// Cheap to clone; clones share the same layer table.
#[derive(Clone)]
pub struct LayerMemoryManager {
    shared: Arc<Shared>,
}

impl LayerMemoryManager {
    /// Manager without thumbnail generation.
    pub fn new(limits: MemoryLimits) -> Self {
        Self::build(limits, None)
    }

    /// Manager that renders a thumbnail for every admitted layer on `worker`.
    pub fn with_thumbnails(limits: MemoryLimits, worker: ThumbnailWorker) -> Self {
        Self::build(limits, Some(worker))
    }

    fn build(limits: MemoryLimits, thumbnails: Option<ThumbnailWorker>) -> Self {
        Self {
            shared: Arc::new(Shared {
                limits,
                state: Mutex::new(State::default()),
                thumbnails,
            }),
        }
    }

    pub fn limits(&self) -> &MemoryLimits {
        &self.shared.limits
    }

    /// Admit a layer, evicting lower-value layers first if needed.
    ///
    /// Adding an existing id replaces it. The new layer starts visible.
    /// Fails with [`TesseraError::InsufficientMemory`] when no eviction plan
    /// makes room; in that case nothing is changed.
    pub fn add_layer(&self, id: impl Into<String>, data: Bytes, priority: LayerPriority) -> Result<()> {
        self.admit(id.into(), data, priority, true)
    }

    fn admit(&self, id: String, data: Bytes, priority: LayerPriority, visible: bool) -> Result<()> {
        let limits = &self.shared.limits;
        let size = data.len();

        let generation = {
            let mut state = self.shared.state();

            let (replaced_size, replaced_count) = state
                .layers
                .get(&id)
                .map_or((0, 0), |layer| (layer.size_bytes, 1));
            let mut usage = state.usage - replaced_size;
            let mut count = state.layers.len() - replaced_count;
            let available = limits.max_total_memory.saturating_sub(usage);

            let reject = |state: &State| {
                metrics::counter!(telemetry::LAYER_REJECTIONS_TOTAL).increment(1);
                let err = TesseraError::InsufficientMemory {
                    id: id.clone(),
                    required: size,
                    available,
                };
                warn!(layer = %id, error = %err, layers = state.layers.len(), "layer rejected");
                err
            };

            if size > limits.max_total_memory || limits.max_layers == 0 {
                return Err(reject(&state));
            }

            let mut victims = Vec::new();
            let mut candidates = state.eviction_candidates(Some(&id)).into_iter();
            while usage + size > limits.max_total_memory || count + 1 > limits.max_layers {
                let Some((victim, victim_size)) = candidates.next() else {
                    return Err(reject(&state));
                };
                usage -= victim_size;
                count -= 1;
                victims.push(victim);
            }

            for victim in &victims {
                state.evict(victim);
            }
            state.remove(&id);

            let tick = state.next_tick();
            state.next_generation += 1;
            let generation = state.next_generation;
            state.usage += size;
            state.layers.insert(
                id.clone(),
                LayerRecord {
                    size_bytes: size,
                    priority,
                    visible,
                    render_data: data.clone(),
                    thumbnail: None,
                    last_accessed: Instant::now(),
                    access_tick: tick,
                    generation,
                },
            );
            debug!(layer = %id, size, ?priority, evicted = victims.len(), usage = state.usage, "layer admitted");
            generation
        };

        self.spawn_thumbnail(id, data, generation);
        Ok(())
    }

    fn spawn_thumbnail(&self, id: String, data: Bytes, generation: u64) {
        let Some(worker) = self.shared.thumbnails.clone() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(layer = %id, "no runtime, skipping thumbnail");
            return;
        };

        let weak = Arc::downgrade(&self.shared);
        let max_bytes = self.shared.limits.thumbnail_max_bytes;
        runtime.spawn(async move {
            let request = ThumbnailRequest {
                layer_id: id.clone(),
                data,
                max_bytes,
            };
            match worker.request(request).await {
                Ok(thumb) => {
                    if let Some(shared) = weak.upgrade() {
                        store_thumbnail(&shared, &id, generation, thumb);
                    }
                }
                Err(e) => warn!(layer = %id, error = %e, "failed to generate thumbnail"),
            }
        });
    }

    /// Release a layer and its thumbnail. Unknown ids are ignored.
    ///
    /// Returns whether a layer was removed.
    pub fn remove_layer(&self, id: &str) -> bool {
        let removed = self.shared.state().remove(id).is_some();
        if removed {
            debug!(layer = %id, "layer removed");
        }
        removed
    }

    /// Show or hide a layer.
    ///
    /// Hiding demotes the layer to [`LayerPriority::Low`] unless it is
    /// [`LayerPriority::High`]. Showing never promotes.
    pub fn update_visibility(&self, id: &str, visible: bool) {
        let mut state = self.shared.state();
        let tick = state.next_tick();
        let Some(layer) = state.layers.get_mut(id) else {
            return;
        };
        layer.visible = visible;
        layer.access_tick = tick;
        layer.last_accessed = Instant::now();
        if !visible && layer.priority != LayerPriority::High {
            layer.priority = LayerPriority::Low;
        }
    }

    /// Render buffer of a layer, marking it recently used.
    pub fn get_layer_data(&self, id: &str) -> Option<Bytes> {
        self.shared
            .state()
            .touch(id)
            .map(|layer| layer.render_data.clone())
    }

    /// Thumbnail of a layer, marking it recently used.
    ///
    /// `None` until the thumbnail has been rendered, or after it was dropped
    /// under memory pressure.
    pub fn get_layer_thumbnail(&self, id: &str) -> Option<Bytes> {
        self.shared
            .state()
            .touch(id)
            .and_then(|layer| layer.thumbnail.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.shared.state().layers.contains_key(id)
    }

    /// Summary of one layer, without touching it.
    pub fn layer_info(&self, id: &str) -> Option<LayerInfo> {
        let state = self.shared.state();
        state.layers.get(id).map(|layer| LayerInfo {
            id: id.to_owned(),
            size_bytes: layer.size_bytes,
            priority: layer.priority,
            visible: layer.visible,
            has_thumbnail: layer.thumbnail.is_some(),
            last_accessed: layer.last_accessed,
        })
    }

    /// Ids of all tracked layers, unordered.
    pub fn layer_ids(&self) -> Vec<String> {
        self.shared.state().layers.keys().cloned().collect()
    }

    pub fn stats(&self) -> MemoryStats {
        let state = self.shared.state();
        let max = self.shared.limits.max_total_memory;
        let ratio = if max == 0 {
            0.0
        } else {
            state.usage as f64 / max as f64
        };
        MemoryStats {
            current_usage: state.usage,
            max_usage: max,
            layer_count: state.layers.len(),
            usage_percentage: ratio * 100.0,
            thumbnail_bytes: state.thumbnail_usage,
            pressure: MemoryPressure::from_utilization(ratio),
        }
    }

    /// Current pressure level.
    pub fn pressure(&self) -> MemoryPressure {
        self.stats().pressure
    }

    /// Run pressure handling if usage exceeds the high-water ratio.
    pub fn check_memory_pressure(&self) -> Option<MemoryPressureEvent> {
        let ratio = {
            let state = self.shared.state();
            let max = self.shared.limits.max_total_memory;
            if max == 0 {
                return None;
            }
            state.usage as f64 / max as f64
        };
        if ratio > self.shared.limits.high_water_ratio {
            Some(self.relieve_memory_pressure())
        } else {
            None
        }
    }

    /// Free memory unconditionally and notify observers.
    ///
    /// Drops thumbnails of hidden layers, then evicts layers in eviction
    /// order until usage is at or below the target ratio. Hosts call this
    /// directly when the platform signals memory pressure.
    pub fn relieve_memory_pressure(&self) -> MemoryPressureEvent {
        let limits = &self.shared.limits;
        let (event, observers) = {
            let mut state = self.shared.state();
            let usage_before = state.usage;
            let thumbnail_bytes_freed = state.drop_hidden_thumbnails();

            let target = (limits.max_total_memory as f64 * limits.target_ratio) as usize;
            let mut evicted = Vec::new();
            if state.usage > target {
                for (id, _) in state.eviction_candidates(None) {
                    if state.usage <= target {
                        break;
                    }
                    state.evict(&id);
                    evicted.push(id);
                }
            }

            let ratio = if limits.max_total_memory == 0 {
                0.0
            } else {
                state.usage as f64 / limits.max_total_memory as f64
            };
            let event = MemoryPressureEvent {
                usage_before,
                usage_after: state.usage,
                max_total_memory: limits.max_total_memory,
                thumbnail_bytes_freed,
                evicted,
                pressure: MemoryPressure::from_utilization(ratio),
            };
            let observers: Vec<PressureCallback> = state.observers.values().cloned().collect();
            (event, observers)
        };

        metrics::counter!(telemetry::MEMORY_PRESSURE_EVENTS_TOTAL).increment(1);
        info!(
            usage_before = event.usage_before,
            usage_after = event.usage_after,
            thumbnails_freed = event.thumbnail_bytes_freed,
            evicted = event.evicted.len(),
            "memory pressure handled"
        );

        for observer in observers {
            observer(&event);
        }
        event
    }

    /// Register `callback` for every pressure event.
    pub fn on_memory_pressure<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&MemoryPressureEvent) + Send + Sync + 'static,
    {
        let mut state = self.shared.state();
        state.next_observer += 1;
        let id = state.next_observer;
        state.observers.insert(id, Arc::new(callback));
        Subscription {
            shared: Arc::downgrade(&self.shared),
            id,
        }
    }

    pub fn observer_count(&self) -> usize {
        self.shared.state().observers.len()
    }

    /// Start the periodic pressure check, replacing any running monitor.
    ///
    /// The task holds only a weak reference and ends once the manager is
    /// dropped or disposed.
    ///
    /// # Panics
    ///
    /// Requires a tokio runtime context.
    pub fn start_pressure_monitor(&self) {
        let weak = Arc::downgrade(&self.shared);
        let period = self.shared.limits.pressure_interval.max(MIN_PRESSURE_INTERVAL);
        let handle = tokio::spawn(pressure_monitor(weak, period));

        if let Some(previous) = self.shared.state().monitor.replace(handle.abort_handle()) {
            previous.abort();
        }
    }

    /// Stop the periodic pressure check, if running.
    pub fn stop_pressure_monitor(&self) {
        if let Some(monitor) = self.shared.state().monitor.take() {
            monitor.abort();
        }
    }

    /// Fetch `url` and add it as a hidden, low-priority layer.
    ///
    /// Does nothing if `id` is already tracked. Failures are logged.
    /// Returns whether the layer was added.
    pub async fn preload_layer(&self, id: &str, url: &str, fetcher: &dyn Fetcher) -> bool {
        if self.contains(id) {
            return false;
        }
        let result = match fetcher.fetch(&FetchRequest::new(url)).await {
            Ok(data) => self.admit(id.to_owned(), data, LayerPriority::Low, false),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(layer = %id, url = %url, error = %e, "failed to preload layer");
                false
            }
        }
    }

    /// Release every layer, stop the monitor and drop all observers.
    pub fn dispose(&self) {
        let mut state = self.shared.state();
        state.layers.clear();
        state.usage = 0;
        state.thumbnail_usage = 0;
        state.observers.clear();
        if let Some(monitor) = state.monitor.take() {
            monitor.abort();
        }
        debug!("layer memory manager disposed");
    }
}

fn store_thumbnail(shared: &Shared, id: &str, generation: u64, thumb: Bytes) {
    let budget = shared.limits.thumbnail_budget;
    let mut guard = shared.state();
    let state = &mut *guard;

    let current = match state.layers.get(id) {
        Some(layer) if layer.generation == generation => {
            layer.thumbnail.as_ref().map_or(0, Bytes::len)
        }
        _ => return,
    };

    // Make room by dropping the oldest thumbnails, hidden layers first.
    let needed = (state.thumbnail_usage - current + thumb.len()).saturating_sub(budget);
    if needed > 0 {
        let mut holders: Vec<(String, (bool, LayerPriority, u64))> = state
            .layers
            .iter()
            .filter(|(other, layer)| other.as_str() != id && layer.thumbnail.is_some())
            .map(|(other, layer)| (other.clone(), layer.eviction_key()))
            .collect();
        holders.sort_by_key(|(_, key)| *key);

        let mut freed = 0;
        for (other, _) in holders {
            if freed >= needed {
                break;
            }
            if let Some(old) = state.layers.get_mut(&other).and_then(|l| l.thumbnail.take()) {
                freed += old.len();
                state.thumbnail_usage -= old.len();
            }
        }
        if freed < needed {
            debug!(layer = %id, size = thumb.len(), "thumbnail exceeds budget, discarded");
            return;
        }
    }

    if let Some(layer) = state.layers.get_mut(id) {
        let size = thumb.len();
        if let Some(old) = layer.thumbnail.replace(thumb) {
            state.thumbnail_usage -= old.len();
        }
        state.thumbnail_usage += size;
    }
}

async fn pressure_monitor(shared: Weak<Shared>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    interval.tick().await;
    loop {
        interval.tick().await;
        let Some(shared) = shared.upgrade() else {
            break;
        };
        LayerMemoryManager { shared }.check_memory_pressure();
    }
}

/// Handle for a registered pressure observer.
#[derive(Debug)]
pub struct Subscription {
    shared: Weak<Shared>,
    id: u64,
}

impl Subscription {
    /// Remove the observer. No-op if the manager is gone.
    pub fn unsubscribe(self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.state().observers.remove(&self.id);
        }
    }
}
