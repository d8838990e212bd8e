//! Telemetry metric name constants.
//!
//! Centralised metric names for tessera operations. Consumers install
//! their own `metrics` recorder (e.g. prometheus, statsd); without a
//! recorder installed, all metric calls are no-ops.
//!
//! # Metric naming conventions
//!
//! All metrics are prefixed with `tessera_`. Counters end in `_total`,
//! histograms use meaningful units (e.g. `_seconds`).
//!
//! # Common labels
//!
//! - `tier` — cache tier: "memory" or "persistent"
//! - `status` — fetch outcome: "ok", "error" or "cancelled"
//! - `outcome` — progressive load outcome: "cache", "complete", "partial" or "failed"

/// Total cache hits.
///
/// Labels: `tier`.
pub const CACHE_HITS_TOTAL: &str = "tessera_cache_hits_total";

/// Total cache misses.
///
/// Labels: `tier`.
pub const CACHE_MISSES_TOTAL: &str = "tessera_cache_misses_total";

/// Total entries evicted to stay within a byte budget.
///
/// Labels: `tier`.
pub const CACHE_EVICTIONS_TOTAL: &str = "tessera_cache_evictions_total";

/// Total single-tile fetches.
///
/// Labels: `status` ("ok" | "error" | "cancelled").
pub const TILE_FETCHES_TOTAL: &str = "tessera_tile_fetches_total";

/// Network fetch duration in seconds (tiles and progressive levels).
pub const FETCH_DURATION_SECONDS: &str = "tessera_fetch_duration_seconds";

/// Total retry attempts (not counting the initial request).
///
/// Labels: `operation` ("tile" | "progressive").
pub const RETRIES_TOTAL: &str = "tessera_retries_total";

/// Total progressive loads.
///
/// Labels: `outcome` ("cache" | "complete" | "partial" | "failed").
pub const PROGRESSIVE_LOADS_TOTAL: &str = "tessera_progressive_loads_total";

/// Total layers evicted by the layer memory manager.
pub const LAYER_EVICTIONS_TOTAL: &str = "tessera_layer_evictions_total";

/// Total layers rejected for lack of memory.
pub const LAYER_REJECTIONS_TOTAL: &str = "tessera_layer_rejections_total";

/// Total memory-pressure events raised by the layer memory manager.
pub const MEMORY_PRESSURE_EVENTS_TOTAL: &str = "tessera_memory_pressure_events_total";

/// Total persistent store I/O errors absorbed as cache misses or dropped writes.
pub const PERSISTENT_STORE_ERRORS_TOTAL: &str = "tessera_persistent_store_errors_total";
