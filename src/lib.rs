//! Tessera - progressive tile streaming and caching for large raster imagery
//!
//! This crate provides the data plumbing behind a raster viewer: it decides
//! which tiles a viewport needs, streams them in priority order through a
//! byte-bounded memory cache, loads whole images progressively from coarse to
//! fine quality through a two-tier (memory + persistent) cache, and keeps the
//! decoded layers on screen within a fixed memory budget.
//!
//! Every component is an explicit object constructed with its configuration;
//! there is no global state. Components share caches by `Arc`.
//!
//! # Tile Streaming Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tessera::{BoundingBox, HttpFetcher, StreamerConfig, TileStreamer, Viewport};
//!
//! #[tokio::main]
//! async fn main() -> tessera::Result<()> {
//!     let streamer = TileStreamer::builder(Arc::new(HttpFetcher::new()?))
//!         .config(StreamerConfig::new().max_zoom(16).cache_megabytes(64))
//!         .build();
//!
//!     let viewport = Viewport::new(BoundingBox::new(-74.1, 40.6, -73.9, 40.8), 12.0);
//!     let summary = streamer
//!         .stream_tiles(
//!             "https://tiles.example.com/scene.tif",
//!             &viewport,
//!             |data, key| println!("{key}: {} bytes", data.len()),
//!             |loaded, total| println!("{loaded}/{total}"),
//!         )
//!         .await;
//!
//!     println!("{} tiles, {} failed", summary.total, summary.failed);
//!     Ok(())
//! }
//! ```
//!
//! # Progressive Loading Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tessera::{DiskBlobStore, HttpFetcher, PersistentBlobStore, PersistentConfig, ProgressiveLoader};
//!
//! #[tokio::main]
//! async fn main() -> tessera::Result<()> {
//!     let store = PersistentBlobStore::open(
//!         Arc::new(DiskBlobStore::with_default_dir()?),
//!         PersistentConfig::default(),
//!     )
//!     .await;
//!
//!     let loader = ProgressiveLoader::builder(Arc::new(HttpFetcher::new()?))
//!         .persistent(Arc::new(store))
//!         .build();
//!
//!     let result = loader
//!         .load_progressive("https://images.example.com/scene.tif", |level, data| {
//!             println!("level {level}: {} bytes", data.len());
//!         })
//!         .await?;
//!
//!     println!("final: {} bytes from {:?}", result.data.len(), result.source);
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod fetch;
pub mod memory;
pub mod progressive;
pub mod stream;
pub mod telemetry;
pub mod tile;
pub mod worker;

// Re-export main types at crate root
pub use error::{Result, TesseraError};

pub use cache::{
    BlobMeta, BlobStore, ByteBudgetCache, CacheEntry, CacheStats, DiskBlobStore, MemoryBlobStore,
    PersistentBlobStore, PersistentConfig, StoredBlob,
};
pub use config::Config;
pub use events::{EventStream, event_channel};
pub use fetch::{
    ByteRange, FetchRequest, Fetcher, HttpFetcher, QueryTileLocator, RetryConfig, TileLocator,
    with_retry,
};
pub use memory::{
    LayerInfo, LayerMemoryManager, LayerPriority, MemoryLimits, MemoryPressure,
    MemoryPressureEvent, MemoryStats, Subscription,
};
pub use progressive::{
    LoadSource, LoadState, ProgressiveConfig, ProgressiveEvent, ProgressiveLoader,
    ProgressiveLoaderBuilder, ProgressiveResult, ProgressiveStats,
};
pub use stream::{
    StreamEvent, StreamSummary, StreamerConfig, TileState, TileStreamer, TileStreamerBuilder,
    prioritize_tiles,
};
pub use tile::{BoundingBox, TileCoord, Viewport, required_tiles, tile_bounds, tile_key};
pub use worker::{WorkerClient, WorkerHandler, WorkerMessage};
