//! Caching subsystem.
//!
//! Two tiers sit in front of the network:
//!
//! - [`ByteBudgetCache`] — in-memory LRU bounded by total bytes rather than
//!   entry count. Used by the tile streamer and the progressive loader.
//!
//! - [`PersistentBlobStore`] — durable tier with TTL expiry and its own byte
//!   budget, layered over a pluggable [`BlobStore`] backend. [`DiskBlobStore`]
//!   stores entries as files; [`MemoryBlobStore`] keeps them in process.
//!
//! The tiers are independent: a hit in the persistent tier is promoted into
//! memory by the caller, not by the caches themselves.

pub mod disk;
pub mod memory;
pub mod persistent;

pub use disk::DiskBlobStore;
pub use memory::{ByteBudgetCache, CacheEntry, CacheStats};
pub use persistent::{
    BlobMeta, BlobStore, MemoryBlobStore, PersistentBlobStore, PersistentConfig, StoredBlob,
};
