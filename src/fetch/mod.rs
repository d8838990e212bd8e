//! Network collaborators.
//!
//! The streamer and the progressive loader never talk to HTTP directly; they
//! go through a [`Fetcher`], which makes them testable with in-memory mocks.
//! [`HttpFetcher`] is the reqwest-backed implementation.
//!
//! Where a tile lives (its URL and byte range inside the remote file) is the
//! storage format's business, so it is delegated to a [`TileLocator`].

mod http;
pub mod retry;

pub use http::HttpFetcher;
pub use retry::{RetryConfig, with_retry};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::Result;
use crate::tile::TileCoord;

/// Inclusive byte range, sent as `Range: bytes=start-end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Number of bytes covered.
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start) + 1
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }

    /// Value for the HTTP `Range` header.
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// A single network read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    pub range: Option<ByteRange>,
    /// Ask intermediaries to cache the response for this long.
    pub max_age: Option<Duration>,
}

impl FetchRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            range: None,
            max_age: None,
        }
    }

    pub fn range(mut self, range: Option<ByteRange>) -> Self {
        self.range = range;
        self
    }

    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }
}

/// Retrieves bytes from the network.
///
/// Implementations map transport failures to [`TesseraError::Http`](crate::TesseraError::Http)
/// and non-success statuses to [`TesseraError::Api`](crate::TesseraError::Api) so that
/// [`with_retry()`] can tell transient failures from permanent ones.
/// Dropping the returned future must abort the request.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> Result<Bytes>;
}

#[async_trait]
impl<F: Fetcher + ?Sized> Fetcher for Arc<F> {
    async fn fetch(&self, request: &FetchRequest) -> Result<Bytes> {
        (**self).fetch(request).await
    }
}

/// Maps a tile to its URL and byte range in the remote resource.
pub trait TileLocator: Send + Sync {
    fn tile_url(&self, base_url: &str, tile: &TileCoord) -> String;

    /// Byte range of `tile` inside the remote resource, if ranged reads apply.
    fn byte_range(&self, tile: &TileCoord) -> Option<ByteRange>;
}

type RangeFn = dyn Fn(&TileCoord) -> Option<ByteRange> + Send + Sync;

/// Locator that addresses tiles as `{base}?tile={z}/{x}/{y}`.
///
/// No range header is sent unless a range function is supplied.
#[derive(Clone, Default)]
pub struct QueryTileLocator {
    range_fn: Option<Arc<RangeFn>>,
}

impl QueryTileLocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `f` to compute each tile's byte range.
    pub fn with_range_fn(
        f: impl Fn(&TileCoord) -> Option<ByteRange> + Send + Sync + 'static,
    ) -> Self {
        Self {
            range_fn: Some(Arc::new(f)),
        }
    }
}

impl fmt::Debug for QueryTileLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryTileLocator")
            .field("range_fn", &self.range_fn.is_some())
            .finish()
    }
}

impl TileLocator for QueryTileLocator {
    fn tile_url(&self, base_url: &str, tile: &TileCoord) -> String {
        let sep = if base_url.contains('?') { '&' } else { '?' };
        format!("{base_url}{sep}tile={tile}")
    }

    fn byte_range(&self, tile: &TileCoord) -> Option<ByteRange> {
        self.range_fn.as_ref().and_then(|f| f(tile))
    }
}
