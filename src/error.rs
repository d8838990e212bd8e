//! Tessera error types

use std::time::Duration;

/// Tessera error types
#[derive(Debug, thiserror::Error)]
pub enum TesseraError {
    // Cache errors
    /// A single item is larger than the whole cache budget.
    #[error("item of {size} bytes exceeds cache capacity of {max} bytes")]
    CacheCapacityExceeded { size: usize, max: usize },

    #[error("persistent store unavailable: {0}")]
    PersistentStoreUnavailable(String),

    // Network errors
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("operation cancelled")]
    Cancelled,

    #[error("failed to fetch tile {key}: {reason}")]
    TileFetchFailed { key: String, reason: String },

    // Progressive loading errors
    #[error("progressive level {level} failed: {reason}")]
    ProgressiveLevelFailed { level: u32, reason: String },

    /// Every configured quality level failed.
    #[error("failed to load any progressive level for {url} ({} failures)", failures.len())]
    ProgressiveLoadFailed {
        url: String,
        failures: Vec<TesseraError>,
    },

    // Layer memory errors
    /// The layer cannot be admitted even after evicting every evictable layer.
    #[error("insufficient memory for layer '{id}': need {required} bytes, {available} available")]
    InsufficientMemory {
        id: String,
        required: usize,
        available: usize,
    },

    // Data errors
    #[error("invalid tile key: {0}")]
    InvalidTileKey(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Configuration errors
    #[error("configuration error: {0}")]
    Configuration(String),

    // Worker errors
    #[error("worker crashed")]
    WorkerCrashed,

    #[error("worker error: {0}")]
    Worker(String),
}

impl TesseraError {
    /// Whether this error is worth retrying.
    ///
    /// Transport failures, timeouts and server-side statuses (408, 429, 5xx)
    /// are transient. Everything else (4xx, bad input, cancellation) is not.
    pub fn is_transient(&self) -> bool {
        match self {
            TesseraError::Http(_) | TesseraError::Timeout(_) => true,
            TesseraError::Api { status, .. } => {
                matches!(status, 408 | 429) || (500..600).contains(status)
            }
            _ => false,
        }
    }
}

/// Result type alias for Tessera operations
pub type Result<T> = std::result::Result<T, TesseraError>;
