//! Retry configuration, delay calculation and the shared retry loop.
//!
//! Every network fetch in the crate goes through [`with_retry()`], which
//! bounds each attempt with a timeout, retries transient errors with
//! exponential backoff and stops promptly when its cancellation token fires.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::telemetry;
use crate::{Result, TesseraError};

/// Configuration for retry behaviour on transient errors.
///
/// ```rust
/// # use tessera::RetryConfig;
/// # use std::time::Duration;
/// let config = RetryConfig::new()
///     .max_attempts(5)
///     .initial_delay(Duration::from_millis(200))
///     .timeout(Duration::from_secs(10));
/// ```
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the initial request).
    /// 1 = no retry. Default: 3.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on each further retry. Default: 1s.
    pub initial_delay: Duration,
    /// Maximum delay between retries (caps exponential growth). Default: 30s.
    pub max_delay: Duration,
    /// Bound on each individual attempt. Default: 30s.
    pub timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            timeout: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a config that disables retries (single attempt).
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Set maximum attempts (including the initial request).
    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n;
        self
    }

    /// Set the base delay before the first retry.
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the maximum delay between retries.
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the per-attempt timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Calculate the delay for a given attempt number (0-indexed).
    ///
    /// Uses exponential backoff: `initial_delay * 2^attempt`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self
            .initial_delay
            .saturating_mul(2u32.saturating_pow(attempt));
        delay.min(self.max_delay)
    }
}

// ============================================================================
// Shared retry helper
// ============================================================================

/// Execute an async operation with timeout, retry and cancellation.
///
/// `f` receives the 0-indexed attempt number. Each attempt is bounded by
/// `config.timeout`; an elapsed timeout becomes [`TesseraError::Timeout`],
/// which is transient. Transient errors are retried up to
/// `config.max_attempts` with exponential backoff. Permanent errors are
/// returned immediately.
///
/// Cancellation is checked before every attempt, while an attempt is in
/// flight (the attempt's future is dropped) and during backoff. A cancelled
/// call returns [`TesseraError::Cancelled`].
pub async fn with_retry<F, Fut, T>(
    config: &RetryConfig,
    operation: &'static str,
    cancel: &CancellationToken,
    mut f: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut last_err = None;

    for attempt in 0..max_attempts {
        if cancel.is_cancelled() {
            return Err(TesseraError::Cancelled);
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TesseraError::Cancelled),
            result = tokio::time::timeout(config.timeout, f(attempt)) => {
                result.unwrap_or(Err(TesseraError::Timeout(config.timeout)))
            }
        };

        match result {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() => {
                if attempt + 1 < max_attempts {
                    metrics::counter!(telemetry::RETRIES_TOTAL, "operation" => operation)
                        .increment(1);
                    let delay = config.delay_for_attempt(attempt);
                    warn!(
                        operation,
                        attempt = attempt + 1,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying after transient error"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(TesseraError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                last_err = Some(e);
            }
            Err(e) => return Err(e), // permanent error, no retry
        }
    }

    Err(last_err.unwrap_or(TesseraError::Cancelled))
}
