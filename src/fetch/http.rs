//! reqwest-backed [`Fetcher`].

use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use reqwest::header::{CACHE_CONTROL, RANGE};
use tracing::debug;

use super::{FetchRequest, Fetcher};
use crate::telemetry;
use crate::{Result, TesseraError};

/// Default per-request timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP(S) fetcher with range support.
#[derive(Clone)]
pub struct HttpFetcher {
    http: Client,
    timeout: Duration,
}

impl HttpFetcher {
    /// Create a fetcher with the default 30s timeout.
    pub fn new() -> Result<Self> {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TesseraError::Configuration(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http, timeout })
    }

    /// Wrap an existing client (shared connection pool, custom TLS).
    pub fn with_client(http: Client, timeout: Duration) -> Self {
        Self { http, timeout }
    }

    fn map_send_error(&self, e: reqwest::Error) -> TesseraError {
        if e.is_timeout() {
            TesseraError::Timeout(self.timeout)
        } else if e.is_builder() {
            TesseraError::InvalidUrl(e.to_string())
        } else {
            TesseraError::Http(e.to_string())
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<Bytes> {
        let start = Instant::now();

        let mut builder = self.http.get(&request.url);
        if let Some(range) = request.range {
            builder = builder.header(RANGE, range.header_value());
        }
        if let Some(max_age) = request.max_age {
            builder = builder.header(CACHE_CONTROL, format!("max-age={}", max_age.as_secs()));
        }

        let response = builder.send().await.map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TesseraError::Api {
                status: status.as_u16(),
                message: status
                    .canonical_reason()
                    .unwrap_or("unexpected status")
                    .to_string(),
            });
        }

        let body = response.bytes().await.map_err(|e| self.map_send_error(e))?;

        metrics::histogram!(telemetry::FETCH_DURATION_SECONDS).record(start.elapsed().as_secs_f64());
        debug!(url = %request.url, bytes = body.len(), "fetched");
        Ok(body)
    }
}
