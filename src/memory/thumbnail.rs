//! Layer thumbnails, rendered off the caller's task.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::worker::{ProgressReporter, WorkerClient, WorkerHandler};
use crate::{Result, TesseraError};

/// Upper bound on a single thumbnail. 1 MiB.
pub const DEFAULT_THUMBNAIL_MAX_BYTES: usize = 1024 * 1024;

/// Produces a reduced preview of a layer buffer.
///
/// Implementations are CPU-bound and run on the blocking pool.
pub trait ThumbnailRenderer: Send + Sync + 'static {
    /// Render a thumbnail of at most `max_bytes`.
    fn render(&self, data: &Bytes, max_bytes: usize) -> Result<Bytes>;
}

/// Renderer that keeps every n-th byte, targeting a tenth of the input.
///
/// Performs no pixel decoding; suitable for opaque buffers and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct DownsampleRenderer;

impl ThumbnailRenderer for DownsampleRenderer {
    fn render(&self, data: &Bytes, max_bytes: usize) -> Result<Bytes> {
        let target = (data.len() / 10).min(max_bytes);
        if target == 0 {
            return Ok(Bytes::new());
        }
        let stride = data.len().div_ceil(target);
        let thumb: Vec<u8> = data.iter().step_by(stride).take(target).copied().collect();
        Ok(Bytes::from(thumb))
    }
}

/// A thumbnail job for the worker.
#[derive(Debug, Clone)]
pub struct ThumbnailRequest {
    pub layer_id: String,
    pub data: Bytes,
    pub max_bytes: usize,
}

/// Worker-side handler wrapping a [`ThumbnailRenderer`].
pub struct ThumbnailHandler {
    renderer: Arc<dyn ThumbnailRenderer>,
}

impl ThumbnailHandler {
    pub fn new(renderer: Arc<dyn ThumbnailRenderer>) -> Self {
        Self { renderer }
    }
}

#[async_trait]
impl WorkerHandler<ThumbnailRequest, Bytes> for ThumbnailHandler {
    async fn handle(
        &self,
        request: ThumbnailRequest,
        progress: &ProgressReporter<Bytes>,
    ) -> Result<Bytes> {
        progress.report(0.0);
        let renderer = Arc::clone(&self.renderer);
        let thumb = tokio::task::spawn_blocking(move || {
            renderer.render(&request.data, request.max_bytes)
        })
        .await
        .map_err(|e| TesseraError::Worker(format!("thumbnail task failed: {e}")))??;
        progress.report(1.0);
        Ok(thumb)
    }
}

/// Client for a thumbnail worker.
pub type ThumbnailWorker = WorkerClient<ThumbnailRequest, Bytes>;

/// Start a thumbnail worker backed by `renderer`.
///
/// Requires a tokio runtime context.
pub fn spawn_thumbnail_worker(renderer: Arc<dyn ThumbnailRenderer>) -> ThumbnailWorker {
    WorkerClient::spawn(ThumbnailHandler::new(renderer))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downsample_is_a_tenth_capped() {
        let data = Bytes::from(vec![1u8; 1000]);
        assert_eq!(DownsampleRenderer.render(&data, 1024).unwrap().len(), 100);
        assert_eq!(DownsampleRenderer.render(&data, 10).unwrap().len(), 10);
        assert!(DownsampleRenderer.render(&Bytes::from_static(b"tiny"), 1024).unwrap().is_empty());
    }

    #[tokio::test]
    async fn worker_renders_thumbnails() {
        let worker = spawn_thumbnail_worker(Arc::new(DownsampleRenderer));
        let thumb = worker
            .request(ThumbnailRequest {
                layer_id: "a".into(),
                data: Bytes::from((0..=255u8).cycle().take(2000).collect::<Vec<_>>()),
                max_bytes: DEFAULT_THUMBNAIL_MAX_BYTES,
            })
            .await
            .unwrap();
        assert_eq!(thumb.len(), 200);
        assert_eq!(thumb[0], 0);
        assert_eq!(thumb[1], 10);
    }
}
