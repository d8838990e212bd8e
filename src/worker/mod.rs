//! Request/response channel to a background worker.
//!
//! [`WorkerClient`] runs a [`WorkerHandler`] on its own task and talks to it
//! by message passing. Every request gets a correlation ID and an entry in a
//! pending table; a single dispatch loop routes each inbound
//! [`WorkerMessage`] to its request:
//!
//! - `Progress` invokes the request's progress callback, if any,
//! - `Success` and `Error` resolve the request and remove it from the table.
//!
//! If the worker task ends (including by panicking), every pending request
//! fails with [`TesseraError::WorkerCrashed`], as does every later request.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::{Result, TesseraError};

/// Number of requests buffered on the way to the worker.
const REQUEST_BUFFER: usize = 32;

/// Message sent from the worker back to its client.
#[derive(Debug)]
pub enum WorkerMessage<T> {
    Progress { id: u64, progress: f32 },
    Success { id: u64, data: T },
    Error { id: u64, error: String },
}

impl<T> WorkerMessage<T> {
    pub fn id(&self) -> u64 {
        match self {
            WorkerMessage::Progress { id, .. }
            | WorkerMessage::Success { id, .. }
            | WorkerMessage::Error { id, .. } => *id,
        }
    }
}

/// Lets a handler report progress for the request it is serving.
pub struct ProgressReporter<T> {
    id: u64,
    outbound: mpsc::UnboundedSender<WorkerMessage<T>>,
}

impl<T> ProgressReporter<T> {
    /// Report progress in `[0.0, 1.0]`.
    pub fn report(&self, progress: f32) {
        let _ = self.outbound.send(WorkerMessage::Progress {
            id: self.id,
            progress,
        });
    }
}

/// Work performed on the worker task.
#[async_trait]
pub trait WorkerHandler<Req, Resp>: Send + Sync + 'static
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    async fn handle(&self, request: Req, progress: &ProgressReporter<Resp>) -> Result<Resp>;
}

type ProgressFn = Arc<dyn Fn(f32) + Send + Sync>;

struct Pending<Resp> {
    responder: oneshot::Sender<Result<Resp>>,
    on_progress: Option<ProgressFn>,
}

struct Shared<Resp> {
    pending: Mutex<HashMap<u64, Pending<Resp>>>,
    crashed: AtomicBool,
}

impl<Resp> Shared<Resp> {
    fn pending(&self) -> MutexGuard<'_, HashMap<u64, Pending<Resp>>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn dispatch(&self, message: WorkerMessage<Resp>) {
        match message {
            WorkerMessage::Progress { id, progress } => {
                let on_progress = self
                    .pending()
                    .get(&id)
                    .and_then(|pending| pending.on_progress.clone());
                if let Some(on_progress) = on_progress {
                    on_progress(progress);
                }
            }
            WorkerMessage::Success { id, data } => {
                if let Some(pending) = self.pending().remove(&id) {
                    let _ = pending.responder.send(Ok(data));
                }
            }
            WorkerMessage::Error { id, error } => {
                if let Some(pending) = self.pending().remove(&id) {
                    let _ = pending.responder.send(Err(TesseraError::Worker(error)));
                }
            }
        }
    }

    fn fail_all(&self) {
        self.crashed.store(true, Ordering::Release);
        let drained: Vec<_> = self.pending().drain().collect();
        if !drained.is_empty() {
            error!(pending = drained.len(), "worker crashed, failing pending requests");
        }
        for (_, pending) in drained {
            let _ = pending.responder.send(Err(TesseraError::WorkerCrashed));
        }
    }
}

/// Client side of a worker channel.
///
/// Cheap to clone; clones share the worker.
pub struct WorkerClient<Req, Resp> {
    requests: mpsc::Sender<(u64, Req)>,
    shared: Arc<Shared<Resp>>,
    next_id: Arc<AtomicU64>,
}

impl<Req, Resp> Clone for WorkerClient<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            requests: self.requests.clone(),
            shared: Arc::clone(&self.shared),
            next_id: Arc::clone(&self.next_id),
        }
    }
}

impl<Req, Resp> WorkerClient<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    /// Start `handler` on a worker task, plus the dispatch loop.
    ///
    /// Requests are served one at a time, in submission order.
    ///
    /// # Panics
    ///
    /// Requires a tokio runtime context.
    pub fn spawn<H: WorkerHandler<Req, Resp>>(handler: H) -> Self {
        let (request_tx, mut request_rx) = mpsc::channel::<(u64, Req)>(REQUEST_BUFFER);
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<WorkerMessage<Resp>>();
        let shared = Arc::new(Shared {
            pending: Mutex::new(HashMap::new()),
            crashed: AtomicBool::new(false),
        });

        tokio::spawn(async move {
            while let Some((id, request)) = request_rx.recv().await {
                let reporter = ProgressReporter {
                    id,
                    outbound: outbound_tx.clone(),
                };
                let message = match handler.handle(request, &reporter).await {
                    Ok(data) => WorkerMessage::Success { id, data },
                    Err(e) => WorkerMessage::Error {
                        id,
                        error: e.to_string(),
                    },
                };
                if outbound_tx.send(message).is_err() {
                    break;
                }
            }
            debug!("worker task finished");
        });

        let dispatch = Arc::clone(&shared);
        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                dispatch.dispatch(message);
            }
            dispatch.fail_all();
        });

        Self {
            requests: request_tx,
            shared,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Send `request` and wait for its response.
    pub async fn request(&self, request: Req) -> Result<Resp> {
        self.submit(request, None).await
    }

    /// Send `request`, calling `on_progress` for each progress report.
    pub async fn request_with_progress<F>(&self, request: Req, on_progress: F) -> Result<Resp>
    where
        F: Fn(f32) + Send + Sync + 'static,
    {
        self.submit(request, Some(Arc::new(on_progress))).await
    }

    async fn submit(&self, request: Req, on_progress: Option<ProgressFn>) -> Result<Resp> {
        if self.is_crashed() {
            return Err(TesseraError::WorkerCrashed);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.pending().insert(
            id,
            Pending {
                responder: tx,
                on_progress,
            },
        );

        if self.requests.send((id, request)).await.is_err() {
            self.shared.pending().remove(&id);
            return Err(TesseraError::WorkerCrashed);
        }

        rx.await.unwrap_or(Err(TesseraError::WorkerCrashed))
    }

    /// Whether the worker has gone away.
    pub fn is_crashed(&self) -> bool {
        self.shared.crashed.load(Ordering::Acquire)
    }

    /// Number of requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.shared.pending().len()
    }
}
