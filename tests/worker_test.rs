//! Tests for the worker request/response channel.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use tessera::worker::ProgressReporter;
use tessera::{Result, TesseraError, WorkerClient, WorkerHandler, WorkerMessage};

/// Doubles its input, reporting progress in quarters.
struct Doubler;

#[async_trait]
impl WorkerHandler<u32, u32> for Doubler {
    async fn handle(&self, request: u32, progress: &ProgressReporter<u32>) -> Result<u32> {
        for step in 1..=4 {
            progress.report(step as f32 / 4.0);
        }
        if request == 13 {
            return Err(TesseraError::Worker("unlucky input".into()));
        }
        Ok(request * 2)
    }
}

/// Panics on a chosen input, taking the worker task down.
struct Fragile {
    started: Arc<AtomicUsize>,
}

#[async_trait]
impl WorkerHandler<u32, u32> for Fragile {
    async fn handle(&self, request: u32, _progress: &ProgressReporter<u32>) -> Result<u32> {
        self.started.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        if request == 0 {
            panic!("worker blew up");
        }
        Ok(request)
    }
}

#[tokio::test]
async fn requests_resolve_with_their_own_responses() {
    let client = WorkerClient::spawn(Doubler);
    let (a, b, c) = tokio::join!(client.request(1), client.request(2), client.request(3));
    assert_eq!((a.unwrap(), b.unwrap(), c.unwrap()), (2, 4, 6));
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn progress_is_routed_to_the_request() {
    let client = WorkerClient::spawn(Doubler);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let result = {
        let seen = seen.clone();
        client
            .request_with_progress(5, move |p| seen.lock().unwrap().push(p))
            .await
    };
    assert_eq!(result.unwrap(), 10);
    assert_eq!(*seen.lock().unwrap(), vec![0.25, 0.5, 0.75, 1.0]);
}

#[tokio::test]
async fn handler_errors_fail_only_that_request() {
    let client = WorkerClient::spawn(Doubler);
    let err = client.request(13).await.unwrap_err();
    assert!(matches!(err, TesseraError::Worker(msg) if msg.contains("unlucky")));
    assert_eq!(client.request(4).await.unwrap(), 8);
    assert!(!client.is_crashed());
}

#[tokio::test]
async fn crash_fails_every_pending_request() {
    let started = Arc::new(AtomicUsize::new(0));
    let client = WorkerClient::spawn(Fragile {
        started: started.clone(),
    });

    let (crashed, queued) = tokio::join!(client.request(0), client.request(1));
    assert!(matches!(crashed, Err(TesseraError::WorkerCrashed)));
    assert!(matches!(queued, Err(TesseraError::WorkerCrashed)));
    assert_eq!(started.load(Ordering::SeqCst), 1);

    assert!(client.is_crashed());
    assert!(matches!(client.request(2).await, Err(TesseraError::WorkerCrashed)));
    assert_eq!(client.pending_count(), 0);
}

#[test]
fn message_ids() {
    let messages: Vec<WorkerMessage<u32>> = vec![
        WorkerMessage::Progress { id: 1, progress: 0.5 },
        WorkerMessage::Success { id: 2, data: 7 },
        WorkerMessage::Error {
            id: 3,
            error: "boom".into(),
        },
    ];
    let ids: Vec<u64> = messages.iter().map(WorkerMessage::id).collect();
    assert_eq!(ids, vec![1, 2, 3]);
}
