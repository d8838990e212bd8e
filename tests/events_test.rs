//! Tests for the event channel consumers receive.

use futures_util::StreamExt;
use tokio_test::{assert_pending, assert_ready_eq, task};

use tessera::event_channel;

#[tokio::test]
async fn stream_waits_for_producer() {
    let (tx, mut stream) = event_channel::<u32>(4);

    {
        let mut next = task::spawn(stream.next());
        assert_pending!(next.poll());

        tx.send(5).await.unwrap();
        assert!(next.is_woken());
        assert_ready_eq!(next.poll(), Some(5));
    }

    drop(tx);
    assert_eq!(stream.next().await, None);
}

#[tokio::test]
async fn bounded_buffer_applies_backpressure() {
    let (tx, mut stream) = event_channel::<u32>(1);
    tx.send(1).await.unwrap();

    let mut blocked = task::spawn(tx.send(2));
    assert_pending!(blocked.poll());

    assert_eq!(stream.next().await, Some(1));
    assert!(blocked.is_woken());
    assert!(blocked.poll().is_ready());
    assert_eq!(stream.next().await, Some(2));
}

#[tokio::test]
async fn zero_buffer_is_usable() {
    let (tx, mut stream) = event_channel::<&str>(0);
    tx.send("only").await.unwrap();
    assert_eq!(stream.next().await, Some("only"));
}
