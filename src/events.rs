//! Progress event delivery.
//!
//! Long-running operations report progress through an [`EventSink`]. Two
//! sinks exist: a plain callback, and a bounded `tokio::sync::mpsc` channel
//! exposed to consumers as an [`EventStream`]. The channel applies
//! backpressure: a producer waits when the consumer falls behind, and stops
//! early once the consumer drops the stream.

use std::future::Future;
use std::pin::Pin;

use futures_util::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Default number of events buffered between producer and consumer.
pub const DEFAULT_EVENT_BUFFER: usize = 64;

/// Boxed stream of progress events.
pub type EventStream<T> = Pin<Box<dyn Stream<Item = T> + Send>>;

/// Destination for progress events.
pub(crate) trait EventSink<T>: Send {
    /// Deliver one event. Returns `false` once the consumer has gone away.
    fn emit(&mut self, event: T) -> impl Future<Output = bool> + Send;
}

/// Adapts a synchronous callback into an [`EventSink`].
pub(crate) struct CallbackSink<F>(pub F);

impl<T, F> EventSink<T> for CallbackSink<F>
where
    T: Send,
    F: FnMut(T) + Send,
{
    async fn emit(&mut self, event: T) -> bool {
        (self.0)(event);
        true
    }
}

impl<T: Send> EventSink<T> for mpsc::Sender<T> {
    async fn emit(&mut self, event: T) -> bool {
        self.send(event).await.is_ok()
    }
}

/// Create a bounded event channel.
///
/// A zero buffer is bumped to one, as `mpsc::channel` requires.
pub fn event_channel<T: Send + 'static>(buffer: usize) -> (mpsc::Sender<T>, EventStream<T>) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    (tx, Box::pin(ReceiverStream::new(rx)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn channel_delivers_in_order() {
        let (mut tx, mut stream) = event_channel::<u32>(2);
        tokio::spawn(async move {
            for i in 0..5 {
                assert!(tx.emit(i).await);
            }
        });
        let received: Vec<u32> = stream.by_ref().collect().await;
        assert_eq!(received, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn emit_reports_dropped_consumer() {
        let (mut tx, stream) = event_channel::<u32>(1);
        drop(stream);
        assert!(!tx.emit(1).await);
    }

    #[tokio::test]
    async fn callback_sink_invokes_closure() {
        let mut seen = Vec::new();
        {
            let mut sink = CallbackSink(|e: u32| seen.push(e));
            assert!(sink.emit(3).await);
        }
        assert_eq!(seen, vec![3]);
    }
}
