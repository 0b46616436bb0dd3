//! Per-connection transport writer (spec §4.6): a bounded queue of already
//! encoded frames, drained by a background task that merges up to
//! `max_merge` pending frames into one transport write. Grounded on the
//! teacher's `client_connection.rs` write loop (a `MeteredReceiver` drained
//! by a dedicated task that calls into the transport, closing the
//! connection on a slow consumer) but generalized over the frame type,
//! since actual wire framing sits outside this crate.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::queue::{ByteSized, Queue};

#[derive(Debug, thiserror::Error)]
pub enum TransportWriteError {
    #[error("write timed out")]
    Timeout,
    #[error("transport closed: {0}")]
    Closed(String),
}

/// The actual I/O a [`TransportWriter`] drives. Implementations correspond
/// to one physical connection (a WebSocket, a SockJS session, ...).
#[async_trait]
pub trait TransportSink<T>: Send + Sync + 'static {
    async fn write(&self, frames: Vec<T>) -> Result<(), TransportWriteError>;
}

/// Bounded write queue for one connection. [`TransportWriter::enqueue`]
/// rejects frames once `max_queue_bytes` is exceeded and invokes
/// `on_overflow`/`on_write_error`, matching spec §7's "slow consumer ⇒
/// fatal disconnect" rule; the caller (the owning session) is responsible
/// for actually tearing the connection down in response.
pub struct TransportWriter<T: ByteSized + Send + 'static> {
    queue: Queue<T>,
    max_queue_bytes: usize,
    task: JoinHandle<()>,
}

impl<T: ByteSized + Send + 'static> TransportWriter<T> {
    pub fn new<S: TransportSink<T>>(
        sink: Arc<S>,
        max_merge: usize,
        max_queue_bytes: usize,
        write_timeout: Duration,
        on_write_failure: impl Fn(TransportWriteError) + Send + Sync + 'static,
    ) -> Self {
        let queue = Queue::new();
        let loop_queue = queue.clone();
        let task = tokio::spawn(async move {
            loop {
                let first = match loop_queue.wait().await {
                    Ok(item) => item,
                    Err(_) => return, // queue closed, nothing left to drain
                };
                let mut frames = Vec::with_capacity(max_merge.max(1));
                frames.push(first);
                frames.extend(loop_queue.drain_up_to(max_merge.saturating_sub(1)));

                let result = tokio::time::timeout(write_timeout, sink.write(frames)).await;
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        on_write_failure(err);
                        loop_queue.close();
                        return;
                    }
                    Err(_) => {
                        on_write_failure(TransportWriteError::Timeout);
                        loop_queue.close();
                        return;
                    }
                }
            }
        });

        Self {
            queue,
            max_queue_bytes,
            task,
        }
    }

    /// Enqueue `frame`. Returns `false` if the queue is closed or already
    /// over `max_queue_bytes` (a slow-consumer condition the caller must
    /// react to, per spec §7).
    pub fn enqueue(&self, frame: T) -> bool {
        if self.queue.size() >= self.max_queue_bytes {
            return false;
        }
        self.queue.add(frame)
    }

    pub fn queued_bytes(&self) -> usize {
        self.queue.size()
    }

    pub fn close(&self) {
        self.queue.close();
    }
}

impl<T: ByteSized + Send + 'static> Drop for TransportWriter<T> {
    fn drop(&mut self) {
        self.queue.close();
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct RecordingSink {
        writes: Arc<StdMutex<Vec<Vec<Vec<u8>>>>>,
    }

    #[async_trait]
    impl TransportSink<Vec<u8>> for RecordingSink {
        async fn write(&self, frames: Vec<Vec<u8>>) -> Result<(), TransportWriteError> {
            self.writes.lock().unwrap().push(frames);
            Ok(())
        }
    }

    #[tokio::test]
    async fn enqueue_then_flush_delivers_in_order() {
        let writes = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::new(RecordingSink { writes: writes.clone() });
        let writer = TransportWriter::new(sink, 8, 1024, Duration::from_secs(1), |_| {});

        writer.enqueue(vec![1]);
        writer.enqueue(vec![2]);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let writes = writes.lock().unwrap();
        let flattened: Vec<u8> = writes.iter().flatten().flatten().copied().collect();
        assert_eq!(flattened, vec![1, 2]);
    }

    #[tokio::test]
    async fn enqueue_rejects_once_over_byte_budget() {
        let writes = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::new(RecordingSink { writes });
        let writer = TransportWriter::new(sink, 8, 4, Duration::from_secs(1), |_| {});

        assert!(writer.enqueue(vec![0, 0, 0, 0]));
        // budget is exactly full now; caller should treat this false as fatal
        assert!(!writer.enqueue(vec![1]));
    }

    struct FailingSink;

    #[async_trait]
    impl TransportSink<Vec<u8>> for FailingSink {
        async fn write(&self, _frames: Vec<Vec<u8>>) -> Result<(), TransportWriteError> {
            Err(TransportWriteError::Closed("peer reset".into()))
        }
    }

    #[tokio::test]
    async fn write_failure_invokes_callback_and_closes_queue() {
        let called = Arc::new(StdMutex::new(false));
        let called2 = called.clone();
        let writer = TransportWriter::new(
            Arc::new(FailingSink),
            8,
            1024,
            Duration::from_secs(1),
            move |_| *called2.lock().unwrap() = true,
        );

        writer.enqueue(vec![1]);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(*called.lock().unwrap());
        assert!(!writer.enqueue(vec![2]));
    }
}
