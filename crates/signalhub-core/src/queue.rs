//! Bounded FIFO of opaque frames (spec §4.1).
//!
//! Grounded on the teacher's `MeteredDeque`/`MeteredReceiver`
//! (`client_connection.rs`): a `VecDeque` guarded by a lock, paired with a
//! byte-size accounting hook, except here the queue owns its own wakeup
//! (`tokio::sync::Notify`) instead of riding on an `mpsc` channel, since
//! spec §4.1 asks for a freestanding `Wait`/`Close` contract reusable
//! outside the one-sender-per-connection shape of a channel.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::QueueError;

/// Anything that can report how many bytes it occupies in a [`Queue`],
/// so the queue can maintain a running byte total without caring what the
/// frame type actually is.
pub trait ByteSized: Send {
    fn byte_len(&self) -> usize;
}

impl ByteSized for bytes::Bytes {
    fn byte_len(&self) -> usize {
        self.len()
    }
}

impl ByteSized for Vec<u8> {
    fn byte_len(&self) -> usize {
        self.len()
    }
}

struct Inner<T> {
    items: Mutex<VecDeque<T>>,
    notify: Notify,
    size_bytes: AtomicUsize,
    closed: AtomicBool,
}

/// A bounded, multi-producer, single-consumer-by-convention FIFO.
///
/// Multiple concurrent producers may call [`Queue::add`] safely; the spec
/// only requires that a *single* `Add` call itself be atomic, which the
/// inner lock guarantees. [`Queue::wait`] is intended for one consumer loop
/// per queue (as with the per-connection transport writer), though nothing
/// prevents more.
#[derive(Clone)]
pub struct Queue<T> {
    inner: Arc<Inner<T>>,
}

impl<T: ByteSized> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ByteSized> Queue<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                items: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                size_bytes: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Enqueue `item`. Returns `false` (item dropped) if the queue is
    /// already closed. Wakes exactly one waiter blocked in [`Queue::wait`].
    pub fn add(&self, item: T) -> bool {
        if self.inner.closed.load(Ordering::Acquire) {
            return false;
        }
        self.inner.size_bytes.fetch_add(item.byte_len(), Ordering::AcqRel);
        self.inner.items.lock().push_back(item);
        self.inner.notify.notify_one();
        true
    }

    /// Non-blocking pop. `Ok(None)` means empty-but-open.
    pub fn remove(&self) -> Result<Option<T>, QueueError> {
        let mut items = self.inner.items.lock();
        match items.pop_front() {
            Some(item) => {
                self.inner.size_bytes.fetch_sub(item.byte_len(), Ordering::AcqRel);
                Ok(Some(item))
            }
            None => {
                if self.inner.closed.load(Ordering::Acquire) {
                    Err(QueueError::Closed)
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Block until an item is available or the queue is closed and drained.
    pub async fn wait(&self) -> Result<T, QueueError> {
        loop {
            // Register interest before checking, so a concurrent `add`/`close`
            // between the check and the await can't be missed.
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.remove()? {
                return Ok(item);
            }
            notified.await;
        }
    }

    /// Drain up to `max` currently-queued items without blocking. Used by
    /// the transport writer to merge several frames into one write.
    pub fn drain_up_to(&self, max: usize) -> Vec<T> {
        let mut items = self.inner.items.lock();
        let n = max.min(items.len());
        let drained: Vec<T> = items.drain(..n).collect();
        let freed: usize = drained.iter().map(ByteSized::byte_len).sum();
        self.inner.size_bytes.fetch_sub(freed, Ordering::AcqRel);
        drained
    }

    pub fn size(&self) -> usize {
        self.inner.size_bytes.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.inner.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Idempotent. Wakes every task currently blocked in [`Queue::wait`].
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            self.inner.notify.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    impl ByteSized for u32 {
        fn byte_len(&self) -> usize {
            4
        }
    }

    #[tokio::test]
    async fn add_then_wait_returns_item_in_fifo_order() {
        let q: Queue<u32> = Queue::new();
        q.add(1);
        q.add(2);
        assert_eq!(q.wait().await.unwrap(), 1);
        assert_eq!(q.wait().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn wait_blocks_until_add() {
        let q: Queue<u32> = Queue::new();
        let q2 = q.clone();
        let handle = tokio::spawn(async move { q2.wait().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());
        q.add(42);
        assert_eq!(handle.await.unwrap().unwrap(), 42);
    }

    #[tokio::test]
    async fn close_wakes_waiters_with_err() {
        let q: Queue<u32> = Queue::new();
        let q2 = q.clone();
        let handle = tokio::spawn(async move { q2.wait().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.close();
        assert!(matches!(handle.await.unwrap(), Err(QueueError::Closed)));
    }

    #[test]
    fn add_after_close_is_rejected() {
        let q: Queue<u32> = Queue::new();
        q.close();
        assert!(!q.add(1));
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn size_tracks_byte_totals() {
        let q: Queue<u32> = Queue::new();
        q.add(1);
        q.add(2);
        assert_eq!(q.size(), 8);
        q.remove().unwrap();
        assert_eq!(q.size(), 4);
    }

    #[test]
    fn drain_up_to_respects_the_cap() {
        let q: Queue<u32> = Queue::new();
        for i in 0..5 {
            q.add(i);
        }
        let drained = q.drain_up_to(3);
        assert_eq!(drained, vec![0, 1, 2]);
        assert_eq!(q.len(), 2);
    }
}
