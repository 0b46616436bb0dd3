//! Per-channel coalescing writer (spec §4.3).
//!
//! One [`PerChannelWriter`] lives per connection (the same granularity as
//! the transport writer in `writer.rs`), and multiplexes many channels'
//! pending batches behind a single background task, per the timer-economy
//! note in spec §9: a `BinaryHeap` of `(deadline, channel)` plus one
//! `sleep_until` loop, instead of one timer per channel. Grounded on the
//! teacher's general shape of wrapping a shared mutable buffer in an
//! `Arc<Mutex<..>>` behind a cheaply-cloneable handle (`MeteredDeque`,
//! `ClientConnectionSender`).

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use signalhub_messages::{Channel, Publication};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::config::ChannelBatchConfig;

/// Where a [`PerChannelWriter`] delivers a completed batch.
///
/// Implementations must not block significantly; the writer calls this while
/// holding no internal lock, but a slow sink still delays that one
/// connection's batches.
pub trait BatchSink: Send + Sync + 'static {
    fn flush(&self, channel: Channel, items: Vec<Publication>);
}

impl<F: Fn(Channel, Vec<Publication>) + Send + Sync + 'static> BatchSink for F {
    fn flush(&self, channel: Channel, items: Vec<Publication>) {
        self(channel, items)
    }
}

struct ChannelBuffer {
    items: Vec<Publication>,
    /// Set once a deadline for this channel is live in the heap, so `add`
    /// doesn't arm a second, redundant timer entry.
    timer_armed: bool,
}

struct State {
    buffers: HashMap<Channel, ChannelBuffer>,
    heap: BinaryHeap<Reverse<(Instant, Channel)>>,
    closed: bool,
}

struct Inner {
    state: Mutex<State>,
    wake: Notify,
    sink: Arc<dyn BatchSink>,
}

/// Handle to a per-connection batching writer. Cheap to clone; all clones
/// share the same buffers and background scheduling task.
#[derive(Clone)]
pub struct PerChannelWriter {
    inner: Arc<Inner>,
}

impl PerChannelWriter {
    pub fn new(sink: impl BatchSink) -> Self {
        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                buffers: HashMap::new(),
                heap: BinaryHeap::new(),
                closed: false,
            }),
            wake: Notify::new(),
            sink: Arc::new(sink),
        });
        let this = Self { inner };
        this.spawn_scheduler();
        this
    }

    /// Add `item` to `channel`'s pending batch under `cfg`, scheduling or
    /// triggering a flush per spec §4.3's algorithm.
    pub fn add(&self, item: Publication, channel: Channel, cfg: ChannelBatchConfig) {
        let mut immediate_flush = None;
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            let buf = state
                .buffers
                .entry(channel.clone())
                .or_insert_with(|| ChannelBuffer {
                    items: Vec::new(),
                    timer_armed: false,
                });

            if cfg.flush_latest {
                buf.items.clear();
                buf.items.push(item);
            } else {
                buf.items.push(item);
            }

            let should_flush_now = cfg.max_size > 0 && buf.items.len() >= cfg.max_size;
            if should_flush_now {
                immediate_flush = Some(state.buffers.remove(&channel).unwrap().items);
            } else if !buf.timer_armed {
                buf.timer_armed = true;
                let deadline = Instant::now() + cfg.max_delay;
                state.heap.push(Reverse((deadline, channel.clone())));
            }
        }

        if let Some(items) = immediate_flush {
            if !items.is_empty() {
                self.inner.sink.flush(channel, items);
            }
        } else {
            // A new, possibly-earlier deadline may have been pushed; nudge
            // the scheduler so it can re-evaluate instead of oversleeping.
            self.inner.wake.notify_one();
        }
    }

    /// Force an immediate flush of `channel`'s buffer, if any, bypassing its
    /// scheduled deadline.
    pub fn flush(&self, channel: &Channel) {
        let items = {
            let mut state = self.inner.state.lock();
            state.buffers.remove(channel).map(|b| b.items)
        };
        if let Some(items) = items {
            if !items.is_empty() {
                self.inner.sink.flush(channel.clone(), items);
            }
        }
    }

    /// Stop scheduling new flushes. If `drain` is true, flush every
    /// remaining buffer first, in channel-insertion order.
    pub fn close(&self, drain: bool) {
        let buffers = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            std::mem::take(&mut state.buffers)
        };
        self.inner.wake.notify_one();
        if drain {
            for (channel, buf) in buffers {
                if !buf.items.is_empty() {
                    self.inner.sink.flush(channel, buf.items);
                }
            }
        }
    }

    fn spawn_scheduler(&self) -> JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            loop {
                let next_deadline = {
                    let state = inner.state.lock();
                    if state.closed {
                        return;
                    }
                    state.heap.peek().map(|Reverse((deadline, _))| *deadline)
                };

                match next_deadline {
                    Some(deadline) => {
                        tokio::select! {
                            _ = tokio::time::sleep_until(deadline.into()) => {}
                            _ = inner.wake.notified() => {}
                        }
                    }
                    None => inner.wake.notified().await,
                }

                let now = Instant::now();
                let mut ready = Vec::new();
                {
                    let mut state = inner.state.lock();
                    if state.closed {
                        return;
                    }
                    while let Some(Reverse((deadline, channel))) = state.heap.peek().cloned() {
                        if deadline > now {
                            break;
                        }
                        state.heap.pop();
                        if let Some(buf) = state.buffers.remove(&channel) {
                            if !buf.items.is_empty() {
                                ready.push((channel, buf.items));
                            }
                        }
                    }
                }
                for (channel, items) in ready {
                    inner.sink.flush(channel, items);
                }
            }
        })
    }
}
