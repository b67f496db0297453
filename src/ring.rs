//! Bounded per-application message store with live-subscriber fan-out.
//!
//! A [`RingBuffer`] keeps the most recent messages for one application in
//! insertion order, evicting the oldest entry once the capacity is reached.
//! Readers either take a point-in-time snapshot or atomically combine a
//! snapshot with a live subscription, so that the first subscribed message
//! is the one immediately following the snapshot. Both operations hold the
//! buffer lock across the whole combination; there is no window in which a
//! message can slip between snapshot and subscription.
//!
//! Delivery to subscribers is non-blocking. A subscriber whose queue is
//! full is disconnected rather than ever stalling the producer.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

use crate::message::Message;

/// Default per-application capacity.
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Depth of each subscriber queue. A subscriber that falls this far behind
/// is disconnected.
pub const SUBSCRIBER_QUEUE_DEPTH: usize = 1_000;

/// Bounded FIFO of shared messages plus the set of live subscribers.
pub struct RingBuffer {
    inner: Mutex<Inner>,
}

struct Inner {
    capacity: usize,
    entries: VecDeque<Arc<Message>>,
    subscribers: Vec<Subscriber>,
    next_subscriber_id: u64,
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Arc<Message>>,
}

/// Detaches its subscriber when dropped; the subscriber's channel closes.
pub struct Subscription {
    buffer: Arc<RingBuffer>,
    id: u64,
}

impl Subscription {
    pub fn cancel(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.buffer.unsubscribe(self.id);
    }
}

impl RingBuffer {
    pub fn new(capacity: usize) -> RingBuffer {
        RingBuffer {
            inner: Mutex::new(Inner {
                capacity,
                entries: VecDeque::with_capacity(capacity.min(1024)),
                subscribers: Vec::new(),
                next_subscriber_id: 0,
            }),
        }
    }

    /// Appends a message, evicting the oldest entry when full, and fans it
    /// out to every live subscriber. Never blocks; a subscriber with a full
    /// queue is disconnected.
    pub fn add(&self, message: Arc<Message>) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        if inner.entries.len() == inner.capacity {
            inner.entries.pop_front();
        }
        inner.entries.push_back(Arc::clone(&message));

        inner
            .subscribers
            .retain(|subscriber| match subscriber.tx.try_send(Arc::clone(&message)) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    debug!(subscriber = subscriber.id, "subscriber queue full, disconnecting");
                    false
                }
                Err(TrySendError::Closed(_)) => false,
            });
    }

    /// All buffered messages, oldest first.
    pub fn read_all(&self) -> Vec<Arc<Message>> {
        let inner = self.inner.lock().expect("lock poisoned");
        inner.entries.iter().cloned().collect()
    }

    /// The last `n` buffered messages (fewer when fewer are buffered),
    /// oldest first.
    pub fn read_last_n(&self, n: usize) -> Vec<Arc<Message>> {
        let inner = self.inner.lock().expect("lock poisoned");
        let skip = inner.entries.len().saturating_sub(n);
        inner.entries.iter().skip(skip).cloned().collect()
    }

    /// Snapshots the buffer and registers a subscriber in one step. The
    /// first message received on the returned channel is the one added
    /// immediately after the snapshot; no gaps, no duplicates.
    pub fn read_all_and_subscribe(
        self: &Arc<Self>,
    ) -> (Vec<Arc<Message>>, mpsc::Receiver<Arc<Message>>, Subscription) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        let snapshot = inner.entries.iter().cloned().collect();
        let (rx, subscription) = subscribe_locked(self, &mut inner);
        (snapshot, rx, subscription)
    }

    /// As [`read_all_and_subscribe`](Self::read_all_and_subscribe) with the
    /// snapshot trimmed to the last `n` messages.
    pub fn read_last_n_and_subscribe(
        self: &Arc<Self>,
        n: usize,
    ) -> (Vec<Arc<Message>>, mpsc::Receiver<Arc<Message>>, Subscription) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        let skip = inner.entries.len().saturating_sub(n);
        let snapshot = inner.entries.iter().skip(skip).cloned().collect();
        let (rx, subscription) = subscribe_locked(self, &mut inner);
        (snapshot, rx, subscription)
    }

    /// Discards all buffered messages. Subscribers stay attached and keep
    /// receiving subsequent adds.
    pub fn flush(&self) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("lock poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn unsubscribe(&self, id: u64) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.subscribers.retain(|subscriber| subscriber.id != id);
    }
}

impl Clone for RingBuffer {
    /// Structurally independent copy of the buffered messages. Subscribers
    /// are not carried over.
    fn clone(&self) -> RingBuffer {
        let inner = self.inner.lock().expect("lock poisoned");
        RingBuffer {
            inner: Mutex::new(Inner {
                capacity: inner.capacity,
                entries: inner.entries.clone(),
                subscribers: Vec::new(),
                next_subscriber_id: 0,
            }),
        }
    }
}

impl Default for RingBuffer {
    fn default() -> RingBuffer {
        RingBuffer::new(DEFAULT_CAPACITY)
    }
}

fn subscribe_locked(
    buffer: &Arc<RingBuffer>,
    inner: &mut Inner,
) -> (mpsc::Receiver<Arc<Message>>, Subscription) {
    let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_DEPTH);
    let id = inner.next_subscriber_id;
    inner.next_subscriber_id += 1;
    inner.subscribers.push(Subscriber { id, tx });
    (
        rx,
        Subscription {
            buffer: Arc::clone(buffer),
            id,
        },
    )
}
