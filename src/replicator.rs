//! Fan-out of the ingest stream to connected followers.
//!
//! Every ingested message is offered to each registered follower sink.
//! Delivery is non-blocking: a sink that is full marks a follower too slow
//! to keep up, and the follower is disconnected (its channel closed) rather
//! than ever delaying the ingest path.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::message::Message;

/// Depth of each follower sink. TCP back-pressure on the snapshot stream is
/// absorbed here; once exceeded, the follower is dropped.
pub const SINK_QUEUE_DEPTH: usize = 1_000;

/// Broadcasts ingested messages to follower sinks.
pub struct Replicator {
    inner: Mutex<Inner>,
}

struct Inner {
    sinks: Vec<Sink>,
    next_sink_id: u64,
    shut_down: bool,
}

struct Sink {
    id: u64,
    tx: mpsc::Sender<Arc<Message>>,
}

impl Replicator {
    pub fn new() -> Replicator {
        Replicator {
            inner: Mutex::new(Inner {
                sinks: Vec::new(),
                next_sink_id: 0,
                shut_down: false,
            }),
        }
    }

    /// Offers a message to every registered sink. Never blocks; a full or
    /// closed sink is removed. The set lock is held only across set
    /// mutation, not across delivery.
    pub fn feed(&self, message: &Arc<Message>) {
        let sinks: Vec<(u64, mpsc::Sender<Arc<Message>>)> = {
            let inner = self.inner.lock().expect("lock poisoned");
            inner
                .sinks
                .iter()
                .map(|sink| (sink.id, sink.tx.clone()))
                .collect()
        };

        let mut dead = Vec::new();
        for (id, tx) in sinks {
            match tx.try_send(Arc::clone(message)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(sink = id, "follower sink full, disconnecting slow follower");
                    dead.push(id);
                }
                Err(TrySendError::Closed(_)) => dead.push(id),
            }
        }
        if !dead.is_empty() {
            let mut inner = self.inner.lock().expect("lock poisoned");
            inner.sinks.retain(|sink| !dead.contains(&sink.id));
        }
    }

    /// Registers a follower sink and returns its receive side. The sink is
    /// deregistered automatically when `close` fires. After shutdown the
    /// returned channel is already closed.
    pub fn register(self: &Arc<Self>, close: CancellationToken) -> mpsc::Receiver<Arc<Message>> {
        let (tx, rx) = mpsc::channel(SINK_QUEUE_DEPTH);
        let id = {
            let mut inner = self.inner.lock().expect("lock poisoned");
            if inner.shut_down {
                return rx;
            }
            let id = inner.next_sink_id;
            inner.next_sink_id += 1;
            inner.sinks.push(Sink { id, tx });
            id
        };
        debug!(sink = id, "follower sink registered");

        let replicator = Arc::clone(self);
        tokio::spawn(async move {
            close.cancelled().await;
            replicator.deregister(id);
        });
        rx
    }

    /// Closes every sink and refuses further registrations.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.shut_down = true;
        inner.sinks.clear();
    }

    fn deregister(&self, id: u64) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.sinks.retain(|sink| sink.id != id);
    }
}

impl Default for Replicator {
    fn default() -> Replicator {
        Replicator::new()
    }
}
