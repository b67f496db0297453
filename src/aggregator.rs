//! Routes ingested messages into per-application ring buffers and serves
//! the query and snapshot paths.
//!
//! # Architecture
//!
//! ```text
//!    feed() callers                queries
//!        │                           │
//!        v                           v
//!   ┌──────────┐  inbound   ┌──────────────────┐
//!   │  channel │ ─────────> │    run loop      │
//!   └──────────┘            │  (single task)   │
//!        ^                  └────────┬─────────┘
//!        │ pause rendezvous          │ add()
//!   pause() callers                  v
//!                           ┌──────────────────┐
//!                           │ buffers: app →   │
//!                           │   RingBuffer     │
//!                           └──────────────────┘
//! ```
//!
//! A single task drains the inbound queue and is the only writer to the
//! buffers, so pausing that task quiesces all ingest. The pause rendezvous
//! is a two-step handshake: the run loop acknowledges the request (it is
//! then provably not mid-iteration) and parks until the guard resumes it.
//! While paused, `feed` still enqueues up to the inbound queue capacity.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::filter::{self, Filter};
use crate::message::Message;
use crate::ring::RingBuffer;

/// Depth of the inbound queue. `feed` blocks once this many messages are
/// waiting for the run loop.
pub const INBOUND_QUEUE_DEPTH: usize = 1_000;

/// Depth of the channels returned by the read operations.
const READ_STREAM_DEPTH: usize = 64;

/// The message ingestion and query engine.
pub struct Aggregator {
    buffers: Mutex<HashMap<String, Arc<RingBuffer>>>,
    buffer_capacity: usize,
    inbound_tx: mpsc::Sender<Arc<Message>>,
    pause_tx: mpsc::Sender<PauseRequest>,
    pause_serial: Arc<AsyncMutex<()>>,
    shutdown: CancellationToken,
}

struct PauseRequest {
    ack: oneshot::Sender<()>,
    resume: oneshot::Receiver<()>,
}

/// Keeps the run loop parked. Ingest resumes when the guard is consumed by
/// [`resume`](PauseGuard::resume) or dropped.
pub struct PauseGuard {
    resume: Option<oneshot::Sender<()>>,
    _serial: OwnedMutexGuard<()>,
}

impl PauseGuard {
    pub fn resume(self) {}
}

impl Drop for PauseGuard {
    fn drop(&mut self) {
        if let Some(resume) = self.resume.take() {
            let _ = resume.send(());
        }
    }
}

impl Aggregator {
    /// Creates the aggregator and spawns its run loop.
    pub fn new(buffer_capacity: usize) -> Arc<Aggregator> {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
        let (pause_tx, pause_rx) = mpsc::channel(1);
        let aggregator = Arc::new(Aggregator {
            buffers: Mutex::new(HashMap::new()),
            buffer_capacity,
            inbound_tx,
            pause_tx,
            pause_serial: Arc::new(AsyncMutex::new(())),
            shutdown: CancellationToken::new(),
        });
        tokio::spawn(run(Arc::clone(&aggregator), inbound_rx, pause_rx));
        aggregator
    }

    /// Enqueues a message for routing. Blocks only while the inbound queue
    /// is full; after shutdown the message is discarded.
    pub async fn feed(&self, message: Arc<Message>) {
        tokio::select! {
            result = self.inbound_tx.send(message) => {
                let _ = result;
            }
            () = self.shutdown.cancelled() => {}
        }
    }

    /// Streams the last `n` buffered messages for `id` after applying
    /// `filters`, oldest first. A negative `n` means all. With filters
    /// present, the whole buffer is filtered before trimming to `n`.
    /// The stream closes when the history is drained or `done` fires.
    pub fn read_last_n(
        &self,
        id: &str,
        n: i64,
        filters: Vec<Filter>,
        done: CancellationToken,
    ) -> mpsc::Receiver<Arc<Message>> {
        let messages = if filters.is_empty() {
            self.buffered_last_n(id, n)
        } else {
            let matched = filter::apply(self.buffered_last_n(id, -1), &filters);
            trim_to_last_n(matched, n)
        };

        let (tx, rx) = mpsc::channel(READ_STREAM_DEPTH);
        tokio::spawn(async move {
            for message in messages {
                tokio::select! {
                    () = done.cancelled() => return,
                    result = tx.send(message) => {
                        if result.is_err() {
                            return;
                        }
                    }
                }
            }
        });
        rx
    }

    /// As [`read_last_n`](Self::read_last_n), then keeps streaming live
    /// messages as they arrive, until `done` fires or the subscription is
    /// disconnected. The buffer is created when absent. The subscription is
    /// installed before this returns, so every message fed afterwards is
    /// observed. With `n = 0` no history is delivered, live only.
    pub fn read_last_n_and_subscribe(
        &self,
        id: &str,
        n: i64,
        filters: Vec<Filter>,
        done: CancellationToken,
    ) -> mpsc::Receiver<Arc<Message>> {
        let buffer = self.get_or_init_buffer(id);

        // the whole history is needed whenever filters may thin it below n
        let want_all = (!filters.is_empty() && n != 0) || n < 0;
        let (mut history, live, subscription) = if want_all {
            buffer.read_all_and_subscribe()
        } else {
            buffer.read_last_n_and_subscribe(usize::try_from(n).unwrap_or(0))
        };
        if !filters.is_empty() {
            history = trim_to_last_n(filter::apply(history, &filters), n);
        }

        let (tx, rx) = mpsc::channel(READ_STREAM_DEPTH);
        tokio::spawn(stream_history_then_live(
            history,
            live,
            subscription,
            filters,
            tx,
            done,
        ));
        rx
    }

    /// Quiesces the run loop. Returns once the loop has acknowledged the
    /// rendezvous and is provably parked; it stays parked until the guard
    /// resumes it. Only one pause can be outstanding at a time.
    pub async fn pause(&self) -> PauseGuard {
        let serial = Arc::clone(&self.pause_serial).lock_owned().await;
        let (ack_tx, ack_rx) = oneshot::channel();
        let (resume_tx, resume_rx) = oneshot::channel();
        let request = PauseRequest {
            ack: ack_tx,
            resume: resume_rx,
        };

        let sent = self.pause_tx.send(request).await.is_ok();
        if !sent || ack_rx.await.is_err() {
            // run loop already stopped; nothing to hold
            return PauseGuard {
                resume: None,
                _serial: serial,
            };
        }
        PauseGuard {
            resume: Some(resume_tx),
            _serial: serial,
        }
    }

    /// Empties every buffer. Buffers and their subscribers stay alive.
    pub fn flush(&self) {
        let buffers = self.buffers.lock().expect("lock poisoned");
        for buffer in buffers.values() {
            buffer.flush();
        }
    }

    /// A point-in-time copy of every buffer's contents, independent of all
    /// later mutation. Acquires the map lock, then each buffer's lock via
    /// its clone; never the reverse order.
    pub fn copy_buffers(&self) -> Vec<Vec<Arc<Message>>> {
        let buffers = self.buffers.lock().expect("lock poisoned");
        buffers
            .values()
            .map(|buffer| buffer.as_ref().clone().read_all())
            .collect()
    }

    /// Stops the run loop after it drains whatever is already queued.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn route(&self, message: Arc<Message>) {
        self.get_or_init_buffer(message.app_name()).add(message);
    }

    fn buffer(&self, id: &str) -> Option<Arc<RingBuffer>> {
        let buffers = self.buffers.lock().expect("lock poisoned");
        buffers.get(id).cloned()
    }

    fn get_or_init_buffer(&self, id: &str) -> Arc<RingBuffer> {
        let mut buffers = self.buffers.lock().expect("lock poisoned");
        Arc::clone(
            buffers
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(RingBuffer::new(self.buffer_capacity))),
        )
    }

    fn buffered_last_n(&self, id: &str, n: i64) -> Vec<Arc<Message>> {
        let Some(buffer) = self.buffer(id) else {
            return Vec::new();
        };
        match usize::try_from(n) {
            Ok(n) => buffer.read_last_n(n),
            Err(_) => buffer.read_all(),
        }
    }
}

/// Keeps the last `n` messages; `n <= 0` keeps everything.
fn trim_to_last_n(mut messages: Vec<Arc<Message>>, n: i64) -> Vec<Arc<Message>> {
    let Ok(keep) = usize::try_from(n) else {
        return messages;
    };
    if keep > 0 && messages.len() > keep {
        messages.split_off(messages.len() - keep)
    } else {
        messages
    }
}

async fn run(
    aggregator: Arc<Aggregator>,
    mut inbound_rx: mpsc::Receiver<Arc<Message>>,
    mut pause_rx: mpsc::Receiver<PauseRequest>,
) {
    debug!("aggregator run loop started");
    loop {
        tokio::select! {
            Some(request) = pause_rx.recv() => {
                // announce quiescence, then park until resumed
                let _ = request.ack.send(());
                let _ = request.resume.await;
            }
            message = inbound_rx.recv() => match message {
                Some(message) => aggregator.route(message),
                None => break,
            },
            () = aggregator.shutdown.cancelled() => {
                while let Ok(message) = inbound_rx.try_recv() {
                    aggregator.route(message);
                }
                break;
            }
        }
    }
    debug!("aggregator run loop stopped");
}

async fn stream_history_then_live(
    history: Vec<Arc<Message>>,
    mut live: mpsc::Receiver<Arc<Message>>,
    _subscription: crate::ring::Subscription,
    filters: Vec<Filter>,
    tx: mpsc::Sender<Arc<Message>>,
    done: CancellationToken,
) {
    for message in history {
        tokio::select! {
            () = done.cancelled() => return,
            result = tx.send(message) => {
                if result.is_err() {
                    return;
                }
            }
        }
    }

    loop {
        tokio::select! {
            () = done.cancelled() => return,
            next = live.recv() => {
                let Some(message) = next else {
                    // disconnected by the buffer; the output closes too
                    return;
                };
                if !filter::all_match(&message, &filters) {
                    continue;
                }
                tokio::select! {
                    () = done.cancelled() => return,
                    result = tx.send(message) => {
                        if result.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn msg(app: &str, body: &str) -> Arc<Message> {
        Arc::new(Message::new(app, body))
    }

    fn proc_msg(app: &str, proc_id: &str, body: &str) -> Arc<Message> {
        Arc::new(Message::with_proc_id(app, proc_id, body))
    }

    async fn collect(mut rx: mpsc::Receiver<Arc<Message>>) -> Vec<Arc<Message>> {
        let mut messages = Vec::new();
        while let Some(message) = rx.recv().await {
            messages.push(message);
        }
        messages
    }

    async fn wait_for_buffered(aggregator: &Arc<Aggregator>, app: &str, count: usize) {
        timeout(Duration::from_secs(5), async {
            loop {
                let buffered =
                    collect(aggregator.read_last_n(app, -1, Vec::new(), CancellationToken::new()))
                        .await;
                if buffered.len() >= count {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("messages were not routed in time");
    }

    #[tokio::test]
    async fn test_read_last_n_basic() {
        let aggregator = Aggregator::new(100);
        for body in ["m1", "m2", "m3", "m4", "m5"] {
            aggregator.feed(msg("web", body)).await;
        }
        wait_for_buffered(&aggregator, "web", 5).await;

        let last3 =
            collect(aggregator.read_last_n("web", 3, Vec::new(), CancellationToken::new())).await;
        assert_eq!(last3.len(), 3);
        assert!(last3[0].as_bytes().ends_with(b"m3"));
        assert!(last3[2].as_bytes().ends_with(b"m5"));

        let all =
            collect(aggregator.read_last_n("web", -1, Vec::new(), CancellationToken::new())).await;
        assert_eq!(all.len(), 5);

        let other =
            collect(aggregator.read_last_n("other", 10, Vec::new(), CancellationToken::new()))
                .await;
        assert!(other.is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_before_any_message() {
        let aggregator = Aggregator::new(100);
        let mut rx = aggregator.read_last_n_and_subscribe(
            "web",
            2,
            Vec::new(),
            CancellationToken::new(),
        );

        for body in ["m1", "m2", "m3"] {
            aggregator.feed(msg("web", body)).await;
        }

        for expected in ["m1", "m2", "m3"] {
            let message = timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert!(message.as_bytes().ends_with(expected.as_bytes()));
        }
    }

    #[tokio::test]
    async fn test_subscribe_delivers_history_then_live() {
        let aggregator = Aggregator::new(100);
        for body in ["m1", "m2", "m3", "m4", "m5"] {
            aggregator.feed(msg("web", body)).await;
        }
        wait_for_buffered(&aggregator, "web", 5).await;

        let mut rx = aggregator.read_last_n_and_subscribe(
            "web",
            2,
            Vec::new(),
            CancellationToken::new(),
        );
        for expected in ["m4", "m5"] {
            let message = timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert!(message.as_bytes().ends_with(expected.as_bytes()));
        }

        aggregator.feed(msg("web", "m6")).await;
        aggregator.feed(msg("web", "m7")).await;
        for expected in ["m6", "m7"] {
            let message = timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert!(message.as_bytes().ends_with(expected.as_bytes()));
        }
    }

    #[tokio::test]
    async fn test_pause_quiesces_ingest() {
        let aggregator = Aggregator::new(100);
        aggregator.feed(msg("web", "m1")).await;
        aggregator.feed(msg("web", "m2")).await;
        wait_for_buffered(&aggregator, "web", 2).await;

        let guard = aggregator.pause().await;

        // fed while paused: queued on the inbound channel, not routed
        aggregator.feed(msg("web", "m3")).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let buffers = aggregator.copy_buffers();
        assert_eq!(buffers.len(), 1);
        assert_eq!(buffers[0].len(), 2);

        guard.resume();
        wait_for_buffered(&aggregator, "web", 3).await;
    }

    #[tokio::test]
    async fn test_pause_is_serialized() {
        let aggregator = Aggregator::new(100);

        let guard = aggregator.pause().await;
        let second = {
            let aggregator = Arc::clone(&aggregator);
            tokio::spawn(async move { aggregator.pause().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished());

        guard.resume();
        let second_guard = timeout(Duration::from_secs(2), second)
            .await
            .unwrap()
            .unwrap();
        second_guard.resume();
    }

    #[tokio::test]
    async fn test_filters_are_applied_before_trimming() {
        let aggregator = Aggregator::new(100);
        aggregator.feed(proc_msg("web", "web.1", "m1")).await;
        aggregator.feed(proc_msg("web", "web.2", "m2")).await;
        aggregator.feed(proc_msg("web", "web.1", "m3")).await;
        aggregator.feed(proc_msg("web", "web.2", "m4")).await;
        aggregator.feed(proc_msg("web", "web.1", "m5")).await;
        wait_for_buffered(&aggregator, "web", 5).await;

        let filters = vec![Filter::ProcId("web.1".to_string())];
        let matched = collect(aggregator.read_last_n(
            "web",
            2,
            filters,
            CancellationToken::new(),
        ))
        .await;

        assert_eq!(matched.len(), 2);
        assert!(matched[0].as_bytes().ends_with(b"m3"));
        assert!(matched[1].as_bytes().ends_with(b"m5"));
    }

    #[tokio::test]
    async fn test_subscribe_with_zero_lines_is_live_only() {
        let aggregator = Aggregator::new(100);
        aggregator.feed(proc_msg("web", "web.1", "old")).await;
        wait_for_buffered(&aggregator, "web", 1).await;

        let filters = vec![Filter::ProcId("web.1".to_string())];
        let mut rx = aggregator.read_last_n_and_subscribe(
            "web",
            0,
            filters,
            CancellationToken::new(),
        );

        aggregator.feed(proc_msg("web", "web.2", "skipped")).await;
        aggregator.feed(proc_msg("web", "web.1", "live")).await;

        let message = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(message.as_bytes().ends_with(b"live"));
    }

    #[tokio::test]
    async fn test_done_closes_read_stream() {
        let aggregator = Aggregator::new(100);
        let done = CancellationToken::new();
        let mut rx =
            aggregator.read_last_n_and_subscribe("web", -1, Vec::new(), done.clone());

        done.cancel();

        let next = timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn test_flush_empties_every_buffer() {
        let aggregator = Aggregator::new(100);
        aggregator.feed(msg("web", "m1")).await;
        aggregator.feed(msg("worker", "m2")).await;
        wait_for_buffered(&aggregator, "web", 1).await;
        wait_for_buffered(&aggregator, "worker", 1).await;

        aggregator.flush();

        for buffer in aggregator.copy_buffers() {
            assert!(buffer.is_empty());
        }
    }

    #[tokio::test]
    async fn test_copy_buffers_is_independent() {
        let aggregator = Aggregator::new(100);
        aggregator.feed(msg("web", "m1")).await;
        wait_for_buffered(&aggregator, "web", 1).await;

        let copied = aggregator.copy_buffers();
        aggregator.feed(msg("web", "m2")).await;
        wait_for_buffered(&aggregator, "web", 2).await;

        assert_eq!(copied.len(), 1);
        assert_eq!(copied[0].len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_drains_queued_messages() {
        let aggregator = Aggregator::new(100);
        aggregator.feed(msg("web", "m1")).await;
        aggregator.feed(msg("web", "m2")).await;

        aggregator.shutdown();
        wait_for_buffered(&aggregator, "web", 2).await;
    }
}
