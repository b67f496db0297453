//! The replication handshake, both sides of it.
//!
//! Leader side ([`serve_follower`]): on an accepted replication connection,
//! ingest is paused, a point-in-time copy of every buffer is taken, a
//! follower sink is registered, and only then does ingest resume. The
//! snapshot is therefore a true prefix and the sink carries everything
//! after it: the follower decodes a gap-free, duplicate-free stream.
//!
//! Follower side ([`follow`]): dial the leader, discard local history, and
//! feed every decoded frame into the aggregator until unfollowed or the
//! stream ends.

use std::io;
use std::sync::Arc;

use tokio::io::AsyncWrite;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aggregator::Aggregator;
use crate::message::Message;
use crate::replicator::Replicator;
use crate::snapshot::{self, SnapshotScanner};

/// Serves one follower connection to completion.
///
/// The pause spans both the buffer copy and the sink registration; no
/// message can be fed between the snapshot and the subscription.
pub async fn serve_follower<W>(
    aggregator: &Arc<Aggregator>,
    replicator: &Arc<Replicator>,
    connection: W,
) where
    W: AsyncWrite + Unpin,
{
    let disconnected = CancellationToken::new();

    let resume = aggregator.pause().await;
    let buffers = aggregator.copy_buffers();
    let mut tail = replicator.register(disconnected.clone());
    resume.resume();

    if let Err(error) = snapshot::stream_to(&buffers, &mut tail, connection).await {
        warn!(%error, "replication stream aborted");
    }

    // deregister, then drain whatever the replicator already queued
    disconnected.cancel();
    while tail.recv().await.is_some() {}
    debug!("follower disconnected");
}

/// Starts following the leader at `address`. Local buffers are flushed
/// before replay; the leader's snapshot is the authoritative prefix.
/// Returns a token that tears the follow down when cancelled.
pub async fn follow(address: &str, aggregator: Arc<Aggregator>) -> io::Result<CancellationToken> {
    let connection = TcpStream::connect(address).await?;
    info!(leader = address, "replication stream opened");

    aggregator.flush();

    let unfollow = CancellationToken::new();
    let token = unfollow.clone();
    let leader = address.to_string();
    tokio::spawn(async move {
        let mut scanner = SnapshotScanner::new(connection);
        loop {
            tokio::select! {
                () = token.cancelled() => return,
                next = scanner.next_message() => match next {
                    Ok(Some(message)) => aggregator.feed(Arc::new(message)).await,
                    Ok(None) => {
                        debug!(leader, "replication stream ended");
                        return;
                    }
                    Err(error) => {
                        warn!(leader, %error, "replication stream failed");
                        return;
                    }
                }
            }
        }
    });
    Ok(unfollow)
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

    async fn wait_until_buffered(aggregator: &Arc<Aggregator>, count: usize) {
        timeout(Duration::from_secs(5), async {
            loop {
                let buffered: usize = aggregator
                    .copy_buffers()
                    .iter()
                    .map(std::vec::Vec::len)
                    .sum();
                if buffered >= count {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("messages did not arrive in time");
    }

    #[tokio::test]
    async fn test_serve_follower_streams_prefix_then_tail() {
        let aggregator = Aggregator::new(100);
        let replicator = Arc::new(Replicator::new());

        for body in ["m1", "m2", "m3"] {
            aggregator.feed(msg("web", body)).await;
        }
        wait_until_buffered(&aggregator, 3).await;

        let (reader, writer) = tokio::io::duplex(64 * 1024);
        let leader = {
            let aggregator = Arc::clone(&aggregator);
            let replicator = Arc::clone(&replicator);
            tokio::spawn(async move {
                serve_follower(&aggregator, &replicator, writer).await;
            })
        };

        let mut scanner = SnapshotScanner::new(reader);
        for expected in ["m1", "m2", "m3"] {
            let message = timeout(Duration::from_secs(2), scanner.next_message())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert!(message.as_bytes().ends_with(expected.as_bytes()));
        }

        // fed after the handshake, delivered through the live tail
        let m4 = msg("web", "m4");
        aggregator.feed(Arc::clone(&m4)).await;
        replicator.feed(&m4);

        let message = timeout(Duration::from_secs(2), scanner.next_message())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(message.as_bytes().ends_with(b"m4"));

        drop(scanner);
        let _ = timeout(Duration::from_secs(2), leader).await;
    }

    #[tokio::test]
    async fn test_serve_follower_drains_tail_after_write_error() {
        let aggregator = Aggregator::new(100);
        let replicator = Arc::new(Replicator::new());

        aggregator.feed(msg("web", "m1")).await;
        wait_until_buffered(&aggregator, 1).await;

        // follower that goes away immediately
        let (reader, writer) = tokio::io::duplex(16);
        drop(reader);

        let leader = {
            let aggregator = Arc::clone(&aggregator);
            let replicator = Arc::clone(&replicator);
            tokio::spawn(async move {
                serve_follower(&aggregator, &replicator, writer).await;
            })
        };

        timeout(Duration::from_secs(2), leader).await.unwrap().unwrap();

        // the sink was deregistered; feeding keeps working
        replicator.feed(&msg("web", "m2"));
    }

    #[tokio::test]
    async fn test_follow_dial_failure_is_an_error() {
        let aggregator = Aggregator::new(100);

        // port 1 is never listening on loopback
        let result = follow("127.0.0.1:1", aggregator).await;
        assert!(result.is_err());
    }
}
