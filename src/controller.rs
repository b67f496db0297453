//! Leader/follower role tracking driven by discovery events.
//!
//! The controller starts from an initial leader lookup and then reacts to
//! `LeaderChanged` events. While another server leads, this one follows it;
//! when this server is elected, the controller records the leader role and
//! exits. Leadership is terminal for the controller, replication connections
//! are then served passively by the replication listener.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::aggregator::Aggregator;
use crate::replication;

/// Events consumed from the discovery collaborator. Addresses are the
/// leader's replication address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    LeaderChanged(String),
}

/// The server's current replication role.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Role {
    /// No leader is known yet.
    #[default]
    Unknown,
    /// This server is the elected ingest point.
    Leader,
    /// Another server leads; its replication address is carried. The role
    /// holds even while a dial to the leader is failing.
    Follower(String),
}

/// Tracks the role and drives follow/unfollow transitions.
pub struct RoleController {
    aggregator: Arc<Aggregator>,
    advertised_addr: String,
    role_tx: watch::Sender<Role>,
}

impl RoleController {
    /// Creates a controller advertising `advertised_addr` as this server's
    /// replication address. The watch receiver observes role transitions.
    pub fn new(
        aggregator: Arc<Aggregator>,
        advertised_addr: String,
    ) -> (RoleController, watch::Receiver<Role>) {
        let (role_tx, role_rx) = watch::channel(Role::Unknown);
        (
            RoleController {
                aggregator,
                advertised_addr,
                role_tx,
            },
            role_rx,
        )
    }

    /// Runs until this server is elected leader or the event stream closes.
    /// A closed stream leaves the current role in place.
    pub async fn run(
        self,
        initial_leader: Option<String>,
        mut events: mpsc::Receiver<DiscoveryEvent>,
    ) {
        let mut unfollow: Option<CancellationToken> = None;

        if let Some(leader) = initial_leader {
            if self.apply_leader(&leader, &mut unfollow).await {
                return;
            }
        }

        while let Some(event) = events.recv().await {
            let DiscoveryEvent::LeaderChanged(leader) = event;
            // tear down the previous follow before acting on the new leader
            if let Some(token) = unfollow.take() {
                token.cancel();
            }
            if self.apply_leader(&leader, &mut unfollow).await {
                return;
            }
        }
        debug!("discovery event stream closed, holding current role");
    }

    /// Applies a leader address; returns true when this server was elected
    /// and the controller should exit.
    async fn apply_leader(&self, leader: &str, unfollow: &mut Option<CancellationToken>) -> bool {
        if leader == self.advertised_addr {
            info!("elected leader");
            self.role_tx.send_replace(Role::Leader);
            return true;
        }

        match replication::follow(leader, Arc::clone(&self.aggregator)).await {
            Ok(token) => {
                info!(leader, "following leader");
                *unfollow = Some(token);
            }
            Err(error) => {
                // stay a follower without an active stream; the next
                // LeaderChanged event retries
                error!(leader, %error, "failed to dial leader");
            }
        }
        self.role_tx.send_replace(Role::Follower(leader.to_string()));
        false
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn controller() -> (RoleController, watch::Receiver<Role>) {
        let aggregator = Aggregator::new(100);
        RoleController::new(aggregator, "127.0.0.1:7777".to_string())
    }

    #[tokio::test]
    async fn test_initial_self_leader_is_terminal() {
        let (controller, role_rx) = controller();
        let (_events_tx, events_rx) = mpsc::channel(8);

        let run = tokio::spawn(controller.run(Some("127.0.0.1:7777".to_string()), events_rx));

        timeout(Duration::from_secs(2), run).await.unwrap().unwrap();
        assert_eq!(*role_rx.borrow(), Role::Leader);
    }

    #[tokio::test]
    async fn test_no_initial_leader_is_unknown() {
        let (controller, role_rx) = controller();
        let (events_tx, events_rx) = mpsc::channel(8);

        let run = tokio::spawn(controller.run(None, events_rx));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*role_rx.borrow(), Role::Unknown);

        drop(events_tx);
        timeout(Duration::from_secs(2), run).await.unwrap().unwrap();
        assert_eq!(*role_rx.borrow(), Role::Unknown);
    }

    #[tokio::test]
    async fn test_election_event_promotes_to_leader() {
        let (controller, role_rx) = controller();
        let (events_tx, events_rx) = mpsc::channel(8);

        let run = tokio::spawn(controller.run(None, events_rx));
        events_tx
            .send(DiscoveryEvent::LeaderChanged("127.0.0.1:7777".to_string()))
            .await
            .unwrap();

        timeout(Duration::from_secs(2), run).await.unwrap().unwrap();
        assert_eq!(*role_rx.borrow(), Role::Leader);
    }

    #[tokio::test]
    async fn test_unreachable_leader_still_sets_follower_role() {
        let (controller, mut role_rx) = controller();
        let (events_tx, events_rx) = mpsc::channel(8);

        let run = tokio::spawn(controller.run(None, events_rx));
        // nothing listens on port 1; the dial fails but the role holds
        events_tx
            .send(DiscoveryEvent::LeaderChanged("127.0.0.1:1".to_string()))
            .await
            .unwrap();

        timeout(Duration::from_secs(2), role_rx.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*role_rx.borrow(), Role::Follower("127.0.0.1:1".to_string()));
        assert!(!run.is_finished());
        run.abort();
    }
}
