//! Server assembly: listeners, accept loops, role controller, shutdown.
//!
//! Three listeners are bound per server:
//! - **syslog**: octet-counted syslog frames; each parsed message is fed to
//!   the aggregator and offered to the replicator,
//! - **replication**: each accepted connection is a follower and receives
//!   the snapshot handshake followed by the live tail,
//! - **api**: the HTTP query surface.
//!
//! Shutdown is orderly: stop accepting and close connections, drain the
//! aggregator's inbound queue, close the follower sinks.

use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::aggregator::Aggregator;
use crate::config::Config;
use crate::controller::{DiscoveryEvent, Role, RoleController};
use crate::message::Message;
use crate::replication;
use crate::replicator::Replicator;
use crate::snapshot::{self, SnapshotError, SnapshotScanner};
use crate::syslog::OctetCountedCodec;

/// A bound but not yet running server.
pub struct Server {
    aggregator: Arc<Aggregator>,
    replicator: Arc<Replicator>,
    syslog_listener: TcpListener,
    replication_listener: TcpListener,
    api_listener: TcpListener,
    shutdown: CancellationToken,
}

impl Server {
    /// Binds the three listeners and builds the engine.
    pub async fn bind(config: &Config) -> io::Result<Server> {
        let syslog_listener = TcpListener::bind(&config.syslog_addr).await?;
        let replication_listener = TcpListener::bind(&config.replication_addr).await?;
        let api_listener = TcpListener::bind(&config.api_addr).await?;

        Ok(Server {
            aggregator: Aggregator::new(config.buffer_capacity),
            replicator: Arc::new(Replicator::new()),
            syslog_listener,
            replication_listener,
            api_listener,
            shutdown: CancellationToken::new(),
        })
    }

    /// Spawns the accept loops, the API server, and the role controller.
    /// `initial_leader` is the discovery collaborator's answer to a
    /// synchronous leader lookup; `discovery` carries subsequent events.
    pub fn start(
        self,
        initial_leader: Option<String>,
        discovery: mpsc::Receiver<DiscoveryEvent>,
    ) -> io::Result<ServerHandle> {
        let syslog_addr = self.syslog_listener.local_addr()?;
        let replication_addr = self.replication_listener.local_addr()?;
        let api_addr = self.api_listener.local_addr()?;

        let (controller, role_rx) =
            RoleController::new(Arc::clone(&self.aggregator), replication_addr.to_string());
        tokio::spawn(controller.run(initial_leader, discovery));

        tokio::spawn(accept_syslog(
            self.syslog_listener,
            Arc::clone(&self.aggregator),
            Arc::clone(&self.replicator),
            self.shutdown.clone(),
        ));
        tokio::spawn(accept_replication(
            self.replication_listener,
            Arc::clone(&self.aggregator),
            Arc::clone(&self.replicator),
            self.shutdown.clone(),
        ));

        let router = crate::api::router(
            Arc::clone(&self.aggregator),
            role_rx.clone(),
            self.shutdown.clone(),
        );
        let api_listener = self.api_listener;
        let api_shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let serve = axum::serve(api_listener, router)
                .with_graceful_shutdown(async move { api_shutdown.cancelled().await });
            if let Err(error) = serve.await {
                error!(%error, "api server error");
            }
        });

        info!(%syslog_addr, %replication_addr, %api_addr, "server started");
        Ok(ServerHandle {
            aggregator: self.aggregator,
            replicator: self.replicator,
            syslog_addr,
            replication_addr,
            api_addr,
            role_rx,
            shutdown: self.shutdown,
        })
    }
}

/// Handle to a running server.
#[derive(Clone)]
pub struct ServerHandle {
    aggregator: Arc<Aggregator>,
    replicator: Arc<Replicator>,
    syslog_addr: SocketAddr,
    replication_addr: SocketAddr,
    api_addr: SocketAddr,
    role_rx: watch::Receiver<Role>,
    shutdown: CancellationToken,
}

impl ServerHandle {
    pub fn syslog_addr(&self) -> SocketAddr {
        self.syslog_addr
    }

    pub fn replication_addr(&self) -> SocketAddr {
        self.replication_addr
    }

    pub fn api_addr(&self) -> SocketAddr {
        self.api_addr
    }

    pub fn aggregator(&self) -> &Arc<Aggregator> {
        &self.aggregator
    }

    pub fn replicator(&self) -> &Arc<Replicator> {
        &self.replicator
    }

    pub fn role(&self) -> Role {
        self.role_rx.borrow().clone()
    }

    /// Orderly shutdown: stop accepting, drain the aggregator, close the
    /// follower sinks.
    pub fn shutdown(&self) {
        info!("shutting down");
        self.shutdown.cancel();
        self.aggregator.shutdown();
        self.replicator.shutdown();
    }

    /// Replays a snapshot file into the aggregator. A missing file is not
    /// an error, the server simply starts cold.
    pub async fn load_snapshot(&self, path: &Path) -> Result<(), SnapshotError> {
        let file = match tokio::fs::File::open(path).await {
            Ok(file) => file,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(error) => return Err(error.into()),
        };

        let mut scanner = SnapshotScanner::new(file);
        let mut restored = 0usize;
        while let Some(message) = scanner.next_message().await? {
            self.aggregator.feed(Arc::new(message)).await;
            restored += 1;
        }
        info!(restored, path = %path.display(), "snapshot loaded");
        Ok(())
    }

    /// Captures the current buffer contents to a snapshot file.
    pub async fn write_snapshot(&self, path: &Path) -> Result<(), SnapshotError> {
        let buffers = self.aggregator.copy_buffers();
        let file = tokio::fs::File::create(path).await?;
        snapshot::write_to(&buffers, file).await?;
        info!(path = %path.display(), "snapshot written");
        Ok(())
    }
}

async fn accept_syslog(
    listener: TcpListener,
    aggregator: Arc<Aggregator>,
    replicator: Arc<Replicator>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok((connection, peer)) => {
                    debug!(%peer, "syslog connection accepted");
                    tokio::spawn(drain_syslog_conn(
                        connection,
                        Arc::clone(&aggregator),
                        Arc::clone(&replicator),
                        shutdown.clone(),
                    ));
                }
                Err(error) => {
                    error!(%error, "syslog accept error");
                    return;
                }
            }
        }
    }
}

async fn drain_syslog_conn(
    connection: TcpStream,
    aggregator: Arc<Aggregator>,
    replicator: Arc<Replicator>,
    shutdown: CancellationToken,
) {
    let mut frames = FramedRead::new(connection, OctetCountedCodec);
    loop {
        tokio::select! {
            () = shutdown.cancelled() => return,
            frame = frames.next() => match frame {
                None => return,
                Some(Err(error)) => {
                    error!(%error, "syslog framing error");
                    return;
                }
                Some(Ok(frame)) => match Message::parse(frame) {
                    // a bad message is skipped; the connection stays up
                    Err(error) => error!(%error, "syslog parse error"),
                    Ok(message) => {
                        let message = Arc::new(message);
                        aggregator.feed(Arc::clone(&message)).await;
                        replicator.feed(&message);
                    }
                }
            }
        }
    }
}

async fn accept_replication(
    listener: TcpListener,
    aggregator: Arc<Aggregator>,
    replicator: Arc<Replicator>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok((connection, peer)) => {
                    info!(%peer, "follower connected");
                    let aggregator = Arc::clone(&aggregator);
                    let replicator = Arc::clone(&replicator);
                    tokio::spawn(async move {
                        replication::serve_follower(&aggregator, &replicator, connection).await;
                    });
                }
                Err(error) => {
                    error!(%error, "replication accept error");
                    return;
                }
            }
        }
    }
}
