use tokio::sync::mpsc;
use tracing::{error, info};

use logrelay::config::Config;
use logrelay::logger;
use logrelay::server::Server;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logger::init();
    let config = Config::from_env()?;

    let server = Server::bind(&config).await?;

    // discovery is an external collaborator; a static leader address from
    // the environment stands in for its initial lookup, and the event
    // channel stays open for an embedding process to drive
    let (_discovery_tx, discovery_rx) = mpsc::channel(16);
    let handle = server.start(config.leader_addr.clone(), discovery_rx)?;

    if let Some(path) = &config.snapshot_path {
        if let Err(error) = handle.load_snapshot(path).await {
            error!(%error, "failed to load snapshot");
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("interrupt received");

    if let Some(path) = &config.snapshot_path {
        if let Err(error) = handle.write_snapshot(path).await {
            error!(%error, "failed to write snapshot");
        }
    }
    handle.shutdown();
    Ok(())
}
