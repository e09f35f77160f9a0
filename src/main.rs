//! Node bootstrap: wire one replica together from the environment.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::info;

use barkeep::config::NodeConfig;
use barkeep::constants::APPLY_CHANNEL_CAPACITY;
use barkeep::error::Error;
use barkeep::raft::{storage, ClusterCoordinator, RaftNode, RaftRpcServer};
use barkeep::server::BusinessGateway;
use barkeep::service::{InMemoryBackend, ReplicatedCommerce};
use barkeep::telemetry::{init_logging, LogFormat};

#[tokio::main]
async fn main() -> barkeep::Result<()> {
    init_logging(LogFormat::from_env()).map_err(|e| Error::Config(e.to_string()))?;

    let config = NodeConfig::from_env()?;
    info!(node_id = %config.node_id, peers = config.peers.len(), "starting node");

    let own = config
        .peers
        .iter()
        .find(|p| p.id == config.node_id)
        .cloned()
        .ok_or_else(|| Error::Config("node id missing from peer list".to_string()))?;

    let store = storage::open_or_memory(&config.storage_dir, &config.node_id);
    let (apply_tx, apply_rx) = mpsc::channel(APPLY_CHANNEL_CAPACITY);

    let node = RaftNode::new(
        config.node_id.clone(),
        config.peers.clone(),
        store,
        apply_tx,
    )?;
    node.start();

    RaftRpcServer::bind(Arc::clone(&node), &own.raft_addr)
        .await?
        .spawn();

    let commerce = ReplicatedCommerce::new(
        Arc::clone(&node),
        Arc::new(InMemoryBackend::new()),
        config.perform_timeout,
    );
    commerce.start(apply_rx);

    let coordinator = ClusterCoordinator::new(
        Arc::clone(&node),
        own.business_addr.clone(),
        config.coordinator_addr.clone(),
    );
    coordinator.start().await?;

    let gateway = BusinessGateway::new(
        Arc::clone(&commerce),
        Arc::clone(&coordinator),
        config.business_addr.clone(),
    );
    gateway.start().await?;

    tokio::signal::ctrl_c().await?;
    info!(node_id = %config.node_id, "shutdown requested");
    node.shutdown();
    Ok(())
}
