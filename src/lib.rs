//! # Barkeep
//!
//! A replicated e-commerce backend for home-bar merchants. Orders and
//! inventory mutations that must stay consistent across a small cluster of
//! replicas are sequenced through an embedded Raft consensus core; the
//! relational store that persists the business entities is an external
//! collaborator reached through the [`service::CommerceBackend`] seam.
//!
//! # Architecture
//!
//! ```text
//!   ┌─────────────┐      ┌─────────────┐      ┌─────────────┐
//!   │   Node 1    │      │   Node 2    │      │   Node 3    │
//!   │  (Leader)   │◄────►│ (Follower)  │◄────►│ (Follower)  │
//!   │             │      │             │      │             │
//!   │ ┌─────────┐ │      │ ┌─────────┐ │      │ ┌─────────┐ │
//!   │ │  Raft   │ │      │ │  Raft   │ │      │ │  Raft   │ │
//!   │ │  Node   │ │      │ │  Node   │ │      │ │  Node   │ │
//!   │ └────┬────┘ │      │ └────┬────┘ │      │ └────┬────┘ │
//!   │      │      │      │      │      │      │      │      │
//!   │ ┌────▼────┐ │      │ ┌────▼────┐ │      │ ┌────▼────┐ │
//!   │ │ Adapter │ │      │ │ Adapter │ │      │ │ Adapter │ │
//!   │ └────┬────┘ │      │ └─────────┘ │      │ └─────────┘ │
//!   └──────┼──────┘      └─────────────┘      └─────────────┘
//!          │                (side effects skipped on followers)
//!          ▼
//!   ┌─────────────┐
//!   │ Shared store│  ← single database of record
//!   └─────────────┘
//! ```
//!
//! A mutating request may land on any node. Followers answer with a 307
//! redirect to the leader's business address (503 when no leader is known);
//! the leader's adapter encodes the operation as a [`raft::Command`],
//! appends it to the replicated log, waits for a majority commit, executes
//! it against the store, and unblocks the caller with the result.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use barkeep::config::NodeConfig;
//! use barkeep::raft::{storage, RaftNode, RaftRpcServer, ClusterCoordinator};
//! use barkeep::service::{InMemoryBackend, ReplicatedCommerce};
//! use barkeep::server::BusinessGateway;
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() -> barkeep::Result<()> {
//!     let config = NodeConfig::from_env()?;
//!     let store = storage::open_or_memory(&config.storage_dir, &config.node_id);
//!     let (apply_tx, apply_rx) = mpsc::channel(barkeep::constants::APPLY_CHANNEL_CAPACITY);
//!
//!     let node = RaftNode::new(config.node_id.clone(), config.peers.clone(), store, apply_tx)?;
//!     node.start();
//!     RaftRpcServer::bind(Arc::clone(&node), "127.0.0.1:8081").await?.spawn();
//!
//!     let commerce = ReplicatedCommerce::new(
//!         Arc::clone(&node),
//!         Arc::new(InMemoryBackend::new()),
//!         config.perform_timeout,
//!     );
//!     commerce.start(apply_rx);
//!
//!     let coordinator = ClusterCoordinator::new(
//!         Arc::clone(&node),
//!         "127.0.0.1:9001".into(),
//!         config.coordinator_addr.clone(),
//!     );
//!     coordinator.start().await?;
//!
//!     BusinessGateway::new(commerce, coordinator, config.business_addr.clone())
//!         .start()
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     node.shutdown();
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod constants;
pub mod domain;
pub mod error;
pub mod raft;
pub mod server;
pub mod service;
pub mod telemetry;

pub use error::{Error, Result};
