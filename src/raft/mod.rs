//! Raft consensus core.
//!
//! The modules here form the replication subsystem: durable storage for
//! term/vote/log, the node state machine itself, the typed peer transport,
//! and the per-node cluster coordinator. Everything else in the crate is
//! glue around this.

pub mod command;
pub mod coordinator;
pub mod node;
pub mod storage;
pub mod transport;
pub mod types;

pub use command::Command;
pub use coordinator::{ClusterCoordinator, ClusterView, MemberStatus, RouteDecision};
pub use node::{Peer, RaftNode};
pub use storage::{FileLogStore, LogStore, MemoryLogStore, PersistedState};
pub use transport::{PeerClient, RaftRpcServer};
pub use types::{
    AppendEntriesArgs, AppendEntriesReply, LogEntry, NodeId, NodeState, RaftStatus,
    RequestVoteArgs, RequestVoteReply,
};
