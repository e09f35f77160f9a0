//! Core Raft record and RPC types.

use serde::{Deserialize, Serialize};

use super::command::Command;

/// Identifier of a node in the cluster.
pub type NodeId = String;

/// The three roles a node can hold. Boot state is Follower at the
/// persisted term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    #[default]
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeState::Follower => "follower",
            NodeState::Candidate => "candidate",
            NodeState::Leader => "leader",
        };
        f.write_str(s)
    }
}

/// One record of the replicated log.
///
/// `log[i].index == i` always holds; index 0 is a synthetic sentinel with
/// term 0 and no command. Entries are never mutated after commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub command: Option<Command>,
}

impl LogEntry {
    /// The synthetic entry at index 0.
    pub fn sentinel() -> Self {
        Self {
            index: 0,
            term: 0,
            command: None,
        }
    }

    /// Wire tag of the carried command, `"none"` for the sentinel.
    pub fn command_kind(&self) -> &'static str {
        self.command.as_ref().map_or("none", Command::kind)
    }
}

/// Arguments of the RequestVote RPC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    pub term: u64,
    pub candidate_id: NodeId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

/// Reply to a RequestVote RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteReply {
    pub term: u64,
    pub vote_granted: bool,
}

/// Arguments of the AppendEntries RPC (empty `entries` is a heartbeat).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesArgs {
    pub term: u64,
    pub leader_id: NodeId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

/// Reply to an AppendEntries RPC.
///
/// On failure the conflict fields let the leader back `next_index` up by a
/// whole term instead of one slot at a time: `conflict_term` is the term of
/// the mismatching entry (0 when the follower's log is simply short) and
/// `conflict_index` the first index carrying that term (or the follower's
/// log length).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub term: u64,
    pub success: bool,
    pub conflict_term: u64,
    pub conflict_index: u64,
}

impl AppendEntriesReply {
    pub fn success(term: u64) -> Self {
        Self {
            term,
            success: true,
            conflict_term: 0,
            conflict_index: 0,
        }
    }

    pub fn rejected(term: u64) -> Self {
        Self {
            term,
            success: false,
            conflict_term: 0,
            conflict_index: 0,
        }
    }
}

/// Request envelope carried over the peer transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcRequest {
    RequestVote(RequestVoteArgs),
    AppendEntries(AppendEntriesArgs),
}

/// Response envelope carried over the peer transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcResponse {
    RequestVote(RequestVoteReply),
    AppendEntries(AppendEntriesReply),
    /// Server-side failure while handling the request.
    Error(String),
}

/// Point-in-time snapshot of a node, served to the coordinator and gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaftStatus {
    pub id: NodeId,
    pub state: NodeState,
    pub term: u64,
    pub commit_index: u64,
    pub last_applied: u64,
    pub leader_id: Option<NodeId>,
}
