//! Error types for the replicated backend.
//!
//! # Error handling patterns
//!
//! Two patterns are used, chosen by operation criticality:
//!
//! - **Fail-fast**: write-path operations (`submit`, `perform`, backend
//!   mutations) propagate errors to the caller. A write that cannot be
//!   acknowledged must not look successful.
//! - **Best-effort**: transport failures and persistence failures inside the
//!   consensus loops are logged and absorbed; the next heartbeat tick retries
//!   replication, and a node whose disk is unavailable keeps running with
//!   in-memory state (visibly degraded, never silently).
//!
//! Log-layer invariants are never relaxed in response to an error: commit
//! order, truncation rules, and apply order hold even when the external
//! store rejects a command.

use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the consensus core and its adapter.
#[derive(Debug, Error)]
pub enum Error {
    /// A write was submitted to a node that is not the leader.
    /// The redirection middleware normally prevents this from reaching
    /// callers; when it does, the hint names the leader if one is known.
    #[error("not the leader{}", .leader_hint.as_deref().map(|id| format!(" (leader is node {id})")).unwrap_or_default())]
    NotLeader {
        /// The leader this node currently believes in, if any.
        leader_hint: Option<String>,
    },

    /// `perform` exceeded its wait budget. The entry may still commit and
    /// apply later; the caller must treat the outcome as unknown.
    #[error("timed out waiting for the command to be applied")]
    Timeout,

    /// An RPC to a peer failed (connect, I/O, or decode). Non-fatal at the
    /// Raft layer: the next heartbeat retries.
    #[error("transport error: {0}")]
    Transport(String),

    /// The persistent store rejected a write. The node may continue with
    /// in-memory durability as a degraded fallback.
    #[error("persistence error: {0}")]
    Persist(#[source] std::io::Error),

    /// The application handler failed while executing a committed command.
    /// The entry itself stays committed.
    #[error("apply failed: {0}")]
    Apply(String),

    /// A command tag outside the known set. Treated like an apply failure.
    #[error("unknown command type: {0}")]
    UnknownCommand(String),

    /// The caller's request context ended before a result was available.
    #[error("request cancelled")]
    Cancelled,

    /// Invalid node or cluster configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization failure in a persisted record or HTTP body.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// I/O failure outside the persistence path.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True if the caller should locate the leader and retry there.
    #[inline]
    pub fn is_not_leader(&self) -> bool {
        matches!(self, Error::NotLeader { .. })
    }

    /// True if the operation may succeed when simply retried.
    ///
    /// `Timeout` is deliberately not retryable: the entry may have been
    /// applied, so a blind retry risks a duplicate side effect.
    #[inline]
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::NotLeader { .. } => true,
            Error::Transport(_) => true,
            Error::Persist(_) => true,
            Error::Timeout => false,
            Error::Apply(_) => false,
            Error::UnknownCommand(_) => false,
            Error::Cancelled => false,
            Error::Config(_) => false,
            Error::Serde(_) => false,
            Error::Io(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_leader_display_includes_hint() {
        let err = Error::NotLeader {
            leader_hint: Some("2".to_string()),
        };
        let msg = format!("{err}");
        assert!(msg.contains("not the leader"));
        assert!(msg.contains("node 2"));
    }

    #[test]
    fn not_leader_display_without_hint() {
        let err = Error::NotLeader { leader_hint: None };
        assert_eq!(format!("{err}"), "not the leader");
    }

    #[test]
    fn timeout_is_not_retryable() {
        assert!(!Error::Timeout.is_retryable());
    }

    #[test]
    fn transport_is_retryable() {
        assert!(Error::Transport("connection refused".into()).is_retryable());
    }

    #[test]
    fn predicates_classify_not_leader() {
        let err = Error::NotLeader { leader_hint: None };
        assert!(err.is_not_leader());
        assert!(err.is_retryable());
        assert!(!Error::Timeout.is_not_leader());
    }

    #[test]
    fn io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn unknown_command_display() {
        let err = Error::UnknownCommand("drop_table".into());
        assert!(format!("{err}").contains("drop_table"));
    }
}
