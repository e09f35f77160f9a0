//! The local Raft state machine: timers, elections, replication, commit
//! tracking, and the apply loop.
//!
//! # Concurrency model
//!
//! One coarse mutex guards all volatile and persistent in-memory state. RPC
//! handlers, timer callbacks, and `submit` all acquire it. The mutex is
//! never held across network I/O: outbound calls snapshot their arguments
//! under the lock, perform the RPC, then reacquire the lock and re-check
//! `(state, term)` before acting on the reply.
//!
//! Three tasks run per node: the main loop (election and heartbeat timers),
//! the apply loop (streams committed entries to the application adapter),
//! and one short-lived task per peer per replication round.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Notify};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::PeerSpec;
use crate::constants::{
    ELECTION_TIMEOUT_MAX, ELECTION_TIMEOUT_MIN, HEARTBEAT_INTERVAL, MAX_APPEND_ENTRIES,
};
use crate::error::{Error, Result};

use super::command::Command;
use super::storage::{LogStore, PersistedState};
use super::transport::PeerClient;
use super::types::{
    AppendEntriesArgs, AppendEntriesReply, LogEntry, NodeId, NodeState, RaftStatus,
    RequestVoteArgs, RequestVoteReply,
};

/// A remote member of the cluster, owned exclusively by the local node.
pub struct Peer {
    pub id: NodeId,
    pub raft_addr: String,
    pub business_addr: String,
    client: PeerClient,
}

/// State guarded by the node's coarse mutex.
struct RaftInner {
    state: NodeState,
    current_term: u64,
    voted_for: Option<NodeId>,
    /// `log[0]` is the sentinel; `log[i].index == i`.
    log: Vec<LogEntry>,
    commit_index: u64,
    last_applied: u64,
    leader_id: Option<NodeId>,
    next_index: HashMap<NodeId, u64>,
    match_index: HashMap<NodeId, u64>,
    election_deadline: Instant,
    votes_received: HashSet<NodeId>,
}

impl RaftInner {
    fn last_log_index(&self) -> u64 {
        (self.log.len() - 1) as u64
    }

    fn last_log_term(&self) -> u64 {
        self.log.last().map(|e| e.term).unwrap_or(0)
    }

    fn term_at(&self, index: u64) -> u64 {
        self.log.get(index as usize).map(|e| e.term).unwrap_or(0)
    }

    fn persisted(&self) -> PersistedState {
        PersistedState {
            current_term: self.current_term,
            voted_for: self.voted_for.clone().unwrap_or_default(),
            last_applied: self.last_applied,
        }
    }
}

/// A Raft consensus node.
pub struct RaftNode {
    id: NodeId,
    peers: Vec<Peer>,
    cluster_size: usize,
    inner: Mutex<RaftInner>,
    store: Arc<dyn LogStore>,
    apply_tx: mpsc::Sender<LogEntry>,
    /// Signaled when `commit_index` advances.
    apply_notify: Notify,
    /// Signaled to run a replication round ahead of the next heartbeat.
    replicate_notify: Notify,
    shutdown_tx: broadcast::Sender<()>,
}

impl RaftNode {
    /// Build a node from its peer list and durable store. The node boots as
    /// Follower at the persisted term; committed-but-unapplied entries are
    /// replayed through `apply_tx` once `start` runs.
    pub fn new(
        id: NodeId,
        peer_specs: Vec<PeerSpec>,
        store: Arc<dyn LogStore>,
        apply_tx: mpsc::Sender<LogEntry>,
    ) -> Result<Arc<Self>> {
        let state = store.load_state()?;
        let log = store.load_log()?;

        let peers: Vec<Peer> = peer_specs
            .into_iter()
            .filter(|p| p.id != id)
            .map(|p| Peer {
                client: PeerClient::new(p.raft_addr.clone()),
                id: p.id,
                raft_addr: p.raft_addr,
                business_addr: p.business_addr,
            })
            .collect();
        let cluster_size = peers.len() + 1;

        let voted_for = if state.voted_for.is_empty() {
            None
        } else {
            Some(state.voted_for.clone())
        };

        let inner = RaftInner {
            state: NodeState::Follower,
            current_term: state.current_term,
            voted_for,
            commit_index: state.last_applied,
            last_applied: state.last_applied,
            log,
            leader_id: None,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            election_deadline: Instant::now() + random_election_timeout(),
            votes_received: HashSet::new(),
        };

        info!(
            node_id = %id,
            term = inner.current_term,
            log_len = inner.log.len(),
            last_applied = inner.last_applied,
            "raft node loaded"
        );

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Arc::new(Self {
            id,
            peers,
            cluster_size,
            inner: Mutex::new(inner),
            store,
            apply_tx,
            apply_notify: Notify::new(),
            replicate_notify: Notify::new(),
            shutdown_tx,
        }))
    }

    /// Spawn the main loop and the apply loop.
    pub fn start(self: &Arc<Self>) {
        let node = Arc::clone(self);
        tokio::spawn(async move { node.run().await });
        let node = Arc::clone(self);
        tokio::spawn(async move { node.apply_loop().await });
    }

    /// Stop the node's tasks. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Subscribe to the node's shutdown signal.
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The static peer set (excluding self).
    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    pub fn is_leader(&self) -> bool {
        self.locked().state == NodeState::Leader
    }

    /// Current known leader, if any.
    pub fn leader_id(&self) -> Option<NodeId> {
        self.locked().leader_id.clone()
    }

    /// Snapshot of the node's externally visible state.
    pub fn status(&self) -> RaftStatus {
        let inner = self.locked();
        RaftStatus {
            id: self.id.clone(),
            state: inner.state,
            term: inner.current_term,
            commit_index: inner.commit_index,
            last_applied: inner.last_applied,
            leader_id: inner.leader_id.clone(),
        }
    }

    /// The last `limit` log entries (sentinel excluded), oldest first.
    pub fn tail_entries(&self, limit: usize) -> Vec<LogEntry> {
        let inner = self.locked();
        let entries = &inner.log[1..];
        let start = entries.len().saturating_sub(limit);
        entries[start..].to_vec()
    }

    /// Append a command to the replicated log.
    ///
    /// Fails with [`Error::NotLeader`] on non-leaders. On the leader the
    /// entry is appended at `len(log)`, persisted, and an immediate
    /// replication round is triggered; the returned index is where the
    /// entry will commit if this leader retains the term.
    pub fn submit(&self, command: Command) -> Result<u64> {
        let index = {
            let mut inner = self.locked();
            if inner.state != NodeState::Leader {
                return Err(Error::NotLeader {
                    leader_hint: inner.leader_id.clone(),
                });
            }

            let index = inner.log.len() as u64;
            let entry = LogEntry {
                index,
                term: inner.current_term,
                command: Some(command),
            };
            inner.log.push(entry.clone());
            if let Err(e) = self.store.append_entries(std::slice::from_ref(&entry)) {
                warn!(node_id = %self.id, error = %e, "log append not persisted");
            }
            debug!(node_id = %self.id, index, term = inner.current_term, "command submitted");
            index
        };

        self.replicate_notify.notify_one();
        Ok(index)
    }

    // ------------------------------------------------------------------
    // Main loop
    // ------------------------------------------------------------------

    async fn run(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let deadline = self.locked().election_deadline;

            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!(node_id = %self.id, "raft node shutting down");
                    return;
                }
                _ = self.replicate_notify.notified() => {
                    self.broadcast_append();
                }
                _ = heartbeat.tick() => {
                    if self.is_leader() {
                        self.broadcast_append();
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    if let Some(args) = self.election_timeout_fired() {
                        self.solicit_votes(args);
                    }
                }
            }
        }
    }

    /// Handle an expired election deadline. Returns vote arguments when a
    /// new election actually started.
    fn election_timeout_fired(&self) -> Option<RequestVoteArgs> {
        let mut inner = self.locked();

        if Instant::now() < inner.election_deadline {
            // The deadline moved while we slept; nothing to do.
            return None;
        }
        if inner.state == NodeState::Leader {
            // Leaders don't campaign; push the deadline along.
            reset_election_deadline(&mut inner);
            return None;
        }

        // Candidate transition: new term, vote for self, persist, re-arm.
        inner.state = NodeState::Candidate;
        inner.current_term += 1;
        inner.voted_for = Some(self.id.clone());
        inner.votes_received = HashSet::from([self.id.clone()]);
        self.persist_state_locked(&inner);
        reset_election_deadline(&mut inner);

        info!(node_id = %self.id, term = inner.current_term, "election started");

        let args = RequestVoteArgs {
            term: inner.current_term,
            candidate_id: self.id.clone(),
            last_log_index: inner.last_log_index(),
            last_log_term: inner.last_log_term(),
        };

        // A cluster of one elects itself on the spot.
        self.maybe_become_leader_locked(&mut inner);

        Some(args)
    }

    /// Fan RequestVote out to every peer in parallel.
    fn solicit_votes(self: &Arc<Self>, args: RequestVoteArgs) {
        for idx in 0..self.peers.len() {
            let node = Arc::clone(self);
            let args = args.clone();
            tokio::spawn(async move {
                let peer = &node.peers[idx];
                match peer.client.request_vote(&args).await {
                    Ok(reply) => node.handle_vote_reply(&peer.id.clone(), &args, reply),
                    Err(e) => {
                        debug!(node_id = %node.id, peer = %peer.id, error = %e, "vote request failed");
                    }
                }
            });
        }
    }

    fn handle_vote_reply(
        self: &Arc<Self>,
        from: &NodeId,
        args: &RequestVoteArgs,
        reply: RequestVoteReply,
    ) {
        let became_leader = {
            let mut inner = self.locked();

            if reply.term > inner.current_term {
                self.become_follower_locked(&mut inner, reply.term);
                return;
            }
            // Stale reply from a previous candidacy.
            if inner.state != NodeState::Candidate || inner.current_term != args.term {
                return;
            }
            if !reply.vote_granted {
                return;
            }

            inner.votes_received.insert(from.clone());
            debug!(
                node_id = %self.id,
                peer = %from,
                votes = inner.votes_received.len(),
                cluster = self.cluster_size,
                "vote granted"
            );
            self.maybe_become_leader_locked(&mut inner)
        };

        if became_leader {
            // Assert leadership before the next heartbeat tick.
            self.replicate_notify.notify_one();
        }
    }

    /// Promote to Leader on a strict majority. Returns true on promotion.
    fn maybe_become_leader_locked(&self, inner: &mut MutexGuard<'_, RaftInner>) -> bool {
        if inner.state != NodeState::Candidate
            || inner.votes_received.len() * 2 <= self.cluster_size
        {
            return false;
        }

        inner.state = NodeState::Leader;
        inner.leader_id = Some(self.id.clone());
        inner.votes_received.clear();
        let next = inner.log.len() as u64;
        for peer in &self.peers {
            inner.next_index.insert(peer.id.clone(), next);
            inner.match_index.insert(peer.id.clone(), 0);
        }
        info!(node_id = %self.id, term = inner.current_term, "became leader");

        // Self is a majority in a single-node cluster.
        if self.advance_commit_locked(inner) {
            self.apply_notify.notify_one();
        }
        true
    }

    fn become_follower_locked(&self, inner: &mut MutexGuard<'_, RaftInner>, term: u64) {
        let term_changed = term > inner.current_term;
        if term_changed {
            inner.current_term = term;
            inner.voted_for = None;
        }
        if inner.state != NodeState::Follower || term_changed {
            debug!(node_id = %self.id, term = inner.current_term, "stepping down to follower");
        }
        inner.state = NodeState::Follower;
        inner.votes_received.clear();
        if term_changed {
            self.persist_state_locked(inner);
        }
        reset_election_deadline(inner);
    }

    // ------------------------------------------------------------------
    // Replication (leader)
    // ------------------------------------------------------------------

    /// Run one replication round: an AppendEntries to every peer, carrying
    /// whatever each one is missing (possibly nothing).
    fn broadcast_append(self: &Arc<Self>) {
        if self.peers.is_empty() {
            // No peers to replicate to; commit directly.
            let mut inner = self.locked();
            if inner.state == NodeState::Leader && self.advance_commit_locked(&mut inner) {
                self.apply_notify.notify_one();
            }
            return;
        }

        for idx in 0..self.peers.len() {
            let node = Arc::clone(self);
            tokio::spawn(async move { node.replicate_to_peer(idx).await });
        }
    }

    async fn replicate_to_peer(self: Arc<Self>, peer_idx: usize) {
        let peer = &self.peers[peer_idx];

        // Snapshot the arguments under the lock, then release it for I/O.
        let args = {
            let inner = self.locked();
            if inner.state != NodeState::Leader {
                return;
            }
            let next_idx = inner
                .next_index
                .get(&peer.id)
                .copied()
                .unwrap_or(inner.log.len() as u64)
                .clamp(1, inner.log.len() as u64);
            let prev_log_index = next_idx - 1;
            let end = (next_idx as usize + MAX_APPEND_ENTRIES).min(inner.log.len());
            let entries = inner.log[next_idx as usize..end].to_vec();

            AppendEntriesArgs {
                term: inner.current_term,
                leader_id: self.id.clone(),
                prev_log_index,
                prev_log_term: inner.term_at(prev_log_index),
                entries,
                leader_commit: inner.commit_index,
            }
        };

        let reply = match peer.client.append_entries(&args).await {
            Ok(reply) => reply,
            Err(e) => {
                // Unreachable peer; the next heartbeat retries.
                debug!(node_id = %self.id, peer = %peer.id, error = %e, "append entries failed");
                return;
            }
        };

        // Reconcile: drop the reply if the world moved underneath us.
        let committed = {
            let mut inner = self.locked();
            if inner.state != NodeState::Leader || inner.current_term != args.term {
                return;
            }
            if reply.term > inner.current_term {
                self.become_follower_locked(&mut inner, reply.term);
                return;
            }

            if reply.success {
                let matched = args.prev_log_index + args.entries.len() as u64;
                inner.match_index.insert(peer.id.clone(), matched);
                inner.next_index.insert(peer.id.clone(), matched + 1);
                self.advance_commit_locked(&mut inner)
            } else {
                let current = inner.next_index.get(&peer.id).copied().unwrap_or(1);
                let next = if reply.conflict_term > 0 {
                    // Skip the whole conflicting term if we have it.
                    match last_index_of_term(&inner.log, reply.conflict_term) {
                        Some(i) => i + 1,
                        None => reply.conflict_index,
                    }
                } else if reply.conflict_index > 0 {
                    // Follower's log is short; jump straight to its end.
                    reply.conflict_index
                } else {
                    current.saturating_sub(1)
                };
                inner.next_index.insert(peer.id.clone(), next.max(1));
                debug!(
                    node_id = %self.id,
                    peer = %peer.id,
                    next_index = next,
                    "follower log diverged, backing up"
                );
                false
            }
        };

        if committed {
            self.apply_notify.notify_one();
        }
    }

    /// Walk `commit_index` upward over entries replicated on a strict
    /// majority. Only entries from the current term count directly; older
    /// entries commit with them.
    fn advance_commit_locked(&self, inner: &mut MutexGuard<'_, RaftInner>) -> bool {
        let old_commit = inner.commit_index;
        for i in (inner.commit_index + 1)..=inner.last_log_index() {
            if inner.term_at(i) != inner.current_term {
                continue;
            }
            let replicas = 1 + self
                .peers
                .iter()
                .filter(|p| inner.match_index.get(&p.id).copied().unwrap_or(0) >= i)
                .count();
            if replicas * 2 > self.cluster_size {
                inner.commit_index = i;
            } else {
                break;
            }
        }
        if inner.commit_index > old_commit {
            debug!(node_id = %self.id, commit_index = inner.commit_index, "commit advanced");
            true
        } else {
            false
        }
    }

    // ------------------------------------------------------------------
    // RPC receivers
    // ------------------------------------------------------------------

    /// RequestVote receiver. Grants when the candidate's term is current,
    /// this node has not voted for someone else this term, and the
    /// candidate's log is at least as up-to-date as ours.
    pub fn handle_request_vote(&self, args: &RequestVoteArgs) -> RequestVoteReply {
        let mut inner = self.locked();

        if args.term > inner.current_term {
            self.become_follower_locked(&mut inner, args.term);
        }
        if args.term < inner.current_term {
            return RequestVoteReply {
                term: inner.current_term,
                vote_granted: false,
            };
        }

        let can_vote = match &inner.voted_for {
            None => true,
            Some(candidate) => *candidate == args.candidate_id,
        };
        let log_ok = args.last_log_term > inner.last_log_term()
            || (args.last_log_term == inner.last_log_term()
                && args.last_log_index >= inner.last_log_index());

        let vote_granted = can_vote && log_ok;
        if vote_granted {
            let first_vote = inner.voted_for.is_none();
            inner.voted_for = Some(args.candidate_id.clone());
            if first_vote {
                self.persist_state_locked(&inner);
            }
            reset_election_deadline(&mut inner);
            debug!(node_id = %self.id, candidate = %args.candidate_id, term = args.term, "vote granted");
        }

        RequestVoteReply {
            term: inner.current_term,
            vote_granted,
        }
    }

    /// AppendEntries receiver: term check, consistency check with conflict
    /// hints, position-wise truncation and append, commit advancement.
    pub fn handle_append_entries(&self, args: &AppendEntriesArgs) -> AppendEntriesReply {
        let mut inner = self.locked();

        if args.term < inner.current_term {
            return AppendEntriesReply::rejected(inner.current_term);
        }

        // A live leader at our term or later: follow it.
        self.become_follower_locked(&mut inner, args.term);
        inner.leader_id = Some(args.leader_id.clone());

        // Consistency check on the entry preceding the new ones.
        let log_len = inner.log.len() as u64;
        if args.prev_log_index >= log_len {
            return AppendEntriesReply {
                term: inner.current_term,
                success: false,
                conflict_term: 0,
                conflict_index: log_len,
            };
        }
        let local_prev_term = inner.term_at(args.prev_log_index);
        if args.prev_log_index > 0 && local_prev_term != args.prev_log_term {
            let conflict_index = first_index_of_term(&inner.log, local_prev_term)
                .unwrap_or(args.prev_log_index);
            return AppendEntriesReply {
                term: inner.current_term,
                success: false,
                conflict_term: local_prev_term,
                conflict_index,
            };
        }

        // Append, truncating at the first position whose term disagrees.
        for (offset, entry) in args.entries.iter().enumerate() {
            let idx = args.prev_log_index + 1 + offset as u64;
            if (idx as usize) < inner.log.len() {
                if inner.term_at(idx) == entry.term {
                    continue;
                }
                inner.log.truncate(idx as usize);
                if let Err(e) = self.store.truncate_suffix(idx) {
                    warn!(node_id = %self.id, error = %e, "log truncation not persisted");
                }
            }
            let tail = &args.entries[offset..];
            inner.log.extend_from_slice(tail);
            if let Err(e) = self.store.append_entries(tail) {
                warn!(node_id = %self.id, error = %e, "log append not persisted");
            }
            break;
        }

        if args.leader_commit > inner.commit_index {
            inner.commit_index = args.leader_commit.min(inner.last_log_index());
            self.apply_notify.notify_one();
        }

        AppendEntriesReply::success(inner.current_term)
    }

    // ------------------------------------------------------------------
    // Apply loop
    // ------------------------------------------------------------------

    /// Advance `last_applied` toward `commit_index` one entry at a time,
    /// handing each committed entry to the application adapter in strict
    /// index order. The new `last_applied` is persisted after each step.
    async fn apply_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => return,
                _ = self.apply_notify.notified() => {}
            }

            loop {
                let entry = {
                    let inner = self.locked();
                    if inner.last_applied < inner.commit_index {
                        inner.log.get(inner.last_applied as usize + 1).cloned()
                    } else {
                        None
                    }
                };
                let Some(entry) = entry else { break };

                // The channel is bounded; a slow adapter applies backpressure
                // here, with no lock held.
                if self.apply_tx.send(entry).await.is_err() {
                    warn!(node_id = %self.id, "apply channel closed, stopping apply loop");
                    return;
                }

                let mut inner = self.locked();
                inner.last_applied += 1;
                self.persist_state_locked(&inner);
            }
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn locked(&self) -> MutexGuard<'_, RaftInner> {
        self.inner.lock().expect("raft mutex poisoned")
    }

    fn persist_state_locked(&self, inner: &RaftInner) {
        if let Err(e) = self.store.save_state(&inner.persisted()) {
            warn!(node_id = %self.id, error = %e, "state not persisted, continuing in degraded mode");
        }
    }

    #[cfg(test)]
    pub(crate) fn force_leader(&self) {
        let mut inner = self.locked();
        inner.state = NodeState::Leader;
        inner.leader_id = Some(self.id.clone());
        let next = inner.log.len() as u64;
        for peer in &self.peers {
            inner.next_index.insert(peer.id.clone(), next);
            inner.match_index.insert(peer.id.clone(), 0);
        }
    }

    #[cfg(test)]
    pub(crate) fn force_match_index(&self, peer_id: &str, index: u64) {
        let mut inner = self.locked();
        inner.match_index.insert(peer_id.to_string(), index);
    }

    #[cfg(test)]
    pub(crate) fn try_advance_commit(&self) -> u64 {
        let mut inner = self.locked();
        self.advance_commit_locked(&mut inner);
        inner.commit_index
    }
}

fn random_election_timeout() -> Duration {
    let min = ELECTION_TIMEOUT_MIN.as_millis() as u64;
    let max = ELECTION_TIMEOUT_MAX.as_millis() as u64;
    Duration::from_millis(fastrand::u64(min..=max))
}

/// Re-arm the election timer with a fresh random timeout. Randomized per
/// cycle so repeated split votes decorrelate.
fn reset_election_deadline(inner: &mut RaftInner) {
    inner.election_deadline = Instant::now() + random_election_timeout();
}

fn first_index_of_term(log: &[LogEntry], term: u64) -> Option<u64> {
    log.iter().find(|e| e.term == term).map(|e| e.index)
}

fn last_index_of_term(log: &[LogEntry], term: u64) -> Option<u64> {
    log.iter().rev().find(|e| e.term == term).map(|e| e.index)
}
