//! Per-node cluster coordinator.
//!
//! The coordinator keeps a liveness view of the cluster that is independent
//! of the Raft protocol itself: every five seconds it probes each peer's
//! business `/health` endpoint (300 ms budget) and snapshots the local
//! node's role and term. The resulting view backs a small administrative
//! HTTP surface and the redirection policy used by the business gateway.
//!
//! The coordinator holds a non-owning handle to the node it reports on; the
//! node's lifecycle belongs to the process.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::constants::{DEFAULT_LOG_TAIL, PROBE_INTERVAL, PROBE_TIMEOUT};
use crate::error::Result;
use crate::server::http::{self, Request};

use super::node::RaftNode;
use super::types::{NodeId, NodeState};

/// Liveness and role information for one cluster member.
#[derive(Debug, Clone)]
pub struct MemberStatus {
    pub id: NodeId,
    /// Role, known precisely only for the local node.
    pub state: Option<NodeState>,
    pub is_healthy: bool,
    pub last_seen: Option<Instant>,
    pub business_addr: String,
}

/// Aggregated view of the cluster, refreshed by the probe loop.
#[derive(Debug, Clone, Default)]
pub struct ClusterView {
    pub leader_id: Option<NodeId>,
    pub term: u64,
    pub commit_index: u64,
    pub members: HashMap<NodeId, MemberStatus>,
}

impl ClusterView {
    pub fn nodes_alive(&self) -> usize {
        self.members.values().filter(|m| m.is_healthy).count()
    }
}

/// Where the gateway should send a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// Handle on this node.
    Local,
    /// 307 to the leader's business address.
    Redirect(String),
    /// No leader known; 503.
    Unavailable,
}

/// Health probing, status reporting, and redirection policy for one node.
pub struct ClusterCoordinator {
    self_id: NodeId,
    node: Arc<RaftNode>,
    view: RwLock<ClusterView>,
    listen_addr: String,
}

impl ClusterCoordinator {
    pub fn new(node: Arc<RaftNode>, self_business_addr: String, listen_addr: String) -> Arc<Self> {
        let self_id = node.id().to_string();

        let mut members = HashMap::new();
        members.insert(
            self_id.clone(),
            MemberStatus {
                id: self_id.clone(),
                state: Some(NodeState::Follower),
                is_healthy: true,
                last_seen: Some(Instant::now()),
                business_addr: self_business_addr,
            },
        );
        for peer in node.peers() {
            members.insert(
                peer.id.clone(),
                MemberStatus {
                    id: peer.id.clone(),
                    state: None,
                    is_healthy: false,
                    last_seen: None,
                    business_addr: peer.business_addr.clone(),
                },
            );
        }

        Arc::new(Self {
            self_id,
            node,
            view: RwLock::new(ClusterView {
                members,
                ..ClusterView::default()
            }),
            listen_addr,
        })
    }

    /// Spawn the probe loop and the admin HTTP server. Returns the bound
    /// admin address, which matters when the configured port is 0.
    pub async fn start(self: &Arc<Self>) -> Result<std::net::SocketAddr> {
        let listener = TcpListener::bind(&self.listen_addr).await?;
        let addr = listener.local_addr()?;
        info!(node_id = %self.self_id, addr = %addr, "coordinator admin server listening");

        let coordinator = Arc::clone(self);
        tokio::spawn(async move { coordinator.probe_loop().await });

        let coordinator = Arc::clone(self);
        tokio::spawn(async move { coordinator.serve_admin(listener).await });

        Ok(addr)
    }

    /// Current cluster view (copy).
    pub fn view(&self) -> ClusterView {
        self.view.read().expect("coordinator lock poisoned").clone()
    }

    /// Routing policy for the business surface.
    ///
    /// Reserved prefixes are always handled locally; otherwise requests go
    /// to the leader, by redirect when the leader is somewhere else.
    pub fn route(&self, path: &str) -> RouteDecision {
        if path.starts_with("/health") || path.starts_with("/raft") {
            return RouteDecision::Local;
        }

        let status = self.node.status();
        if status.state == NodeState::Leader {
            return RouteDecision::Local;
        }
        let Some(leader_id) = status.leader_id else {
            return RouteDecision::Unavailable;
        };
        if leader_id == self.self_id {
            // Stale self-reference while stepping down; treat as local.
            return RouteDecision::Local;
        }

        let view = self.view.read().expect("coordinator lock poisoned");
        match view.members.get(&leader_id) {
            Some(member) => RouteDecision::Redirect(member.business_addr.clone()),
            None => RouteDecision::Unavailable,
        }
    }

    // ------------------------------------------------------------------
    // Probe loop
    // ------------------------------------------------------------------

    async fn probe_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.node.subscribe_shutdown();
        let mut ticker = tokio::time::interval(PROBE_INTERVAL);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!(node_id = %self.self_id, "coordinator shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    self.refresh().await;
                }
            }
        }
    }

    async fn refresh(&self) {
        // Probe peers without holding the view lock.
        let targets: Vec<(NodeId, String)> = {
            let view = self.view.read().expect("coordinator lock poisoned");
            view.members
                .values()
                .filter(|m| m.id != self.self_id)
                .map(|m| (m.id.clone(), m.business_addr.clone()))
                .collect()
        };

        let mut results = Vec::with_capacity(targets.len());
        for (id, addr) in targets {
            let healthy = probe_health(&addr).await;
            debug!(node_id = %self.self_id, peer = %id, healthy, "peer probed");
            results.push((id, healthy));
        }

        let status = self.node.status();

        let mut view = self.view.write().expect("coordinator lock poisoned");
        for (id, healthy) in results {
            if let Some(member) = view.members.get_mut(&id) {
                member.is_healthy = healthy;
                member.last_seen = Some(Instant::now());
            }
        }
        if let Some(me) = view.members.get_mut(&self.self_id) {
            me.state = Some(status.state);
            me.is_healthy = true;
            me.last_seen = Some(Instant::now());
        }

        // The cluster term is the leader's when we are it, otherwise the
        // highest term this node has observed.
        if status.state == NodeState::Leader {
            view.leader_id = Some(self.self_id.clone());
            view.term = status.term;
        } else {
            view.leader_id = status.leader_id.clone();
            view.term = view.term.max(status.term);
        }
        view.commit_index = status.commit_index;
    }

    // ------------------------------------------------------------------
    // Admin HTTP surface
    // ------------------------------------------------------------------

    async fn serve_admin(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown_rx = self.node.subscribe_shutdown();
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => return,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let coordinator = Arc::clone(&self);
                            tokio::spawn(async move {
                                coordinator.handle_admin_connection(stream).await;
                            });
                        }
                        Err(e) => warn!(error = %e, "admin accept failed"),
                    }
                }
            }
        }
    }

    async fn handle_admin_connection(&self, mut stream: TcpStream) {
        let request = match http::read_request(&mut stream).await {
            Ok(request) => request,
            Err(e) => {
                debug!(error = %e, "unreadable admin request");
                return;
            }
        };

        let result = match request.path() {
            "/cluster/status" => {
                let view = self.view();
                http::respond_json(
                    &mut stream,
                    200,
                    &json!({
                        "leader_id": view.leader_id,
                        "term": view.term,
                        "nodes_alive": view.nodes_alive(),
                    }),
                )
                .await
            }
            "/cluster/nodes" => {
                let view = self.view();
                http::respond_json(&mut stream, 200, &json!({ "count": view.members.len() }))
                    .await
            }
            "/cluster/logs" => {
                let body = self.logs_response(&request);
                http::respond_json(&mut stream, 200, &body).await
            }
            _ => http::respond_json(&mut stream, 404, &json!({"error": "not found"})).await,
        };

        if let Err(e) = result {
            debug!(error = %e, "failed to write admin response");
        }
    }

    /// Project the log tail as `{index, term, type}` records. Serves the
    /// local node when it is the one asked for (or when it is the leader
    /// and no node was named); other nodes' logs are not reachable from
    /// this process.
    fn logs_response(&self, request: &Request) -> serde_json::Value {
        let limit = request
            .query_param("limit")
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_LOG_TAIL);
        let wanted = request.query_param("node");

        let serve_local = match wanted {
            Some(id) => id == self.self_id,
            None => self.node.is_leader(),
        };
        if !serve_local {
            return json!([]);
        }

        let entries: Vec<serde_json::Value> = self
            .node
            .tail_entries(limit)
            .iter()
            .map(|e| {
                json!({
                    "index": e.index,
                    "term": e.term,
                    "type": e.command_kind(),
                })
            })
            .collect();
        json!(entries)
    }
}

/// One liveness probe: HTTP GET /health with a hard 300 ms budget.
async fn probe_health(addr: &str) -> bool {
    let attempt = async {
        let mut stream = TcpStream::connect(addr).await.ok()?;
        let request = format!("GET /health HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
        tokio::io::AsyncWriteExt::write_all(&mut stream, request.as_bytes())
            .await
            .ok()?;
        let mut buf = [0u8; 64];
        let n = tokio::io::AsyncReadExt::read(&mut stream, &mut buf)
            .await
            .ok()?;
        let head = String::from_utf8_lossy(&buf[..n]).to_string();
        Some(head.starts_with("HTTP/1.1 200") || head.starts_with("HTTP/1.0 200"))
    };

    matches!(timeout(PROBE_TIMEOUT, attempt).await, Ok(Some(true)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerSpec;
    use crate::raft::storage::MemoryLogStore;
    use tokio::sync::mpsc;

    fn coordinator_fixture() -> Arc<ClusterCoordinator> {
        let (tx, _rx) = mpsc::channel(8);
        let node = RaftNode::new(
            "1".to_string(),
            vec![
                PeerSpec {
                    id: "2".to_string(),
                    raft_addr: "127.0.0.1:18082".to_string(),
                    business_addr: "127.0.0.1:19002".to_string(),
                },
                PeerSpec {
                    id: "3".to_string(),
                    raft_addr: "127.0.0.1:18083".to_string(),
                    business_addr: "127.0.0.1:19003".to_string(),
                },
            ],
            Arc::new(MemoryLogStore::new()),
            tx,
        )
        .unwrap();
        ClusterCoordinator::new(node, "127.0.0.1:19001".to_string(), "127.0.0.1:0".to_string())
    }

    #[tokio::test]
    async fn reserved_prefixes_stay_local() {
        let coordinator = coordinator_fixture();
        assert_eq!(coordinator.route("/health"), RouteDecision::Local);
        assert_eq!(coordinator.route("/raft"), RouteDecision::Local);
    }

    #[tokio::test]
    async fn unknown_leader_is_unavailable() {
        let coordinator = coordinator_fixture();
        assert_eq!(coordinator.route("/api/orders"), RouteDecision::Unavailable);
    }

    #[tokio::test]
    async fn follower_redirects_to_known_leader() {
        let coordinator = coordinator_fixture();
        // Teach the node who leads via an AppendEntries from node 2.
        coordinator
            .node
            .handle_append_entries(&crate::raft::types::AppendEntriesArgs {
                term: 1,
                leader_id: "2".to_string(),
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![],
                leader_commit: 0,
            });

        assert_eq!(
            coordinator.route("/api/orders"),
            RouteDecision::Redirect("127.0.0.1:19002".to_string())
        );
    }

    #[tokio::test]
    async fn initial_view_counts_only_self_alive() {
        let coordinator = coordinator_fixture();
        let view = coordinator.view();
        assert_eq!(view.members.len(), 3);
        assert_eq!(view.nodes_alive(), 1);
    }

    #[tokio::test]
    async fn probe_fails_fast_against_dead_peer() {
        let started = std::time::Instant::now();
        assert!(!probe_health("127.0.0.1:1").await);
        assert!(started.elapsed() < std::time::Duration::from_secs(1));
    }
}
