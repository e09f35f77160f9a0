//! End-to-end cluster scenarios over loopback TCP.
//!
//! Each test stands up real nodes with the real transport on ephemeral
//! ports. Time bounds are generous multiples of the protocol constants so
//! the tests stay meaningful under CI load.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;

use barkeep::config::PeerSpec;
use barkeep::constants::APPLY_CHANNEL_CAPACITY;
use barkeep::domain::{Ingredient, OrderItem};
use barkeep::raft::{
    storage::FileLogStore, Command, LogStore, MemoryLogStore, RaftNode, RaftRpcServer,
};
use barkeep::service::{InMemoryBackend, ReplicatedCommerce};

const LEADER_WAIT: Duration = Duration::from_secs(5);
const APPLY_WAIT: Duration = Duration::from_secs(5);

struct TestNode {
    node: Arc<RaftNode>,
    commerce: Arc<ReplicatedCommerce>,
    backend: Arc<InMemoryBackend>,
}

struct TestCluster {
    specs: Vec<PeerSpec>,
    nodes: Vec<TestNode>,
    storage_root: Option<tempfile::TempDir>,
}

impl TestCluster {
    /// Bind listeners first so every node knows every address, then start
    /// all members.
    async fn start(size: usize, durable: bool) -> Self {
        let mut listeners = Vec::with_capacity(size);
        for _ in 0..size {
            listeners.push(TcpListener::bind("127.0.0.1:0").await.unwrap());
        }
        let specs: Vec<PeerSpec> = listeners
            .iter()
            .enumerate()
            .map(|(i, listener)| PeerSpec {
                id: (i + 1).to_string(),
                raft_addr: listener.local_addr().unwrap().to_string(),
                business_addr: String::new(),
            })
            .collect();

        let storage_root = durable.then(|| tempfile::tempdir().unwrap());

        let mut nodes = Vec::with_capacity(size);
        for (i, listener) in listeners.into_iter().enumerate() {
            let id = specs[i].id.clone();
            let store = make_store(&storage_root, &id);
            nodes.push(start_member(id, specs.clone(), store, listener).await);
        }

        Self {
            specs,
            nodes,
            storage_root,
        }
    }

    async fn leader_index(&self) -> usize {
        let deadline = tokio::time::Instant::now() + LEADER_WAIT;
        loop {
            for (i, member) in self.nodes.iter().enumerate() {
                if member.node.is_leader() {
                    return i;
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "no leader elected within {LEADER_WAIT:?}"
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    async fn wait_applied(&self, member: usize, index: u64) {
        let deadline = tokio::time::Instant::now() + APPLY_WAIT;
        loop {
            if self.nodes[member].node.status().last_applied >= index {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "node {} never applied index {index}",
                member + 1
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    fn shutdown(&self) {
        for member in &self.nodes {
            member.node.shutdown();
        }
    }
}

fn make_store(root: &Option<tempfile::TempDir>, id: &str) -> Arc<dyn LogStore> {
    match root {
        Some(dir) => Arc::new(FileLogStore::open(dir.path(), id).unwrap()),
        None => Arc::new(MemoryLogStore::new()),
    }
}

async fn start_member(
    id: String,
    specs: Vec<PeerSpec>,
    store: Arc<dyn LogStore>,
    listener: TcpListener,
) -> TestNode {
    let (apply_tx, apply_rx) = mpsc::channel(APPLY_CHANNEL_CAPACITY);
    let node = RaftNode::new(id, specs, store, apply_tx).unwrap();
    node.start();
    RaftRpcServer::from_listener(Arc::clone(&node), listener).spawn();

    let backend = Arc::new(InMemoryBackend::new());
    let commerce = ReplicatedCommerce::new(
        Arc::clone(&node),
        Arc::clone(&backend) as Arc<dyn barkeep::service::CommerceBackend>,
        Duration::from_secs(5),
    );
    commerce.start(apply_rx);

    TestNode {
        node,
        commerce,
        backend,
    }
}

fn sample_items() -> Vec<OrderItem> {
    vec![OrderItem {
        product_id: 1,
        quantity: 2,
        price: 8.99,
    }]
}

fn ingredient(name: &str) -> Ingredient {
    Ingredient {
        id: 0,
        merchant_id: 1,
        name: name.to_string(),
        quantity: 10.0,
        unit: "pcs".to_string(),
        low_stock_threshold: 2.0,
        description: String::new(),
    }
}

// ============================================================================
// Bootstrap and single commit
// ============================================================================

#[tokio::test]
async fn three_node_bootstrap_commits_an_order() {
    let cluster = TestCluster::start(3, false).await;
    let leader = cluster.leader_index().await;

    // Exactly one leader, at a positive term.
    let leaders = cluster
        .nodes
        .iter()
        .filter(|m| m.node.is_leader())
        .count();
    assert_eq!(leaders, 1);
    assert!(cluster.nodes[leader].node.status().term >= 1);

    let order = cluster.nodes[leader]
        .commerce
        .create_order(1, 1, sample_items(), "x".to_string())
        .await
        .expect("order should commit");
    assert_eq!(order.customer_id, 1);
    assert!((order.total_amount - 17.98).abs() < 1e-9);

    // Every node applies the entry; the log records the command type.
    for i in 0..3 {
        cluster.wait_applied(i, 1).await;
    }
    let tail = cluster.nodes[leader].node.tail_entries(1);
    assert_eq!(tail[0].command_kind(), "create_order");

    // Only the leader's backend executed the side effect.
    assert_eq!(cluster.nodes[leader].backend.order_count(), 1);
    let followers_with_orders = cluster
        .nodes
        .iter()
        .enumerate()
        .filter(|(i, m)| *i != leader && m.backend.order_count() > 0)
        .count();
    assert_eq!(followers_with_orders, 0);

    cluster.shutdown();
}

// ============================================================================
// Follower catch-up
// ============================================================================

#[tokio::test]
async fn restarted_follower_catches_up() {
    let cluster = TestCluster::start(3, true).await;
    let leader = cluster.leader_index().await;

    // Take one follower down.
    let follower = (0..3).find(|i| *i != leader).unwrap();
    let follower_addr = cluster.specs[follower].raft_addr.clone();
    cluster.nodes[follower].node.shutdown();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Commit ten commands while it is away.
    for i in 0..10 {
        cluster.nodes[leader]
            .commerce
            .create_ingredient(ingredient(&format!("item-{i}")))
            .await
            .expect("majority of two out of three should commit");
    }
    let leader_status = cluster.nodes[leader].node.status();
    assert!(leader_status.commit_index >= 10);

    // Bring the follower back on the same address and storage.
    let store = make_store(&cluster.storage_root, &cluster.specs[follower].id);
    let listener = TcpListener::bind(&follower_addr).await.unwrap();
    let revived = start_member(
        cluster.specs[follower].id.clone(),
        cluster.specs.clone(),
        store,
        listener,
    )
    .await;

    let deadline = tokio::time::Instant::now() + APPLY_WAIT;
    loop {
        let status = revived.node.status();
        if status.last_applied >= leader_status.commit_index {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "follower never caught up: {} < {}",
            status.last_applied,
            leader_status.commit_index
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    // Logs agree entry by entry.
    let leader_tail = cluster.nodes[leader].node.tail_entries(20);
    let follower_tail = revived.node.tail_entries(20);
    assert_eq!(leader_tail.len(), follower_tail.len());
    for (a, b) in leader_tail.iter().zip(follower_tail.iter()) {
        assert_eq!(a.index, b.index);
        assert_eq!(a.term, b.term);
    }

    revived.node.shutdown();
    cluster.shutdown();
}

// ============================================================================
// Leader failover
// ============================================================================

#[tokio::test]
async fn surviving_majority_elects_a_new_leader() {
    let cluster = TestCluster::start(3, false).await;
    let first_leader = cluster.leader_index().await;
    let first_term = cluster.nodes[first_leader].node.status().term;

    // Commit one entry, then crash the leader.
    cluster.nodes[first_leader]
        .commerce
        .create_ingredient(ingredient("before-crash"))
        .await
        .unwrap();
    cluster.nodes[first_leader].node.shutdown();

    // One of the survivors takes over in a strictly higher term.
    let deadline = tokio::time::Instant::now() + LEADER_WAIT;
    let new_leader = loop {
        if let Some(i) = (0..3)
            .filter(|i| *i != first_leader)
            .find(|i| cluster.nodes[*i].node.is_leader())
        {
            break i;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "no failover within {LEADER_WAIT:?}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    };
    let new_status = cluster.nodes[new_leader].node.status();
    assert!(new_status.term > first_term);

    // The committed entry survived, and new writes commit.
    let tail = cluster.nodes[new_leader].node.tail_entries(10);
    assert!(tail.iter().any(|e| e.index == 1));
    cluster.nodes[new_leader]
        .commerce
        .create_ingredient(ingredient("after-crash"))
        .await
        .expect("new leader should commit");

    cluster.shutdown();
}

// ============================================================================
// Boundary: single-node cluster
// ============================================================================

#[tokio::test]
async fn single_node_cluster_commits_immediately() {
    let cluster = TestCluster::start(1, false).await;
    let leader = cluster.leader_index().await;

    let order = cluster.nodes[leader]
        .commerce
        .create_order(1, 1, sample_items(), String::new())
        .await
        .unwrap();
    assert_eq!(order.id, 1);
    assert_eq!(cluster.nodes[leader].node.status().commit_index, 1);

    cluster.shutdown();
}

// ============================================================================
// Boundary: replication in MAX_BATCH chunks
// ============================================================================

#[tokio::test]
async fn backlog_larger_than_one_batch_replicates_fully() {
    let cluster = TestCluster::start(3, false).await;
    let leader = cluster.leader_index().await;

    // Append well past one batch without waiting per entry.
    let total = 150u64;
    for i in 0..total {
        cluster.nodes[leader]
            .node
            .submit(Command::CreateIngredient {
                ingredient: ingredient(&format!("bulk-{i}")),
            })
            .unwrap();
    }

    for i in 0..3 {
        cluster.wait_applied(i, total).await;
    }
    for member in &cluster.nodes {
        assert_eq!(member.node.status().last_applied, total);
    }

    cluster.shutdown();
}

// ============================================================================
// Submit on a follower
// ============================================================================

#[tokio::test]
async fn follower_rejects_direct_submit_with_leader_hint() {
    let cluster = TestCluster::start(3, false).await;
    let leader = cluster.leader_index().await;
    let follower = (0..3).find(|i| *i != leader).unwrap();

    // The follower learns the leader through heartbeats.
    let deadline = tokio::time::Instant::now() + LEADER_WAIT;
    while cluster.nodes[follower].node.leader_id().is_none() {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    let err = cluster.nodes[follower]
        .node
        .submit(Command::DeleteIngredient { ingredient_id: 1 })
        .unwrap_err();
    assert!(err.is_not_leader());

    cluster.shutdown();
}

// ============================================================================
// Restart durability
// ============================================================================

#[tokio::test]
async fn state_survives_full_restart() {
    let storage = tempfile::tempdir().unwrap();
    let storage_path: PathBuf = storage.path().to_path_buf();

    let committed = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let spec = PeerSpec {
            id: "1".to_string(),
            raft_addr: listener.local_addr().unwrap().to_string(),
            business_addr: String::new(),
        };
        let store: Arc<dyn LogStore> =
            Arc::new(FileLogStore::open(&storage_path, "1").unwrap());
        let member = start_member("1".to_string(), vec![spec], store, listener).await;

        let deadline = tokio::time::Instant::now() + LEADER_WAIT;
        while !member.node.is_leader() {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        member
            .commerce
            .create_ingredient(ingredient("durable"))
            .await
            .unwrap();
        let status = member.node.status();
        member.node.shutdown();
        tokio::time::sleep(Duration::from_millis(100)).await;
        status
    };

    // A new process over the same directory sees the same history.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let spec = PeerSpec {
        id: "1".to_string(),
        raft_addr: listener.local_addr().unwrap().to_string(),
        business_addr: String::new(),
    };
    let store: Arc<dyn LogStore> = Arc::new(FileLogStore::open(&storage_path, "1").unwrap());
    let member = start_member("1".to_string(), vec![spec], store, listener).await;

    let status = member.node.status();
    assert!(status.term >= committed.term);
    assert_eq!(status.last_applied, committed.last_applied);
    let tail = member.node.tail_entries(10);
    assert_eq!(tail.last().unwrap().command_kind(), "create_ingredient");

    member.node.shutdown();
}
