//! Environment-driven configuration loading.
//!
//! Environment variables are process-global, so these tests serialize on a
//! shared mutex and reset every variable they touch.

use std::sync::Mutex;
use std::time::Duration;

use barkeep::config::NodeConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

const VARS: &[&str] = &[
    "NODE_ID",
    "RAFT_PEERS",
    "RAFT_BUSINESS_PEERS",
    "PORT",
    "RAFT_STORAGE_DIR",
    "RAFT_DERIVE_PORTS",
    "RAFT_COORDINATOR_ADDR",
];

fn with_env(vars: &[(&str, &str)], check: impl FnOnce()) {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    for var in VARS {
        std::env::remove_var(var);
    }
    for (key, value) in vars {
        std::env::set_var(key, value);
    }
    check();
    for var in VARS {
        std::env::remove_var(var);
    }
}

#[test]
fn defaults_to_node_one_with_derived_ports() {
    with_env(&[], || {
        let config = NodeConfig::from_env().unwrap();
        assert_eq!(config.node_id, "1");
        assert!(config.derive_ports);
        assert_eq!(config.peers.len(), 1);
        assert_eq!(config.peers[0].raft_addr, "127.0.0.1:8081");
        assert_eq!(config.peers[0].business_addr, "127.0.0.1:9001");
        assert_eq!(config.coordinator_addr, "0.0.0.0:8091");
        assert_eq!(config.perform_timeout, Duration::from_secs(5));
    });
}

#[test]
fn parses_explicit_peer_map() {
    with_env(
        &[
            ("NODE_ID", "2"),
            (
                "RAFT_PEERS",
                "1=10.0.0.1:8081,2=10.0.0.2:8082,3=10.0.0.3:8083",
            ),
        ],
        || {
            let config = NodeConfig::from_env().unwrap();
            assert_eq!(config.peers.len(), 3);
            let me = config.peers.iter().find(|p| p.id == "2").unwrap();
            assert_eq!(me.raft_addr, "10.0.0.2:8082");
            // Derived business port is raft port + 920.
            assert_eq!(me.business_addr, "10.0.0.2:9002");
            assert_eq!(config.business_addr, "0.0.0.0:9002");
            assert_eq!(config.remote_peers().len(), 2);
        },
    );
}

#[test]
fn explicit_business_addresses_win_over_arithmetic() {
    with_env(
        &[
            ("NODE_ID", "1"),
            ("RAFT_PEERS", "1=10.0.0.1:8081,2=10.0.0.2:8082"),
            (
                "RAFT_BUSINESS_PEERS",
                "1=svc-a.internal:80,2=svc-b.internal:80",
            ),
            ("PORT", "3000"),
        ],
        || {
            let config = NodeConfig::from_env().unwrap();
            let me = config.peers.iter().find(|p| p.id == "1").unwrap();
            assert_eq!(me.business_addr, "svc-a.internal:80");
            assert_eq!(config.business_addr, "0.0.0.0:3000");
        },
    );
}

#[test]
fn storage_dir_comes_from_env() {
    with_env(&[("RAFT_STORAGE_DIR", "/var/lib/barkeep")], || {
        let config = NodeConfig::from_env().unwrap();
        assert_eq!(
            config.storage_dir,
            std::path::PathBuf::from("/var/lib/barkeep")
        );
    });
}

#[test]
fn derivation_can_be_disabled() {
    with_env(
        &[("RAFT_DERIVE_PORTS", "0"), ("NODE_ID", "1")],
        || {
            // Without addresses and without derivation there is no cluster.
            assert!(NodeConfig::from_env().is_err());
        },
    );
}

#[test]
fn missing_business_map_fails_when_derivation_disabled() {
    with_env(
        &[
            ("RAFT_DERIVE_PORTS", "0"),
            ("NODE_ID", "1"),
            ("RAFT_PEERS", "1=10.0.0.1:8081"),
            ("PORT", "3000"),
        ],
        || {
            assert!(NodeConfig::from_env().is_err());
        },
    );
}

#[test]
fn node_absent_from_peer_map_is_rejected() {
    with_env(
        &[
            ("NODE_ID", "9"),
            ("RAFT_PEERS", "1=10.0.0.1:8081,2=10.0.0.2:8082"),
            ("PORT", "3000"),
        ],
        || {
            let err = NodeConfig::from_env().unwrap_err();
            assert!(err.to_string().contains("configuration"));
        },
    );
}

#[test]
fn malformed_peer_entry_is_rejected() {
    with_env(&[("RAFT_PEERS", "1at10.0.0.1:8081")], || {
        assert!(NodeConfig::from_env().is_err());
    });
}
