//! Node configuration.
//!
//! Everything a node needs comes from the environment:
//!
//! | Variable | Meaning | Default |
//! |----------|---------|---------|
//! | `NODE_ID` | Unique node id | `1` |
//! | `RAFT_PEERS` | `id=host:port` pairs, comma separated, self included | derived |
//! | `RAFT_BUSINESS_PEERS` | `id=host:port` business addresses | derived |
//! | `PORT` | Business HTTP port of this node | derived |
//! | `RAFT_STORAGE_DIR` | Base directory for persistent state | `raft-data` |
//! | `RAFT_DERIVE_PORTS` | Fill missing addresses from the node digit | `1` |
//!
//! With `derive_ports` on (the reference deployment's convention), node `N`
//! listens for Raft traffic on `808N`, its coordinator on `809N`, and its
//! business server on `raft_port + 920`. Explicit configuration always wins
//! over the arithmetic.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::constants::{
    BUSINESS_PORT_OFFSET, COORDINATOR_PORT_BASE, DEFAULT_PERFORM_TIMEOUT, RAFT_PORT_BASE,
};
use crate::error::{Error, Result};

/// Address book entry for one cluster member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSpec {
    pub id: String,
    /// `host:port` of the member's Raft RPC listener.
    pub raft_addr: String,
    /// `host:port` of the member's business HTTP server.
    pub business_addr: String,
}

/// Full configuration of one node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// This node's id. Must appear in `peers`.
    pub node_id: String,
    /// Every cluster member, self included.
    pub peers: Vec<PeerSpec>,
    /// Listen address of the local business HTTP server.
    pub business_addr: String,
    /// Listen address of the local coordinator admin server.
    pub coordinator_addr: String,
    /// Base directory for persisted Raft state.
    pub storage_dir: PathBuf,
    /// Whether missing addresses are derived from the node digit.
    pub derive_ports: bool,
    /// Budget for `perform` to wait for a submitted command to apply.
    pub perform_timeout: Duration,
}

impl NodeConfig {
    /// Load the configuration from the environment.
    pub fn from_env() -> Result<Self> {
        let node_id = env_or("NODE_ID", "1");
        let derive_ports = env_or("RAFT_DERIVE_PORTS", "1") != "0";

        let mut raft_addrs = parse_peer_map(&std::env::var("RAFT_PEERS").unwrap_or_default())?;
        let business_addrs =
            parse_peer_map(&std::env::var("RAFT_BUSINESS_PEERS").unwrap_or_default())?;

        if raft_addrs.is_empty() {
            if !derive_ports {
                return Err(Error::Config(
                    "RAFT_PEERS is empty and port derivation is disabled".to_string(),
                ));
            }
            raft_addrs.insert(node_id.clone(), derived_raft_addr(&node_id)?);
        }

        let mut peers = Vec::with_capacity(raft_addrs.len());
        for (id, raft_addr) in &raft_addrs {
            let business_addr = match business_addrs.get(id) {
                Some(addr) => addr.clone(),
                None if derive_ports => derive_business_addr(raft_addr)?,
                None => {
                    return Err(Error::Config(format!(
                        "no business address for node {id} and port derivation is disabled"
                    )));
                }
            };
            peers.push(PeerSpec {
                id: id.clone(),
                raft_addr: raft_addr.clone(),
                business_addr,
            });
        }

        let business_addr = match std::env::var("PORT") {
            Ok(port) => format!("0.0.0.0:{}", port.trim_start_matches(':')),
            Err(_) => {
                let own = peers
                    .iter()
                    .find(|p| p.id == node_id)
                    .map(|p| p.business_addr.clone())
                    .ok_or_else(|| {
                        Error::Config(format!("node {node_id} missing from RAFT_PEERS"))
                    })?;
                let port = addr_port(&own)?;
                format!("0.0.0.0:{port}")
            }
        };

        let coordinator_addr = match std::env::var("RAFT_COORDINATOR_ADDR") {
            Ok(addr) => addr,
            Err(_) if derive_ports => {
                format!("0.0.0.0:{}", derived_coordinator_port(&node_id)?)
            }
            Err(_) => {
                return Err(Error::Config(
                    "RAFT_COORDINATOR_ADDR not set and port derivation is disabled".to_string(),
                ));
            }
        };

        let storage_dir =
            PathBuf::from(env_or("RAFT_STORAGE_DIR", "raft-data"));

        let config = Self {
            node_id,
            peers,
            business_addr,
            coordinator_addr,
            storage_dir,
            derive_ports,
            perform_timeout: DEFAULT_PERFORM_TIMEOUT,
        };
        config.validate().map_err(|problems| {
            Error::Config(format!("invalid configuration: {}", problems.join("; ")))
        })?;
        Ok(config)
    }

    /// Check the configuration for internal consistency, collecting every
    /// problem instead of stopping at the first.
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut problems = Vec::new();

        if self.node_id.is_empty() {
            problems.push("node id must not be empty".to_string());
        }
        if !self.peers.iter().any(|p| p.id == self.node_id) {
            problems.push(format!(
                "node id {} does not appear in the peer list",
                self.node_id
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for peer in &self.peers {
            if !seen.insert(&peer.id) {
                problems.push(format!("duplicate peer id {}", peer.id));
            }
            if peer.raft_addr.split(':').count() != 2 {
                problems.push(format!(
                    "peer {} has malformed raft address {:?}",
                    peer.id, peer.raft_addr
                ));
            }
        }
        if self.perform_timeout.is_zero() {
            problems.push("perform timeout must be positive".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }

    /// Members other than this node.
    pub fn remote_peers(&self) -> Vec<PeerSpec> {
        self.peers
            .iter()
            .filter(|p| p.id != self.node_id)
            .cloned()
            .collect()
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// Parse `id=host:port,id=host:port` into an ordered map.
fn parse_peer_map(raw: &str) -> Result<BTreeMap<String, String>> {
    let mut map = BTreeMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (id, addr) = pair.split_once('=').ok_or_else(|| {
            Error::Config(format!("peer entry {pair:?} is not of the form id=host:port"))
        })?;
        let (id, addr) = (id.trim(), addr.trim());
        if id.is_empty() || addr.is_empty() {
            return Err(Error::Config(format!("peer entry {pair:?} has an empty side")));
        }
        map.insert(id.to_string(), addr.to_string());
    }
    Ok(map)
}

fn addr_port(addr: &str) -> Result<u16> {
    let (_, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| Error::Config(format!("address {addr:?} has no port")))?;
    port.parse()
        .map_err(|_| Error::Config(format!("address {addr:?} has a non-numeric port")))
}

fn node_digit(node_id: &str) -> Result<u16> {
    let digit = node_id
        .chars()
        .last()
        .and_then(|c| c.to_digit(10))
        .ok_or_else(|| {
            Error::Config(format!(
                "cannot derive ports from node id {node_id:?}; configure addresses explicitly"
            ))
        })?;
    Ok(digit as u16)
}

fn derived_raft_addr(node_id: &str) -> Result<String> {
    Ok(format!("127.0.0.1:{}", RAFT_PORT_BASE + node_digit(node_id)?))
}

fn derived_coordinator_port(node_id: &str) -> Result<u16> {
    Ok(COORDINATOR_PORT_BASE + node_digit(node_id)?)
}

/// The reference deployment places a node's business server at
/// `raft_port + 920` on the same host.
fn derive_business_addr(raft_addr: &str) -> Result<String> {
    let (host, _) = raft_addr
        .rsplit_once(':')
        .ok_or_else(|| Error::Config(format!("address {raft_addr:?} has no port")))?;
    let port = addr_port(raft_addr)?;
    Ok(format!("{host}:{}", port + BUSINESS_PORT_OFFSET))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> NodeConfig {
        NodeConfig {
            node_id: "1".to_string(),
            peers: vec![
                PeerSpec {
                    id: "1".to_string(),
                    raft_addr: "127.0.0.1:8081".to_string(),
                    business_addr: "127.0.0.1:9001".to_string(),
                },
                PeerSpec {
                    id: "2".to_string(),
                    raft_addr: "127.0.0.1:8082".to_string(),
                    business_addr: "127.0.0.1:9002".to_string(),
                },
            ],
            business_addr: "0.0.0.0:9001".to_string(),
            coordinator_addr: "0.0.0.0:8091".to_string(),
            storage_dir: PathBuf::from("raft-data"),
            derive_ports: true,
            perform_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(sample_config().validate().is_ok());
    }

    #[test]
    fn missing_self_is_rejected() {
        let mut config = sample_config();
        config.node_id = "7".to_string();
        let problems = config.validate().unwrap_err();
        assert!(problems.iter().any(|p| p.contains("does not appear")));
    }

    #[test]
    fn duplicate_peers_are_rejected() {
        let mut config = sample_config();
        let dup = config.peers[0].clone();
        config.peers.push(dup);
        let problems = config.validate().unwrap_err();
        assert!(problems.iter().any(|p| p.contains("duplicate")));
    }

    #[test]
    fn peer_map_parses_pairs() {
        let map = parse_peer_map("1=127.0.0.1:8081, 2=127.0.0.1:8082,3=10.0.0.3:8083").unwrap();
        assert_eq!(map.len(), 3);
        assert_eq!(map["2"], "127.0.0.1:8082");
    }

    #[test]
    fn peer_map_rejects_malformed_pairs() {
        assert!(parse_peer_map("1:8081").is_err());
        assert!(parse_peer_map("=127.0.0.1:8081").is_err());
    }

    #[test]
    fn empty_peer_map_is_empty() {
        assert!(parse_peer_map("").unwrap().is_empty());
    }

    #[test]
    fn business_addr_derivation_adds_offset() {
        assert_eq!(
            derive_business_addr("127.0.0.1:8081").unwrap(),
            "127.0.0.1:9001"
        );
    }

    #[test]
    fn coordinator_port_uses_last_digit() {
        assert_eq!(derived_coordinator_port("1").unwrap(), 8091);
        assert_eq!(derived_coordinator_port("node-3").unwrap(), 8093);
        assert!(derived_coordinator_port("alpha").is_err());
    }

    #[test]
    fn remote_peers_exclude_self() {
        let config = sample_config();
        let remotes = config.remote_peers();
        assert_eq!(remotes.len(), 1);
        assert_eq!(remotes[0].id, "2");
    }
}
