//! Per-node runtime configuration.

use common::{NodeId, RaftError, RaftResult, ServerConfig};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How this server participates in the cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberKind {
    /// Full voting member: follower, candidate, or leader.
    Voting,
    /// Non-voting member that materializes committed entries and serves
    /// sequential reads when caught up.
    Passive,
    /// Standby that holds no log and rejects replication traffic.
    Reserve,
}

/// Configuration for one server in the cluster.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique identifier for this node.
    pub node_id: NodeId,

    /// Directory for log segments, snapshots, and metadata.
    pub data_dir: PathBuf,

    /// Address this node listens on (e.g., "127.0.0.1:5000").
    pub listen_addr: String,

    /// Addresses of voting peer nodes: (node_id, address) pairs.
    pub peers: Vec<(NodeId, String)>,

    /// Non-voting members replicated to but excluded from the commit
    /// quorum (passive and reserve servers).
    pub observers: Vec<(NodeId, String)>,

    /// How this server participates in replication.
    pub member_kind: MemberKind,

    /// Election timeout range in milliseconds.
    /// A random value within this range is used for each election.
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,

    /// Heartbeat interval in milliseconds.
    pub heartbeat_interval_ms: u64,

    /// Segment sizing for the replicated log, in bytes.
    pub segment_size: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            data_dir: PathBuf::from("./raft_data"),
            listen_addr: "127.0.0.1:5000".to_string(),
            peers: Vec::new(),
            observers: Vec::new(),
            member_kind: MemberKind::Voting,
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
            segment_size: 32 * 1024 * 1024,
        }
    }
}

impl NodeConfig {
    /// Create a new node configuration.
    pub fn new(node_id: NodeId, data_dir: PathBuf) -> Self {
        Self {
            node_id,
            data_dir,
            ..Default::default()
        }
    }

    /// Derive this node's configuration from the bootstrap config.
    pub fn from_server_config(config: &ServerConfig, node_id: NodeId) -> RaftResult<Self> {
        let member = config
            .cluster
            .members
            .iter()
            .find(|m| m.id == node_id)
            .ok_or_else(|| {
                RaftError::Config(format!("node {} is not in the cluster roster", node_id))
            })?;
        let peers = config
            .cluster
            .members
            .iter()
            .filter(|m| m.id != node_id)
            .map(|m| (m.id, m.address.clone()))
            .collect();

        Ok(Self {
            node_id,
            data_dir: config.data_dir.join(format!("node-{}", node_id)),
            listen_addr: member.address.clone(),
            peers,
            segment_size: config.segment_size(),
            ..Default::default()
        })
    }

    /// Set the listen address.
    pub fn with_listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.listen_addr = addr.into();
        self
    }

    /// Add a voting peer node.
    pub fn with_peer(mut self, node_id: NodeId, addr: impl Into<String>) -> Self {
        self.peers.push((node_id, addr.into()));
        self
    }

    /// Add a non-voting observer node.
    pub fn with_observer(mut self, node_id: NodeId, addr: impl Into<String>) -> Self {
        self.observers.push((node_id, addr.into()));
        self
    }

    /// Set how this server participates in replication.
    pub fn with_member_kind(mut self, kind: MemberKind) -> Self {
        self.member_kind = kind;
        self
    }

    /// Set election timeout range.
    pub fn with_election_timeout(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.election_timeout_min_ms = min_ms;
        self.election_timeout_max_ms = max_ms;
        self
    }

    /// Set heartbeat interval.
    pub fn with_heartbeat_interval(mut self, ms: u64) -> Self {
        self.heartbeat_interval_ms = ms;
        self
    }

    /// All member ids in the cluster, this node included.
    pub fn members(&self) -> Vec<NodeId> {
        let mut members: Vec<NodeId> = self.peers.iter().map(|(id, _)| *id).collect();
        members.extend(self.observers.iter().map(|(id, _)| *id));
        members.push(self.node_id);
        members.sort_unstable();
        members
    }

    /// Ids of voting peers.
    pub fn voting_peer_ids(&self) -> Vec<NodeId> {
        self.peers.iter().map(|(id, _)| *id).collect()
    }

    /// Ids of non-voting observers.
    pub fn observer_ids(&self) -> Vec<NodeId> {
        self.observers.iter().map(|(id, _)| *id).collect()
    }

    /// Path to the log segment directory.
    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("log")
    }

    /// Path to the snapshot directory.
    pub fn snapshot_dir(&self) -> PathBuf {
        self.data_dir.join("snapshots")
    }

    /// Path to the metadata file (term, vote).
    pub fn meta_path(&self) -> PathBuf {
        self.data_dir.join("meta.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{ClusterSection, MemberConfig};

    #[test]
    fn default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.node_id, 1);
        assert_eq!(config.member_kind, MemberKind::Voting);
        assert!(config.peers.is_empty());
        assert_eq!(config.members(), vec![1]);
    }

    #[test]
    fn builder_pattern() {
        let config = NodeConfig::new(42, PathBuf::from("/data"))
            .with_listen_addr("0.0.0.0:8080")
            .with_peer(2, "192.168.1.2:8080")
            .with_peer(3, "192.168.1.3:8080")
            .with_member_kind(MemberKind::Passive)
            .with_election_timeout(200, 400)
            .with_heartbeat_interval(100);

        assert_eq!(config.node_id, 42);
        assert_eq!(config.peers.len(), 2);
        assert_eq!(config.member_kind, MemberKind::Passive);
        assert_eq!(config.members(), vec![2, 3, 42]);
    }

    #[test]
    fn paths() {
        let config = NodeConfig::new(1, PathBuf::from("/var/raft"));
        assert_eq!(config.log_dir(), PathBuf::from("/var/raft/log"));
        assert_eq!(config.snapshot_dir(), PathBuf::from("/var/raft/snapshots"));
        assert_eq!(config.meta_path(), PathBuf::from("/var/raft/meta.json"));
    }

    #[test]
    fn derived_from_server_config() {
        let server = ServerConfig::builder()
            .cluster(ClusterSection {
                name: "atlas".into(),
                members: vec![
                    MemberConfig {
                        id: 1,
                        address: "127.0.0.1:5001".into(),
                    },
                    MemberConfig {
                        id: 2,
                        address: "127.0.0.1:5002".into(),
                    },
                ],
            })
            .build();

        let config = NodeConfig::from_server_config(&server, 2).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:5002");
        assert_eq!(config.peers, vec![(1, "127.0.0.1:5001".to_string())]);

        assert!(NodeConfig::from_server_config(&server, 9).is_err());
    }
}
