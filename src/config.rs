use std::path::PathBuf;
use std::time::Duration;

use crate::discovery::DiscoveryNode;

/// Timing and sizing knobs for the consensus engine.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Start as the single member of a new cluster when the log is empty.
    pub bootstrap: bool,
    /// Base election timeout. The actual timeout is randomized between
    /// this value and 1.5x this value.
    pub election_deadline_ms: u64,
    /// Leader heartbeat period. Also the minimum gap between two
    /// replication sends to the same follower while a response is pending.
    pub heartbeat_interval_ms: u64,
    /// Number of committed-but-not-compacted entries that triggers a
    /// snapshot. Zero disables snapshotting.
    pub snapshot_interval: u64,
    /// Maximum number of entries in one `AppendEntries` batch.
    pub max_entries: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            bootstrap: false,
            election_deadline_ms: 300,
            heartbeat_interval_ms: 50,
            snapshot_interval: 1000,
            max_entries: 100,
        }
    }
}

impl RaftConfig {
    pub fn election_deadline(&self) -> Duration {
        Duration::from_millis(self.election_deadline_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// This node's identity.
    pub node: DiscoveryNode,
    /// Peers contacted with `AddServer` while this node is not yet a member.
    pub discovery: Vec<DiscoveryNode>,
    pub raft: RaftConfig,
    /// Directory for term, vote, log and snapshot files. `None` keeps
    /// everything in memory.
    pub data_dir: Option<PathBuf>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::new(DiscoveryNode::new("127.0.0.1", 7000))
    }
}

impl NodeConfig {
    pub fn new(node: DiscoveryNode) -> Self {
        Self {
            node,
            discovery: Vec::new(),
            raft: RaftConfig::default(),
            data_dir: None,
        }
    }

    pub fn with_peer(mut self, peer: DiscoveryNode) -> Self {
        if peer != self.node && !self.discovery.contains(&peer) {
            self.discovery.push(peer);
        }
        self
    }

    pub fn with_bootstrap(mut self, bootstrap: bool) -> Self {
        self.raft.bootstrap = bootstrap;
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    pub fn with_raft(mut self, raft: RaftConfig) -> Self {
        self.raft = raft;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raft_config_default() {
        let cfg = RaftConfig::default();
        assert!(!cfg.bootstrap);
        assert_eq!(cfg.election_deadline(), Duration::from_millis(300));
        assert_eq!(cfg.heartbeat_interval(), Duration::from_millis(50));
        assert_eq!(cfg.snapshot_interval, 1000);
        assert_eq!(cfg.max_entries, 100);
    }

    #[test]
    fn node_config_default() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.node.to_string(), "127.0.0.1:7000");
        assert!(cfg.discovery.is_empty());
        assert!(cfg.data_dir.is_none());
    }

    #[test]
    fn node_config_with_peer_skips_self_and_duplicates() {
        let me = DiscoveryNode::new("127.0.0.1", 7001);
        let peer = DiscoveryNode::new("127.0.0.1", 7002);
        let cfg = NodeConfig::new(me.clone())
            .with_peer(me)
            .with_peer(peer.clone())
            .with_peer(peer.clone());
        assert_eq!(cfg.discovery, vec![peer]);
    }

    #[test]
    fn node_config_builders() {
        let cfg = NodeConfig::default()
            .with_bootstrap(true)
            .with_data_dir("/var/lib/raft");
        assert!(cfg.raft.bootstrap);
        assert_eq!(cfg.data_dir, Some(PathBuf::from("/var/lib/raft")));
    }
}
