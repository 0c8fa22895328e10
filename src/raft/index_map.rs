use std::collections::{BTreeSet, HashMap};

use crate::discovery::DiscoveryNode;
use crate::raft::cluster::{majority_of, ClusterConfiguration};

/// Per-node log index used by the leader for `nextIndex` and `matchIndex`.
///
/// Nodes that were never written return the map's initial value.
#[derive(Debug, Clone)]
pub struct LogIndexMap {
    initial: u64,
    indexes: HashMap<DiscoveryNode, u64>,
}

impl LogIndexMap {
    pub fn new(initial: u64) -> Self {
        Self {
            initial,
            indexes: HashMap::new(),
        }
    }

    pub fn index_for(&self, node: &DiscoveryNode) -> u64 {
        self.indexes.get(node).copied().unwrap_or(self.initial)
    }

    pub fn put(&mut self, node: DiscoveryNode, index: u64) {
        self.indexes.insert(node, index);
    }

    /// Sets the index only if it moves forward.
    pub fn put_if_greater(&mut self, node: DiscoveryNode, index: u64) {
        let current = self.index_for(&node);
        if index > current {
            self.indexes.insert(node, index);
        }
    }

    /// Moves the index one step back, never below 1.
    pub fn decrement_for(&mut self, node: &DiscoveryNode) -> u64 {
        let next = self.index_for(node).saturating_sub(1).max(1);
        self.indexes.insert(node.clone(), next);
        next
    }

    /// Highest index held by a quorum of `config`.
    ///
    /// For a stable configuration this is the `majority`-th highest value
    /// among the members. A joint configuration takes the smaller of the
    /// two member sets' answers, since both must agree.
    pub fn consensus_for_index(&self, config: &ClusterConfiguration) -> u64 {
        match config {
            ClusterConfiguration::Stable { members } => self.consensus_for(members),
            ClusterConfiguration::Joint { old, new } => {
                self.consensus_for(old).min(self.consensus_for(new))
            }
        }
    }

    fn consensus_for(&self, members: &BTreeSet<DiscoveryNode>) -> u64 {
        if members.is_empty() {
            return 0;
        }
        let mut indexes: Vec<u64> = members.iter().map(|m| self.index_for(m)).collect();
        indexes.sort_unstable_by(|a, b| b.cmp(a));
        indexes[majority_of(members.len()) - 1]
    }
}
