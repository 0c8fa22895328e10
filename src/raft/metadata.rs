use std::collections::BTreeSet;

use crate::discovery::DiscoveryNode;
use crate::raft::cluster::ClusterConfiguration;

/// Per-term state of a node.
///
/// `current_term` and `voted_for` are persisted before any message that
/// depends on them leaves the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaftMetadata {
    pub current_term: u64,
    pub config: ClusterConfiguration,
    pub voted_for: Option<DiscoveryNode>,
    /// Members that granted their vote in the current election.
    pub votes: BTreeSet<DiscoveryNode>,
}

impl RaftMetadata {
    pub fn new(
        current_term: u64,
        config: ClusterConfiguration,
        voted_for: Option<DiscoveryNode>,
    ) -> Self {
        Self {
            current_term,
            config,
            voted_for,
            votes: BTreeSet::new(),
        }
    }

    pub fn votes_received(&self) -> u32 {
        self.votes.len() as u32
    }

    pub fn members(&self) -> BTreeSet<DiscoveryNode> {
        self.config.members()
    }

    pub fn members_without(&self, node: &DiscoveryNode) -> BTreeSet<DiscoveryNode> {
        self.config.members_without(node)
    }

    /// Moves to `term`. A new term forgets the vote and the tally.
    pub fn with_term(mut self, term: u64) -> Self {
        if term != self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.votes.clear();
        }
        self
    }

    pub fn with_vote_for(mut self, candidate: DiscoveryNode) -> Self {
        self.voted_for = Some(candidate);
        self
    }

    pub fn with_config(mut self, config: ClusterConfiguration) -> Self {
        self.config = config;
        self
    }

    pub fn inc_vote(mut self, voter: DiscoveryNode) -> Self {
        self.votes.insert(voter);
        self
    }

    /// Next term, no vote cast yet.
    pub fn for_new_election(self) -> Self {
        let term = self.current_term + 1;
        self.with_term(term)
    }

    pub fn for_follower(mut self) -> Self {
        self.votes.clear();
        self
    }

    /// Whether a vote for `candidate` in `term` is allowed.
    pub fn can_vote_for(&self, term: u64, candidate: &DiscoveryNode) -> bool {
        term == self.current_term
            && match &self.voted_for {
                None => true,
                Some(voted) => voted == candidate,
            }
    }

    pub fn has_majority(&self) -> bool {
        self.config.is_quorum(&self.votes)
    }
}
