use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::discovery::DiscoveryNode;

/// Number of votes that constitutes a majority of `n` members.
pub fn majority_of(n: usize) -> usize {
    n / 2 + 1
}

/// Cluster membership.
///
/// While `Joint`, every decision (election, commit) needs a majority in
/// both `old` and `new` independently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterConfiguration {
    Stable {
        members: BTreeSet<DiscoveryNode>,
    },
    Joint {
        old: BTreeSet<DiscoveryNode>,
        new: BTreeSet<DiscoveryNode>,
    },
}

impl Default for ClusterConfiguration {
    fn default() -> Self {
        Self::Stable {
            members: BTreeSet::new(),
        }
    }
}

impl ClusterConfiguration {
    pub fn stable<I: IntoIterator<Item = DiscoveryNode>>(members: I) -> Self {
        Self::Stable {
            members: members.into_iter().collect(),
        }
    }

    /// Every node that takes part in decisions: the union while joint.
    pub fn members(&self) -> BTreeSet<DiscoveryNode> {
        match self {
            Self::Stable { members } => members.clone(),
            Self::Joint { old, new } => old.union(new).cloned().collect(),
        }
    }

    pub fn members_without(&self, node: &DiscoveryNode) -> BTreeSet<DiscoveryNode> {
        let mut members = self.members();
        members.remove(node);
        members
    }

    pub fn is_transitioning(&self) -> bool {
        matches!(self, Self::Joint { .. })
    }

    /// Joint configuration moving from the current member set to `new`.
    pub fn transition_to(&self, new: BTreeSet<DiscoveryNode>) -> Self {
        Self::Joint {
            old: self.members(),
            new,
        }
    }

    /// Stable configuration that a joint configuration finalizes to.
    pub fn transition_to_stable(&self) -> Self {
        match self {
            Self::Stable { .. } => self.clone(),
            Self::Joint { new, .. } => Self::Stable {
                members: new.clone(),
            },
        }
    }

    /// Whether `node` stays a member once this configuration is final.
    pub fn contains_on_new_state(&self, node: &DiscoveryNode) -> bool {
        match self {
            Self::Stable { members } => members.contains(node),
            Self::Joint { new, .. } => new.contains(node),
        }
    }

    /// Whether `voters` form a quorum under this configuration.
    pub fn is_quorum(&self, voters: &BTreeSet<DiscoveryNode>) -> bool {
        match self {
            Self::Stable { members } => has_majority(members, voters),
            Self::Joint { old, new } => has_majority(old, voters) && has_majority(new, voters),
        }
    }
}

fn has_majority(members: &BTreeSet<DiscoveryNode>, voters: &BTreeSet<DiscoveryNode>) -> bool {
    if members.is_empty() {
        return false;
    }
    members.intersection(voters).count() >= majority_of(members.len())
}

impl fmt::Display for ClusterConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn list(set: &BTreeSet<DiscoveryNode>) -> String {
            set.iter()
                .map(|n| n.to_string())
                .collect::<Vec<_>>()
                .join(",")
        }
        match self {
            Self::Stable { members } => write!(f, "stable[{}]", list(members)),
            Self::Joint { old, new } => write!(f, "joint[{}]->[{}]", list(old), list(new)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn n(port: u16) -> DiscoveryNode {
        DiscoveryNode::new("127.0.0.1", port)
    }

    fn set(ports: &[u16]) -> BTreeSet<DiscoveryNode> {
        ports.iter().map(|&p| n(p)).collect()
    }

    #[test]
    fn test_majority_of() {
        assert_eq!(majority_of(1), 1);
        assert_eq!(majority_of(2), 2);
        assert_eq!(majority_of(3), 2);
        assert_eq!(majority_of(4), 3);
        assert_eq!(majority_of(5), 3);
    }

    #[test]
    fn test_stable_quorum() {
        let cfg = ClusterConfiguration::stable(set(&[1, 2, 3]));
        assert!(!cfg.is_quorum(&set(&[1])));
        assert!(cfg.is_quorum(&set(&[1, 3])));
        // Votes from non-members don't count
        assert!(!cfg.is_quorum(&set(&[1, 7, 8])));
    }

    #[test]
    fn test_empty_configuration_has_no_quorum() {
        let cfg = ClusterConfiguration::default();
        assert!(!cfg.is_quorum(&set(&[1])));
        assert!(cfg.members().is_empty());
    }

    #[test]
    fn test_joint_quorum_needs_both_sets() {
        // A,B,C = 1,2,3 and A,B,D = 1,2,4
        let cfg = ClusterConfiguration::stable(set(&[1, 2, 3])).transition_to(set(&[1, 2, 4]));
        assert!(cfg.is_transitioning());
        assert_eq!(cfg.members(), set(&[1, 2, 3, 4]));

        // majority of old only
        assert!(!cfg.is_quorum(&set(&[1, 3])));
        // majority of new only
        assert!(!cfg.is_quorum(&set(&[1, 4])));
        // majority of both
        assert!(cfg.is_quorum(&set(&[1, 2])));
        assert!(cfg.is_quorum(&set(&[2, 3, 4])));
    }

    #[test]
    fn test_transition_to_stable() {
        let joint = ClusterConfiguration::stable(set(&[1, 2])).transition_to(set(&[2, 3]));
        let stable = joint.transition_to_stable();
        assert_eq!(stable, ClusterConfiguration::stable(set(&[2, 3])));
        assert!(!stable.is_transitioning());
        assert_eq!(stable.transition_to_stable(), stable);
    }

    #[test]
    fn test_contains_on_new_state() {
        let joint = ClusterConfiguration::stable(set(&[1, 2, 3])).transition_to(set(&[2, 3]));
        assert!(!joint.contains_on_new_state(&n(1)));
        assert!(joint.contains_on_new_state(&n(2)));
        assert!(joint.members().contains(&n(1)));
    }

    #[test]
    fn test_members_without() {
        let cfg = ClusterConfiguration::stable(set(&[1, 2, 3]));
        assert_eq!(cfg.members_without(&n(2)), set(&[1, 3]));
    }
}
