use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use tokio::time::Instant;

use crate::discovery::DiscoveryNode;
use crate::raft::index_map::LogIndexMap;
use crate::raft::protocol::RaftMessage;

/// Raft node role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "follower"),
            RaftRole::Candidate => write!(f, "candidate"),
            RaftRole::Leader => write!(f, "leader"),
        }
    }
}

/// Volatile state a leader keeps per follower. Rebuilt on every election.
#[derive(Debug, Clone)]
pub struct LeaderState {
    /// Next log index to send to each node.
    pub next_index: LogIndexMap,
    /// Highest index known to be replicated on each node, self included.
    pub match_index: LogIndexMap,
    /// When entries were last sent to a follower that hasn't answered yet.
    pub replication_sent: HashMap<DiscoveryNode, Instant>,
    /// Node waiting for an `AddServer`/`RemoveServer` answer, with whether
    /// it asked to be added.
    pub membership_requester: Option<(DiscoveryNode, bool)>,
    pub heartbeat_token: u64,
}

impl LeaderState {
    pub fn new(last_log_index: u64, heartbeat_token: u64) -> Self {
        Self {
            next_index: LogIndexMap::new(last_log_index + 1),
            match_index: LogIndexMap::new(0),
            replication_sent: HashMap::new(),
            membership_requester: None,
            heartbeat_token,
        }
    }

    /// Whether a send to `follower` is due: no response pending, or the
    /// pending one is older than a heartbeat.
    pub fn replication_due(&self, follower: &DiscoveryNode, now: Instant, heartbeat: Duration) -> bool {
        match self.replication_sent.get(follower) {
            None => true,
            Some(sent) => now.saturating_duration_since(*sent) >= heartbeat,
        }
    }
}

/// The active role and the data only that role owns.
#[derive(Debug)]
pub enum State {
    Follower,
    Candidate,
    Leader(Box<LeaderState>),
}

impl State {
    pub fn role(&self) -> RaftRole {
        match self {
            State::Follower => RaftRole::Follower,
            State::Candidate => RaftRole::Candidate,
            State::Leader(_) => RaftRole::Leader,
        }
    }
}

/// Side effects produced by the core, executed by the runtime once the
/// state lock is released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Send {
        to: DiscoveryNode,
        message: RaftMessage,
    },
    /// Message addressed to this node; goes back through the mailbox.
    Dispatch(RaftMessage),
    ScheduleElectionTimeout {
        token: u64,
        after: Duration,
    },
    CancelElectionTimeout,
    StartHeartbeat {
        token: u64,
        every: Duration,
    },
    CancelHeartbeat,
    /// Commit index advanced.
    Committed {
        index: u64,
    },
    /// A stable configuration committed.
    MembersChanged(BTreeSet<DiscoveryNode>),
}
