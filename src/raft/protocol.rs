use std::fmt;

use serde::{Deserialize, Serialize};

use crate::discovery::DiscoveryNode;
use crate::raft::log::{LogEntry, Payload, RaftSnapshot};

/// Outcome of a membership request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MembershipStatus {
    Ok,
    /// Another configuration change is still in flight; retry later.
    Timeout,
    NotLeader,
}

impl fmt::Display for MembershipStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MembershipStatus::Ok => write!(f, "OK"),
            MembershipStatus::Timeout => write!(f, "TIMEOUT"),
            MembershipStatus::NotLeader => write!(f, "NOT_LEADER"),
        }
    }
}

/// Messages exchanged between Raft nodes, plus client submissions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftMessage {
    RequestVote {
        term: u64,
        candidate: DiscoveryNode,
        last_log_term: u64,
        last_log_index: u64,
    },
    VoteCandidate {
        member: DiscoveryNode,
        term: u64,
    },
    DeclineCandidate {
        member: DiscoveryNode,
        term: u64,
    },
    AppendEntries {
        member: DiscoveryNode,
        term: u64,
        prev_log_term: u64,
        prev_log_index: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    },
    AppendSuccessful {
        member: DiscoveryNode,
        term: u64,
        last_index: u64,
    },
    AppendRejected {
        member: DiscoveryNode,
        term: u64,
        last_index: u64,
    },
    InstallSnapshot {
        leader: DiscoveryNode,
        term: u64,
        snapshot: RaftSnapshot,
    },
    InstallSnapshotSuccessful {
        member: DiscoveryNode,
        term: u64,
        last_index: u64,
    },
    InstallSnapshotRejected {
        member: DiscoveryNode,
        term: u64,
    },
    AddServer {
        member: DiscoveryNode,
    },
    AddServerResponse {
        status: MembershipStatus,
        leader: Option<DiscoveryNode>,
    },
    RemoveServer {
        member: DiscoveryNode,
    },
    RemoveServerResponse {
        status: MembershipStatus,
        leader: Option<DiscoveryNode>,
    },
    ClientMessage {
        command: Payload,
        session: u64,
    },
}

impl RaftMessage {
    /// Term carried by protocol messages; membership and client messages have none.
    pub fn term(&self) -> Option<u64> {
        match self {
            RaftMessage::RequestVote { term, .. }
            | RaftMessage::VoteCandidate { term, .. }
            | RaftMessage::DeclineCandidate { term, .. }
            | RaftMessage::AppendEntries { term, .. }
            | RaftMessage::AppendSuccessful { term, .. }
            | RaftMessage::AppendRejected { term, .. }
            | RaftMessage::InstallSnapshot { term, .. }
            | RaftMessage::InstallSnapshotSuccessful { term, .. }
            | RaftMessage::InstallSnapshotRejected { term, .. } => Some(*term),
            RaftMessage::AddServer { .. }
            | RaftMessage::AddServerResponse { .. }
            | RaftMessage::RemoveServer { .. }
            | RaftMessage::RemoveServerResponse { .. }
            | RaftMessage::ClientMessage { .. } => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RaftMessage::RequestVote { .. } => "RequestVote",
            RaftMessage::VoteCandidate { .. } => "VoteCandidate",
            RaftMessage::DeclineCandidate { .. } => "DeclineCandidate",
            RaftMessage::AppendEntries { .. } => "AppendEntries",
            RaftMessage::AppendSuccessful { .. } => "AppendSuccessful",
            RaftMessage::AppendRejected { .. } => "AppendRejected",
            RaftMessage::InstallSnapshot { .. } => "InstallSnapshot",
            RaftMessage::InstallSnapshotSuccessful { .. } => "InstallSnapshotSuccessful",
            RaftMessage::InstallSnapshotRejected { .. } => "InstallSnapshotRejected",
            RaftMessage::AddServer { .. } => "AddServer",
            RaftMessage::AddServerResponse { .. } => "AddServerResponse",
            RaftMessage::RemoveServer { .. } => "RemoveServer",
            RaftMessage::RemoveServerResponse { .. } => "RemoveServerResponse",
            RaftMessage::ClientMessage { .. } => "ClientMessage",
        }
    }
}

/// Input to the state machine: a message or a timer firing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Message(RaftMessage),
    /// Election timer fired. `token` identifies the arming that scheduled it.
    ElectionTimeout { token: u64 },
    /// Heartbeat timer ticked.
    SendHeartbeat { token: u64 },
}

impl From<RaftMessage> for Event {
    fn from(message: RaftMessage) -> Self {
        Event::Message(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_term_extraction() {
        let node = DiscoveryNode::new("a", 1);
        let vote = RaftMessage::VoteCandidate {
            member: node.clone(),
            term: 4,
        };
        assert_eq!(vote.term(), Some(4));
        assert_eq!(vote.name(), "VoteCandidate");
        assert_eq!(RaftMessage::AddServer { member: node }.term(), None);
    }

    #[test]
    fn test_messages_are_serializable() {
        let msg = RaftMessage::AppendRejected {
            member: DiscoveryNode::new("a", 1),
            term: 2,
            last_index: 3,
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: RaftMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }
}
