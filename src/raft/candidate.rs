use crate::error::Result;
use crate::persistence::Persistence;
use crate::raft::core::RaftCore;
use crate::raft::protocol::{MembershipStatus, RaftMessage};
use crate::raft::state::State;
use crate::registry::ResourceRegistry;

impl<R: ResourceRegistry, P: Persistence> RaftCore<R, P> {
    pub(crate) fn become_candidate(&mut self) -> Result<()> {
        self.state = State::Candidate;
        self.recent_leader = None;
        self.start_election()
    }

    /// Starts a new term, votes for itself and asks every other member for
    /// a vote.
    fn start_election(&mut self) -> Result<()> {
        self.reset_election_deadline();

        let meta = self
            .meta
            .clone()
            .for_new_election()
            .with_vote_for(self.node.clone())
            .inc_vote(self.node.clone());
        self.set_meta(meta)?;

        let term = self.meta.current_term;
        let peers = self.meta.members_without(&self.node);
        tracing::info!(term, peers = peers.len(), config = %self.meta.config, "Starting election");

        let request = RaftMessage::RequestVote {
            term,
            candidate: self.node.clone(),
            last_log_term: self.log.last_term().unwrap_or(0),
            last_log_index: self.log.last_index(),
        };
        for peer in &peers {
            self.send(peer, request.clone());
        }

        // A single-member cluster wins on its own vote.
        if self.meta.has_majority() {
            return self.become_leader();
        }
        Ok(())
    }

    pub(crate) fn candidate_election_timeout(&mut self) -> Result<()> {
        tracing::info!(
            term = self.meta.current_term,
            votes = self.meta.votes_received(),
            "Election timed out, starting a new one"
        );
        self.start_election()
    }

    pub(crate) fn candidate_handle(&mut self, message: RaftMessage) -> Result<()> {
        let current_term = self.meta.current_term;
        match message {
            RaftMessage::RequestVote { term, candidate, .. } => {
                tracing::info!(candidate = %candidate, term, "Rejecting vote, already voted for self");
                let response = RaftMessage::DeclineCandidate {
                    member: self.node.clone(),
                    term: current_term,
                };
                self.send(&candidate, response);
                Ok(())
            }
            RaftMessage::VoteCandidate { member, term } => {
                if term < current_term {
                    tracing::debug!(member = %member, term, "Ignoring vote from previous election");
                    return Ok(());
                }
                let meta = self.meta.clone().inc_vote(member.clone());
                self.set_meta(meta)?;
                tracing::info!(
                    member = %member,
                    term,
                    votes = self.meta.votes_received(),
                    "Received vote"
                );
                if self.meta.has_majority() {
                    tracing::info!(term, votes = self.meta.votes_received(), "Won election");
                    return self.become_leader();
                }
                Ok(())
            }
            RaftMessage::DeclineCandidate { member, term } => {
                tracing::info!(member = %member, term, "Candidate declined");
                Ok(())
            }
            message @ (RaftMessage::AppendEntries { .. } | RaftMessage::InstallSnapshot { .. }) => {
                let term = message.term().unwrap_or(0);
                if term >= current_term {
                    tracing::info!(term, "Leader discovered, stepping down");
                    self.become_follower(term)?;
                    return self.follower_handle(message);
                }
                self.reject_stale_leader(message);
                Ok(())
            }
            RaftMessage::ClientMessage { command, session } => {
                self.stash(command, session);
                Ok(())
            }
            RaftMessage::AddServer { member } => {
                let response = RaftMessage::AddServerResponse {
                    status: MembershipStatus::NotLeader,
                    leader: None,
                };
                self.send(&member, response);
                Ok(())
            }
            RaftMessage::RemoveServer { member } => {
                let response = RaftMessage::RemoveServerResponse {
                    status: MembershipStatus::NotLeader,
                    leader: None,
                };
                self.send(&member, response);
                Ok(())
            }
            other => {
                tracing::debug!(message = other.name(), state = "candidate", "Unhandled message");
                Ok(())
            }
        }
    }

    fn reject_stale_leader(&mut self, message: RaftMessage) {
        let current_term = self.meta.current_term;
        match message {
            RaftMessage::AppendEntries { member, term, .. } => {
                tracing::info!(leader = %member, term, current_term, "Rejecting append from stale leader");
                let response = RaftMessage::AppendRejected {
                    member: self.node.clone(),
                    term: current_term,
                    last_index: self.log.last_index(),
                };
                self.send(&member, response);
            }
            RaftMessage::InstallSnapshot { leader, term, .. } => {
                tracing::info!(leader = %leader, term, current_term, "Rejecting snapshot from stale leader");
                let response = RaftMessage::InstallSnapshotRejected {
                    member: self.node.clone(),
                    term: current_term,
                };
                self.send(&leader, response);
            }
            _ => {}
        }
    }
}
