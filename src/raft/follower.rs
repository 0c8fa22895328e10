use crate::discovery::DiscoveryNode;
use crate::error::Result;
use crate::persistence::Persistence;
use crate::raft::core::RaftCore;
use crate::raft::log::{LogEntry, Payload, RaftSnapshot};
use crate::raft::protocol::{MembershipStatus, RaftMessage};
use crate::raft::state::Effect;
use crate::registry::ResourceRegistry;

impl<R: ResourceRegistry, P: Persistence> RaftCore<R, P> {
    pub(crate) fn follower_handle(&mut self, message: RaftMessage) -> Result<()> {
        match message {
            RaftMessage::RequestVote {
                term,
                candidate,
                last_log_term,
                last_log_index,
            } => self.follower_request_vote(term, candidate, last_log_term, last_log_index),
            RaftMessage::AppendEntries {
                member,
                term,
                prev_log_term,
                prev_log_index,
                entries,
                leader_commit,
            } => self.follower_append_entries(
                member,
                term,
                prev_log_term,
                prev_log_index,
                entries,
                leader_commit,
            ),
            RaftMessage::InstallSnapshot {
                leader,
                term,
                snapshot,
            } => self.follower_install_snapshot(leader, term, snapshot),
            RaftMessage::ClientMessage { command, session } => {
                self.follower_client_message(command, session);
                Ok(())
            }
            RaftMessage::AddServer { member } => self.follower_add_server(member),
            RaftMessage::RemoveServer { member } => {
                let response = RaftMessage::RemoveServerResponse {
                    status: MembershipStatus::NotLeader,
                    leader: self.recent_leader.clone(),
                };
                self.send(&member, response);
                Ok(())
            }
            RaftMessage::AddServerResponse { status, leader } => {
                self.follower_membership_response(true, status, leader)
            }
            RaftMessage::RemoveServerResponse { status, leader } => {
                self.follower_membership_response(false, status, leader)
            }
            other => {
                tracing::debug!(message = other.name(), state = "follower", "Unhandled message");
                Ok(())
            }
        }
    }

    fn follower_request_vote(
        &mut self,
        term: u64,
        candidate: DiscoveryNode,
        last_log_term: u64,
        last_log_index: u64,
    ) -> Result<()> {
        let current_term = self.meta.current_term;
        let decline = RaftMessage::DeclineCandidate {
            member: self.node.clone(),
            term: current_term,
        };

        if term < current_term {
            tracing::info!(candidate = %candidate, term, current_term, "Rejecting vote for stale term");
            self.send(&candidate, decline);
            return Ok(());
        }

        if !self.meta.can_vote_for(term, &candidate) {
            tracing::info!(
                candidate = %candidate,
                term,
                voted_for = ?self.meta.voted_for,
                "Rejecting vote, already voted in this term"
            );
            self.send(&candidate, decline);
            return Ok(());
        }

        let our_last_term = self.log.last_term().unwrap_or(0);
        let our_last_index = self.log.last_index();
        let log_ok = last_log_term > our_last_term
            || (last_log_term == our_last_term && last_log_index >= our_last_index);
        if !log_ok {
            tracing::info!(
                candidate = %candidate,
                last_log_term,
                last_log_index,
                our_last_term,
                our_last_index,
                "Rejecting vote, candidate log is behind"
            );
            self.send(&candidate, decline);
            return Ok(());
        }

        tracing::info!(candidate = %candidate, term, "Voting for candidate");
        let meta = self.meta.clone().with_vote_for(candidate.clone());
        self.set_meta(meta)?;
        self.reset_election_deadline();
        self.send(
            &candidate,
            RaftMessage::VoteCandidate {
                member: self.node.clone(),
                term,
            },
        );
        Ok(())
    }

    fn follower_append_entries(
        &mut self,
        leader: DiscoveryNode,
        term: u64,
        prev_log_term: u64,
        prev_log_index: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    ) -> Result<()> {
        let current_term = self.meta.current_term;
        if term < current_term {
            tracing::warn!(leader = %leader, term, current_term, "Rejecting append from stale leader");
            let response = RaftMessage::AppendRejected {
                member: self.node.clone(),
                term: current_term,
                last_index: self.log.last_index(),
            };
            self.send(&leader, response);
            return Ok(());
        }

        self.reset_election_deadline();
        self.sender_is_current_leader(&leader);

        if !self.log.contains_matching_entry(prev_log_term, prev_log_index) {
            tracing::warn!(
                leader = %leader,
                prev_log_term,
                prev_log_index,
                last_index = self.log.last_index(),
                "Rejecting append, log does not contain previous entry"
            );
            let response = RaftMessage::AppendRejected {
                member: self.node.clone(),
                term: current_term,
                last_index: self.log.last_index(),
            };
            self.send(&leader, response);
            return Ok(());
        }

        // Everything up to here now matches the leader's log; anything
        // after it may still be a stale suffix.
        let verified_index = prev_log_index + entries.len() as u64;
        if !entries.is_empty() {
            tracing::debug!(
                leader = %leader,
                from = prev_log_index + 1,
                count = entries.len(),
                "Appending entries"
            );
            self.append_to_log(entries)?;
            self.adopt_latest_config()?;
        }

        self.send(
            &leader,
            RaftMessage::AppendSuccessful {
                member: self.node.clone(),
                term: current_term,
                last_index: verified_index,
            },
        );

        let target = leader_commit.min(verified_index);
        if target > self.log.committed_index() {
            self.commit_up_to(target);
        }

        self.unstash();
        self.maybe_create_snapshot()
    }

    fn follower_install_snapshot(
        &mut self,
        leader: DiscoveryNode,
        term: u64,
        snapshot: RaftSnapshot,
    ) -> Result<()> {
        let current_term = self.meta.current_term;
        if term < current_term {
            tracing::info!(leader = %leader, term, current_term, "Rejecting snapshot from stale leader");
            let response = RaftMessage::InstallSnapshotRejected {
                member: self.node.clone(),
                term: current_term,
            };
            self.send(&leader, response);
            return Ok(());
        }

        self.reset_election_deadline();
        self.sender_is_current_leader(&leader);

        let index = snapshot.meta.last_included_index;
        if index > self.log.committed_index() {
            tracing::info!(
                leader = %leader,
                index,
                term = snapshot.meta.last_included_term,
                "Installing snapshot"
            );
            self.registry.install_snapshot(&snapshot.meta, &snapshot.data);
            self.log.compact_with(snapshot);
            self.persistence.compact(&self.log)?;
            self.adopt_latest_config()?;
            self.effects.push(Effect::Committed { index });
        } else {
            tracing::debug!(index, committed = self.log.committed_index(), "Snapshot already applied");
        }

        self.send(
            &leader,
            RaftMessage::InstallSnapshotSuccessful {
                member: self.node.clone(),
                term: current_term,
                last_index: index,
            },
        );
        self.unstash();
        Ok(())
    }

    fn follower_client_message(&mut self, command: Payload, session: u64) {
        match self.recent_leader.clone() {
            Some(leader) if leader != self.node => {
                tracing::debug!(leader = %leader, session, "Forwarding client command to leader");
                self.send(&leader, RaftMessage::ClientMessage { command, session });
            }
            _ => self.stash(command, session),
        }
    }

    pub(crate) fn follower_add_server(&mut self, member: DiscoveryNode) -> Result<()> {
        if member == self.node
            && self.config.bootstrap
            && self.log.is_empty()
            && self.meta.members().is_empty()
        {
            return self.self_join();
        }

        let response = RaftMessage::AddServerResponse {
            status: MembershipStatus::NotLeader,
            leader: self.recent_leader.clone(),
        };
        self.send(&member, response);
        Ok(())
    }

    fn follower_membership_response(
        &mut self,
        adding: bool,
        status: MembershipStatus,
        leader: Option<DiscoveryNode>,
    ) -> Result<()> {
        tracing::info!(adding, status = %status, leader = ?leader, "Membership response");
        let Some(leader) = leader else {
            return Ok(());
        };
        if leader == self.node {
            return Ok(());
        }

        self.sender_is_current_leader(&leader);
        self.reset_election_deadline();

        // Still waiting to join: ask the leader directly.
        if adding && status == MembershipStatus::NotLeader && self.meta.members().is_empty() {
            self.send(
                &leader,
                RaftMessage::AddServer {
                    member: self.node.clone(),
                },
            );
        }
        self.unstash();
        Ok(())
    }

    pub(crate) fn follower_election_timeout(&mut self) -> Result<()> {
        self.reset_election_deadline();

        let members = self.meta.members();
        if members.is_empty() {
            tracing::info!(peers = self.discovery.len(), "No configuration yet, asking peers to join");
            let request = RaftMessage::AddServer {
                member: self.node.clone(),
            };
            for peer in self.discovery.clone() {
                if peer != self.node {
                    self.send(&peer, request.clone());
                }
            }
            return Ok(());
        }

        if !members.contains(&self.node) {
            tracing::debug!(config = %self.meta.config, "Not a member of the cluster, staying follower");
            return Ok(());
        }

        tracing::info!(
            term = self.meta.current_term,
            leader = ?self.recent_leader,
            "Election timeout, no heartbeat from leader"
        );
        self.become_candidate()
    }

    /// Commits and applies every entry up to `index`.
    fn commit_up_to(&mut self, index: u64) {
        let from = self.log.committed_index() + 1;
        for entry in self.log.slice(from, index) {
            self.log.commit(entry.index);
            self.apply_committed(&entry);
        }
        tracing::debug!(committed = self.log.committed_index(), "Advanced commit index");
        self.effects.push(Effect::Committed {
            index: self.log.committed_index(),
        });
    }

    pub(crate) fn unstash(&mut self) {
        if self.stashed.is_empty() {
            return;
        }
        let leader = match self.recent_leader.clone() {
            Some(leader) if leader != self.node => leader,
            _ => return,
        };
        tracing::info!(leader = %leader, count = self.stashed.len(), "Forwarding stashed commands");
        while let Some(stashed) = self.stashed.pop_front() {
            self.send(
                &leader,
                RaftMessage::ClientMessage {
                    command: stashed.command,
                    session: stashed.session,
                },
            );
        }
    }
}
