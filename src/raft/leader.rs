use std::collections::BTreeSet;

use tokio::time::Instant;

use crate::discovery::DiscoveryNode;
use crate::error::Result;
use crate::persistence::Persistence;
use crate::raft::cluster::ClusterConfiguration;
use crate::raft::core::RaftCore;
use crate::raft::log::{Command, LogEntry};
use crate::raft::protocol::{MembershipStatus, RaftMessage};
use crate::raft::state::{Effect, LeaderState, State};
use crate::registry::ResourceRegistry;

impl<R: ResourceRegistry, P: Persistence> RaftCore<R, P> {
    pub(crate) fn become_leader(&mut self) -> Result<()> {
        let term = self.meta.current_term;
        tracing::info!(term, config = %self.meta.config, "Became leader");

        self.cancel_election_deadline();
        let token = self.next_timer_token();
        self.state = State::Leader(Box::new(LeaderState::new(self.log.last_index(), token)));
        self.recent_leader = Some(self.node.clone());
        let meta = self.meta.clone().for_follower();
        self.set_meta(meta)?;

        // A fresh cluster starts its log with the configuration; otherwise a
        // noop lets entries from earlier terms commit.
        let first = if self.log.is_empty() {
            Command::Configuration(self.meta.config.clone())
        } else {
            Command::Noop
        };
        self.leader_append(first, 0)?;

        while let Some(stashed) = self.stashed.pop_front() {
            tracing::debug!(session = stashed.session, "Appending stashed command");
            self.leader_append(Command::Application(stashed.command), stashed.session)?;
        }

        self.maybe_finalize_joint()?;

        self.send_heartbeat();
        self.effects.push(Effect::StartHeartbeat {
            token,
            every: self.config.heartbeat_interval(),
        });
        self.maybe_commit()
    }

    /// Bootstraps a single-node cluster made of this node.
    pub(crate) fn self_join(&mut self) -> Result<()> {
        tracing::info!(node = %self.node, "Joining self as first member");
        let meta = self
            .meta
            .clone()
            .with_term(self.meta.current_term + 1)
            .with_config(ClusterConfiguration::stable([self.node.clone()]))
            .with_vote_for(self.node.clone());
        self.set_meta(meta)?;
        self.become_leader()
    }

    pub(crate) fn leader_handle(&mut self, message: RaftMessage) -> Result<()> {
        let current_term = self.meta.current_term;
        match message {
            RaftMessage::ClientMessage { command, session } => {
                let index = self.leader_append(Command::Application(command), session)?;
                tracing::debug!(index, session, "Appended client command");
                self.send_heartbeat();
                self.maybe_commit()
            }
            RaftMessage::AppendSuccessful {
                member,
                term,
                last_index,
            }
            | RaftMessage::InstallSnapshotSuccessful {
                member,
                term,
                last_index,
            } => self.leader_append_successful(member, term, last_index),
            RaftMessage::AppendRejected {
                member,
                term,
                last_index,
            } => {
                self.leader_append_rejected(member, term, last_index);
                Ok(())
            }
            RaftMessage::InstallSnapshotRejected { member, term } => {
                self.leader_snapshot_rejected(member, term);
                Ok(())
            }
            RaftMessage::AppendEntries { member, term, .. }
            | RaftMessage::InstallSnapshot {
                leader: member,
                term,
                ..
            } => {
                if member == self.node {
                    return Ok(());
                }
                tracing::warn!(
                    leader = %member,
                    term,
                    current_term,
                    "Leader with a stale term detected, sending entries to force step down"
                );
                self.send_entries(&member);
                Ok(())
            }
            RaftMessage::RequestVote { term, candidate, .. } => {
                tracing::info!(candidate = %candidate, term, "Rejecting vote, already leader");
                let response = RaftMessage::DeclineCandidate {
                    member: self.node.clone(),
                    term: current_term,
                };
                self.send(&candidate, response);
                Ok(())
            }
            RaftMessage::AddServer { member } => self.leader_add_server(member),
            RaftMessage::RemoveServer { member } => self.leader_remove_server(member),
            RaftMessage::VoteCandidate { member, term }
            | RaftMessage::DeclineCandidate { member, term } => {
                tracing::debug!(member = %member, term, "Ignoring late vote response");
                Ok(())
            }
            other => {
                tracing::debug!(message = other.name(), state = "leader", "Unhandled message");
                Ok(())
            }
        }
    }

    /// Appends a new entry in the current term and counts it as replicated
    /// on the leader itself.
    fn leader_append(&mut self, command: Command, session: u64) -> Result<u64> {
        let index = self.log.next_index();
        let entry = LogEntry::new(self.meta.current_term, index, session, command);
        self.append_to_log(vec![entry])?;
        if let State::Leader(leader) = &mut self.state {
            leader.match_index.put(self.node.clone(), index);
        }
        Ok(index)
    }

    fn leader_append_successful(
        &mut self,
        member: DiscoveryNode,
        term: u64,
        last_index: u64,
    ) -> Result<()> {
        if term < self.meta.current_term {
            tracing::debug!(member = %member, term, "Ignoring response from previous term");
            return Ok(());
        }
        if last_index > self.log.last_index() {
            tracing::error!(
                member = %member,
                last_index,
                our_last_index = self.log.last_index(),
                "Follower acknowledged entries beyond the leader log"
            );
            return Ok(());
        }

        if let State::Leader(leader) = &mut self.state {
            leader.match_index.put_if_greater(member.clone(), last_index);
            let matched = leader.match_index.index_for(&member);
            leader.next_index.put(member.clone(), matched + 1);
            leader.replication_sent.remove(&member);
            tracing::trace!(member = %member, matched, "Follower acknowledged entries");
        }

        self.maybe_send_entries(&member);
        self.maybe_commit()
    }

    fn leader_append_rejected(&mut self, member: DiscoveryNode, term: u64, last_index: u64) {
        if term < self.meta.current_term {
            tracing::debug!(member = %member, term, "Ignoring rejection from previous term");
            return;
        }
        let next_index = match &mut self.state {
            State::Leader(leader) => {
                leader.replication_sent.remove(&member);
                if last_index + 1 < leader.next_index.index_for(&member) {
                    leader.next_index.put(member.clone(), last_index + 1);
                } else {
                    leader.next_index.decrement_for(&member);
                }
                leader.next_index.index_for(&member)
            }
            _ => return,
        };
        tracing::info!(
            member = %member,
            follower_last_index = last_index,
            next_index,
            "Follower rejected entries, backing off"
        );
        self.send_entries(&member);
    }

    fn leader_snapshot_rejected(&mut self, member: DiscoveryNode, term: u64) {
        if term < self.meta.current_term {
            return;
        }
        if let State::Leader(leader) = &mut self.state {
            leader.replication_sent.remove(&member);
            leader.next_index.decrement_for(&member);
        }
        tracing::warn!(member = %member, term, "Follower rejected snapshot");
        self.send_entries(&member);
    }

    /// Sends entries (or a heartbeat) to every follower that has no
    /// outstanding request younger than a heartbeat interval.
    pub(crate) fn send_heartbeat(&mut self) {
        let now = Instant::now();
        let heartbeat = self.config.heartbeat_interval();
        let due: Vec<DiscoveryNode> = match &self.state {
            State::Leader(leader) => self
                .meta
                .members_without(&self.node)
                .into_iter()
                .filter(|member| leader.replication_due(member, now, heartbeat))
                .collect(),
            _ => return,
        };
        tracing::trace!(followers = due.len(), "Sending heartbeat");
        for member in due {
            self.send_entries(&member);
        }
    }

    fn maybe_send_entries(&mut self, follower: &DiscoveryNode) {
        let heartbeat = self.config.heartbeat_interval();
        let pending = match &self.state {
            State::Leader(leader) => {
                leader.replication_due(follower, Instant::now(), heartbeat)
                    && leader.next_index.index_for(follower) <= self.log.last_index()
            }
            _ => false,
        };
        if pending {
            self.send_entries(follower);
        }
    }

    /// Sends `follower` the entries from its next index, or the snapshot if
    /// those entries are compacted away.
    pub(crate) fn send_entries(&mut self, follower: &DiscoveryNode) {
        let term = self.meta.current_term;
        let next = match &mut self.state {
            State::Leader(leader) => {
                leader
                    .replication_sent
                    .insert(follower.clone(), Instant::now());
                leader.next_index.index_for(follower)
            }
            _ => return,
        };

        let snapshot = self
            .log
            .snapshot()
            .filter(|s| s.meta.last_included_index >= next)
            .cloned();
        if let Some(snapshot) = snapshot {
            tracing::info!(
                follower = %follower,
                index = snapshot.meta.last_included_index,
                next_index = next,
                "Sending snapshot"
            );
            let message = RaftMessage::InstallSnapshot {
                leader: self.node.clone(),
                term,
                snapshot,
            };
            self.send(follower, message);
            return;
        }

        assert!(
            next <= self.log.next_index(),
            "next index {} for {} is beyond the log end {}",
            next,
            follower,
            self.log.next_index()
        );
        let entries = self.log.entries_batch_from(next, self.config.max_entries);
        let prev_log_index = next - 1;
        let prev_log_term = self.log.term_at(prev_log_index).unwrap_or(0);
        tracing::trace!(
            follower = %follower,
            prev_log_index,
            count = entries.len(),
            "Sending entries"
        );
        let message = RaftMessage::AppendEntries {
            member: self.node.clone(),
            term,
            prev_log_term,
            prev_log_index,
            entries,
            leader_commit: self.log.committed_index(),
        };
        self.send(follower, message);
    }

    /// Commits up to the highest index replicated on a quorum, as long as
    /// that entry is from the current term.
    fn maybe_commit(&mut self) -> Result<()> {
        loop {
            let quorum_index = match &self.state {
                State::Leader(leader) => leader.match_index.consensus_for_index(&self.meta.config),
                _ => return Ok(()),
            };
            let committed = self.log.committed_index();
            if quorum_index <= committed {
                break;
            }
            if self.log.term_at(quorum_index) != Some(self.meta.current_term) {
                tracing::trace!(quorum_index, "Entry from an earlier term, not committing by count");
                break;
            }

            for entry in self.log.slice(committed + 1, quorum_index) {
                self.log.commit(entry.index);
                if let Command::Configuration(config) = &entry.command {
                    if self.leader_config_committed(entry.index, config)? {
                        // Stepped down; the new configuration is committed.
                        self.effects.push(Effect::Committed {
                            index: self.log.committed_index(),
                        });
                        return self.maybe_create_snapshot();
                    }
                } else {
                    self.apply_committed(&entry);
                }
            }
            tracing::debug!(committed = self.log.committed_index(), "Advanced commit index");
            self.effects.push(Effect::Committed {
                index: self.log.committed_index(),
            });
        }
        self.maybe_create_snapshot()
    }

    /// Acts on a committed configuration entry. Returns true if the leader
    /// stepped down.
    fn leader_config_committed(&mut self, index: u64, config: &ClusterConfiguration) -> Result<bool> {
        if *config != self.meta.config {
            tracing::debug!(index, config = %config, "Superseded configuration committed");
            return Ok(false);
        }
        if config.is_transitioning() {
            tracing::info!(index, config = %config, "Joint configuration committed");
            self.finalize_joint()?;
            return Ok(false);
        }

        tracing::info!(index, config = %config, "Configuration committed");
        let requester = match &mut self.state {
            State::Leader(leader) => leader.membership_requester.take(),
            _ => None,
        };
        if let Some((member, adding)) = requester {
            if !adding && member != self.node {
                // The removed node only learns its removal from this entry.
                self.send_entries(&member);
            }
            self.respond_membership(&member, adding, MembershipStatus::Ok);
        }

        if !config.contains_on_new_state(&self.node) {
            tracing::info!(node = %self.node, "Removed from the cluster, stepping down");
            // Let the remaining members learn the commit before we go quiet.
            for member in self.meta.members_without(&self.node) {
                self.send_entries(&member);
            }
            self.become_follower(self.meta.current_term)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Replaces the active joint configuration with its new half.
    fn finalize_joint(&mut self) -> Result<()> {
        let stable = self.meta.config.transition_to_stable();
        tracing::info!(config = %stable, "Finalizing membership change");
        let meta = self.meta.clone().with_config(stable.clone());
        self.set_meta(meta)?;
        self.leader_append(Command::Configuration(stable), 0)?;
        for member in self.meta.members_without(&self.node) {
            self.maybe_send_entries(&member);
        }
        Ok(())
    }

    /// Finishes a membership change a previous leader left half done.
    fn maybe_finalize_joint(&mut self) -> Result<()> {
        if !self.meta.config.is_transitioning() {
            return Ok(());
        }
        let committed = self.log.committed_index();
        if self.log.config_at(committed).as_ref() == Some(&self.meta.config) {
            self.finalize_joint()?;
        }
        Ok(())
    }

    /// Whether a configuration change is still being replicated.
    fn membership_change_in_flight(&self) -> bool {
        if self.meta.config.is_transitioning() {
            return true;
        }
        self.log
            .slice(self.log.committed_index() + 1, self.log.last_index())
            .iter()
            .any(|e| matches!(e.command, Command::Configuration(_)))
    }

    fn respond_membership(&mut self, member: &DiscoveryNode, adding: bool, status: MembershipStatus) {
        let leader = Some(self.node.clone());
        let response = if adding {
            RaftMessage::AddServerResponse { status, leader }
        } else {
            RaftMessage::RemoveServerResponse { status, leader }
        };
        self.send(member, response);
    }

    fn leader_add_server(&mut self, member: DiscoveryNode) -> Result<()> {
        if self.membership_change_in_flight() {
            tracing::warn!(member = %member, "Membership change in progress, rejecting add");
            self.respond_membership(&member, true, MembershipStatus::Timeout);
            return Ok(());
        }

        let mut members = self.meta.members();
        if !members.insert(member.clone()) {
            tracing::debug!(member = %member, "Already a member");
            self.respond_membership(&member, true, MembershipStatus::Ok);
            return Ok(());
        }

        tracing::info!(member = %member, "Adding server");
        self.change_membership(member, true, members)
    }

    fn leader_remove_server(&mut self, member: DiscoveryNode) -> Result<()> {
        if self.membership_change_in_flight() {
            tracing::warn!(member = %member, "Membership change in progress, rejecting remove");
            self.respond_membership(&member, false, MembershipStatus::Timeout);
            return Ok(());
        }

        let mut members = self.meta.members();
        if !members.remove(&member) {
            tracing::debug!(member = %member, "Not a member");
            self.respond_membership(&member, false, MembershipStatus::Ok);
            return Ok(());
        }
        if members.is_empty() {
            tracing::warn!(member = %member, "Refusing to remove the last member");
            self.respond_membership(&member, false, MembershipStatus::Timeout);
            return Ok(());
        }

        tracing::info!(member = %member, "Removing server");
        self.change_membership(member, false, members)
    }

    fn change_membership(
        &mut self,
        requester: DiscoveryNode,
        adding: bool,
        members: BTreeSet<DiscoveryNode>,
    ) -> Result<()> {
        let joint = self.meta.config.transition_to(members);
        tracing::info!(config = %joint, "Entering joint configuration");
        let meta = self.meta.clone().with_config(joint.clone());
        self.set_meta(meta)?;
        if let State::Leader(leader) = &mut self.state {
            leader.membership_requester = Some((requester, adding));
        }
        self.leader_append(Command::Configuration(joint), 0)?;
        self.send_heartbeat();
        self.maybe_commit()
    }
}
