use std::collections::VecDeque;

use tokio::sync::oneshot;

use crate::config::{NodeConfig, RaftConfig};
use crate::discovery::DiscoveryNode;
use crate::error::Result;
use crate::persistence::Persistence;
use crate::raft::log::{Command, LogEntry, Payload, RaftSnapshot, ReplicatedLog, SnapshotMetadata};
use crate::raft::metadata::RaftMetadata;
use crate::raft::protocol::{Event, RaftMessage};
use crate::raft::session::{CommandResult, SessionRegistry};
use crate::raft::state::{Effect, RaftRole, State};
use crate::raft::timer::random_election_timeout;
use crate::registry::ResourceRegistry;

/// Client command held while no leader is known.
#[derive(Debug, Clone)]
pub(crate) struct StashedCommand {
    pub(crate) command: Payload,
    pub(crate) session: u64,
}

/// The Raft state machine of one node.
///
/// `RaftCore` is synchronous and does no I/O besides the persistence and
/// registry calls it is handed: every event goes through [`RaftCore::apply`],
/// which returns the effects (sends, timers, notifications) the caller must
/// carry out. Only one role is active at a time; role transitions replace
/// `state` and bump the timer tokens so that timers armed by a previous role
/// are recognised as stale.
///
/// # Safety invariants
///
/// - **Election safety**: a vote is granted at most once per term and is
///   persisted before the reply is sent.
/// - **Log matching**: followers only append after the
///   `(prev_log_term, prev_log_index)` check and never truncate committed
///   entries.
/// - **Leader completeness**: votes require an up-to-date log, and leaders
///   only commit by counting replicas for entries of their own term.
/// - **State machine safety**: entries reach the registry only once
///   committed, in index order.
pub struct RaftCore<R, P> {
    pub(crate) node: DiscoveryNode,
    pub(crate) discovery: Vec<DiscoveryNode>,
    pub(crate) config: RaftConfig,
    pub(crate) persistence: P,
    pub(crate) registry: R,
    pub(crate) log: ReplicatedLog,
    pub(crate) meta: RaftMetadata,
    pub(crate) state: State,
    pub(crate) sessions: SessionRegistry,
    pub(crate) stashed: VecDeque<StashedCommand>,
    pub(crate) recent_leader: Option<DiscoveryNode>,
    timer_seq: u64,
    election_token: Option<u64>,
    pub(crate) effects: Vec<Effect>,
}

impl<R: ResourceRegistry, P: Persistence> RaftCore<R, P> {
    /// Restores a node from `persistence`. Call [`RaftCore::start`] before
    /// feeding it events.
    pub fn new(config: &NodeConfig, mut persistence: P, mut registry: R) -> Result<Self> {
        let log = persistence.open_log()?;
        if let Some(snapshot) = log.snapshot() {
            tracing::info!(
                index = snapshot.meta.last_included_index,
                term = snapshot.meta.last_included_term,
                "Restoring registry from snapshot"
            );
            registry.install_snapshot(&snapshot.meta, &snapshot.data);
        }

        let cluster = log.latest_config().unwrap_or_default();
        let meta = RaftMetadata::new(persistence.current_term(), cluster, persistence.voted_for());

        Ok(Self {
            node: config.node.clone(),
            discovery: config.discovery.clone(),
            config: config.raft.clone(),
            persistence,
            registry,
            log,
            meta,
            state: State::Follower,
            sessions: SessionRegistry::new(),
            stashed: VecDeque::new(),
            recent_leader: None,
            timer_seq: 0,
            election_token: None,
            effects: Vec::new(),
        })
    }

    /// Enters the initial follower state.
    ///
    /// An empty log either bootstraps a single-node cluster or starts
    /// asking discovered peers to add this node.
    pub fn start(&mut self) -> Result<Vec<Effect>> {
        self.run(|core| {
            tracing::info!(
                node = %core.node,
                term = core.meta.current_term,
                last_index = core.log.last_index(),
                config = %core.meta.config,
                "Starting raft node"
            );
            core.reset_election_deadline();
            if !core.log.is_empty() {
                return Ok(());
            }
            if core.config.bootstrap {
                tracing::info!("Bootstrapping new cluster");
                let node = core.node.clone();
                core.follower_add_server(node)
            } else {
                tracing::info!("Empty log, joining existing cluster");
                core.follower_election_timeout()
            }
        })
    }

    /// Feeds one event through the active role.
    ///
    /// On error (a failed persistence write) nothing queued by this event
    /// is sent; timer changes are kept and can be collected with
    /// [`RaftCore::take_effects`].
    pub fn apply(&mut self, event: Event) -> Result<Vec<Effect>> {
        self.run(|core| core.handle_event(event))
    }

    /// Effects left behind by a failed [`RaftCore::apply`].
    pub fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    fn run(&mut self, f: impl FnOnce(&mut Self) -> Result<()>) -> Result<Vec<Effect>> {
        match f(self) {
            Ok(()) => Ok(std::mem::take(&mut self.effects)),
            Err(e) => {
                self.effects
                    .retain(|effect| !matches!(effect, Effect::Send { .. } | Effect::Dispatch(_)));
                tracing::error!(error = %e, state = %self.role(), "Failed to apply event");
                Err(e)
            }
        }
    }

    /// Opens a client session; its result arrives once the command commits.
    pub fn register_session(&mut self) -> (u64, oneshot::Receiver<CommandResult>) {
        self.sessions.register()
    }

    pub fn node(&self) -> &DiscoveryNode {
        &self.node
    }

    pub fn role(&self) -> RaftRole {
        self.state.role()
    }

    pub fn meta(&self) -> &RaftMetadata {
        &self.meta
    }

    pub fn log(&self) -> &ReplicatedLog {
        &self.log
    }

    pub fn recent_leader(&self) -> Option<&DiscoveryNode> {
        self.recent_leader.as_ref()
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    /// Client commands waiting for a leader.
    pub fn stashed(&self) -> Vec<RaftMessage> {
        self.stashed
            .iter()
            .map(|s| RaftMessage::ClientMessage {
                command: s.command.clone(),
                session: s.session,
            })
            .collect()
    }

    fn handle_event(&mut self, event: Event) -> Result<()> {
        match event {
            Event::Message(message) => self.handle_message(message),
            Event::ElectionTimeout { token } => {
                if self.election_token != Some(token) {
                    tracing::error!(token, state = %self.role(), "Stale election timeout ignored");
                    return Ok(());
                }
                match self.role() {
                    RaftRole::Follower => self.follower_election_timeout(),
                    RaftRole::Candidate => self.candidate_election_timeout(),
                    RaftRole::Leader => {
                        tracing::error!(token, "Election timeout fired on leader");
                        Ok(())
                    }
                }
            }
            Event::SendHeartbeat { token } => {
                match &self.state {
                    State::Leader(leader) if leader.heartbeat_token == token => {
                        self.send_heartbeat();
                    }
                    _ => {
                        tracing::error!(token, state = %self.role(), "Stale heartbeat ignored");
                    }
                }
                Ok(())
            }
        }
    }

    fn handle_message(&mut self, message: RaftMessage) -> Result<()> {
        if let Some(term) = message.term() {
            if term > self.meta.current_term {
                tracing::info!(
                    term,
                    current_term = self.meta.current_term,
                    message = message.name(),
                    state = %self.role(),
                    "Received newer term"
                );
                match self.role() {
                    RaftRole::Follower => {
                        let meta = self.meta.clone().with_term(term);
                        self.set_meta(meta)?;
                    }
                    RaftRole::Candidate | RaftRole::Leader => self.become_follower(term)?,
                }
            }
        }

        match self.role() {
            RaftRole::Follower => self.follower_handle(message),
            RaftRole::Candidate => self.candidate_handle(message),
            RaftRole::Leader => self.leader_handle(message),
        }
    }

    /// Installs new metadata, persisting term and vote first if they changed.
    pub(crate) fn set_meta(&mut self, meta: RaftMetadata) -> Result<()> {
        if meta.current_term != self.meta.current_term || meta.voted_for != self.meta.voted_for {
            self.persistence
                .update_state(meta.current_term, meta.voted_for.as_ref())?;
        }
        let config_changed = meta.config != self.meta.config;
        self.meta = meta;
        if config_changed {
            tracing::info!(config = %self.meta.config, "Configuration changed");
            if !self.meta.config.is_transitioning() {
                self.effects.push(Effect::MembersChanged(self.meta.members()));
            }
        }
        Ok(())
    }

    /// Adopts the most recent configuration found in the log.
    pub(crate) fn adopt_latest_config(&mut self) -> Result<()> {
        if let Some(config) = self.log.latest_config() {
            if config != self.meta.config {
                let meta = self.meta.clone().with_config(config);
                self.set_meta(meta)?;
            }
        }
        Ok(())
    }

    pub(crate) fn send(&mut self, to: &DiscoveryNode, message: RaftMessage) {
        if *to == self.node {
            self.effects.push(Effect::Dispatch(message));
        } else {
            self.effects.push(Effect::Send {
                to: to.clone(),
                message,
            });
        }
    }

    pub(crate) fn next_timer_token(&mut self) -> u64 {
        self.timer_seq += 1;
        self.timer_seq
    }

    pub(crate) fn reset_election_deadline(&mut self) {
        let token = self.next_timer_token();
        let after = random_election_timeout(self.config.election_deadline());
        tracing::trace!(token, after_ms = after.as_millis() as u64, "Reset election deadline");
        self.election_token = Some(token);
        self.effects
            .push(Effect::ScheduleElectionTimeout { token, after });
    }

    pub(crate) fn cancel_election_deadline(&mut self) {
        self.election_token = None;
        self.effects.push(Effect::CancelElectionTimeout);
    }

    pub(crate) fn sender_is_current_leader(&mut self, leader: &DiscoveryNode) {
        if self.recent_leader.as_ref() != Some(leader) {
            tracing::debug!(leader = %leader, "Leader is known");
            self.recent_leader = Some(leader.clone());
        }
    }

    /// Steps down (or stays) as follower in `term`.
    pub(crate) fn become_follower(&mut self, term: u64) -> Result<()> {
        if let State::Leader(_) = self.state {
            self.effects.push(Effect::CancelHeartbeat);
        }
        if self.recent_leader.as_ref() == Some(&self.node) {
            self.recent_leader = None;
        }
        let meta = self.meta.clone().with_term(term).for_follower();
        self.set_meta(meta)?;
        self.state = State::Follower;
        self.reset_election_deadline();
        tracing::info!(term, "Became follower");
        Ok(())
    }

    /// Appends to the log and persists whatever was actually written.
    pub(crate) fn append_to_log(&mut self, entries: Vec<LogEntry>) -> Result<()> {
        let written = self.log.append(entries);
        if !written.is_empty() {
            self.persistence.append_entries(&written)?;
        }
        Ok(())
    }

    /// Hands a committed non-configuration entry to the registry and wakes
    /// the client waiting on it, if any.
    pub(crate) fn apply_committed(&mut self, entry: &LogEntry) {
        match &entry.command {
            Command::Noop => {
                tracing::trace!(index = entry.index, "Ignoring noop entry");
            }
            Command::Configuration(config) => {
                tracing::debug!(index = entry.index, config = %config, "Configuration entry committed");
            }
            Command::Application(command) => {
                tracing::debug!(index = entry.index, session = entry.session, "Applying command");
                let result = self.registry.apply(entry.index, command);
                self.sessions.resolve(entry.session, result);
            }
        }
    }

    pub(crate) fn stash(&mut self, command: Payload, session: u64) {
        tracing::debug!(session, "Stashing client command");
        self.stashed.push_back(StashedCommand { command, session });
    }

    pub(crate) fn maybe_create_snapshot(&mut self) -> Result<()> {
        let interval = self.config.snapshot_interval;
        if interval == 0 || self.log.committed_entries() < interval {
            return Ok(());
        }
        self.create_snapshot()
    }

    /// Folds every committed entry into a registry snapshot and compacts
    /// the log.
    pub(crate) fn create_snapshot(&mut self) -> Result<()> {
        let committed = self.log.committed_index();
        let meta = SnapshotMetadata {
            last_included_index: committed,
            last_included_term: self.log.term_at(committed).unwrap_or(0),
            config: self
                .log
                .config_at(committed)
                .unwrap_or_else(|| self.meta.config.clone()),
        };
        tracing::info!(
            index = meta.last_included_index,
            term = meta.last_included_term,
            "Creating snapshot"
        );

        let data = self.registry.prepare_snapshot(&meta);
        self.log.compact_with(RaftSnapshot { meta, data });
        self.persistence.compact(&self.log)?;

        tracing::info!(
            snapshot_index = committed,
            remaining = self.log.entries().len(),
            "Compacted log"
        );
        Ok(())
    }
}
