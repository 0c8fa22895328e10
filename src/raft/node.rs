use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::discovery::DiscoveryNode;
use crate::error::{RaftError, Result};
use crate::persistence::Persistence;
use crate::raft::core::RaftCore;
use crate::raft::log::{Payload, ReplicatedLog};
use crate::raft::metadata::RaftMetadata;
use crate::raft::protocol::{Event, RaftMessage};
use crate::raft::state::{Effect, RaftRole};
use crate::registry::ResourceRegistry;
use crate::transport::Transport;

#[derive(Default)]
struct Timers {
    election: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
}

impl Timers {
    fn abort_all(&mut self) {
        if let Some(handle) = self.election.take() {
            handle.abort();
        }
        if let Some(handle) = self.heartbeat.take() {
            handle.abort();
        }
    }
}

/// A Raft node running on tokio.
///
/// Events (peer messages and timer firings) arrive on an unbounded mailbox
/// and are applied to the [`RaftCore`] one at a time. Timers are spawned
/// tasks that post back into the mailbox; outbound messages go through the
/// [`Transport`] after the core lock is released.
pub struct RaftNode<R, P> {
    id: DiscoveryNode,
    core: Arc<Mutex<RaftCore<R, P>>>,
    transport: Arc<dyn Transport>,
    mailbox: mpsc::UnboundedSender<Event>,
    timers: std::sync::Mutex<Timers>,
    commit_tx: watch::Sender<u64>,
    members_tx: watch::Sender<BTreeSet<DiscoveryNode>>,
    shutdown: CancellationToken,
}

impl<R: ResourceRegistry, P: Persistence> RaftNode<R, P> {
    pub fn new(
        config: NodeConfig,
        persistence: P,
        registry: R,
        transport: Arc<dyn Transport>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Event>)> {
        let core = RaftCore::new(&config, persistence, registry)?;
        let (mailbox, mailbox_rx) = mpsc::unbounded_channel();
        let (commit_tx, _) = watch::channel(core.log().committed_index());
        let (members_tx, _) = watch::channel(core.meta().members());

        let node = Self {
            id: config.node,
            core: Arc::new(Mutex::new(core)),
            transport,
            mailbox,
            timers: std::sync::Mutex::new(Timers::default()),
            commit_tx,
            members_tx,
            shutdown: CancellationToken::new(),
        };

        Ok((node, mailbox_rx))
    }

    pub fn id(&self) -> &DiscoveryNode {
        &self.id
    }

    /// Sender feeding this node's mailbox. Transports deliver into it.
    pub fn mailbox(&self) -> mpsc::UnboundedSender<Event> {
        self.mailbox.clone()
    }

    /// Run the node until `shutdown` is cancelled or the mailbox closes.
    pub async fn run(&self, mut mailbox_rx: mpsc::UnboundedReceiver<Event>, shutdown: CancellationToken) {
        let started = {
            let mut core = self.core.lock().await;
            let result = core.start();
            self.process(&mut core, result)
        };
        match started {
            Ok(outbound) => self.deliver(outbound),
            Err(e) => {
                tracing::error!(node = %self.id, error = %e, "Failed to start raft node");
                return;
            }
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(node = %self.id, "Raft node shutting down");
                    break;
                }
                _ = self.shutdown.cancelled() => {
                    tracing::info!(node = %self.id, "Raft node stopped");
                    break;
                }
                event = mailbox_rx.recv() => {
                    let Some(event) = event else {
                        tracing::debug!(node = %self.id, "Mailbox closed");
                        break;
                    };
                    if let Err(e) = self.apply(event).await {
                        tracing::debug!(node = %self.id, error = %e, "Event not applied");
                    }
                }
            }
        }

        self.lock_timers().abort_all();
    }

    /// Apply one event and carry out its effects.
    pub async fn apply(&self, event: Event) -> Result<()> {
        let outbound = {
            let mut core = self.core.lock().await;
            let result = core.apply(event);
            self.process(&mut core, result)?
        };
        self.deliver(outbound);
        Ok(())
    }

    /// Submit a client command and wait until it is committed and applied.
    ///
    /// On a follower the command is forwarded to the known leader, or held
    /// until one is elected. The future never resolves if the command is
    /// lost in a leader change; callers should apply their own timeout.
    pub async fn command(&self, command: impl Into<Payload>) -> Result<Option<Payload>> {
        if self.shutdown.is_cancelled() {
            return Err(RaftError::Shutdown);
        }
        let command = command.into();
        let (result_rx, outbound) = {
            let mut core = self.core.lock().await;
            let (session, result_rx) = core.register_session();
            tracing::debug!(node = %self.id, session, "Submitting client command");
            let result = core.apply(Event::Message(RaftMessage::ClientMessage { command, session }));
            (result_rx, self.process(&mut core, result)?)
        };
        self.deliver(outbound);

        result_rx.await.map_err(|_| RaftError::CommandDropped)
    }

    pub async fn current_state(&self) -> RaftRole {
        self.core.lock().await.role()
    }

    pub async fn current_meta(&self) -> RaftMetadata {
        self.core.lock().await.meta().clone()
    }

    pub async fn recent_leader(&self) -> Option<DiscoveryNode> {
        self.core.lock().await.recent_leader().cloned()
    }

    pub async fn is_leader(&self) -> bool {
        self.current_state().await == RaftRole::Leader
    }

    pub async fn replicated_log(&self) -> ReplicatedLog {
        self.core.lock().await.log().clone()
    }

    pub async fn current_stashed(&self) -> Vec<RaftMessage> {
        self.core.lock().await.stashed()
    }

    /// Run `f` against the registry under the node lock.
    pub async fn with_registry<T>(&self, f: impl FnOnce(&R) -> T) -> T {
        f(self.core.lock().await.registry())
    }

    /// Receives the commit index each time it advances.
    pub fn subscribe_commits(&self) -> watch::Receiver<u64> {
        self.commit_tx.subscribe()
    }

    /// Receives the member set each time a stable configuration is adopted.
    pub fn subscribe_members(&self) -> watch::Receiver<BTreeSet<DiscoveryNode>> {
        self.members_tx.subscribe()
    }

    /// Stop the event loop and all timers.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.lock_timers().abort_all();
    }

    /// Handles timers and notifications while the core is still locked, so
    /// timer changes from consecutive events stay in order. Returns the
    /// messages to deliver once the lock is gone.
    fn process(
        &self,
        core: &mut RaftCore<R, P>,
        result: Result<Vec<Effect>>,
    ) -> Result<Vec<Effect>> {
        let effects = match result {
            Ok(effects) => effects,
            Err(e) => {
                let leftover = core.take_effects();
                self.execute_local(leftover);
                return Err(e);
            }
        };
        Ok(self.execute_local(effects))
    }

    fn execute_local(&self, effects: Vec<Effect>) -> Vec<Effect> {
        let mut outbound = Vec::new();
        for effect in effects {
            match effect {
                Effect::Send { .. } | Effect::Dispatch(_) => outbound.push(effect),
                Effect::ScheduleElectionTimeout { token, after } => {
                    if self.shutdown.is_cancelled() {
                        continue;
                    }
                    let mailbox = self.mailbox.clone();
                    let handle = tokio::spawn(async move {
                        tokio::time::sleep(after).await;
                        let _ = mailbox.send(Event::ElectionTimeout { token });
                    });
                    if let Some(old) = self.lock_timers().election.replace(handle) {
                        old.abort();
                    }
                }
                Effect::CancelElectionTimeout => {
                    if let Some(old) = self.lock_timers().election.take() {
                        old.abort();
                    }
                }
                Effect::StartHeartbeat { token, every } => {
                    if self.shutdown.is_cancelled() {
                        continue;
                    }
                    let handle = spawn_heartbeat(self.mailbox.clone(), token, every);
                    if let Some(old) = self.lock_timers().heartbeat.replace(handle) {
                        old.abort();
                    }
                }
                Effect::CancelHeartbeat => {
                    if let Some(old) = self.lock_timers().heartbeat.take() {
                        old.abort();
                    }
                }
                Effect::Committed { index } => {
                    self.commit_tx.send_if_modified(|committed| {
                        if index > *committed {
                            *committed = index;
                            true
                        } else {
                            false
                        }
                    });
                }
                Effect::MembersChanged(members) => {
                    tracing::info!(node = %self.id, members = members.len(), "Cluster members changed");
                    self.members_tx.send_replace(members);
                }
            }
        }
        outbound
    }

    fn deliver(&self, outbound: Vec<Effect>) {
        for effect in outbound {
            match effect {
                Effect::Send { to, message } => {
                    tracing::trace!(from = %self.id, to = %to, message = message.name(), "Sending");
                    self.transport.send(&to, message);
                }
                Effect::Dispatch(message) => {
                    if self.mailbox.send(Event::Message(message)).is_err() {
                        tracing::debug!(node = %self.id, "Mailbox closed, dropping self message");
                    }
                }
                _ => {}
            }
        }
    }

    fn lock_timers(&self) -> std::sync::MutexGuard<'_, Timers> {
        self.timers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn spawn_heartbeat(
    mailbox: mpsc::UnboundedSender<Event>,
    token: u64,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(Instant::now() + every, every);
        loop {
            interval.tick().await;
            if mailbox.send(Event::SendHeartbeat { token }).is_err() {
                break;
            }
        }
    })
}

impl<R, P> Drop for RaftNode<R, P> {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.timers
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .abort_all();
    }
}
