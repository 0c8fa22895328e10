use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::discovery::DiscoveryNode;
use crate::raft::protocol::{Event, RaftMessage};

/// Outbound side of the network, as seen by a Raft node.
///
/// Sends are fire-and-forget: delivery, retries and connection handling
/// belong to the implementation.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, to: &DiscoveryNode, message: RaftMessage);
}

#[derive(Debug, Default)]
struct Routes {
    mailboxes: HashMap<DiscoveryNode, mpsc::UnboundedSender<Event>>,
    isolated: HashSet<DiscoveryNode>,
}

/// In-process transport that routes messages straight into node mailboxes.
///
/// Every node registered on the same `LocalTransport` can reach every other
/// one. Isolating a node drops all traffic to and from it until healed.
#[derive(Debug, Clone, Default)]
pub struct LocalTransport {
    routes: Arc<Mutex<Routes>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sender bound to `node`, used by that node's `RaftNode`.
    pub fn endpoint(&self, node: DiscoveryNode) -> LocalEndpoint {
        LocalEndpoint {
            node,
            transport: self.clone(),
        }
    }

    pub fn register(&self, node: DiscoveryNode, mailbox: mpsc::UnboundedSender<Event>) {
        self.lock().mailboxes.insert(node, mailbox);
    }

    pub fn unregister(&self, node: &DiscoveryNode) {
        self.lock().mailboxes.remove(node);
    }

    pub fn isolate(&self, node: &DiscoveryNode) {
        tracing::info!(node = %node, "Isolating node");
        self.lock().isolated.insert(node.clone());
    }

    pub fn heal(&self, node: &DiscoveryNode) {
        tracing::info!(node = %node, "Healing node");
        self.lock().isolated.remove(node);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Routes> {
        self.routes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn deliver(&self, from: &DiscoveryNode, to: &DiscoveryNode, message: RaftMessage) {
        let routes = self.lock();
        if routes.isolated.contains(from) || routes.isolated.contains(to) {
            tracing::trace!(from = %from, to = %to, message = message.name(), "Dropped by partition");
            return;
        }
        match routes.mailboxes.get(to) {
            Some(mailbox) => {
                if mailbox.send(Event::Message(message)).is_err() {
                    tracing::trace!(to = %to, "Mailbox closed");
                }
            }
            None => {
                tracing::trace!(to = %to, message = message.name(), "No route to node");
            }
        }
    }
}

/// A node's handle on a `LocalTransport`.
#[derive(Debug, Clone)]
pub struct LocalEndpoint {
    node: DiscoveryNode,
    transport: LocalTransport,
}

impl Transport for LocalEndpoint {
    fn send(&self, to: &DiscoveryNode, message: RaftMessage) {
        self.transport.deliver(&self.node, to, message);
    }
}
