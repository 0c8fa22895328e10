use std::collections::HashMap;

use rand::Rng;
use tokio::sync::oneshot;

use crate::raft::log::Payload;

/// Result delivered to a client once its command commits.
pub type CommandResult = Option<Payload>;

/// Pending client commands keyed by session id.
///
/// Session 0 marks internal entries and is never registered.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    pending: HashMap<u64, oneshot::Sender<CommandResult>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a fresh session id and the receiver its result will arrive on.
    pub fn register(&mut self) -> (u64, oneshot::Receiver<CommandResult>) {
        self.pending.retain(|_, tx| !tx.is_closed());

        let mut rng = rand::thread_rng();
        let session = loop {
            let candidate: u64 = rng.gen();
            if candidate != 0 && !self.pending.contains_key(&candidate) {
                break candidate;
            }
        };

        let (tx, rx) = oneshot::channel();
        self.pending.insert(session, tx);
        tracing::debug!(session, "Registered client session");
        (session, rx)
    }

    /// Completes `session` with `result`. Returns false if nothing was waiting.
    pub fn resolve(&mut self, session: u64, result: CommandResult) -> bool {
        if session == 0 {
            return false;
        }
        match self.pending.remove(&session) {
            Some(tx) => {
                // The caller may have given up; that's fine.
                let _ = tx.send(result);
                tracing::debug!(session, "Resolved client session");
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, session: u64) -> bool {
        self.pending.contains_key(&session)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_resolve() {
        let mut sessions = SessionRegistry::new();
        let (session, mut rx) = sessions.register();
        assert_ne!(session, 0);
        assert!(sessions.contains(session));

        assert!(sessions.resolve(session, Some(Payload::from("ok"))));
        assert!(!sessions.contains(session));
        assert_eq!(rx.try_recv().unwrap(), Some(Payload::from("ok")));

        // Exactly once
        assert!(!sessions.resolve(session, None));
    }

    #[test]
    fn test_internal_session_is_ignored() {
        let mut sessions = SessionRegistry::new();
        assert!(!sessions.resolve(0, None));
        assert!(sessions.is_empty());
    }

    #[test]
    fn test_register_prunes_abandoned_sessions() {
        let mut sessions = SessionRegistry::new();
        let (_, rx) = sessions.register();
        drop(rx);
        let (_, _rx) = sessions.register();
        assert_eq!(sessions.len(), 1);
    }

    #[test]
    fn test_sessions_are_unique() {
        let mut sessions = SessionRegistry::new();
        let mut receivers = Vec::new();
        for _ in 0..100 {
            receivers.push(sessions.register());
        }
        assert_eq!(sessions.len(), 100);
    }
}
