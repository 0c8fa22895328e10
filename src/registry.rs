use std::sync::{Arc, Mutex};

use crate::raft::log::{Payload, SnapshotMetadata};

/// Application state machines fed by committed log entries.
pub trait ResourceRegistry: Send + 'static {
    /// Applies a committed command. `None` means there is nothing to report
    /// back to the client.
    fn apply(&mut self, index: u64, command: &Payload) -> Option<Payload>;

    /// Captures the state produced by every entry up to
    /// `meta.last_included_index`.
    fn prepare_snapshot(&mut self, meta: &SnapshotMetadata) -> Vec<Payload>;

    /// Replaces local state with a snapshot received from the leader (or
    /// loaded on restart). Replays every record through `apply` unless
    /// overridden.
    fn install_snapshot(&mut self, meta: &SnapshotMetadata, data: &[Payload]) {
        for record in data {
            self.apply(meta.last_included_index, record);
        }
    }
}

impl<R: ResourceRegistry + ?Sized> ResourceRegistry for Box<R> {
    fn apply(&mut self, index: u64, command: &Payload) -> Option<Payload> {
        (**self).apply(index, command)
    }

    fn prepare_snapshot(&mut self, meta: &SnapshotMetadata) -> Vec<Payload> {
        (**self).prepare_snapshot(meta)
    }

    fn install_snapshot(&mut self, meta: &SnapshotMetadata, data: &[Payload]) {
        (**self).install_snapshot(meta, data)
    }
}

/// Registry that records every applied command and echoes it back as the
/// result. Its snapshot is the list of commands applied so far.
#[derive(Debug, Clone, Default)]
pub struct RecordingRegistry {
    applied: Arc<Mutex<Vec<Payload>>>,
}

impl RecordingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands applied so far, in commit order.
    pub fn applied(&self) -> Vec<Payload> {
        self.applied
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl ResourceRegistry for RecordingRegistry {
    fn apply(&mut self, _index: u64, command: &Payload) -> Option<Payload> {
        self.applied
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(command.clone());
        Some(command.clone())
    }

    fn prepare_snapshot(&mut self, _meta: &SnapshotMetadata) -> Vec<Payload> {
        self.applied()
    }

    fn install_snapshot(&mut self, _meta: &SnapshotMetadata, data: &[Payload]) {
        *self
            .applied
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = data.to_vec();
    }
}
