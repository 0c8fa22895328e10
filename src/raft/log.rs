use std::fmt;

use serde::{Deserialize, Serialize};

use crate::raft::cluster::ClusterConfiguration;

/// Opaque application command or result bytes.
#[derive(Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Payload(pub Vec<u8>);

impl Payload {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => write!(f, "Payload({:?})", s),
            Err(_) => write!(f, "Payload({} bytes)", self.0.len()),
        }
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Self(s.into_bytes())
    }
}

/// What a log entry carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Appended by a new leader to commit entries of earlier terms.
    Noop,
    /// Membership change, effective as soon as it is appended.
    Configuration(ClusterConfiguration),
    /// Client command for the resource registry.
    Application(Payload),
}

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    /// Client session waiting for this entry, 0 for internal entries.
    pub session: u64,
    pub command: Command,
}

impl LogEntry {
    pub fn new(term: u64, index: u64, session: u64, command: Command) -> Self {
        Self {
            term,
            index,
            session,
            command,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub last_included_index: u64,
    pub last_included_term: u64,
    pub config: ClusterConfiguration,
}

/// Compacted state of every entry up to `meta.last_included_index`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftSnapshot {
    pub meta: SnapshotMetadata,
    pub data: Vec<Payload>,
}

/// The replicated log.
///
/// Entries are contiguous and start right after the snapshot (or at 1).
/// Committed entries are never rewritten; they only leave the log through
/// `compact_with`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicatedLog {
    entries: Vec<LogEntry>,
    committed_index: u64,
    snapshot: Option<RaftSnapshot>,
}

impl ReplicatedLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log starting from a snapshot; everything in it counts as committed.
    pub fn from_snapshot(snapshot: RaftSnapshot) -> Self {
        Self {
            entries: Vec::new(),
            committed_index: snapshot.meta.last_included_index,
            snapshot: Some(snapshot),
        }
    }

    fn snapshot_index(&self) -> u64 {
        self.snapshot
            .as_ref()
            .map(|s| s.meta.last_included_index)
            .unwrap_or(0)
    }

    fn position(&self, index: u64) -> Option<usize> {
        let start = self.snapshot_index();
        if index <= start {
            return None;
        }
        let pos = (index - start - 1) as usize;
        (pos < self.entries.len()).then_some(pos)
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn get(&self, index: u64) -> Option<&LogEntry> {
        self.position(index).map(|pos| &self.entries[pos])
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.snapshot.is_none()
    }

    pub fn last_index(&self) -> u64 {
        self.entries
            .last()
            .map(|e| e.index)
            .unwrap_or_else(|| self.snapshot_index())
    }

    pub fn next_index(&self) -> u64 {
        self.last_index() + 1
    }

    /// Term of the last entry, or of the snapshot when all entries are compacted.
    pub fn last_term(&self) -> Option<u64> {
        self.entries
            .last()
            .map(|e| e.term)
            .or_else(|| self.snapshot.as_ref().map(|s| s.meta.last_included_term))
    }

    pub fn committed_index(&self) -> u64 {
        self.committed_index
    }

    /// Committed entries not yet folded into a snapshot.
    pub fn committed_entries(&self) -> u64 {
        self.committed_index - self.snapshot_index()
    }

    /// Term of the entry at `index`. Index 0 has term 0; compacted entries
    /// other than the snapshot boundary are unknown.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        if let Some(snapshot) = &self.snapshot {
            if index == snapshot.meta.last_included_index {
                return Some(snapshot.meta.last_included_term);
            }
        }
        self.get(index).map(|e| e.term)
    }

    /// Consistency check for `AppendEntries`.
    ///
    /// Indexes inside the snapshot match trivially: they are committed, and
    /// committed entries are identical on every node.
    pub fn contains_matching_entry(&self, term: u64, index: u64) -> bool {
        if index == 0 {
            return true;
        }
        if index < self.snapshot_index() {
            return true;
        }
        self.term_at(index) == Some(term)
    }

    /// Appends `entries`, which must start at or before `next_index()`.
    ///
    /// Entries already present with the same term are skipped; the first
    /// entry whose term differs truncates the log from its index. Returns the
    /// entries that were actually written so they can be persisted.
    ///
    /// # Panics
    ///
    /// If a conflict would truncate a committed entry or the entries leave a gap.
    pub fn append(&mut self, entries: Vec<LogEntry>) -> Vec<LogEntry> {
        let mut written = Vec::new();
        for entry in entries {
            if entry.index <= self.snapshot_index() {
                continue;
            }
            if written.is_empty() {
                if let Some(pos) = self.position(entry.index) {
                    if self.entries[pos].term == entry.term {
                        continue;
                    }
                    assert!(
                        entry.index > self.committed_index,
                        "conflicting entry at index {} would truncate committed log (committed {})",
                        entry.index,
                        self.committed_index
                    );
                    tracing::debug!(
                        index = entry.index,
                        existing_term = self.entries[pos].term,
                        new_term = entry.term,
                        "Truncating conflicting log suffix"
                    );
                    self.entries.truncate(pos);
                }
            }
            assert_eq!(
                entry.index,
                self.next_index(),
                "log entries must be contiguous"
            );
            self.entries.push(entry.clone());
            written.push(entry);
        }
        written
    }

    /// Entries in `[from, to]`, clamped to what the log holds.
    pub fn slice(&self, from: u64, to: u64) -> Vec<LogEntry> {
        let from = from.max(self.snapshot_index() + 1);
        let to = to.min(self.last_index());
        if from > to {
            return Vec::new();
        }
        match (self.position(from), self.position(to)) {
            (Some(a), Some(b)) => self.entries[a..=b].to_vec(),
            _ => Vec::new(),
        }
    }

    /// Up to `limit` entries starting at `index`.
    pub fn entries_batch_from(&self, index: u64, limit: usize) -> Vec<LogEntry> {
        match self.position(index.max(1)) {
            Some(pos) => {
                let end = (pos + limit).min(self.entries.len());
                self.entries[pos..end].to_vec()
            }
            None => Vec::new(),
        }
    }

    /// Advances the commit index. Never moves it backwards.
    pub fn commit(&mut self, index: u64) {
        assert!(
            index <= self.last_index(),
            "cannot commit index {} beyond last index {}",
            index,
            self.last_index()
        );
        if index > self.committed_index {
            self.committed_index = index;
        }
    }

    pub fn has_snapshot(&self) -> bool {
        self.snapshot.is_some()
    }

    pub fn snapshot(&self) -> Option<&RaftSnapshot> {
        self.snapshot.as_ref()
    }

    /// Replaces the log prefix up to the snapshot's last included index.
    ///
    /// Later entries survive only if the entry at the snapshot boundary has
    /// the snapshot's term; otherwise the whole log is discarded.
    pub fn compact_with(&mut self, snapshot: RaftSnapshot) {
        let index = snapshot.meta.last_included_index;
        let term = snapshot.meta.last_included_term;
        if index < self.snapshot_index() {
            return;
        }

        let keep_tail = self.term_at(index) == Some(term);
        if keep_tail {
            match self.position(index) {
                Some(pos) => {
                    self.entries.drain(..=pos);
                }
                // Same boundary as the current snapshot: every entry follows it
                None if index == self.snapshot_index() => {}
                None => self.entries.clear(),
            }
        } else {
            self.entries.clear();
        }

        self.committed_index = self.committed_index.max(index);
        self.snapshot = Some(snapshot);
    }

    /// The most recent configuration in the log, else the snapshot's.
    pub fn latest_config(&self) -> Option<ClusterConfiguration> {
        self.config_at(self.last_index())
    }

    /// The configuration in force at `index`.
    pub fn config_at(&self, index: u64) -> Option<ClusterConfiguration> {
        self.entries
            .iter()
            .rev()
            .filter(|e| e.index <= index)
            .find_map(|e| match &e.command {
                Command::Configuration(config) => Some(config.clone()),
                _ => None,
            })
            .or_else(|| self.snapshot.as_ref().map(|s| s.meta.config.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::DiscoveryNode;

    fn entry(term: u64, index: u64) -> LogEntry {
        LogEntry::new(term, index, 0, Command::Noop)
    }

    fn app(term: u64, index: u64, data: &str) -> LogEntry {
        LogEntry::new(term, index, 0, Command::Application(Payload::from(data)))
    }

    fn log_with_terms(terms: &[u64]) -> ReplicatedLog {
        let mut log = ReplicatedLog::new();
        let entries = terms
            .iter()
            .enumerate()
            .map(|(i, &t)| entry(t, i as u64 + 1))
            .collect();
        log.append(entries);
        log
    }

    fn snapshot(index: u64, term: u64) -> RaftSnapshot {
        RaftSnapshot {
            meta: SnapshotMetadata {
                last_included_index: index,
                last_included_term: term,
                config: ClusterConfiguration::stable([DiscoveryNode::new("a", 1)]),
            },
            data: vec![Payload::from("state")],
        }
    }

    #[test]
    fn test_empty_log() {
        let log = ReplicatedLog::new();
        assert!(log.is_empty());
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.next_index(), 1);
        assert_eq!(log.last_term(), None);
        assert_eq!(log.committed_index(), 0);
        assert!(log.contains_matching_entry(0, 0));
        assert!(!log.contains_matching_entry(1, 1));
    }

    #[test]
    fn test_append_and_lookup() {
        let log = log_with_terms(&[1, 1, 2]);
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.last_term(), Some(2));
        assert_eq!(log.term_at(0), Some(0));
        assert_eq!(log.term_at(2), Some(1));
        assert_eq!(log.term_at(4), None);
        assert!(log.contains_matching_entry(2, 3));
        assert!(!log.contains_matching_entry(1, 3));
    }

    #[test]
    fn test_append_is_idempotent() {
        let mut log = log_with_terms(&[1, 1, 2]);
        let written = log.append(vec![entry(1, 2), entry(2, 3)]);
        assert!(written.is_empty());
        assert_eq!(log.entries().len(), 3);
    }

    #[test]
    fn test_append_keeps_suffix_without_conflict() {
        let mut log = log_with_terms(&[1, 1, 1, 1]);
        // A delayed, shorter batch must not drop entries it doesn't conflict with
        log.append(vec![entry(1, 2)]);
        assert_eq!(log.last_index(), 4);
    }

    #[test]
    fn test_append_truncates_conflicting_suffix() {
        let mut log = log_with_terms(&[1, 1, 1, 1]);
        let written = log.append(vec![entry(1, 2), entry(3, 3)]);
        assert_eq!(written, vec![entry(3, 3)]);
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.term_at(3), Some(3));
    }

    #[test]
    #[should_panic(expected = "committed")]
    fn test_append_refuses_to_truncate_committed() {
        let mut log = log_with_terms(&[1, 1, 1]);
        log.commit(2);
        log.append(vec![entry(2, 2)]);
    }

    #[test]
    fn test_slice_and_batch() {
        let mut log = ReplicatedLog::new();
        log.append((1..=5).map(|i| app(1, i, &i.to_string())).collect());

        let slice = log.slice(2, 4);
        assert_eq!(slice.iter().map(|e| e.index).collect::<Vec<_>>(), vec![2, 3, 4]);
        assert_eq!(log.slice(4, 10).len(), 2);
        assert!(log.slice(6, 8).is_empty());

        assert_eq!(log.entries_batch_from(2, 2).len(), 2);
        assert_eq!(log.entries_batch_from(4, 10).len(), 2);
        assert!(log.entries_batch_from(6, 10).is_empty());
    }

    #[test]
    fn test_commit_is_monotonic() {
        let mut log = log_with_terms(&[1, 1, 1]);
        log.commit(2);
        log.commit(1);
        assert_eq!(log.committed_index(), 2);
        log.commit(3);
        assert_eq!(log.committed_index(), 3);
    }

    #[test]
    fn test_compact_keeps_later_entries() {
        let mut log = log_with_terms(&[1, 1, 2, 2, 2]);
        log.commit(3);
        log.compact_with(snapshot(3, 2));

        assert!(log.has_snapshot());
        assert!(!log.is_empty());
        assert_eq!(log.entries().len(), 2);
        assert_eq!(log.last_index(), 5);
        assert_eq!(log.term_at(3), Some(2));
        assert_eq!(log.term_at(2), None);
        assert_eq!(log.committed_entries(), 0);
        assert!(log.contains_matching_entry(2, 3));
        assert!(log.contains_matching_entry(9, 1));
        assert!(log.get(2).is_none());
        assert_eq!(log.get(4).map(|e| e.index), Some(4));
    }

    #[test]
    fn test_compact_again_at_same_index_keeps_entries() {
        let mut log = log_with_terms(&[1, 1, 1, 1, 1]);
        log.commit(3);
        log.compact_with(snapshot(3, 1));
        assert_eq!(log.entries().len(), 2);

        let mut replacement = snapshot(3, 1);
        replacement.data = vec![Payload::from("newer")];
        log.compact_with(replacement.clone());

        assert_eq!(log.last_index(), 5);
        assert_eq!(log.entries().len(), 2);
        assert_eq!(log.get(4).map(|e| e.index), Some(4));
        assert_eq!(log.snapshot(), Some(&replacement));
    }

    #[test]
    fn test_compact_beyond_log_discards_everything() {
        let mut log = log_with_terms(&[1, 1]);
        log.compact_with(snapshot(10, 3));
        assert!(log.entries().is_empty());
        assert_eq!(log.last_index(), 10);
        assert_eq!(log.last_term(), Some(3));
        assert_eq!(log.committed_index(), 10);
        assert_eq!(log.next_index(), 11);
    }

    #[test]
    fn test_compact_with_mismatching_term_discards_tail() {
        let mut log = log_with_terms(&[1, 1, 1, 1]);
        log.compact_with(snapshot(2, 5));
        assert!(log.entries().is_empty());
        assert_eq!(log.last_index(), 2);
    }

    #[test]
    fn test_snapshot_round_trip_matches_source() {
        let mut leader = log_with_terms(&[1, 1, 2, 2]);
        leader.commit(4);
        let snap = snapshot(4, leader.term_at(4).unwrap());
        leader.compact_with(snap.clone());

        let mut follower = ReplicatedLog::new();
        follower.compact_with(snap);

        assert_eq!(follower.last_index(), leader.last_index());
        assert_eq!(follower.last_term(), leader.last_term());
        assert_eq!(follower.committed_index(), leader.committed_index());
        assert_eq!(follower.snapshot(), leader.snapshot());
    }

    #[test]
    fn test_append_after_snapshot() {
        let mut log = ReplicatedLog::from_snapshot(snapshot(5, 2));
        let written = log.append(vec![entry(2, 5), entry(2, 6), entry(3, 7)]);
        assert_eq!(written.len(), 2);
        assert_eq!(log.last_index(), 7);
        assert_eq!(log.entries_batch_from(6, 10).len(), 2);
        assert!(log.entries_batch_from(5, 10).is_empty());
    }

    #[test]
    fn test_latest_config() {
        let a = DiscoveryNode::new("a", 1);
        let b = DiscoveryNode::new("b", 1);
        let mut log = ReplicatedLog::new();
        assert_eq!(log.latest_config(), None);

        let first = ClusterConfiguration::stable([a.clone()]);
        let second = ClusterConfiguration::stable([a, b]);
        log.append(vec![
            LogEntry::new(1, 1, 0, Command::Configuration(first.clone())),
            entry(1, 2),
            LogEntry::new(1, 3, 0, Command::Configuration(second.clone())),
        ]);
        assert_eq!(log.latest_config(), Some(second));
        assert_eq!(log.config_at(2), Some(first));
    }
}
