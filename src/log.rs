//! The in-memory ordered log of a Raft node.

use bytes::Bytes;

use crate::message::LogEntry;

/// A contiguous, zero-indexed sequence of [`LogEntry`] values.
///
/// Entries are never reordered. The tail may only be discarded through
/// [`truncate_from`](Self::truncate_from), which the append-entries conflict rule drives;
/// everything below the commit index is immutable. An entry's `index` field always equals
/// its slot in the backing vector.
#[derive(Clone, Debug, Default)]
pub struct RaftLog {
    entries: Vec<LogEntry>,
}

impl RaftLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a log from recovered entries.
    pub(crate) fn restore(entries: Vec<LogEntry>) -> Self {
        debug_assert!(entries.iter().enumerate().all(|(i, e)| e.index == i as u64));
        Self { entries }
    }

    pub fn len(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Index of the last entry, or `None` for an empty log.
    pub fn last_index(&self) -> Option<u64> {
        self.entries.last().map(|entry| entry.index)
    }

    /// Term of the last entry, or `0` for an empty log.
    pub fn last_term(&self) -> u64 {
        self.entries.last().map(|entry| entry.term).unwrap_or(0)
    }

    pub fn entry(&self, index: u64) -> Option<&LogEntry> {
        self.entries.get(index as usize)
    }

    /// Term of the entry at `index`, or `None` when no such entry exists.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        self.entry(index).map(|entry| entry.term)
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// The suffix starting at `index`; empty when `index` is at or past the end.
    pub fn entries_from(&self, index: u64) -> &[LogEntry] {
        let start = (index as usize).min(self.entries.len());
        &self.entries[start..]
    }

    /// Appends a new entry created by the leader in `term`, assigning the next index.
    pub(crate) fn append_command(&mut self, term: u64, command: Bytes) -> &LogEntry {
        let index = self.len();
        self.entries.push(LogEntry::new(index, term, command));
        // push succeeded, so last() is present
        self.entries.last().unwrap()
    }

    /// Appends a replicated entry at its own index, which must be the next slot.
    pub(crate) fn push(&mut self, entry: LogEntry) {
        debug_assert_eq!(entry.index, self.len());
        self.entries.push(entry);
    }

    /// Discards the entry at `index` and everything after it, returning how many entries
    /// were removed.
    pub(crate) fn truncate_from(&mut self, index: u64) -> usize {
        let keep = (index as usize).min(self.entries.len());
        let removed = self.entries.len() - keep;
        self.entries.truncate(keep);
        removed
    }
}
