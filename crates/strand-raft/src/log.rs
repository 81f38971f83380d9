//! Raft log storage.
//!
//! [`LogStore`] abstracts where the replicated log lives. The service backs
//! it with a segmented on-disk log; [`MemLog`] keeps everything in memory
//! for unit tests. Indices are logical Raft indices starting at 1; after
//! compaction the store remembers the snapshot boundary and refuses reads
//! below it.

use std::collections::VecDeque;

use bytes::Bytes;
use parking_lot::RwLock;

use crate::rpc::{LogEntry, Term};
use crate::{LogIndex, RaftError, Result};

/// Boundary of the entries folded into a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotMeta {
    /// Last log index the snapshot covers.
    pub last_included_index: LogIndex,
    /// Term of that entry.
    pub last_included_term: Term,
}

/// Storage interface for the replicated log.
///
/// Implementations serialize internally; the node calls them from a single
/// driver task but read paths may be shared.
pub trait LogStore: Send + Sync {
    /// First index still present (after compaction).
    fn first_index(&self) -> LogIndex;

    /// Last appended index, or the snapshot boundary for an empty log.
    fn last_index(&self) -> LogIndex;

    /// Term of the last entry, falling back to the snapshot's term.
    fn last_term(&self) -> Term;

    /// Term of the entry at `index`; `None` if absent or compacted.
    /// Index 0 always reports term 0.
    fn term_at(&self, index: LogIndex) -> Option<Term>;

    /// The entry at `index`, if present.
    fn entry(&self, index: LogIndex) -> Option<LogEntry>;

    /// Entries in `[start, end)`. Errors with [`RaftError::LogCompacted`]
    /// when the range starts below [`LogStore::first_index`].
    fn entries(&self, start: LogIndex, end: LogIndex) -> Result<Vec<LogEntry>>;

    /// Appends one entry; its index must be exactly `last_index() + 1`.
    fn append(&self, entry: LogEntry) -> Result<()>;

    /// Appends replicated entries, truncating any conflicting suffix.
    /// Entries already present with matching terms are skipped.
    fn append_entries(&self, entries: Vec<LogEntry>) -> Result<()>;

    /// Drops entries up to and including `index`, recording the snapshot
    /// boundary.
    fn compact(&self, index: LogIndex, term: Term) -> Result<()>;

    /// Discards everything and adopts the given snapshot boundary.
    fn reset_to_snapshot(&self, meta: SnapshotMeta) -> Result<()>;

    /// The current snapshot boundary.
    fn snapshot_meta(&self) -> SnapshotMeta;

    /// Flushes to durable storage where applicable.
    fn sync(&self) -> Result<()> {
        Ok(())
    }

    /// True when the follower's log at `(index, term)` matches ours.
    fn match_term(&self, index: LogIndex, term: Term) -> bool {
        if index == 0 {
            return term == 0;
        }
        self.term_at(index).map(|t| t == term).unwrap_or(false)
    }

    /// Election rule: is a candidate with this last entry at least as
    /// up-to-date as we are?
    fn is_up_to_date(&self, candidate_last_index: LogIndex, candidate_last_term: Term) -> bool {
        let our_term = self.last_term();
        if candidate_last_term != our_term {
            candidate_last_term > our_term
        } else {
            candidate_last_index >= self.last_index()
        }
    }

    /// First index carrying `term`, for fast replication rollback.
    fn find_first_index_of_term(&self, term: Term) -> Option<LogIndex> {
        let mut index = self.first_index();
        let last = self.last_index();
        while index <= last {
            if self.term_at(index) == Some(term) {
                return Some(index);
            }
            index += 1;
        }
        None
    }

    /// Entries to ship to a follower whose next expected index is
    /// `next_index`, capped at `max_entries`, together with the preceding
    /// `(prev_log_index, prev_log_term)` pair.
    fn entries_for_follower(
        &self,
        next_index: LogIndex,
        max_entries: usize,
    ) -> Result<(LogIndex, Term, Vec<LogEntry>)> {
        let prev_index = next_index.saturating_sub(1);
        let prev_term = self.term_at(prev_index).ok_or(RaftError::LogCompacted {
            first_index: self.first_index(),
        })?;

        let end = (next_index + max_entries as u64).min(self.last_index() + 1);
        let entries = self.entries(next_index, end)?;

        Ok((prev_index, prev_term, entries))
    }
}

/// In-memory [`LogStore`] used by tests and simulations.
#[derive(Debug, Default)]
pub struct MemLog {
    inner: RwLock<MemLogInner>,
}

#[derive(Debug, Default)]
struct MemLogInner {
    entries: VecDeque<LogEntry>,
    /// Indices at or below this are compacted away.
    offset: LogIndex,
    snapshot: SnapshotMeta,
}

impl MemLogInner {
    fn physical(&self, index: LogIndex) -> Option<usize> {
        index.checked_sub(self.offset + 1).map(|i| i as usize)
    }
}

impl MemLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a log whose entries start after the given snapshot boundary.
    pub fn from_snapshot(meta: SnapshotMeta) -> Self {
        Self {
            inner: RwLock::new(MemLogInner {
                entries: VecDeque::new(),
                offset: meta.last_included_index,
                snapshot: meta,
            }),
        }
    }

    /// Number of entries currently held.
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// True when no entries are held.
    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }
}

impl LogStore for MemLog {
    fn first_index(&self) -> LogIndex {
        self.inner.read().offset + 1
    }

    fn last_index(&self) -> LogIndex {
        let inner = self.inner.read();
        inner
            .entries
            .back()
            .map(|e| e.index)
            .unwrap_or(inner.offset)
    }

    fn last_term(&self) -> Term {
        let inner = self.inner.read();
        inner
            .entries
            .back()
            .map(|e| e.term)
            .unwrap_or(inner.snapshot.last_included_term)
    }

    fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }

        let inner = self.inner.read();
        if index == inner.snapshot.last_included_index {
            return Some(inner.snapshot.last_included_term);
        }
        if index <= inner.offset {
            return None;
        }

        let physical = inner.physical(index)?;
        inner.entries.get(physical).map(|e| e.term)
    }

    fn entry(&self, index: LogIndex) -> Option<LogEntry> {
        let inner = self.inner.read();
        if index == 0 || index <= inner.offset {
            return None;
        }
        let physical = inner.physical(index)?;
        inner.entries.get(physical).cloned()
    }

    fn entries(&self, start: LogIndex, end: LogIndex) -> Result<Vec<LogEntry>> {
        if start >= end {
            return Ok(Vec::new());
        }

        let inner = self.inner.read();
        if start <= inner.offset && inner.offset > 0 {
            return Err(RaftError::LogCompacted {
                first_index: inner.offset + 1,
            });
        }

        let mut out = Vec::with_capacity((end - start) as usize);
        for index in start..end {
            match inner.physical(index).and_then(|p| inner.entries.get(p)) {
                Some(entry) => out.push(entry.clone()),
                None => break,
            }
        }
        Ok(out)
    }

    fn append(&self, entry: LogEntry) -> Result<()> {
        let mut inner = self.inner.write();
        let expected = inner
            .entries
            .back()
            .map(|e| e.index + 1)
            .unwrap_or(inner.offset + 1);

        if entry.index != expected {
            return Err(RaftError::Internal(format!(
                "log gap: expected index {expected}, got {}",
                entry.index
            )));
        }

        inner.entries.push_back(entry);
        Ok(())
    }

    fn append_entries(&self, entries: Vec<LogEntry>) -> Result<()> {
        let mut inner = self.inner.write();

        for entry in entries {
            let Some(physical) = inner.physical(entry.index) else {
                // Below the snapshot boundary; already covered.
                continue;
            };

            if physical < inner.entries.len() {
                if inner.entries[physical].term != entry.term {
                    inner.entries.truncate(physical);
                    inner.entries.push_back(entry);
                }
            } else if physical == inner.entries.len() {
                inner.entries.push_back(entry);
            } else {
                return Err(RaftError::Internal(format!(
                    "log gap at index {}",
                    entry.index
                )));
            }
        }

        Ok(())
    }

    fn compact(&self, index: LogIndex, term: Term) -> Result<()> {
        let mut inner = self.inner.write();

        let first = inner.offset + 1;
        if index >= first {
            let drop = (index - first + 1) as usize;
            for _ in 0..drop.min(inner.entries.len()) {
                inner.entries.pop_front();
            }
        }

        inner.offset = index;
        inner.snapshot = SnapshotMeta {
            last_included_index: index,
            last_included_term: term,
        };

        Ok(())
    }

    fn reset_to_snapshot(&self, meta: SnapshotMeta) -> Result<()> {
        let mut inner = self.inner.write();
        inner.entries.clear();
        inner.offset = meta.last_included_index;
        inner.snapshot = meta;
        Ok(())
    }

    fn snapshot_meta(&self) -> SnapshotMeta {
        self.inner.read().snapshot.clone()
    }
}

/// Builds the next entry for this log.
pub fn next_entry(
    log: &dyn LogStore,
    term: Term,
    entry_type: crate::rpc::EntryType,
    data: Bytes,
) -> LogEntry {
    LogEntry {
        term,
        index: log.last_index() + 1,
        entry_type,
        data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(term: Term, index: LogIndex, data: &str) -> LogEntry {
        LogEntry::command(term, index, Bytes::from(data.to_string()))
    }

    #[test]
    fn test_empty_log() {
        let log = MemLog::new();
        assert_eq!(log.first_index(), 1);
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.last_term(), 0);
        assert_eq!(log.term_at(0), Some(0));
        assert_eq!(log.term_at(1), None);
    }

    #[test]
    fn test_append_and_read() {
        let log = MemLog::new();
        for i in 1..=5 {
            log.append(entry(1, i, "cmd")).unwrap();
        }

        assert_eq!(log.last_index(), 5);
        assert_eq!(log.entry(3).unwrap().index, 3);

        let range = log.entries(2, 5).unwrap();
        assert_eq!(range.len(), 3);
        assert_eq!(range[0].index, 2);
    }

    #[test]
    fn test_append_gap_rejected() {
        let log = MemLog::new();
        assert!(log.append(entry(1, 5, "cmd")).is_err());
    }

    #[test]
    fn test_conflict_truncation() {
        let log = MemLog::new();
        for i in 1..=5 {
            log.append(entry(1, i, "old")).unwrap();
        }

        log.append_entries(vec![
            entry(2, 3, "new3"),
            entry(2, 4, "new4"),
        ])
        .unwrap();

        assert_eq!(log.term_at(2), Some(1));
        assert_eq!(log.term_at(3), Some(2));
        assert_eq!(log.term_at(4), Some(2));
        assert_eq!(log.last_index(), 4);
    }

    #[test]
    fn test_compact() {
        let log = MemLog::new();
        for i in 1..=10 {
            log.append(entry(1, i, "cmd")).unwrap();
        }

        log.compact(5, 1).unwrap();

        assert_eq!(log.first_index(), 6);
        assert_eq!(log.last_index(), 10);
        assert_eq!(log.term_at(5), Some(1)); // snapshot boundary
        assert_eq!(log.term_at(4), None);
        assert!(log.entries(3, 8).is_err());
    }

    #[test]
    fn test_up_to_date_rule() {
        let log = MemLog::new();
        log.append(entry(1, 1, "a")).unwrap();
        log.append(entry(2, 2, "b")).unwrap();

        assert!(!log.is_up_to_date(1, 1));
        assert!(log.is_up_to_date(2, 2));
        assert!(log.is_up_to_date(3, 2));
        assert!(log.is_up_to_date(1, 3));
        assert!(!log.is_up_to_date(5, 1));
    }

    #[test]
    fn test_entries_for_follower() {
        let log = MemLog::new();
        for i in 1..=10 {
            log.append(entry(1, i, "cmd")).unwrap();
        }

        let (prev_index, prev_term, entries) = log.entries_for_follower(5, 3).unwrap();
        assert_eq!(prev_index, 4);
        assert_eq!(prev_term, 1);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].index, 5);
    }

    #[test]
    fn test_reset_to_snapshot() {
        let log = MemLog::new();
        for i in 1..=3 {
            log.append(entry(1, i, "cmd")).unwrap();
        }

        log.reset_to_snapshot(SnapshotMeta {
            last_included_index: 100,
            last_included_term: 4,
        })
        .unwrap();

        assert!(log.is_empty());
        assert_eq!(log.first_index(), 101);
        assert_eq!(log.last_index(), 100);
        assert_eq!(log.last_term(), 4);

        log.append(LogEntry::command(5, 101, Bytes::from_static(b"x")))
            .unwrap();
        assert_eq!(log.last_index(), 101);
    }

    #[test]
    fn test_find_first_index_of_term() {
        let log = MemLog::new();
        for (term, index) in [(1, 1), (1, 2), (2, 3), (2, 4), (3, 5)] {
            log.append(entry(term, index, "cmd")).unwrap();
        }

        assert_eq!(log.find_first_index_of_term(1), Some(1));
        assert_eq!(log.find_first_index_of_term(2), Some(3));
        assert_eq!(log.find_first_index_of_term(3), Some(5));
        assert_eq!(log.find_first_index_of_term(4), None);
    }
}
