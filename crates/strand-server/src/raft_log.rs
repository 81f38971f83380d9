//! Raft's log, backed by a second segmented log.
//!
//! Raft indexes start at 1, so the segmented log underneath runs with
//! `initial_offset = 1` and record offsets coincide with Raft indices. Each
//! record's value packs `term (u64 BE) | entry type (u8) | data`, keeping
//! the entry self-describing on disk.
//!
//! A deque of decoded entries fronts the segmented log: reads hit the
//! cache, the disk copy is authoritative, and on open the cache is rebuilt
//! by scanning the segments. Suffix conflicts (a new leader overwriting
//! uncommitted entries) rewrite the tail through reset + re-append; they
//! are rare enough that simplicity wins.
//!
//! Compaction meta also records the user log's next offset at the boundary
//! (`applied_mark`). Recovery counts `Append` commands forward from that
//! mark to find how far the state machine had actually applied; neither
//! log fsyncs per record, so the two may disagree by a tail after a crash.

use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use strand_api::Record;
use strand_log::{Log, LogConfig};
use strand_raft::log::{LogStore, SnapshotMeta};
use strand_raft::rpc::{EntryType, LogEntry, Term};
use strand_raft::{LogIndex, RaftError, Result};

use crate::error::ServerResult;

const META_FILE: &str = "meta";
const META_FILE_TMP: &str = "meta.tmp";

/// Supplies the user log's next offset when a snapshot boundary is
/// recorded.
pub type MarkSource = Box<dyn Fn() -> u64 + Send + Sync>;

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct StoreMeta {
    last_included_index: LogIndex,
    last_included_term: Term,
    /// User log next offset at the boundary; recovery's counting base.
    applied_mark: u64,
}

/// `LogStore` over a segmented log with a decoded-entry cache.
pub struct RaftLogStore {
    log: Log,
    dir: PathBuf,
    entries: RwLock<VecDeque<LogEntry>>,
    meta: RwLock<StoreMeta>,
    mark_source: MarkSource,
}

fn encode_entry(entry: &LogEntry) -> Bytes {
    let mut buf = BytesMut::with_capacity(8 + 1 + entry.data.len());
    buf.put_u64(entry.term);
    buf.put_u8(match entry.entry_type {
        EntryType::Command => 0,
        EntryType::Noop => 1,
        EntryType::Config => 2,
    });
    buf.put_slice(&entry.data);
    buf.freeze()
}

fn decode_entry(record: &Record) -> Result<LogEntry> {
    let mut value = record.value.clone();
    if value.remaining() < 9 {
        return Err(RaftError::Storage(format!(
            "raft record at {} too short",
            record.offset
        )));
    }

    let term = value.get_u64();
    let entry_type = match value.get_u8() {
        0 => EntryType::Command,
        1 => EntryType::Noop,
        2 => EntryType::Config,
        other => {
            return Err(RaftError::Storage(format!(
                "unknown raft entry type {other} at {}",
                record.offset
            )))
        }
    };

    Ok(LogEntry {
        term,
        index: record.offset,
        entry_type,
        data: value,
    })
}

impl RaftLogStore {
    /// Opens (or creates) the store in `dir`.
    ///
    /// `mark_source` reports the user log's next offset; it is sampled
    /// whenever a snapshot boundary is recorded.
    pub fn new(
        dir: impl AsRef<Path>,
        mut config: LogConfig,
        mark_source: MarkSource,
    ) -> ServerResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        // Raft's log is 1-indexed.
        config.initial_offset = 1;
        let log = Log::new(&dir, config)?;

        let meta_path = dir.join(META_FILE);
        let meta = if meta_path.exists() {
            let bytes = fs::read(&meta_path)?;
            bincode::deserialize(&bytes).unwrap_or_default()
        } else {
            StoreMeta {
                applied_mark: mark_source(),
                ..StoreMeta::default()
            }
        };

        // Rebuild the entry cache from the segments above the boundary.
        let mut entries = VecDeque::new();
        let start = log.lowest_offset().max(meta.last_included_index + 1);
        for index in start..log.next_offset() {
            let record = log.read(index)?;
            entries.push_back(decode_entry(&record)?);
        }

        debug!(
            entries = entries.len(),
            boundary = meta.last_included_index,
            "opened raft log store"
        );

        Ok(Self {
            log,
            dir,
            entries: RwLock::new(entries),
            meta: RwLock::new(meta),
            mark_source,
        })
    }

    fn save_meta(&self, meta: &StoreMeta) -> Result<()> {
        let tmp = self.dir.join(META_FILE_TMP);
        let live = self.dir.join(META_FILE);

        let bytes =
            bincode::serialize(meta).map_err(|e| RaftError::Storage(e.to_string()))?;

        let write = || -> std::io::Result<()> {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
            drop(file);
            fs::rename(&tmp, &live)
        };
        write().map_err(|e| RaftError::Storage(e.to_string()))
    }

    fn write_record(&self, entry: &LogEntry) -> Result<()> {
        let record = Record {
            value: encode_entry(entry),
            offset: 0,
        };
        let assigned = self
            .log
            .append(&record)
            .map_err(|e| RaftError::Storage(e.to_string()))?;
        if assigned != entry.index {
            return Err(RaftError::Internal(format!(
                "raft log misaligned: entry {} landed at offset {assigned}",
                entry.index
            )));
        }
        Ok(())
    }

    /// Rewrites the on-disk suffix to match the cache after a conflict
    /// truncation.
    fn rewrite_from(&self, entries: &VecDeque<LogEntry>, boundary: LogIndex) -> Result<()> {
        self.log
            .reset_to(boundary + 1)
            .map_err(|e| RaftError::Storage(e.to_string()))?;
        for entry in entries {
            self.write_record(entry)?;
        }
        Ok(())
    }

    /// Finds how far the state machine had applied before a restart.
    ///
    /// Counts `Append` commands from the compaction boundary's
    /// `applied_mark` until the count reaches the user log's durable next
    /// offset; everything up to that point has observably been applied.
    pub fn recover_applied(&self, user_next_offset: u64) -> LogIndex {
        let meta = self.meta.read().clone();
        let mut applied = meta.last_included_index;
        let mut counted = meta.applied_mark;
        let mut index = applied + 1;

        while counted < user_next_offset {
            match self.entry(index) {
                Some(entry) => {
                    if entry.entry_type == EntryType::Command {
                        counted += 1;
                    }
                    applied = index;
                    index += 1;
                }
                None => {
                    warn!(
                        counted,
                        user_next_offset, "user log ahead of raft log; accepting tail as applied"
                    );
                    break;
                }
            }
        }

        applied
    }

    /// Flushes and syncs the segments.
    pub fn close(&self) -> ServerResult<()> {
        self.log.close()?;
        Ok(())
    }
}

fn storage_err(e: strand_log::LogError) -> RaftError {
    RaftError::Storage(e.to_string())
}

impl LogStore for RaftLogStore {
    fn first_index(&self) -> LogIndex {
        self.meta.read().last_included_index + 1
    }

    fn last_index(&self) -> LogIndex {
        let entries = self.entries.read();
        entries
            .back()
            .map(|e| e.index)
            .unwrap_or(self.meta.read().last_included_index)
    }

    fn last_term(&self) -> Term {
        let entries = self.entries.read();
        entries
            .back()
            .map(|e| e.term)
            .unwrap_or(self.meta.read().last_included_term)
    }

    fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }

        let meta = self.meta.read();
        if index == meta.last_included_index {
            return Some(meta.last_included_term);
        }
        if index <= meta.last_included_index {
            return None;
        }
        let boundary = meta.last_included_index;
        drop(meta);

        let entries = self.entries.read();
        let physical = (index - boundary - 1) as usize;
        entries.get(physical).map(|e| e.term)
    }

    fn entry(&self, index: LogIndex) -> Option<LogEntry> {
        let boundary = self.meta.read().last_included_index;
        if index == 0 || index <= boundary {
            return None;
        }

        let entries = self.entries.read();
        let physical = (index - boundary - 1) as usize;
        entries.get(physical).cloned()
    }

    fn entries(&self, start: LogIndex, end: LogIndex) -> Result<Vec<LogEntry>> {
        if start >= end {
            return Ok(Vec::new());
        }

        let boundary = self.meta.read().last_included_index;
        if start <= boundary && boundary > 0 {
            return Err(RaftError::LogCompacted {
                first_index: boundary + 1,
            });
        }

        let entries = self.entries.read();
        let mut out = Vec::with_capacity((end - start) as usize);
        for index in start..end {
            let physical = (index - boundary - 1) as usize;
            match entries.get(physical) {
                Some(entry) => out.push(entry.clone()),
                None => break,
            }
        }
        Ok(out)
    }

    fn append(&self, entry: LogEntry) -> Result<()> {
        let mut entries = self.entries.write();
        let expected = entries
            .back()
            .map(|e| e.index + 1)
            .unwrap_or_else(|| self.meta.read().last_included_index + 1);

        if entry.index != expected {
            return Err(RaftError::Internal(format!(
                "raft log gap: expected {expected}, got {}",
                entry.index
            )));
        }

        self.write_record(&entry)?;
        self.log
            .flush()
            .map_err(storage_err)?;
        entries.push_back(entry);
        Ok(())
    }

    fn append_entries(&self, new_entries: Vec<LogEntry>) -> Result<()> {
        if new_entries.is_empty() {
            return Ok(());
        }

        let boundary = self.meta.read().last_included_index;
        let mut entries = self.entries.write();

        for entry in new_entries {
            if entry.index <= boundary {
                // Already folded into the snapshot.
                continue;
            }

            let physical = (entry.index - boundary - 1) as usize;
            if physical < entries.len() {
                if entries[physical].term != entry.term {
                    entries.truncate(physical);
                    self.rewrite_from(&entries, boundary)?;
                    self.write_record(&entry)?;
                    entries.push_back(entry);
                }
            } else if physical == entries.len() {
                self.write_record(&entry)?;
                entries.push_back(entry);
            } else {
                return Err(RaftError::Internal(format!(
                    "raft log gap at index {}",
                    entry.index
                )));
            }
        }

        self.log.flush().map_err(storage_err)
    }

    fn compact(&self, index: LogIndex, term: Term) -> Result<()> {
        let mut entries = self.entries.write();
        let mut meta = self.meta.write();

        let first = meta.last_included_index + 1;
        if index >= first {
            let drop_count = (index - first + 1) as usize;
            for _ in 0..drop_count.min(entries.len()) {
                entries.pop_front();
            }
        }

        meta.last_included_index = index;
        meta.last_included_term = term;
        meta.applied_mark = (self.mark_source)();
        self.save_meta(&meta)?;

        // Segment-granular head pruning; stale records below the boundary
        // may survive until their segment ages out, the cache skips them.
        self.log
            .truncate(index + 1)
            .map_err(storage_err)?;

        Ok(())
    }

    fn reset_to_snapshot(&self, snapshot: SnapshotMeta) -> Result<()> {
        let mut entries = self.entries.write();
        let mut meta = self.meta.write();

        entries.clear();
        self.log
            .reset_to(snapshot.last_included_index + 1)
            .map_err(storage_err)?;

        meta.last_included_index = snapshot.last_included_index;
        meta.last_included_term = snapshot.last_included_term;
        // The state machine restored before this call, so the mark source
        // reads the post-restore next offset.
        meta.applied_mark = (self.mark_source)();
        self.save_meta(&meta)?;

        Ok(())
    }

    fn snapshot_meta(&self) -> SnapshotMeta {
        let meta = self.meta.read();
        SnapshotMeta {
            last_included_index: meta.last_included_index,
            last_included_term: meta.last_included_term,
        }
    }

    fn sync(&self) -> Result<()> {
        self.log.flush().map_err(storage_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn store_with_mark(dir: &Path, mark: Arc<AtomicU64>) -> RaftLogStore {
        let source: MarkSource = Box::new(move || mark.load(Ordering::Acquire));
        RaftLogStore::new(dir, LogConfig::default().with_max_store_bytes(4096), source).unwrap()
    }

    fn store(dir: &Path) -> RaftLogStore {
        store_with_mark(dir, Arc::new(AtomicU64::new(0)))
    }

    fn command(term: Term, index: LogIndex, data: &str) -> LogEntry {
        LogEntry::command(term, index, Bytes::from(data.to_string()))
    }

    #[test]
    fn test_append_and_read() {
        let tmp = TempDir::new().unwrap();
        let store = store(tmp.path());

        assert_eq!(store.first_index(), 1);
        assert_eq!(store.last_index(), 0);

        for i in 1..=5 {
            store.append(command(1, i, "cmd")).unwrap();
        }

        assert_eq!(store.last_index(), 5);
        let entry = store.entry(3).unwrap();
        assert_eq!(entry.index, 3);
        assert_eq!(entry.data.as_ref(), b"cmd");
        assert_eq!(store.term_at(5), Some(1));
    }

    #[test]
    fn test_reopen_rebuilds_cache() {
        let tmp = TempDir::new().unwrap();

        {
            let store = store(tmp.path());
            for i in 1..=4 {
                store.append(command(2, i, &format!("cmd-{i}"))).unwrap();
            }
            store.close().unwrap();
        }

        let store = store(tmp.path());
        assert_eq!(store.last_index(), 4);
        assert_eq!(store.last_term(), 2);
        assert_eq!(store.entry(2).unwrap().data.as_ref(), b"cmd-2");
    }

    #[test]
    fn test_conflict_rewrites_suffix() {
        let tmp = TempDir::new().unwrap();
        let store = store(tmp.path());

        for i in 1..=5 {
            store.append(command(1, i, "old")).unwrap();
        }

        store
            .append_entries(vec![command(2, 3, "new3"), command(2, 4, "new4")])
            .unwrap();

        assert_eq!(store.last_index(), 4);
        assert_eq!(store.term_at(2), Some(1));
        assert_eq!(store.term_at(3), Some(2));
        assert_eq!(store.entry(4).unwrap().data.as_ref(), b"new4");
    }

    #[test]
    fn test_conflict_survives_reopen() {
        let tmp = TempDir::new().unwrap();

        {
            let store = store(tmp.path());
            for i in 1..=5 {
                store.append(command(1, i, "old")).unwrap();
            }
            store
                .append_entries(vec![command(2, 3, "new3")])
                .unwrap();
            store.close().unwrap();
        }

        let store = store(tmp.path());
        assert_eq!(store.last_index(), 3);
        assert_eq!(store.entry(3).unwrap().data.as_ref(), b"new3");
    }

    #[test]
    fn test_compact_records_boundary_and_mark() {
        let tmp = TempDir::new().unwrap();
        let mark = Arc::new(AtomicU64::new(0));
        let store = store_with_mark(tmp.path(), Arc::clone(&mark));

        for i in 1..=10 {
            store.append(command(1, i, "cmd")).unwrap();
        }

        mark.store(7, Ordering::Release);
        store.compact(6, 1).unwrap();

        assert_eq!(store.first_index(), 7);
        assert_eq!(store.last_index(), 10);
        assert_eq!(store.term_at(6), Some(1));
        assert!(store.entries(4, 8).is_err());
    }

    #[test]
    fn test_recover_applied_counts_commands() {
        let tmp = TempDir::new().unwrap();
        let store = store(tmp.path());

        // noop, cmd, cmd, config, cmd -> user offsets 0, 1, 2
        store.append(LogEntry::noop(1, 1)).unwrap();
        store.append(command(1, 2, "a")).unwrap();
        store.append(command(1, 3, "b")).unwrap();
        store
            .append(LogEntry::config(1, 4, Bytes::from_static(b"cfg")))
            .unwrap();
        store.append(command(1, 5, "c")).unwrap();

        // User log durably holds two records: applied through index 3.
        assert_eq!(store.recover_applied(2), 3);
        // All three records: applied through index 5 (the config entry at 4
        // gets re-applied harmlessly when only two records survive).
        assert_eq!(store.recover_applied(3), 5);
        // Nothing: nothing applied.
        assert_eq!(store.recover_applied(0), 0);
    }
}
