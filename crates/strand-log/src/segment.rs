//! Segments: one store file paired with one index file.
//!
//! A segment covers a contiguous offset range starting at its base offset.
//! Records are stored with their absolute offset baked into the encoded
//! bytes, so the store frame is the same encoding that travels on the wire.

use std::fs;
use std::path::{Path, PathBuf};

use prost::Message;

use crate::config::LogConfig;
use crate::error::{LogError, LogResult};
use crate::index::{Index, ENTRY_WIDTH};
use crate::store::Store;
use strand_api::Record;

/// A `(store, index)` pair covering offsets `[base_offset, next_offset)`.
pub struct Segment {
    store: Store,
    index: Index,
    base_offset: u64,
    next_offset: u64,
    config: LogConfig,
}

impl Segment {
    /// Opens (or creates) the segment with the given base offset in `dir`.
    ///
    /// `next_offset` is recovered from the index's last entry, so a segment
    /// reopened after a clean close resumes exactly where it left off.
    pub fn new(dir: impl AsRef<Path>, base_offset: u64, config: LogConfig) -> LogResult<Self> {
        let dir = dir.as_ref();

        let store = Store::new(store_path(dir, base_offset))?;
        let index = Index::new(index_path(dir, base_offset), config.max_index_bytes)?;

        let next_offset = match index.read(-1) {
            Ok((rel, _)) => base_offset + u64::from(rel) + 1,
            Err(LogError::Eof) => base_offset,
            Err(e) => return Err(e),
        };

        Ok(Self {
            store,
            index,
            base_offset,
            next_offset,
            config,
        })
    }

    /// Appends a record, assigning it the segment's next offset.
    ///
    /// The store write completes before the index entry becomes visible, so
    /// a reader never resolves an offset to a missing frame.
    pub fn append(&mut self, record: &Record) -> LogResult<u64> {
        if self.is_full() {
            return Err(LogError::SegmentFull);
        }

        let offset = self.next_offset;
        let stored = Record {
            value: record.value.clone(),
            offset,
        };

        let (_, position) = self.store.append(&stored.encode_to_vec())?;
        self.index
            .write((offset - self.base_offset) as u32, position)?;

        self.next_offset += 1;
        Ok(offset)
    }

    /// Reads the record at the given absolute offset.
    pub fn read(&self, offset: u64) -> LogResult<Record> {
        let (_, position) = self.index.read((offset - self.base_offset) as i64)?;
        let bytes = self.store.read(position)?;
        Ok(Record::decode(bytes)?)
    }

    /// True when either backing file has reached its cap.
    pub fn is_full(&self) -> bool {
        self.store.size() >= self.config.max_store_bytes
            || self.index.size() + ENTRY_WIDTH > self.config.max_index_bytes
    }

    /// The first offset this segment covers.
    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    /// The offset the next append would receive.
    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }

    /// Flushes and closes both backing files.
    pub fn close(&mut self) -> LogResult<()> {
        self.index.close()?;
        self.store.close()?;
        Ok(())
    }

    /// Closes the segment and deletes both backing files.
    pub fn remove(mut self) -> LogResult<()> {
        self.close()?;
        fs::remove_file(self.index.path())?;
        fs::remove_file(self.store.path())?;
        Ok(())
    }

    pub(crate) fn store(&self) -> &Store {
        &self.store
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("base_offset", &self.base_offset)
            .field("next_offset", &self.next_offset)
            .field("store_size", &self.store.size())
            .field("index_size", &self.index.size())
            .finish()
    }
}

pub(crate) fn store_path(dir: &Path, base_offset: u64) -> PathBuf {
    dir.join(format!("{:020}.store", base_offset))
}

pub(crate) fn index_path(dir: &Path, base_offset: u64) -> PathBuf {
    dir.join(format!("{:020}.index", base_offset))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tempfile::TempDir;

    fn record(value: &str) -> Record {
        Record {
            value: Bytes::from(value.to_string()),
            offset: 0,
        }
    }

    #[test]
    fn test_append_read() {
        let tmp = TempDir::new().unwrap();
        let config = LogConfig::default();
        let mut segment = Segment::new(tmp.path(), 16, config).unwrap();

        assert_eq!(segment.next_offset(), 16);

        for i in 0..3 {
            let offset = segment.append(&record("hello world")).unwrap();
            assert_eq!(offset, 16 + i);

            let got = segment.read(offset).unwrap();
            assert_eq!(got.value.as_ref(), b"hello world");
            assert_eq!(got.offset, offset);
        }
    }

    #[test]
    fn test_full_by_index() {
        let tmp = TempDir::new().unwrap();
        let config = LogConfig::default()
            .with_max_store_bytes(1024)
            .with_max_index_bytes(ENTRY_WIDTH * 3);
        let mut segment = Segment::new(tmp.path(), 0, config).unwrap();

        for _ in 0..3 {
            segment.append(&record("a")).unwrap();
        }

        assert!(segment.is_full());
        assert!(matches!(
            segment.append(&record("a")),
            Err(LogError::SegmentFull)
        ));
    }

    #[test]
    fn test_full_by_store() {
        let tmp = TempDir::new().unwrap();
        let value = "hello world";
        let frame = Record {
            value: Bytes::from(value.to_string()),
            offset: 0,
        }
        .encode_to_vec()
        .len() as u64
            + 8;

        let config = LogConfig::default()
            .with_max_store_bytes(frame * 3)
            .with_max_index_bytes(1024);
        let mut segment = Segment::new(tmp.path(), 0, config).unwrap();

        for _ in 0..3 {
            segment.append(&record(value)).unwrap();
        }

        assert!(segment.is_full());
    }

    #[test]
    fn test_reopen_recovers_next_offset() {
        let tmp = TempDir::new().unwrap();
        let config = LogConfig::default();

        {
            let mut segment = Segment::new(tmp.path(), 0, config.clone()).unwrap();
            segment.append(&record("one")).unwrap();
            segment.append(&record("two")).unwrap();
            segment.close().unwrap();
        }

        let mut segment = Segment::new(tmp.path(), 0, config).unwrap();
        assert_eq!(segment.next_offset(), 2);

        let offset = segment.append(&record("three")).unwrap();
        assert_eq!(offset, 2);
        assert_eq!(segment.read(0).unwrap().value.as_ref(), b"one");
        assert_eq!(segment.read(2).unwrap().value.as_ref(), b"three");
    }

    #[test]
    fn test_remove_deletes_files() {
        let tmp = TempDir::new().unwrap();
        let config = LogConfig::default();
        let mut segment = Segment::new(tmp.path(), 0, config).unwrap();
        segment.append(&record("x")).unwrap();

        let store = store_path(tmp.path(), 0);
        let index = index_path(tmp.path(), 0);
        assert!(store.exists());
        assert!(index.exists());

        segment.remove().unwrap();
        assert!(!store.exists());
        assert!(!index.exists());
    }
}
