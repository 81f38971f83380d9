//! The segmented log.

use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::debug;

use crate::config::LogConfig;
use crate::error::{LogError, LogResult};
use crate::reader::LogReader;
use crate::segment::Segment;
use strand_api::Record;

struct Inner {
    config: LogConfig,
    /// Ordered by base offset; the last segment is the active one.
    segments: Vec<Segment>,
}

impl Inner {
    fn active(&self) -> &Segment {
        self.segments.last().expect("log always has a segment")
    }

    fn active_mut(&mut self) -> &mut Segment {
        self.segments.last_mut().expect("log always has a segment")
    }
}

/// An ordered set of segments sharing one directory.
///
/// Readers share the lock; appenders take it exclusively. Holding the lock
/// across I/O is fine here: appends are cheap, sequential writes.
pub struct Log {
    dir: PathBuf,
    inner: RwLock<Inner>,
}

impl Log {
    /// Opens the log in `dir`, scanning for existing segment files.
    ///
    /// If the directory holds no segments, an initial one is created at
    /// `config.initial_offset`.
    pub fn new(dir: impl AsRef<Path>, config: LogConfig) -> LogResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let segments = Self::load_segments(&dir, &config)?;

        Ok(Self {
            dir,
            inner: RwLock::new(Inner { config, segments }),
        })
    }

    fn load_segments(dir: &Path, config: &LogConfig) -> LogResult<Vec<Segment>> {
        let mut base_offsets = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("store") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if let Ok(base) = stem.parse::<u64>() {
                    base_offsets.push(base);
                }
            }
        }
        base_offsets.sort_unstable();
        base_offsets.dedup();

        let mut segments = Vec::with_capacity(base_offsets.len().max(1));
        for base in &base_offsets {
            segments.push(Segment::new(dir, *base, config.clone())?);
        }
        if segments.is_empty() {
            segments.push(Segment::new(dir, config.initial_offset, config.clone())?);
        }

        Ok(segments)
    }

    /// Appends a record and returns its assigned offset.
    ///
    /// When the active segment is at capacity the log seals it and rolls a
    /// new one; a full segment never surfaces to the caller.
    pub fn append(&self, record: &Record) -> LogResult<u64> {
        let mut inner = self.inner.write();

        match inner.active_mut().append(record) {
            Ok(offset) => Ok(offset),
            Err(LogError::SegmentFull) => {
                let base = inner.active().next_offset();
                debug!(base_offset = base, "rolling new active segment");

                inner.active_mut().close()?;
                let config = inner.config.clone();
                inner.segments.push(Segment::new(&self.dir, base, config)?);
                inner.active_mut().append(record)
            }
            Err(e) => Err(e),
        }
    }

    /// Reads the record stored at `offset`.
    pub fn read(&self, offset: u64) -> LogResult<Record> {
        let inner = self.inner.read();

        let segment = inner
            .segments
            .iter()
            .find(|s| s.base_offset() <= offset && offset < s.next_offset());

        match segment {
            Some(segment) => segment.read(offset).map_err(|e| match e {
                LogError::Eof => LogError::OffsetOutOfRange { offset },
                other => other,
            }),
            None => Err(LogError::OffsetOutOfRange { offset }),
        }
    }

    /// The first offset held by the log.
    pub fn lowest_offset(&self) -> u64 {
        let inner = self.inner.read();
        inner.segments[0].base_offset()
    }

    /// The last assigned offset, or `initial_offset - 1`-equivalent zero for
    /// an empty log.
    pub fn highest_offset(&self) -> u64 {
        let inner = self.inner.read();
        let next = inner.active().next_offset();
        next.saturating_sub(1)
    }

    /// The offset the next appended record will receive.
    pub fn next_offset(&self) -> u64 {
        self.inner.read().active().next_offset()
    }

    /// Writes buffered appends through to the store files.
    pub fn flush(&self) -> LogResult<()> {
        let inner = self.inner.read();
        for segment in &inner.segments {
            segment.store().flush()?;
        }
        Ok(())
    }

    /// Removes every segment whose records all fall below `lowest`.
    ///
    /// Used for compaction-style head pruning by the consensus layer. If the
    /// prune covers every segment a fresh one is allocated at `lowest`.
    pub fn truncate(&self, lowest: u64) -> LogResult<()> {
        let mut inner = self.inner.write();

        let mut kept = Vec::with_capacity(inner.segments.len());
        for segment in inner.segments.drain(..) {
            // next_offset <= lowest means every record (next_offset - 1 and
            // below) sits under the cut.
            if segment.next_offset() <= lowest {
                segment.remove()?;
            } else {
                kept.push(segment);
            }
        }

        if kept.is_empty() {
            let config = inner.config.clone();
            kept.push(Segment::new(&self.dir, lowest, config)?);
        }
        inner.segments = kept;

        Ok(())
    }

    /// Returns a reader over the log's raw store bytes for snapshotting.
    ///
    /// The reader captures each segment's store path and current length, so
    /// it is safe to keep appending while the snapshot streams: the reader
    /// never reads past the captured lengths.
    pub fn reader(&self) -> LogResult<LogReader> {
        let inner = self.inner.read();

        let mut parts = Vec::with_capacity(inner.segments.len());
        for segment in &inner.segments {
            let store = segment.store();
            store.flush()?;
            parts.push((store.path().to_path_buf(), store.size()));
        }

        LogReader::open(parts)
    }

    /// Flushes every segment's index (truncating to the logical tail) and
    /// syncs the stores.
    pub fn close(&self) -> LogResult<()> {
        let mut inner = self.inner.write();
        for segment in inner.segments.iter_mut() {
            segment.close()?;
        }
        Ok(())
    }

    /// Closes the log and deletes its directory.
    pub fn remove(&self) -> LogResult<()> {
        self.close()?;
        fs::remove_dir_all(&self.dir)?;
        Ok(())
    }

    /// Removes all data and recreates the log empty at the configured
    /// initial offset.
    pub fn reset(&self) -> LogResult<()> {
        let offset = self.inner.read().config.initial_offset;
        self.reset_to(offset)
    }

    /// Removes all data and recreates the log empty, with the first record
    /// to come receiving `initial_offset`.
    ///
    /// Used by snapshot restore so replayed records keep their original
    /// offsets.
    pub fn reset_to(&self, initial_offset: u64) -> LogResult<()> {
        let mut inner = self.inner.write();

        for segment in inner.segments.iter_mut() {
            segment.close()?;
        }
        for segment in inner.segments.drain(..) {
            segment.remove()?;
        }

        inner.config.initial_offset = initial_offset;
        let config = inner.config.clone();
        inner
            .segments
            .push(Segment::new(&self.dir, initial_offset, config)?);

        Ok(())
    }

    /// The log's directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl std::fmt::Debug for Log {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Log")
            .field("dir", &self.dir)
            .field("lowest_offset", &self.lowest_offset())
            .field("highest_offset", &self.highest_offset())
            .finish()
    }
}
