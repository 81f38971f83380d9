//! Append-only store files.
//!
//! A store holds record frames back to back: a `u64` big-endian length
//! prefix followed by that many payload bytes. Frames are never modified in
//! place; random access is by byte position.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::LogResult;

/// Width of the length prefix on every frame.
pub(crate) const LEN_WIDTH: u64 = 8;

/// Pending appends are written through once they reach this size.
const FLUSH_THRESHOLD: usize = 4096;

struct Inner {
    file: File,
    /// Appended bytes not yet written to the file.
    buf: Vec<u8>,
    /// File size plus buffered bytes.
    size: u64,
}

impl Inner {
    fn flush(&mut self) -> LogResult<()> {
        if !self.buf.is_empty() {
            self.file.write_all(&self.buf)?;
            self.buf.clear();
        }
        Ok(())
    }
}

/// An append-only file of length-prefixed record frames.
///
/// Small appends coalesce in a write buffer; reads flush it first so they
/// always observe every acknowledged byte. All operations are serialized by
/// an exclusive lock.
pub struct Store {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl Store {
    /// Opens (or creates) the store file at `path`.
    pub fn new(path: impl AsRef<Path>) -> LogResult<Self> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;
        let size = file.metadata()?.len();

        Ok(Self {
            path,
            inner: Mutex::new(Inner {
                file,
                buf: Vec::with_capacity(FLUSH_THRESHOLD),
                size,
            }),
        })
    }

    /// Appends one frame and returns `(bytes_written, position)`, where
    /// `position` is the byte offset the frame (including its length prefix)
    /// begins at.
    pub fn append(&self, bytes: &[u8]) -> LogResult<(u64, u64)> {
        let mut inner = self.inner.lock();

        let position = inner.size;
        inner
            .buf
            .extend_from_slice(&(bytes.len() as u64).to_be_bytes());
        inner.buf.extend_from_slice(bytes);

        let written = LEN_WIDTH + bytes.len() as u64;
        inner.size += written;

        if inner.buf.len() >= FLUSH_THRESHOLD {
            inner.flush()?;
        }

        Ok((written, position))
    }

    /// Reads the frame payload that begins at `position`.
    pub fn read(&self, position: u64) -> LogResult<Bytes> {
        let mut inner = self.inner.lock();
        inner.flush()?;

        inner.file.seek(SeekFrom::Start(position))?;

        let mut len_buf = [0u8; LEN_WIDTH as usize];
        inner.file.read_exact(&mut len_buf)?;
        let len = u64::from_be_bytes(len_buf);

        let mut payload = vec![0u8; len as usize];
        inner.file.read_exact(&mut payload)?;

        Ok(Bytes::from(payload))
    }

    /// Raw positional read used by snapshot streaming.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> LogResult<usize> {
        let mut inner = self.inner.lock();
        inner.flush()?;

        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.read_exact(buf)?;

        Ok(buf.len())
    }

    /// Returns the store size, including buffered bytes.
    pub fn size(&self) -> u64 {
        self.inner.lock().size
    }

    /// Writes buffered appends through to the file.
    pub fn flush(&self) -> LogResult<()> {
        self.inner.lock().flush()
    }

    /// Flushes and syncs the file.
    pub fn close(&self) -> LogResult<()> {
        let mut inner = self.inner.lock();
        inner.flush()?;
        inner.file.sync_all()?;
        Ok(())
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.path)
            .field("size", &self.size())
            .finish()
    }
}
