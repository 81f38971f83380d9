//! Memory-mapped index files.
//!
//! An index is a fixed-size array of `(relative_offset: u32, position: u64)`
//! entries. The file is preallocated to its configured capacity and mapped
//! into memory so lookups cost no syscalls. A logical write position tracks
//! the effective end; on close the file is truncated back to it, which is
//! how a reopen discovers the last entry (a file cannot grow while mapped).

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use crate::error::{LogError, LogResult};

/// Width of one index entry: `u32` relative offset + `u64` store position.
pub const ENTRY_WIDTH: u64 = 4 + 8;

const OFF_WIDTH: u64 = 4;

/// A memory-mapped offset index for one segment.
pub struct Index {
    path: PathBuf,
    file: File,
    mmap: MmapMut,
    /// Logical end of the index in bytes; always a multiple of
    /// [`ENTRY_WIDTH`].
    size: u64,
}

impl Index {
    /// Opens (or creates) the index at `path`, preallocating the file to
    /// `max_index_bytes` and mapping it.
    ///
    /// The logical tail is inferred from the file length before
    /// preallocation, rounded down to a whole entry.
    pub fn new(path: impl AsRef<Path>, max_index_bytes: u64) -> LogResult<Self> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let size = file.metadata()?.len() / ENTRY_WIDTH * ENTRY_WIDTH;
        file.set_len(max_index_bytes)?;

        // Safety: the map is private to this Index and the file stays open
        // for the Index's lifetime.
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        Ok(Self {
            path,
            file,
            mmap,
            size,
        })
    }

    /// Reads the entry in slot `k`; `k == -1` addresses the last entry.
    ///
    /// Returns `(relative_offset, position)`, or [`LogError::Eof`] when the
    /// index is empty or `k` is past the logical end.
    pub fn read(&self, k: i64) -> LogResult<(u32, u64)> {
        if self.size == 0 {
            return Err(LogError::Eof);
        }

        let slot = if k == -1 {
            self.size / ENTRY_WIDTH - 1
        } else {
            k as u64
        };

        let pos = slot * ENTRY_WIDTH;
        if self.size < pos + ENTRY_WIDTH {
            return Err(LogError::Eof);
        }

        let entry = &self.mmap[pos as usize..(pos + ENTRY_WIDTH) as usize];
        let rel = u32::from_be_bytes(entry[..OFF_WIDTH as usize].try_into().unwrap());
        let position = u64::from_be_bytes(entry[OFF_WIDTH as usize..].try_into().unwrap());

        Ok((rel, position))
    }

    /// Appends one entry.
    ///
    /// Fails with [`LogError::IndexOutOfSpace`] when the mapped region has
    /// no room.
    pub fn write(&mut self, relative_offset: u32, position: u64) -> LogResult<()> {
        if self.mmap.len() as u64 - self.size < ENTRY_WIDTH {
            return Err(LogError::IndexOutOfSpace);
        }

        let pos = self.size as usize;
        self.mmap[pos..pos + OFF_WIDTH as usize].copy_from_slice(&relative_offset.to_be_bytes());
        self.mmap[pos + OFF_WIDTH as usize..pos + ENTRY_WIDTH as usize]
            .copy_from_slice(&position.to_be_bytes());

        self.size += ENTRY_WIDTH;
        Ok(())
    }

    /// Logical size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// True when no further entry fits.
    pub fn is_full(&self) -> bool {
        self.mmap.len() as u64 - self.size < ENTRY_WIDTH
    }

    /// Flushes the map, syncs the file, and truncates it to the logical
    /// tail so the next open can find the last entry.
    pub fn close(&mut self) -> LogResult<()> {
        self.mmap.flush()?;
        self.file.sync_all()?;
        self.file.set_len(self.size)?;
        Ok(())
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for Index {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Index")
            .field("path", &self.path)
            .field("size", &self.size)
            .field("capacity", &self.mmap.len())
            .finish()
    }
}
