//! Snapshot reader over the log's raw store bytes.

use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;

use crate::error::LogResult;

struct Part {
    file: File,
    remaining: u64,
}

/// A contiguous byte stream over every segment's store file, in offset
/// order.
///
/// Each part is opened at capture time and bounded by the store length
/// recorded then, so concurrent appends (or even segment removal on Unix)
/// cannot disturb the stream. The output is self-delimiting: length-prefixed
/// record frames exactly as the stores hold them.
pub struct LogReader {
    parts: Vec<Part>,
    current: usize,
}

impl LogReader {
    pub(crate) fn open(parts: Vec<(PathBuf, u64)>) -> LogResult<Self> {
        let mut opened = Vec::with_capacity(parts.len());
        for (path, len) in parts {
            opened.push(Part {
                file: File::open(path)?,
                remaining: len,
            });
        }

        Ok(Self {
            parts: opened,
            current: 0,
        })
    }
}

impl Read for LogReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.current < self.parts.len() {
            let part = &mut self.parts[self.current];
            if part.remaining == 0 {
                self.current += 1;
                continue;
            }

            let want = buf.len().min(part.remaining as usize);
            let n = part.file.read(&mut buf[..want])?;
            if n == 0 {
                // Store shorter than the captured length; treat as end.
                self.current += 1;
                continue;
            }

            part.remaining -= n as u64;
            return Ok(n);
        }

        Ok(0)
    }
}
