//! Error types for the segmented log.

use thiserror::Error;

/// Errors produced by the storage layer.
#[derive(Debug, Error)]
pub enum LogError {
    /// The requested offset is below the log's lowest offset or beyond its
    /// highest.
    #[error("offset out of range: {offset}")]
    OffsetOutOfRange {
        /// The offset the caller asked for.
        offset: u64,
    },

    /// The active segment cannot take another record. Internal: the log
    /// rolls a new segment and retries, so callers never see this.
    #[error("segment full")]
    SegmentFull,

    /// The index's mapped region has no room for another entry.
    #[error("index out of space")]
    IndexOutOfSpace,

    /// A read past the index's logical end (or from an empty index).
    #[error("end of index")]
    Eof,

    /// A stored record failed to decode.
    #[error("record decode failed: {0}")]
    Decode(#[from] prost::DecodeError),

    /// The underlying file operation failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for storage operations.
pub type LogResult<T> = Result<T, LogError>;
