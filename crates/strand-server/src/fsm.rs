//! The replicated state machine over the local log.
//!
//! Committed `Append` commands land here and turn into appends on the
//! node's segmented log; the assigned offset travels back to the proposer
//! as the apply result. Snapshots are the log's raw store byte stream
//! (self-delimiting length-prefixed record frames), and restore replays
//! that stream into a reset log, preserving offsets.

use std::io::Read;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost::Message;
use tracing::{debug, info};

use strand_api::{ProduceRequest, Record};
use strand_log::Log;
use strand_raft::rpc::{EntryType, LogEntry};
use strand_raft::state_machine::{ApplyResult, Snapshot, StateMachine};
use strand_raft::{LogIndex, RaftError};

/// Command-type byte for appends. The byte is reserved space: future
/// command kinds get their own values.
pub const COMMAND_APPEND: u8 = 0;

/// Encodes an `Append` command for proposal through Raft.
pub fn encode_append(value: Bytes) -> Bytes {
    let request = ProduceRequest {
        record: Some(Record { value, offset: 0 }),
    };

    let mut buf = BytesMut::with_capacity(1 + request.encoded_len());
    buf.put_u8(COMMAND_APPEND);
    buf.put_slice(&request.encode_to_vec());
    buf.freeze()
}

/// The state machine applying committed commands to the local log.
pub struct LogFsm {
    log: Arc<Log>,
    last_applied: LogIndex,
}

impl LogFsm {
    /// Creates the FSM over `log`, resuming from a recovered applied
    /// position.
    pub fn new(log: Arc<Log>, last_applied: LogIndex) -> Self {
        Self { log, last_applied }
    }

    /// The underlying log (shared with the read path).
    pub fn log(&self) -> &Arc<Log> {
        &self.log
    }

    fn apply_append(&mut self, mut data: Bytes) -> strand_raft::Result<ApplyResult> {
        let request = ProduceRequest::decode(&mut data)
            .map_err(|e| RaftError::Internal(format!("bad append command: {e}")))?;
        let record = request
            .record
            .ok_or_else(|| RaftError::Internal("append command without record".to_string()))?;

        let offset = self
            .log
            .append(&record)
            .map_err(|e| RaftError::Storage(e.to_string()))?;

        Ok(ApplyResult::with_data(Bytes::copy_from_slice(
            &offset.to_be_bytes(),
        )))
    }
}

impl StateMachine for LogFsm {
    fn apply(&mut self, entry: &LogEntry) -> strand_raft::Result<ApplyResult> {
        let result = match entry.entry_type {
            EntryType::Command => {
                let mut data = entry.data.clone();
                if data.is_empty() {
                    return Err(RaftError::Internal("empty command".to_string()));
                }
                match data.get_u8() {
                    COMMAND_APPEND => self.apply_append(data)?,
                    other => {
                        return Err(RaftError::Internal(format!(
                            "unknown command type: {other}"
                        )))
                    }
                }
            }
            // Leadership no-ops and membership entries advance the applied
            // position without touching the log.
            EntryType::Noop | EntryType::Config => ApplyResult::ok(),
        };

        self.last_applied = entry.index;
        Ok(result)
    }

    fn snapshot(&self) -> strand_raft::Result<Bytes> {
        let mut reader = self
            .log
            .reader()
            .map_err(|e| RaftError::Storage(e.to_string()))?;

        let mut data = Vec::new();
        reader
            .read_to_end(&mut data)
            .map_err(|e| RaftError::Storage(e.to_string()))?;

        debug!(size = data.len(), "captured log snapshot");
        Ok(Bytes::from(data))
    }

    fn restore(&mut self, snapshot: &Snapshot) -> strand_raft::Result<()> {
        let mut data = snapshot.data.clone();
        let mut restored = 0u64;
        let mut first = true;

        while data.remaining() >= 8 {
            let len = data.get_u64() as usize;
            if data.remaining() < len {
                return Err(RaftError::Internal(
                    "snapshot stream truncated mid-record".to_string(),
                ));
            }

            let record = Record::decode(data.split_to(len))
                .map_err(|e| RaftError::Internal(format!("snapshot record corrupt: {e}")))?;

            if first {
                // Replayed records keep their original offsets.
                self.log
                    .reset_to(record.offset)
                    .map_err(|e| RaftError::Storage(e.to_string()))?;
                first = false;
            }

            let assigned = self
                .log
                .append(&record)
                .map_err(|e| RaftError::Storage(e.to_string()))?;
            if assigned != record.offset {
                return Err(RaftError::Internal(format!(
                    "snapshot replay misaligned: expected offset {}, assigned {assigned}",
                    record.offset
                )));
            }
            restored += 1;
        }

        if data.has_remaining() {
            return Err(RaftError::Internal(
                "trailing bytes after snapshot stream".to_string(),
            ));
        }

        if first {
            // Empty snapshot: the leader's log held nothing at capture.
            self.log
                .reset()
                .map_err(|e| RaftError::Storage(e.to_string()))?;
        }

        self.last_applied = snapshot.meta.last_included_index;
        info!(records = restored, "restored log from snapshot");
        Ok(())
    }

    fn last_applied(&self) -> LogIndex {
        self.last_applied
    }
}
