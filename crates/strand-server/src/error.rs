//! Node-level error types and their wire mapping.

use strand_api::Code;
use strand_log::LogError;
use strand_raft::RaftError;
use thiserror::Error;

/// Errors surfaced by the node.
///
/// Kinds propagate unwrapped up the call stack; mapping to wire codes
/// happens once, at the RPC boundary, via [`ServerError::code`] and
/// [`ServerError::detail`].
#[derive(Debug, Error)]
pub enum ServerError {
    /// Storage-layer failure, including `OffsetOutOfRange`.
    #[error(transparent)]
    Log(#[from] LogError),

    /// A mutating call reached a non-leader; the client should
    /// re-resolve.
    #[error("not the leader")]
    NotLeader,

    /// No leader is elected (mid-election); clients retry with backoff.
    #[error("no cluster leader")]
    NoLeader,

    /// The caller's identity is not allowed to perform the action.
    #[error("{subject} not permitted to {action} to {object}")]
    PermissionDenied {
        /// Caller identity.
        subject: String,
        /// Target object.
        object: String,
        /// Attempted action.
        action: String,
    },

    /// Consensus-layer failure.
    #[error("raft: {0}")]
    Raft(#[from] RaftError),

    /// Snapshot stream corruption; fatal for the restoring node.
    #[error("snapshot corrupt: {0}")]
    Snapshot(String),

    /// The operation was canceled (client went away, node shutting down).
    #[error("canceled")]
    Canceled,

    /// Socket or file failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for node operations.
pub type ServerResult<T> = Result<T, ServerError>;

impl ServerError {
    /// The wire code this error maps to.
    pub fn code(&self) -> Code {
        match self {
            ServerError::Log(LogError::OffsetOutOfRange { .. }) => Code::NotFound,
            ServerError::Log(_) | ServerError::Io(_) | ServerError::Snapshot(_) => Code::Internal,
            ServerError::NotLeader | ServerError::Raft(RaftError::NotLeader { .. }) => {
                Code::NotLeader
            }
            ServerError::NoLeader => Code::NoLeader,
            ServerError::PermissionDenied { .. } => Code::PermissionDenied,
            ServerError::Raft(_) => Code::Internal,
            ServerError::Canceled => Code::Canceled,
        }
    }

    /// The human-readable detail carried on the wire.
    pub fn detail(&self) -> String {
        match self {
            ServerError::Log(LogError::OffsetOutOfRange { offset }) => {
                format!("The requested offset is outside the log's range: {offset}")
            }
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_out_of_range_maps_to_not_found() {
        let err = ServerError::Log(LogError::OffsetOutOfRange { offset: 42 });
        assert_eq!(err.code(), Code::NotFound);
        assert_eq!(
            err.detail(),
            "The requested offset is outside the log's range: 42"
        );
    }

    #[test]
    fn test_permission_denied_detail() {
        let err = ServerError::PermissionDenied {
            subject: "nobody".to_string(),
            object: "*".to_string(),
            action: "produce".to_string(),
        };
        assert_eq!(err.code(), Code::PermissionDenied);
        assert_eq!(err.detail(), "nobody not permitted to produce to *");
    }

    #[test]
    fn test_not_leader_mapping() {
        assert_eq!(ServerError::NotLeader.code(), Code::NotLeader);
        assert_eq!(
            ServerError::Raft(RaftError::NotLeader { leader_hint: None }).code(),
            Code::NotLeader
        );
    }
}
