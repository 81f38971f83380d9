//! Client error types.

use strand_api::frame::FrameError;
use strand_api::Code;
use thiserror::Error;

/// Errors produced by the client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The picker had no server for the requested kind of call; resolve
    /// again and retry.
    #[error("no server available for {0}")]
    NoServerAvailable(&'static str),

    /// The server answered with an error response.
    #[error("server error ({}): {message}", code.as_str_name())]
    Rpc {
        /// The wire status code.
        code: Code,
        /// The server's detail message.
        message: String,
    },

    /// The server answered with a body the call did not expect.
    #[error("unexpected response body")]
    UnexpectedResponse,

    /// The connection broke mid-call.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// Dial or socket failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The call did not complete within the configured timeout.
    #[error("request timed out")]
    Timeout,

    /// Retries exhausted without reaching a usable server.
    #[error("retries exhausted: {0}")]
    RetriesExhausted(String),
}

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

impl ClientError {
    /// The wire code, when this error carries one.
    pub fn code(&self) -> Option<Code> {
        match self {
            ClientError::Rpc { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// True when the server signalled a leadership redirect: re-resolve
    /// and retry.
    pub fn is_redirect(&self) -> bool {
        matches!(
            self.code(),
            Some(Code::NotLeader) | Some(Code::NoLeader)
        )
    }

    /// True when the requested offset was past the log's end.
    pub fn is_not_found(&self) -> bool {
        self.code() == Some(Code::NotFound)
    }
}
