use crate::process::ProcessError;
use crate::protocol::{JsonRpcError, RequestId, codes};
use serde_json::Value;
use thiserror::Error;

/// Error types raised by the messaging channel and the worker orchestration on top of it
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Malformed message: {0}")]
    Framing(String),

    #[error("A message with the id '{0}' is already pending")]
    DuplicateRequestId(RequestId),

    #[error("No one waiting for response {0}")]
    UnmatchedResponse(RequestId),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("A handler for method '{0}' is already registered")]
    DuplicateMethod(String),

    #[error("Remote error {code}: {message}")]
    Remote {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Timeout occurred: {0}")]
    Timeout(String),

    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Worker launch failed: {0}")]
    Launch(String),

    #[error("Process management error: {0}")]
    Process(#[from] ProcessError),
}

impl ChannelError {
    /// Machine-readable code for this error.
    ///
    /// Wire-level failures use the JSON-RPC reserved codes, remote errors keep the
    /// code the peer sent, and everything local lives in the implementation-defined
    /// `-32000..-32099` range.
    pub fn code(&self) -> i64 {
        match self {
            ChannelError::Framing(_) => codes::PARSE_ERROR,
            ChannelError::ProtocolViolation(_) => codes::INVALID_REQUEST,
            ChannelError::Remote { code, .. } => *code,
            ChannelError::DuplicateRequestId(_) => -32001,
            ChannelError::UnmatchedResponse(_) => -32002,
            ChannelError::DuplicateMethod(_) => -32003,
            ChannelError::Cancelled => -32004,
            ChannelError::Timeout(_) => -32005,
            ChannelError::Transport(_) => -32006,
            ChannelError::Serialization(_) => -32007,
            ChannelError::Launch(_) => -32008,
            ChannelError::Process(_) => -32009,
        }
    }

    /// Errors that come from a broken request/response pairing rather than I/O
    pub fn is_correlation_error(&self) -> bool {
        matches!(
            self,
            ChannelError::DuplicateRequestId(_) | ChannelError::UnmatchedResponse(_)
        )
    }

    /// Check if the caller may reasonably try again
    pub fn is_retryable(&self) -> bool {
        matches!(self, ChannelError::Timeout(_) | ChannelError::Transport(_))
    }
}

impl From<JsonRpcError> for ChannelError {
    fn from(error: JsonRpcError) -> Self {
        ChannelError::Remote {
            code: error.code,
            message: error.message,
            data: error.data,
        }
    }
}
