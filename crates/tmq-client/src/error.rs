//! Error types for the TMQ client library

use std::time::Duration;
use thiserror::Error;

/// Result type alias for TMQ client operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when using the TMQ client
#[derive(Debug, Error)]
pub enum Error {
    /// The server answered with a non-zero response code
    #[error("TMQ protocol error [{code:#x}]: {message}")]
    Protocol { code: i32, message: String },

    /// No response arrived within the request timeout
    #[error("Request {req_id} ({action}) timed out after {timeout:?}")]
    Timeout {
        req_id: u64,
        action: &'static str,
        timeout: Duration,
    },

    /// The underlying connection failed; fatal for the session
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed JSON or binary payload
    #[error("Failed to decode response: {0}")]
    Decode(String),

    /// Operation attempted after the consumer was closed
    #[error("Consumer is closed")]
    Closed,

    /// Connection could not be established
    #[error("Failed to connect to TMQ endpoint: {0}")]
    Connection(String),

    /// Invalid consumer configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Poll reported a message kind this client does not understand
    #[error("Unknown TMQ message type: {0}")]
    UnknownMessageType(i32),

    /// Commit requested before any message was polled
    #[error("No polled message to commit")]
    NoMessage,

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether the error leaves the session unusable
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Closed)
    }

    pub(crate) fn decode(msg: impl Into<String>) -> Self {
        Error::Decode(msg.into())
    }
}
