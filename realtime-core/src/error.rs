//! Error types for the realtime stream client

use thiserror::Error;

/// Stream-wide error type
///
/// Payloads are plain strings so a single connect outcome can be cloned
/// out to every caller awaiting the same attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection closed: {0}")]
    Closed(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

impl StreamError {
    pub fn transport(msg: impl Into<String>) -> Self {
        StreamError::Transport(msg.into())
    }

    pub fn closed(msg: impl Into<String>) -> Self {
        StreamError::Closed(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        StreamError::Config(msg.into())
    }
}

/// Errors raised while encoding or decoding frames
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Payload was not a valid JSON document
    #[error("Invalid JSON: {0}")]
    Json(String),

    /// JSON object without a string `type` field
    #[error("Frame has no `type` field")]
    MissingType,

    /// Binary payload that is not UTF-8
    #[error("Frame is not valid UTF-8 text")]
    NotText,
}

impl From<serde_json::Error> for CodecError {
    fn from(err: serde_json::Error) -> Self {
        CodecError::Json(err.to_string())
    }
}

/// Result type alias for stream operations
pub type StreamResult<T> = Result<T, StreamError>;
