//! Transport error taxonomy.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use super::TransportErrorKind;

/// Opening a session failed. Retried with backoff by the orchestrator.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("credential cannot be sent in a request header")]
    InvalidCredentials,

    #[error("no API key configured (set session.api_key or ${0})")]
    MissingCredentials(String),

    #[error("websocket handshake failed: {0}")]
    Handshake(String),

    #[error("server did not acknowledge setup within {0:?}")]
    SetupTimeout(Duration),

    #[error("server rejected setup: {0}")]
    SetupRejected(String),
}

impl ConnectionError {
    /// Configuration mistakes fail the same way every time.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ConnectionError::InvalidEndpoint(_)
                | ConnectionError::InvalidCredentials
                | ConnectionError::MissingCredentials(_)
        )
    }
}

/// A single outbound frame could not be queued.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("connection is closing")]
    Closing,

    #[error("failed to encode frame: {0}")]
    Encode(String),
}

/// Frame (de)serialisation failure inside a codec.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed base64 audio: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("unexpected frame: {0}")]
    Unexpected(String),
}

/// How a live session was lost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportFailure {
    Closed,
    Error(TransportErrorKind),
    Send(SendError),
}

impl fmt::Display for TransportFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportFailure::Closed => f.write_str("connection closed by remote"),
            TransportFailure::Error(kind) => write!(f, "transport error: {kind}"),
            TransportFailure::Send(e) => write!(f, "send failed: {e}"),
        }
    }
}

impl std::error::Error for TransportFailure {}

impl From<SendError> for TransportFailure {
    fn from(e: SendError) -> Self {
        TransportFailure::Send(e)
    }
}
