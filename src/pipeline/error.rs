use thiserror::Error;

use crate::audio::DeviceError;
use crate::transport::{ConnectionError, TransportFailure};
use crate::turn::TurnError;

/// Terminal pipeline failure, surfaced once to the caller.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Capture or playback hardware failed. Never retried.
    #[error("audio device failed: {0}")]
    Device(#[from] DeviceError),

    /// Connecting failed and the retry budget is spent.
    #[error("could not connect after {attempts} attempt(s): {source}")]
    Connection {
        attempts: u32,
        #[source]
        source: ConnectionError,
    },

    /// The session was lost and reconnecting is disabled.
    #[error("session lost: {0}")]
    Transport(TransportFailure),

    #[error("turn coordination failed: {0}")]
    Turn(#[from] TurnError),

    /// A pipeline task panicked or was cancelled unexpectedly.
    #[error("internal error: {0}")]
    Internal(String),
}
