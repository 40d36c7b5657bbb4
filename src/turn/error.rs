use thiserror::Error;

/// The coordinator's pending queues overflowed. Fatal to the session.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TurnError {
    /// The model is producing audio faster than it can be played.
    #[error("model audio backlog exceeded {capacity} chunks")]
    InboundOverflow { capacity: usize },

    #[error("microphone backlog exceeded {capacity} chunks")]
    OutboundOverflow { capacity: usize },
}
