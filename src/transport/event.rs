//! The vocabulary exchanged between the session transport and the turn
//! coordinator.

use std::fmt;

use crate::audio::AudioChunk;

/// Why the transport stopped being usable mid-session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Socket read or write failed.
    Io(String),
    /// An inbound frame could not be decoded.
    Decode(String),
    /// The remote end reported an error or asked us to go away.
    Remote(String),
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportErrorKind::Io(msg) => write!(f, "i/o error: {msg}"),
            TransportErrorKind::Decode(msg) => write!(f, "undecodable frame: {msg}"),
            TransportErrorKind::Remote(msg) => write!(f, "remote error: {msg}"),
        }
    }
}

/// One input to the turn coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    /// A microphone chunk (produced locally, never by the transport).
    UserAudio(AudioChunk),
    /// A chunk of the model's synthesized voice.
    ModelAudio(AudioChunk),
    /// The model finished generating its response.
    ModelTurnComplete,
    /// The model abandoned its response (server-side barge-in detection).
    ModelInterrupted,
    TransportError(TransportErrorKind),
    /// The remote end closed the connection.
    TransportClosed,
}

impl TurnEvent {
    /// Short name for logs; never includes payloads.
    pub fn label(&self) -> &'static str {
        match self {
            TurnEvent::UserAudio(_) => "user-audio",
            TurnEvent::ModelAudio(_) => "model-audio",
            TurnEvent::ModelTurnComplete => "turn-complete",
            TurnEvent::ModelInterrupted => "interrupted",
            TurnEvent::TransportError(_) => "transport-error",
            TurnEvent::TransportClosed => "transport-closed",
        }
    }
}
