//! Full-duplex voice conversation with a realtime speech model.
//!
//! Microphone audio streams to the model over a WebSocket session while the
//! model's synthesized voice plays back. The user may talk over the model
//! at any time (barge-in).
//!
//! - [`audio`]: chunk format, capture and playback activities, device backends.
//! - [`transport`]: the session connection and its wire codecs.
//! - [`turn`]: the turn-taking state machine.
//! - [`pipeline`]: the orchestrator tying the above together.
//! - [`config`]: TOML configuration.

pub mod audio;
pub mod config;
pub mod pipeline;
pub mod transport;
pub mod turn;
