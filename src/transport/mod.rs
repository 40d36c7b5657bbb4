//! Session transport: the typed, ordered duplex pipe to the remote model.
//!
//! - [`Transport`] / [`Connector`]: the seams the orchestrator depends on.
//! - [`WsConnector`] / [`WsSession`]: the WebSocket implementation.
//! - [`FrameCodec`]: message formats ([`GeminiLiveCodec`], [`TaggedCodec`]).
//! - [`TurnEvent`]: what the transport hands to the turn coordinator.

pub mod codec;
pub mod error;
pub mod event;
pub mod session;

pub use codec::{codec_for, FrameCodec, GeminiLiveCodec, InboundFrame, OutboundFrame, TaggedCodec};
pub use error::{CodecError, ConnectionError, SendError, TransportFailure};
pub use event::{TransportErrorKind, TurnEvent};
pub use session::{Connector, Credentials, Transport, WsConnector, WsSession};
