//! Turn coordination: the conversation state machine and its observers.
//!
//! The [`TurnCoordinator`] is the only reader of both audio directions and
//! the only writer of [`ConversationState`]. Everything else in the crate is
//! a pipe with backpressure.

pub mod coordinator;
pub mod error;
pub mod observer;
pub mod phase;
pub mod state;

pub use coordinator::{Directive, TurnCoordinator};
pub use error::TurnError;
pub use observer::{InterruptCause, LogObserver, ObserverSet, TurnObserver};
pub use phase::Phase;
pub use state::{BoundedQueue, ConversationState};
