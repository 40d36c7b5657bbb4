//! Pipeline orchestrator: the top-level wiring of one voice conversation.
//!
//! # Architecture
//!
//! ```text
//!   capture thread ──ChunkQueue──┐
//!                                ▼
//!   Transport::receive ──▶ Orchestrator event loop ──▶ Transport::send / end_turn / interrupt
//!                                │   (TurnCoordinator)
//!   playback thread ◀─ChunkQueue─┘
//!         │
//!         └── DeviceEvent (drained, failed) ──▶ event loop
//!
//!   phase changes ──▶ ObserverSet (watch::Sender<Phase>, LogObserver, ...)
//! ```
//!
//! [`Orchestrator::start`] spawns the loop and returns a [`PipelineHandle`]
//! for watching the phase and shutting down.

pub mod error;
pub mod runner;

// ---------------------------------------------------------------------------
// Public re-exports
// ---------------------------------------------------------------------------

pub use error::PipelineError;
pub use runner::{Orchestrator, PipelineHandle};
