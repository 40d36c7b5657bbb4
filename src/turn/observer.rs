//! Read-only hooks into the conversation for logging and UI collaborators.
//!
//! Observers are called synchronously from the coordinator task, so they
//! must return quickly and never block.

use std::sync::Arc;

use tokio::sync::watch;

use super::Phase;
use crate::transport::TransportFailure;

/// What cut a model response short.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptCause {
    /// The user started talking over the model.
    BargeIn,
    /// The remote model reported it stopped generating.
    Remote,
}

/// Turn-boundary and session notifications. Every method defaults to a no-op.
pub trait TurnObserver: Send + Sync {
    fn on_phase_change(&self, _from: Phase, _to: Phase) {}

    fn on_enter_playing(&self) {}

    fn on_interrupted(&self, _cause: InterruptCause) {}

    /// The model's response finished playing.
    fn on_turn_complete(&self) {}

    /// A connection was established; `generation` counts from 1.
    fn on_session_started(&self, _generation: u64) {}

    /// The connection was lost; a reconnect follows if enabled.
    fn on_session_lost(&self, _failure: &TransportFailure) {}
}

// ---------------------------------------------------------------------------
// LogObserver
// ---------------------------------------------------------------------------

/// Writes every notification to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl TurnObserver for LogObserver {
    fn on_phase_change(&self, from: Phase, to: Phase) {
        log::debug!("turn: {from} -> {to}");
    }

    fn on_enter_playing(&self) {
        log::info!("model started speaking");
    }

    fn on_interrupted(&self, cause: InterruptCause) {
        match cause {
            InterruptCause::BargeIn => log::info!("user interrupted the model"),
            InterruptCause::Remote => log::info!("model stopped speaking (remote interrupt)"),
        }
    }

    fn on_turn_complete(&self) {
        log::info!("model finished speaking");
    }

    fn on_session_started(&self, generation: u64) {
        log::info!("session #{generation} started");
    }

    fn on_session_lost(&self, failure: &TransportFailure) {
        log::warn!("session lost: {failure}");
    }
}

/// Publishes the current phase to `watch` subscribers.
impl TurnObserver for watch::Sender<Phase> {
    fn on_phase_change(&self, _from: Phase, to: Phase) {
        self.send_replace(to);
    }

    fn on_session_started(&self, _generation: u64) {
        self.send_replace(Phase::Listening);
    }
}

// ---------------------------------------------------------------------------
// ObserverSet
// ---------------------------------------------------------------------------

/// Fans each notification out to several observers, in registration order.
#[derive(Clone, Default)]
pub struct ObserverSet {
    observers: Vec<Arc<dyn TurnObserver>>,
}

impl ObserverSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, observer: Arc<dyn TurnObserver>) {
        self.observers.push(observer);
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl TurnObserver for ObserverSet {
    fn on_phase_change(&self, from: Phase, to: Phase) {
        self.observers.iter().for_each(|o| o.on_phase_change(from, to));
    }

    fn on_enter_playing(&self) {
        self.observers.iter().for_each(|o| o.on_enter_playing());
    }

    fn on_interrupted(&self, cause: InterruptCause) {
        self.observers.iter().for_each(|o| o.on_interrupted(cause));
    }

    fn on_turn_complete(&self) {
        self.observers.iter().for_each(|o| o.on_turn_complete());
    }

    fn on_session_started(&self, generation: u64) {
        self.observers
            .iter()
            .for_each(|o| o.on_session_started(generation));
    }

    fn on_session_lost(&self, failure: &TransportFailure) {
        self.observers.iter().for_each(|o| o.on_session_lost(failure));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
