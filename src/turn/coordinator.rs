//! The turn coordinator: the state machine deciding who may speak.
//!
//! The coordinator is pure: each `on_*` call updates [`ConversationState`]
//! and returns at most one [`Directive`] for the orchestrator to carry out.
//! It performs no I/O and never blocks, so it is driven from a single task
//! and tested without devices or sockets.
//!
//! # Inputs
//!
//! | Call                       | Source                      |
//! |----------------------------|-----------------------------|
//! | `on_capture_chunk`         | capture activity            |
//! | `on_transport_event`       | session transport           |
//! | `on_playback_drained`      | playback sink               |
//! | `on_interrupt_acknowledged`| orchestrator, after a flush |
//!
//! # Outputs
//!
//! Microphone audio accumulates in the outbound queue ([`TurnCoordinator::take_outbound`]);
//! model audio accumulates in the inbound queue and is released to the sink
//! only while [`Phase::Playing`] ([`TurnCoordinator::take_playable`]).

use std::sync::Arc;
use std::time::Duration;

use super::observer::{InterruptCause, TurnObserver};
use super::{ConversationState, Phase, TurnError};
use crate::audio::{AudioChunk, VadDetector};
use crate::config::TurnConfig;
use crate::transport::{TransportFailure, TurnEvent};

// ---------------------------------------------------------------------------
// Directive
// ---------------------------------------------------------------------------

/// Side effect the orchestrator must perform after a coordinator call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    None,
    /// Send an end-of-turn control frame.
    EndOfTurn,
    /// Flush playback, send an interrupt frame, then acknowledge.
    BargeIn,
    /// Flush playback (the remote already stopped), then acknowledge.
    FlushPlayback,
    /// The session is lost; tear it down.
    Teardown(TransportFailure),
}

// ---------------------------------------------------------------------------
// TurnCoordinator
// ---------------------------------------------------------------------------

pub struct TurnCoordinator {
    state: ConversationState,
    vad: VadDetector,
    silence_chunks: usize,
    barge_in_chunks: usize,
    observer: Arc<dyn TurnObserver>,
}

impl TurnCoordinator {
    /// `chunk_duration` is the length of one capture chunk; the silence
    /// timeout is converted to a whole number of chunks (at least one).
    pub fn new(
        config: &TurnConfig,
        chunk_duration: Duration,
        observer: Arc<dyn TurnObserver>,
    ) -> Self {
        let chunk_ms = chunk_duration.as_millis().max(1) as u64;
        let silence_chunks = config.silence_timeout_ms.div_ceil(chunk_ms).max(1) as usize;
        Self {
            state: ConversationState::new(config.outbound_capacity, config.inbound_capacity),
            vad: VadDetector::new(config.vad_threshold),
            silence_chunks,
            barge_in_chunks: config.barge_in_chunks.max(1),
            observer,
        }
    }

    pub fn phase(&self) -> Phase {
        self.state.phase
    }

    pub fn state(&self) -> &ConversationState {
        &self.state
    }

    // -----------------------------------------------------------------------
    // Capture
    // -----------------------------------------------------------------------

    /// A microphone chunk arrived.
    pub fn on_capture_chunk(&mut self, chunk: AudioChunk) -> Result<Directive, TurnError> {
        check_sequence(&mut self.state.last_capture_seq, &chunk, "capture");
        let speech = self.vad.is_speech(&chunk);

        match self.state.phase {
            Phase::Listening => {
                self.forward(chunk)?;
                if speech {
                    self.state.quiet_run = 0;
                    self.transition(Phase::Streaming);
                }
                Ok(Directive::None)
            }
            Phase::Streaming => {
                self.forward(chunk)?;
                if speech {
                    self.state.quiet_run = 0;
                    return Ok(Directive::None);
                }
                self.state.quiet_run += 1;
                if self.state.quiet_run < self.silence_chunks {
                    return Ok(Directive::None);
                }
                self.state.quiet_run = 0;
                if std::mem::take(&mut self.state.discarding) {
                    // The next model audio answers this turn, not the abandoned one.
                    log::debug!("turn: interrupted model turn never closed, discard window ends");
                }
                self.transition(Phase::AwaitingResponse);
                self.resolve_awaiting();
                Ok(Directive::EndOfTurn)
            }
            Phase::AwaitingResponse => {
                if speech {
                    self.state.quiet_run = 0;
                    self.transition(Phase::Streaming);
                    self.forward(chunk)?;
                }
                Ok(Directive::None)
            }
            Phase::Playing => {
                if !speech {
                    // Echo of the model's own voice stays below threshold.
                    self.state.speech_run = 0;
                    self.state.held.clear();
                    return Ok(Directive::None);
                }
                self.state.speech_run += 1;
                if self.state.held.len() < self.state.pending_outbound.capacity() {
                    self.state.held.push(chunk);
                }
                if self.state.speech_run < self.barge_in_chunks {
                    return Ok(Directive::None);
                }
                self.begin_interrupt(InterruptCause::BargeIn);
                Ok(Directive::BargeIn)
            }
            Phase::Interrupting => {
                if self.state.held.len() < self.state.pending_outbound.capacity() {
                    self.state.held.push(chunk);
                }
                Ok(Directive::None)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Transport
    // -----------------------------------------------------------------------

    /// An event arrived from the transport (or a capture chunk, via
    /// [`TurnEvent::UserAudio`]).
    pub fn on_transport_event(&mut self, event: TurnEvent) -> Result<Directive, TurnError> {
        log::trace!("turn: event {} in {}", event.label(), self.state.phase);
        match event {
            TurnEvent::UserAudio(chunk) => self.on_capture_chunk(chunk),
            TurnEvent::ModelAudio(chunk) => self.on_model_audio(chunk),
            TurnEvent::ModelTurnComplete => Ok(self.on_model_turn_complete()),
            TurnEvent::ModelInterrupted => Ok(self.on_model_interrupted()),
            TurnEvent::TransportError(kind) => Ok(Directive::Teardown(TransportFailure::Error(kind))),
            TurnEvent::TransportClosed => Ok(Directive::Teardown(TransportFailure::Closed)),
        }
    }

    fn on_model_audio(&mut self, chunk: AudioChunk) -> Result<Directive, TurnError> {
        check_sequence(&mut self.state.last_model_seq, &chunk, "model");

        if self.state.discarding {
            log::trace!("turn: discarding model audio #{} from interrupted turn", chunk.frame_seq());
            return Ok(Directive::None);
        }

        match self.state.phase {
            Phase::Listening => {
                self.transition(Phase::AwaitingResponse);
                self.buffer_inbound(chunk)?;
                self.enter_playing();
            }
            Phase::Streaming | Phase::Playing => self.buffer_inbound(chunk)?,
            Phase::AwaitingResponse => {
                self.buffer_inbound(chunk)?;
                self.enter_playing();
            }
            Phase::Interrupting => {
                log::trace!("turn: dropping model audio #{} while interrupting", chunk.frame_seq());
            }
        }
        Ok(Directive::None)
    }

    fn on_model_turn_complete(&mut self) -> Directive {
        if self.state.discarding {
            log::debug!("turn: interrupted model turn closed");
            self.state.discarding = false;
            return Directive::None;
        }

        match self.state.phase {
            Phase::Streaming => {
                if self.state.pending_inbound.is_empty() {
                    self.transition(Phase::Listening);
                } else {
                    self.state.buffered_turn_complete = true;
                }
            }
            Phase::AwaitingResponse => self.transition(Phase::Listening),
            Phase::Playing => {
                if self.state.active_playback || !self.state.pending_inbound.is_empty() {
                    self.state.turn_complete_seen = true;
                } else {
                    self.finish_turn();
                }
            }
            Phase::Listening | Phase::Interrupting => {}
        }
        Directive::None
    }

    fn on_model_interrupted(&mut self) -> Directive {
        if self.state.discarding {
            log::debug!("turn: interrupted model turn acknowledged by remote");
            self.state.discarding = false;
            return Directive::None;
        }

        match self.state.phase {
            Phase::Playing => {
                self.begin_interrupt(InterruptCause::Remote);
                Directive::FlushPlayback
            }
            Phase::Streaming => {
                self.state.pending_inbound.clear();
                self.state.buffered_turn_complete = false;
                Directive::None
            }
            Phase::AwaitingResponse => {
                self.transition(Phase::Listening);
                Directive::None
            }
            Phase::Listening | Phase::Interrupting => Directive::None,
        }
    }

    // -----------------------------------------------------------------------
    // Playback
    // -----------------------------------------------------------------------

    /// The sink rendered everything up to and including `last_seq`.
    ///
    /// Reports that do not match the last chunk handed over are stale and
    /// ignored.
    pub fn on_playback_drained(&mut self, last_seq: u64) {
        let current = self.state.phase == Phase::Playing
            && self.state.last_enqueued_seq == Some(last_seq)
            && self.state.pending_inbound.is_empty();
        if !current {
            log::trace!("turn: ignoring stale drain report #{last_seq}");
            return;
        }
        self.state.active_playback = false;
        if self.state.turn_complete_seen {
            self.finish_turn();
        }
    }

    /// The sink has been flushed; the user's speech may flow again.
    pub fn on_interrupt_acknowledged(&mut self) -> Result<(), TurnError> {
        if self.state.phase != Phase::Interrupting {
            return Ok(());
        }
        self.state.quiet_run = 0;
        self.transition(Phase::Streaming);
        for chunk in std::mem::take(&mut self.state.held) {
            self.forward(chunk)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Queues
    // -----------------------------------------------------------------------

    /// Next microphone chunk for the transport.
    pub fn take_outbound(&mut self) -> Option<AudioChunk> {
        self.state.pending_outbound.pop()
    }

    /// Next model chunk for the sink. Always `None` outside [`Phase::Playing`].
    pub fn take_playable(&mut self) -> Option<AudioChunk> {
        if self.state.phase != Phase::Playing {
            return None;
        }
        let chunk = self.state.pending_inbound.pop()?;
        self.state.active_playback = true;
        self.state.last_enqueued_seq = Some(chunk.frame_seq());
        Some(chunk)
    }

    pub fn has_playable(&self) -> bool {
        self.state.phase == Phase::Playing && !self.state.pending_inbound.is_empty()
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn transition(&mut self, next: Phase) {
        let from = self.state.phase;
        if !from.can_transition_to(next) {
            log::error!("turn: illegal transition {from} -> {next}");
        }
        self.state.phase = next;
        self.observer.on_phase_change(from, next);
    }

    fn forward(&mut self, chunk: AudioChunk) -> Result<(), TurnError> {
        let capacity = self.state.pending_outbound.capacity();
        self.state
            .pending_outbound
            .push(chunk)
            .map_err(|_| TurnError::OutboundOverflow { capacity })
    }

    fn buffer_inbound(&mut self, chunk: AudioChunk) -> Result<(), TurnError> {
        let capacity = self.state.pending_inbound.capacity();
        self.state
            .pending_inbound
            .push(chunk)
            .map_err(|_| TurnError::InboundOverflow { capacity })
    }

    /// Having just entered AwaitingResponse, act on what arrived while
    /// the user was still talking.
    fn resolve_awaiting(&mut self) {
        if !self.state.pending_inbound.is_empty() {
            self.enter_playing();
        } else if self.state.buffered_turn_complete {
            self.state.buffered_turn_complete = false;
            self.transition(Phase::Listening);
        }
    }

    fn enter_playing(&mut self) {
        self.transition(Phase::Playing);
        self.state.speech_run = 0;
        self.state.held.clear();
        self.state.turn_complete_seen = std::mem::take(&mut self.state.buffered_turn_complete);
        self.observer.on_enter_playing();
    }

    fn begin_interrupt(&mut self, cause: InterruptCause) {
        self.transition(Phase::Interrupting);
        let dropped = self.state.pending_inbound.clear();
        // A turn the model already finished has no closing event left to wait for.
        self.state.discarding =
            cause == InterruptCause::BargeIn && !self.state.turn_complete_seen;
        self.state.active_playback = false;
        self.state.turn_complete_seen = false;
        self.state.speech_run = 0;
        log::debug!("turn: interrupted ({cause:?}), dropped {dropped} buffered chunk(s)");
        self.observer.on_interrupted(cause);
    }

    fn finish_turn(&mut self) {
        self.transition(Phase::Listening);
        self.state.active_playback = false;
        self.state.turn_complete_seen = false;
        self.observer.on_turn_complete();
    }
}

fn check_sequence(last: &mut Option<u64>, chunk: &AudioChunk, direction: &str) {
    let seq = chunk.frame_seq();
    if let Some(prev) = *last {
        if seq <= prev {
            log::warn!("turn: {direction} frame #{seq} arrived after #{prev}");
        }
    }
    *last = Some(seq);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
