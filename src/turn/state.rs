//! The single mutable record of one conversation.

use std::collections::VecDeque;

use super::Phase;
use crate::audio::AudioChunk;

// ---------------------------------------------------------------------------
// BoundedQueue
// ---------------------------------------------------------------------------

/// FIFO with a hard capacity. `push` hands the item back when full.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, item: T) -> Result<(), T> {
        if self.items.len() >= self.capacity {
            return Err(item);
        }
        self.items.push_back(item);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    /// Drop everything; returns how many items were dropped.
    pub fn clear(&mut self) -> usize {
        let n = self.items.len();
        self.items.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

// ---------------------------------------------------------------------------
// ConversationState
// ---------------------------------------------------------------------------

/// Owned exclusively by the turn coordinator; created at session start in
/// [`Phase::Listening`] and discarded with the connection.
#[derive(Debug)]
pub struct ConversationState {
    pub phase: Phase,
    /// Microphone audio waiting for the transport.
    pub pending_outbound: BoundedQueue<AudioChunk>,
    /// Model audio waiting for the playback sink.
    pub pending_inbound: BoundedQueue<AudioChunk>,
    /// Audio has been handed to the sink and it has not reported draining.
    pub active_playback: bool,

    /// Consecutive non-speech capture chunks while streaming.
    pub(crate) quiet_run: usize,
    /// Consecutive speech chunks while playing.
    pub(crate) speech_run: usize,
    /// Speech captured during playback, forwarded if it turns into a barge-in.
    pub(crate) held: Vec<AudioChunk>,
    /// Inbound audio belongs to an interrupted model turn.
    pub(crate) discarding: bool,
    /// The model finished generating the turn now playing.
    pub(crate) turn_complete_seen: bool,
    /// A turn-complete arrived while audio was buffered during streaming.
    pub(crate) buffered_turn_complete: bool,
    /// Sequence number of the last chunk handed to the sink.
    pub(crate) last_enqueued_seq: Option<u64>,
    pub(crate) last_capture_seq: Option<u64>,
    pub(crate) last_model_seq: Option<u64>,
}

impl ConversationState {
    pub fn new(outbound_capacity: usize, inbound_capacity: usize) -> Self {
        Self {
            phase: Phase::Listening,
            pending_outbound: BoundedQueue::new(outbound_capacity),
            pending_inbound: BoundedQueue::new(inbound_capacity),
            active_playback: false,
            quiet_run: 0,
            speech_run: 0,
            held: Vec::new(),
            discarding: false,
            turn_complete_seen: false,
            buffered_turn_complete: false,
            last_enqueued_seq: None,
            last_capture_seq: None,
            last_model_seq: None,
        }
    }
}
