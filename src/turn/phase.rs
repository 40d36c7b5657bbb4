//! Whose turn it is to talk.

use std::fmt;

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

/// Conversation phase. Exactly one is current at any instant.
///
/// ```text
/// Listening        ──speech──────────────▶ Streaming
/// Listening        ──model audio─────────▶ AwaitingResponse ─▶ Playing
/// Streaming        ──silence timeout─────▶ AwaitingResponse
/// Streaming        ──turn complete───────▶ Listening
/// AwaitingResponse ──model audio─────────▶ Playing
/// AwaitingResponse ──speech──────────────▶ Streaming
/// AwaitingResponse ──turn complete───────▶ Listening
/// Playing          ──drained + complete──▶ Listening
/// Playing          ──barge-in────────────▶ Interrupting
/// Interrupting     ──flush acknowledged──▶ Streaming
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Phase {
    /// No model speech pending; the microphone is forwarded as-is.
    #[default]
    Listening,

    /// The user is talking; microphone chunks are forwarded.
    Streaming,

    /// The user paused; waiting for the model's first response chunk.
    AwaitingResponse,

    /// The model's voice is being rendered.
    Playing,

    /// Playback was cut short; waiting for the flush to be acknowledged.
    Interrupting,
}

impl Phase {
    /// Every phase, in declaration order.
    pub const ALL: [Phase; 5] = [
        Phase::Listening,
        Phase::Streaming,
        Phase::AwaitingResponse,
        Phase::Playing,
        Phase::Interrupting,
    ];

    /// Short label for logs and status displays.
    pub fn label(&self) -> &'static str {
        match self {
            Phase::Listening => "listening",
            Phase::Streaming => "streaming",
            Phase::AwaitingResponse => "awaiting-response",
            Phase::Playing => "playing",
            Phase::Interrupting => "interrupting",
        }
    }

    /// Whether the state machine has an edge from `self` to `next`.
    ///
    /// ```
    /// use duplex_voice::turn::Phase;
    ///
    /// assert!(Phase::Playing.can_transition_to(Phase::Interrupting));
    /// assert!(!Phase::Streaming.can_transition_to(Phase::Playing));
    /// assert!(!Phase::Listening.can_transition_to(Phase::Interrupting));
    /// ```
    pub fn can_transition_to(&self, next: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, next),
            (Listening, Streaming)
                | (Listening, AwaitingResponse)
                | (Streaming, AwaitingResponse)
                | (Streaming, Listening)
                | (AwaitingResponse, Playing)
                | (AwaitingResponse, Streaming)
                | (AwaitingResponse, Listening)
                | (Playing, Listening)
                | (Playing, Interrupting)
                | (Interrupting, Streaming)
        )
    }

    /// Whether microphone audio is currently being forwarded upstream.
    pub fn forwards_microphone(&self) -> bool {
        matches!(self, Phase::Listening | Phase::Streaming)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupting_only_from_playing() {
        for from in Phase::ALL {
            assert_eq!(
                from.can_transition_to(Phase::Interrupting),
                from == Phase::Playing,
                "{from} -> interrupting"
            );
        }
    }

    #[test]
    fn playing_only_from_awaiting_response() {
        for from in Phase::ALL {
            assert_eq!(
                from.can_transition_to(Phase::Playing),
                from == Phase::AwaitingResponse,
                "{from} -> playing"
            );
        }
    }

    #[test]
    fn interrupting_resumes_streaming_only() {
        let targets: Vec<Phase> = Phase::ALL
            .into_iter()
            .filter(|&to| Phase::Interrupting.can_transition_to(to))
            .collect();
        assert_eq!(targets, vec![Phase::Streaming]);
    }

    #[test]
    fn no_self_loops() {
        for p in Phase::ALL {
            assert!(!p.can_transition_to(p), "{p} -> {p}");
        }
    }

    #[test]
    fn labels_and_default() {
        assert_eq!(Phase::default(), Phase::Listening);
        assert_eq!(Phase::AwaitingResponse.to_string(), "awaiting-response");
        assert!(Phase::Listening.forwards_microphone());
        assert!(!Phase::Playing.forwards_microphone());
    }
}
