//! Energy-based voice activity detection for capture chunks.
//!
//! The capture source never interprets audio. The turn coordinator asks a
//! [`VadDetector`] whether each chunk holds speech so it can tell a user who
//! is talking from an open microphone in a quiet room. That distinction
//! drives the end of a user turn (a run of quiet chunks) and barge-in (speech
//! while the model is playing).
//!
//! A chunk is speech when its RMS amplitude, normalised to `[0.0, 1.0]`,
//! exceeds the configured threshold.

use crate::audio::AudioChunk;

// ---------------------------------------------------------------------------
// VadDetector
// ---------------------------------------------------------------------------

/// RMS speech classifier.
///
/// ```rust
/// use duplex_voice::audio::{AudioChunk, VadDetector};
///
/// let vad = VadDetector::new(0.02);
/// let quiet = AudioChunk::from_samples(&[0; 512], 16_000, 0);
/// let loud = AudioChunk::from_samples(&[8_000; 512], 16_000, 1);
/// assert!(!vad.is_speech(&quiet));
/// assert!(vad.is_speech(&loud));
/// ```
#[derive(Debug, Clone)]
pub struct VadDetector {
    rms_threshold: f32,
}

impl VadDetector {
    /// `rms_threshold` is in `[0.0, 1.0]`; `0.01`–`0.02` suits a quiet room,
    /// `0.03`–`0.05` a noisy one or a loud speaker next to the microphone.
    pub fn new(rms_threshold: f32) -> Self {
        Self { rms_threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.rms_threshold
    }

    /// Returns `true` when `chunk` carries voice activity.
    pub fn is_speech(&self, chunk: &AudioChunk) -> bool {
        rms(&chunk.samples()) > self.rms_threshold
    }
}

/// Normalised RMS amplitude of 16-bit samples; `0.0` for an empty slice.
pub fn rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let mean_sq = samples
        .iter()
        .map(|&s| {
            let v = s as f64 / 32_768.0;
            v * v
        })
        .sum::<f64>()
        / samples.len() as f64;
    mean_sq.sqrt() as f32
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
