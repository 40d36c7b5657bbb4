//! The PCM chunk that flows through every stage of the pipeline.
//!
//! An [`AudioChunk`] is immutable once produced: the capture source and the
//! transport's inbound decoder create them, and ownership moves from queue to
//! queue without ever being shared mutably.

use bytes::Bytes;

// ---------------------------------------------------------------------------
// Fixed formats
// ---------------------------------------------------------------------------

/// Sample rate of microphone chunks sent to the remote model (Hz).
pub const INPUT_SAMPLE_RATE: u32 = 16_000;

/// Samples per microphone chunk: 512 samples = 32 ms at 16 kHz.
pub const INPUT_CHUNK_SAMPLES: usize = 512;

/// Sample rate of the model's synthesized voice (Hz).
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

// ---------------------------------------------------------------------------
// AudioChunk
// ---------------------------------------------------------------------------

/// A block of mono 16-bit little-endian PCM.
///
/// `frame_seq` is strictly increasing per direction (capture vs. model audio).
/// It exists for diagnostics and ordering assertions only; the transport
/// already guarantees order, so nothing reorders by it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    payload: Bytes,
    sample_rate: u32,
    frame_seq: u64,
}

impl AudioChunk {
    /// Wrap an already-encoded little-endian PCM payload.
    pub fn new(payload: impl Into<Bytes>, sample_rate: u32, frame_seq: u64) -> Self {
        Self {
            payload: payload.into(),
            sample_rate,
            frame_seq,
        }
    }

    /// Encode `samples` as little-endian PCM.
    ///
    /// ```
    /// use duplex_voice::audio::AudioChunk;
    ///
    /// let chunk = AudioChunk::from_samples(&[1, -2, 300], 16_000, 7);
    /// assert_eq!(chunk.payload().len(), 6);
    /// assert_eq!(chunk.samples(), vec![1, -2, 300]);
    /// assert_eq!(chunk.frame_seq(), 7);
    /// ```
    pub fn from_samples(samples: &[i16], sample_rate: u32, frame_seq: u64) -> Self {
        let mut payload = Vec::with_capacity(samples.len() * 2);
        for s in samples {
            payload.extend_from_slice(&s.to_le_bytes());
        }
        Self::new(payload, sample_rate, frame_seq)
    }

    /// Raw little-endian PCM bytes.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn frame_seq(&self) -> u64 {
        self.frame_seq
    }

    /// Decode the payload into samples. A trailing odd byte is ignored.
    pub fn samples(&self) -> Vec<i16> {
        self.payload
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect()
    }

    /// Number of whole samples in the payload.
    pub fn sample_count(&self) -> usize {
        self.payload.len() / 2
    }

    /// Playback duration in milliseconds.
    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        self.sample_count() as u64 * 1_000 / self.sample_rate as u64
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
