//! Audio I/O: microphone capture, speaker playback and the PCM glue between.
//!
//! # Data path
//!
//! ```text
//! Microphone → cpal callback → downmix/resample → CaptureSource (512 @ 16 kHz)
//!           → ChunkQueue → coordinator
//!
//! coordinator → PlaybackSink (ChunkQueue) → render thread → resample
//!           → OutputBuffer → cpal callback → Speaker
//! ```
//!
//! Both activities own their cpal stream on a dedicated OS thread and are
//! stopped by dropping (or calling `stop` on) their handle.

pub mod buffer;
pub mod capture;
pub mod chunk;
pub mod device;
pub mod playback;
pub mod resample;
pub mod vad;

#[cfg(test)]
pub(crate) mod testing;

pub use buffer::{ChunkQueue, Pop, PushError};
pub use capture::{CaptureActivity, CaptureSettings, CaptureSource, CpalInput};
pub use chunk::{AudioChunk, INPUT_CHUNK_SAMPLES, INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE};
pub use device::{
    AudioBackend, CpalBackend, DeviceError, DeviceEvent, Direction, InputDevice, InputSpec,
    OpenOutput, OutputBuffer, OutputSpec,
};
pub use playback::{CpalOutput, PlaybackSink};
pub use resample::{downmix, f32_to_pcm16, pcm16_to_f32, resample};
pub use vad::{rms, VadDetector};
