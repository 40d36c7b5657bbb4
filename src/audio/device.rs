//! Audio device boundary.
//!
//! The pipeline only needs two primitives from hardware: "read the next N
//! samples" and "write N samples". [`InputDevice`] and [`OutputBuffer`]
//! express those; [`AudioBackend`] opens them. [`CpalBackend`] is the
//! production backend; tests supply their own.
//!
//! Devices are opened *on the activity thread that uses them* because
//! `cpal::Stream` is not `Send` on every platform. The stream guard stays on
//! that thread and is dropped (closing the device) when the activity exits.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait};
use thiserror::Error;

use crate::audio::capture::CpalInput;
use crate::audio::playback::CpalOutput;

// ---------------------------------------------------------------------------
// Direction / DeviceError
// ---------------------------------------------------------------------------

/// Which side of the audio path a device serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Input => f.write_str("input"),
            Direction::Output => f.write_str("output"),
        }
    }
}

/// Capture or playback hardware failure. Always fatal to the session.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("no {0} device found on the default audio host")]
    NoDevice(Direction),

    #[error("{direction} device {name:?} not found")]
    NotFound { direction: Direction, name: String },

    #[error("failed to enumerate audio devices: {0}")]
    Enumerate(#[from] cpal::DevicesError),

    #[error("failed to query default stream config: {0}")]
    DefaultConfig(#[from] cpal::DefaultStreamConfigError),

    #[error("failed to build audio stream: {0}")]
    BuildStream(#[from] cpal::BuildStreamError),

    #[error("failed to start audio stream: {0}")]
    PlayStream(#[from] cpal::PlayStreamError),

    /// The running stream reported an error (device unplugged, driver fault).
    #[error("audio stream failed: {0}")]
    Stream(String),

    #[error("{0} device disconnected")]
    Disconnected(Direction),

    #[error("failed to start {0} activity thread")]
    Spawn(Direction),
}

// ---------------------------------------------------------------------------
// DeviceEvent
// ---------------------------------------------------------------------------

/// Status reports from the device activities to the coordinator loop.
#[derive(Debug)]
pub enum DeviceEvent {
    /// The playback sink rendered everything it was given; `last_seq` is the
    /// frame sequence number of the final chunk it rendered.
    PlaybackDrained { last_seq: u64 },
    /// A device activity stopped on a hardware error.
    Failed(DeviceError),
}

// ---------------------------------------------------------------------------
// Device traits
// ---------------------------------------------------------------------------

/// Mono 16-bit PCM source at the requested rate.
pub trait InputDevice {
    /// Block for up to `timeout` until exactly `samples` samples are
    /// available. `Ok(None)` means the timeout elapsed first.
    fn read(&mut self, samples: usize, timeout: Duration)
        -> Result<Option<Vec<i16>>, DeviceError>;
}

/// Device-side sample buffer consumed by the real-time output callback.
///
/// Shared between the playback thread (which writes) and the coordinator
/// (which clears on barge-in), hence `&self` methods.
pub trait OutputBuffer: Send + Sync {
    /// Rate the device renders at; callers resample to it.
    fn sample_rate(&self) -> u32;

    /// Append up to `samples.len()` mono samples, blocking for at most
    /// `timeout` for room. Returns how many were accepted (possibly zero).
    fn write(&self, samples: &[f32], timeout: Duration) -> Result<usize, DeviceError>;

    /// Drop everything not yet rendered; the device falls silent at once.
    fn clear(&self);

    /// Samples accepted but not yet rendered.
    fn pending(&self) -> usize;
}

/// An opened output device: the shared buffer plus whatever keeps the
/// underlying stream alive. Dropping `guard` closes the device.
pub struct OpenOutput {
    pub buffer: Arc<dyn OutputBuffer>,
    pub guard: Box<dyn Any>,
}

/// What the capture side asks of the input device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputSpec {
    pub device: Option<String>,
    pub sample_rate: u32,
}

/// What the playback side asks of the output device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSpec {
    pub device: Option<String>,
}

/// Opens devices. Called from the activity thread that will own them.
pub trait AudioBackend: Send + Sync {
    fn open_input(&self, spec: &InputSpec) -> Result<Box<dyn InputDevice>, DeviceError>;
    fn open_output(&self, spec: &OutputSpec) -> Result<OpenOutput, DeviceError>;
}

// ---------------------------------------------------------------------------
// CpalBackend
// ---------------------------------------------------------------------------

/// Production backend on the system's default cpal host.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

impl CpalBackend {
    fn find_device(
        direction: Direction,
        name: Option<&str>,
    ) -> Result<cpal::Device, DeviceError> {
        let host = cpal::default_host();
        match (direction, name) {
            (Direction::Input, None) => host
                .default_input_device()
                .ok_or(DeviceError::NoDevice(direction)),
            (Direction::Output, None) => host
                .default_output_device()
                .ok_or(DeviceError::NoDevice(direction)),
            (_, Some(wanted)) => {
                let mut devices = match direction {
                    Direction::Input => host.input_devices()?,
                    Direction::Output => host.output_devices()?,
                };
                devices
                    .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
                    .ok_or_else(|| DeviceError::NotFound {
                        direction,
                        name: wanted.to_string(),
                    })
            }
        }
    }
}

impl AudioBackend for CpalBackend {
    fn open_input(&self, spec: &InputSpec) -> Result<Box<dyn InputDevice>, DeviceError> {
        let device = Self::find_device(Direction::Input, spec.device.as_deref())?;
        log::info!(
            "audio: opening input device {:?}",
            device.name().unwrap_or_default()
        );
        Ok(Box::new(CpalInput::open(&device, spec.sample_rate)?))
    }

    fn open_output(&self, spec: &OutputSpec) -> Result<OpenOutput, DeviceError> {
        let device = Self::find_device(Direction::Output, spec.device.as_deref())?;
        log::info!(
            "audio: opening output device {:?}",
            device.name().unwrap_or_default()
        );
        let (buffer, stream) = CpalOutput::open(&device)?;
        Ok(OpenOutput {
            buffer,
            guard: Box::new(stream),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_error_messages_name_the_direction() {
        assert_eq!(
            DeviceError::NoDevice(Direction::Input).to_string(),
            "no input device found on the default audio host"
        );
        let err = DeviceError::NotFound {
            direction: Direction::Output,
            name: "USB Speaker".into(),
        };
        assert_eq!(err.to_string(), "output device \"USB Speaker\" not found");
    }

    #[test]
    fn backend_trait_is_object_safe() {
        fn assert_send_sync<T: Send + Sync + ?Sized>() {}
        assert_send_sync::<dyn AudioBackend>();
        assert_send_sync::<dyn OutputBuffer>();
    }
}
