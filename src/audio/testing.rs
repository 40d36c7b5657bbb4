//! In-memory audio backend shared by the capture, playback and pipeline tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::audio::device::{
    AudioBackend, DeviceError, Direction, InputDevice, InputSpec, OpenOutput, OutputBuffer,
    OutputSpec,
};

pub(crate) type ScriptedRead = Result<Vec<i16>, String>;

/// Replays reads sent through a channel; `Err` entries become stream failures.
pub(crate) struct ScriptedInput {
    reads: Arc<Mutex<mpsc::Receiver<ScriptedRead>>>,
}

impl InputDevice for ScriptedInput {
    fn read(&mut self, _samples: usize, timeout: Duration) -> Result<Option<Vec<i16>>, DeviceError> {
        let reads = self.reads.lock().unwrap();
        match reads.recv_timeout(timeout) {
            Ok(Ok(samples)) => Ok(Some(samples)),
            Ok(Err(message)) => Err(DeviceError::Stream(message)),
            Err(_) => Ok(None),
        }
    }
}

/// Output buffer that records every accepted sample and never lags.
pub(crate) struct RecordingOutput {
    rate: u32,
    written: Mutex<Vec<f32>>,
    accepting: AtomicBool,
    clears: AtomicUsize,
}

impl RecordingOutput {
    pub(crate) fn new(rate: u32) -> Self {
        Self {
            rate,
            written: Mutex::new(Vec::new()),
            accepting: AtomicBool::new(true),
            clears: AtomicUsize::new(0),
        }
    }

    /// While paused, writes accept nothing, like a device whose buffer is full.
    pub(crate) fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::SeqCst);
    }

    pub(crate) fn written(&self) -> Vec<f32> {
        self.written.lock().unwrap().clone()
    }

    pub(crate) fn clears(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }
}

impl OutputBuffer for RecordingOutput {
    fn sample_rate(&self) -> u32 {
        self.rate
    }

    fn write(&self, samples: &[f32], timeout: Duration) -> Result<usize, DeviceError> {
        if !self.accepting.load(Ordering::SeqCst) {
            std::thread::sleep(timeout.min(Duration::from_millis(5)));
            return Ok(0);
        }
        self.written.lock().unwrap().extend_from_slice(samples);
        Ok(samples.len())
    }

    fn clear(&self) {
        self.clears.fetch_add(1, Ordering::SeqCst);
    }

    fn pending(&self) -> usize {
        0
    }
}

/// Backend handing out a scripted microphone and a recording speaker.
///
/// The microphone script is shared, so every session opened against the
/// backend reads from the same channel.
pub(crate) struct MockBackend {
    reads: Option<Arc<Mutex<mpsc::Receiver<ScriptedRead>>>>,
    pub(crate) output: Arc<RecordingOutput>,
    pub(crate) input_opens: AtomicUsize,
    pub(crate) output_opens: AtomicUsize,
}

impl MockBackend {
    pub(crate) fn new(output_rate: u32) -> (Arc<Self>, mpsc::Sender<ScriptedRead>) {
        let (tx, rx) = mpsc::channel();
        let backend = Arc::new(Self {
            reads: Some(Arc::new(Mutex::new(rx))),
            output: Arc::new(RecordingOutput::new(output_rate)),
            input_opens: AtomicUsize::new(0),
            output_opens: AtomicUsize::new(0),
        });
        (backend, tx)
    }

    /// A backend whose input device is missing.
    pub(crate) fn without_input(output_rate: u32) -> Arc<Self> {
        Arc::new(Self {
            reads: None,
            output: Arc::new(RecordingOutput::new(output_rate)),
            input_opens: AtomicUsize::new(0),
            output_opens: AtomicUsize::new(0),
        })
    }
}

impl AudioBackend for MockBackend {
    fn open_input(&self, _spec: &InputSpec) -> Result<Box<dyn InputDevice>, DeviceError> {
        let reads = self
            .reads
            .clone()
            .ok_or(DeviceError::NoDevice(Direction::Input))?;
        self.input_opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedInput { reads }))
    }

    fn open_output(&self, _spec: &OutputSpec) -> Result<OpenOutput, DeviceError> {
        self.output_opens.fetch_add(1, Ordering::SeqCst);
        let buffer: Arc<dyn OutputBuffer> = self.output.clone();
        Ok(OpenOutput {
            buffer,
            guard: Box::new(()),
        })
    }
}

/// Wrap a receiver as a standalone input device.
pub(crate) fn scripted_input(rx: mpsc::Receiver<ScriptedRead>) -> Box<dyn InputDevice> {
    Box::new(ScriptedInput {
        reads: Arc::new(Mutex::new(rx)),
    })
}
