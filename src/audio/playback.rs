//! Speaker output: bounded chunk queue → render thread → device buffer.
//!
//! ```text
//!  coordinator ──enqueue──▶ ChunkQueue ──render thread──▶ OutputBuffer ──▶ cpal callback
//!       │                                    ▲
//!       └──────────── flush ─────────────────┘  (epoch bump + clear both)
//! ```
//!
//! Chunks are tagged with the sink's epoch when enqueued. [`PlaybackSink::flush`]
//! bumps the epoch under the render lock, so a chunk that was mid-render when
//! the flush landed is abandoned and no audio from before the flush reaches
//! the device afterwards.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use cpal::traits::{DeviceTrait, StreamTrait};
use tokio::sync::mpsc;

use crate::audio::buffer::{ChunkQueue, Pop};
use crate::audio::device::{
    AudioBackend, DeviceError, DeviceEvent, Direction, OutputBuffer, OutputSpec,
};
use crate::audio::resample::{pcm16_to_f32, resample};
use crate::audio::AudioChunk;
use crate::config::AudioConfig;

/// How long the render thread waits for a chunk before checking for drain.
const QUEUE_POLL: Duration = Duration::from_millis(10);

/// Longest a single device write may hold the render lock.
const WRITE_SLICE: Duration = Duration::from_millis(10);

/// Device-side buffering kept by [`CpalOutput`].
const DEVICE_BUFFER_MS: usize = 200;

// ---------------------------------------------------------------------------
// CpalOutput
// ---------------------------------------------------------------------------

struct OutputFifo {
    samples: VecDeque<f32>,
    failed: Option<String>,
}

struct OutputShared {
    fifo: Mutex<OutputFifo>,
    room: Condvar,
    capacity: usize,
    sample_rate: u32,
}

impl OutputShared {
    fn lock(&self) -> MutexGuard<'_, OutputFifo> {
        self.fifo.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Mono sample FIFO feeding a cpal output stream at the device's own rate.
pub struct CpalOutput {
    shared: Arc<OutputShared>,
}

impl CpalOutput {
    /// Open `device` at its default config. The returned stream must be kept
    /// alive for as long as audio should play.
    pub(crate) fn open(
        device: &cpal::Device,
    ) -> Result<(Arc<dyn OutputBuffer>, cpal::Stream), DeviceError> {
        let supported = device.default_output_config()?;
        let channels = supported.channels().max(1) as usize;
        let sample_rate = supported.sample_rate().0;
        let config: cpal::StreamConfig = supported.into();

        log::debug!("playback: device runs at {sample_rate} Hz x{channels}");

        let shared = Arc::new(OutputShared {
            fifo: Mutex::new(OutputFifo {
                samples: VecDeque::new(),
                failed: None,
            }),
            room: Condvar::new(),
            capacity: (sample_rate as usize * DEVICE_BUFFER_MS / 1000).max(1),
            sample_rate,
        });

        let data_shared = Arc::clone(&shared);
        let err_shared = Arc::clone(&shared);

        let stream = device.build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                {
                    let mut fifo = data_shared.lock();
                    for frame in data.chunks_mut(channels) {
                        let sample = fifo.samples.pop_front().unwrap_or(0.0);
                        frame.fill(sample);
                    }
                }
                data_shared.room.notify_one();
            },
            move |err: cpal::StreamError| {
                log::error!("cpal output stream error: {err}");
                err_shared.lock().failed = Some(err.to_string());
                err_shared.room.notify_all();
            },
            None,
        )?;

        stream.play()?;
        let buffer: Arc<dyn OutputBuffer> = Arc::new(Self { shared });
        Ok((buffer, stream))
    }
}

impl OutputBuffer for CpalOutput {
    fn sample_rate(&self) -> u32 {
        self.shared.sample_rate
    }

    fn write(&self, samples: &[f32], timeout: Duration) -> Result<usize, DeviceError> {
        let capacity = self.shared.capacity;
        let fifo = self.shared.lock();
        let (mut fifo, _) = self
            .shared
            .room
            .wait_timeout_while(fifo, timeout, |f| {
                f.failed.is_none() && f.samples.len() >= capacity
            })
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(message) = fifo.failed.take() {
            return Err(DeviceError::Stream(message));
        }
        let room = capacity.saturating_sub(fifo.samples.len());
        let accepted = room.min(samples.len());
        fifo.samples.extend(&samples[..accepted]);
        Ok(accepted)
    }

    fn clear(&self) {
        self.shared.lock().samples.clear();
        self.shared.room.notify_all();
    }

    fn pending(&self) -> usize {
        self.shared.lock().samples.len()
    }
}

// ---------------------------------------------------------------------------
// PlaybackSink
// ---------------------------------------------------------------------------

struct Queued {
    epoch: u64,
    chunk: AudioChunk,
}

struct SinkShared {
    epoch: AtomicU64,
    /// Held while writing to the device and while flushing.
    render: Mutex<()>,
}

/// Bounded, flushable queue of model audio in front of the speaker.
///
/// Only the coordinator task enqueues and flushes. The render thread is the
/// sole consumer.
pub struct PlaybackSink {
    queue: Arc<ChunkQueue<Queued>>,
    shared: Arc<SinkShared>,
    buffer: Arc<dyn OutputBuffer>,
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl PlaybackSink {
    /// Open the output device on a new render thread.
    ///
    /// Blocks until the device is open. `PlaybackDrained` and device failures
    /// are reported through `events`.
    pub fn spawn(
        backend: Arc<dyn AudioBackend>,
        spec: OutputSpec,
        capacity: usize,
        events: mpsc::UnboundedSender<DeviceEvent>,
    ) -> Result<Self, DeviceError> {
        let queue = Arc::new(ChunkQueue::new(capacity));
        let shared = Arc::new(SinkShared {
            epoch: AtomicU64::new(0),
            render: Mutex::new(()),
        });
        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) =
            std::sync::mpsc::channel::<Result<Arc<dyn OutputBuffer>, DeviceError>>();

        let thread = {
            let queue = Arc::clone(&queue);
            let shared = Arc::clone(&shared);
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("playback".into())
                .spawn(move || {
                    let open = match backend.open_output(&spec) {
                        Ok(open) => open,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    let _guard = open.guard;
                    let _ = ready_tx.send(Ok(Arc::clone(&open.buffer)));
                    let renderer = Renderer {
                        queue: &queue,
                        shared: &shared,
                        buffer: open.buffer.as_ref(),
                        stop: &stop,
                    };
                    renderer.run(&events);
                    log::debug!("playback: thread exiting");
                })
                .map_err(|_| DeviceError::Spawn(Direction::Output))?
        };

        match ready_rx.recv() {
            Ok(Ok(buffer)) => Ok(Self {
                queue,
                shared,
                buffer,
                stop,
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(DeviceError::Spawn(Direction::Output))
            }
        }
    }

    pub fn spec_from_config(config: &AudioConfig) -> OutputSpec {
        OutputSpec {
            device: config.output_device.clone(),
        }
    }

    /// Queue `chunk` for playback, handing it back if the queue is full.
    pub fn enqueue(&self, chunk: AudioChunk) -> Result<(), AudioChunk> {
        let epoch = self.shared.epoch.load(Ordering::Acquire);
        self.queue
            .try_push(Queued { epoch, chunk })
            .map_err(|e| e.into_inner().chunk)
    }

    pub fn has_capacity(&self) -> bool {
        self.queue.len() < self.queue.capacity()
    }

    /// Resolves once the queue has room (or is closed).
    pub async fn wait_for_space(&self) {
        self.queue.wait_for_space().await
    }

    /// Silence the speaker now: drop queued chunks, abandon the chunk being
    /// rendered, and clear the device buffer. Returns the number of queued
    /// chunks dropped. Safe to call repeatedly.
    pub fn flush(&self) -> usize {
        let _render = self.shared.render.lock().unwrap_or_else(PoisonError::into_inner);
        self.shared.epoch.fetch_add(1, Ordering::AcqRel);
        let dropped = self.queue.clear();
        self.buffer.clear();
        if dropped > 0 {
            log::debug!("playback: flushed {dropped} queued chunk(s)");
        }
        dropped
    }

    /// Nothing queued and nothing left in the device buffer.
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.buffer.pending() == 0
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Flush, stop the render thread and close the device. Idempotent.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.flush();
        self.queue.close();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("playback: thread panicked");
            }
        }
    }
}

impl Drop for PlaybackSink {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---------------------------------------------------------------------------
// Render loop
// ---------------------------------------------------------------------------

struct Renderer<'a> {
    queue: &'a ChunkQueue<Queued>,
    shared: &'a SinkShared,
    buffer: &'a dyn OutputBuffer,
    stop: &'a AtomicBool,
}

impl Renderer<'_> {
    fn run(&self, events: &mpsc::UnboundedSender<DeviceEvent>) {
        let mut last_rendered: Option<u64> = None;
        let mut drain_reported = true;

        while !self.stop.load(Ordering::Acquire) {
            match self.queue.pop_timeout(QUEUE_POLL) {
                Pop::Item(queued) => {
                    let seq = queued.chunk.frame_seq();
                    match self.render(&queued) {
                        Ok(true) => {
                            last_rendered = Some(seq);
                            drain_reported = false;
                        }
                        // Flushed mid-render; nothing from that turn is owed a drain.
                        Ok(false) => drain_reported = true,
                        Err(e) => {
                            log::error!("playback: {e}");
                            let _ = events.send(DeviceEvent::Failed(e));
                            return;
                        }
                    }
                }
                Pop::Empty => {
                    if drain_reported || self.buffer.pending() > 0 {
                        continue;
                    }
                    if let Some(last_seq) = last_rendered {
                        log::trace!("playback: drained after chunk #{last_seq}");
                        let _ = events.send(DeviceEvent::PlaybackDrained { last_seq });
                    }
                    drain_reported = true;
                }
                Pop::Closed => return,
            }
        }
    }

    /// Write one chunk to the device. `Ok(false)` if a flush or stop
    /// superseded it part-way.
    fn render(&self, queued: &Queued) -> Result<bool, DeviceError> {
        let chunk = &queued.chunk;
        let samples = resample(
            &pcm16_to_f32(&chunk.samples()),
            chunk.sample_rate(),
            self.buffer.sample_rate(),
        );

        let mut offset = 0;
        while offset < samples.len() {
            if self.stop.load(Ordering::Acquire) {
                return Ok(false);
            }
            let accepted = {
                let _render = self
                    .shared
                    .render
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                if self.shared.epoch.load(Ordering::Acquire) != queued.epoch {
                    return Ok(false);
                }
                self.buffer.write(&samples[offset..], WRITE_SLICE)?
            };
            if accepted == 0 {
                // Device full: let a pending flush take the lock.
                thread::sleep(Duration::from_millis(1));
            }
            offset += accepted;
        }
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::testing::MockBackend;

    fn spec() -> OutputSpec {
        OutputSpec { device: None }
    }

    fn model_chunk(seq: u64, samples: usize) -> AudioChunk {
        AudioChunk::from_samples(&vec![16_384; samples], 24_000, seq)
    }

    #[tokio::test]
    async fn renders_in_order_and_reports_drain() {
        let (backend, _mic) = MockBackend::new(24_000);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let sink = PlaybackSink::spawn(backend.clone(), spec(), 8, events_tx).unwrap();

        sink.enqueue(model_chunk(0, 100)).unwrap();
        sink.enqueue(model_chunk(1, 50)).unwrap();

        match events_rx.recv().await {
            Some(DeviceEvent::PlaybackDrained { last_seq }) => assert_eq!(last_seq, 1),
            other => panic!("unexpected event: {other:?}"),
        }
        let written = backend.output.written();
        assert_eq!(written.len(), 150);
        assert!((written[0] - 0.5).abs() < 1e-6);
        assert!(sink.is_idle());
    }

    #[tokio::test]
    async fn resamples_to_device_rate() {
        let (backend, _mic) = MockBackend::new(48_000);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let sink = PlaybackSink::spawn(backend.clone(), spec(), 8, events_tx).unwrap();

        sink.enqueue(model_chunk(0, 240)).unwrap();
        events_rx.recv().await.unwrap();
        assert_eq!(backend.output.written().len(), 480);
    }

    #[tokio::test]
    async fn full_queue_hands_chunk_back() {
        let (backend, _mic) = MockBackend::new(24_000);
        backend.output.set_accepting(false);
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let sink = PlaybackSink::spawn(backend, spec(), 1, events_tx).unwrap();

        // The render thread takes the first chunk and stalls on the device.
        sink.enqueue(model_chunk(0, 10)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        sink.enqueue(model_chunk(1, 10)).unwrap();

        assert!(!sink.has_capacity());
        let rejected = sink.enqueue(model_chunk(2, 10)).unwrap_err();
        assert_eq!(rejected.frame_seq(), 2);
    }

    #[tokio::test]
    async fn flush_discards_queued_and_in_flight_audio() {
        let (backend, _mic) = MockBackend::new(24_000);
        backend.output.set_accepting(false);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let sink = PlaybackSink::spawn(backend.clone(), spec(), 8, events_tx).unwrap();

        for seq in 0..3 {
            sink.enqueue(model_chunk(seq, 10)).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(sink.flush(), 2);
        assert_eq!(sink.flush(), 0);
        assert!(backend.output.clears() >= 2);

        backend.output.set_accepting(true);
        sink.enqueue(model_chunk(7, 10)).unwrap();
        match events_rx.recv().await {
            Some(DeviceEvent::PlaybackDrained { last_seq }) => assert_eq!(last_seq, 7),
            other => panic!("unexpected event: {other:?}"),
        }
        // Only the post-flush chunk reached the device.
        assert_eq!(backend.output.written().len(), 10);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let (backend, _mic) = MockBackend::new(24_000);
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let mut sink = PlaybackSink::spawn(backend, spec(), 4, events_tx).unwrap();
        sink.enqueue(model_chunk(0, 10)).unwrap();
        sink.stop();
        sink.stop();
        assert_eq!(sink.queued(), 0);
    }
}
