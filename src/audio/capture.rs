//! Microphone capture: cpal input → fixed 512-sample chunks → bounded queue.
//!
//! [`CaptureSource`] turns an [`InputDevice`] into a stream of numbered
//! [`AudioChunk`]s. [`CaptureActivity`] runs it on a dedicated thread and
//! pushes each chunk into a bounded [`ChunkQueue`] using the configured
//! [`OverflowPolicy`]. The activity never inspects audio content.
//!
//! [`CaptureActivity`] is a RAII guard: dropping it stops the thread and
//! closes the device.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use cpal::traits::{DeviceTrait, StreamTrait};
use tokio::sync::mpsc;

use crate::audio::buffer::{ChunkQueue, PushError};
use crate::audio::device::{AudioBackend, DeviceError, DeviceEvent, Direction, InputDevice, InputSpec};
use crate::audio::resample::{downmix, f32_to_pcm16, resample};
use crate::audio::AudioChunk;
use crate::config::{AudioConfig, OverflowPolicy};

/// How long a device read waits before re-checking the stop flag.
const READ_POLL: Duration = Duration::from_millis(20);

/// Device-side backlog kept by [`CpalInput`] before the oldest audio is shed.
const MAX_BACKLOG_SECS: usize = 2;

// ---------------------------------------------------------------------------
// CpalInput
// ---------------------------------------------------------------------------

struct InputFifo {
    samples: VecDeque<i16>,
    failed: Option<String>,
}

impl InputFifo {
    /// Append `pcm`, shedding the oldest samples beyond `max_backlog`.
    /// Returns how many were shed.
    fn append(&mut self, pcm: Vec<i16>, max_backlog: usize) -> usize {
        self.samples.extend(pcm);
        let excess = self.samples.len().saturating_sub(max_backlog);
        if excess > 0 {
            self.samples.drain(..excess);
        }
        excess
    }
}

struct InputShared {
    fifo: Mutex<InputFifo>,
    ready: Condvar,
}

impl InputShared {
    fn lock(&self) -> MutexGuard<'_, InputFifo> {
        self.fifo.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// cpal input stream converted to mono 16-bit PCM at the target rate.
///
/// The cpal callback runs on the audio thread; it downmixes, resamples and
/// appends to a shared FIFO that [`InputDevice::read`] drains.
pub struct CpalInput {
    shared: Arc<InputShared>,
    _stream: cpal::Stream,
}

impl CpalInput {
    pub(crate) fn open(device: &cpal::Device, target_rate: u32) -> Result<Self, DeviceError> {
        let supported = device.default_input_config()?;
        let channels = supported.channels();
        let device_rate = supported.sample_rate().0;
        let config: cpal::StreamConfig = supported.into();

        log::debug!(
            "capture: device runs at {device_rate} Hz x{channels}, converting to {target_rate} Hz mono"
        );

        let shared = Arc::new(InputShared {
            fifo: Mutex::new(InputFifo {
                samples: VecDeque::new(),
                failed: None,
            }),
            ready: Condvar::new(),
        });
        let max_backlog = target_rate as usize * MAX_BACKLOG_SECS;

        let data_shared = Arc::clone(&shared);
        let err_shared = Arc::clone(&shared);

        let stream = device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let mono = downmix(data, channels);
                let pcm = f32_to_pcm16(&resample(&mono, device_rate, target_rate));
                let shed = data_shared.lock().append(pcm, max_backlog);
                data_shared.ready.notify_one();
                if shed > 0 {
                    log::warn!("capture: input backlog full, shed {shed} oldest sample(s)");
                }
            },
            move |err: cpal::StreamError| {
                log::error!("cpal input stream error: {err}");
                err_shared.lock().failed = Some(err.to_string());
                err_shared.ready.notify_one();
            },
            None,
        )?;

        stream.play()?;
        Ok(Self {
            shared,
            _stream: stream,
        })
    }
}

impl InputDevice for CpalInput {
    fn read(&mut self, samples: usize, timeout: Duration) -> Result<Option<Vec<i16>>, DeviceError> {
        let fifo = self.shared.lock();
        let (mut fifo, _) = self
            .shared
            .ready
            .wait_timeout_while(fifo, timeout, |f| {
                f.failed.is_none() && f.samples.len() < samples
            })
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(message) = fifo.failed.take() {
            return Err(DeviceError::Stream(message));
        }
        if fifo.samples.len() < samples {
            return Ok(None);
        }
        Ok(Some(fifo.samples.drain(..samples).collect()))
    }
}

// ---------------------------------------------------------------------------
// CaptureSource
// ---------------------------------------------------------------------------

/// Pulls fixed-size chunks from an input device and numbers them.
pub struct CaptureSource {
    device: Box<dyn InputDevice>,
    sample_rate: u32,
    chunk_samples: usize,
    next_seq: u64,
}

impl CaptureSource {
    pub fn new(device: Box<dyn InputDevice>, sample_rate: u32, chunk_samples: usize) -> Self {
        Self {
            device,
            sample_rate,
            chunk_samples,
            next_seq: 0,
        }
    }

    /// Block for up to `timeout` until a full chunk is available.
    ///
    /// `Ok(None)` on timeout, so the caller can poll a stop flag.
    pub fn next_chunk(&mut self, timeout: Duration) -> Result<Option<AudioChunk>, DeviceError> {
        let Some(samples) = self.device.read(self.chunk_samples, timeout)? else {
            return Ok(None);
        };
        if samples.len() != self.chunk_samples {
            return Err(DeviceError::Stream(format!(
                "device returned {} samples, expected {}",
                samples.len(),
                self.chunk_samples
            )));
        }
        let chunk = AudioChunk::from_samples(&samples, self.sample_rate, self.next_seq);
        self.next_seq += 1;
        Ok(Some(chunk))
    }
}

// ---------------------------------------------------------------------------
// CaptureActivity
// ---------------------------------------------------------------------------

/// Everything the capture thread needs to know.
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub spec: InputSpec,
    pub chunk_samples: usize,
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
}

impl CaptureSettings {
    pub fn from_config(config: &AudioConfig) -> Self {
        Self {
            spec: InputSpec {
                device: config.input_device.clone(),
                sample_rate: config.input_sample_rate,
            },
            chunk_samples: config.chunk_samples,
            queue_capacity: config.capture_queue_capacity,
            overflow: config.capture_overflow,
        }
    }
}

/// The capture thread plus the queue it feeds.
pub struct CaptureActivity {
    queue: Arc<ChunkQueue<AudioChunk>>,
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl CaptureActivity {
    /// Open the input device on a new thread and start capturing.
    ///
    /// Blocks until the device is open, so call it from a blocking context.
    /// A device error after startup is reported through `events`.
    pub fn spawn(
        backend: Arc<dyn AudioBackend>,
        settings: CaptureSettings,
        events: mpsc::UnboundedSender<DeviceEvent>,
    ) -> Result<Self, DeviceError> {
        let queue = Arc::new(ChunkQueue::new(settings.queue_capacity));
        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), DeviceError>>();

        let thread = {
            let queue = Arc::clone(&queue);
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("capture".into())
                .spawn(move || {
                    let device = match backend.open_input(&settings.spec) {
                        Ok(device) => {
                            let _ = ready_tx.send(Ok(()));
                            device
                        }
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            queue.close();
                            return;
                        }
                    };
                    let source = CaptureSource::new(
                        device,
                        settings.spec.sample_rate,
                        settings.chunk_samples,
                    );
                    run_capture(source, &queue, &stop, settings.overflow, &events);
                    queue.close();
                    log::debug!("capture: thread exiting");
                })
                .map_err(|_| DeviceError::Spawn(Direction::Input))?
        };

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                queue,
                stop,
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(DeviceError::Spawn(Direction::Input))
            }
        }
    }

    /// Await the next captured chunk; `None` once capture has stopped.
    pub async fn next(&self) -> Option<AudioChunk> {
        self.queue.pop().await
    }

    /// Chunks captured but not yet taken by the coordinator.
    pub fn backlog(&self) -> usize {
        self.queue.len()
    }

    /// Stop the thread promptly (even mid-read or mid-push), discard queued
    /// audio and close the device. Idempotent.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.queue.close();
        let discarded = self.queue.clear();
        if discarded > 0 {
            log::debug!("capture: discarded {discarded} queued chunk(s) on stop");
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("capture: thread panicked");
            }
        }
    }
}

impl Drop for CaptureActivity {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_capture(
    mut source: CaptureSource,
    queue: &ChunkQueue<AudioChunk>,
    stop: &AtomicBool,
    overflow: OverflowPolicy,
    events: &mpsc::UnboundedSender<DeviceEvent>,
) {
    while !stop.load(Ordering::Acquire) {
        let chunk = match source.next_chunk(READ_POLL) {
            Ok(Some(chunk)) => chunk,
            Ok(None) => continue,
            Err(e) => {
                log::error!("capture: {e}");
                let _ = events.send(DeviceEvent::Failed(e));
                return;
            }
        };

        let pushed = match overflow {
            OverflowPolicy::Block => queue.push_blocking(chunk).map(|()| None),
            OverflowPolicy::DropOldest => queue.push_drop_oldest(chunk),
        };
        match pushed {
            Ok(None) => {}
            Ok(Some(evicted)) => {
                log::warn!("capture: queue full, dropped chunk #{}", evicted.frame_seq());
            }
            Err(PushError::Closed(_)) | Err(PushError::Full(_)) => return,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::testing::{scripted_input, MockBackend};
    use std::sync::mpsc as std_mpsc;

    fn settings(capacity: usize, overflow: OverflowPolicy) -> CaptureSettings {
        CaptureSettings {
            spec: InputSpec {
                device: None,
                sample_rate: 16_000,
            },
            chunk_samples: 4,
            queue_capacity: capacity,
            overflow,
        }
    }

    #[test]
    fn input_backlog_sheds_oldest_samples() {
        let mut fifo = InputFifo {
            samples: VecDeque::new(),
            failed: None,
        };
        assert_eq!(fifo.append(vec![1, 2, 3], 4), 0);
        assert_eq!(fifo.append(vec![4, 5, 6], 4), 2);
        assert_eq!(fifo.samples, VecDeque::from(vec![3, 4, 5, 6]));
    }

    #[test]
    fn source_numbers_chunks_sequentially() {
        let (tx, rx) = std_mpsc::channel();
        tx.send(Ok(vec![1, 2, 3, 4])).unwrap();
        tx.send(Ok(vec![5, 6, 7, 8])).unwrap();
        let mut source = CaptureSource::new(scripted_input(rx), 16_000, 4);

        let a = source.next_chunk(READ_POLL).unwrap().unwrap();
        let b = source.next_chunk(READ_POLL).unwrap().unwrap();
        assert_eq!((a.frame_seq(), b.frame_seq()), (0, 1));
        assert_eq!(b.samples(), vec![5, 6, 7, 8]);
        assert_eq!(a.sample_rate(), 16_000);
    }

    #[test]
    fn source_rejects_short_read() {
        let (tx, rx) = std_mpsc::channel();
        tx.send(Ok(vec![1, 2])).unwrap();
        let mut source = CaptureSource::new(scripted_input(rx), 16_000, 4);
        assert!(matches!(
            source.next_chunk(READ_POLL),
            Err(DeviceError::Stream(_))
        ));
    }

    #[test]
    fn source_timeout_yields_none() {
        let (_tx, rx) = std_mpsc::channel();
        let mut source = CaptureSource::new(scripted_input(rx), 16_000, 4);
        assert!(source
            .next_chunk(Duration::from_millis(5))
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn activity_delivers_chunks_in_order() {
        let (backend, tx) = MockBackend::new(24_000);
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let activity =
            CaptureActivity::spawn(backend, settings(8, OverflowPolicy::Block), events_tx)
                .unwrap();

        for i in 0..3 {
            tx.send(Ok(vec![i; 4])).unwrap();
        }
        for expected in 0..3u64 {
            let chunk = activity.next().await.unwrap();
            assert_eq!(chunk.frame_seq(), expected);
        }
    }

    #[tokio::test]
    async fn device_failure_is_reported_and_queue_closes() {
        let (backend, tx) = MockBackend::new(24_000);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let activity =
            CaptureActivity::spawn(backend, settings(8, OverflowPolicy::Block), events_tx)
                .unwrap();

        tx.send(Err("unplugged".into())).unwrap();

        match events_rx.recv().await {
            Some(DeviceEvent::Failed(DeviceError::Stream(msg))) => assert_eq!(msg, "unplugged"),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(activity.next().await.is_none());
    }

    #[test]
    fn open_failure_is_returned_from_spawn() {
        let backend = MockBackend::without_input(24_000);
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let result =
            CaptureActivity::spawn(backend, settings(8, OverflowPolicy::Block), events_tx);
        assert!(matches!(
            result,
            Err(DeviceError::NoDevice(Direction::Input))
        ));
    }

    #[test]
    fn stop_unblocks_a_producer_waiting_on_a_full_queue() {
        let (backend, tx) = MockBackend::new(24_000);
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let mut activity =
            CaptureActivity::spawn(backend, settings(1, OverflowPolicy::Block), events_tx)
                .unwrap();

        // Fill the single slot, then give the thread a second chunk to block on.
        tx.send(Ok(vec![0; 4])).unwrap();
        tx.send(Ok(vec![1; 4])).unwrap();
        std::thread::sleep(Duration::from_millis(50));

        activity.stop();
        assert_eq!(activity.backlog(), 0);
    }

    #[tokio::test]
    async fn drop_oldest_keeps_newest_chunks() {
        let (backend, tx) = MockBackend::new(24_000);
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let activity =
            CaptureActivity::spawn(backend, settings(2, OverflowPolicy::DropOldest), events_tx)
                .unwrap();

        for i in 0..5 {
            tx.send(Ok(vec![i; 4])).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let first = activity.next().await.unwrap().frame_seq();
        let second = activity.next().await.unwrap().frame_seq();
        assert_eq!((first, second), (3, 4));
    }
}
