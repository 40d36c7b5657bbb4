//! Pipeline orchestrator: connects the session, opens the audio devices and
//! drives the turn coordinator until shutdown.
//!
//! # Lifecycle
//!
//! ```text
//! connect (with backoff) ──▶ open capture + playback ──▶ event loop
//!        ▲                                                  │
//!        │     TransportClosed / TransportError / SendError │
//!        └────────── teardown, fresh coordinator ◀──────────┘
//! ```
//!
//! One task runs the event loop, multiplexing with `tokio::select!`:
//!
//! 1. shutdown token
//! 2. device events (drain reports, hardware failures)
//! 3. transport events
//! 4. captured chunks
//! 5. playback queue space, only while model audio is waiting for it
//!
//! Device I/O happens on the capture and playback threads, so the loop never
//! blocks on hardware. Every exit path tears the session down: capture stops
//! first, then the transport closes, then playback is flushed and stopped.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::error::PipelineError;
use crate::audio::{
    AudioBackend, CaptureActivity, CaptureSettings, DeviceError, DeviceEvent, Direction,
    PlaybackSink,
};
use crate::config::AppConfig;
use crate::transport::{Connector, Credentials, Transport, TransportFailure};
use crate::turn::{Directive, ObserverSet, Phase, TurnCoordinator, TurnObserver};

/// How a single session ended without a fatal error.
enum SessionEnd {
    Shutdown,
    Lost(TransportFailure),
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Owns everything one conversation needs.
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use duplex_voice::audio::CpalBackend;
/// use duplex_voice::config::AppConfig;
/// use duplex_voice::pipeline::Orchestrator;
/// use duplex_voice::transport::{codec_for, Credentials, WsConnector};
///
/// # async fn example() -> Result<(), duplex_voice::pipeline::PipelineError> {
/// let config = AppConfig::default();
/// let codec = codec_for(&config.session, config.audio.output_sample_rate);
/// let connector = WsConnector::new(
///     Arc::from(codec),
///     config.session.setup_timeout(),
///     config.session.send_buffer,
/// );
/// let handle = Orchestrator::new(
///     config,
///     Arc::new(connector),
///     Arc::new(CpalBackend),
///     Credentials::anonymous(),
/// )
/// .start();
/// handle.join().await
/// # }
/// ```
pub struct Orchestrator {
    config: AppConfig,
    connector: Arc<dyn Connector>,
    backend: Arc<dyn AudioBackend>,
    credentials: Credentials,
    observers: ObserverSet,
    phase_tx: Arc<watch::Sender<Phase>>,
}

impl Orchestrator {
    pub fn new(
        config: AppConfig,
        connector: Arc<dyn Connector>,
        backend: Arc<dyn AudioBackend>,
        credentials: Credentials,
    ) -> Self {
        let (phase_tx, _) = watch::channel(Phase::Listening);
        let phase_tx = Arc::new(phase_tx);
        let mut observers = ObserverSet::new();
        observers.push(phase_tx.clone());
        Self {
            config,
            connector,
            backend,
            credentials,
            observers,
            phase_tx,
        }
    }

    /// Register an additional observer. Observers are notified in
    /// registration order.
    pub fn with_observer(mut self, observer: Arc<dyn TurnObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Current phase, updated on every transition.
    pub fn phase(&self) -> watch::Receiver<Phase> {
        self.phase_tx.subscribe()
    }

    /// Spawn [`run`](Self::run) on the current tokio runtime.
    pub fn start(self) -> PipelineHandle {
        let shutdown = CancellationToken::new();
        let phase = self.phase();
        let task = tokio::spawn(self.run(shutdown.clone()));
        PipelineHandle {
            shutdown,
            task,
            phase,
        }
    }

    // -----------------------------------------------------------------------
    // Main loop
    // -----------------------------------------------------------------------

    /// Run sessions until `shutdown` is cancelled or a fatal error occurs.
    ///
    /// A lost session is replaced by a new one with a fresh coordinator when
    /// reconnecting is enabled. Device failures are never retried.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), PipelineError> {
        let observer: Arc<dyn TurnObserver> = Arc::new(self.observers.clone());
        let mut generation = 0u64;

        loop {
            let Some(transport) = self.connect_with_backoff(&shutdown).await? else {
                log::info!("pipeline: shutdown requested while connecting");
                return Ok(());
            };

            generation += 1;
            observer.on_session_started(generation);

            match self.run_session(transport, &observer, &shutdown).await? {
                SessionEnd::Shutdown => {
                    log::info!("pipeline: shut down");
                    return Ok(());
                }
                SessionEnd::Lost(failure) => {
                    observer.on_session_lost(&failure);
                    if !self.config.reconnect.enabled {
                        return Err(PipelineError::Transport(failure));
                    }
                    log::warn!("pipeline: session {generation} lost, reconnecting");
                }
            }
        }
    }

    /// `Ok(None)` when shutdown was requested before a connection succeeded.
    async fn connect_with_backoff(
        &self,
        shutdown: &CancellationToken,
    ) -> Result<Option<Box<dyn Transport>>, PipelineError> {
        let policy = &self.config.reconnect;
        let endpoint = self.config.session.endpoint.as_str();
        let mut attempts = 0u32;

        loop {
            let result = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(None),
                result = self.connector.connect(endpoint, &self.credentials) => result,
            };
            attempts += 1;

            let error = match result {
                Ok(transport) => {
                    log::info!("pipeline: connected (attempt {attempts})");
                    return Ok(Some(transport));
                }
                Err(e) => e,
            };

            if !error.is_retryable() || !policy.should_retry(attempts) {
                return Err(PipelineError::Connection {
                    attempts,
                    source: error,
                });
            }

            let delay = policy.delay_for(attempts - 1);
            log::warn!("pipeline: connect attempt {attempts} failed ({error}); retrying in {delay:?}");
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(None),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn run_session(
        &self,
        mut transport: Box<dyn Transport>,
        observer: &Arc<dyn TurnObserver>,
        shutdown: &CancellationToken,
    ) -> Result<SessionEnd, PipelineError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (capture, sink) = match self.open_devices(events_tx).await {
            Ok(devices) => devices,
            Err(e) => {
                transport.close().await;
                return Err(e);
            }
        };

        let coordinator = TurnCoordinator::new(
            &self.config.turn,
            self.config.audio.chunk_duration(),
            Arc::clone(observer),
        );
        let mut session = Session {
            transport,
            capture,
            sink,
            coordinator,
            device_events: events_rx,
        };

        let outcome = session.drive(shutdown).await;
        session.teardown().await;
        outcome
    }

    /// Both activities open their device on their own thread; opening blocks,
    /// so it runs on the blocking pool.
    async fn open_devices(
        &self,
        events: mpsc::UnboundedSender<DeviceEvent>,
    ) -> Result<(CaptureActivity, PlaybackSink), PipelineError> {
        let backend = Arc::clone(&self.backend);
        let settings = CaptureSettings::from_config(&self.config.audio);
        let capture_events = events.clone();
        let capture = tokio::task::spawn_blocking(move || {
            CaptureActivity::spawn(backend, settings, capture_events)
        })
        .await
        .map_err(|e| PipelineError::Internal(format!("capture startup panicked: {e}")))??;

        let backend = Arc::clone(&self.backend);
        let spec = PlaybackSink::spec_from_config(&self.config.audio);
        let capacity = self.config.audio.playback_queue_capacity;
        let sink = tokio::task::spawn_blocking(move || {
            PlaybackSink::spawn(backend, spec, capacity, events)
        })
        .await
        .map_err(|e| PipelineError::Internal(format!("playback startup panicked: {e}")))?;

        match sink {
            Ok(sink) => Ok((capture, sink)),
            Err(e) => {
                let _ = tokio::task::spawn_blocking(move || drop(capture)).await;
                Err(e.into())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One connected session: transport, devices and a fresh coordinator.
struct Session {
    transport: Box<dyn Transport>,
    capture: CaptureActivity,
    sink: PlaybackSink,
    coordinator: TurnCoordinator,
    device_events: mpsc::UnboundedReceiver<DeviceEvent>,
}

impl Session {
    async fn drive(&mut self, shutdown: &CancellationToken) -> Result<SessionEnd, PipelineError> {
        loop {
            let directive = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(SessionEnd::Shutdown),
                Some(event) = self.device_events.recv() => self.on_device_event(event)?,
                event = self.transport.receive() => self.coordinator.on_transport_event(event)?,
                chunk = self.capture.next() => match chunk {
                    Some(chunk) => self.coordinator.on_capture_chunk(chunk)?,
                    None => return Err(DeviceError::Disconnected(Direction::Input).into()),
                },
                _ = self.sink.wait_for_space(),
                    if self.coordinator.has_playable() && !self.sink.has_capacity() => Directive::None,
            };

            // Audio queued by this event precedes any control frame it caused.
            if let Some(end) = self.send_outbound().await {
                return Ok(end);
            }
            if let Some(end) = self.apply(directive).await? {
                return Ok(end);
            }
            if let Some(end) = self.send_outbound().await {
                return Ok(end);
            }
            self.feed_sink();
        }
    }

    fn on_device_event(&mut self, event: DeviceEvent) -> Result<Directive, PipelineError> {
        match event {
            DeviceEvent::PlaybackDrained { last_seq } => {
                self.coordinator.on_playback_drained(last_seq);
                Ok(Directive::None)
            }
            DeviceEvent::Failed(e) => Err(e.into()),
        }
    }

    /// Carry out a coordinator directive. The flush always completes before
    /// the interrupt is acknowledged, so no stale model audio can follow it.
    async fn apply(&mut self, directive: Directive) -> Result<Option<SessionEnd>, PipelineError> {
        match directive {
            Directive::None => {}
            Directive::EndOfTurn => {
                if let Err(e) = self.transport.end_turn().await {
                    return Ok(Some(SessionEnd::Lost(e.into())));
                }
            }
            Directive::BargeIn => {
                let dropped = self.sink.flush();
                log::debug!("pipeline: barge-in flushed {dropped} chunk(s)");
                if let Err(e) = self.transport.interrupt().await {
                    return Ok(Some(SessionEnd::Lost(e.into())));
                }
                self.coordinator.on_interrupt_acknowledged()?;
            }
            Directive::FlushPlayback => {
                let dropped = self.sink.flush();
                log::debug!("pipeline: remote interrupt flushed {dropped} chunk(s)");
                self.coordinator.on_interrupt_acknowledged()?;
            }
            Directive::Teardown(failure) => return Ok(Some(SessionEnd::Lost(failure))),
        }
        Ok(None)
    }

    async fn send_outbound(&mut self) -> Option<SessionEnd> {
        while let Some(chunk) = self.coordinator.take_outbound() {
            if let Err(e) = self.transport.send(chunk).await {
                return Some(SessionEnd::Lost(e.into()));
            }
        }
        None
    }

    /// Hand playable model audio to the sink while it has room.
    fn feed_sink(&mut self) {
        while self.sink.has_capacity() {
            let Some(chunk) = self.coordinator.take_playable() else {
                break;
            };
            if let Err(chunk) = self.sink.enqueue(chunk) {
                log::warn!("pipeline: playback refused model frame #{}", chunk.frame_seq());
                break;
            }
        }
    }

    async fn teardown(self) {
        let Session {
            mut transport,
            capture,
            sink,
            coordinator,
            ..
        } = self;

        let capture_stopped = tokio::task::spawn_blocking(move || drop(capture));
        transport.close().await;
        let unplayed = sink.flush();
        if capture_stopped.await.is_err() {
            log::error!("pipeline: capture shutdown panicked");
        }
        if tokio::task::spawn_blocking(move || drop(sink)).await.is_err() {
            log::error!("pipeline: playback shutdown panicked");
        }
        log::debug!(
            "pipeline: session torn down in {} ({unplayed} chunk(s) unplayed)",
            coordinator.phase()
        );
    }
}

// ---------------------------------------------------------------------------
// PipelineHandle
// ---------------------------------------------------------------------------

/// A running pipeline, returned by [`Orchestrator::start`].
pub struct PipelineHandle {
    shutdown: CancellationToken,
    task: JoinHandle<Result<(), PipelineError>>,
    phase: watch::Receiver<Phase>,
}

impl PipelineHandle {
    pub fn phase(&self) -> watch::Receiver<Phase> {
        self.phase.clone()
    }

    /// Token that stops the pipeline when cancelled, e.g. from a signal
    /// handler.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Request shutdown and wait for teardown to finish.
    pub async fn stop(self) -> Result<(), PipelineError> {
        self.shutdown.cancel();
        self.join().await
    }

    /// Wait for the pipeline to end on its own (or via the shutdown token).
    pub async fn join(self) -> Result<(), PipelineError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(PipelineError::Internal(format!("pipeline task failed: {e}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    use async_trait::async_trait;

    use crate::audio::testing::MockBackend;
    use crate::audio::AudioChunk;
    use crate::transport::{ConnectionError, SendError, TurnEvent};
    use crate::turn::observer::tests::RecordingObserver;

    const WAIT: Duration = Duration::from_secs(5);

    // -----------------------------------------------------------------------
    // Test doubles
    // -----------------------------------------------------------------------

    #[derive(Debug, Clone, PartialEq)]
    enum Sent {
        Audio(u64),
        EndOfTurn,
        Interrupt,
        Closed,
    }

    /// Transport fed by a channel; records everything sent to it.
    struct MockTransport {
        events: mpsc::UnboundedReceiver<TurnEvent>,
        sent: Arc<Mutex<Vec<Sent>>>,
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send(&mut self, chunk: AudioChunk) -> Result<(), SendError> {
            self.sent.lock().unwrap().push(Sent::Audio(chunk.frame_seq()));
            Ok(())
        }

        async fn end_turn(&mut self) -> Result<(), SendError> {
            self.sent.lock().unwrap().push(Sent::EndOfTurn);
            Ok(())
        }

        async fn interrupt(&mut self) -> Result<(), SendError> {
            self.sent.lock().unwrap().push(Sent::Interrupt);
            Ok(())
        }

        async fn receive(&mut self) -> TurnEvent {
            self.events
                .recv()
                .await
                .unwrap_or(TurnEvent::TransportClosed)
        }

        async fn close(&mut self) {
            self.sent.lock().unwrap().push(Sent::Closed);
        }
    }

    /// Test-side end of one scripted session.
    struct Script {
        events: mpsc::UnboundedSender<TurnEvent>,
        sent: Arc<Mutex<Vec<Sent>>>,
    }

    impl Script {
        fn push(&self, event: TurnEvent) {
            self.events.send(event).unwrap();
        }

        fn sent(&self) -> Vec<Sent> {
            self.sent.lock().unwrap().clone()
        }
    }

    /// Hands out the prepared sessions in order, then refuses.
    struct MockConnector {
        sessions: Mutex<VecDeque<MockTransport>>,
        connects: AtomicUsize,
    }

    impl MockConnector {
        fn connects(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        async fn connect(
            &self,
            _endpoint: &str,
            _credentials: &Credentials,
        ) -> Result<Box<dyn Transport>, ConnectionError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            match self.sessions.lock().unwrap().pop_front() {
                Some(transport) => Ok(Box::new(transport)),
                None => Err(ConnectionError::Handshake("connection refused".into())),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn connector(sessions: usize) -> (Arc<MockConnector>, Vec<Script>) {
        let mut transports = VecDeque::new();
        let mut scripts = Vec::new();
        for _ in 0..sessions {
            let (tx, rx) = mpsc::unbounded_channel();
            let sent = Arc::new(Mutex::new(Vec::new()));
            transports.push_back(MockTransport {
                events: rx,
                sent: sent.clone(),
            });
            scripts.push(Script { events: tx, sent });
        }
        let connector = Arc::new(MockConnector {
            sessions: Mutex::new(transports),
            connects: AtomicUsize::new(0),
        });
        (connector, scripts)
    }

    /// 64 ms silence timeout (two chunks) and fast retries.
    fn test_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.turn.silence_timeout_ms = 64;
        config.reconnect.initial_delay_ms = 10;
        config.reconnect.max_delay_ms = 40;
        config.reconnect.max_attempts = 3;
        config
    }

    fn orchestrator(
        config: AppConfig,
        connector: &Arc<MockConnector>,
        backend: &Arc<MockBackend>,
    ) -> (Orchestrator, Arc<RecordingObserver>) {
        let recorder = Arc::new(RecordingObserver::default());
        let orchestrator = Orchestrator::new(
            config,
            connector.clone(),
            backend.clone(),
            Credentials::anonymous(),
        )
        .with_observer(recorder.clone());
        (orchestrator, recorder)
    }

    fn speech() -> Result<Vec<i16>, String> {
        Ok(vec![8_000; 512])
    }

    fn quiet() -> Result<Vec<i16>, String> {
        Ok(vec![0; 512])
    }

    fn model_audio(seq: u64) -> TurnEvent {
        TurnEvent::ModelAudio(AudioChunk::from_samples(&[1_000; 240], 24_000, seq))
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        let deadline = Instant::now() + WAIT;
        while !check() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn wait_for_phase(rx: &mut watch::Receiver<Phase>, phase: Phase) {
        tokio::time::timeout(WAIT, rx.wait_for(|p| *p == phase))
            .await
            .expect("timed out waiting for phase")
            .expect("phase channel closed");
    }

    // -----------------------------------------------------------------------
    // Conversation flow
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn user_turn_then_model_reply_returns_to_listening() {
        let (backend, mic) = MockBackend::new(24_000);
        let (connector, scripts) = connector(1);
        let (orchestrator, recorder) = orchestrator(test_config(), &connector, &backend);
        let handle = orchestrator.start();
        let mut phase = handle.phase();

        mic.send(speech()).unwrap();
        mic.send(quiet()).unwrap();
        mic.send(quiet()).unwrap();
        eventually(|| scripts[0].sent().contains(&Sent::EndOfTurn)).await;
        assert_eq!(
            scripts[0].sent(),
            vec![Sent::Audio(0), Sent::Audio(1), Sent::Audio(2), Sent::EndOfTurn]
        );
        assert_eq!(*phase.borrow(), Phase::AwaitingResponse);

        scripts[0].push(model_audio(0));
        scripts[0].push(TurnEvent::ModelTurnComplete);
        wait_for_phase(&mut phase, Phase::Listening).await;

        assert_eq!(backend.output.written().len(), 240);
        let entries = recorder.entries();
        assert!(entries.contains(&"enter-playing".to_string()));
        assert!(entries.contains(&"turn-complete".to_string()));

        handle.stop().await.unwrap();
        assert_eq!(scripts[0].sent().last(), Some(&Sent::Closed));
    }

    #[tokio::test]
    async fn speech_during_playback_interrupts_once() {
        let (backend, mic) = MockBackend::new(24_000);
        let (connector, scripts) = connector(1);
        let (orchestrator, recorder) = orchestrator(test_config(), &connector, &backend);
        let handle = orchestrator.start();
        let mut phase = handle.phase();

        scripts[0].push(model_audio(0));
        wait_for_phase(&mut phase, Phase::Playing).await;

        mic.send(speech()).unwrap();
        wait_for_phase(&mut phase, Phase::Streaming).await;
        eventually(|| scripts[0].sent().contains(&Sent::Audio(0))).await;

        // The held speech chunk goes out only after the interrupt frame.
        let sent = scripts[0].sent();
        assert_eq!(&sent[..2], &[Sent::Interrupt, Sent::Audio(0)]);
        assert_eq!(sent.iter().filter(|s| **s == Sent::Interrupt).count(), 1);
        assert!(backend.output.clears() >= 1);
        assert!(recorder.entries().contains(&"interrupted:BargeIn".to_string()));

        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn remote_interrupt_flushes_without_sending_interrupt() {
        let (backend, _mic) = MockBackend::new(24_000);
        let (connector, scripts) = connector(1);
        let (orchestrator, recorder) = orchestrator(test_config(), &connector, &backend);
        let handle = orchestrator.start();
        let mut phase = handle.phase();

        scripts[0].push(model_audio(0));
        wait_for_phase(&mut phase, Phase::Playing).await;
        scripts[0].push(TurnEvent::ModelInterrupted);
        wait_for_phase(&mut phase, Phase::Streaming).await;

        assert!(recorder.entries().contains(&"interrupted:Remote".to_string()));
        assert!(!scripts[0].sent().contains(&Sent::Interrupt));
        assert!(backend.output.clears() >= 1);

        handle.stop().await.unwrap();
    }

    // -----------------------------------------------------------------------
    // Session loss and reconnect
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn transport_loss_while_playing_reconnects_with_fresh_state() {
        let (backend, _mic) = MockBackend::new(24_000);
        let (connector, scripts) = connector(2);
        let (orchestrator, recorder) = orchestrator(test_config(), &connector, &backend);
        let handle = orchestrator.start();
        let mut phase = handle.phase();

        scripts[0].push(model_audio(0));
        wait_for_phase(&mut phase, Phase::Playing).await;
        scripts[0].push(TurnEvent::TransportClosed);

        eventually(|| recorder.entries().contains(&"session-started:2".to_string())).await;
        assert_eq!(connector.connects(), 2);
        assert!(recorder
            .entries()
            .contains(&"session-lost:connection closed by remote".to_string()));
        assert_eq!(scripts[0].sent().last(), Some(&Sent::Closed));
        assert!(backend.output.clears() >= 1);
        eventually(|| backend.input_opens.load(Ordering::SeqCst) == 2).await;

        // A fresh coordinator accepts the new session's numbering from zero.
        scripts[1].push(model_audio(0));
        wait_for_phase(&mut phase, Phase::Playing).await;

        handle.stop().await.unwrap();
        assert_eq!(scripts[1].sent().last(), Some(&Sent::Closed));
    }

    #[tokio::test]
    async fn loss_without_reconnect_is_fatal() {
        let (backend, _mic) = MockBackend::new(24_000);
        let (connector, scripts) = connector(2);
        let mut config = test_config();
        config.reconnect.enabled = false;
        let (orchestrator, _) = orchestrator(config, &connector, &backend);

        scripts[0].push(TurnEvent::TransportClosed);
        let err = tokio::time::timeout(WAIT, orchestrator.run(CancellationToken::new()))
            .await
            .unwrap()
            .unwrap_err();

        assert!(matches!(err, PipelineError::Transport(TransportFailure::Closed)));
        assert_eq!(connector.connects(), 1);
    }

    #[tokio::test]
    async fn connect_failures_exhaust_retry_budget() {
        let backend = MockBackend::without_input(24_000);
        let (connector, _) = connector(0);
        let (orchestrator, _) = orchestrator(test_config(), &connector, &backend);

        let err = tokio::time::timeout(WAIT, orchestrator.run(CancellationToken::new()))
            .await
            .unwrap()
            .unwrap_err();

        assert!(matches!(err, PipelineError::Connection { attempts: 3, .. }));
        assert_eq!(connector.connects(), 3);
        assert_eq!(backend.output_opens.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn shutdown_during_backoff_returns_promptly() {
        let backend = MockBackend::without_input(24_000);
        let (connector, _) = connector(0);
        let mut config = test_config();
        config.reconnect.initial_delay_ms = 60_000;
        config.reconnect.max_delay_ms = 60_000;
        let (orchestrator, _) = orchestrator(config, &connector, &backend);
        let handle = orchestrator.start();

        eventually(|| connector.connects() == 1).await;
        tokio::time::timeout(WAIT, handle.stop())
            .await
            .unwrap()
            .unwrap();
    }

    // -----------------------------------------------------------------------
    // Devices
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn missing_input_device_is_fatal_and_closes_transport() {
        let backend = MockBackend::without_input(24_000);
        let (connector, scripts) = connector(1);
        let (orchestrator, _) = orchestrator(test_config(), &connector, &backend);

        let err = orchestrator.run(CancellationToken::new()).await.unwrap_err();

        assert!(matches!(
            err,
            PipelineError::Device(DeviceError::NoDevice(Direction::Input))
        ));
        assert_eq!(scripts[0].sent(), vec![Sent::Closed]);
    }

    #[tokio::test]
    async fn microphone_failure_mid_session_is_fatal() {
        let (backend, mic) = MockBackend::new(24_000);
        let (connector, scripts) = connector(2);
        let (orchestrator, _) = orchestrator(test_config(), &connector, &backend);
        let handle = orchestrator.start();

        mic.send(Err("unplugged".into())).unwrap();
        let err = tokio::time::timeout(WAIT, handle.join())
            .await
            .unwrap()
            .unwrap_err();

        assert!(matches!(err, PipelineError::Device(_)));
        assert_eq!(connector.connects(), 1);
        assert_eq!(scripts[0].sent().last(), Some(&Sent::Closed));
    }

    #[tokio::test]
    async fn stop_tears_down_an_idle_session() {
        let (backend, _mic) = MockBackend::new(24_000);
        let (connector, scripts) = connector(1);
        let (orchestrator, _) = orchestrator(test_config(), &connector, &backend);
        let handle = orchestrator.start();

        eventually(|| backend.output_opens.load(Ordering::SeqCst) == 1).await;
        assert!(!handle.is_finished());
        handle.stop().await.unwrap();

        assert_eq!(scripts[0].sent(), vec![Sent::Closed]);
    }
}
