//! WebSocket session transport.
//!
//! ```text
//!            ┌────────── WsSession ───────────┐
//! send() ──▶ │ codec.encode ─▶ mpsc ─▶ writer task ──▶ SplitSink  ──▶ server
//! receive() ◀│ TurnEvent ◀─ codec.decode ◀──────────── SplitStream ◀── server
//!            └────────────────────────────────┘
//! ```
//!
//! The two directions are independent: a full send buffer suspends `send`
//! without stalling `receive`, and vice versa. The session does no turn
//! logic.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::codec::{FrameCodec, InboundFrame, OutboundFrame};
use super::{ConnectionError, SendError, TransportErrorKind, TurnEvent};
use crate::audio::AudioChunk;
use crate::config::AuthPlacement;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long `close` waits for the writer to flush the close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// Opaque secret presented when connecting.
#[derive(Clone)]
pub struct Credentials {
    secret: Option<String>,
    placement: AuthPlacement,
}

impl Credentials {
    pub fn new(secret: impl Into<String>, placement: AuthPlacement) -> Self {
        Self {
            secret: Some(secret.into()),
            placement,
        }
    }

    /// For endpoints that need no authentication.
    pub fn anonymous() -> Self {
        Self {
            secret: None,
            placement: AuthPlacement::Query,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.secret.is_none()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("placement", &self.placement)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Transport / Connector
// ---------------------------------------------------------------------------

/// One live connection to the remote model.
#[async_trait]
pub trait Transport: Send {
    /// Queue `chunk` for transmission; suspends while the send buffer is full.
    async fn send(&mut self, chunk: AudioChunk) -> Result<(), SendError>;

    /// Tell the model the user has stopped talking.
    async fn end_turn(&mut self) -> Result<(), SendError>;

    /// Best-effort request that the model abandon its current response.
    async fn interrupt(&mut self) -> Result<(), SendError>;

    /// Next inbound event. Cancel-safe. Once the connection is gone every
    /// call yields [`TurnEvent::TransportClosed`].
    async fn receive(&mut self) -> TurnEvent;

    /// Close the connection. Idempotent.
    async fn close(&mut self);
}

/// Opens [`Transport`]s.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        endpoint: &str,
        credentials: &Credentials,
    ) -> Result<Box<dyn Transport>, ConnectionError>;
}

// ---------------------------------------------------------------------------
// WsConnector
// ---------------------------------------------------------------------------

/// Connects over `tokio-tungstenite` and performs the codec's setup handshake.
pub struct WsConnector {
    codec: Arc<dyn FrameCodec>,
    setup_timeout: Duration,
    send_buffer: usize,
}

impl WsConnector {
    pub fn new(codec: Arc<dyn FrameCodec>, setup_timeout: Duration, send_buffer: usize) -> Self {
        Self {
            codec,
            setup_timeout,
            send_buffer: send_buffer.max(1),
        }
    }

    async fn await_setup_ack(
        &self,
        stream: &mut SplitStream<WsStream>,
    ) -> Result<(), ConnectionError> {
        while let Some(msg) = stream.next().await {
            let msg = msg.map_err(|e| ConnectionError::Handshake(e.to_string()))?;
            let data = match msg {
                Message::Text(text) => text.as_bytes().to_vec(),
                Message::Binary(data) => data.to_vec(),
                Message::Close(frame) => {
                    let reason = frame
                        .map(|f| f.reason.to_string())
                        .unwrap_or_else(|| "no reason given".into());
                    return Err(ConnectionError::SetupRejected(format!(
                        "connection closed: {reason}"
                    )));
                }
                _ => continue,
            };
            let frames = self
                .codec
                .decode(&data)
                .map_err(|e| ConnectionError::SetupRejected(e.to_string()))?;
            for frame in frames {
                match frame {
                    InboundFrame::SetupComplete => return Ok(()),
                    InboundFrame::Error(message) => {
                        return Err(ConnectionError::SetupRejected(message))
                    }
                    other => log::debug!("transport: ignoring {other:?} before setup ack"),
                }
            }
        }
        Err(ConnectionError::Handshake(
            "connection closed during setup".into(),
        ))
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(
        &self,
        endpoint: &str,
        credentials: &Credentials,
    ) -> Result<Box<dyn Transport>, ConnectionError> {
        let request = build_request(endpoint, credentials)?;
        let (ws, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| ConnectionError::Handshake(e.to_string()))?;
        log::info!("transport: connected to {}", redact_query(endpoint));

        let (mut sink, mut stream) = ws.split();

        let setup = self
            .codec
            .setup_message()
            .map_err(|e| ConnectionError::Handshake(e.to_string()))?;
        if let Some(setup) = setup {
            sink.send(Message::Text(setup.into()))
                .await
                .map_err(|e| ConnectionError::Handshake(e.to_string()))?;
            tokio::time::timeout(self.setup_timeout, self.await_setup_ack(&mut stream))
                .await
                .map_err(|_| ConnectionError::SetupTimeout(self.setup_timeout))??;
            log::info!("transport: setup acknowledged");
        }

        Ok(Box::new(WsSession::start(
            sink,
            stream,
            Arc::clone(&self.codec),
            self.send_buffer,
        )))
    }
}

fn build_request(endpoint: &str, credentials: &Credentials) -> Result<Request, ConnectionError> {
    let url = match (&credentials.secret, credentials.placement) {
        (Some(secret), AuthPlacement::Query) => {
            let sep = if endpoint.contains('?') { '&' } else { '?' };
            format!("{endpoint}{sep}key={secret}")
        }
        _ => endpoint.to_string(),
    };

    let mut request = url
        .into_client_request()
        .map_err(|e| ConnectionError::InvalidEndpoint(e.to_string()))?;

    if let (Some(secret), AuthPlacement::Bearer) = (&credentials.secret, credentials.placement) {
        let value = HeaderValue::from_str(&format!("Bearer {secret}"))
            .map_err(|_| ConnectionError::InvalidCredentials)?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }
    Ok(request)
}

/// Endpoint without its query string, for logs.
fn redact_query(endpoint: &str) -> &str {
    endpoint.split('?').next().unwrap_or(endpoint)
}

// ---------------------------------------------------------------------------
// WsSession
// ---------------------------------------------------------------------------

/// A connected WebSocket session.
pub struct WsSession {
    outbound: Option<mpsc::Sender<Message>>,
    inbound: SplitStream<WsStream>,
    writer: Option<JoinHandle<()>>,
    codec: Arc<dyn FrameCodec>,
    pending: VecDeque<TurnEvent>,
    next_seq: u64,
    closed: bool,
}

impl WsSession {
    fn start(
        sink: SplitSink<WsStream, Message>,
        inbound: SplitStream<WsStream>,
        codec: Arc<dyn FrameCodec>,
        send_buffer: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(send_buffer);
        let writer = tokio::spawn(run_writer(sink, rx));
        Self {
            outbound: Some(tx),
            inbound,
            writer: Some(writer),
            codec,
            pending: VecDeque::new(),
            next_seq: 0,
            closed: false,
        }
    }

    async fn send_frame(&mut self, frame: OutboundFrame<'_>) -> Result<(), SendError> {
        let outbound = match &self.outbound {
            Some(tx) if !self.closed => tx,
            _ => return Err(SendError::Closing),
        };
        let Some(text) = self
            .codec
            .encode(frame)
            .map_err(|e| SendError::Encode(e.to_string()))?
        else {
            log::trace!("transport: {frame:?} has no wire form, nothing sent");
            return Ok(());
        };
        outbound
            .send(Message::Text(text.into()))
            .await
            .map_err(|_| SendError::Closing)
    }

    fn enqueue_decoded(&mut self, data: &[u8]) {
        let frames = match self.codec.decode(data) {
            Ok(frames) => frames,
            Err(e) => {
                log::warn!("transport: {e}");
                self.pending
                    .push_back(TurnEvent::TransportError(TransportErrorKind::Decode(
                        e.to_string(),
                    )));
                return;
            }
        };
        for frame in frames {
            let event = match frame {
                InboundFrame::Audio {
                    payload,
                    sample_rate,
                } => {
                    let chunk = AudioChunk::new(payload, sample_rate, self.next_seq);
                    self.next_seq += 1;
                    TurnEvent::ModelAudio(chunk)
                }
                InboundFrame::TurnComplete => TurnEvent::ModelTurnComplete,
                InboundFrame::Interrupted => TurnEvent::ModelInterrupted,
                InboundFrame::Error(message) => {
                    TurnEvent::TransportError(TransportErrorKind::Remote(message))
                }
                InboundFrame::SetupComplete => continue,
            };
            self.pending.push_back(event);
        }
    }
}

#[async_trait]
impl Transport for WsSession {
    async fn send(&mut self, chunk: AudioChunk) -> Result<(), SendError> {
        log::trace!("transport: -> audio #{}", chunk.frame_seq());
        self.send_frame(OutboundFrame::Audio(&chunk)).await
    }

    async fn end_turn(&mut self) -> Result<(), SendError> {
        log::debug!("transport: -> end-of-turn");
        self.send_frame(OutboundFrame::EndOfTurn).await
    }

    async fn interrupt(&mut self) -> Result<(), SendError> {
        log::debug!("transport: -> interrupt");
        self.send_frame(OutboundFrame::Interrupt).await
    }

    async fn receive(&mut self) -> TurnEvent {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return event;
            }
            if self.closed {
                return TurnEvent::TransportClosed;
            }
            match self.inbound.next().await {
                Some(Ok(Message::Text(text))) => self.enqueue_decoded(text.as_bytes()),
                Some(Ok(Message::Binary(data))) => self.enqueue_decoded(&data),
                Some(Ok(Message::Close(frame))) => {
                    log::info!("transport: server closed the connection: {frame:?}");
                    self.closed = true;
                }
                // tungstenite queues the pong reply itself.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::error!("transport: read failed: {e}");
                    self.closed = true;
                    return TurnEvent::TransportError(TransportErrorKind::Io(e.to_string()));
                }
                None => {
                    log::info!("transport: stream ended");
                    self.closed = true;
                }
            }
        }
    }

    async fn close(&mut self) {
        self.closed = true;
        self.pending.clear();
        if let Some(tx) = self.outbound.take() {
            let _ = tx.send(Message::Close(None)).await;
        }
        if let Some(mut writer) = self.writer.take() {
            if tokio::time::timeout(CLOSE_GRACE, &mut writer).await.is_err() {
                writer.abort();
            }
        }
    }
}

impl Drop for WsSession {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
    }
}

async fn run_writer(mut sink: SplitSink<WsStream, Message>, mut rx: mpsc::Receiver<Message>) {
    while let Some(msg) = rx.recv().await {
        let closing = matches!(msg, Message::Close(_));
        if let Err(e) = sink.send(msg).await {
            log::error!("transport: write failed: {e}");
            return;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
    log::debug!("transport: writer exiting");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
