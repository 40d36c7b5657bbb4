//! Application settings structs, defaults and TOML persistence.
//!
//! All structs implement `Serialize`, `Deserialize`, `Default` and `Clone`
//! so they can be round-tripped through TOML files. Every field has a
//! default, so a partial `settings.toml` only needs the keys it changes.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::AppPaths;
use crate::audio::{INPUT_CHUNK_SAMPLES, INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE};

// ---------------------------------------------------------------------------
// WireProtocol / AuthPlacement
// ---------------------------------------------------------------------------

/// Message format spoken on the WebSocket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WireProtocol {
    /// Gemini Live `BidiGenerateContent` JSON messages.
    #[default]
    GeminiLive,
    /// Minimal `{"type": "audio" | "interrupt" | ...}` frames.
    Tagged,
}

/// Where the API key goes on the connect request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthPlacement {
    /// `?key=<secret>` appended to the endpoint URL.
    #[default]
    Query,
    /// `Authorization: Bearer <secret>` header.
    Bearer,
}

// ---------------------------------------------------------------------------
// SessionConfig
// ---------------------------------------------------------------------------

/// Remote model connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub protocol: WireProtocol,
    /// `ws://` or `wss://` URL of the streaming endpoint.
    pub endpoint: String,
    /// Model name sent in the setup message (without the `models/` prefix).
    pub model: String,
    /// API key. When `None`, the variable named by `api_key_env` is read.
    pub api_key: Option<String>,
    pub api_key_env: String,
    pub auth: AuthPlacement,
    /// System instructions sent with the setup message.
    pub instructions: Option<String>,
    /// How long to wait for the server to acknowledge setup.
    pub setup_timeout_ms: u64,
    /// Outbound frames buffered ahead of the socket writer.
    pub send_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            protocol: WireProtocol::default(),
            endpoint: "wss://generativelanguage.googleapis.com/ws/\
                       google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent"
                .into(),
            model: "gemini-2.0-flash-exp".into(),
            api_key: None,
            api_key_env: "GEMINI_API_KEY".into(),
            auth: AuthPlacement::default(),
            instructions: None,
            setup_timeout_ms: 10_000,
            send_buffer: 32,
        }
    }
}

impl SessionConfig {
    pub fn setup_timeout(&self) -> Duration {
        Duration::from_millis(self.setup_timeout_ms)
    }

    /// The configured key, or the environment variable's value.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.is_empty())
            .or_else(|| std::env::var(&self.api_key_env).ok())
            .filter(|k| !k.is_empty())
    }
}

// ---------------------------------------------------------------------------
// AudioConfig
// ---------------------------------------------------------------------------

/// What the capture activity does when its queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Wait for room; adds latency but never loses speech.
    #[default]
    Block,
    /// Evict the oldest queued chunk.
    DropOldest,
}

/// Device and queue settings for capture and playback.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Rate of microphone chunks sent upstream (Hz).
    pub input_sample_rate: u32,
    /// Samples per microphone chunk.
    pub chunk_samples: usize,
    /// Rate assumed for model audio that does not declare one (Hz).
    pub output_sample_rate: u32,
    /// Input device name; `None` means the system default.
    pub input_device: Option<String>,
    /// Output device name; `None` means the system default.
    pub output_device: Option<String>,
    pub capture_queue_capacity: usize,
    pub capture_overflow: OverflowPolicy,
    pub playback_queue_capacity: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: INPUT_SAMPLE_RATE,
            chunk_samples: INPUT_CHUNK_SAMPLES,
            output_sample_rate: OUTPUT_SAMPLE_RATE,
            input_device: None,
            output_device: None,
            capture_queue_capacity: 8,
            capture_overflow: OverflowPolicy::default(),
            playback_queue_capacity: 64,
        }
    }
}

impl AudioConfig {
    /// Duration of one capture chunk, at least 1 ms.
    pub fn chunk_duration(&self) -> Duration {
        let ms = (self.chunk_samples as u64 * 1000) / u64::from(self.input_sample_rate.max(1));
        Duration::from_millis(ms.max(1))
    }
}

// ---------------------------------------------------------------------------
// TurnConfig
// ---------------------------------------------------------------------------

/// Turn-taking thresholds and coordinator queue sizes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnConfig {
    /// RMS level (0.0 – 1.0) above which a capture chunk counts as speech.
    pub vad_threshold: f32,
    /// Continuous silence that ends a user turn.
    pub silence_timeout_ms: u64,
    /// Consecutive speech chunks during playback that trigger barge-in.
    pub barge_in_chunks: usize,
    /// Model audio held by the coordinator before the sink takes it.
    pub inbound_capacity: usize,
    /// Microphone audio held by the coordinator before the transport takes it.
    pub outbound_capacity: usize,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            vad_threshold: 0.02,
            silence_timeout_ms: 800,
            barge_in_chunks: 1,
            inbound_capacity: 256,
            outbound_capacity: 64,
        }
    }
}

// ---------------------------------------------------------------------------
// ReconnectConfig
// ---------------------------------------------------------------------------

/// Bounded exponential backoff between connection attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// When `false`, a lost session ends the pipeline.
    pub enabled: bool,
    /// Attempts per (re)connect cycle; `0` retries forever.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 5,
            initial_delay_ms: 500,
            max_delay_ms: 15_000,
            multiplier: 2.0,
        }
    }
}

impl ReconnectConfig {
    /// Delay before retry number `attempt` (0-based), capped at `max_delay_ms`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay = self.initial_delay_ms as f64 * self.multiplier.max(1.0).powi(exp);
        let capped = delay.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    /// Whether another attempt is allowed after `attempts` failures.
    pub fn should_retry(&self, attempts: u32) -> bool {
        self.max_attempts == 0 || attempts < self.max_attempts
    }
}

// ---------------------------------------------------------------------------
// AppConfig  (top-level)
// ---------------------------------------------------------------------------

/// Top-level application configuration, serialised as `settings.toml`.
///
/// # Persistence
///
/// ```rust,no_run
/// use duplex_voice::config::AppConfig;
///
/// // Load (returns Default when file is missing)
/// let config = AppConfig::load().unwrap();
///
/// // Modify and save
/// // config.save().unwrap();
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub session: SessionConfig,
    pub audio: AudioConfig,
    pub turn: TurnConfig,
    pub reconnect: ReconnectConfig,
}

impl AppConfig {
    /// Load configuration from the platform-appropriate `settings.toml`.
    ///
    /// Returns `Ok(AppConfig::default())` when the file does not exist yet.
    pub fn load() -> Result<Self> {
        Self::load_from(&AppPaths::new().settings_file)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self =
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the platform-appropriate `settings.toml`,
    /// creating parent directories as needed.
    pub fn save(&self) -> Result<()> {
        self.save_to(&AppPaths::new().settings_file)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("audio.chunk_samples", self.audio.chunk_samples),
            ("audio.capture_queue_capacity", self.audio.capture_queue_capacity),
            ("audio.playback_queue_capacity", self.audio.playback_queue_capacity),
            ("turn.barge_in_chunks", self.turn.barge_in_chunks),
            ("turn.inbound_capacity", self.turn.inbound_capacity),
            ("turn.outbound_capacity", self.turn.outbound_capacity),
            ("session.send_buffer", self.session.send_buffer),
        ];
        for (key, value) in nonzero {
            anyhow::ensure!(value > 0, "{key} must be greater than zero");
        }
        anyhow::ensure!(
            self.audio.input_sample_rate > 0 && self.audio.output_sample_rate > 0,
            "audio sample rates must be greater than zero"
        );
        anyhow::ensure!(
            self.turn.barge_in_chunks <= self.turn.outbound_capacity,
            "turn.barge_in_chunks must not exceed turn.outbound_capacity"
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.turn.vad_threshold),
            "turn.vad_threshold must be within 0.0 and 1.0"
        );
        anyhow::ensure!(
            self.session.endpoint.starts_with("ws://") || self.session.endpoint.starts_with("wss://"),
            "session.endpoint must be a ws:// or wss:// URL"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
