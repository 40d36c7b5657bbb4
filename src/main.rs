//! Application entry point: a duplex voice conversation with a realtime
//! model.
//!
//! # Startup sequence
//!
//! 1. Initialise logging.
//! 2. Load [`AppConfig`] from the path given as the first argument, or from
//!    the platform config directory (defaults on first run).
//! 3. Resolve credentials for the configured protocol.
//! 4. Create the [`tokio`] runtime.
//! 5. Start the [`Orchestrator`] and run until Ctrl-C or a fatal error.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use duplex_voice::{
    audio::CpalBackend,
    config::{AppConfig, WireProtocol},
    pipeline::Orchestrator,
    transport::{codec_for, ConnectionError, Credentials, WsConnector},
    turn::LogObserver,
};

fn load_config() -> anyhow::Result<AppConfig> {
    match std::env::args_os().nth(1).map(PathBuf::from) {
        Some(path) => AppConfig::load_from(&path),
        None => AppConfig::load().or_else(|e| {
            log::warn!("Failed to load config ({e:#}); using defaults");
            Ok(AppConfig::default())
        }),
    }
}

fn credentials(config: &AppConfig) -> Result<Credentials, ConnectionError> {
    match config.session.resolve_api_key() {
        Some(key) => Ok(Credentials::new(key, config.session.auth)),
        None if config.session.protocol == WireProtocol::GeminiLive => Err(
            ConnectionError::MissingCredentials(config.session.api_key_env.clone()),
        ),
        None => Ok(Credentials::anonymous()),
    }
}

fn main() -> anyhow::Result<()> {
    // 1. Logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    log::info!("duplex-voice starting up");

    // 2. Configuration
    let config = load_config()?;
    log::info!(
        "protocol {:?}, model {}, chunk {:?}",
        config.session.protocol,
        config.session.model,
        config.audio.chunk_duration()
    );

    // 3. Credentials
    let credentials = credentials(&config)?;

    // 4. Tokio runtime (device I/O runs on its own threads)
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    // 5. Pipeline
    rt.block_on(async move {
        let codec = codec_for(&config.session, config.audio.output_sample_rate);
        let connector = WsConnector::new(
            Arc::from(codec),
            config.session.setup_timeout(),
            config.session.send_buffer,
        );
        let handle = Orchestrator::new(config, Arc::new(connector), Arc::new(CpalBackend), credentials)
            .with_observer(Arc::new(LogObserver))
            .start();

        let shutdown = handle.shutdown_token();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::info!("Ctrl-C received, shutting down");
                shutdown.cancel();
            }
        });

        handle.join().await
    })?;

    log::info!("duplex-voice exited cleanly");
    Ok(())
}
