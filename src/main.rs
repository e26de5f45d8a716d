//! # Soundscape Voice - Main Application Entry Point
//!
//! Command-line client that opens a live voice session with the remote agent
//! using the default microphone and speakers.
//!
//! ## Commands:
//! - `soundscape-voice` / `soundscape-voice run`: start a session, stop with Ctrl+C
//! - `soundscape-voice print-config`: show the effective configuration (API key masked)
//! - `soundscape-voice list-devices`: list audio inputs and outputs

use anyhow::Result;
use async_trait::async_trait;
use soundscape_voice::audio::device::{AudioDeviceManager, CpalBackend, DeviceDirection};
use soundscape_voice::config::AppConfig;
use soundscape_voice::session::events::{DisplayInfo, SessionEvent, SessionObserver};
use soundscape_voice::session::state::ConnectionState;
use soundscape_voice::session::transport::WebSocketTransport;
use soundscape_voice::session::SessionConnection;
use soundscape_voice::tools::ToolDispatcher;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, trace, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Global shutdown signal, set once SIGINT or SIGTERM arrives.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file (if it exists)
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    let command = std::env::args().nth(1).unwrap_or_else(|| "run".to_string());
    match command.as_str() {
        "run" => run_session(config).await,
        "print-config" => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
        "list-devices" => list_devices(),
        other => Err(anyhow::anyhow!(
            "Unknown command '{}'. Expected run, print-config or list-devices",
            other
        )),
    }
}

/// Connect, keep the session running until a signal or a remote close, then disconnect.
async fn run_session(config: AppConfig) -> Result<()> {
    info!("Starting soundscape-voice v{}", env!("CARGO_PKG_VERSION"));
    info!(
        model = %config.session.model,
        city = %config.location.city,
        "Configuration loaded"
    );

    let dispatcher = Arc::new(ToolDispatcher::from_config(&config)?);
    let transport = Arc::new(WebSocketTransport::new(&config.session));
    let session = SessionConnection::new(config, Arc::new(CpalBackend), transport, dispatcher);

    let observer = session.bus().attach(Arc::new(LoggingObserver));
    let mut events = session.subscribe();

    setup_signal_handlers();

    if let Err(e) = session.connect().await {
        error!("Could not start session: {}", e);
        session.disconnect();
        observer.abort();
        return Err(e.into());
    }

    info!("Session live. Press Ctrl+C to stop.");

    // Whichever comes first: the user stops us, or the session ends on its own
    tokio::select! {
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, ending session...");
        }
        _ = session_ended(&mut events) => {
            warn!("Session ended by the remote side");
        }
    }

    session.disconnect();
    observer.abort();
    info!("Session stopped gracefully");
    Ok(())
}

/// Print every input and output device, marking the defaults.
fn list_devices() -> Result<()> {
    for device in AudioDeviceManager::list_devices()? {
        let direction = match device.direction {
            DeviceDirection::Input => "input ",
            DeviceDirection::Output => "output",
        };
        let marker = if device.is_default { " (default)" } else { "" };
        println!("{}  {}{}", direction, device.name, marker);
    }
    Ok(())
}

/// Resolve once the session stops being live.
async fn session_ended(events: &mut broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::ConnectionChanged(false)) => return,
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

/// Writes session notifications to the log.
struct LoggingObserver;

#[async_trait]
impl SessionObserver for LoggingObserver {
    async fn on_display(&self, info: DisplayInfo) {
        match serde_json::to_string(&info) {
            Ok(json) => info!(display = %json, "Display update"),
            Err(e) => warn!("Could not render display update: {}", e),
        }
    }

    async fn on_state_changed(&self, state: ConnectionState) {
        info!(state = state.as_str(), "Connection state");
    }

    async fn on_error(&self, message: String) {
        error!("{}", message);
    }

    async fn on_volume(&self, level: f64) {
        trace!(level, "Input level");
    }
}

/// Initialize the tracing (logging) system for the application.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "debug", "soundscape_voice=trace")
/// - If not set, defaults to "soundscape_voice=debug,tokio_tungstenite=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "soundscape_voice=debug,tokio_tungstenite=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Set the shutdown flag on Ctrl+C, or SIGTERM on Unix.
fn setup_signal_handlers() {
    tokio::spawn(async {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = sigterm.recv() => info!("Received SIGTERM"),
                        result = tokio::signal::ctrl_c() => log_ctrl_c(result),
                    }
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    log_ctrl_c(tokio::signal::ctrl_c().await);
                }
            }
        }

        #[cfg(not(unix))]
        log_ctrl_c(tokio::signal::ctrl_c().await);

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

fn log_ctrl_c(result: std::io::Result<()>) {
    match result {
        Ok(()) => info!("Received SIGINT"),
        Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
    }
}

/// Wait for the shutdown signal to be set.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
