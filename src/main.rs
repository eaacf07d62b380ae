//! # Voice Dialog Client - Command-Line Driver
//!
//! Runs one spoken dialog session from the command line:
//!
//! 1. **Loads configuration** from config.toml and environment variables
//! 2. **Sets up logging** for debugging and monitoring
//! 3. **Connects** to the dialog service with the bounded retry loop
//! 4. **Starts capture** (with the `device` feature) and sends the opening
//!    text query from the first command-line argument
//! 5. **Runs** until Ctrl+C or the service closes the session
//! 6. **Exports** everything heard as a timestamped MP3 file
//!
//! Without the `device` feature the session is headless: no microphone and
//! no speaker, but the connection, playback scheduling and recording paths
//! all run, so the exported MP3 still contains the service's replies.

use anyhow::Result;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use voice_dialog_client::audio::playback::AudioOutput;
use voice_dialog_client::client::{ClientEvent, DialogClient};
use voice_dialog_client::config::AppConfig;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file (if it exists)
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voice-dialog-client v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Dialog endpoint: {} ({} profile)",
        config.connection.url, config.connection.profile
    );

    // The opening query; defaults to a greeting when none is given
    let query = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "你好".to_string());

    let output = build_output(&config);
    let mut client = DialogClient::new(config.clone(), output);
    let mut events = client
        .events()
        .expect("event stream is taken exactly once");

    // Record the whole session, then connect+init with bounded retry
    client.start_recording();
    client.connect_with_retry(&config.session.default_mode).await?;

    #[cfg(feature = "device")]
    {
        let mic = voice_dialog_client::device::MicrophoneSource::new(config.audio.input_sample_rate);
        if let Err(err) = client.start_capture(Box::new(mic)).await {
            // A missing microphone still allows a text-driven session
            tracing::warn!("Continuing without microphone capture: {}", err);
        }
    }

    client.send_text_query(&query).await?;
    info!("Session running; press Ctrl+C to finish");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
            event = events.recv() => {
                match event {
                    Some(ClientEvent::Disconnected) => {
                        info!("Service closed the session");
                        break;
                    }
                    Some(event) => info!(?event, "Client event"),
                    None => break,
                }
            }
        }
    }

    client.stop_capture();
    client.stop_recording();

    match client.export_recording() {
        Ok(mp3) => {
            let filename = format!(
                "session-{}.mp3",
                chrono::Local::now().format("%Y%m%d-%H%M%S")
            );
            std::fs::write(&filename, &mp3)?;
            info!(file = %filename, bytes = mp3.len(), "Session audio exported");
        }
        Err(err) => {
            // Surfaced only here, on the explicit export request
            error!("Could not export session audio: {}", err);
        }
    }

    client.disconnect().await;
    info!("Client stopped gracefully");
    Ok(())
}

/// Initialize the tracing (logging) system for the application.
///
/// ## Environment Variables:
/// - `RUST_LOG`: controls what gets logged (e.g. "debug",
///   "voice_dialog_client=debug")
/// - If not set, defaults to "voice_dialog_client=debug"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_dialog_client=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// The speaker when the `device` feature is on, otherwise the headless
/// wall-clock output (frames are timed and recorded, just not heard).
#[cfg(feature = "device")]
fn build_output(config: &AppConfig) -> Arc<dyn AudioOutput> {
    Arc::new(voice_dialog_client::device::SpeakerOutput::new(
        config.audio.output_sample_rate,
    ))
}

#[cfg(not(feature = "device"))]
fn build_output(_config: &AppConfig) -> Arc<dyn AudioOutput> {
    info!("Built without the device feature: running headless playback");
    Arc::new(voice_dialog_client::audio::playback::NullOutput::new())
}
