//! # Dialog Client
//!
//! The constructible client instance that ties the pipeline together: one
//! connection, one capture session, one playback scheduler, one recording
//! accumulator, all owned here, with no module-level singletons. The surrounding
//! UI/session layer talks to this type only.
//!
//! ## Session Lifecycle:
//! 1. **Connect**: `connect_with_retry` dials and initializes the dialog
//!    session, with a bounded, profile-aware retry loop
//! 2. **Converse**: `send_text_query`/`send_tts_text` push text, the remote
//!    service answers with synthesized audio frames
//! 3. **Capture**: `start_capture` streams microphone blocks upstream
//! 4. **Record**: everything played can be accumulated and exported as MP3
//! 5. **Teardown**: any disconnect (local, remote, or error) stops
//!    capture, clears playback, resets the init bookkeeping and emits a
//!    `Disconnected` event, so no layer is left thinking it is connected
//!
//! ## Init bookkeeping:
//! "Initialized" is inferred from the local successful send of the `init`
//! frame; the wire protocol defines no acknowledgment. The WebSocket
//! preserves send order, so holding capture until the init send returns is
//! the strongest ordering available without one.

use crate::audio::codec::{self, AudioFrame};
use crate::audio::playback::{AudioOutput, PlaybackScheduler};
use crate::audio::recorder::{AudioRecorder, RecordingStatus};
use crate::capture::{AudioSource, CaptureSession};
use crate::config::AppConfig;
use crate::connection::{ConnectionManager, ConnectionState, InboundFrame};
use crate::error::{ClientError, ClientResult};
use crate::protocol::{ControlMessage, TtsTextOptions};

use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Lifecycle notifications for the surrounding UI layer.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connected,
    Disconnected,
    CaptureStarted,
    CaptureStopped,
    Error(String),
}

/// Local bookkeeping for the idempotent dialog init.
struct TtsState {
    inited: bool,
    mode: Option<String>,
}

/// The dialog client. Construct one per logical session and pass it by
/// reference to whichever layer needs it.
pub struct DialogClient {
    config: AppConfig,
    session_id: String,
    connection: ConnectionManager,
    capture: CaptureSession,
    playback: PlaybackScheduler,
    recorder: Arc<Mutex<AudioRecorder>>,
    output: Arc<dyn AudioOutput>,
    tts: Arc<Mutex<TtsState>>,
    events_tx: mpsc::UnboundedSender<ClientEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<ClientEvent>>,
    pump: Option<JoinHandle<()>>,
}

impl DialogClient {
    /// Build a client against the given audio output (the speaker binding,
    /// or [`crate::audio::playback::NullOutput`] for headless sessions).
    pub fn new(config: AppConfig, output: Arc<dyn AudioOutput>) -> Self {
        let session_id = Uuid::new_v4().to_string();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let connection = ConnectionManager::new(config.connection.clone());
        let capture = CaptureSession::new(config.audio.capture_block_size);
        let playback = PlaybackScheduler::new(output.clone());
        let recorder = Arc::new(Mutex::new(AudioRecorder::new(
            config.recording.clone(),
            config.audio.output_sample_rate,
        )));

        info!(session_id = %session_id, "Dialog client created");

        Self {
            config,
            session_id,
            connection,
            capture,
            playback,
            recorder,
            output,
            tts: Arc::new(Mutex::new(TtsState {
                inited: false,
                mode: None,
            })),
            events_tx,
            events_rx: Some(events_rx),
            pump: None,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Take the lifecycle event stream. Yields `None` on the second call.
    pub fn events(&mut self) -> Option<mpsc::UnboundedReceiver<ClientEvent>> {
        self.events_rx.take()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.connection.state().await
    }

    /// Dial the service. Any existing transport is force-closed first; the
    /// inbound pump for the new transport starts before this returns. No
    /// retry here; see [`DialogClient::connect_with_retry`].
    pub async fn connect(&mut self) -> ClientResult<()> {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }

        let inbound = self.connection.connect().await?;
        self.pump = Some(tokio::spawn(run_inbound_pump(
            inbound,
            self.playback.clone(),
            self.recorder.clone(),
            self.capture.clone(),
            self.tts.clone(),
            self.events_tx.clone(),
            self.config.audio.output_sample_rate,
        )));

        let _ = self.events_tx.send(ClientEvent::Connected);
        Ok(())
    }

    /// Release everything: capture, playback queue and cursor, transport,
    /// init bookkeeping. Safe from any state, idempotent, never fails.
    pub async fn disconnect(&mut self) {
        let was_open = self.connection.is_open().await;

        self.capture.stop();
        self.playback.stop();
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.connection.disconnect().await;
        reset_tts(&self.tts);

        if was_open {
            let _ = self.events_tx.send(ClientEvent::Disconnected);
        }
    }

    /// Initialize the dialog session, idempotently: already initialized with
    /// the same mode is a no-op; a different mode tears the connection down
    /// and starts over; no connection dials one first.
    pub async fn ensure_init(&mut self, mode: &str) -> ClientResult<()> {
        if self.connection.is_open().await {
            let already = {
                let tts = self.tts.lock().unwrap();
                tts.inited && tts.mode.as_deref() == Some(mode)
            };
            if already {
                return Ok(());
            }
            info!(mode, "Session mode changed, reinitializing");
            self.disconnect().await;
            // Let the old transport finish tearing down before redialing
            tokio::time::sleep(self.config.connection.reconnect_grace()).await;
        }

        if !self.connection.is_open().await {
            self.connect().await?;
        }

        let init = ControlMessage::Init {
            speaker: self.config.session.speaker.clone(),
            mode: mode.to_string(),
        };
        self.connection.send_control(&init).await?;

        {
            let mut tts = self.tts.lock().unwrap();
            tts.inited = true;
            tts.mode = Some(mode.to_string());
        }
        info!(mode, "Dialog session initialized");
        Ok(())
    }

    /// connect + init with the bounded, profile-aware retry loop. The final
    /// attempt's typed error surfaces to the caller.
    pub async fn connect_with_retry(&mut self, mode: &str) -> ClientResult<()> {
        let max_attempts = self.config.connection.max_connect_attempts;
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.ensure_init(mode).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt < max_attempts => {
                    warn!(
                        attempt,
                        max_attempts,
                        "Connect attempt failed, retrying: {}", err
                    );
                    tokio::time::sleep(self.config.connection.retry_delay()).await;
                }
                Err(err) => {
                    error!("All {} connect attempts failed", max_attempts);
                    let _ = self.events_tx.send(ClientEvent::Error(err.to_string()));
                    return Err(err);
                }
            }
        }
    }

    /// Send a conversational text query, ensuring the session is initialized
    /// first (which performs at most one reconnect-and-reinit cycle). Fails
    /// with `TransportUnavailable` if the transport is still not open.
    pub async fn send_text_query(&mut self, text: &str) -> ClientResult<()> {
        let mode = self.config.session.default_mode.clone();
        self.ensure_init(&mode).await?;

        if !self.connection.is_open().await {
            return Err(ClientError::TransportUnavailable(
                "connection lost after init".to_string(),
            ));
        }

        self.connection
            .send_control(&ControlMessage::TextQuery {
                content: text.to_string(),
            })
            .await?;
        info!(chars = text.chars().count(), "Sent text query");
        Ok(())
    }

    /// Push a span of text for the service to synthesize.
    pub async fn send_tts_text(&mut self, text: &str, opts: TtsTextOptions) -> ClientResult<()> {
        let mode = self.config.session.default_mode.clone();
        self.ensure_init(&mode).await?;

        self.connection
            .send_control(&ControlMessage::TtsText {
                start: opts.start,
                end: opts.end,
                is_user_querying: opts.is_user_querying,
                content: text.to_string(),
            })
            .await
    }

    /// Attach a microphone source and start streaming capture blocks. The
    /// audio clock is resumed explicitly first, and the transport must
    /// already be open.
    pub async fn start_capture(&mut self, source: Box<dyn AudioSource>) -> ClientResult<()> {
        if !self.connection.is_open().await {
            return Err(ClientError::TransportUnavailable(
                "connect before capturing".to_string(),
            ));
        }

        self.output.resume()?;
        self.capture.start(source, self.connection.clone())?;
        let _ = self.events_tx.send(ClientEvent::CaptureStarted);
        Ok(())
    }

    /// Detach the capture callback and release the microphone.
    pub fn stop_capture(&mut self) {
        if self.capture.is_active() {
            self.capture.stop();
            let _ = self.events_tx.send(ClientEvent::CaptureStopped);
        }
    }

    pub fn is_capturing(&self) -> bool {
        self.capture.is_active()
    }

    /// Interrupt playback: clear the queue and rebase the cursor to "now".
    /// Used when the user starts speaking over the synthesized voice.
    pub fn stop_playback(&self) {
        self.playback.stop();
    }

    pub fn start_recording(&self) {
        self.recorder.lock().unwrap().start();
    }

    pub fn stop_recording(&self) {
        self.recorder.lock().unwrap().stop();
    }

    /// Export everything recorded so far as one MP3 blob. The buffer is not
    /// cleared, so the same session can be exported again.
    pub fn export_recording(&self) -> ClientResult<Vec<u8>> {
        self.recorder.lock().unwrap().export()
    }

    pub fn reset_recording(&self) {
        self.recorder.lock().unwrap().reset();
    }

    pub fn recording_status(&self) -> RecordingStatus {
        self.recorder.lock().unwrap().status()
    }
}

/// Inbound pump: routes each demultiplexed frame to its sinks, and performs
/// the full synchronous teardown when the transport reports closed.
async fn run_inbound_pump(
    mut inbound: mpsc::UnboundedReceiver<InboundFrame>,
    playback: PlaybackScheduler,
    recorder: Arc<Mutex<AudioRecorder>>,
    capture: CaptureSession,
    tts: Arc<Mutex<TtsState>>,
    events: mpsc::UnboundedSender<ClientEvent>,
    inbound_sample_rate: u32,
) {
    while let Some(frame) = inbound.recv().await {
        match frame {
            InboundFrame::Audio(bytes) => match codec::decode_pcm16le(&bytes) {
                Ok(samples) => {
                    if samples.is_empty() {
                        continue;
                    }
                    // Tap for the recorder before scheduling playback, so an
                    // interrupted playback still leaves the audio recorded
                    recorder
                        .lock()
                        .unwrap()
                        .add_pcm(&samples, inbound_sample_rate);
                    playback.enqueue(AudioFrame::new(samples, inbound_sample_rate));
                }
                Err(err) => {
                    // One malformed frame must not silence the session
                    warn!("Skipping malformed audio frame: {}", err);
                }
            },
            InboundFrame::Control(msg) => {
                // The wire protocol defines no server-initiated control
                // frames today; surface them for diagnosis
                debug!(?msg, "Inbound control frame");
            }
            InboundFrame::Closed(reason) => {
                info!(?reason, "Transport closed, tearing down session state");
                capture.stop();
                playback.stop();
                reset_tts(&tts);
                let _ = events.send(ClientEvent::Disconnected);
                break;
            }
        }
    }
}

fn reset_tts(tts: &Arc<Mutex<TtsState>>) {
    let mut tts = tts.lock().unwrap();
    tts.inited = false;
    tts.mode = None;
}
