//! # Capture Session
//!
//! Pulls microphone samples in fixed-size blocks, converts them to PCM16LE
//! through the codec, and pushes each block to the Connection Manager the
//! moment it is ready; capture never buffers beyond the block in hand.
//!
//! ## The source abstraction:
//! Microphone acquisition is a collaborator reached through the
//! [`AudioSource`] trait. Acquisition is permission-gated and can fail
//! (`PermissionDenied`, `DeviceUnavailable`); on failure the session is left
//! in the not-started state. A started source delivers complete sample
//! blocks of the configured size on a channel, which maps the original
//! fixed-cadence sampling callback onto the async runtime.

use crate::audio::codec;
use crate::connection::ConnectionManager;
use crate::error::ClientResult;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A live, permission-gated audio input.
///
/// `start` acquires the device and returns the block stream; each delivered
/// `Vec<f32>` is one complete capture block of `block_size` samples in
/// [-1.0, 1.0]. `stop` releases the device; dropping a stopped source must
/// be inert.
pub trait AudioSource: Send {
    /// Capture sample rate in Hz (16 kHz on this wire).
    fn sample_rate(&self) -> u32;

    /// Acquire the device and begin delivering blocks.
    fn start(&mut self, block_size: usize) -> ClientResult<mpsc::UnboundedReceiver<Vec<f32>>>;

    /// Release the device. Idempotent.
    fn stop(&mut self);
}

struct CaptureInner {
    task: Option<JoinHandle<()>>,
    source: Option<Box<dyn AudioSource>>,
    active: bool,
}

/// The capture session. Cheap to clone; clones share the one block loop, so
/// the inbound pump can stop capture when the transport dies.
#[derive(Clone)]
pub struct CaptureSession {
    block_size: usize,
    inner: Arc<Mutex<CaptureInner>>,
}

impl CaptureSession {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            inner: Arc::new(Mutex::new(CaptureInner {
                task: None,
                source: None,
                active: false,
            })),
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner.lock().unwrap().active
    }

    /// Attach the source and start the block loop: read a block, encode it,
    /// forward it immediately. Starting while already capturing is a warned
    /// no-op. If the source fails to start, capture stays not-started and
    /// the acquisition error propagates.
    pub fn start(
        &self,
        mut source: Box<dyn AudioSource>,
        connection: ConnectionManager,
    ) -> ClientResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.active {
            warn!("Capture already running");
            return Ok(());
        }

        let mut blocks = source.start(self.block_size)?;
        let sample_rate = source.sample_rate();

        let session_inner = self.inner.clone();
        let task = tokio::spawn(async move {
            while let Some(block) = blocks.recv().await {
                let pcm = codec::encode_f32_to_pcm16le(&block);
                if let Err(err) = connection.send_binary(pcm).await {
                    // The transport is gone; the reader delivers the close
                    // notification, we just stop pushing
                    warn!("Capture block send failed, ending block loop: {}", err);
                    break;
                }
            }
            session_inner.lock().unwrap().active = false;
            debug!("Capture block loop ended");
        });

        inner.task = Some(task);
        inner.source = Some(source);
        inner.active = true;
        info!(
            block_size = self.block_size,
            sample_rate, "Capture started"
        );
        Ok(())
    }

    /// Detach the block loop and release the microphone. Idempotent and
    /// safe from any state.
    pub fn stop(&self) {
        let mut inner = self.inner.lock().unwrap();
        let was_active = inner.active;
        inner.active = false;
        if let Some(mut source) = inner.source.take() {
            source.stop();
        }
        if let Some(task) = inner.task.take() {
            task.abort();
        }
        if was_active {
            info!("Capture stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::connection::ConnectionManager;
    use crate::error::ClientError;
    use futures_util::StreamExt;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;

    /// Source backed by a channel the test feeds directly.
    struct ScriptedSource {
        feed: Option<mpsc::UnboundedReceiver<Vec<f32>>>,
        stopped: Arc<Mutex<bool>>,
    }

    impl ScriptedSource {
        fn new() -> (Self, mpsc::UnboundedSender<Vec<f32>>, Arc<Mutex<bool>>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let stopped = Arc::new(Mutex::new(false));
            (
                Self {
                    feed: Some(rx),
                    stopped: stopped.clone(),
                },
                tx,
                stopped,
            )
        }
    }

    impl AudioSource for ScriptedSource {
        fn sample_rate(&self) -> u32 {
            16_000
        }

        fn start(&mut self, _block_size: usize) -> ClientResult<mpsc::UnboundedReceiver<Vec<f32>>> {
            Ok(self.feed.take().expect("source started twice"))
        }

        fn stop(&mut self) {
            *self.stopped.lock().unwrap() = true;
        }
    }

    /// A source whose permission prompt was declined.
    struct DeniedSource;

    impl AudioSource for DeniedSource {
        fn sample_rate(&self) -> u32 {
            16_000
        }

        fn start(&mut self, _block_size: usize) -> ClientResult<mpsc::UnboundedReceiver<Vec<f32>>> {
            Err(ClientError::PermissionDenied(
                "user declined microphone access".to_string(),
            ))
        }

        fn stop(&mut self) {}
    }

    /// Accepts one WebSocket connection and forwards each received binary
    /// payload to the returned channel.
    async fn spawn_collecting_server() -> (String, mpsc::UnboundedReceiver<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Binary(data) = msg {
                    let _ = tx.send(data);
                }
            }
        });
        (format!("ws://{}", addr), rx)
    }

    fn connected_manager_config(url: String) -> crate::config::ConnectionConfig {
        let mut config = AppConfig::default().connection;
        config.url = url;
        config
    }

    /// Each block is encoded and forwarded as soon as it is ready: two fed
    /// blocks become two binary frames of exactly 2 bytes per sample.
    #[tokio::test]
    async fn test_blocks_forwarded_immediately() {
        let (url, mut received) = spawn_collecting_server().await;
        let connection = ConnectionManager::new(connected_manager_config(url));
        let _inbound = connection.connect().await.unwrap();

        let session = CaptureSession::new(4096);
        let (source, feed, _stopped) = ScriptedSource::new();
        session.start(Box::new(source), connection.clone()).unwrap();
        assert!(session.is_active());

        feed.send(vec![0.0; 4096]).unwrap();
        feed.send(vec![0.5; 4096]).unwrap();

        let first = tokio::time::timeout(Duration::from_secs(2), received.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.len(), 8192);
        assert!(first.iter().all(|&b| b == 0));

        let second = tokio::time::timeout(Duration::from_secs(2), received.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.len(), 8192);
        // 0.5 * 32767 = 16383 = 0x3FFF little-endian
        assert_eq!(&second[..2], &[0xFF, 0x3F]);

        session.stop();
        connection.disconnect().await;
    }

    /// Stop releases the source and ends the loop; a second stop is a no-op.
    #[tokio::test]
    async fn test_stop_releases_source() {
        let (url, _received) = spawn_collecting_server().await;
        let connection = ConnectionManager::new(connected_manager_config(url));
        let _inbound = connection.connect().await.unwrap();

        let session = CaptureSession::new(1024);
        let (source, _feed, stopped) = ScriptedSource::new();
        session.start(Box::new(source), connection.clone()).unwrap();

        session.stop();
        assert!(!session.is_active());
        assert!(*stopped.lock().unwrap());
        session.stop(); // idempotent

        connection.disconnect().await;
    }

    /// Acquisition failure propagates and leaves the session not-started.
    #[tokio::test]
    async fn test_denied_source_leaves_not_started() {
        let connection =
            ConnectionManager::new(connected_manager_config("ws://127.0.0.1:9".to_string()));
        let session = CaptureSession::new(4096);

        let err = session
            .start(Box::new(DeniedSource), connection)
            .unwrap_err();
        assert!(matches!(err, ClientError::PermissionDenied(_)));
        assert!(!session.is_active());
    }

    /// Starting twice is a warned no-op, not an error.
    #[tokio::test]
    async fn test_double_start_is_noop() {
        let (url, _received) = spawn_collecting_server().await;
        let connection = ConnectionManager::new(connected_manager_config(url));
        let _inbound = connection.connect().await.unwrap();

        let session = CaptureSession::new(1024);
        let (source, _feed, _stopped) = ScriptedSource::new();
        session.start(Box::new(source), connection.clone()).unwrap();

        let (source2, _feed2, _stopped2) = ScriptedSource::new();
        assert!(session.start(Box::new(source2), connection.clone()).is_ok());
        assert!(session.is_active());

        session.stop();
        connection.disconnect().await;
    }
}
