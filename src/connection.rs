//! # Connection Manager
//!
//! Owns the WebSocket transport, its lifecycle state machine, and the demux
//! of inbound frames. One `ConnectionManager` exists per dialog client; it is
//! the sole owner of the transport handle and the sole writer of connection
//! state.
//!
//! ## State machine:
//! `Disconnected → Connecting → Open → Closing → Disconnected`. Every
//! transport callback of the original (onopen/onmessage/onerror/onclose) is
//! an external event fed into this machine instead of an ad hoc flag
//! mutation.
//!
//! ## Invariants:
//! - While `Open`, exactly one transport handle is live. `connect()` on a
//!   live or half-open connection force-closes it first and observes a grace
//!   delay before dialing again, so duplicate sockets and stale readers
//!   cannot accumulate.
//! - Binary frames travel as raw bytes end to end (the WebSocket binary
//!   frame type, never text-encoded payloads).
//! - On transport close (local, remote, or error) the reader marks the
//!   connection `Disconnected` *before* emitting the `Closed` notification,
//!   so no consumer can observe "closed but still thinks it's connected".

use crate::config::ConnectionConfig;
use crate::error::{ClientError, ClientResult};
use crate::protocol::ControlMessage;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Lifecycle state of the one transport a manager owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport; sends fail, connect is allowed
    Disconnected,
    /// Dialing and waiting for the open signal within the profile budget
    Connecting,
    /// Transport live; sends allowed
    Open,
    /// Teardown in progress; a new connect waits for this to finish
    Closing,
}

/// One frame delivered by the transport, already demultiplexed by frame
/// type. Audio stays raw bytes here; decoding happens at the consumer so a
/// malformed frame can be skipped without touching the channel.
#[derive(Debug)]
pub enum InboundFrame {
    /// Binary frame: headerless PCM16LE mono samples
    Audio(Vec<u8>),
    /// Text frame that parsed as a control message
    Control(ControlMessage),
    /// The transport closed (remotely, locally, or through an error). The
    /// payload carries the close reason when one was given.
    Closed(Option<String>),
}

/// Interior of the manager, guarded by one async mutex. All state writes
/// happen under this lock, and teardown is a single locked section, never
/// split across a suspension point that could interleave with a send.
struct ConnectionInner {
    state: ConnectionState,
    sink: Option<WsSink>,
    reader: Option<JoinHandle<()>>,
    /// Incremented once per successful dial. The reader task remembers the
    /// epoch it was spawned under and only clears state that still belongs
    /// to it, so a finished old reader cannot clobber a newer connection.
    epoch: u64,
}

/// Handle to the connection. Cheap to clone; all clones share the one
/// transport and the one state machine.
#[derive(Clone)]
pub struct ConnectionManager {
    config: ConnectionConfig,
    inner: Arc<Mutex<ConnectionInner>>,
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            inner: Arc::new(Mutex::new(ConnectionInner {
                state: ConnectionState::Disconnected,
                sink: None,
                reader: None,
                epoch: 0,
            })),
        }
    }

    /// Establish the connection, returning the inbound frame stream.
    ///
    /// Idempotent-safe: an existing live or half-open transport is forced
    /// through `Closing` and fully torn down, and the configured grace delay
    /// elapses, before the new dial starts. Returns only once the transport
    /// has signalled open; fails with [`ClientError::ConnectTimeout`] after
    /// the profile budget or [`ClientError::ConnectError`] on a transport
    /// failure. No retry happens here; that policy lives one layer up.
    pub async fn connect(&self) -> ClientResult<mpsc::UnboundedReceiver<InboundFrame>> {
        let had_transport = {
            let mut inner = self.inner.lock().await;
            if matches!(inner.state, ConnectionState::Open | ConnectionState::Connecting) {
                info!("Closing existing connection before reconnecting");
                inner.state = ConnectionState::Closing;
                Self::teardown_locked(&mut inner).await;
                inner.state = ConnectionState::Disconnected;
                true
            } else {
                false
            }
        };
        if had_transport {
            // Let the old transport finish tearing down before dialing again
            tokio::time::sleep(self.config.reconnect_grace()).await;
        }

        let mut inner = self.inner.lock().await;
        inner.state = ConnectionState::Connecting;
        info!(url = %self.config.url, profile = %self.config.profile, "Connecting");

        let dial = connect_async(self.config.url.as_str());
        let ws = match tokio::time::timeout(self.config.connect_timeout(), dial).await {
            Ok(Ok((ws, _response))) => ws,
            Ok(Err(err)) => {
                inner.state = ConnectionState::Disconnected;
                error!("WebSocket connect failed: {}", err);
                return Err(ClientError::ConnectError(err.to_string()));
            }
            Err(_elapsed) => {
                inner.state = ConnectionState::Disconnected;
                error!(
                    "WebSocket connect timed out after {}ms",
                    self.config.connect_timeout_ms()
                );
                return Err(ClientError::ConnectTimeout {
                    timeout_ms: self.config.connect_timeout_ms(),
                    profile: self.config.profile,
                });
            }
        };

        let (sink, stream) = ws.split();
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();

        inner.epoch += 1;
        let reader = tokio::spawn(Self::read_loop(
            stream,
            frame_tx,
            self.inner.clone(),
            inner.epoch,
        ));

        inner.sink = Some(sink);
        inner.reader = Some(reader);
        inner.state = ConnectionState::Open;
        info!("WebSocket connection open");

        Ok(frame_rx)
    }

    /// Release the transport. Always safe to call, from any state, and
    /// idempotent; it never fails.
    pub async fn disconnect(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state == ConnectionState::Disconnected && inner.sink.is_none() {
            debug!("Disconnect requested but already disconnected");
            return;
        }
        inner.state = ConnectionState::Closing;
        Self::teardown_locked(&mut inner).await;
        inner.state = ConnectionState::Disconnected;
        info!("WebSocket connection closed");
    }

    /// Send one binary audio frame (raw PCM16LE bytes).
    pub async fn send_binary(&self, data: Vec<u8>) -> ClientResult<()> {
        self.send_message(Message::Binary(data)).await
    }

    /// Send one fully-buffered JSON control frame.
    pub async fn send_control(&self, message: &ControlMessage) -> ClientResult<()> {
        let json = message.to_json()?;
        debug!(frame = %json, "Sending control frame");
        self.send_message(Message::Text(json)).await
    }

    async fn send_message(&self, message: Message) -> ClientResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.state != ConnectionState::Open {
            return Err(ClientError::TransportUnavailable(format!(
                "connection is {:?}",
                inner.state
            )));
        }
        let sink = inner
            .sink
            .as_mut()
            .ok_or_else(|| ClientError::TransportUnavailable("no transport handle".to_string()))?;

        if let Err(err) = sink.send(message).await {
            // A failed send means the transport is gone; drop our half so
            // state is consistent immediately. The reader observes the broken
            // stream on its own and delivers the Closed notification.
            warn!("Send failed, marking connection closed: {}", err);
            inner.sink = None;
            inner.state = ConnectionState::Disconnected;
            return Err(ClientError::TransportUnavailable(format!(
                "send failed: {}",
                err
            )));
        }
        Ok(())
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    /// True while the transport is live and sends are allowed.
    pub async fn is_open(&self) -> bool {
        self.state().await == ConnectionState::Open
    }

    /// Close the sink and stop the reader. Callers hold the lock and set the
    /// surrounding states; this only releases the handles.
    async fn teardown_locked(inner: &mut ConnectionInner) {
        if let Some(mut sink) = inner.sink.take() {
            // Best effort: deliver a close frame if the peer is still there
            let _ = sink.close().await;
        }
        if let Some(reader) = inner.reader.take() {
            reader.abort();
        }
    }

    /// Reader half of the connection: demultiplexes inbound frames by
    /// transport frame type and forwards them in arrival order.
    async fn read_loop(
        mut stream: SplitStream<WsStream>,
        frame_tx: mpsc::UnboundedSender<InboundFrame>,
        inner: Arc<Mutex<ConnectionInner>>,
        epoch: u64,
    ) {
        let mut close_reason: Option<String> = None;

        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Binary(data)) => {
                    if frame_tx.send(InboundFrame::Audio(data)).is_err() {
                        break; // consumer gone
                    }
                }
                Ok(Message::Text(text)) => match ControlMessage::from_json(&text) {
                    Ok(msg) => {
                        if frame_tx.send(InboundFrame::Control(msg)).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        // One bad frame must not end the session
                        warn!("Ignoring unparseable text frame: {}", err);
                    }
                },
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                    // Keepalive handled by the protocol layer underneath
                }
                Ok(Message::Close(frame)) => {
                    close_reason = frame.map(|f| f.reason.to_string());
                    info!(reason = ?close_reason, "WebSocket closed by peer");
                    break;
                }
                Ok(Message::Frame(_)) => {
                    // Raw frames never surface from a configured stream
                }
                Err(err) => {
                    error!("WebSocket read error: {}", err);
                    close_reason = Some(err.to_string());
                    break;
                }
            }
        }

        // Flip the state machine before notifying, so every consumer that
        // reacts to Closed already observes Disconnected.
        {
            let mut inner = inner.lock().await;
            if inner.epoch == epoch {
                inner.state = ConnectionState::Disconnected;
                inner.sink = None;
                inner.reader = None;
            }
        }
        let _ = frame_tx.send(InboundFrame::Closed(close_reason));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, DeviceProfile};
    use std::time::{Duration, Instant};
    use tokio::net::TcpListener;

    fn test_config(url: String) -> ConnectionConfig {
        let mut config = AppConfig::default().connection;
        config.url = url;
        config.connect_timeout_fast_ms = 2_000;
        config.reconnect_grace_ms = 20;
        config
    }

    /// Accepts WebSocket connections and reports each accepted connection's
    /// index on `events` when that connection's stream ends.
    async fn spawn_echoless_server(
        connections: usize,
    ) -> (String, mpsc::UnboundedReceiver<usize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            for index in 0..connections {
                let (socket, _) = listener.accept().await.unwrap();
                let events_tx = events_tx.clone();
                tokio::spawn(async move {
                    let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
                    while let Some(msg) = ws.next().await {
                        if msg.is_err() {
                            break;
                        }
                    }
                    let _ = events_tx.send(index);
                });
            }
        });

        (format!("ws://{}", addr), events_rx)
    }

    #[tokio::test]
    async fn test_connect_and_disconnect() {
        let (url, _events) = spawn_echoless_server(1).await;
        let manager = ConnectionManager::new(test_config(url));

        assert_eq!(manager.state().await, ConnectionState::Disconnected);
        let _rx = manager.connect().await.unwrap();
        assert_eq!(manager.state().await, ConnectionState::Open);

        manager.disconnect().await;
        assert_eq!(manager.state().await, ConnectionState::Disconnected);
        // Idempotent
        manager.disconnect().await;
        assert_eq!(manager.state().await, ConnectionState::Disconnected);
    }

    /// connect() while already Open must leave exactly one live transport:
    /// the first server-side stream ends before the second connect returns
    /// open.
    #[tokio::test]
    async fn test_reconnect_closes_previous_transport() {
        let (url, mut events) = spawn_echoless_server(2).await;
        let manager = ConnectionManager::new(test_config(url));

        let _rx1 = manager.connect().await.unwrap();
        assert_eq!(manager.state().await, ConnectionState::Open);

        let _rx2 = manager.connect().await.unwrap();
        assert_eq!(manager.state().await, ConnectionState::Open);

        // The first connection must have been closed on the server side
        let closed = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("first connection never closed");
        assert_eq!(closed, Some(0));
    }

    /// A peer that accepts TCP but never answers the WebSocket handshake
    /// must produce ConnectTimeout within the budget, not earlier and not
    /// indefinitely.
    #[tokio::test]
    async fn test_connect_timeout_budget() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Hold sockets open without ever completing the handshake
        let silent = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let mut config = test_config(format!("ws://{}", addr));
        config.connect_timeout_fast_ms = 300;
        config.profile = DeviceProfile::Fast;
        let manager = ConnectionManager::new(config);

        let started = Instant::now();
        let err = manager.connect().await.unwrap_err();
        let elapsed = started.elapsed();

        match err {
            ClientError::ConnectTimeout { timeout_ms, profile } => {
                assert_eq!(timeout_ms, 300);
                assert_eq!(profile, DeviceProfile::Fast);
            }
            other => panic!("expected ConnectTimeout, got {:?}", other),
        }
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_millis(1500));
        assert_eq!(manager.state().await, ConnectionState::Disconnected);
        silent.abort();
    }

    /// A refused connection is a ConnectError, not a timeout.
    #[tokio::test]
    async fn test_connect_refused() {
        // Bind to get a port nothing listens on, then free it
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let manager = ConnectionManager::new(test_config(format!("ws://{}", addr)));
        let err = manager.connect().await.unwrap_err();
        assert!(matches!(err, ClientError::ConnectError(_)));
    }

    #[tokio::test]
    async fn test_send_requires_open() {
        let manager = ConnectionManager::new(test_config("ws://127.0.0.1:9".to_string()));
        let err = manager.send_binary(vec![0, 0]).await.unwrap_err();
        assert!(matches!(err, ClientError::TransportUnavailable(_)));
    }

    /// Inbound text and binary frames demultiplex by frame type, in order,
    /// and the remote close arrives as a Closed notification.
    #[tokio::test]
    async fn test_inbound_demux_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            ws.send(Message::Text(
                r#"{"type":"text_query","content":"echo"}"#.to_string(),
            ))
            .await
            .unwrap();
            ws.send(Message::Binary(vec![1, 0, 2, 0])).await.unwrap();
            ws.close(None).await.unwrap();
        });

        let manager = ConnectionManager::new(test_config(format!("ws://{}", addr)));
        let mut rx = manager.connect().await.unwrap();

        match rx.recv().await.unwrap() {
            InboundFrame::Control(ControlMessage::TextQuery { content }) => {
                assert_eq!(content, "echo");
            }
            other => panic!("expected control frame, got {:?}", other),
        }
        match rx.recv().await.unwrap() {
            InboundFrame::Audio(data) => assert_eq!(data, vec![1, 0, 2, 0]),
            other => panic!("expected audio frame, got {:?}", other),
        }
        match rx.recv().await.unwrap() {
            InboundFrame::Closed(_) => {}
            other => panic!("expected close notification, got {:?}", other),
        }
        // The state machine flipped before the notification was delivered
        assert_eq!(manager.state().await, ConnectionState::Disconnected);
    }
}
