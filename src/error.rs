//! # Error Handling
//!
//! This module defines the error types for the dialog client and how other
//! error types are converted into them.
//!
//! ## Error Categories:
//! - **Connection**: the WebSocket never opened (`ConnectTimeout`,
//!   `ConnectError`) or is not open when a send is attempted
//!   (`TransportUnavailable`)
//! - **Audio devices**: microphone acquisition failed (`PermissionDenied`,
//!   `DeviceUnavailable`)
//! - **Recording/export**: nothing was accumulated (`EmptyRecording`) or the
//!   MP3 encoder could not be constructed (`EncoderInitFailure`)
//! - **Protocol**: malformed JSON control frames or malformed binary audio
//!   frames (`Protocol`)
//! - **Internal**: everything else (`Internal`)
//!
//! ## Propagation policy:
//! Connection and send failures are returned to the immediate caller as typed
//! errors and are never retried at this level; the bounded retry loop lives
//! in the client layer around connect+init. Playback and recording failures
//! caused by a single malformed frame are logged and skipped where they
//! occur; they never surface through this type.

use crate::config::DeviceProfile;
use std::fmt;

/// Error type for every fallible operation of the dialog client.
///
/// Each variant carries enough context to produce an actionable,
/// user-distinguishable message (a timeout on a slow-profile connection reads
/// differently from a refused connection).
#[derive(Debug)]
pub enum ClientError {
    /// The transport did not signal "open" within the profile's budget.
    ConnectTimeout {
        /// The budget that elapsed, in milliseconds
        timeout_ms: u64,
        /// The device profile the budget was chosen for
        profile: DeviceProfile,
    },

    /// The transport failed while dialing or during the handshake.
    ConnectError(String),

    /// A send was attempted while the connection is not open, and the
    /// one reconnect-and-reinit cycle also failed.
    TransportUnavailable(String),

    /// The microphone permission request was denied.
    PermissionDenied(String),

    /// No usable audio device, or the device rejected the configuration.
    DeviceUnavailable(String),

    /// Export was requested but no audio frames were ever accumulated.
    EmptyRecording,

    /// The MP3 encoder backend could not be initialized. Fatal for export;
    /// there is no fallback format.
    EncoderInitFailure(String),

    /// A control frame failed to (de)serialize, or a binary audio frame was
    /// malformed (e.g. an odd byte count for 16-bit samples).
    Protocol(String),

    /// Anything that does not fit the categories above.
    Internal(String),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::ConnectTimeout { timeout_ms, profile } => write!(
                f,
                "connection timed out after {}ms ({} profile)",
                timeout_ms, profile
            ),
            ClientError::ConnectError(msg) => write!(f, "connection failed: {}", msg),
            ClientError::TransportUnavailable(msg) => {
                write!(f, "transport unavailable: {}", msg)
            }
            ClientError::PermissionDenied(msg) => {
                write!(f, "microphone permission denied: {}", msg)
            }
            ClientError::DeviceUnavailable(msg) => write!(f, "audio device unavailable: {}", msg),
            ClientError::EmptyRecording => write!(f, "no recorded audio to export"),
            ClientError::EncoderInitFailure(msg) => {
                write!(f, "MP3 encoder initialization failed: {}", msg)
            }
            ClientError::Protocol(msg) => write!(f, "protocol error: {}", msg),
            ClientError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for ClientError {}

/// JSON (de)serialization failures are protocol errors: the control channel
/// carries nothing but self-contained JSON text frames.
impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Protocol(format!("JSON error: {}", err))
    }
}

/// Transport-level failures reported by the WebSocket library while a
/// connection is being established.
impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ClientError::ConnectError(err.to_string())
    }
}

impl From<anyhow::Error> for ClientError {
    fn from(err: anyhow::Error) -> Self {
        ClientError::Internal(err.to_string())
    }
}

/// Shorthand for `Result<T, ClientError>` used throughout the crate.
pub type ClientResult<T> = Result<T, ClientError>;
