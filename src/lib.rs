//! # Voice Dialog Client
//!
//! A real-time, turn-based spoken dialog client. It holds one persistent
//! bidirectional WebSocket to a remote synthesis/recognition service:
//! microphone audio streams up as headerless PCM16LE frames while
//! synthesized speech streams down the same socket, multiplexed with JSON
//! control messages. Inbound audio is played gaplessly on a virtual audio
//! clock and simultaneously accumulated for export as a single MP3 blob.
//!
//! ## Architecture:
//! - **config**: layered configuration (TOML file + environment + defaults)
//! - **error**: the typed failure taxonomy shared by every component
//! - **protocol**: the JSON control messages (`init`, `tts_text`,
//!   `text_query`)
//! - **connection**: WebSocket lifecycle state machine and inbound demux
//! - **capture**: fixed-block microphone capture feeding the wire
//! - **audio**: codec, gapless playback scheduler, recording accumulator
//! - **client**: the constructible [`DialogClient`] instance tying it all
//!   together, with bounded connect retry and lifecycle events
//! - **device** (feature `device`): cpal bindings for real microphones and
//!   speakers; without it the pipeline runs headless against the same traits

pub mod audio;      // Codec, playback scheduling, recording (audio/ directory)
pub mod capture;    // Microphone capture session (capture.rs)
pub mod client;     // Dialog client orchestration (client.rs)
pub mod config;     // Configuration management (config.rs)
pub mod connection; // Connection manager and state machine (connection.rs)
pub mod error;      // Error handling types (error.rs)
pub mod protocol;   // JSON control protocol (protocol.rs)

#[cfg(feature = "device")]
pub mod device;     // cpal microphone/speaker binding (device.rs)

pub use client::{ClientEvent, DialogClient};
pub use config::AppConfig;
pub use error::{ClientError, ClientResult};
