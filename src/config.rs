//! # Configuration Management
//!
//! This module handles loading and managing the client configuration from
//! multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (APP_CONNECTION_URL, APP_CONNECTION_PROFILE, ...)
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impl)
//!
//! ## Device profiles:
//! The original client sniffed the user agent to decide how patient to be
//! with slow mobile networks. Here that is an explicit `profile` parameter:
//! `fast` (desktop-class network) or `slow` (mobile-class network). The
//! profile selects the connection timeout and the delay between connect
//! retries; nothing else in the pipeline depends on it.

use anyhow::Result;              // Better error handling with context
use serde::{Deserialize, Serialize};
use std::env;                    // For reading environment variables
use std::fmt;
use std::time::Duration;

/// Network patience profile, supplied by the caller instead of being derived
/// from user-agent sniffing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceProfile {
    /// Desktop-class network: shorter timeout, shorter retry delay
    Fast,
    /// Mobile-class network: longer timeout, longer retry delay
    Slow,
}

impl fmt::Display for DeviceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceProfile::Fast => write!(f, "fast"),
            DeviceProfile::Slow => write!(f, "slow"),
        }
    }
}

/// Main client configuration that contains all settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub connection: ConnectionConfig,
    pub audio: AudioConfig,
    pub session: SessionConfig,
    pub recording: RecordingConfig,
}

/// Connection lifecycle settings.
///
/// ## Fields:
/// - `url`: WebSocket endpoint of the dialog service (ws:// or wss://)
/// - `profile`: network patience profile (see [`DeviceProfile`])
/// - `connect_timeout_fast_ms` / `connect_timeout_slow_ms`: how long to wait
///   for the transport to signal "open" before failing with a timeout
/// - `retry_delay_fast_ms` / `retry_delay_slow_ms`: delay between bounded
///   connect+init retry attempts
/// - `max_connect_attempts`: bound on the retry loop around connect+init
/// - `reconnect_grace_ms`: teardown grace observed between force-closing an
///   existing transport and dialing a new one
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub url: String,
    pub profile: DeviceProfile,
    pub connect_timeout_fast_ms: u64,
    pub connect_timeout_slow_ms: u64,
    pub retry_delay_fast_ms: u64,
    pub retry_delay_slow_ms: u64,
    pub max_connect_attempts: u32,
    pub reconnect_grace_ms: u64,
}

impl ConnectionConfig {
    /// Connect timeout budget for the configured profile.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms())
    }

    /// Connect timeout budget in milliseconds (used in error reporting).
    pub fn connect_timeout_ms(&self) -> u64 {
        match self.profile {
            DeviceProfile::Fast => self.connect_timeout_fast_ms,
            DeviceProfile::Slow => self.connect_timeout_slow_ms,
        }
    }

    /// Delay between connect+init retry attempts for the configured profile.
    pub fn retry_delay(&self) -> Duration {
        match self.profile {
            DeviceProfile::Fast => Duration::from_millis(self.retry_delay_fast_ms),
            DeviceProfile::Slow => Duration::from_millis(self.retry_delay_slow_ms),
        }
    }

    /// Grace delay between force-closing an old transport and dialing anew.
    pub fn reconnect_grace(&self) -> Duration {
        Duration::from_millis(self.reconnect_grace_ms)
    }
}

/// Audio format settings for both wire directions.
///
/// ## Fields:
/// - `input_sample_rate`: capture/outbound rate in Hz (16000 on the wire)
/// - `output_sample_rate`: playback/inbound rate in Hz (24000 on the wire)
/// - `channels`: 1 (the wire carries mono only)
/// - `bit_depth`: 16 (the wire carries PCM16LE only)
/// - `capture_block_size`: samples per capture block; each block becomes one
///   binary frame on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub channels: u8,
    pub bit_depth: u8,
    pub capture_block_size: usize,
}

/// Dialog session settings sent in the `init` control frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Synthesis voice requested from the remote service
    pub speaker: String,
    /// Session mode sent with `init` when the caller does not specify one
    pub default_mode: String,
}

/// Recording export settings.
///
/// ## Fields:
/// - `bitrate_kbps`: fixed MP3 bitrate of the export artifact
/// - `encoder_block_size`: samples fed to the encoder per block (1152 is the
///   MP3 frame granularity)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingConfig {
    pub bitrate_kbps: u32,
    pub encoder_block_size: usize,
}

/// Provides default configuration values.
///
/// ## Why defaults matter:
/// Default values let the client run with no configuration file at all, and
/// they document the wire contract: 16 kHz in, 24 kHz out, 4096-sample
/// capture blocks, 128 kbps mono MP3 export.
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig {
                url: "ws://127.0.0.1:8080/ws/dialog".to_string(),
                profile: DeviceProfile::Fast,
                connect_timeout_fast_ms: 10_000,  // desktop-class networks open quickly
                connect_timeout_slow_ms: 15_000,  // mobile networks negotiate slower
                retry_delay_fast_ms: 1_000,
                retry_delay_slow_ms: 2_000,
                max_connect_attempts: 3,
                reconnect_grace_ms: 100,
            },
            audio: AudioConfig {
                input_sample_rate: 16_000,   // microphone/outbound rate
                output_sample_rate: 24_000,  // synthesized/inbound rate
                channels: 1,
                bit_depth: 16,
                capture_block_size: 4096,
            },
            session: SessionConfig {
                speaker: "zh_female_vv_jupiter_bigtts".to_string(),
                default_mode: "audio".to_string(),
            },
            recording: RecordingConfig {
                bitrate_kbps: 128,
                encoder_block_size: 1152,  // one MP3 frame of samples
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP_
    /// 4. Handle the bare `WS_URL` variable used by deployment scripts
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            // 1. Start with defaults - converts our Default impl to config format
            .add_source(config::Config::try_from(&AppConfig::default())?)
            // 2. Load from config.toml file (if it exists)
            .add_source(config::File::with_name("config").required(false))
            // 3. Load from environment variables with APP_ prefix
            // Example: APP_CONNECTION_URL becomes connection.url in the config
            .add_source(config::Environment::with_prefix("APP").separator("_"));

        // Deployment scripts commonly export the endpoint without the prefix
        if let Ok(url) = env::var("WS_URL") {
            settings = settings.set_override("connection.url", url)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - The endpoint URL uses a WebSocket scheme
    /// - Sample rates, block sizes and retry bounds are non-zero
    /// - The wire format is the only one the pipeline speaks (16-bit mono)
    pub fn validate(&self) -> Result<()> {
        if !self.connection.url.starts_with("ws://") && !self.connection.url.starts_with("wss://") {
            return Err(anyhow::anyhow!(
                "Connection URL must use ws:// or wss:// (got '{}')",
                self.connection.url
            ));
        }

        if self.connection.max_connect_attempts == 0 {
            return Err(anyhow::anyhow!("Max connect attempts must be greater than 0"));
        }

        if self.audio.input_sample_rate == 0 || self.audio.output_sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rates must be greater than 0"));
        }

        if self.audio.channels != 1 {
            return Err(anyhow::anyhow!("Only mono audio is supported on the wire"));
        }

        if self.audio.bit_depth != 16 {
            return Err(anyhow::anyhow!("Only 16-bit PCM is supported on the wire"));
        }

        if self.audio.capture_block_size == 0 {
            return Err(anyhow::anyhow!("Capture block size must be greater than 0"));
        }

        if self.recording.encoder_block_size == 0 {
            return Err(anyhow::anyhow!("Encoder block size must be greater than 0"));
        }

        Ok(())
    }
}
