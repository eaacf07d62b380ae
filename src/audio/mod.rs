//! # Audio Pipeline Module
//!
//! The audio half of the client: sample-format conversion, gapless playback
//! scheduling, and recording accumulation/export.
//!
//! ## Key Components:
//! - **Codec**: f32 ↔ PCM16LE conversion for both wire directions
//! - **Playback Scheduler**: virtual-clock scheduling of inbound frames
//! - **Recorder**: ordered PCM retention and one-shot MP3 export
//!
//! ## Audio Format Requirements:
//! - **Outbound (capture)**: 16 kHz, 16-bit PCM, mono, little-endian
//! - **Inbound (playback)**: 24 kHz, 16-bit PCM, mono, little-endian
//! - **Export**: MP3, mono, source sample rate, fixed bitrate

// The capture session lives in src/capture.rs at the root level
pub mod codec;      // PCM16LE frame codec
pub mod playback;   // Virtual-clock playback scheduler
pub mod recorder;   // Recording accumulator and MP3 encoder

pub use codec::AudioFrame;
pub use playback::{AudioOutput, NullOutput, PlaybackScheduler};
pub use recorder::{AudioRecorder, RecordingStatus};
