//! # PCM Frame Codec
//!
//! Converts between floating-point audio samples and 16-bit little-endian
//! PCM, in both directions. This is the only place in the pipeline where the
//! wire sample format is known; everything above it works in `f32` or `i16`.
//!
//! ## Wire format:
//! - **Samples**: 16-bit signed integers, little-endian
//! - **Channels**: mono
//! - **Framing**: none; frame boundaries are message boundaries
//!
//! ## Scaling convention:
//! A float sample `s` in [-1.0, 1.0] is clamped and then scaled to the full
//! signed 16-bit range: negative values use the negative full-scale constant
//! (32768), non-negative values the positive one (32767). The asymmetry is
//! intentional: it matches the common PCM convention where -1.0 maps to
//! -32768 but +1.0 can only reach +32767.

use crate::error::{ClientError, ClientResult};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// One decoded audio frame: an ordered run of 16-bit samples plus the sample
/// rate it was produced at (16 kHz outbound, 24 kHz inbound). Frames are
/// treated as immutable once built and are consumed exactly once by whichever
/// sink receives them (playback, recording, or the wire).
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// The PCM samples in arrival order
    pub samples: Vec<i16>,
    /// Sample rate in Hz
    pub sample_rate: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self { samples, sample_rate }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Playback duration of this frame in seconds.
    pub fn duration_seconds(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Normalized float view of the samples, for handing to the audio
    /// output. Uses the symmetric 1/32768 normalization of the inbound path.
    pub fn to_f32(&self) -> Vec<f32> {
        pcm16_to_f32(&self.samples)
    }
}

/// Encode float samples to PCM16LE bytes for the wire.
///
/// Each sample is clamped to [-1.0, 1.0] and scaled with the asymmetric
/// full-scale convention described in the module docs. The output is exactly
/// `2 * samples.len()` bytes.
pub fn encode_f32_to_pcm16le(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let s = sample.clamp(-1.0, 1.0);
        let value = if s < 0.0 {
            (s * 32768.0) as i16
        } else {
            (s * 32767.0) as i16
        };
        // Writing into a Vec cannot fail
        out.write_i16::<LittleEndian>(value)
            .expect("write into Vec");
    }
    out
}

/// Decode PCM16LE bytes from the wire into 16-bit samples.
///
/// An odd byte count cannot be 16-bit samples and is rejected as a protocol
/// error; callers on the inbound path log and skip such frames rather than
/// aborting the session. An empty payload decodes to an empty sample run.
pub fn decode_pcm16le(data: &[u8]) -> ClientResult<Vec<i16>> {
    if data.len() % 2 != 0 {
        return Err(ClientError::Protocol(format!(
            "binary frame length {} is not a whole number of 16-bit samples",
            data.len()
        )));
    }

    let mut cursor = Cursor::new(data);
    let mut samples = Vec::with_capacity(data.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample);
    }

    Ok(samples)
}

/// Convert 16-bit samples to normalized floats in [-1.0, 1.0).
pub fn pcm16_to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32768.0).collect()
}
