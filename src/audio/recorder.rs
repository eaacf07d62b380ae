//! # Recording Accumulator & MP3 Encoder
//!
//! Taps the inbound PCM stream, retains it in arrival order, and on demand
//! merges and compresses the whole session into a single exportable MP3
//! blob.
//!
//! ## Accumulation:
//! - `start()` resets the buffer and begins retaining; `stop()` stops
//!   retaining; both are idempotent
//! - `add_pcm()` while inactive is a no-op, so the tap can stay wired into
//!   the inbound path unconditionally
//! - The session sample rate is latched from the first retained chunk and
//!   assumed constant for the session
//!
//! ## Export:
//! `export()` merges all retained chunks into one contiguous sample array
//! (one allocation, sized up front) and feeds it through the LAME block
//! encoder in fixed 1152-sample blocks (one MP3 frame of samples), then
//! flushes the tail. The result is deterministic for the same accumulated
//! audio, and the buffer is left untouched so the same session can be
//! exported again; only `start()`/`reset()` clear it.
//!
//! ## Failure modes:
//! - `EmptyRecording` when nothing was ever accumulated
//! - `EncoderInitFailure` when the LAME backend cannot be constructed;
//!   fatal, with no silent fallback format

use crate::config::RecordingConfig;
use crate::error::{ClientError, ClientResult};
use mp3lame_encoder::{Birtate, Builder, Encoder, FlushNoGap, MonoPcm, Quality};
use tracing::{debug, info};

/// Snapshot of the accumulator, queryable at any time.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingStatus {
    pub is_recording: bool,
    /// Number of retained chunks
    pub buffer_count: usize,
    /// Total retained samples across all chunks
    pub total_samples: usize,
    /// Retained audio duration in seconds
    pub duration_seconds: f64,
    /// Latched session sample rate
    pub sample_rate: u32,
}

/// The recording accumulator. Owned by the dialog client; the inbound pump
/// is its only writer, so chunks can never arrive out of order.
pub struct AudioRecorder {
    /// Retained PCM chunks in arrival order
    chunks: Vec<Vec<i16>>,
    /// Running total of retained samples, so the merge can allocate once
    total_samples: usize,
    /// Latched from the first retained chunk
    sample_rate: u32,
    recording: bool,
    config: RecordingConfig,
}

impl AudioRecorder {
    /// Create an inactive accumulator. `default_sample_rate` is reported by
    /// `status()` until the first chunk latches the real session rate.
    pub fn new(config: RecordingConfig, default_sample_rate: u32) -> Self {
        Self {
            chunks: Vec::new(),
            total_samples: 0,
            sample_rate: default_sample_rate,
            recording: false,
            config,
        }
    }

    /// Begin accumulating. Clears anything previously retained. Idempotent
    /// in the sense that it is always safe; calling it mid-session starts a
    /// fresh recording.
    pub fn start(&mut self) {
        self.chunks.clear();
        self.total_samples = 0;
        self.recording = true;
        info!("Recording started");
    }

    /// Stop accumulating. The retained audio stays available for export.
    pub fn stop(&mut self) {
        if self.recording {
            self.recording = false;
            info!(chunks = self.chunks.len(), "Recording stopped");
        }
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// Retain one PCM chunk. No-op while inactive, and empty chunks are not
    /// retained. The first retained chunk latches the session sample rate.
    pub fn add_pcm(&mut self, samples: &[i16], sample_rate: u32) {
        if !self.recording || samples.is_empty() {
            return;
        }

        if self.chunks.is_empty() {
            self.sample_rate = sample_rate;
        }

        self.chunks.push(samples.to_vec());
        self.total_samples += samples.len();
        debug!(len = samples.len(), total = self.total_samples, "Retained audio chunk");
    }

    /// Merge all retained chunks into one contiguous sample array.
    /// Allocates exactly once, sized by the running total.
    fn merge(&self) -> Vec<i16> {
        let mut merged = Vec::with_capacity(self.total_samples);
        for chunk in &self.chunks {
            merged.extend_from_slice(chunk);
        }
        merged
    }

    /// Encode everything retained so far into one MP3 blob.
    ///
    /// Deterministic for the same accumulated audio; does not clear the
    /// buffer, so repeated exports of the same session are possible.
    pub fn export(&self) -> ClientResult<Vec<u8>> {
        if self.chunks.is_empty() {
            return Err(ClientError::EmptyRecording);
        }

        info!(
            chunks = self.chunks.len(),
            samples = self.total_samples,
            sample_rate = self.sample_rate,
            "Exporting recording as MP3"
        );

        let merged = self.merge();
        let mut encoder =
            Mp3BlockEncoder::new(self.sample_rate, self.config.bitrate_kbps)?;

        let mut out = Vec::new();
        for block in merged.chunks(self.config.encoder_block_size) {
            encoder.encode_block(block, &mut out)?;
        }
        encoder.finish(&mut out)?;

        info!(bytes = out.len(), "MP3 export complete");
        Ok(out)
    }

    /// Discard everything and return to the inactive state.
    pub fn reset(&mut self) {
        self.chunks.clear();
        self.total_samples = 0;
        self.recording = false;
        info!("Recorder reset");
    }

    pub fn status(&self) -> RecordingStatus {
        RecordingStatus {
            is_recording: self.recording,
            buffer_count: self.chunks.len(),
            total_samples: self.total_samples,
            duration_seconds: self.total_samples as f64 / self.sample_rate as f64,
            sample_rate: self.sample_rate,
        }
    }
}

/// Thin wrapper around the LAME encoder fixing the session shape: mono
/// input, fixed bitrate, block-at-a-time encoding with a final flush.
struct Mp3BlockEncoder {
    encoder: Encoder,
}

impl Mp3BlockEncoder {
    fn new(sample_rate: u32, bitrate_kbps: u32) -> ClientResult<Self> {
        let mut builder = Builder::new().ok_or_else(|| {
            ClientError::EncoderInitFailure("LAME context allocation failed".to_string())
        })?;

        builder
            .set_num_channels(1)
            .map_err(|e| ClientError::EncoderInitFailure(format!("channels: {:?}", e)))?;
        builder
            .set_sample_rate(sample_rate)
            .map_err(|e| ClientError::EncoderInitFailure(format!("sample rate: {:?}", e)))?;
        builder
            .set_brate(map_bitrate(bitrate_kbps)?)
            .map_err(|e| ClientError::EncoderInitFailure(format!("bitrate: {:?}", e)))?;
        builder
            .set_quality(Quality::Best)
            .map_err(|e| ClientError::EncoderInitFailure(format!("quality: {:?}", e)))?;

        let encoder = builder
            .build()
            .map_err(|e| ClientError::EncoderInitFailure(format!("build: {:?}", e)))?;

        Ok(Self { encoder })
    }

    fn encode_block(&mut self, samples: &[i16], out: &mut Vec<u8>) -> ClientResult<()> {
        out.reserve(mp3lame_encoder::max_required_buffer_size(samples.len()));
        let encoded = self
            .encoder
            .encode(MonoPcm(samples), out.spare_capacity_mut())
            .map_err(|e| ClientError::Internal(format!("MP3 encode failed: {:?}", e)))?;
        // SAFETY: encode() initialized exactly `encoded` bytes of the
        // reserved spare capacity
        unsafe {
            out.set_len(out.len() + encoded);
        }
        Ok(())
    }

    fn finish(&mut self, out: &mut Vec<u8>) -> ClientResult<()> {
        // LAME's documented upper bound for the final flush
        out.reserve(7200);
        let encoded = self
            .encoder
            .flush::<FlushNoGap>(out.spare_capacity_mut())
            .map_err(|e| ClientError::Internal(format!("MP3 flush failed: {:?}", e)))?;
        // SAFETY: flush() initialized exactly `encoded` bytes of the
        // reserved spare capacity
        unsafe {
            out.set_len(out.len() + encoded);
        }
        Ok(())
    }
}

/// The export artifact uses a fixed bitrate; LAME only accepts the standard
/// MPEG bitrates, so anything else is a configuration error surfaced at
/// encoder construction.
fn map_bitrate(kbps: u32) -> ClientResult<Birtate> {
    let bitrate = match kbps {
        8 => Birtate::Kbps8,
        16 => Birtate::Kbps16,
        24 => Birtate::Kbps24,
        32 => Birtate::Kbps32,
        48 => Birtate::Kbps48,
        64 => Birtate::Kbps64,
        96 => Birtate::Kbps96,
        128 => Birtate::Kbps128,
        160 => Birtate::Kbps160,
        192 => Birtate::Kbps192,
        256 => Birtate::Kbps256,
        320 => Birtate::Kbps320,
        other => {
            return Err(ClientError::EncoderInitFailure(format!(
                "unsupported MP3 bitrate: {} kbps",
                other
            )))
        }
    };
    Ok(bitrate)
}
