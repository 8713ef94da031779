//! Audio pipeline: slin16 format handling, codec utilities, energy VAD,
//! bounded buffers, and the per-session processing pipeline.
//!
//! Everything crossing component boundaries is slin16: 16-bit signed
//! little-endian PCM, mono, 16 kHz. Frames are 320 samples (20 ms) unless a
//! caller explicitly resamples.

pub mod buffer;
pub mod codec;
pub mod pipeline;
pub mod vad;

pub use buffer::AudioBuffer;
pub use codec::{compute_rms_energy, resample, scale_gain};
pub use pipeline::{AudioPipeline, PipelineEvent};
pub use vad::{VadResult, VoiceActivityDetector};

use crate::config::AudioSettings;

/// Bytes per sample for slin16 (16-bit mono).
pub const SAMPLE_WIDTH: usize = 2;

/// Canonical sample rate for the pipeline.
pub const SAMPLE_RATE: u32 = 16000;

/// Bytes of slin16 audio per millisecond.
pub const BYTES_PER_MS: usize = (SAMPLE_RATE as usize * SAMPLE_WIDTH) / 1000;

impl AudioSettings {
    /// Frame size in bytes (chunk_size samples).
    pub fn chunk_bytes(&self) -> usize {
        self.chunk_size * SAMPLE_WIDTH
    }

    /// Buffer capacity in bytes.
    pub fn buffer_bytes(&self) -> usize {
        self.buffer_size * SAMPLE_WIDTH
    }

    /// Duration of `len` bytes of audio at the configured rate.
    pub fn duration_secs(&self, len: usize) -> f64 {
        len as f64 / (self.sample_rate as f64 * SAMPLE_WIDTH as f64)
    }
}

/// Zero-filled slin16 audio of exactly `duration_ms` milliseconds.
pub fn make_silence(duration_ms: u64) -> Vec<u8> {
    vec![0u8; duration_ms as usize * BYTES_PER_MS]
}

/// Check that `frame` is well-formed slin16: length a multiple of the sample
/// size and, when a duration is claimed, exactly that many bytes.
pub fn validate_format(frame: &[u8], expected_duration_ms: Option<u64>) -> bool {
    if frame.len() % SAMPLE_WIDTH != 0 {
        return false;
    }
    match expected_duration_ms {
        Some(ms) => frame.len() == ms as usize * BYTES_PER_MS,
        None => true,
    }
}

/// Decode an slin16 byte frame into samples. Trailing odd bytes are ignored.
pub fn bytes_to_samples(frame: &[u8]) -> Vec<i16> {
    frame
        .chunks_exact(SAMPLE_WIDTH)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Encode samples back into slin16 bytes.
pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * SAMPLE_WIDTH);
    for sample in samples {
        out.extend_from_slice(&sample.to_le_bytes());
    }
    out
}
