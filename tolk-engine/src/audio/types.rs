//! Core audio data types
//!
//! Frames are mono f32 at the capture device rate; everything past the
//! conditioner is 24 kHz PCM16 little-endian, matching the wire format.

/// Samples per capture frame
pub const FRAME_SAMPLES: usize = 128;

/// One capture frame: 128 mono f32 samples tagged with a monotonic
/// capture-clock timestamp.
///
/// Frames are ephemeral: they live from the device callback to the
/// segmenter's scratch buffer and are never stored beyond the pipeline.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// PCM samples, -1.0 to 1.0
    pub samples: [f32; FRAME_SAMPLES],
    /// Capture-clock timestamp of the first sample, nanoseconds
    pub timestamp_ns: u64,
}

impl AudioFrame {
    /// Create a silent frame
    pub fn silent(timestamp_ns: u64) -> Self {
        Self {
            samples: [0.0; FRAME_SAMPLES],
            timestamp_ns,
        }
    }

    /// Create a frame from a slice; panics if the slice is not frame-sized
    pub fn from_slice(samples: &[f32], timestamp_ns: u64) -> Self {
        let mut frame = Self::silent(timestamp_ns);
        frame.samples.copy_from_slice(samples);
        frame
    }

    /// Root-mean-square energy of the frame
    pub fn rms(&self) -> f32 {
        let sum_sq: f32 = self.samples.iter().map(|s| s * s).sum();
        (sum_sq / FRAME_SAMPLES as f32).sqrt()
    }
}

/// Convert f32 samples to PCM16 little-endian bytes
pub fn pcm16_from_f32(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        let v = (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Convert PCM16 little-endian bytes to f32 samples.
///
/// A trailing odd byte is ignored.
pub fn pcm16_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| {
            let v = i16::from_le_bytes([pair[0], pair[1]]);
            v as f32 / i16::MAX as f32
        })
        .collect()
}
