//! Streaming sample-rate conversion using rubato
//!
//! Capture runs at whatever rate the device delivers (typically 48 kHz);
//! the rest of the pipeline is fixed at 24 kHz mono. One resampler
//! instance lives for the whole session so filter state carries across
//! chunks and no phase discontinuities appear at chunk boundaries.

use crate::error::{EngineError, Result};
use rubato::{FastFixedIn, PolynomialDegree, Resampler as RubatoResampler};
use tracing::debug;

/// Input chunk size fed to rubato; small enough to add little latency,
/// large enough to amortize the call.
const CHUNK_FRAMES: usize = 256;

/// Stateful mono resampler that accepts arbitrary-sized input slices and
/// emits whatever output is ready.
pub enum StreamResampler {
    /// Input rate equals output rate; samples pass through untouched
    PassThrough,

    /// Active conversion with maintained filter state
    Active {
        resampler: FastFixedIn<f32>,
        /// Input samples waiting to fill the next fixed-size chunk
        pending: Vec<f32>,
        /// Scratch for rubato's planar input
        input_frame: Vec<Vec<f32>>,
    },
}

impl StreamResampler {
    /// Create a resampler from `input_rate` to `output_rate` (mono).
    pub fn new(input_rate: u32, output_rate: u32) -> Result<Self> {
        if input_rate == output_rate {
            debug!("Creating pass-through resampler ({}Hz)", input_rate);
            return Ok(Self::PassThrough);
        }

        let ratio = output_rate as f64 / input_rate as f64;
        debug!(
            "Creating stream resampler: {}Hz -> {}Hz (ratio {:.4})",
            input_rate, output_rate, ratio
        );
        let resampler =
            FastFixedIn::<f32>::new(ratio, 1.0, PolynomialDegree::Cubic, CHUNK_FRAMES, 1)
                .map_err(|e| EngineError::Device(format!("resampler init failed: {e}")))?;

        Ok(Self::Active {
            resampler,
            pending: Vec::with_capacity(CHUNK_FRAMES * 2),
            input_frame: vec![vec![0.0; CHUNK_FRAMES]],
        })
    }

    /// Feed input samples; returns all output samples that became ready.
    ///
    /// Output length varies call to call because input is buffered into
    /// fixed-size chunks internally.
    pub fn push(&mut self, input: &[f32]) -> Result<Vec<f32>> {
        match self {
            Self::PassThrough => Ok(input.to_vec()),
            Self::Active {
                resampler,
                pending,
                input_frame,
            } => {
                pending.extend_from_slice(input);

                let mut output = Vec::new();
                while pending.len() >= CHUNK_FRAMES {
                    input_frame[0].clear();
                    input_frame[0].extend(pending.drain(..CHUNK_FRAMES));

                    let planar = resampler
                        .process(input_frame, None)
                        .map_err(|e| EngineError::Device(format!("resampling failed: {e}")))?;
                    output.extend_from_slice(&planar[0]);
                }
                Ok(output)
            }
        }
    }

    /// Check if this resampler is in pass-through mode
    pub fn is_pass_through(&self) -> bool {
        matches!(self, Self::PassThrough)
    }
}
