//! Audio sample-rate conversion using a rubato `FastFixedIn` resampler.
//!
//! ## Design
//!
//! Endpoints deliver audio at file/device/stream rates (commonly 44.1 or
//! 48 kHz); the session works at the model's native rate and additionally
//! needs 16 kHz for content and style analysis. `RateConverter` bridges those
//! on non-RT threads, where allocation is allowed.
//!
//! When source rate == target rate, `RateConverter` is a passthrough and no
//! rubato session is created at all.
//!
//! ## Usage
//!
//! ```ignore
//! let mut rc = RateConverter::new(48_000, 22_050, 960)?;
//! let mut out = rc.process(&frame);   // streaming, may be empty
//! out.extend(rc.finish());            // end of stream: flush the remainder
//! ```

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::error;

use crate::error::{Result, VoxError};

/// Converts f32 mono audio from one fixed sample rate to another.
pub struct RateConverter {
    /// `None` when source rate == target rate (passthrough mode).
    resampler: Option<FastFixedIn<f32>>,
    /// Partial input chunks carried between calls.
    input_buf: Vec<f32>,
    /// How many input samples rubato expects per process call.
    chunk_size: usize,
    /// Pre-allocated output buffer: `[1][output_frames_max]`.
    output_buf: Vec<Vec<f32>>,
    ratio: f64,
}

impl RateConverter {
    /// Create a new converter.
    ///
    /// # Parameters
    /// - `from_rate`: Sample rate of the incoming audio (Hz).
    /// - `to_rate`: Sample rate to produce (Hz).
    /// - `chunk_size`: Input frame count per rubato call (e.g. `960`).
    ///
    /// # Errors
    /// Returns `VoxError::Config` for zero rates or if rubato fails to initialise.
    pub fn new(from_rate: u32, to_rate: u32, chunk_size: usize) -> Result<Self> {
        if from_rate == 0 || to_rate == 0 {
            return Err(VoxError::Config(format!(
                "invalid resample rates {from_rate} -> {to_rate}"
            )));
        }
        let chunk_size = chunk_size.max(1);
        let ratio = to_rate as f64 / from_rate as f64;

        if from_rate == to_rate {
            return Ok(Self {
                resampler: None,
                input_buf: Vec::new(),
                chunk_size,
                output_buf: Vec::new(),
                ratio,
            });
        }

        let resampler = FastFixedIn::<f32>::new(
            ratio,
            1.0, // fixed ratio
            PolynomialDegree::Cubic,
            chunk_size,
            1, // mono
        )
        .map_err(|e| VoxError::Config(format!("resampler init: {e}")))?;

        let max_out = resampler.output_frames_max();
        let output_buf = vec![vec![0f32; max_out]; 1];

        tracing::debug!(from_rate, to_rate, chunk_size, max_out, "resampler created");

        Ok(Self {
            resampler: Some(resampler),
            input_buf: Vec::new(),
            chunk_size,
            output_buf,
            ratio,
        })
    }

    /// Process incoming samples, returning resampled output (may be empty).
    ///
    /// Samples are accumulated internally until a full `chunk_size` block is
    /// available for rubato. Any remainder is kept for the next call.
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(ref mut resampler) = self.resampler else {
            return samples.to_vec();
        };

        self.input_buf.extend_from_slice(samples);

        let mut result = Vec::new();

        while self.input_buf.len() >= self.chunk_size {
            let input_slice = &self.input_buf[..self.chunk_size];

            match resampler.process_into_buffer(&[input_slice], &mut self.output_buf, None) {
                Ok((_consumed, produced)) => {
                    result.extend_from_slice(&self.output_buf[0][..produced]);
                }
                Err(e) => {
                    error!("resampler process error: {e}");
                }
            }

            self.input_buf.drain(..self.chunk_size);
        }

        result
    }

    /// Flush the partial block still held internally (end of stream).
    ///
    /// rubato zero-pads the final block; the padding's output is cut so the
    /// result is proportional to the real input.
    pub fn finish(&mut self) -> Vec<f32> {
        let Some(ref mut resampler) = self.resampler else {
            return Vec::new();
        };
        if self.input_buf.is_empty() {
            return Vec::new();
        }

        let pending = self.input_buf.len();
        let expected = (pending as f64 * self.ratio).round() as usize;
        let input_slice = &self.input_buf[..];
        let out = match resampler.process_partial_into_buffer(
            Some(&[input_slice][..]),
            &mut self.output_buf,
            None,
        ) {
            Ok((_consumed, produced)) => self.output_buf[0][..produced.min(expected)].to_vec(),
            Err(e) => {
                error!("resampler flush error: {e}");
                Vec::new()
            }
        };
        self.input_buf.clear();
        out
    }

    /// Returns `true` when source rate == target rate (no resampling occurs).
    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }

    /// Output/input rate ratio.
    pub fn ratio(&self) -> f64 {
        self.ratio
    }
}

/// Resample a whole buffer in one go.
///
/// The result length is exactly `round(len * to / from)`.
pub fn resample_all(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    if from_rate == to_rate {
        return Ok(samples.to_vec());
    }
    let mut rc = RateConverter::new(from_rate, to_rate, 1_024)?;
    let target_len = (samples.len() as f64 * rc.ratio()).round() as usize;
    let mut out = rc.process(samples);
    out.extend(rc.finish());
    out.resize(target_len, 0.0);
    Ok(out)
}
