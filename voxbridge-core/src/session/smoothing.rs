//! Boundary smoothing between consecutive converted chunks.
//!
//! Each converted chunk is generated independently, so its first samples do
//! not line up with the last samples of the previous chunk. The last `V`
//! samples of output `k-1` are held back and blended into the first `V`
//! samples of output `k`:
//!
//! ```text
//! output k-1: ........[tail V]
//! output k:           [head V][ body ...... ][tail V]
//! emitted:            [ fade  ][ body ...... ]        (tail retained)
//! ```
//!
//! Every boundary overlaps by `V` samples, so the stitched stream is shorter
//! than the sum of the outputs. When the session carries `V` samples of input
//! context in front of each chunk, head `k` covers the same time span as tail
//! `k-1` and the stream keeps the input's length. Everything held back is
//! released by `flush`.

use serde::{Deserialize, Serialize};

/// Shape of the fade-in ramp applied to the new head (the retained tail gets
/// the complement, so the two weights always sum to 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FadeCurve {
    Linear,
    /// Raised-cosine ramp.
    #[default]
    Cosine,
}

impl std::str::FromStr for FadeCurve {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "linear" => Ok(FadeCurve::Linear),
            "cosine" | "cos" => Ok(FadeCurve::Cosine),
            other => Err(format!("unknown fade curve '{other}'")),
        }
    }
}

/// Weight of the incoming head at position `i` of an `n`-sample overlap.
pub fn fade_in_weight(curve: FadeCurve, i: usize, n: usize) -> f32 {
    if n <= 1 {
        return 0.5;
    }
    let t = i as f32 / (n - 1) as f32;
    match curve {
        FadeCurve::Linear => t,
        FadeCurve::Cosine => 0.5 - 0.5 * (std::f32::consts::PI * t).cos(),
    }
}

/// Blend `tail` (fading out) into `head` (fading in) over `min(len)` samples.
pub fn crossfade(tail: &[f32], head: &[f32], curve: FadeCurve) -> Vec<f32> {
    let n = tail.len().min(head.len());
    (0..n)
        .map(|i| {
            let w = fade_in_weight(curve, i, n);
            tail[i] * (1.0 - w) + head[i] * w
        })
        .collect()
}

/// Stateful overlap-add stitcher for one session.
#[derive(Debug)]
pub struct Crossfader {
    overlap: usize,
    curve: FadeCurve,
    tail: Vec<f32>,
}

impl Crossfader {
    pub fn new(overlap: usize, curve: FadeCurve) -> Self {
        Self {
            overlap,
            curve,
            tail: Vec::with_capacity(overlap),
        }
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    /// Samples currently held back. With input context carried, the next
    /// chunk's context must be exactly this long.
    pub fn pending(&self) -> usize {
        self.tail.len()
    }

    /// Stitch one converted chunk into the stream and return what can be
    /// emitted now.
    ///
    /// When a tail is pending, the first `pending()` samples of `output` are
    /// taken as its overlapping head.
    pub fn process(&mut self, output: &[f32]) -> Vec<f32> {
        if self.overlap == 0 {
            return output.to_vec();
        }
        let mut emitted = Vec::with_capacity(output.len());
        let mut body = output;

        if !self.tail.is_empty() {
            let n = self.tail.len().min(output.len());
            emitted.extend(crossfade(&self.tail[..n], &output[..n], self.curve));
            // Output shorter than the overlap: the uncovered tail goes out as-is.
            emitted.extend_from_slice(&self.tail[n..]);
            body = &output[n..];
            self.tail.clear();
        }

        let keep = self.overlap.min(body.len());
        let split = body.len() - keep;
        emitted.extend_from_slice(&body[..split]);
        self.tail.extend_from_slice(&body[split..]);
        emitted
    }

    /// Release the retained tail unchanged.
    pub fn flush(&mut self) -> Vec<f32> {
        std::mem::take(&mut self.tail)
    }
}
