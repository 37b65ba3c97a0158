//! Voice model abstraction.
//!
//! The `VoiceModel` trait decouples the session from the external inference
//! service (style encoder, content tokenizer, generative decoder, vocoder).
//! Only the stub backend ships in-tree; real backends live outside the crate
//! and plug in through `ModelHandle`.
//!
//! `&mut self` on every call expresses that backends are stateful (device
//! buffers, caches). All mutation is serialised through `ModelHandle`'s
//! `parking_lot::Mutex`, so sessions sharing one handle take turns.

pub mod stub;

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, VoxError};

/// Rate every content/style call expects its audio at.
pub const ANALYSIS_SAMPLE_RATE: u32 = 16_000;

/// Mel spectrogram laid out frame-major: `data[frame * bins + bin]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Spectrogram {
    pub bins: usize,
    pub frames: usize,
    pub data: Vec<f32>,
}

impl Spectrogram {
    pub fn new(bins: usize, frames: usize, data: Vec<f32>) -> Result<Self> {
        if data.len() != bins * frames {
            return Err(VoxError::Model(format!(
                "spectrogram shape {bins}x{frames} does not match {} values",
                data.len()
            )));
        }
        Ok(Self { bins, frames, data })
    }

    pub fn frame(&self, idx: usize) -> &[f32] {
        &self.data[idx * self.bins..(idx + 1) * self.bins]
    }

    /// Remove the first `n` frames (the prompt region of a generated mel).
    pub fn drop_leading_frames(mut self, n: usize) -> Self {
        let n = n.min(self.frames);
        self.data.drain(..n * self.bins);
        self.frames -= n;
        self
    }
}

/// Frame-aligned conditioning sequence produced by length regulation.
#[derive(Debug, Clone, PartialEq)]
pub struct Conditioning {
    pub dim: usize,
    pub frames: usize,
    pub data: Vec<f32>,
}

impl Conditioning {
    /// Join two sequences along the time axis (`[self | other]`).
    pub fn concat(&self, other: &Conditioning) -> Result<Conditioning> {
        if self.dim != other.dim {
            return Err(VoxError::Model(format!(
                "conditioning dim mismatch: {} vs {}",
                self.dim, other.dim
            )));
        }
        let mut data = Vec::with_capacity(self.data.len() + other.data.len());
        data.extend_from_slice(&self.data);
        data.extend_from_slice(&other.data);
        Ok(Conditioning {
            dim: self.dim,
            frames: self.frames + other.frames,
            data,
        })
    }
}

/// Speaker style vector.
#[derive(Debug, Clone, PartialEq)]
pub struct StyleEmbedding(pub Vec<f32>);

/// Discrete content tokens at the content extractor's frame rate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentIndices(pub Vec<u32>);

impl ContentIndices {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Per-call generation knobs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GenerationParams {
    /// Iterative refinement steps of the generative decoder.
    pub fidelity_steps: u32,
    /// Classifier-free guidance rate in `[0, 1]`.
    pub cfg_rate: f32,
    pub convert_style: bool,
    pub f0_condition: bool,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            fidelity_steps: 10,
            cfg_rate: 0.7,
            convert_style: false,
            f0_condition: false,
        }
    }
}

impl GenerationParams {
    pub const MAX_FIDELITY_STEPS: u32 = 200;

    pub fn validate(&self) -> Result<()> {
        if !(1..=Self::MAX_FIDELITY_STEPS).contains(&self.fidelity_steps) {
            return Err(VoxError::Config(format!(
                "fidelity_steps must be in 1..={}, got {}",
                Self::MAX_FIDELITY_STEPS,
                self.fidelity_steps
            )));
        }
        if !(0.0..=1.0).contains(&self.cfg_rate) {
            return Err(VoxError::Config(format!(
                "cfg_rate must be in 0..=1, got {}",
                self.cfg_rate
            )));
        }
        Ok(())
    }
}

/// Compute device the backend runs on, reported by `/health`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AcceleratorInfo {
    pub available: bool,
    pub name: Option<String>,
}

/// Contract for voice conversion backends.
///
/// Every call is synchronous and fails with `VoxError::Model`; callers treat
/// failures as recoverable.
pub trait VoiceModel: Send + 'static {
    /// Native rate of `mel_spectrogram` input and `vocode` output.
    fn sample_rate(&self) -> u32;

    /// One-time warm-up: load weights and run a dummy pass. Called once at
    /// startup, before any session is primed.
    fn warm_up(&mut self) -> Result<()>;

    fn accelerator(&self) -> AcceleratorInfo;

    /// Mel spectrogram of native-rate audio.
    fn mel_spectrogram(&mut self, audio: &[f32]) -> Result<Spectrogram>;

    /// Speaker style from 16 kHz audio.
    fn compute_style(&mut self, audio_16k: &[f32]) -> Result<StyleEmbedding>;

    /// Content tokens from 16 kHz audio.
    fn extract_content_features(&mut self, audio_16k: &[f32]) -> Result<ContentIndices>;

    /// Stretch content tokens to exactly `target_frames` mel frames.
    fn length_regulate(
        &mut self,
        indices: &ContentIndices,
        target_frames: usize,
    ) -> Result<Conditioning>;

    /// Generate a mel spectrogram for `conditioning` in the voice of
    /// `target_style`, prompted by `target_mel`. The output has one frame per
    /// conditioning frame, prompt region included.
    fn generate(
        &mut self,
        conditioning: &Conditioning,
        target_style: &StyleEmbedding,
        target_mel: &Spectrogram,
        params: &GenerationParams,
    ) -> Result<Spectrogram>;

    /// Mel spectrogram to native-rate waveform.
    fn vocode(&mut self, mel: &Spectrogram) -> Result<Vec<f32>>;
}

/// Thread-safe reference-counted handle to any `VoiceModel` implementor.
///
/// `parking_lot::Mutex` does not poison, so one panicking session does not
/// take the model away from the others.
#[derive(Clone)]
pub struct ModelHandle(pub Arc<Mutex<dyn VoiceModel>>);

impl ModelHandle {
    /// Wrap any `VoiceModel` in a `ModelHandle`.
    pub fn new<M: VoiceModel>(model: M) -> Self {
        Self(Arc::new(Mutex::new(model)))
    }

    pub fn sample_rate(&self) -> u32 {
        self.0.lock().sample_rate()
    }

    pub fn accelerator(&self) -> AcceleratorInfo {
        self.0.lock().accelerator()
    }
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_leading_frames_removes_prompt_region() {
        let mel = Spectrogram::new(2, 4, vec![0., 0., 1., 1., 2., 2., 3., 3.]).unwrap();
        let tail = mel.drop_leading_frames(3);
        assert_eq!(tail.frames, 1);
        assert_eq!(tail.data, vec![3., 3.]);
        let mel = Spectrogram::new(1, 2, vec![0., 1.]).unwrap();
        assert_eq!(mel.drop_leading_frames(9).frames, 0);
    }

    #[test]
    fn spectrogram_rejects_bad_shape() {
        assert!(matches!(
            Spectrogram::new(80, 2, vec![0.0; 10]),
            Err(VoxError::Model(_))
        ));
    }

    #[test]
    fn concat_joins_on_time_axis() {
        let a = Conditioning { dim: 2, frames: 1, data: vec![1., 2.] };
        let b = Conditioning { dim: 2, frames: 2, data: vec![3., 4., 5., 6.] };
        let c = a.concat(&b).unwrap();
        assert_eq!(c.frames, 3);
        assert_eq!(c.data, vec![1., 2., 3., 4., 5., 6.]);

        let odd = Conditioning { dim: 3, frames: 0, data: vec![] };
        assert!(a.concat(&odd).is_err());
    }

    #[test]
    fn generation_params_bounds() {
        assert!(GenerationParams::default().validate().is_ok());
        let p = GenerationParams { fidelity_steps: 0, ..Default::default() };
        assert!(p.validate().is_err());
        let p = GenerationParams { fidelity_steps: 201, ..Default::default() };
        assert!(p.validate().is_err());
        let p = GenerationParams { cfg_rate: 1.5, ..Default::default() };
        assert!(p.validate().is_err());
    }
}
