//! `StubVoiceModel`: deterministic placeholder backend with no real inference.
//!
//! Keeps the shapes of a real backend (hop-sized mel frames, 20 ms content
//! tokens at 16 kHz, nearest-neighbour length regulation) so the whole session
//! can be exercised end to end. Output loudness follows the input's energy
//! envelope, so converted audio is recognisably "the same utterance".

use tracing::debug;

use crate::error::{Result, VoxError};
use crate::inference::{
    AcceleratorInfo, Conditioning, ContentIndices, GenerationParams, Spectrogram,
    StyleEmbedding, VoiceModel,
};

const MEL_BINS: usize = 80;
const COND_DIM: usize = 16;
const STYLE_DIM: usize = 192;
const CODEBOOK: u32 = 1_024;
/// 20 ms at 16 kHz.
const CONTENT_HOP: usize = 320;
const VOICE_HZ: f32 = 220.0;

/// Echo-style stub model.
pub struct StubVoiceModel {
    sample_rate: u32,
    hop: usize,
    fail_generation: bool,
    calls: u64,
    analysed_samples: u64,
}

impl StubVoiceModel {
    pub fn new() -> Self {
        Self {
            sample_rate: 22_050,
            hop: 256,
            fail_generation: false,
            calls: 0,
            analysed_samples: 0,
        }
    }

    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate.max(1);
        self
    }

    /// Make every `generate` call fail with `VoxError::Model`. Reference
    /// preparation still succeeds, which is what fault-injection tests need.
    pub fn failing_generation(mut self) -> Self {
        self.fail_generation = true;
        self
    }

    /// Number of model calls served so far.
    pub fn calls(&self) -> u64 {
        self.calls
    }

    /// Native-rate samples passed to `mel_spectrogram` so far.
    pub fn analysed_samples(&self) -> u64 {
        self.analysed_samples
    }
}

impl Default for StubVoiceModel {
    fn default() -> Self {
        Self::new()
    }
}

fn rms(block: &[f32]) -> f32 {
    if block.is_empty() {
        return 0.0;
    }
    (block.iter().map(|s| s * s).sum::<f32>() / block.len() as f32).sqrt()
}

impl VoiceModel for StubVoiceModel {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn warm_up(&mut self) -> Result<()> {
        debug!("StubVoiceModel::warm_up: no-op");
        Ok(())
    }

    fn accelerator(&self) -> AcceleratorInfo {
        AcceleratorInfo {
            available: false,
            name: None,
        }
    }

    fn mel_spectrogram(&mut self, audio: &[f32]) -> Result<Spectrogram> {
        self.calls += 1;
        self.analysed_samples += audio.len() as u64;
        let frames = audio.len().div_ceil(self.hop).max(1);
        let mut data = Vec::with_capacity(frames * MEL_BINS);
        for f in 0..frames {
            let start = (f * self.hop).min(audio.len());
            let end = (start + self.hop).min(audio.len());
            let energy = rms(&audio[start..end]);
            data.extend(std::iter::repeat(energy).take(MEL_BINS));
        }
        Spectrogram::new(MEL_BINS, frames, data)
    }

    fn compute_style(&mut self, audio_16k: &[f32]) -> Result<StyleEmbedding> {
        self.calls += 1;
        if audio_16k.is_empty() {
            return Err(VoxError::Model("cannot compute style of empty audio".into()));
        }
        let energy = rms(audio_16k);
        let crossings = audio_16k
            .windows(2)
            .filter(|w| (w[0] >= 0.0) != (w[1] >= 0.0))
            .count() as f32
            / audio_16k.len() as f32;
        let style = (0..STYLE_DIM)
            .map(|i| if i % 2 == 0 { energy } else { crossings })
            .collect();
        Ok(StyleEmbedding(style))
    }

    fn extract_content_features(&mut self, audio_16k: &[f32]) -> Result<ContentIndices> {
        self.calls += 1;
        let indices = audio_16k
            .chunks(CONTENT_HOP)
            .map(|block| ((rms(block).clamp(0.0, 1.0) * (CODEBOOK - 1) as f32).round()) as u32)
            .collect::<Vec<_>>();
        Ok(ContentIndices(indices))
    }

    fn length_regulate(
        &mut self,
        indices: &ContentIndices,
        target_frames: usize,
    ) -> Result<Conditioning> {
        self.calls += 1;
        if indices.is_empty() {
            return Err(VoxError::Model("no content indices to regulate".into()));
        }
        let n = indices.len();
        let mut data = Vec::with_capacity(target_frames * COND_DIM);
        for f in 0..target_frames {
            let src = (f * n / target_frames.max(1)).min(n - 1);
            let level = indices.0[src] as f32 / (CODEBOOK - 1) as f32;
            data.extend(std::iter::repeat(level).take(COND_DIM));
        }
        Ok(Conditioning {
            dim: COND_DIM,
            frames: target_frames,
            data,
        })
    }

    fn generate(
        &mut self,
        conditioning: &Conditioning,
        target_style: &StyleEmbedding,
        target_mel: &Spectrogram,
        params: &GenerationParams,
    ) -> Result<Spectrogram> {
        self.calls += 1;
        if self.fail_generation {
            return Err(VoxError::Model("injected generation failure".into()));
        }
        if params.fidelity_steps == 0 {
            return Err(VoxError::Model("fidelity_steps must be positive".into()));
        }
        if conditioning.dim == 0 || conditioning.data.len() != conditioning.dim * conditioning.frames {
            return Err(VoxError::Model("malformed conditioning".into()));
        }
        let bins = target_mel.bins.max(1);
        let timbre = if params.convert_style {
            target_style.0.first().copied().unwrap_or(0.0)
        } else {
            0.0
        };
        let mut data = Vec::with_capacity(conditioning.frames * bins);
        for f in 0..conditioning.frames {
            let level = conditioning.data[f * conditioning.dim];
            let shaped = level * (1.0 - 0.1 * params.cfg_rate) + 0.1 * params.cfg_rate * timbre;
            data.extend(std::iter::repeat(shaped).take(bins));
        }
        Spectrogram::new(bins, conditioning.frames, data)
    }

    fn vocode(&mut self, mel: &Spectrogram) -> Result<Vec<f32>> {
        self.calls += 1;
        let step = std::f32::consts::TAU * VOICE_HZ / self.sample_rate as f32;
        let mut out = Vec::with_capacity(mel.frames * self.hop);
        for f in 0..mel.frames {
            let amp = mel.frame(f).first().copied().unwrap_or(0.0).clamp(0.0, 1.0);
            for i in 0..self.hop {
                let n = (f * self.hop + i) as f32;
                out.push(amp * (step * n).sin());
            }
        }
        Ok(out)
    }
}
