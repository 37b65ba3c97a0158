//! Sample-level audio helpers shared by endpoints and the session.
//!
//! - WAV decoding to mono f32 (`load_wav_mono`)
//! - interleaved → mono downmix
//! - a phase-continuous sine generator for synthetic sources
//! - sample-rate conversion (`resample`)
//! - device enumeration (`device`)

pub mod device;
pub mod resample;

use std::path::Path;

use hound::{SampleFormat, WavReader};

use crate::buffering::chunk::AudioChunk;
use crate::error::{Result, VoxError};

/// Average interleaved frames down to mono.
pub fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Convert a signed integer sample of `bits` width to f32 in [-1.0, 1.0].
pub fn int_to_f32(sample: i32, bits: u16) -> f32 {
    let scale = (1i64 << (bits.clamp(1, 32) - 1)) as f32;
    sample as f32 / scale
}

/// Decode a whole WAV file to mono f32 at its native rate.
///
/// # Errors
/// `VoxError::Io` if the file cannot be opened, `VoxError::Transport` if it is
/// not a decodable WAV.
pub fn load_wav_mono(path: &Path) -> Result<AudioChunk> {
    let reader = WavReader::open(path)?;
    let spec = reader.spec();
    let interleaved = read_all_samples(reader)?;
    let samples = downmix(&interleaved, spec.channels as usize);
    Ok(AudioChunk::new(samples, spec.sample_rate))
}

fn read_all_samples<R: std::io::Read>(mut reader: WavReader<R>) -> Result<Vec<f32>> {
    wav_samples(&mut reader)
        .map(|s| s.map_err(VoxError::from))
        .collect()
}

/// Interleaved samples of any WAV encoding as f32.
pub(crate) fn wav_samples<'a, R: std::io::Read + 'a>(
    reader: &'a mut WavReader<R>,
) -> Box<dyn Iterator<Item = hound::Result<f32>> + 'a> {
    let spec = reader.spec();
    match spec.sample_format {
        SampleFormat::Float => Box::new(reader.samples::<f32>()),
        SampleFormat::Int => {
            let bits = spec.bits_per_sample;
            Box::new(
                reader
                    .samples::<i32>()
                    .map(move |s| s.map(|v| int_to_f32(v, bits))),
            )
        }
    }
}

/// Write mono f32 samples as a 32-bit float WAV.
pub fn write_wav_mono(path: &Path, samples: &[f32], sample_rate: u32) -> Result<()> {
    let mut writer = hound::WavWriter::create(path, float_wav_spec(sample_rate))?;
    for s in samples {
        writer.write_sample(*s)?;
    }
    writer.finalize()?;
    Ok(())
}

pub(crate) fn float_wav_spec(sample_rate: u32) -> hound::WavSpec {
    hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 32,
        sample_format: SampleFormat::Float,
    }
}

/// Phase-continuous sine generator.
#[derive(Debug, Clone)]
pub struct ToneGenerator {
    frequency: f32,
    amplitude: f32,
    sample_rate: u32,
    index: u64,
}

impl ToneGenerator {
    pub fn new(frequency: f32, amplitude: f32, sample_rate: u32) -> Self {
        Self {
            frequency,
            amplitude,
            sample_rate,
            index: 0,
        }
    }

    /// Value of the `i`-th sample of this tone; used by tests to rebuild input.
    pub fn sample_at(&self, i: u64) -> f32 {
        let t = i as f64 / self.sample_rate as f64;
        (self.amplitude as f64 * (2.0 * std::f64::consts::PI * self.frequency as f64 * t).sin())
            as f32
    }

    /// Produce the next `n` samples.
    pub fn next_block(&mut self, n: usize) -> Vec<f32> {
        let start = self.index;
        self.index += n as u64;
        (start..start + n as u64).map(|i| self.sample_at(i)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn downmix_averages_frames() {
        let stereo = [1.0, 0.0, 0.5, 0.5, -1.0, 1.0];
        assert_eq!(downmix(&stereo, 2), vec![0.5, 0.5, 0.0]);
        assert_eq!(downmix(&stereo, 1), stereo.to_vec());
    }

    #[test]
    fn int_scaling_matches_bit_depth() {
        assert_abs_diff_eq!(int_to_f32(-32_768, 16), -1.0);
        assert_abs_diff_eq!(int_to_f32(16_384, 16), 0.5);
        assert_abs_diff_eq!(int_to_f32(-128, 8), -1.0);
    }

    #[test]
    fn tone_blocks_are_phase_continuous() {
        let mut gen = ToneGenerator::new(440.0, 0.5, 22_050);
        let a = gen.next_block(100);
        let b = gen.next_block(100);
        let reference = ToneGenerator::new(440.0, 0.5, 22_050);
        for (i, s) in a.iter().chain(b.iter()).enumerate() {
            assert_abs_diff_eq!(*s, reference.sample_at(i as u64), epsilon = 1e-7);
        }
    }

    #[test]
    fn wav_round_trip_preserves_float_samples() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        let samples = ToneGenerator::new(220.0, 0.5, 16_000).next_block(1_600);
        write_wav_mono(&path, &samples, 16_000).unwrap();

        let loaded = load_wav_mono(&path).unwrap();
        assert_eq!(loaded.sample_rate, 16_000);
        assert_eq!(loaded.samples, samples);
    }

    #[test]
    fn stereo_int16_wav_is_downmixed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 8_000,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut w = hound::WavWriter::create(&path, spec).unwrap();
        for _ in 0..10 {
            w.write_sample(16_384i16).unwrap();
            w.write_sample(0i16).unwrap();
        }
        w.finalize().unwrap();

        let loaded = load_wav_mono(&path).unwrap();
        assert_eq!(loaded.samples.len(), 10);
        assert_abs_diff_eq!(loaded.samples[0], 0.25);
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = load_wav_mono(Path::new("/definitely/not/here.wav")).unwrap_err();
        assert!(matches!(err, VoxError::Io(_)), "got {err:?}");
    }
}
