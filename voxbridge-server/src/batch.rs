//! One-shot WAV-to-WAV conversion, shared by file mode and `POST /convert`.

use std::path::Path;
use std::time::{Duration, Instant};

use tracing::{info, warn};
use voxbridge_core::{
    open_sink, open_source, ConversionSession, EndpointDescriptor, ModelHandle, Result,
    SessionConfig, StatsSnapshot, VoxError,
};

/// Inputs of one file conversion.
#[derive(Debug, Clone, Copy)]
pub struct FileJob<'a> {
    pub reference: &'a Path,
    pub source: &'a Path,
    pub output: &'a Path,
}

/// Prime a fresh session from `job.reference`, stream `job.source` through it
/// into `job.output` and return the session stats. Blocks the calling thread.
pub fn convert_file(
    model: &ModelHandle,
    config: SessionConfig,
    job: FileJob<'_>,
    timeout: Duration,
    label: &str,
) -> Result<StatsSnapshot> {
    let started = Instant::now();
    let session = ConversionSession::with_label(model.clone(), config, label)?;
    session.prepare_reference_file(job.reference)?;

    let cfg = session.transport_config();
    let source = open_source(&EndpointDescriptor::file(job.source), &cfg)?;
    let sink = open_sink(&EndpointDescriptor::file(job.output), &cfg)?;
    session.start(source, sink)?;

    let finished = session.wait_finished(timeout);
    session.stop()?;
    if !finished {
        return Err(VoxError::Timeout {
            what: format!("conversion of {}", job.source.display()),
            after_ms: timeout.as_millis() as u64,
        });
    }

    let stats = session.stats();
    if let Some(err) = all_chunks_failed(&stats) {
        return Err(err);
    }
    if stats.error_count > 0 {
        warn!(
            label,
            errors = stats.error_count,
            passthrough = stats.passthrough_chunks,
            "conversion finished with recovered errors"
        );
    }
    info!(
        label,
        samples = stats.samples_out,
        chunks = stats.chunks_processed,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "file conversion done"
    );
    Ok(stats)
}

/// A run where the model failed on every chunk produced only pass-through
/// audio; report it as a model failure instead of a conversion.
pub fn all_chunks_failed(stats: &StatsSnapshot) -> Option<VoxError> {
    if stats.chunks_processed == 0 || stats.passthrough_chunks < stats.chunks_processed {
        return None;
    }
    let last = stats
        .recent_errors
        .last()
        .map(|e| e.message.clone())
        .unwrap_or_else(|| "unknown cause".into());
    Some(VoxError::Model(format!(
        "model failed on all {} chunks: {last}",
        stats.chunks_processed
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use voxbridge_core::audio::{load_wav_mono, write_wav_mono, ToneGenerator};
    use voxbridge_core::StubVoiceModel;

    fn write_tone(path: &Path, secs: f32, rate: u32) {
        let n = (secs * rate as f32) as usize;
        write_wav_mono(path, &ToneGenerator::new(200.0, 0.4, rate).next_block(n), rate).unwrap();
    }

    #[test]
    fn converts_a_file_with_the_stub_model() {
        let dir = tempfile::tempdir().unwrap();
        let reference = dir.path().join("ref.wav");
        let source = dir.path().join("src.wav");
        let output = dir.path().join("out.wav");
        write_tone(&reference, 2.0, 22_050);
        write_tone(&source, 1.0, 16_000);

        let model = ModelHandle::new(StubVoiceModel::new());
        let stats = convert_file(
            &model,
            SessionConfig::default(),
            FileJob {
                reference: &reference,
                source: &source,
                output: &output,
            },
            Duration::from_secs(30),
            "test",
        )
        .unwrap();
        assert_eq!(stats.error_count, 0);
        let out = load_wav_mono(&output).unwrap();
        assert_eq!(out.samples.len() as u64, stats.samples_out);
    }

    #[test]
    fn every_chunk_failing_is_a_model_error() {
        let dir = tempfile::tempdir().unwrap();
        let reference = dir.path().join("ref.wav");
        let source = dir.path().join("src.wav");
        write_tone(&reference, 2.0, 22_050);
        write_tone(&source, 0.5, 22_050);

        let model = ModelHandle::new(StubVoiceModel::new().failing_generation());
        let err = convert_file(
            &model,
            SessionConfig::default(),
            FileJob {
                reference: &reference,
                source: &source,
                output: &dir.path().join("out.wav"),
            },
            Duration::from_secs(30),
            "test",
        )
        .unwrap_err();
        assert_eq!(err.kind(), "model_error");
    }

    #[test]
    fn missing_reference_is_a_reference_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("src.wav");
        write_tone(&source, 0.5, 22_050);
        let err = convert_file(
            &ModelHandle::new(StubVoiceModel::new()),
            SessionConfig::default(),
            FileJob {
                reference: &dir.path().join("nope.wav"),
                source: &source,
                output: &dir.path().join("out.wav"),
            },
            Duration::from_secs(5),
            "test",
        )
        .unwrap_err();
        assert_eq!(err.kind(), "reference_error");
    }
}
