//! `ConversionSession`: top-level lifecycle controller for one stream.
//!
//! ## Lifecycle
//!
//! ```text
//! ConversionSession::new()            state = Idle
//!     └─► prepare_reference()         prime cached, state = Primed
//!         └─► start(source, sink)     rings + endpoints + chunk loop, state = Streaming
//!             ├─► end of stream       chunk loop exits, state = Stopped
//!             └─► stop()              loop joined, endpoints released, state = Stopped
//! ```
//!
//! `Stopped` is terminal. `stop()` in `Idle`/`Primed` is a no-op; `start()`
//! outside `Primed` returns `VoxError::InvalidState`. A session whose loop
//! ended on its own still holds its source until `stop()` (or drop).
//!
//! ## Threading
//!
//! The chunk loop owns the sink and runs on its own thread; the session keeps
//! the source so `stop()` can release it. The state cell is shared with the
//! loop, and `stop()` never holds it while joining. All methods take `&self`, so a
//! session can be shared behind an `Arc` between a controller and observers
//! (health checks, stats loggers).

pub mod chunk_loop;
pub mod smoothing;
pub mod stats;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn, Span};

use crate::audio::{load_wav_mono, resample::resample_all};
use crate::buffering::{chunk::AudioChunk, RingBuffer};
use crate::error::{Result, VoxError};
use crate::inference::{
    Conditioning, GenerationParams, ModelHandle, Spectrogram, StyleEmbedding,
    ANALYSIS_SAMPLE_RATE,
};
use crate::transport::worker::Worker;
use crate::transport::{event_channel, AudioSink, AudioSource, TransportConfig};

pub use smoothing::{Crossfader, FadeCurve};
pub use stats::{SessionStats, StatsSnapshot};

/// Tuning for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionConfig {
    /// Duration of one inference unit.
    pub chunk_ms: u32,
    /// Cross-fade length between consecutive chunks. 0 disables smoothing.
    pub overlap_ms: u32,
    pub fade_curve: FadeCurve,
    /// Feed the model the last `overlap` input samples of the previous chunk
    /// in front of each chunk, so the stitched stream keeps the input length.
    /// Off: each chunk is generated from its own samples and every boundary
    /// overlaps by `overlap` samples.
    pub carry_context: bool,
    /// Capacity of the input and output rings.
    pub ring_seconds: f32,
    pub params: GenerationParams,
    pub min_reference_secs: f32,
    /// Longer reference clips are truncated to this.
    pub max_reference_secs: f32,
    /// Deadline for each bounded wait in `stop()`.
    pub shutdown_timeout_ms: u64,
    /// Depth of the endpoint event channel.
    pub fault_queue_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            chunk_ms: 180,
            overlap_ms: 20,
            fade_curve: FadeCurve::default(),
            carry_context: false,
            ring_seconds: 10.0,
            params: GenerationParams::default(),
            min_reference_secs: 0.5,
            max_reference_secs: 25.0,
            shutdown_timeout_ms: 3_000,
            fault_queue_capacity: 64,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<()> {
        if !(20..=5_000).contains(&self.chunk_ms) {
            return Err(VoxError::Config(format!(
                "chunk_ms must be in 20..=5000, got {}",
                self.chunk_ms
            )));
        }
        if self.overlap_ms >= self.chunk_ms {
            return Err(VoxError::Config(format!(
                "overlap_ms ({}) must be shorter than chunk_ms ({})",
                self.overlap_ms, self.chunk_ms
            )));
        }
        // Room for one chunk plus its context, twice over.
        let min_ring_ms = 2 * (self.chunk_ms + self.overlap_ms);
        if !(self.ring_seconds.is_finite() && self.ring_seconds * 1_000.0 >= min_ring_ms as f32) {
            return Err(VoxError::Config(format!(
                "ring_seconds {} too small for {} ms chunks",
                self.ring_seconds, self.chunk_ms
            )));
        }
        self.params.validate()?;
        if !(self.min_reference_secs > 0.0 && self.max_reference_secs >= self.min_reference_secs) {
            return Err(VoxError::Config(format!(
                "reference bounds {}..{} s are invalid",
                self.min_reference_secs, self.max_reference_secs
            )));
        }
        if self.fault_queue_capacity == 0 {
            return Err(VoxError::Config("fault_queue_capacity must be positive".into()));
        }
        Ok(())
    }

    pub fn chunk_samples(&self, sample_rate: u32) -> usize {
        ms_to_samples(self.chunk_ms, sample_rate).max(1)
    }

    pub fn overlap_samples(&self, sample_rate: u32) -> usize {
        ms_to_samples(self.overlap_ms, sample_rate)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

fn ms_to_samples(ms: u32, sample_rate: u32) -> usize {
    (sample_rate as u64 * ms as u64 / 1_000) as usize
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Primed,
    Streaming,
    Stopped,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Primed => "primed",
            SessionState::Streaming => "streaming",
            SessionState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Everything derived from the target-voice clip, computed once and shared
/// read-only with the chunk loop.
#[derive(Debug)]
pub(crate) struct ReferencePrime {
    pub style: StyleEmbedding,
    pub target_mel: Spectrogram,
    /// Frames of `target_mel`; this many leading frames are dropped from
    /// every generated spectrogram.
    pub target_mel_len: usize,
    /// Reference content tokens regulated to `target_mel_len` frames.
    pub prompt: Conditioning,
    pub duration_secs: f64,
}

/// Live resources of a streaming session.
struct Running {
    chunk_loop: Worker,
    source: Box<dyn AudioSource>,
    input: Arc<RingBuffer>,
}

pub struct ConversionSession {
    config: SessionConfig,
    model: ModelHandle,
    sample_rate: u32,
    state: Arc<Mutex<SessionState>>,
    prime: Mutex<Option<Arc<ReferencePrime>>>,
    running: Mutex<Option<Running>>,
    stats: Arc<SessionStats>,
    span: Span,
}

impl ConversionSession {
    /// Create an idle session. Validates `config`; touches no I/O.
    pub fn new(model: ModelHandle, config: SessionConfig) -> Result<Self> {
        Self::with_label(model, config, "session")
    }

    /// Like `new`, with a label carried by every log line of this session.
    pub fn with_label(model: ModelHandle, config: SessionConfig, label: &str) -> Result<Self> {
        config.validate()?;
        let sample_rate = model.sample_rate();
        if sample_rate == 0 {
            return Err(VoxError::Config("model reports a zero sample rate".into()));
        }
        Ok(Self {
            config,
            model,
            sample_rate,
            state: Arc::new(Mutex::new(SessionState::Idle)),
            prime: Mutex::new(None),
            running: Mutex::new(None),
            stats: Arc::new(SessionStats::default()),
            span: info_span!("session", label = %label),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The model's native rate; every endpoint of this session must use it as
    /// its canonical rate.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Endpoint settings matching this session's canonical rate.
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig::for_rate(self.sample_rate)
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Fill ratio of the input ring, while streaming.
    pub fn input_level(&self) -> Option<f32> {
        self.running
            .lock()
            .as_ref()
            .map(|r| r.input.available() as f32 / r.input.capacity() as f32)
    }

    /// Duration of the cached reference, once primed.
    pub fn reference_secs(&self) -> Option<f64> {
        self.prime.lock().as_ref().map(|p| p.duration_secs)
    }

    /// Derive and cache the reference prime from a target-voice clip.
    ///
    /// Allowed in `Idle` and `Primed` (re-priming replaces the cache).
    pub fn prepare_reference(&self, mut clip: AudioChunk) -> Result<()> {
        let _enter = self.span.enter();
        let state = self.state();
        if !matches!(state, SessionState::Idle | SessionState::Primed) {
            return Err(VoxError::InvalidState {
                op: "prepare_reference",
                state: state.to_string(),
            });
        }
        if clip.sample_rate == 0 || clip.is_empty() {
            return Err(VoxError::Reference("reference clip is empty".into()));
        }
        if clip.samples.iter().any(|s| !s.is_finite()) {
            return Err(VoxError::Reference("reference clip contains NaN or infinite samples".into()));
        }
        if clip.truncate_secs(self.config.max_reference_secs) {
            info!(max_secs = self.config.max_reference_secs, "reference clip truncated");
        }
        let duration_secs = clip.duration_secs();
        if duration_secs < self.config.min_reference_secs as f64 {
            return Err(VoxError::Reference(format!(
                "reference clip is {duration_secs:.2} s, at least {} s required",
                self.config.min_reference_secs
            )));
        }

        let native = resample_all(&clip.samples, clip.sample_rate, self.sample_rate)?;
        let analysis = resample_all(&clip.samples, clip.sample_rate, ANALYSIS_SAMPLE_RATE)?;

        let prime = {
            let mut model = self.model.0.lock();
            let target_mel = model.mel_spectrogram(&native)?;
            let style = model.compute_style(&analysis)?;
            let indices = model.extract_content_features(&analysis)?;
            let target_mel_len = target_mel.frames;
            let prompt = model.length_regulate(&indices, target_mel_len)?;
            ReferencePrime {
                style,
                target_mel,
                target_mel_len,
                prompt,
                duration_secs,
            }
        };
        info!(
            duration_secs,
            mel_frames = prime.target_mel_len,
            "reference primed"
        );

        // Re-check under the lock: a concurrent start() may have won.
        let mut state = self.state.lock();
        if !matches!(*state, SessionState::Idle | SessionState::Primed) {
            return Err(VoxError::InvalidState {
                op: "prepare_reference",
                state: state.to_string(),
            });
        }
        *self.prime.lock() = Some(Arc::new(prime));
        *state = SessionState::Primed;
        Ok(())
    }

    /// Load a WAV and prime from it. Any load failure is a `Reference` error.
    pub fn prepare_reference_file(&self, path: &Path) -> Result<()> {
        let clip = load_wav_mono(path)
            .map_err(|e| VoxError::Reference(format!("{}: {e}", path.display())))?;
        self.prepare_reference(clip)
    }

    /// Start both endpoints and the chunk loop. Only valid in `Primed`.
    ///
    /// Endpoints must have been built for `transport_config()`'s canonical
    /// rate. On failure everything already started is stopped again and the
    /// session stays `Primed`.
    pub fn start(&self, mut source: Box<dyn AudioSource>, mut sink: Box<dyn AudioSink>) -> Result<()> {
        let _enter = self.span.enter();
        let mut state = self.state.lock();
        if *state != SessionState::Primed {
            return Err(VoxError::InvalidState {
                op: "start",
                state: state.to_string(),
            });
        }
        let prime = self
            .prime
            .lock()
            .clone()
            .ok_or_else(|| VoxError::InvalidState {
                op: "start",
                state: "primed without a reference".into(),
            })?;

        let input = Arc::new(RingBuffer::with_duration(self.sample_rate, self.config.ring_seconds));
        let output = Arc::new(RingBuffer::with_duration(self.sample_rate, self.config.ring_seconds));
        let (events_tx, events_rx) = event_channel(self.config.fault_queue_capacity);
        let timeout = self.config.shutdown_timeout();

        sink.start(events_tx.clone())?;
        if let Err(e) = source.start(Arc::clone(&input), events_tx) {
            if let Err(stop_err) = sink.stop(timeout) {
                warn!("sink shutdown after failed start: {stop_err}");
            }
            return Err(e);
        }
        info!(source = %source.graph(), sink = %sink.graph(), "session starting");

        let ctx = chunk_loop::LoopContext {
            model: self.model.clone(),
            prime,
            params: self.config.params,
            sample_rate: self.sample_rate,
            chunk_len: self.config.chunk_samples(self.sample_rate),
            carry_context: self.config.carry_context,
            crossfader: Crossfader::new(
                self.config.overlap_samples(self.sample_rate),
                self.config.fade_curve,
            ),
            input: Arc::clone(&input),
            output,
            sink,
            events: events_rx,
            stats: Arc::clone(&self.stats),
            state: Arc::clone(&self.state),
            shutdown_timeout: timeout,
            span: self.span.clone(),
        };
        let chunk_loop = match Worker::spawn("vox-session", move |stop| chunk_loop::run(ctx, stop)) {
            Ok(w) => w,
            Err(e) => {
                if let Err(stop_err) = source.stop(timeout) {
                    warn!("source shutdown after failed start: {stop_err}");
                }
                return Err(e);
            }
        };

        *self.running.lock() = Some(Running {
            chunk_loop,
            source,
            input,
        });
        *state = SessionState::Streaming;
        Ok(())
    }

    /// Block until the chunk loop exits on its own (end of stream) or
    /// `timeout` passes. Returns `true` if the loop is no longer running.
    pub fn wait_finished(&self, timeout: Duration) -> bool {
        let signal = match self.running.lock().as_ref() {
            Some(r) => r.chunk_loop.exit_signal(),
            None => return true,
        };
        matches!(
            signal.recv_timeout(timeout),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected)
        )
    }

    /// `true` once the chunk loop has exited (or was never started).
    pub fn is_finished(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .map_or(true, |r| r.chunk_loop.is_finished())
    }

    /// Stop streaming and release everything.
    ///
    /// No-op in `Idle` and `Primed`, and once everything is released. Also
    /// releases the source of a session whose loop already ended on its own.
    /// Deadline misses are recorded in stats rather than returned.
    pub fn stop(&self) -> Result<()> {
        let _enter = self.span.enter();
        let running = {
            let state = self.state.lock();
            if !matches!(*state, SessionState::Streaming | SessionState::Stopped) {
                debug!(state = %*state, "stop ignored");
                return Ok(());
            }
            self.running.lock().take()
        };
        let Some(Running {
            chunk_loop,
            mut source,
            ..
        }) = running
        else {
            return Ok(());
        };

        // The state lock is not held while joining.
        let timeout = self.config.shutdown_timeout();
        if let Err(e) = chunk_loop.join(timeout) {
            warn!("chunk loop shutdown: {e}");
            self.stats.record_error(e.kind(), e.to_string());
        }
        if let Err(e) = source.stop(timeout) {
            warn!("source shutdown: {e}");
            self.stats.record_error(e.kind(), e.to_string());
        }
        *self.prime.lock() = None;
        *self.state.lock() = SessionState::Stopped;

        let snap = self.stats.snapshot();
        info!(
            samples_in = snap.samples_in,
            samples_out = snap.samples_out,
            chunks = snap.chunks_processed,
            errors = snap.error_count,
            "session stopped"
        );
        Ok(())
    }
}

impl Drop for ConversionSession {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

impl std::fmt::Debug for ConversionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversionSession")
            .field("state", &self.state())
            .field("sample_rate", &self.sample_rate)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::ToneGenerator;
    use crate::inference::stub::StubVoiceModel;
    use crate::transport::synthetic::SyntheticSource;

    fn session() -> ConversionSession {
        ConversionSession::new(ModelHandle::new(StubVoiceModel::new()), SessionConfig::default()).unwrap()
    }

    fn clip(secs: f32) -> AudioChunk {
        let n = (secs * 16_000.0) as usize;
        AudioChunk::new(ToneGenerator::new(180.0, 0.4, 16_000).next_block(n), 16_000)
    }

    #[test]
    fn default_config_is_valid() {
        let cfg = SessionConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.chunk_samples(22_050), 3_969);
        assert_eq!(cfg.overlap_samples(22_050), 441);
    }

    #[test]
    fn overlap_must_be_shorter_than_chunk() {
        let cfg = SessionConfig {
            overlap_ms: 180,
            ..SessionConfig::default()
        };
        assert_eq!(cfg.validate().unwrap_err().kind(), "config_error");
    }

    #[test]
    fn config_json_uses_camel_case_and_defaults() {
        let cfg: SessionConfig =
            serde_json::from_str(r#"{"chunkMs":240,"fadeCurve":"linear"}"#).unwrap();
        assert_eq!(cfg.chunk_ms, 240);
        assert_eq!(cfg.fade_curve, FadeCurve::Linear);
        assert_eq!(cfg.overlap_ms, 20);
    }

    #[test]
    fn priming_transitions_to_primed() {
        let s = session();
        assert_eq!(s.state(), SessionState::Idle);
        s.prepare_reference(clip(2.0)).unwrap();
        assert_eq!(s.state(), SessionState::Primed);
        assert!((s.reference_secs().unwrap() - 2.0).abs() < 1e-3);
        // Re-priming is allowed.
        s.prepare_reference(clip(1.0)).unwrap();
        assert_eq!(s.state(), SessionState::Primed);
    }

    #[test]
    fn short_reference_is_rejected_and_state_kept() {
        let s = session();
        let err = s.prepare_reference(clip(0.2)).unwrap_err();
        assert_eq!(err.kind(), "reference_error");
        assert_eq!(s.state(), SessionState::Idle);
    }

    #[test]
    fn long_reference_is_truncated() {
        let s = session();
        s.prepare_reference(clip(30.0)).unwrap();
        assert!((s.reference_secs().unwrap() - 25.0).abs() < 1e-3);
    }

    #[test]
    fn missing_reference_file_is_reference_error() {
        let s = session();
        let err = s
            .prepare_reference_file(Path::new("/no/such/ref.wav"))
            .unwrap_err();
        assert_eq!(err.kind(), "reference_error");
    }

    #[test]
    fn start_requires_primed() {
        let s = session();
        let cfg = s.transport_config();
        let source = Box::new(SyntheticSource::new(440.0, Some(0.1), false, &cfg).unwrap());
        let sink = Box::new(crate::transport::file::FileSink::new(
            &std::env::temp_dir().join("voxbridge-unused.wav"),
            &cfg,
        )
        .unwrap());
        let err = s.start(source, sink).unwrap_err();
        assert!(matches!(err, VoxError::InvalidState { op: "start", .. }));
        assert_eq!(s.state(), SessionState::Idle);
    }

    #[test]
    fn stop_when_idle_or_primed_is_noop() {
        let s = session();
        s.stop().unwrap();
        assert_eq!(s.state(), SessionState::Idle);
        s.prepare_reference(clip(1.0)).unwrap();
        s.stop().unwrap();
        assert_eq!(s.state(), SessionState::Primed);
        assert!(s.stats().is_zero());
        assert!(s.is_finished());
    }
}
