//! Blocking chunk loop.
//!
//! ## Stages (per iteration)
//!
//! ```text
//! 1. Drain endpoint events → stats; remember end of stream
//! 2. read(chunk_len) from the input ring (short final chunk after EOS)
//! 3. chunk (or [context | chunk] with `carry_context`) → 16 kHz → content
//!    indices; native mel length; length-regulate → chunk conditioning
//! 4. [prompt | chunk conditioning] → generate → drop prompt frames
//! 5. vocode → fit to the model input length
//! 6. Crossfader: blend the retained tail into the new head
//! 7. Output ring → sink.push
//! ```
//!
//! A model failure flushes the retained tail and passes the raw chunk
//! through unfaded. The loop runs on a dedicated thread; the session's stop
//! flag is checked once per iteration. Whatever ends the loop, it marks the
//! session `Stopped` on the way out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn, Span};

use crate::audio::resample::resample_all;
use crate::buffering::RingBuffer;
use crate::error::Result;
use crate::inference::{GenerationParams, ModelHandle, ANALYSIS_SAMPLE_RATE};
use crate::session::smoothing::Crossfader;
use crate::session::stats::SessionStats;
use crate::session::{ReferencePrime, SessionState};
use crate::transport::{AudioSink, EndpointEvent, EventReceiver};

/// Minimum sleep when the ring is short of a chunk (avoids busy-waiting).
const DEFAULT_SLEEP_EMPTY_MS: u64 = 5;

/// All context the loop needs, passed as one struct so the closure stays tidy.
pub(crate) struct LoopContext {
    pub model: ModelHandle,
    pub prime: Arc<ReferencePrime>,
    pub params: GenerationParams,
    pub sample_rate: u32,
    pub chunk_len: usize,
    pub carry_context: bool,
    pub crossfader: Crossfader,
    pub input: Arc<RingBuffer>,
    pub output: Arc<RingBuffer>,
    pub sink: Box<dyn AudioSink>,
    pub events: EventReceiver,
    pub stats: Arc<SessionStats>,
    /// The owning session's state cell.
    pub state: Arc<Mutex<SessionState>>,
    pub shutdown_timeout: Duration,
    pub span: Span,
}

/// Run until `stop` is raised or the source reports end of stream and the
/// input ring is drained.
pub(crate) fn run(mut ctx: LoopContext, stop: Arc<AtomicBool>) {
    let span = ctx.span.clone();
    let _enter = span.enter();
    info!(
        chunk_len = ctx.chunk_len,
        overlap = ctx.crossfader.overlap(),
        carry_context = ctx.carry_context,
        "chunk loop started"
    );

    // Last input samples seen, replayed in front of the next chunk as model
    // context while the crossfader holds a tail. Stays empty unless
    // `carry_context` is set.
    let mut history: Vec<f32> = Vec::new();
    let mut end_of_stream = false;
    let mut model_time = Duration::ZERO;
    let mut ended_by_stream = false;

    loop {
        // ── 0. Check stop flag ───────────────────────────────────────────────
        if stop.load(Ordering::Acquire) {
            break;
        }

        // ── 1. Endpoint events ───────────────────────────────────────────────
        drain_events(&ctx, &mut end_of_stream);

        // ── 2. Next chunk ────────────────────────────────────────────────────
        let chunk = match ctx.input.read(ctx.chunk_len) {
            Some(c) => c,
            None if end_of_stream => {
                let rest = ctx.input.drain();
                if rest.is_empty() {
                    ended_by_stream = true;
                    break;
                }
                rest
            }
            None => {
                std::thread::sleep(Duration::from_millis(empty_sleep_ms()));
                continue;
            }
        };
        SessionStats::add(&ctx.stats.samples_in, chunk.len());

        // ── 3-6. Convert and stitch ──────────────────────────────────────────
        let context_len = if ctx.carry_context {
            ctx.crossfader.pending().min(history.len())
        } else {
            0
        };
        let mut model_input = Vec::with_capacity(context_len + chunk.len());
        model_input.extend_from_slice(&history[history.len() - context_len..]);
        model_input.extend_from_slice(&chunk);

        let started = Instant::now();
        let converted = convert(&ctx, &model_input);
        model_time += started.elapsed();

        let emitted = match converted {
            Ok(mut out) => {
                out.resize(model_input.len(), 0.0);
                ctx.crossfader.process(&out)
            }
            Err(e) => {
                warn!(kind = e.kind(), "chunk conversion failed, passing input through: {e}");
                ctx.stats.record_error(e.kind(), e.to_string());
                SessionStats::add(&ctx.stats.passthrough_chunks, 1);
                let mut out = ctx.crossfader.flush();
                out.extend_from_slice(&chunk);
                out
            }
        };
        SessionStats::add(&ctx.stats.chunks_processed, 1);
        if ctx.carry_context {
            retain_tail_samples(&mut history, &chunk, ctx.crossfader.overlap());
        }

        // ── 7. Deliver ───────────────────────────────────────────────────────
        ctx.output.write(&emitted);
        deliver(&mut ctx);
        SessionStats::raise_to(
            &ctx.stats.overwritten_samples,
            ctx.input.overwritten() + ctx.output.overwritten(),
        );
    }

    // Release whatever the crossfader still holds.
    ctx.output.write(&ctx.crossfader.flush());
    deliver(&mut ctx);
    drain_events(&ctx, &mut end_of_stream);

    if let Err(e) = ctx.sink.stop(ctx.shutdown_timeout) {
        warn!("sink shutdown: {e}");
        ctx.stats.record_error(e.kind(), e.to_string());
    }
    // Faults raised while the sink flushed.
    drain_events(&ctx, &mut end_of_stream);
    *ctx.state.lock() = SessionState::Stopped;

    let snap = ctx.stats.snapshot();
    info!(
        ended_by_stream,
        samples_in = snap.samples_in,
        samples_out = snap.samples_out,
        chunks = snap.chunks_processed,
        passthrough = snap.passthrough_chunks,
        errors = snap.error_count,
        overwritten = snap.overwritten_samples,
        model_ms = model_time.as_millis() as u64,
        "chunk loop stopped, diagnostics"
    );
}

fn empty_sleep_ms() -> u64 {
    static EMPTY_SLEEP_MS: OnceLock<u64> = OnceLock::new();
    *EMPTY_SLEEP_MS.get_or_init(|| {
        std::env::var("VOXBRIDGE_EMPTY_SLEEP_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(|v| v.clamp(1, 20))
            .unwrap_or(DEFAULT_SLEEP_EMPTY_MS)
    })
}

fn drain_events(ctx: &LoopContext, end_of_stream: &mut bool) {
    for event in ctx.events.drain() {
        match event {
            EndpointEvent::Fault { endpoint, error } => {
                ctx.stats
                    .record_error(error.kind(), format!("{endpoint}: {error}"));
            }
            EndpointEvent::EndOfStream { endpoint } => {
                debug!(endpoint = %endpoint, "end of stream");
                *end_of_stream = true;
            }
        }
    }
    SessionStats::raise_to(&ctx.stats.dropped_faults, ctx.events.dropped());
}

/// One model pass over native-rate `input`. The result is native-rate audio
/// of roughly `input.len()` samples.
fn convert(ctx: &LoopContext, input: &[f32]) -> Result<Vec<f32>> {
    let analysis = resample_all(input, ctx.sample_rate, ANALYSIS_SAMPLE_RATE)?;
    let prime = &ctx.prime;

    let mut model = ctx.model.0.lock();
    let indices = model.extract_content_features(&analysis)?;
    let chunk_mel = model.mel_spectrogram(input)?;
    let chunk_cond = model.length_regulate(&indices, chunk_mel.frames)?;
    let conditioning = prime.prompt.concat(&chunk_cond)?;
    let mel = model.generate(&conditioning, &prime.style, &prime.target_mel, &ctx.params)?;
    let mel = mel.drop_leading_frames(prime.target_mel_len);
    model.vocode(&mel)
}

/// Hand everything in the output ring to the sink. Push failures are
/// recorded; the audio is lost.
fn deliver(ctx: &mut LoopContext) {
    let out = ctx.output.drain();
    if out.is_empty() {
        return;
    }
    match ctx.sink.push(&out) {
        Ok(()) => SessionStats::add(&ctx.stats.samples_out, out.len()),
        Err(e) => ctx.stats.record_error(e.kind(), e.to_string()),
    }
}

/// Keep only the last `keep` samples of `history` followed by `chunk`.
fn retain_tail_samples(history: &mut Vec<f32>, chunk: &[f32], keep: usize) {
    if keep == 0 {
        history.clear();
        return;
    }
    if chunk.len() >= keep {
        history.clear();
        history.extend_from_slice(&chunk[chunk.len() - keep..]);
        return;
    }
    history.extend_from_slice(chunk);
    let excess = history.len().saturating_sub(keep);
    history.drain(..excess);
}
