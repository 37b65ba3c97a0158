//! Real-time-factor benchmark: runs whole file-to-file sessions and reports
//! wall time per second of audio.
//!
//! Uses the stub backend, so it measures the streaming machinery (rings,
//! endpoints, resampling, smoothing) rather than a real model.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Serialize;
use voxbridge_core::audio::{load_wav_mono, write_wav_mono, ToneGenerator};
use voxbridge_core::{
    open_sink, open_source, ConversionSession, EndpointDescriptor, ModelHandle, SessionConfig,
    StubVoiceModel,
};

#[derive(Debug)]
struct Args {
    fixtures_dir: Option<PathBuf>,
    iterations: usize,
    chunk_ms: u32,
    output: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
struct CaseResult {
    file: String,
    iteration: usize,
    audio_secs: f64,
    wall_ms: f64,
    rtf: f64,
    chunks: u64,
    errors: u64,
}

#[derive(Debug, Clone, Serialize)]
struct Summary {
    runs: usize,
    chunk_ms: u32,
    p50_rtf: f64,
    p95_rtf: f64,
    avg_rtf: f64,
    cases: Vec<CaseResult>,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("benchmark failed: {e}");
        std::process::exit(1);
    }
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args {
        fixtures_dir: None,
        iterations: 3,
        chunk_ms: 180,
        output: None,
    };
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--fixtures" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --fixtures".into());
                };
                args.fixtures_dir = Some(PathBuf::from(v));
            }
            "--iterations" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --iterations".into());
                };
                args.iterations = v
                    .parse::<usize>()
                    .map_err(|_| "invalid value for --iterations".to_string())?
                    .clamp(1, 20);
            }
            "--chunk-ms" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --chunk-ms".into());
                };
                args.chunk_ms = v
                    .parse::<u32>()
                    .map_err(|_| "invalid value for --chunk-ms".to_string())?;
            }
            "--output" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --output".into());
                };
                args.output = Some(PathBuf::from(v));
            }
            "--help" | "-h" => {
                println!(
                    "Usage: cargo run -p voxbridge-core --bin voxbridge-bench -- \\
  [--fixtures <dir>] [--iterations <n>] [--chunk-ms <ms>] [--output <file.json>]"
                );
                std::process::exit(0);
            }
            other => return Err(format!("unknown argument: {other}")),
        }
    }
    Ok(args)
}

fn collect_wavs(dir: &Path) -> Result<Vec<PathBuf>, String> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(|e| e.to_string())? {
        let path = entry.map_err(|e| e.to_string())?.path();
        let is_wav = path
            .extension()
            .and_then(|s| s.to_str())
            .is_some_and(|s| s.eq_ignore_ascii_case("wav"));
        if is_wav {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}

fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let idx = ((sorted.len() - 1) as f64 * p.clamp(0.0, 1.0)).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn convert_once(
    model: &ModelHandle,
    config: &SessionConfig,
    reference: &Path,
    source: &Path,
    output: &Path,
) -> Result<(Duration, u64, u64), String> {
    let session = ConversionSession::new(model.clone(), config.clone()).map_err(|e| e.to_string())?;
    session
        .prepare_reference_file(reference)
        .map_err(|e| e.to_string())?;
    let cfg = session.transport_config();
    let src = open_source(&EndpointDescriptor::file(source), &cfg).map_err(|e| e.to_string())?;
    let sink = open_sink(&EndpointDescriptor::file(output), &cfg).map_err(|e| e.to_string())?;

    let started = Instant::now();
    session.start(src, sink).map_err(|e| e.to_string())?;
    if !session.wait_finished(Duration::from_secs(600)) {
        return Err("session did not finish within 600 s".into());
    }
    let wall = started.elapsed();
    session.stop().map_err(|e| e.to_string())?;
    let stats = session.stats();
    Ok((wall, stats.chunks_processed, stats.error_count))
}

fn run() -> Result<(), String> {
    let args = parse_args()?;
    let scratch = std::env::temp_dir().join(format!("voxbridge-bench-{}", std::process::id()));
    std::fs::create_dir_all(&scratch).map_err(|e| e.to_string())?;

    let model = ModelHandle::new(StubVoiceModel::new());
    model.0.lock().warm_up().map_err(|e| e.to_string())?;
    let rate = model.sample_rate();

    let reference = scratch.join("reference.wav");
    write_wav_mono(&reference, &ToneGenerator::new(180.0, 0.4, rate).next_block(rate as usize * 5), rate)
        .map_err(|e| e.to_string())?;

    let inputs = match &args.fixtures_dir {
        Some(dir) => collect_wavs(dir)?,
        None => {
            // Default corpus: 10 s of tone.
            let path = scratch.join("tone-10s.wav");
            write_wav_mono(&path, &ToneGenerator::new(300.0, 0.5, rate).next_block(rate as usize * 10), rate)
                .map_err(|e| e.to_string())?;
            vec![path]
        }
    };
    if inputs.is_empty() {
        return Err("no .wav inputs found".into());
    }

    let config = SessionConfig {
        chunk_ms: args.chunk_ms,
        ..SessionConfig::default()
    };
    config.validate().map_err(|e| e.to_string())?;
    println!(
        "Running voxbridge benchmark on {} inputs (iterations={}, chunk={} ms)",
        inputs.len(),
        args.iterations,
        args.chunk_ms
    );

    let mut cases = Vec::new();
    for input in &inputs {
        let audio_secs = load_wav_mono(input).map_err(|e| e.to_string())?.duration_secs();
        let file = input.display().to_string();
        for iteration in 1..=args.iterations {
            let out = scratch.join(format!("out-{iteration}.wav"));
            let (wall, chunks, errors) = convert_once(&model, &config, &reference, input, &out)?;
            let wall_ms = wall.as_secs_f64() * 1_000.0;
            let rtf = if audio_secs > 0.0 { wall.as_secs_f64() / audio_secs } else { 0.0 };
            println!("{file} [{iteration}/{}] {wall_ms:.1} ms, rtf {rtf:.3}", args.iterations);
            cases.push(CaseResult {
                file: file.clone(),
                iteration,
                audio_secs,
                wall_ms,
                rtf,
                chunks,
                errors,
            });
        }
    }

    let rtfs = cases.iter().map(|c| c.rtf).collect::<Vec<_>>();
    let summary = Summary {
        runs: cases.len(),
        chunk_ms: args.chunk_ms,
        p50_rtf: percentile(&rtfs, 0.50),
        p95_rtf: percentile(&rtfs, 0.95),
        avg_rtf: rtfs.iter().sum::<f64>() / rtfs.len().max(1) as f64,
        cases,
    };
    println!(
        "\nSummary: runs={} p50_rtf={:.3} p95_rtf={:.3} avg_rtf={:.3}",
        summary.runs, summary.p50_rtf, summary.p95_rtf, summary.avg_rtf
    );

    if let Some(path) = args.output {
        let json = serde_json::to_string_pretty(&summary).map_err(|e| e.to_string())?;
        std::fs::write(&path, json).map_err(|e| e.to_string())?;
        println!("Wrote benchmark report: {}", path.display());
    }
    let _ = std::fs::remove_dir_all(&scratch);
    Ok(())
}
