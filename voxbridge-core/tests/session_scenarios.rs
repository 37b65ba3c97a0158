use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use voxbridge_core::audio::{load_wav_mono, write_wav_mono, ToneGenerator};
use voxbridge_core::transport::graph::{GraphDirection, PipelineGraph, Stage};
use voxbridge_core::transport::rtp::{encode_l16, RtpSequencer, DYNAMIC_PAYLOAD_TYPE};
use voxbridge_core::transport::synthetic::TONE_AMPLITUDE;
use voxbridge_core::transport::EventSender;
use voxbridge_core::{
    open_sink, open_source, AudioChunk, AudioSink, ConversionSession, EndpointDescriptor,
    ModelHandle, SessionConfig, SessionState, StubVoiceModel, VoxError,
};

const RATE: u32 = 22_050;

/// Sink that keeps everything in memory.
struct CollectSink {
    graph: PipelineGraph,
    collected: Arc<Mutex<Vec<f32>>>,
}

impl CollectSink {
    fn new() -> (Self, Arc<Mutex<Vec<f32>>>) {
        let collected = Arc::new(Mutex::new(Vec::new()));
        let graph = PipelineGraph::new(
            GraphDirection::Sink,
            vec![
                Stage::QueueRead { capacity: 64 },
                Stage::WavWriter {
                    path: "memory".into(),
                    sample_rate: RATE,
                },
            ],
        )
        .unwrap();
        (
            Self {
                graph,
                collected: Arc::clone(&collected),
            },
            collected,
        )
    }
}

impl AudioSink for CollectSink {
    fn graph(&self) -> &PipelineGraph {
        &self.graph
    }

    fn start(&mut self, _events: EventSender) -> voxbridge_core::Result<()> {
        Ok(())
    }

    fn push(&mut self, samples: &[f32]) -> voxbridge_core::Result<()> {
        self.collected.lock().extend_from_slice(samples);
        Ok(())
    }

    fn stop(&mut self, _timeout: Duration) -> voxbridge_core::Result<()> {
        Ok(())
    }
}

fn reference_clip(secs: f32) -> AudioChunk {
    let n = (secs * RATE as f32) as usize;
    AudioChunk::new(ToneGenerator::new(160.0, 0.4, RATE).next_block(n), RATE)
}

fn session(model: StubVoiceModel) -> ConversionSession {
    ConversionSession::new(ModelHandle::new(model), SessionConfig::default()).unwrap()
}

#[test]
fn priming_then_stop_leaves_primed_with_zero_stats() {
    let s = session(StubVoiceModel::new());
    s.prepare_reference(reference_clip(5.0)).unwrap();
    s.stop().unwrap();
    assert_eq!(s.state(), SessionState::Primed);
    assert!(s.stats().is_zero());
}

#[test]
fn model_failure_on_every_chunk_passes_input_through() {
    let s = session(StubVoiceModel::new().failing_generation());
    s.prepare_reference(reference_clip(2.0)).unwrap();
    let cfg = s.transport_config();
    let source = open_source(&EndpointDescriptor::synthetic(440.0, Some(1.0)), &cfg).unwrap();
    let (sink, collected) = CollectSink::new();

    s.start(source, Box::new(sink)).unwrap();
    assert!(s.wait_finished(Duration::from_secs(10)));
    s.stop().unwrap();
    assert_eq!(s.state(), SessionState::Stopped);

    let expected = ToneGenerator::new(440.0, TONE_AMPLITUDE, RATE).next_block(RATE as usize);
    assert_eq!(*collected.lock(), expected);

    // 22_050 samples in 3_969-sample chunks: 5 full + 1 short.
    let stats = s.stats();
    assert_eq!(stats.chunks_processed, 6);
    assert_eq!(stats.error_count, 6);
    assert_eq!(stats.passthrough_chunks, 6);
    assert_eq!(stats.samples_in, RATE as u64);
    assert_eq!(stats.samples_out, RATE as u64);
}

fn convert_tone_file(config: SessionConfig) -> (Vec<f32>, voxbridge_core::StatsSnapshot) {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.wav");
    let output = dir.path().join("out.wav");
    // 48 kHz input exercises the source resampler.
    write_wav_mono(&input, &ToneGenerator::new(250.0, 0.5, 48_000).next_block(96_000), 48_000).unwrap();

    let s = ConversionSession::new(ModelHandle::new(StubVoiceModel::new()), config).unwrap();
    s.prepare_reference(reference_clip(3.0)).unwrap();
    let cfg = s.transport_config();
    let source = open_source(&EndpointDescriptor::file(&input), &cfg).unwrap();
    let sink = open_sink(&EndpointDescriptor::file(&output), &cfg).unwrap();
    s.start(source, sink).unwrap();
    assert!(s.wait_finished(Duration::from_secs(30)));
    s.stop().unwrap();

    let stats = s.stats();
    assert_eq!(stats.error_count, 0, "{:?}", stats.recent_errors);
    let converted = load_wav_mono(&output).unwrap();
    assert_eq!(converted.sample_rate, RATE);
    assert_eq!(converted.samples.len() as u64, stats.samples_out);
    assert!((stats.samples_in as i64 - 2 * RATE as i64).abs() <= 64);
    // The stub voices the input at its own pitch; output must not be silent.
    assert!(converted.samples.iter().any(|s| s.abs() > 0.05));
    (converted.samples, stats)
}

#[test]
fn file_to_file_conversion_overlaps_chunk_boundaries() {
    let (_, stats) = convert_tone_file(SessionConfig::default());
    let overlap = 441u64;
    let boundaries = stats.chunks_processed - 1;
    assert!(stats.samples_out < stats.samples_in);
    assert!(stats.samples_out >= stats.samples_in - boundaries * overlap);
}

#[test]
fn file_to_file_conversion_with_carried_context_preserves_length() {
    let config = SessionConfig {
        carry_context: true,
        ..SessionConfig::default()
    };
    let (converted, stats) = convert_tone_file(config);
    assert_eq!(converted.len() as u64, stats.samples_in);
}

#[test]
fn session_is_stopped_once_the_source_ends() {
    let s = session(StubVoiceModel::new());
    s.prepare_reference(reference_clip(1.0)).unwrap();
    let cfg = s.transport_config();
    let source = open_source(&EndpointDescriptor::synthetic(440.0, Some(0.3)), &cfg).unwrap();
    let (sink, collected) = CollectSink::new();
    s.start(source, Box::new(sink)).unwrap();

    assert!(s.wait_finished(Duration::from_secs(10)));
    assert_eq!(s.state(), SessionState::Stopped);
    assert!(!collected.lock().is_empty());
    // stop() still releases the source and stays idempotent.
    s.stop().unwrap();
    s.stop().unwrap();
    assert_eq!(s.state(), SessionState::Stopped);
    assert_eq!(s.stats().error_count, 0);
    assert!(s.input_level().is_none());
}

/// Sink whose shutdown fails, optionally after a delay.
struct FailingStopSink {
    graph: PipelineGraph,
    delay: Duration,
    stopped: Arc<AtomicBool>,
}

impl FailingStopSink {
    fn new(delay: Duration) -> (Self, Arc<AtomicBool>) {
        let (inner, _) = CollectSink::new();
        let stopped = Arc::new(AtomicBool::new(false));
        (
            Self {
                graph: inner.graph,
                delay,
                stopped: Arc::clone(&stopped),
            },
            stopped,
        )
    }
}

impl AudioSink for FailingStopSink {
    fn graph(&self) -> &PipelineGraph {
        &self.graph
    }

    fn start(&mut self, _events: EventSender) -> voxbridge_core::Result<()> {
        Ok(())
    }

    fn push(&mut self, _samples: &[f32]) -> voxbridge_core::Result<()> {
        Ok(())
    }

    fn stop(&mut self, _timeout: Duration) -> voxbridge_core::Result<()> {
        std::thread::sleep(self.delay);
        self.stopped.store(true, Ordering::Release);
        Err(VoxError::Transport("sink refused to close".into()))
    }
}

#[test]
fn failed_source_start_stops_the_sink_and_keeps_primed() {
    let taken = UdpSocket::bind("127.0.0.1:0").unwrap();
    let port = taken.local_addr().unwrap().port();
    let s = session(StubVoiceModel::new());
    s.prepare_reference(reference_clip(1.0)).unwrap();
    let cfg = s.transport_config();
    let source = open_source(&EndpointDescriptor::network("127.0.0.1", port), &cfg).unwrap();
    let (sink, stopped) = FailingStopSink::new(Duration::ZERO);

    // The bind failure is reported, not the sink's shutdown error.
    let err = s.start(source, Box::new(sink)).unwrap_err();
    assert_eq!(err.kind(), "transport_error");
    assert!(err.to_string().contains("cannot bind"), "{err}");
    assert!(stopped.load(Ordering::Acquire));
    assert_eq!(s.state(), SessionState::Primed);
}

#[test]
fn state_stays_readable_while_stop_joins_the_loop() {
    let s = Arc::new(session(StubVoiceModel::new()));
    s.prepare_reference(reference_clip(1.0)).unwrap();
    let cfg = s.transport_config();
    let source = open_source(&EndpointDescriptor::synthetic(440.0, None), &cfg).unwrap();
    let (sink, stopped) = FailingStopSink::new(Duration::from_millis(600));
    s.start(source, Box::new(sink)).unwrap();

    let stopper = {
        let s = Arc::clone(&s);
        std::thread::spawn(move || s.stop())
    };
    std::thread::sleep(Duration::from_millis(150));
    let asked = Instant::now();
    let _ = s.state();
    assert!(asked.elapsed() < Duration::from_millis(200), "{:?}", asked.elapsed());
    assert!(!stopped.load(Ordering::Acquire));

    stopper.join().unwrap().unwrap();
    assert_eq!(s.state(), SessionState::Stopped);
    // The sink's shutdown error is recorded, not returned.
    assert!(s
        .stats()
        .recent_errors
        .iter()
        .any(|e| e.message.contains("sink refused to close")));
}

#[test]
fn start_twice_is_invalid_state() {
    let s = session(StubVoiceModel::new());
    s.prepare_reference(reference_clip(1.0)).unwrap();
    let cfg = s.transport_config();
    let source = open_source(&EndpointDescriptor::synthetic(440.0, None), &cfg).unwrap();
    let (sink, _) = CollectSink::new();
    s.start(source, Box::new(sink)).unwrap();

    let again = open_source(&EndpointDescriptor::synthetic(440.0, None), &cfg).unwrap();
    let (sink, _) = CollectSink::new();
    let err = s.start(again, Box::new(sink)).unwrap_err();
    assert_eq!(err.kind(), "invalid_state");
    s.stop().unwrap();
    assert_eq!(s.state(), SessionState::Stopped);
    // Terminal: priming again is refused.
    assert!(s.prepare_reference(reference_clip(1.0)).is_err());
}

#[test]
fn rtp_stream_is_converted_from_the_network() {
    let port = {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.local_addr().unwrap().port()
    };
    let s = session(StubVoiceModel::new());
    s.prepare_reference(reference_clip(1.0)).unwrap();
    let cfg = s.transport_config();
    let source = open_source(&EndpointDescriptor::network("127.0.0.1", port), &cfg).unwrap();
    let (sink, collected) = CollectSink::new();
    s.start(source, Box::new(sink)).unwrap();

    // One second of 48 kHz audio in 20 ms RTP packets.
    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    let mut seq = RtpSequencer::new(DYNAMIC_PAYLOAD_TYPE);
    let mut tone = ToneGenerator::new(300.0, 0.5, 48_000);
    for _ in 0..50 {
        let block = tone.next_block(960);
        let packet = seq.next_packet(encode_l16(&block), block.len());
        sender.send_to(&packet.encode(), ("127.0.0.1", port)).unwrap();
        std::thread::sleep(Duration::from_millis(2));
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while s.stats().chunks_processed < 4 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(s.input_level().is_some());
    s.stop().unwrap();

    let stats = s.stats();
    assert!(stats.chunks_processed >= 4, "{stats:?}");
    assert_eq!(stats.error_count, 0, "{:?}", stats.recent_errors);
    // Everything consumed was emitted, less one overlap per boundary.
    let emitted = collected.lock().len() as u64;
    assert_eq!(emitted, stats.samples_out);
    assert!(emitted <= stats.samples_in);
    assert!(emitted >= stats.samples_in - (stats.chunks_processed - 1) * 441);
}
