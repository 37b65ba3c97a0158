//! Live capture/playback endpoints via cpal.
//!
//! # Design constraints
//!
//! cpal callbacks run on an OS audio thread at elevated priority. They must
//! not block on a mutex or perform I/O, so they only touch a lock-free
//! `ringbuf` SPSC half and atomics. The endpoint worker thread sits on the
//! other side of that SPSC and does the resampling and ring/queue traffic.
//!
//! `cpal::Stream` is `!Send` on most platforms, so each stream is created and
//! dropped on its worker thread; the open result (device rate or error) is
//! sent back to `start()` over a one-slot channel.

use std::sync::Arc;
use std::time::Duration;

use crate::buffering::RingBuffer;
use crate::error::{Result, VoxError};
use crate::transport::graph::PipelineGraph;
use crate::transport::worker::Worker;
use crate::transport::{AudioSink, AudioSource, EventSender, TransportConfig};

#[cfg(feature = "audio-cpal")]
pub use backend::{DeviceSink, DeviceSource};

#[cfg(feature = "audio-cpal")]
mod backend {
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    use cpal::traits::{DeviceTrait, StreamTrait};
    use cpal::{FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig};
    use crossbeam_channel::{bounded, Receiver, Sender};
    use tracing::{debug, error, info, warn};

    use super::*;
    use crate::audio::device::{is_loopback_like_name, select_device, DeviceDirection};
    use crate::audio::resample::RateConverter;
    use crate::buffering::{
        create_device_ring, Consumer, DeviceConsumer, DeviceProducer, Observer, Producer,
    };
    use crate::transport::graph::{resample_stage, GraphDirection, Stage};
    use crate::transport::worker::{recv_buffer, SinkQueue};

    /// Device-side SPSC depth, in seconds of audio.
    const DEVICE_RING_SECS: u32 = 2;
    const OPEN_TIMEOUT: Duration = Duration::from_secs(5);
    const DRAIN_SLEEP: Duration = Duration::from_millis(5);

    struct DeviceFormat {
        name: String,
        sample_rate: u32,
        channels: u16,
    }

    fn query_format(direction: DeviceDirection, preferred: Option<&str>) -> Result<DeviceFormat> {
        let device = select_device(direction, preferred)?;
        let supported = match direction {
            DeviceDirection::Capture => device.default_input_config(),
            DeviceDirection::Playback => device.default_output_config(),
        }
        .map_err(|e| VoxError::Transport(format!("{direction} config: {e}")))?;
        Ok(DeviceFormat {
            name: device.name().unwrap_or_default(),
            sample_rate: supported.sample_rate().0,
            channels: supported.channels(),
        })
    }

    fn wait_open(rx: &Receiver<Result<u32>>) -> Result<u32> {
        match rx.recv_timeout(OPEN_TIMEOUT) {
            Ok(res) => res,
            Err(_) => Err(VoxError::Timeout {
                what: "audio device open".into(),
                after_ms: OPEN_TIMEOUT.as_millis() as u64,
            }),
        }
    }

    // ── Capture ──────────────────────────────────────────────────────────────

    pub struct DeviceSource {
        device_name: Option<String>,
        canonical_rate: u32,
        graph: PipelineGraph,
        worker: Option<Worker>,
    }

    impl DeviceSource {
        pub fn new(device_name: Option<String>, cfg: &TransportConfig) -> Result<Self> {
            let format = query_format(DeviceDirection::Capture, device_name.as_deref())?;
            if is_loopback_like_name(&format.name) {
                warn!(device = %format.name, "capture device looks like a loopback; converted output may feed back");
            }
            let mut stages = vec![Stage::DeviceCapture { device: Some(format.name.clone()) }];
            if format.channels > 1 {
                stages.push(Stage::Downmix);
            }
            stages.extend(resample_stage(format.sample_rate, cfg.canonical_rate));
            stages.push(Stage::RingWrite);
            Ok(Self {
                device_name,
                canonical_rate: cfg.canonical_rate,
                graph: PipelineGraph::new(GraphDirection::Source, stages)?,
                worker: None,
            })
        }
    }

    impl AudioSource for DeviceSource {
        fn graph(&self) -> &PipelineGraph {
            &self.graph
        }

        fn start(&mut self, ring: Arc<RingBuffer>, events: EventSender) -> Result<()> {
            if self.worker.is_some() {
                return Err(VoxError::Transport("capture already started".into()));
            }
            let (open_tx, open_rx) = bounded::<Result<u32>>(1);
            let preferred = self.device_name.clone();
            let canonical_rate = self.canonical_rate;
            info!(graph = %self.graph, "capture starting");

            let worker = Worker::spawn("vox-capture", move |stop| {
                run_capture(preferred, canonical_rate, ring, events, stop, open_tx)
            })?;
            match wait_open(&open_rx) {
                Ok(rate) => {
                    debug!(rate, "capture device open");
                    self.worker = Some(worker);
                    Ok(())
                }
                Err(e) => {
                    let _ = worker.join(Duration::from_millis(200));
                    Err(e)
                }
            }
        }

        fn stop(&mut self, timeout: Duration) -> Result<()> {
            match self.worker.take() {
                Some(worker) => worker.join(timeout),
                None => Ok(()),
            }
        }
    }

    fn open_capture_stream(
        preferred: Option<&str>,
        producer: DeviceProducer,
        running: Arc<AtomicBool>,
        overflow: Arc<AtomicU64>,
    ) -> Result<(Stream, u32)> {
        let device = select_device(DeviceDirection::Capture, preferred)?;
        let supported = device
            .default_input_config()
            .map_err(|e| VoxError::Transport(format!("capture config: {e}")))?;
        let sample_rate = supported.sample_rate().0;
        let config: StreamConfig = supported.config();
        info!(
            device = device.name().unwrap_or_default().as_str(),
            sample_rate,
            channels = config.channels,
            "opening capture device"
        );

        let stream = match supported.sample_format() {
            SampleFormat::F32 => build_capture::<f32>(&device, &config, producer, running, overflow),
            SampleFormat::I16 => build_capture::<i16>(&device, &config, producer, running, overflow),
            SampleFormat::U16 => build_capture::<u16>(&device, &config, producer, running, overflow),
            SampleFormat::U8 => build_capture::<u8>(&device, &config, producer, running, overflow),
            fmt => {
                return Err(VoxError::Transport(format!(
                    "unsupported capture sample format: {fmt:?}"
                )))
            }
        }
        .map_err(|e| VoxError::Transport(format!("capture stream: {e}")))?;
        stream
            .play()
            .map_err(|e| VoxError::Transport(format!("capture play: {e}")))?;
        Ok((stream, sample_rate))
    }

    fn build_capture<T>(
        device: &cpal::Device,
        config: &StreamConfig,
        mut producer: DeviceProducer,
        running: Arc<AtomicBool>,
        overflow: Arc<AtomicU64>,
    ) -> std::result::Result<Stream, cpal::BuildStreamError>
    where
        T: SizedSample,
        f32: FromSample<T>,
    {
        let ch = config.channels.max(1) as usize;
        // Grows to the device's callback size once, then reused.
        let mut mix: Vec<f32> = Vec::new();
        device.build_input_stream(
            config,
            move |data: &[T], _info| {
                if !running.load(Ordering::Relaxed) {
                    return;
                }
                let frames = data.len() / ch;
                mix.resize(frames, 0.0);
                for (slot, frame) in mix.iter_mut().zip(data.chunks_exact(ch)) {
                    *slot = frame.iter().map(|s| s.to_sample::<f32>()).sum::<f32>() / ch as f32;
                }
                let written = producer.push_slice(&mix);
                if written < mix.len() {
                    overflow.fetch_add((mix.len() - written) as u64, Ordering::Relaxed);
                }
            },
            |err| error!("capture stream error: {err}"),
            None,
        )
    }

    fn run_capture(
        preferred: Option<String>,
        canonical_rate: u32,
        ring: Arc<RingBuffer>,
        events: EventSender,
        stop: Arc<AtomicBool>,
        open_tx: Sender<Result<u32>>,
    ) {
        let running = Arc::new(AtomicBool::new(true));
        let overflow = Arc::new(AtomicU64::new(0));
        // Query the rate first so the SPSC can be sized for it.
        let ring_len = match query_format(DeviceDirection::Capture, preferred.as_deref()) {
            Ok(f) => (f.sample_rate * DEVICE_RING_SECS) as usize,
            Err(e) => {
                let _ = open_tx.send(Err(e));
                return;
            }
        };
        let (producer, mut consumer) = create_device_ring(ring_len);

        // ── Open device (must happen on THIS thread: cpal::Stream is !Send) ──
        let (stream, device_rate) = match open_capture_stream(
            preferred.as_deref(),
            producer,
            Arc::clone(&running),
            Arc::clone(&overflow),
        ) {
            Ok(opened) => opened,
            Err(e) => {
                let _ = open_tx.send(Err(e));
                return;
            }
        };
        let mut converter = match RateConverter::new(device_rate, canonical_rate, 960) {
            Ok(c) => c,
            Err(e) => {
                let _ = open_tx.send(Err(e));
                return;
            }
        };
        let _ = open_tx.send(Ok(device_rate));

        let endpoint = "capture";
        let mut scratch = vec![0f32; 4_096];
        let mut reported_overflow = 0u64;
        while !stop.load(Ordering::Acquire) {
            let n = consumer.pop_slice(&mut scratch);
            if n == 0 {
                std::thread::sleep(DRAIN_SLEEP);
                continue;
            }
            let out = converter.process(&scratch[..n]);
            if !out.is_empty() {
                ring.write(&out);
            }
            let lost = overflow.load(Ordering::Relaxed);
            if lost > reported_overflow {
                events.fault(
                    endpoint,
                    VoxError::Transport(format!(
                        "device buffer overflow, {} samples dropped",
                        lost - reported_overflow
                    )),
                );
                reported_overflow = lost;
            }
        }

        running.store(false, Ordering::Release);
        // Stream drops here, releasing the device on this thread.
        drop(stream);
        debug!(occupied = consumer.occupied_len(), "capture stopped");
    }

    // ── Playback ─────────────────────────────────────────────────────────────

    pub struct DeviceSink {
        device_name: Option<String>,
        canonical_rate: u32,
        graph: PipelineGraph,
        queue: SinkQueue,
        rx: Option<Receiver<Vec<f32>>>,
        worker: Option<Worker>,
    }

    impl DeviceSink {
        pub fn new(device_name: Option<String>, cfg: &TransportConfig) -> Result<Self> {
            let format = query_format(DeviceDirection::Playback, device_name.as_deref())?;
            let mut stages = vec![Stage::QueueRead { capacity: cfg.sink_queue_capacity }];
            stages.extend(resample_stage(cfg.canonical_rate, format.sample_rate));
            stages.push(Stage::DevicePlayback { device: Some(format.name) });
            let (queue, rx) = SinkQueue::new(cfg.sink_queue_capacity, cfg.backpressure);
            Ok(Self {
                device_name,
                canonical_rate: cfg.canonical_rate,
                graph: PipelineGraph::new(GraphDirection::Sink, stages)?,
                queue,
                rx: Some(rx),
                worker: None,
            })
        }
    }

    impl AudioSink for DeviceSink {
        fn graph(&self) -> &PipelineGraph {
            &self.graph
        }

        fn start(&mut self, events: EventSender) -> Result<()> {
            let rx = self
                .rx
                .take()
                .ok_or_else(|| VoxError::Transport("playback already started".into()))?;
            let (open_tx, open_rx) = bounded::<Result<u32>>(1);
            let preferred = self.device_name.clone();
            let canonical_rate = self.canonical_rate;
            info!(graph = %self.graph, "playback starting");

            let worker = Worker::spawn("vox-playback", move |stop| {
                run_playback(preferred, canonical_rate, rx, events, stop, open_tx)
            })?;
            match wait_open(&open_rx) {
                Ok(rate) => {
                    debug!(rate, "playback device open");
                    self.worker = Some(worker);
                    Ok(())
                }
                Err(e) => {
                    let _ = worker.join(Duration::from_millis(200));
                    Err(e)
                }
            }
        }

        fn push(&mut self, samples: &[f32]) -> Result<()> {
            self.queue.push(samples)
        }

        fn stop(&mut self, timeout: Duration) -> Result<()> {
            self.queue.close();
            match self.worker.take() {
                Some(worker) => worker.join(timeout),
                None => Ok(()),
            }
        }
    }

    fn open_playback_stream(
        preferred: Option<&str>,
        consumer: DeviceConsumer,
        underruns: Arc<AtomicU64>,
    ) -> Result<(Stream, u32)> {
        let device = select_device(DeviceDirection::Playback, preferred)?;
        let supported = device
            .default_output_config()
            .map_err(|e| VoxError::Transport(format!("playback config: {e}")))?;
        let sample_rate = supported.sample_rate().0;
        let config: StreamConfig = supported.config();
        info!(
            device = device.name().unwrap_or_default().as_str(),
            sample_rate,
            channels = config.channels,
            "opening playback device"
        );

        let stream = match supported.sample_format() {
            SampleFormat::F32 => build_playback::<f32>(&device, &config, consumer, underruns),
            SampleFormat::I16 => build_playback::<i16>(&device, &config, consumer, underruns),
            SampleFormat::U16 => build_playback::<u16>(&device, &config, consumer, underruns),
            fmt => {
                return Err(VoxError::Transport(format!(
                    "unsupported playback sample format: {fmt:?}"
                )))
            }
        }
        .map_err(|e| VoxError::Transport(format!("playback stream: {e}")))?;
        stream
            .play()
            .map_err(|e| VoxError::Transport(format!("playback play: {e}")))?;
        Ok((stream, sample_rate))
    }

    fn build_playback<T>(
        device: &cpal::Device,
        config: &StreamConfig,
        mut consumer: DeviceConsumer,
        underruns: Arc<AtomicU64>,
    ) -> std::result::Result<Stream, cpal::BuildStreamError>
    where
        T: SizedSample + FromSample<f32>,
    {
        let ch = config.channels.max(1) as usize;
        device.build_output_stream(
            config,
            move |data: &mut [T], _info| {
                for frame in data.chunks_mut(ch) {
                    let s = match consumer.try_pop() {
                        Some(s) => s,
                        None => {
                            underruns.fetch_add(1, Ordering::Relaxed);
                            0.0
                        }
                    };
                    let v = T::from_sample(s);
                    for out in frame.iter_mut() {
                        *out = v;
                    }
                }
            },
            |err| error!("playback stream error: {err}"),
            None,
        )
    }

    fn run_playback(
        preferred: Option<String>,
        canonical_rate: u32,
        rx: Receiver<Vec<f32>>,
        events: EventSender,
        stop: Arc<AtomicBool>,
        open_tx: Sender<Result<u32>>,
    ) {
        let underruns = Arc::new(AtomicU64::new(0));
        let ring_len = match query_format(DeviceDirection::Playback, preferred.as_deref()) {
            Ok(f) => (f.sample_rate * DEVICE_RING_SECS) as usize,
            Err(e) => {
                let _ = open_tx.send(Err(e));
                return;
            }
        };
        let (mut producer, consumer) = create_device_ring(ring_len);

        let (stream, device_rate) =
            match open_playback_stream(preferred.as_deref(), consumer, Arc::clone(&underruns)) {
                Ok(opened) => opened,
                Err(e) => {
                    let _ = open_tx.send(Err(e));
                    return;
                }
            };
        let mut converter = match RateConverter::new(canonical_rate, device_rate, 960) {
            Ok(c) => c,
            Err(e) => {
                let _ = open_tx.send(Err(e));
                return;
            }
        };
        let _ = open_tx.send(Ok(device_rate));

        let feed = |samples: &[f32], producer: &mut DeviceProducer| {
            let mut rest = samples;
            while !rest.is_empty() {
                let n = producer.push_slice(rest);
                rest = &rest[n..];
                if n == 0 {
                    if stop.load(Ordering::Acquire) && rx.is_empty() {
                        // Detached or shutting down hard: drop what cannot fit.
                        return;
                    }
                    std::thread::sleep(DRAIN_SLEEP);
                }
            }
        };

        while let Some(buf) = recv_buffer(&rx) {
            if buf.is_empty() {
                continue;
            }
            let out = converter.process(&buf);
            feed(&out, &mut producer);
        }
        let tail = converter.finish();
        feed(&tail, &mut producer);

        // Let the device play out what is queued, bounded by the ring length.
        let deadline = std::time::Instant::now() + Duration::from_secs(DEVICE_RING_SECS as u64);
        while producer.occupied_len() > 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(DRAIN_SLEEP);
        }
        let missed = underruns.load(Ordering::Relaxed);
        if missed > 0 {
            events.fault(
                "playback",
                VoxError::Transport(format!("{missed} output frames underran")),
            );
        }
        drop(stream);
        debug!("playback stopped");
    }
}

// ── Stubs when the `audio-cpal` feature is disabled ─────────────────────────

#[cfg(not(feature = "audio-cpal"))]
fn no_backend() -> VoxError {
    VoxError::Config("device endpoints need the audio-cpal feature".into())
}

#[cfg(not(feature = "audio-cpal"))]
pub struct DeviceSource {
    graph: PipelineGraph,
    _worker: Option<Worker>,
}

#[cfg(not(feature = "audio-cpal"))]
impl DeviceSource {
    pub fn new(_device_name: Option<String>, _cfg: &TransportConfig) -> Result<Self> {
        Err(no_backend())
    }
}

#[cfg(not(feature = "audio-cpal"))]
impl AudioSource for DeviceSource {
    fn graph(&self) -> &PipelineGraph {
        &self.graph
    }

    fn start(&mut self, _ring: Arc<RingBuffer>, _events: EventSender) -> Result<()> {
        Err(no_backend())
    }

    fn stop(&mut self, _timeout: Duration) -> Result<()> {
        Ok(())
    }
}

#[cfg(not(feature = "audio-cpal"))]
pub struct DeviceSink {
    graph: PipelineGraph,
}

#[cfg(not(feature = "audio-cpal"))]
impl DeviceSink {
    pub fn new(_device_name: Option<String>, _cfg: &TransportConfig) -> Result<Self> {
        Err(no_backend())
    }
}

#[cfg(not(feature = "audio-cpal"))]
impl AudioSink for DeviceSink {
    fn graph(&self) -> &PipelineGraph {
        &self.graph
    }

    fn start(&mut self, _events: EventSender) -> Result<()> {
        Err(no_backend())
    }

    fn push(&mut self, _samples: &[f32]) -> Result<()> {
        Err(no_backend())
    }

    fn stop(&mut self, _timeout: Duration) -> Result<()> {
        Ok(())
    }
}
