//! WAV file endpoints.
//!
//! The source decodes any PCM/float WAV, downmixes and resamples it to the
//! canonical rate, and writes it into the ring without overwriting unread
//! audio (files are not real-time, so the source waits for the session).
//! The sink writes 32-bit float mono WAV at the canonical rate and finalizes
//! the header when stopped.

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use hound::{WavReader, WavWriter};
use tracing::{debug, info};

use crate::audio::{downmix, float_wav_spec, resample::RateConverter, wav_samples};
use crate::buffering::RingBuffer;
use crate::error::{Result, VoxError};
use crate::transport::graph::{resample_stage, GraphDirection, PipelineGraph, Stage};
use crate::transport::worker::{recv_buffer, SinkQueue, Worker};
use crate::transport::{AudioSink, AudioSource, EventSender, TransportConfig};

/// Interleaved frames decoded per iteration.
const READ_FRAMES: usize = 4_096;

pub struct FileSource {
    path: PathBuf,
    canonical_rate: u32,
    graph: PipelineGraph,
    worker: Option<Worker>,
}

impl FileSource {
    pub fn new(path: &Path, cfg: &TransportConfig) -> Result<Self> {
        let spec = WavReader::open(path)
            .map_err(|e| VoxError::Config(format!("{}: {e}", path.display())))?
            .spec();

        let mut stages = vec![Stage::WavReader { path: path.to_path_buf() }];
        if spec.channels > 1 {
            stages.push(Stage::Downmix);
        }
        stages.extend(resample_stage(spec.sample_rate, cfg.canonical_rate));
        stages.push(Stage::RingWrite);

        Ok(Self {
            path: path.to_path_buf(),
            canonical_rate: cfg.canonical_rate,
            graph: PipelineGraph::new(GraphDirection::Source, stages)?,
            worker: None,
        })
    }
}

impl AudioSource for FileSource {
    fn graph(&self) -> &PipelineGraph {
        &self.graph
    }

    fn start(&mut self, ring: Arc<RingBuffer>, events: EventSender) -> Result<()> {
        if self.worker.is_some() {
            return Err(VoxError::Transport("file source already started".into()));
        }
        let mut reader = WavReader::open(&self.path)?;
        let spec = reader.spec();
        let mut converter = RateConverter::new(spec.sample_rate, self.canonical_rate, READ_FRAMES)?;
        let channels = spec.channels.max(1) as usize;
        let endpoint = format!("file-src:{}", self.path.display());
        info!(graph = %self.graph, "file source starting");

        let worker = Worker::spawn("vox-file-src", move |stop| {
            let mut interleaved = Vec::with_capacity(READ_FRAMES * channels);
            let mut delivered = 0usize;
            let mut samples = wav_samples(&mut reader);
            loop {
                if stop.load(Ordering::Acquire) {
                    debug!(endpoint = %endpoint, "file source stopped early");
                    return;
                }
                interleaved.clear();
                let mut failed = false;
                for s in samples.by_ref().take(READ_FRAMES * channels) {
                    match s {
                        Ok(v) => interleaved.push(v),
                        Err(e) => {
                            events.fault(&endpoint, VoxError::from(e));
                            failed = true;
                            break;
                        }
                    }
                }
                let exhausted = failed || interleaved.len() < READ_FRAMES * channels;

                let mono = downmix(&interleaved, channels);
                let mut out = converter.process(&mono);
                if exhausted {
                    out.extend(converter.finish());
                }
                delivered += out.len();
                if !super::write_with_room(&ring, &out, &stop) {
                    return;
                }
                if exhausted {
                    break;
                }
            }
            info!(endpoint = %endpoint, samples = delivered, "file source reached end of stream");
            events.end_of_stream(&endpoint);
        })?;
        self.worker = Some(worker);
        Ok(())
    }

    fn stop(&mut self, timeout: Duration) -> Result<()> {
        match self.worker.take() {
            Some(worker) => worker.join(timeout),
            None => Ok(()),
        }
    }
}

pub struct FileSink {
    path: PathBuf,
    sample_rate: u32,
    graph: PipelineGraph,
    queue: SinkQueue,
    rx: Option<crossbeam_channel::Receiver<Vec<f32>>>,
    worker: Option<Worker>,
}

impl FileSink {
    pub fn new(path: &Path, cfg: &TransportConfig) -> Result<Self> {
        let graph = PipelineGraph::new(
            GraphDirection::Sink,
            vec![
                Stage::QueueRead { capacity: cfg.sink_queue_capacity },
                Stage::WavWriter {
                    path: path.to_path_buf(),
                    sample_rate: cfg.canonical_rate,
                },
            ],
        )?;
        let (queue, rx) = SinkQueue::new(cfg.sink_queue_capacity, cfg.backpressure);
        Ok(Self {
            path: path.to_path_buf(),
            sample_rate: cfg.canonical_rate,
            graph,
            queue,
            rx: Some(rx),
            worker: None,
        })
    }
}

impl AudioSink for FileSink {
    fn graph(&self) -> &PipelineGraph {
        &self.graph
    }

    fn start(&mut self, events: EventSender) -> Result<()> {
        let rx = self
            .rx
            .take()
            .ok_or_else(|| VoxError::Transport("file sink already started".into()))?;
        let mut writer = WavWriter::create(&self.path, float_wav_spec(self.sample_rate))?;
        let endpoint = format!("file-sink:{}", self.path.display());
        info!(graph = %self.graph, "file sink starting");

        let worker = Worker::spawn("vox-file-sink", move |_stop| {
            let mut written = 0usize;
            let mut healthy = true;
            // Runs until the queue is closed and drained, so stop() never loses
            // audio that was already accepted.
            while let Some(buf) = recv_buffer(&rx) {
                if !healthy {
                    continue;
                }
                for s in &buf {
                    if let Err(e) = writer.write_sample(*s) {
                        events.fault(&endpoint, VoxError::from(e));
                        healthy = false;
                        break;
                    }
                }
                written += buf.len();
            }
            match writer.finalize() {
                Ok(()) => debug!(endpoint = %endpoint, samples = written, "wav finalized"),
                Err(e) => events.fault(&endpoint, VoxError::from(e)),
            }
        })?;
        self.worker = Some(worker);
        Ok(())
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
