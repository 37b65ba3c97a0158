//! Synthetic sine-tone source for tests, benchmarks and line checks.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::info;

use crate::audio::ToneGenerator;
use crate::buffering::RingBuffer;
use crate::error::{Result, VoxError};
use crate::transport::graph::{GraphDirection, PipelineGraph, Stage};
use crate::transport::worker::Worker;
use crate::transport::{AudioSource, EventSender, TransportConfig};

pub const TONE_AMPLITUDE: f32 = 0.5;

pub struct SyntheticSource {
    frequency: f32,
    total_samples: Option<usize>,
    paced: bool,
    sample_rate: u32,
    block: usize,
    graph: PipelineGraph,
    worker: Option<Worker>,
}

impl SyntheticSource {
    pub fn new(
        frequency: f32,
        duration_secs: Option<f32>,
        paced: bool,
        cfg: &TransportConfig,
    ) -> Result<Self> {
        let graph = PipelineGraph::new(
            GraphDirection::Source,
            vec![
                Stage::Tone {
                    frequency,
                    duration_secs,
                    paced,
                },
                Stage::RingWrite,
            ],
        )?;
        Ok(Self {
            frequency,
            total_samples: duration_secs
                .map(|d| (d as f64 * cfg.canonical_rate as f64).round() as usize),
            paced,
            sample_rate: cfg.canonical_rate,
            block: cfg.frame_samples(cfg.canonical_rate),
            graph,
            worker: None,
        })
    }

    /// The exact samples this source emits first, for comparing against
    /// session output.
    pub fn expected_samples(&self, n: usize) -> Vec<f32> {
        ToneGenerator::new(self.frequency, TONE_AMPLITUDE, self.sample_rate).next_block(n)
    }
}

impl AudioSource for SyntheticSource {
    fn graph(&self) -> &PipelineGraph {
        &self.graph
    }

    fn start(&mut self, ring: Arc<RingBuffer>, events: EventSender) -> Result<()> {
        if self.worker.is_some() {
            return Err(VoxError::Transport("synthetic source already started".into()));
        }
        let mut gen = ToneGenerator::new(self.frequency, TONE_AMPLITUDE, self.sample_rate);
        let (total, paced, block, rate) = (self.total_samples, self.paced, self.block, self.sample_rate);
        let endpoint = format!("tone:{}Hz", self.frequency);
        info!(graph = %self.graph, "synthetic source starting");

        let worker = Worker::spawn("vox-tone-src", move |stop| {
            let started = Instant::now();
            let mut produced = 0usize;
            while !stop.load(Ordering::Acquire) {
                let n = match total {
                    Some(t) if produced >= t => break,
                    Some(t) => block.min(t - produced),
                    None => block,
                };
                let samples = gen.next_block(n);
                if paced {
                    let due = Duration::from_secs_f64(produced as f64 / rate as f64);
                    if let Some(wait) = due.checked_sub(started.elapsed()) {
                        std::thread::sleep(wait);
                    }
                    ring.write(&samples);
                } else if !super::write_with_room(&ring, &samples, &stop) {
                    return;
                }
                produced += n;
            }
            if total.is_some_and(|t| produced >= t) {
                events.end_of_stream(&endpoint);
            }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{event_channel, EndpointEvent};

    #[test]
    fn timed_tone_emits_exact_duration_then_eos() {
        let cfg = TransportConfig::for_rate(22_050);
        let mut src = SyntheticSource::new(440.0, Some(0.5), false, &cfg).unwrap();
        let ring = Arc::new(RingBuffer::new(22_050));
        let (tx, rx) = event_channel(4);
        src.start(Arc::clone(&ring), tx).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut events = Vec::new();
        while events.is_empty() && Instant::now() < deadline {
            events = rx.drain();
            std::thread::sleep(Duration::from_millis(2));
        }
        src.stop(Duration::from_secs(1)).unwrap();
        assert!(matches!(events[0], EndpointEvent::EndOfStream { .. }));
        assert_eq!(ring.drain(), src.expected_samples(11_025));
    }

    #[test]
    fn paced_tone_runs_in_real_time() {
        let cfg = TransportConfig::for_rate(16_000);
        let mut src = SyntheticSource::new(200.0, None, true, &cfg).unwrap();
        let ring = Arc::new(RingBuffer::new(16_000));
        let (tx, _rx) = event_channel(4);
        src.start(Arc::clone(&ring), tx).unwrap();
        std::thread::sleep(Duration::from_millis(200));
        src.stop(Duration::from_secs(1)).unwrap();
        let n = ring.available();
        // ~3200 samples; generous bounds for loaded CI machines.
        assert!((1_600..=8_000).contains(&n), "got {n}");
    }
}
