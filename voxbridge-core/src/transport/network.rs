//! UDP endpoints carrying uncompressed PCM, either RTP/L16 or raw f32le.
//!
//! Both sides run at `TransportConfig::stream_rate` on the wire (48 kHz by
//! default) and resample to/from the canonical rate. The receiver is a live
//! source: it never waits for the session, so a stalled session loses the
//! oldest audio in the ring rather than building latency. On stop, whatever
//! the jitter buffer and resampler still hold is written out before the
//! worker exits.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::audio::resample::RateConverter;
use crate::buffering::RingBuffer;
use crate::error::{Result, VoxError};
use crate::transport::graph::{resample_stage, GraphDirection, PipelineGraph, Stage};
use crate::transport::rtp::{
    decode_f32le, decode_l16, encode_f32le, encode_l16, JitterBuffer, RtpPacket, RtpSequencer,
    DYNAMIC_PAYLOAD_TYPE,
};
use crate::transport::worker::{recv_buffer, SinkQueue, Worker, POLL_INTERVAL};
use crate::transport::{resolve, AudioSink, AudioSource, EventSender, Framing, TransportConfig};

/// Largest datagram we accept.
const MAX_DATAGRAM: usize = 65_536;

pub struct NetworkSource {
    bind: SocketAddr,
    framing: Framing,
    latency: Duration,
    stream_rate: u32,
    canonical_rate: u32,
    frame_samples: usize,
    graph: PipelineGraph,
    local_addr: Option<SocketAddr>,
    worker: Option<Worker>,
}

impl NetworkSource {
    pub fn new(
        host: &str,
        port: u16,
        latency_ms: u32,
        framing: Framing,
        cfg: &TransportConfig,
    ) -> Result<Self> {
        let bind = resolve(host, port)?;
        let mut stages = vec![Stage::UdpReceive { bind }];
        match framing {
            Framing::Rtp => {
                stages.push(Stage::JitterBuffer { latency_ms });
                stages.push(Stage::RtpDepayload { payload_type: DYNAMIC_PAYLOAD_TYPE });
                stages.push(Stage::L16Decode { sample_rate: cfg.stream_rate });
            }
            Framing::RawUdp => stages.push(Stage::F32Decode { sample_rate: cfg.stream_rate }),
        }
        stages.extend(resample_stage(cfg.stream_rate, cfg.canonical_rate));
        stages.push(Stage::RingWrite);

        Ok(Self {
            bind,
            framing,
            latency: Duration::from_millis(latency_ms as u64),
            stream_rate: cfg.stream_rate,
            canonical_rate: cfg.canonical_rate,
            frame_samples: cfg.frame_samples(cfg.stream_rate),
            graph: PipelineGraph::new(GraphDirection::Source, stages)?,
            local_addr: None,
            worker: None,
        })
    }

    /// Address actually bound, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

impl AudioSource for NetworkSource {
    fn graph(&self) -> &PipelineGraph {
        &self.graph
    }

    fn start(&mut self, ring: Arc<RingBuffer>, events: EventSender) -> Result<()> {
        if self.worker.is_some() {
            return Err(VoxError::Transport("network source already started".into()));
        }
        let socket = UdpSocket::bind(self.bind)
            .map_err(|e| VoxError::Transport(format!("cannot bind {}: {e}", self.bind)))?;
        socket.set_read_timeout(Some(POLL_INTERVAL))?;
        self.local_addr = socket.local_addr().ok();

        let mut converter =
            RateConverter::new(self.stream_rate, self.canonical_rate, self.frame_samples)?;
        let mut jitter = JitterBuffer::new(self.latency);
        let framing = self.framing;
        let endpoint = format!("udp-src:{}", self.bind);
        info!(graph = %self.graph, "network source listening");

        let worker = Worker::spawn("vox-net-src", move |stop| {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            let mut received = 0u64;
            let mut deliver = |samples: Vec<f32>| {
                let out = converter.process(&samples);
                if !out.is_empty() {
                    ring.write(&out);
                }
            };

            while !stop.load(Ordering::Acquire) {
                match socket.recv_from(&mut buf) {
                    Ok((n, _peer)) => {
                        received += 1;
                        match framing {
                            Framing::Rtp => match RtpPacket::parse(&buf[..n]) {
                                Ok(packet) => jitter.push(packet, Instant::now()),
                                Err(e) => events.fault(&endpoint, e),
                            },
                            Framing::RawUdp => deliver(decode_f32le(&buf[..n])),
                        }
                    }
                    Err(e)
                        if matches!(
                            e.kind(),
                            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                        ) => {}
                    Err(e) => {
                        events.fault(&endpoint, VoxError::Transport(format!("recv: {e}")));
                        std::thread::sleep(POLL_INTERVAL);
                    }
                }
                for payload in jitter.pop_ready(Instant::now()) {
                    deliver(decode_l16(&payload));
                }
            }

            for payload in jitter.flush() {
                deliver(decode_l16(&payload));
            }
            let tail = converter.finish();
            if !tail.is_empty() {
                ring.write(&tail);
            }

            let js = jitter.stats();
            debug!(
                endpoint = %endpoint,
                datagrams = received,
                late = js.late,
                lost = js.lost,
                duplicate = js.duplicate,
                mismatched = js.mismatched,
                resyncs = js.resyncs,
                "network source stopped"
            );
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

pub struct NetworkSink {
    dest: SocketAddr,
    framing: Framing,
    stream_rate: u32,
    canonical_rate: u32,
    frame_samples: usize,
    graph: PipelineGraph,
    queue: SinkQueue,
    rx: Option<crossbeam_channel::Receiver<Vec<f32>>>,
    worker: Option<Worker>,
}

impl NetworkSink {
    pub fn new(host: &str, port: u16, framing: Framing, cfg: &TransportConfig) -> Result<Self> {
        let dest = resolve(host, port)?;
        let frame_samples = cfg.frame_samples(cfg.stream_rate);
        let mut stages = vec![Stage::QueueRead { capacity: cfg.sink_queue_capacity }];
        stages.extend(resample_stage(cfg.canonical_rate, cfg.stream_rate));
        stages.push(Stage::Frame { samples: frame_samples });
        match framing {
            Framing::Rtp => {
                stages.push(Stage::L16Encode { sample_rate: cfg.stream_rate });
                stages.push(Stage::RtpPayload { payload_type: DYNAMIC_PAYLOAD_TYPE });
            }
            Framing::RawUdp => stages.push(Stage::F32Encode { sample_rate: cfg.stream_rate }),
        }
        stages.push(Stage::UdpSend { dest });

        let (queue, rx) = SinkQueue::new(cfg.sink_queue_capacity, cfg.backpressure);
        Ok(Self {
            dest,
            framing,
            stream_rate: cfg.stream_rate,
            canonical_rate: cfg.canonical_rate,
            frame_samples,
            graph: PipelineGraph::new(GraphDirection::Sink, stages)?,
            queue,
            rx: Some(rx),
            worker: None,
        })
    }
}

impl AudioSink for NetworkSink {
    fn graph(&self) -> &PipelineGraph {
        &self.graph
    }

    fn start(&mut self, events: EventSender) -> Result<()> {
        let rx = self
            .rx
            .take()
            .ok_or_else(|| VoxError::Transport("network sink already started".into()))?;
        let local: SocketAddr = if self.dest.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(local)
            .map_err(|e| VoxError::Transport(format!("cannot bind sender socket: {e}")))?;
        let mut converter =
            RateConverter::new(self.canonical_rate, self.stream_rate, self.frame_samples)?;
        let mut sequencer = RtpSequencer::new(DYNAMIC_PAYLOAD_TYPE);
        let (dest, framing, frame) = (self.dest, self.framing, self.frame_samples);
        let endpoint = format!("udp-sink:{dest}");
        info!(graph = %self.graph, "network sink starting");

        let worker = Worker::spawn("vox-net-sink", move |_stop| {
            let mut pending: Vec<f32> = Vec::with_capacity(frame * 4);
            let mut sent = 0u64;
            let mut send = |samples: &[f32]| {
                let bytes = match framing {
                    Framing::Rtp => sequencer.next_packet(encode_l16(samples), samples.len()).encode(),
                    Framing::RawUdp => encode_f32le(samples),
                };
                match socket.send_to(&bytes, dest) {
                    Ok(_) => sent += 1,
                    Err(e) => events.fault(&endpoint, VoxError::Transport(format!("send: {e}"))),
                }
            };

            while let Some(buf) = recv_buffer(&rx) {
                if buf.is_empty() {
                    continue;
                }
                pending.extend(converter.process(&buf));
                let whole = pending.len() / frame * frame;
                for f in pending[..whole].chunks(frame) {
                    send(f);
                }
                pending.drain(..whole);
            }

            pending.extend(converter.finish());
            for f in pending.chunks(frame) {
                send(f);
            }
            debug!(endpoint = %endpoint, packets = sent, "network sink drained");
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
