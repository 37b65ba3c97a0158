//! Transport endpoints: where session audio comes from and where it goes.
//!
//! ## Threading
//!
//! ```text
//! source worker ──write──► RingBuffer(in) ──read──► chunk loop
//! chunk loop ──push──► bounded queue ──recv──► sink worker
//! any worker ──EndpointEvent──► bounded event channel ──drain──► chunk loop
//! ```
//!
//! One named thread per endpoint. Workers never return errors across the
//! thread boundary: faults travel as `EndpointEvent::Fault` and are counted by
//! the session. A finite source (file, timed tone) reports
//! `EndpointEvent::EndOfStream` after its last sample is in the ring.
//!
//! All samples crossing the session boundary are mono f32 at the session's
//! canonical rate (`TransportConfig::canonical_rate`); endpoints resample to
//! and from their own rates.

pub mod device;
pub mod file;
pub mod graph;
pub mod network;
pub mod rtp;
pub mod synthetic;
pub(crate) mod worker;

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub use crate::audio::device::DeviceDirection;
pub use graph::{GraphDirection, PipelineGraph, Stage};
pub use worker::Backpressure;

use crate::buffering::RingBuffer;
use crate::error::{Result, VoxError};

pub const DEFAULT_INPUT_PORT: u16 = 5004;
pub const DEFAULT_OUTPUT_PORT: u16 = 5005;
pub const DEFAULT_JITTER_LATENCY_MS: u32 = 50;
pub const MAX_JITTER_LATENCY_MS: u32 = 2_000;
pub const DEFAULT_STREAM_RATE: u32 = 48_000;

/// Payload layout of a network endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Framing {
    /// RTP header + L16 big-endian PCM.
    #[default]
    Rtp,
    /// Bare datagrams of f32 little-endian PCM.
    #[serde(alias = "udp")]
    RawUdp,
}

impl std::str::FromStr for Framing {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rtp" => Ok(Framing::Rtp),
            "udp" | "rawudp" | "raw-udp" | "raw" => Ok(Framing::RawUdp),
            other => Err(format!("unknown framing '{other}' (expected rtp or udp)")),
        }
    }
}

/// Where an endpoint reads or writes audio. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum EndpointDescriptor {
    File {
        path: PathBuf,
    },
    #[serde(rename_all = "camelCase")]
    Network {
        host: String,
        port: u16,
        latency_ms: u32,
        framing: Framing,
    },
    #[serde(rename_all = "camelCase")]
    Device {
        direction: DeviceDirection,
        device_name: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Synthetic {
        frequency: f32,
        duration_secs: Option<f32>,
        paced: bool,
    },
}

impl EndpointDescriptor {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        EndpointDescriptor::File { path: path.into() }
    }

    /// RTP endpoint with the default jitter latency.
    pub fn network(host: impl Into<String>, port: u16) -> Self {
        EndpointDescriptor::Network {
            host: host.into(),
            port,
            latency_ms: DEFAULT_JITTER_LATENCY_MS,
            framing: Framing::Rtp,
        }
    }

    pub fn synthetic(frequency: f32, duration_secs: Option<f32>) -> Self {
        EndpointDescriptor::Synthetic {
            frequency,
            duration_secs,
            paced: false,
        }
    }

    /// Checks that need no I/O beyond looking at the filesystem.
    pub fn validate(&self, direction: GraphDirection, cfg: &TransportConfig) -> Result<()> {
        match self {
            EndpointDescriptor::File { path } => match direction {
                GraphDirection::Source => check_readable_wav(path),
                GraphDirection::Sink => check_writable_dir(path),
            },
            EndpointDescriptor::Network {
                host,
                port,
                latency_ms,
                ..
            } => {
                if *port == 0 {
                    return Err(VoxError::Config("port must be in 1..=65535".into()));
                }
                if host.trim().is_empty() {
                    return Err(VoxError::Config("network host must not be empty".into()));
                }
                if *latency_ms > MAX_JITTER_LATENCY_MS {
                    return Err(VoxError::Config(format!(
                        "jitter latency {latency_ms} ms exceeds {MAX_JITTER_LATENCY_MS} ms"
                    )));
                }
                Ok(())
            }
            EndpointDescriptor::Device { direction: d, .. } => {
                let wanted = graph::device_direction(direction);
                if *d != wanted {
                    return Err(VoxError::Config(format!(
                        "a {d} device cannot be used where a {wanted} device is needed"
                    )));
                }
                Ok(())
            }
            EndpointDescriptor::Synthetic {
                frequency,
                duration_secs,
                ..
            } => {
                if direction != GraphDirection::Source {
                    return Err(VoxError::Config("a synthetic endpoint can only be a source".into()));
                }
                let nyquist = cfg.canonical_rate as f32 / 2.0;
                if !(frequency.is_finite() && *frequency > 0.0 && *frequency < nyquist) {
                    return Err(VoxError::Config(format!(
                        "tone frequency {frequency} Hz must be in (0, {nyquist})"
                    )));
                }
                if let Some(d) = duration_secs {
                    if !(d.is_finite() && *d > 0.0) {
                        return Err(VoxError::Config(format!("tone duration {d} s must be positive")));
                    }
                }
                Ok(())
            }
        }
    }
}

fn check_readable_wav(path: &Path) -> Result<()> {
    if !path.is_file() {
        return Err(VoxError::Config(format!("source file {} does not exist", path.display())));
    }
    hound::WavReader::open(path)
        .map(|_| ())
        .map_err(|e| VoxError::Config(format!("source file {} is not a readable WAV: {e}", path.display())))
}

fn check_writable_dir(path: &Path) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    if !dir.is_dir() {
        return Err(VoxError::Config(format!("sink directory {} does not exist", dir.display())));
    }
    Ok(())
}

/// Resolve `host:port`, preferring IPv4.
pub fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| VoxError::Config(format!("cannot resolve {host}:{port}: {e}")))?
        .collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| VoxError::Config(format!("{host}:{port} resolved to no address")))
}

/// Rates, framing and queueing shared by all endpoints of one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TransportConfig {
    /// Rate of every sample crossing the session boundary (the model's rate).
    pub canonical_rate: u32,
    /// On-the-wire rate of network endpoints.
    pub stream_rate: u32,
    /// Network packet duration.
    pub frame_ms: u32,
    /// Sink queue depth, in pushed buffers.
    pub sink_queue_capacity: usize,
    pub backpressure: Backpressure,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            canonical_rate: 22_050,
            stream_rate: DEFAULT_STREAM_RATE,
            frame_ms: 20,
            sink_queue_capacity: 64,
            backpressure: Backpressure::default(),
        }
    }
}

impl TransportConfig {
    pub fn for_rate(canonical_rate: u32) -> Self {
        Self {
            canonical_rate,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.canonical_rate == 0 || self.stream_rate == 0 {
            return Err(VoxError::Config("sample rates must be positive".into()));
        }
        if !(5..=200).contains(&self.frame_ms) {
            return Err(VoxError::Config(format!(
                "frame_ms {} outside 5..=200",
                self.frame_ms
            )));
        }
        if self.sink_queue_capacity == 0 {
            return Err(VoxError::Config("sink queue capacity must be positive".into()));
        }
        Ok(())
    }

    /// Samples per network frame at `rate`.
    pub fn frame_samples(&self, rate: u32) -> usize {
        ((rate as u64 * self.frame_ms as u64) / 1_000).max(1) as usize
    }
}

/// Out-of-band notifications from endpoint workers.
#[derive(Debug)]
pub enum EndpointEvent {
    Fault { endpoint: String, error: VoxError },
    EndOfStream { endpoint: String },
}

/// Cloneable handle workers use to report events. Never blocks on faults.
#[derive(Clone)]
pub struct EventSender {
    tx: Sender<EndpointEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventSender {
    /// Report a recoverable fault. Dropped (and counted) when the channel is full.
    pub fn fault(&self, endpoint: &str, error: VoxError) {
        warn!(endpoint, kind = error.kind(), "endpoint fault: {error}");
        let event = EndpointEvent::Fault {
            endpoint: endpoint.to_string(),
            error,
        };
        if let Err(TrySendError::Full(_)) = self.tx.try_send(event) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Report end of stream. Waits briefly for room since losing it would
    /// leave the session running forever.
    pub fn end_of_stream(&self, endpoint: &str) {
        let event = EndpointEvent::EndOfStream {
            endpoint: endpoint.to_string(),
        };
        if let Err(crossbeam_channel::SendTimeoutError::Timeout(_)) =
            self.tx.send_timeout(event, Duration::from_secs(2))
        {
            warn!(endpoint, "event channel full; end of stream not delivered");
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Session-side end of the event channel.
pub struct EventReceiver {
    rx: Receiver<EndpointEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventReceiver {
    /// Everything queued right now.
    pub fn drain(&self) -> Vec<EndpointEvent> {
        self.rx.try_iter().collect()
    }

    /// Events lost to a full channel so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    let (tx, rx) = bounded(capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    (
        EventSender {
            tx,
            dropped: Arc::clone(&dropped),
        },
        EventReceiver { rx, dropped },
    )
}

/// Produces audio into the session's input ring.
pub trait AudioSource: Send {
    fn graph(&self) -> &PipelineGraph;

    /// Spawn the worker. Returns once the underlying resource is open.
    fn start(&mut self, ring: Arc<RingBuffer>, events: EventSender) -> Result<()>;

    /// Stop and release the resource, waiting at most `timeout` for the worker.
    fn stop(&mut self, timeout: Duration) -> Result<()>;
}

/// Consumes the session's converted audio.
pub trait AudioSink: Send {
    fn graph(&self) -> &PipelineGraph;

    fn start(&mut self, events: EventSender) -> Result<()>;

    /// Hand over samples at the canonical rate, subject to the back-pressure
    /// policy.
    fn push(&mut self, samples: &[f32]) -> Result<()>;

    /// Flush everything pushed so far, release the resource and join the
    /// worker within `timeout`.
    fn stop(&mut self, timeout: Duration) -> Result<()>;
}

/// Validate `desc` and build the matching source. No I/O starts here.
pub fn open_source(desc: &EndpointDescriptor, cfg: &TransportConfig) -> Result<Box<dyn AudioSource>> {
    cfg.validate()?;
    desc.validate(GraphDirection::Source, cfg)?;
    let source: Box<dyn AudioSource> = match desc {
        EndpointDescriptor::File { path } => Box::new(file::FileSource::new(path, cfg)?),
        EndpointDescriptor::Network {
            host,
            port,
            latency_ms,
            framing,
        } => Box::new(network::NetworkSource::new(host, *port, *latency_ms, *framing, cfg)?),
        EndpointDescriptor::Device { device_name, .. } => {
            Box::new(device::DeviceSource::new(device_name.clone(), cfg)?)
        }
        EndpointDescriptor::Synthetic {
            frequency,
            duration_secs,
            paced,
        } => Box::new(synthetic::SyntheticSource::new(*frequency, *duration_secs, *paced, cfg)?),
    };
    tracing::debug!(graph = %source.graph(), "source built");
    Ok(source)
}

/// Validate `desc` and build the matching sink. No I/O starts here.
pub fn open_sink(desc: &EndpointDescriptor, cfg: &TransportConfig) -> Result<Box<dyn AudioSink>> {
    cfg.validate()?;
    desc.validate(GraphDirection::Sink, cfg)?;
    let sink: Box<dyn AudioSink> = match desc {
        EndpointDescriptor::File { path } => Box::new(file::FileSink::new(path, cfg)?),
        EndpointDescriptor::Network {
            host,
            port,
            framing,
            ..
        } => Box::new(network::NetworkSink::new(host, *port, *framing, cfg)?),
        EndpointDescriptor::Device { device_name, .. } => {
            Box::new(device::DeviceSink::new(device_name.clone(), cfg)?)
        }
        EndpointDescriptor::Synthetic { .. } => {
            return Err(VoxError::Config("a synthetic endpoint can only be a source".into()))
        }
    };
    tracing::debug!(graph = %sink.graph(), "sink built");
    Ok(sink)
}

/// Write `samples` into `ring` without overwriting unread audio: waits for
/// room in short sleeps. Used by sources that are not real-time (files,
/// unpaced tones). Returns `false` if `stop` was raised first.
pub(crate) fn write_with_room(
    ring: &RingBuffer,
    samples: &[f32],
    stop: &std::sync::atomic::AtomicBool,
) -> bool {
    for block in samples.chunks(ring.capacity().max(1)) {
        while ring.capacity() - ring.available() < block.len() {
            if stop.load(Ordering::Acquire) {
                return false;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        ring.write(block);
    }
    true
}
