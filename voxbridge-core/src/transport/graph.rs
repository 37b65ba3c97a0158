//! Typed description of what an endpoint does, stage by stage.
//!
//! Every endpoint carries a `PipelineGraph` built from its descriptor and
//! validated before any I/O starts. The graph is what gets logged when an
//! endpoint starts, so an operator can see the exact chain:
//!
//! ```text
//! udp-recv(0.0.0.0:5004) ! jitter(50ms) ! rtp-depay(pt=96) ! l16-decode(48000Hz) ! resample(48000->22050) ! ring
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::audio::device::DeviceDirection;
use crate::error::{Result, VoxError};

/// Which way samples flow through the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphDirection {
    /// Outside world → session input ring.
    Source,
    /// Session output → outside world.
    Sink,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    // Producers (first stage of a source graph)
    WavReader { path: PathBuf },
    UdpReceive { bind: SocketAddr },
    DeviceCapture { device: Option<String> },
    Tone { frequency: f32, duration_secs: Option<f32>, paced: bool },

    // Transforms
    JitterBuffer { latency_ms: u32 },
    RtpDepayload { payload_type: u8 },
    RtpPayload { payload_type: u8 },
    L16Decode { sample_rate: u32 },
    L16Encode { sample_rate: u32 },
    F32Decode { sample_rate: u32 },
    F32Encode { sample_rate: u32 },
    Downmix,
    Resample { from: u32, to: u32 },
    Frame { samples: usize },

    // Session side
    RingWrite,
    QueueRead { capacity: usize },

    // Consumers (last stage of a sink graph)
    WavWriter { path: PathBuf, sample_rate: u32 },
    UdpSend { dest: SocketAddr },
    DevicePlayback { device: Option<String> },
}

impl Stage {
    fn is_producer(&self) -> bool {
        matches!(
            self,
            Stage::WavReader { .. }
                | Stage::UdpReceive { .. }
                | Stage::DeviceCapture { .. }
                | Stage::Tone { .. }
        )
    }

    fn is_consumer(&self) -> bool {
        matches!(
            self,
            Stage::WavWriter { .. } | Stage::UdpSend { .. } | Stage::DevicePlayback { .. }
        )
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::WavReader { path } => write!(f, "wav-read({})", path.display()),
            Stage::UdpReceive { bind } => write!(f, "udp-recv({bind})"),
            Stage::DeviceCapture { device } => {
                write!(f, "capture({})", device.as_deref().unwrap_or("default"))
            }
            Stage::Tone {
                frequency,
                duration_secs,
                paced,
            } => {
                write!(f, "tone({frequency}Hz")?;
                if let Some(d) = duration_secs {
                    write!(f, ", {d}s")?;
                }
                if *paced {
                    f.write_str(", paced")?;
                }
                f.write_str(")")
            }
            Stage::JitterBuffer { latency_ms } => write!(f, "jitter({latency_ms}ms)"),
            Stage::RtpDepayload { payload_type } => write!(f, "rtp-depay(pt={payload_type})"),
            Stage::RtpPayload { payload_type } => write!(f, "rtp-pay(pt={payload_type})"),
            Stage::L16Decode { sample_rate } => write!(f, "l16-decode({sample_rate}Hz)"),
            Stage::L16Encode { sample_rate } => write!(f, "l16-encode({sample_rate}Hz)"),
            Stage::F32Decode { sample_rate } => write!(f, "f32le-decode({sample_rate}Hz)"),
            Stage::F32Encode { sample_rate } => write!(f, "f32le-encode({sample_rate}Hz)"),
            Stage::Downmix => f.write_str("downmix"),
            Stage::Resample { from, to } => write!(f, "resample({from}->{to})"),
            Stage::Frame { samples } => write!(f, "frame({samples})"),
            Stage::RingWrite => f.write_str("ring"),
            Stage::QueueRead { capacity } => write!(f, "queue({capacity})"),
            Stage::WavWriter { path, sample_rate } => {
                write!(f, "wav-write({}, {sample_rate}Hz)", path.display())
            }
            Stage::UdpSend { dest } => write!(f, "udp-send({dest})"),
            Stage::DevicePlayback { device } => {
                write!(f, "playback({})", device.as_deref().unwrap_or("default"))
            }
        }
    }
}

/// Ordered stage chain of one endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineGraph {
    direction: GraphDirection,
    stages: Vec<Stage>,
}

impl PipelineGraph {
    /// Build and validate in one step.
    pub fn new(direction: GraphDirection, stages: Vec<Stage>) -> Result<Self> {
        let graph = Self { direction, stages };
        graph.validate()?;
        Ok(graph)
    }

    pub fn direction(&self) -> GraphDirection {
        self.direction
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Structural checks: one producer/consumer at the right end, session
    /// stage at the other, sane parameters, RTP stages in a valid order.
    pub fn validate(&self) -> Result<()> {
        let (first, last) = match (self.stages.first(), self.stages.last()) {
            (Some(f), Some(l)) if self.stages.len() >= 2 => (f, l),
            _ => return Err(invalid("a graph needs at least two stages")),
        };

        match self.direction {
            GraphDirection::Source => {
                if !first.is_producer() {
                    return Err(invalid(format!("source graph must start with a producer, got {first}")));
                }
                if *last != Stage::RingWrite {
                    return Err(invalid(format!("source graph must end at the ring, got {last}")));
                }
            }
            GraphDirection::Sink => {
                if !matches!(first, Stage::QueueRead { .. }) {
                    return Err(invalid(format!("sink graph must start at the queue, got {first}")));
                }
                if !last.is_consumer() {
                    return Err(invalid(format!("sink graph must end with a consumer, got {last}")));
                }
            }
        }

        let producers = self.stages.iter().filter(|s| s.is_producer()).count();
        let consumers = self.stages.iter().filter(|s| s.is_consumer()).count();
        let expected = match self.direction {
            GraphDirection::Source => (1, 0),
            GraphDirection::Sink => (0, 1),
        };
        if (producers, consumers) != expected {
            return Err(invalid(format!(
                "expected {} producer(s) and {} consumer(s), found {producers} and {consumers}",
                expected.0, expected.1
            )));
        }

        for (idx, stage) in self.stages.iter().enumerate() {
            check_stage(stage)?;
            let prev = idx.checked_sub(1).map(|i| &self.stages[i]);
            match stage {
                Stage::RtpDepayload { .. } => {
                    if !matches!(prev, Some(Stage::JitterBuffer { .. } | Stage::UdpReceive { .. })) {
                        return Err(invalid("rtp-depay must follow the UDP receiver or jitter buffer"));
                    }
                }
                Stage::JitterBuffer { .. } => {
                    if !matches!(prev, Some(Stage::UdpReceive { .. })) {
                        return Err(invalid("jitter buffer must directly follow the UDP receiver"));
                    }
                }
                Stage::UdpSend { .. } => {
                    if !matches!(prev, Some(Stage::RtpPayload { .. } | Stage::F32Encode { .. })) {
                        return Err(invalid("udp-send needs an encoded payload in front of it"));
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

fn check_stage(stage: &Stage) -> Result<()> {
    match stage {
        Stage::Tone { frequency, duration_secs, .. } => {
            if !frequency.is_finite() || *frequency <= 0.0 {
                return Err(invalid(format!("tone frequency must be positive, got {frequency}")));
            }
            if let Some(d) = duration_secs {
                if !d.is_finite() || *d <= 0.0 {
                    return Err(invalid(format!("tone duration must be positive, got {d}")));
                }
            }
        }
        Stage::L16Decode { sample_rate }
        | Stage::L16Encode { sample_rate }
        | Stage::F32Decode { sample_rate }
        | Stage::F32Encode { sample_rate }
        | Stage::WavWriter { sample_rate, .. } => {
            if *sample_rate == 0 {
                return Err(invalid(format!("{stage}: sample rate must be positive")));
            }
        }
        Stage::Resample { from, to } => {
            if *from == 0 || *to == 0 || from == to {
                return Err(invalid(format!("{stage}: rates must be positive and differ")));
            }
        }
        Stage::Frame { samples } | Stage::QueueRead { capacity: samples } => {
            if *samples == 0 {
                return Err(invalid(format!("{stage}: size must be positive")));
            }
        }
        Stage::UdpReceive { bind } if bind.port() == 0 => {
            return Err(invalid("udp-recv needs a non-zero port"));
        }
        Stage::UdpSend { dest } if dest.port() == 0 => {
            return Err(invalid("udp-send needs a non-zero port"));
        }
        _ => {}
    }
    Ok(())
}

fn invalid(msg: impl Into<String>) -> VoxError {
    VoxError::Config(format!("invalid pipeline: {}", msg.into()))
}

impl fmt::Display for PipelineGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, stage) in self.stages.iter().enumerate() {
            if i > 0 {
                f.write_str(" ! ")?;
            }
            write!(f, "{stage}")?;
        }
        Ok(())
    }
}

/// Resample stage only when rates differ.
pub(crate) fn resample_stage(from: u32, to: u32) -> Option<Stage> {
    (from != to).then_some(Stage::Resample { from, to })
}

/// Device direction a graph direction needs.
pub(crate) fn device_direction(direction: GraphDirection) -> DeviceDirection {
    match direction {
        GraphDirection::Source => DeviceDirection::Capture,
        GraphDirection::Sink => DeviceDirection::Playback,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn rtp_source() -> Vec<Stage> {
        vec![
            Stage::UdpReceive { bind: addr(5004) },
            Stage::JitterBuffer { latency_ms: 50 },
            Stage::RtpDepayload { payload_type: 96 },
            Stage::L16Decode { sample_rate: 48_000 },
            Stage::Resample { from: 48_000, to: 22_050 },
            Stage::RingWrite,
        ]
    }

    #[test]
    fn valid_rtp_source_renders_chain() {
        let g = PipelineGraph::new(GraphDirection::Source, rtp_source()).unwrap();
        assert_eq!(
            g.to_string(),
            "udp-recv(127.0.0.1:5004) ! jitter(50ms) ! rtp-depay(pt=96) ! l16-decode(48000Hz) ! resample(48000->22050) ! ring"
        );
    }

    #[test]
    fn source_must_end_at_ring() {
        let mut stages = rtp_source();
        stages.pop();
        assert!(PipelineGraph::new(GraphDirection::Source, stages).is_err());
    }

    #[test]
    fn sink_must_start_at_queue() {
        let stages = vec![
            Stage::RtpPayload { payload_type: 96 },
            Stage::UdpSend { dest: addr(5005) },
        ];
        let err = PipelineGraph::new(GraphDirection::Sink, stages).unwrap_err();
        assert_eq!(err.kind(), "config_error");
    }

    #[test]
    fn jitter_buffer_placement_is_checked() {
        let stages = vec![
            Stage::UdpReceive { bind: addr(5004) },
            Stage::RtpDepayload { payload_type: 96 },
            Stage::JitterBuffer { latency_ms: 50 },
            Stage::RingWrite,
        ];
        assert!(PipelineGraph::new(GraphDirection::Source, stages).is_err());
    }

    #[test]
    fn second_producer_is_rejected() {
        let stages = vec![
            Stage::Tone { frequency: 440.0, duration_secs: None, paced: false },
            Stage::WavReader { path: "a.wav".into() },
            Stage::RingWrite,
        ];
        assert!(PipelineGraph::new(GraphDirection::Source, stages).is_err());
    }

    #[test]
    fn bad_parameters_are_rejected() {
        let tone = |frequency, duration_secs| {
            PipelineGraph::new(
                GraphDirection::Source,
                vec![Stage::Tone { frequency, duration_secs, paced: false }, Stage::RingWrite],
            )
        };
        assert!(tone(440.0, Some(1.0)).is_ok());
        assert!(tone(-1.0, None).is_err());
        assert!(tone(440.0, Some(0.0)).is_err());

        let sink = PipelineGraph::new(
            GraphDirection::Sink,
            vec![
                Stage::QueueRead { capacity: 0 },
                Stage::WavWriter { path: "o.wav".into(), sample_rate: 22_050 },
            ],
        );
        assert!(sink.is_err());
    }

    #[test]
    fn udp_send_needs_encoder() {
        let stages = vec![
            Stage::QueueRead { capacity: 8 },
            Stage::Frame { samples: 960 },
            Stage::UdpSend { dest: addr(5005) },
        ];
        assert!(PipelineGraph::new(GraphDirection::Sink, stages).is_err());
    }
}
