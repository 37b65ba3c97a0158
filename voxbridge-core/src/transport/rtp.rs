//! RTP (RFC 3550) packets, PCM payload codecs and a reordering jitter buffer.
//!
//! Only what an uncompressed mono audio stream needs: L16 (big-endian i16,
//! RFC 3551) and raw f32 little-endian payloads, dynamic payload type 96.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{Result, VoxError};

pub const RTP_VERSION: u8 = 2;
pub const RTP_HEADER_LEN: usize = 12;
pub const DYNAMIC_PAYLOAD_TYPE: u8 = 96;
/// Packets further behind the release point than this belong to a restarted
/// sender rather than a reordered one (RFC 3550, appendix A.1).
const MAX_MISORDER: u64 = 100;

/// Fixed part of an RTP header. CSRCs and extensions are skipped on parse and
/// never written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub header: RtpHeader,
    pub payload: Vec<u8>,
}

fn malformed(msg: impl Into<String>) -> VoxError {
    VoxError::Transport(format!("malformed RTP packet: {}", msg.into()))
}

impl RtpPacket {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < RTP_HEADER_LEN {
            return Err(malformed(format!("{} bytes is shorter than the header", buf.len())));
        }
        let version = buf[0] >> 6;
        if version != RTP_VERSION {
            return Err(malformed(format!("version {version}")));
        }
        let padding = buf[0] & 0x20 != 0;
        let extension = buf[0] & 0x10 != 0;
        let csrc_count = (buf[0] & 0x0f) as usize;

        let header = RtpHeader {
            marker: buf[1] & 0x80 != 0,
            payload_type: buf[1] & 0x7f,
            sequence: u16::from_be_bytes([buf[2], buf[3]]),
            timestamp: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            ssrc: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
        };

        let mut offset = RTP_HEADER_LEN + 4 * csrc_count;
        if extension {
            if buf.len() < offset + 4 {
                return Err(malformed("truncated extension header"));
            }
            let words = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]) as usize;
            offset += 4 + 4 * words;
        }
        if buf.len() < offset {
            return Err(malformed("header runs past the end of the packet"));
        }

        let mut end = buf.len();
        if padding {
            let pad = buf[end - 1] as usize;
            if pad == 0 || pad > end - offset {
                return Err(malformed(format!("invalid padding length {pad}")));
            }
            end -= pad;
        }

        Ok(Self {
            header,
            payload: buf[offset..end].to_vec(),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let h = &self.header;
        let mut out = Vec::with_capacity(RTP_HEADER_LEN + self.payload.len());
        out.push(RTP_VERSION << 6);
        out.push(((h.marker as u8) << 7) | (h.payload_type & 0x7f));
        out.extend_from_slice(&h.sequence.to_be_bytes());
        out.extend_from_slice(&h.timestamp.to_be_bytes());
        out.extend_from_slice(&h.ssrc.to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }
}

/// f32 samples → L16 big-endian, clamped to [-1, 1].
pub fn encode_l16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        let v = (s.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16;
        out.extend_from_slice(&v.to_be_bytes());
    }
    out
}

/// L16 big-endian → f32. A trailing odd byte is ignored.
pub fn decode_l16(payload: &[u8]) -> Vec<f32> {
    payload
        .chunks_exact(2)
        .map(|b| i16::from_be_bytes([b[0], b[1]]) as f32 / 32_768.0)
        .collect()
}

pub fn encode_f32le(samples: &[f32]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// f32 little-endian → f32. Trailing partial samples are ignored.
pub fn decode_f32le(payload: &[u8]) -> Vec<f32> {
    payload
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// Stamps outgoing packets with sequence number, timestamp and SSRC.
#[derive(Debug)]
pub struct RtpSequencer {
    payload_type: u8,
    sequence: u16,
    timestamp: u32,
    ssrc: u32,
}

impl RtpSequencer {
    /// Random SSRC and initial sequence/timestamp, as RFC 3550 recommends.
    pub fn new(payload_type: u8) -> Self {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        Self::with_state(payload_type, rng.gen(), rng.gen(), rng.gen())
    }

    pub fn with_state(payload_type: u8, ssrc: u32, sequence: u16, timestamp: u32) -> Self {
        Self {
            payload_type,
            sequence,
            timestamp,
            ssrc,
        }
    }

    /// Wrap `payload` carrying `samples` samples into the next packet.
    pub fn next_packet(&mut self, payload: Vec<u8>, samples: usize) -> RtpPacket {
        let packet = RtpPacket {
            header: RtpHeader {
                marker: false,
                payload_type: self.payload_type,
                sequence: self.sequence,
                timestamp: self.timestamp,
                ssrc: self.ssrc,
            },
            payload,
        };
        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(samples as u32);
        packet
    }
}

/// Extends 16-bit sequence numbers to a monotonic 64-bit space.
#[derive(Debug, Default)]
struct SequenceUnwrapper {
    highest: Option<u64>,
}

impl SequenceUnwrapper {
    fn unwrap(&mut self, seq: u16) -> u64 {
        let ext = match self.highest {
            // Start one cycle in so slightly older packets stay representable.
            None => seq as u64 + (1 << 16),
            Some(high) => {
                let delta = seq.wrapping_sub(high as u16) as i16;
                (high as i64 + delta as i64).max(0) as u64
            }
        };
        if self.highest.map_or(true, |h| ext > h) {
            self.highest = Some(ext);
        }
        ext
    }
}

/// Counters kept by the jitter buffer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct JitterStats {
    pub received: u64,
    pub late: u64,
    pub duplicate: u64,
    pub lost: u64,
    /// Dropped for carrying a payload type other than `DYNAMIC_PAYLOAD_TYPE`.
    pub mismatched: u64,
    /// Sender restarts (new SSRC or a sequence jump back) resynchronised on.
    pub resyncs: u64,
}

/// Reorders packets by sequence number.
///
/// The next expected packet is released as soon as it arrives. Anything else
/// waits until it has been held for `latency`, at which point the gap in front
/// of it is declared lost. Packets older than the release point are dropped
/// as late.
///
/// A new SSRC, or two consecutive packets more than `MAX_MISORDER` behind
/// the release point, start a new sequence space. What the old sender left
/// pending is released first, in order.
#[derive(Debug)]
pub struct JitterBuffer {
    latency: Duration,
    max_depth: usize,
    pending: BTreeMap<u64, (Instant, Vec<u8>)>,
    /// Payloads of a previous sender awaiting release.
    retired: Vec<Vec<u8>>,
    next: Option<u64>,
    ssrc: Option<u32>,
    /// Sequence number that confirms a same-SSRC restart if it comes next.
    restart_candidate: Option<u16>,
    unwrapper: SequenceUnwrapper,
    stats: JitterStats,
}

impl JitterBuffer {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            max_depth: 512,
            pending: BTreeMap::new(),
            retired: Vec::new(),
            next: None,
            ssrc: None,
            restart_candidate: None,
            unwrapper: SequenceUnwrapper::default(),
            stats: JitterStats::default(),
        }
    }

    pub fn push(&mut self, packet: RtpPacket, now: Instant) {
        self.stats.received += 1;
        let header = packet.header;
        if header.payload_type != DYNAMIC_PAYLOAD_TYPE {
            self.stats.mismatched += 1;
            return;
        }
        if self.ssrc.is_some_and(|ssrc| ssrc != header.ssrc) {
            debug!(ssrc = header.ssrc, "rtp sender changed");
            self.resync();
        }
        self.ssrc = Some(header.ssrc);

        let mut ext = self.unwrapper.unwrap(header.sequence);
        if let Some(next) = self.next {
            if ext + MAX_MISORDER < next {
                if self.restart_candidate != Some(header.sequence) {
                    self.restart_candidate = Some(header.sequence.wrapping_add(1));
                    self.stats.late += 1;
                    return;
                }
                debug!(sequence = header.sequence, "rtp sequence restarted");
                self.resync();
                ext = self.unwrapper.unwrap(header.sequence);
            } else if ext < next {
                self.stats.late += 1;
                return;
            }
        }
        self.restart_candidate = None;
        if self.pending.contains_key(&ext) {
            self.stats.duplicate += 1;
            return;
        }
        self.pending.insert(ext, (now, packet.payload));
    }

    /// Payloads that can be played out at `now`, in sequence order.
    pub fn pop_ready(&mut self, now: Instant) -> Vec<Vec<u8>> {
        let mut ready = std::mem::take(&mut self.retired);
        while let Some((&seq, (arrived, _))) = self.pending.first_key_value() {
            let in_order = self.next == Some(seq);
            let waited = now.saturating_duration_since(*arrived) >= self.latency;
            let overfull = self.pending.len() > self.max_depth;
            if !(in_order || waited || overfull) {
                break;
            }
            if let Some(next) = self.next {
                self.stats.lost += seq.saturating_sub(next);
            }
            if let Some((_, payload)) = self.pending.remove(&seq) {
                ready.push(payload);
            }
            self.next = Some(seq + 1);
        }
        ready
    }

    /// Everything still held, in order (end of stream).
    pub fn flush(&mut self) -> Vec<Vec<u8>> {
        let drained = std::mem::take(&mut self.pending);
        if let Some((&last, _)) = drained.last_key_value() {
            self.next = Some(last + 1);
        }
        let mut out = std::mem::take(&mut self.retired);
        out.extend(drained.into_values().map(|(_, p)| p));
        out
    }

    /// Payloads held back.
    pub fn depth(&self) -> usize {
        self.pending.len() + self.retired.len()
    }

    /// Start a fresh sequence space, keeping what is pending for release.
    fn resync(&mut self) {
        self.stats.resyncs += 1;
        let pending = std::mem::take(&mut self.pending);
        self.retired.extend(pending.into_values().map(|(_, p)| p));
        self.next = None;
        self.restart_candidate = None;
        self.unwrapper = SequenceUnwrapper::default();
    }

    pub fn stats(&self) -> JitterStats {
        self.stats
    }
}
