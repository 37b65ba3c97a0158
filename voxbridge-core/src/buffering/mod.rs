//! Sample buffers.
//!
//! Two kinds live here:
//!
//! - [`RingBuffer`]: fixed-capacity, mutex-guarded circular buffer shared between
//!   endpoint threads and the session's chunk loop. It is the only place where
//!   those threads meet. Overflow overwrites the oldest unread samples so latency
//!   stays bounded.
//! - The `ringbuf` SPSC pair used between cpal device callbacks and endpoint
//!   threads, where the callback must stay lock-free and allocation-free.

pub mod chunk;

use parking_lot::Mutex;
use ringbuf::{traits::Split, HeapRb};

pub use ringbuf::traits::{Consumer, Observer, Producer};

/// Producer half handed to a device callback (or fed by a playback endpoint).
pub type DeviceProducer = ringbuf::HeapProd<f32>;

/// Consumer half drained by an endpoint thread (or by a playback callback).
pub type DeviceConsumer = ringbuf::HeapCons<f32>;

/// Create a lock-free SPSC pair for device I/O.
pub fn create_device_ring(capacity: usize) -> (DeviceProducer, DeviceConsumer) {
    HeapRb::<f32>::new(capacity.max(1)).split()
}

struct RingState {
    data: Box<[f32]>,
    write_pos: usize,
    read_pos: usize,
    /// Unread sample count. Needed to tell "full" from "empty" when
    /// `write_pos == read_pos`.
    len: usize,
    overwritten: u64,
}

/// Thread-safe circular buffer of mono f32 samples.
///
/// Invariant: `write_pos == (read_pos + len) % capacity`.
/// Every operation takes the single internal lock for O(copy length).
pub struct RingBuffer {
    state: Mutex<RingState>,
    capacity: usize,
}

impl RingBuffer {
    /// Create a buffer holding `capacity` samples (at least one).
    ///
    /// Callers should size the capacity above the largest burst they expect to
    /// write between two reads; larger bursts overwrite unread audio.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(RingState {
                data: vec![0f32; capacity].into_boxed_slice(),
                write_pos: 0,
                read_pos: 0,
                len: 0,
                overwritten: 0,
            }),
            capacity,
        }
    }

    /// Create a buffer holding `seconds` of audio at `sample_rate`.
    pub fn with_duration(sample_rate: u32, seconds: f32) -> Self {
        Self::new((sample_rate as f32 * seconds.max(0.0)).ceil() as usize)
    }

    /// Append samples, wrapping at capacity.
    ///
    /// When the write exceeds free space the oldest unread samples are
    /// overwritten and the read position moves past them. Returns the number
    /// of samples lost this way (old unread data plus any part of `samples`
    /// that did not fit at all).
    pub fn write(&self, samples: &[f32]) -> usize {
        if samples.is_empty() {
            return 0;
        }
        let cap = self.capacity;
        let mut st = self.state.lock();

        // Only the newest `cap` samples of an oversized burst can survive.
        let (src, skipped) = if samples.len() > cap {
            (&samples[samples.len() - cap..], samples.len() - cap)
        } else {
            (samples, 0)
        };
        let n = src.len();
        let overflow = (st.len + n).saturating_sub(cap);

        let wp = st.write_pos;
        let first = (cap - wp).min(n);
        st.data[wp..wp + first].copy_from_slice(&src[..first]);
        if first < n {
            st.data[..n - first].copy_from_slice(&src[first..]);
        }
        st.write_pos = (wp + n) % cap;

        if overflow > 0 {
            st.read_pos = (st.read_pos + overflow) % cap;
            st.len = cap;
        } else {
            st.len += n;
        }

        let lost = overflow + skipped;
        st.overwritten += lost as u64;
        lost
    }

    /// Read exactly `n` samples in FIFO order.
    ///
    /// Returns `None` (and leaves the buffer untouched) when fewer than `n`
    /// samples are available. Both positions reset to 0 once the buffer is
    /// fully drained.
    pub fn read(&self, n: usize) -> Option<Vec<f32>> {
        let mut st = self.state.lock();
        if st.len < n {
            return None;
        }
        let out = Self::copy_out(&mut st, self.capacity, n);
        Some(out)
    }

    /// Read everything currently available (possibly nothing).
    pub fn drain(&self) -> Vec<f32> {
        let mut st = self.state.lock();
        let n = st.len;
        Self::copy_out(&mut st, self.capacity, n)
    }

    fn copy_out(st: &mut RingState, cap: usize, n: usize) -> Vec<f32> {
        let mut out = Vec::with_capacity(n);
        let rp = st.read_pos;
        let first = (cap - rp).min(n);
        out.extend_from_slice(&st.data[rp..rp + first]);
        if first < n {
            out.extend_from_slice(&st.data[..n - first]);
        }
        st.read_pos = (rp + n) % cap;
        st.len -= n;
        if st.len == 0 {
            st.read_pos = 0;
            st.write_pos = 0;
        }
        out
    }

    /// Unread sample count.
    pub fn available(&self) -> usize {
        self.state.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.available() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total samples lost to overwrites since creation.
    pub fn overwritten(&self) -> u64 {
        self.state.lock().overwritten
    }

    /// Reset positions. Memory is not zeroed; reads only return written ranges.
    pub fn clear(&self) {
        let mut st = self.state.lock();
        st.read_pos = 0;
        st.write_pos = 0;
        st.len = 0;
    }

    #[cfg(test)]
    fn positions(&self) -> (usize, usize) {
        let st = self.state.lock();
        (st.write_pos, st.read_pos)
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity)
            .field("available", &self.available())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::Arc;
    use std::thread;

    fn ramp(start: usize, len: usize) -> Vec<f32> {
        (start..start + len).map(|i| i as f32).collect()
    }

    #[test]
    fn writes_within_capacity_read_back_in_order() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..200 {
            let cap = rng.gen_range(1..512);
            let ring = RingBuffer::new(cap);
            let mut expected = Vec::new();
            let mut total = 0;
            while total < cap {
                let len = rng.gen_range(0..=(cap - total).min(64));
                let block = ramp(total, len);
                ring.write(&block);
                expected.extend_from_slice(&block);
                total += len;
                if rng.gen_bool(0.1) {
                    break;
                }
            }
            assert_eq!(ring.available(), expected.len());
            assert_eq!(ring.read(expected.len()).unwrap(), expected);
        }
    }

    #[test]
    fn interleaved_reads_and_writes_preserve_fifo_across_wrap() {
        let mut rng = StdRng::seed_from_u64(42);
        let ring = RingBuffer::new(97);
        let mut next_in = 0usize;
        let mut next_out = 0usize;
        for _ in 0..5_000 {
            let free = ring.capacity() - ring.available();
            let w = rng.gen_range(0..=free.min(40));
            ring.write(&ramp(next_in, w));
            next_in += w;

            let r = rng.gen_range(0..=ring.available().min(40));
            let got = ring.read(r).unwrap();
            assert_eq!(got, ramp(next_out, r));
            next_out += r;
        }
        assert_eq!(ring.overwritten(), 0);
    }

    #[test]
    fn short_read_returns_none_and_leaves_state_unchanged() {
        let ring = RingBuffer::new(16);
        ring.write(&[1.0, 2.0, 3.0]);
        ring.read(1).unwrap();
        let before = (ring.available(), ring.positions());

        assert!(ring.read(3).is_none());
        assert!(ring.read(3).is_none());
        assert_eq!((ring.available(), ring.positions()), before);
        assert_eq!(ring.read(2).unwrap(), vec![2.0, 3.0]);
    }

    #[test]
    fn overflow_keeps_most_recent_capacity_samples() {
        let cap = 64;
        for k in 1..cap {
            let ring = RingBuffer::new(cap);
            let all = ramp(0, cap + k);
            // Split across two writes so the overwrite happens mid-stream.
            ring.write(&all[..cap / 2]);
            ring.write(&all[cap / 2..]);
            assert_eq!(ring.available(), cap);
            assert_eq!(ring.read(cap).unwrap(), all[k..].to_vec());
            assert_eq!(ring.overwritten(), k as u64);
        }
    }

    #[test]
    fn oversized_single_write_keeps_tail() {
        let ring = RingBuffer::new(8);
        let lost = ring.write(&ramp(0, 20));
        assert_eq!(lost, 12);
        assert_eq!(ring.read(8).unwrap(), ramp(12, 8));
    }

    #[test]
    fn full_drain_resets_positions() {
        let ring = RingBuffer::new(10);
        ring.write(&ramp(0, 7));
        ring.read(5).unwrap();
        ring.write(&ramp(7, 6));
        assert_ne!(ring.positions(), (0, 0));
        ring.read(8).unwrap();
        assert_eq!(ring.available(), 0);
        assert_eq!(ring.positions(), (0, 0));
    }

    #[test]
    fn drain_returns_everything_and_resets() {
        let ring = RingBuffer::new(5);
        ring.write(&ramp(0, 4));
        ring.read(2).unwrap();
        ring.write(&ramp(4, 3));
        assert_eq!(ring.drain(), ramp(2, 5));
        assert!(ring.is_empty());
        assert_eq!(ring.positions(), (0, 0));
        assert!(ring.drain().is_empty());
    }

    #[test]
    fn clear_discards_unread() {
        let ring = RingBuffer::new(4);
        ring.write(&[1.0, 2.0]);
        ring.clear();
        assert_eq!(ring.available(), 0);
        assert!(ring.read(1).is_none());
    }

    #[test]
    fn concurrent_producer_consumer_sees_ordered_stream() {
        let ring = Arc::new(RingBuffer::new(4_096));
        let total = 100_000usize;
        let producer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                let mut sent = 0;
                while sent < total {
                    let free = ring.capacity() - ring.available();
                    let n = free.min(256).min(total - sent);
                    if n == 0 {
                        thread::yield_now();
                        continue;
                    }
                    ring.write(&ramp(sent, n));
                    sent += n;
                }
            })
        };

        let mut received = 0usize;
        while received < total {
            match ring.read(128.min(total - received)) {
                Some(block) => {
                    for (i, s) in block.iter().enumerate() {
                        assert_eq!(*s, (received + i) as f32);
                    }
                    received += block.len();
                }
                None => thread::yield_now(),
            }
        }
        producer.join().expect("producer panicked");
        assert_eq!(ring.overwritten(), 0);
    }
}
