//! Session counters and recent-error log.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

/// How many recent errors are kept for `/health` and stats logs.
pub const RECENT_ERRORS_CAP: usize = 32;

#[derive(Debug, Clone, Serialize)]
pub struct RecordedError {
    pub kind: &'static str,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Monotonic counters for one session.
///
/// The chunk loop and endpoint-event drain are the only writers; everyone else
/// reads through `snapshot()`.
#[derive(Default)]
pub struct SessionStats {
    pub samples_in: AtomicU64,
    pub samples_out: AtomicU64,
    pub chunks_processed: AtomicU64,
    pub error_count: AtomicU64,
    pub passthrough_chunks: AtomicU64,
    pub overwritten_samples: AtomicU64,
    pub dropped_faults: AtomicU64,
    recent_errors: Mutex<VecDeque<RecordedError>>,
}

impl SessionStats {
    /// Count an error and remember it, evicting the oldest beyond the cap.
    pub fn record_error(&self, kind: &'static str, message: impl Into<String>) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
        let mut recent = self.recent_errors.lock();
        if recent.len() == RECENT_ERRORS_CAP {
            recent.pop_front();
        }
        recent.push_back(RecordedError {
            kind,
            message: message.into(),
            at: Utc::now(),
        });
    }

    pub fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Raise `counter` to `value` if it is behind (for totals sampled from
    /// elsewhere, such as ring overwrite counts).
    pub fn raise_to(counter: &AtomicU64, value: u64) {
        counter.fetch_max(value, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            samples_in: self.samples_in.load(Ordering::Relaxed),
            samples_out: self.samples_out.load(Ordering::Relaxed),
            chunks_processed: self.chunks_processed.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            passthrough_chunks: self.passthrough_chunks.load(Ordering::Relaxed),
            overwritten_samples: self.overwritten_samples.load(Ordering::Relaxed),
            dropped_faults: self.dropped_faults.load(Ordering::Relaxed),
            recent_errors: self.recent_errors.lock().iter().cloned().collect(),
        }
    }
}

impl std::fmt::Debug for SessionStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStats")
            .field("chunks_processed", &self.chunks_processed.load(Ordering::Relaxed))
            .field("error_count", &self.error_count.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub samples_in: u64,
    pub samples_out: u64,
    pub chunks_processed: u64,
    pub error_count: u64,
    pub passthrough_chunks: u64,
    pub overwritten_samples: u64,
    pub dropped_faults: u64,
    pub recent_errors: Vec<RecordedError>,
}

impl StatsSnapshot {
    pub fn is_zero(&self) -> bool {
        self.samples_in == 0
            && self.samples_out == 0
            && self.chunks_processed == 0
            && self.error_count == 0
            && self.passthrough_chunks == 0
            && self.overwritten_samples == 0
            && self.dropped_faults == 0
            && self.recent_errors.is_empty()
    }

    /// Sum of two snapshots; recent errors are merged newest-last and capped.
    pub fn merge(mut self, other: &StatsSnapshot) -> StatsSnapshot {
        self.samples_in += other.samples_in;
        self.samples_out += other.samples_out;
        self.chunks_processed += other.chunks_processed;
        self.error_count += other.error_count;
        self.passthrough_chunks += other.passthrough_chunks;
        self.overwritten_samples += other.overwritten_samples;
        self.dropped_faults += other.dropped_faults;
        self.recent_errors.extend(other.recent_errors.iter().cloned());
        self.recent_errors.sort_by_key(|e| e.at);
        let excess = self.recent_errors.len().saturating_sub(RECENT_ERRORS_CAP);
        self.recent_errors.drain(..excess);
        self
    }
}
