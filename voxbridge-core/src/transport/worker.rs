//! Endpoint worker threads and the bounded sink queue.
//!
//! Every worker loop polls `stop` between bounded blocking calls (socket read
//! timeouts, `recv_timeout`, short sleeps), so a stop request is always noticed
//! within one poll interval. Joining is bounded as well: a worker that misses
//! the deadline is detached and the caller gets `VoxError::Timeout`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, VoxError};

/// Poll interval for worker loops waiting on I/O.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(20);

pub(crate) struct Worker {
    name: String,
    stop: Arc<AtomicBool>,
    /// Never sent on; disconnects when the thread exits (or unwinds).
    done: Receiver<()>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub(crate) fn spawn<F>(name: &str, body: F) -> Result<Self>
    where
        F: FnOnce(Arc<AtomicBool>) + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = bounded::<()>(0);
        let flag = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let _done = done_tx;
                body(flag);
            })?;
        debug!(worker = name, "worker spawned");
        Ok(Self {
            name: name.to_string(),
            stop,
            done: done_rx,
            handle: Some(handle),
        })
    }

    pub(crate) fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub(crate) fn is_finished(&self) -> bool {
        matches!(
            self.done.try_recv(),
            Err(crossbeam_channel::TryRecvError::Disconnected)
        )
    }

    /// A receiver that disconnects once the thread has exited, for waiting
    /// without holding on to the worker.
    pub(crate) fn exit_signal(&self) -> Receiver<()> {
        self.done.clone()
    }

    /// Request stop and wait up to `timeout` for the thread to exit.
    pub(crate) fn join(mut self, timeout: Duration) -> Result<()> {
        self.request_stop();
        match self.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(handle) = self.handle.take() {
                    if handle.join().is_err() {
                        return Err(VoxError::Transport(format!("worker {} panicked", self.name)));
                    }
                }
                debug!(worker = %self.name, "worker joined");
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(worker = %self.name, timeout_ms = timeout.as_millis() as u64, "worker did not stop in time; detaching");
                drop(self.handle.take());
                Err(VoxError::Timeout {
                    what: format!("worker {}", self.name),
                    after_ms: timeout.as_millis() as u64,
                })
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}

/// What a sink does when its queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "camelCase")]
pub enum Backpressure {
    /// Wait up to `timeout_ms` for room, then give up on this buffer.
    Block { timeout_ms: u64 },
    /// Refuse the buffer immediately.
    DropNewest,
}

impl Default for Backpressure {
    fn default() -> Self {
        Backpressure::Block { timeout_ms: 500 }
    }
}

/// Sending half of a sink's bounded buffer queue.
pub(crate) struct SinkQueue {
    tx: Option<Sender<Vec<f32>>>,
    policy: Backpressure,
}

impl SinkQueue {
    pub(crate) fn new(capacity: usize, policy: Backpressure) -> (Self, Receiver<Vec<f32>>) {
        let (tx, rx) = bounded(capacity.max(1));
        (Self { tx: Some(tx), policy }, rx)
    }

    pub(crate) fn push(&self, samples: &[f32]) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }
        let Some(tx) = self.tx.as_ref() else {
            return Err(VoxError::Transport("sink is closed".into()));
        };
        match self.policy {
            Backpressure::Block { timeout_ms } => {
                match tx.send_timeout(samples.to_vec(), Duration::from_millis(timeout_ms)) {
                    Ok(()) => Ok(()),
                    Err(SendTimeoutError::Timeout(v)) => Err(VoxError::Transport(format!(
                        "sink queue full for {timeout_ms} ms, dropped {} samples",
                        v.len()
                    ))),
                    Err(SendTimeoutError::Disconnected(_)) => {
                        Err(VoxError::Transport("sink worker is gone".into()))
                    }
                }
            }
            Backpressure::DropNewest => match tx.try_send(samples.to_vec()) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(v)) => Err(VoxError::Transport(format!(
                    "sink queue full, dropped {} samples",
                    v.len()
                ))),
                Err(TrySendError::Disconnected(_)) => {
                    Err(VoxError::Transport("sink worker is gone".into()))
                }
            },
        }
    }

    /// Drop the sender so the worker sees the queue disconnect once drained.
    pub(crate) fn close(&mut self) {
        self.tx = None;
    }
}

/// Receive the next queued buffer, returning `None` once the queue is closed
/// and empty. `Some(empty)` means nothing arrived within the poll interval.
pub(crate) fn recv_buffer(rx: &Receiver<Vec<f32>>) -> Option<Vec<f32>> {
    match rx.recv_timeout(POLL_INTERVAL) {
        Ok(buf) => Some(buf),
        Err(RecvTimeoutError::Timeout) => Some(Vec::new()),
        Err(RecvTimeoutError::Disconnected) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn cooperative_worker_joins_quickly() {
        let worker = Worker::spawn("test-coop", |stop| {
            while !stop.load(Ordering::Acquire) {
                std::thread::sleep(Duration::from_millis(1));
            }
        })
        .unwrap();
        assert!(!worker.is_finished());
        worker.join(Duration::from_secs(2)).unwrap();
    }

    #[test]
    fn stuck_worker_times_out_and_detaches() {
        let worker = Worker::spawn("test-stuck", |_stop| {
            std::thread::sleep(Duration::from_millis(400));
        })
        .unwrap();
        let started = Instant::now();
        let err = worker.join(Duration::from_millis(30)).unwrap_err();
        assert!(matches!(err, VoxError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_millis(300));
    }

    #[test]
    fn panicking_worker_reports_transport_error() {
        let worker = Worker::spawn("test-panic", |_stop| panic!("boom")).unwrap();
        let err = worker.join(Duration::from_secs(2)).unwrap_err();
        assert_eq!(err.kind(), "transport_error");
    }

    #[test]
    fn blocking_queue_times_out_when_full() {
        let (queue, _rx) = SinkQueue::new(1, Backpressure::Block { timeout_ms: 10 });
        queue.push(&[1.0]).unwrap();
        let err = queue.push(&[2.0]).unwrap_err();
        assert!(err.to_string().contains("dropped 1 samples"), "{err}");
    }

    #[test]
    fn drop_newest_refuses_immediately() {
        let (queue, rx) = SinkQueue::new(1, Backpressure::DropNewest);
        queue.push(&[1.0]).unwrap();
        assert!(queue.push(&[2.0]).is_err());
        assert_eq!(rx.try_recv().unwrap(), vec![1.0]);
    }

    #[test]
    fn closed_queue_drains_then_disconnects() {
        let (mut queue, rx) = SinkQueue::new(4, Backpressure::default());
        queue.push(&[1.0, 2.0]).unwrap();
        queue.close();
        assert!(queue.push(&[3.0]).is_err());
        assert_eq!(recv_buffer(&rx), Some(vec![1.0, 2.0]));
        assert_eq!(recv_buffer(&rx), None);
    }
}
