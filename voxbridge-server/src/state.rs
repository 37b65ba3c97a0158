//! Shared server state, handed to every actix handler as `web::Data<AppState>`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use voxbridge_core::inference::AcceleratorInfo;
use voxbridge_core::{ConversionSession, ModelHandle, SessionState, StatsSnapshot};

use crate::error::AppError;
use crate::settings::ServerSettings;

pub struct AppState {
    pub settings: ServerSettings,
    pub model: ModelHandle,
    /// Queried once at startup; `/health` must not touch the model.
    pub accelerator: AcceleratorInfo,
    /// Reference used by requests that upload none.
    pub default_reference: Option<PathBuf>,
    /// Directory for per-request upload and result files.
    pub scratch_dir: PathBuf,
    /// The persistent session in stream mode.
    pub stream: Mutex<Option<Arc<ConversionSession>>>,
    pub started_at: DateTime<Utc>,
    active: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    /// Stats of finished request sessions, summed.
    totals: Mutex<StatsSnapshot>,
}

impl AppState {
    pub fn new(settings: ServerSettings, model: ModelHandle, scratch_dir: PathBuf) -> Self {
        let accelerator = model.accelerator();
        let default_reference = settings.reference.clone();
        Self {
            settings,
            model,
            accelerator,
            default_reference,
            scratch_dir,
            stream: Mutex::new(None),
            started_at: Utc::now(),
            active: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            totals: Mutex::new(StatsSnapshot::default()),
        }
    }

    /// Claim one of `max_concurrent_sessions` conversion slots.
    pub fn try_acquire_slot(&self) -> Result<SessionSlot<'_>, AppError> {
        let max = self.settings.max_concurrent_sessions;
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .map_err(|n| AppError::Busy(format!("{n} of {max} conversion sessions in use")))?;
        Ok(SessionSlot { state: self })
    }

    pub fn active_sessions(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn record_finished(&self, stats: Option<&StatsSnapshot>) {
        match stats {
            Some(stats) => {
                self.completed.fetch_add(1, Ordering::Relaxed);
                let mut totals = self.totals.lock();
                *totals = std::mem::take(&mut *totals).merge(stats);
            }
            None => {
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn set_stream(&self, session: Arc<ConversionSession>) {
        *self.stream.lock() = Some(session);
    }

    pub fn health(&self) -> HealthReport {
        let stream = self.stream.lock().as_ref().map(|s| StreamReport {
            state: s.state(),
            input_level: s.input_level(),
            reference_secs: s.reference_secs(),
            stats: s.stats(),
        });
        HealthReport {
            status: "ok",
            mode: self.settings.mode.to_string(),
            accelerator_available: self.accelerator.available,
            accelerator: self.accelerator.name.clone(),
            sample_rate: self.model_rate(),
            default_reference: self.default_reference.is_some(),
            active_sessions: self.active_sessions(),
            max_sessions: self.settings.max_concurrent_sessions,
            completed_requests: self.completed.load(Ordering::Relaxed),
            failed_requests: self.failed.load(Ordering::Relaxed),
            totals: self.totals.lock().clone(),
            stream,
            uptime_secs: (Utc::now() - self.started_at).num_seconds().max(0) as u64,
        }
    }

    fn model_rate(&self) -> u32 {
        // The rate is fixed after warm-up; a busy model must not stall health.
        self.model
            .0
            .try_lock()
            .map(|m| m.sample_rate())
            .unwrap_or(0)
    }
}

/// Releases its conversion slot on drop.
pub struct SessionSlot<'a> {
    state: &'a AppState,
}

impl Drop for SessionSlot<'_> {
    fn drop(&mut self) {
        self.state.active.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamReport {
    pub state: SessionState,
    pub input_level: Option<f32>,
    pub reference_secs: Option<f64>,
    pub stats: StatsSnapshot,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: &'static str,
    pub mode: String,
    pub accelerator_available: bool,
    pub accelerator: Option<String>,
    pub sample_rate: u32,
    pub default_reference: bool,
    pub active_sessions: usize,
    pub max_sessions: usize,
    pub completed_requests: u64,
    pub failed_requests: u64,
    pub totals: StatsSnapshot,
    pub stream: Option<StreamReport>,
    pub uptime_secs: u64,
}
