//! Worker pool scaling.
//!
//! [`decide`] is a pure function of the observed load; [`WorkerScaler`]
//! adds heartbeat tracking, the cooldown, and a monitor loop that applies
//! decisions to a [`ScaleTarget`].

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod probe;

pub use probe::{FixedProbe, ProcProbe, SystemMetrics, SystemProbe};

use crate::config::ScalingSettings;
use crate::time;

const HISTORY_LIMIT: usize = 50;

/// Something whose worker count the scaler controls.
pub trait ScaleTarget: Send + Sync {
    fn worker_count(&self) -> usize;

    fn queue_size(&self) -> usize;

    /// Resizes to `workers`. Returns the count actually in effect.
    fn scale_to(&self, workers: usize) -> usize;
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScaleAction {
    ScaleUp,
    ScaleDown,
    NoAction,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Active,
    Busy,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct WorkerMetrics {
    pub worker_id: String,
    pub status: WorkerStatus,
    pub current_jobs: usize,
    pub max_concurrent_jobs: usize,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub last_heartbeat: DateTime<Utc>,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub average_processing_time: f64,
}

impl WorkerMetrics {
    fn new(worker_id: &str, max_concurrent_jobs: usize) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            status: WorkerStatus::Idle,
            current_jobs: 0,
            max_concurrent_jobs,
            cpu_usage: 0.0,
            memory_usage: 0.0,
            last_heartbeat: Utc::now(),
            jobs_completed: 0,
            jobs_failed: 0,
            average_processing_time: 0.0,
        }
    }

    fn refresh_status(&mut self) {
        self.status = if self.current_jobs == 0 {
            WorkerStatus::Idle
        } else if self.current_jobs >= self.max_concurrent_jobs {
            WorkerStatus::Busy
        } else {
            WorkerStatus::Active
        };
    }
}

/// Partial heartbeat; `None` fields keep their previous value.
#[derive(Debug, Clone, Default)]
pub struct WorkerMetricsUpdate {
    pub current_jobs: Option<usize>,
    pub cpu_usage: Option<f64>,
    pub memory_usage: Option<f64>,
    pub jobs_completed: Option<u64>,
    pub jobs_failed: Option<u64>,
    pub average_processing_time: Option<f64>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Default)]
pub struct DecisionMetrics {
    pub load_score: f64,
    pub queue_size: usize,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub current_load: usize,
    pub total_capacity: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ScaleDecision {
    pub action: ScaleAction,
    pub target_workers: usize,
    pub current_workers: usize,
    pub reason: String,
    pub metrics: DecisionMetrics,
    pub decided_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerCounts {
    pub idle: usize,
    pub active: usize,
    pub busy: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScalerSnapshot {
    pub current_workers: usize,
    pub target_workers: usize,
    pub total_capacity: usize,
    pub current_load: usize,
    pub load_percentage: f64,
    pub system_metrics: SystemMetrics,
    pub worker_count_by_status: WorkerCounts,
    pub workers: Vec<WorkerMetrics>,
    /// Last 10 applied decisions.
    pub recent_decisions: Vec<ScaleDecision>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ScalingStats {
    pub decisions_applied: usize,
    pub scale_ups: usize,
    pub scale_downs: usize,
    pub last_scaled_at: Option<DateTime<Utc>>,
    pub cooldown_remaining_seconds: u64,
    pub current_workers: usize,
    pub target_workers: usize,
}

/// Scaling decision for the given load.
///
/// Scale up when the load score passes the threshold, more than 10 jobs
/// wait, or over 80% of capacity is in use; the step is 5/3/1 workers for
/// queues above 50/20/otherwise. Scale down by one when load is low, the
/// queue is empty, and more than two workers sit idle.
pub fn decide(
    metrics: DecisionMetrics,
    current_workers: usize,
    idle_workers: usize,
    settings: &ScalingSettings,
) -> ScaleDecision {
    let usage = if metrics.total_capacity > 0 {
        metrics.current_load as f64 / metrics.total_capacity as f64
    } else {
        0.0
    };

    let scale_up_wanted = metrics.load_score > settings.scale_up_threshold
        || metrics.queue_size > 10
        || usage > 0.8;

    let (action, target_workers, reason) = if scale_up_wanted {
        if current_workers < settings.max_workers {
            let (step, reason) = if metrics.queue_size > 50 {
                (5, "High queue load - adding 5 workers")
            } else if metrics.queue_size > 20 {
                (3, "Medium queue load - adding 3 workers")
            } else {
                (1, "Moderate load - adding 1 worker")
            };
            (
                ScaleAction::ScaleUp,
                (current_workers + step).min(settings.max_workers),
                reason,
            )
        } else {
            (
                ScaleAction::NoAction,
                current_workers,
                "Load is high but the pool is at its maximum size",
            )
        }
    } else if metrics.load_score < settings.scale_down_threshold
        && metrics.queue_size == 0
        && current_workers > settings.min_workers
        && idle_workers > 2
    {
        (
            ScaleAction::ScaleDown,
            (current_workers - 1).max(settings.min_workers),
            "Low load - removing 1 idle worker",
        )
    } else {
        (
            ScaleAction::NoAction,
            current_workers,
            "Load within acceptable range",
        )
    };

    ScaleDecision {
        action,
        target_workers,
        current_workers,
        reason: reason.to_string(),
        metrics,
        decided_at: Utc::now(),
    }
}

struct ScalerState {
    current_workers: usize,
    target_workers: usize,
    workers: BTreeMap<String, WorkerMetrics>,
    history: VecDeque<ScaleDecision>,
    last_scaled_at: Option<DateTime<Utc>>,
    system: SystemMetrics,
}

pub struct WorkerScaler {
    settings: ScalingSettings,
    probe: Box<dyn SystemProbe>,
    state: Mutex<ScalerState>,
}

impl WorkerScaler {
    pub fn new(settings: ScalingSettings, probe: Box<dyn SystemProbe>) -> Self {
        let initial = settings.min_workers;
        info!(
            min_workers = settings.min_workers,
            max_workers = settings.max_workers,
            "Worker scaler initialized"
        );
        Self {
            settings,
            probe,
            state: Mutex::new(ScalerState {
                current_workers: initial,
                target_workers: initial,
                workers: BTreeMap::new(),
                history: VecDeque::new(),
                last_scaled_at: None,
                system: SystemMetrics::default(),
            }),
        }
    }

    pub fn settings(&self) -> &ScalingSettings {
        &self.settings
    }

    fn lock(&self) -> MutexGuard<'_, ScalerState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            warn!("Scaler lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    // ─── Worker registry ───

    pub fn register_worker(&self, worker_id: &str, max_concurrent_jobs: usize) {
        self.lock().workers.insert(
            worker_id.to_string(),
            WorkerMetrics::new(worker_id, max_concurrent_jobs.max(1)),
        );
        debug!(worker_id, "Scaler tracking worker");
    }

    /// Heartbeat. Unknown workers are registered with one job slot.
    pub fn update_worker_metrics(&self, worker_id: &str, update: WorkerMetricsUpdate) {
        let mut state = self.lock();
        let worker = state
            .workers
            .entry(worker_id.to_string())
            .or_insert_with(|| WorkerMetrics::new(worker_id, 1));

        if let Some(v) = update.current_jobs {
            worker.current_jobs = v;
        }
        if let Some(v) = update.cpu_usage {
            worker.cpu_usage = v;
        }
        if let Some(v) = update.memory_usage {
            worker.memory_usage = v;
        }
        if let Some(v) = update.jobs_completed {
            worker.jobs_completed = v;
        }
        if let Some(v) = update.jobs_failed {
            worker.jobs_failed = v;
        }
        if let Some(v) = update.average_processing_time {
            worker.average_processing_time = v;
        }
        worker.last_heartbeat = Utc::now();
        worker.refresh_status();
    }

    pub fn remove_worker(&self, worker_id: &str) -> bool {
        self.lock().workers.remove(worker_id).is_some()
    }

    pub fn worker(&self, worker_id: &str) -> Option<WorkerMetrics> {
        self.lock().workers.get(worker_id).cloned()
    }

    pub fn current_workers(&self) -> usize {
        self.lock().current_workers
    }

    /// Syncs the scaler's view of the pool size with reality.
    pub fn set_current_workers(&self, workers: usize) {
        let mut state = self.lock();
        state.current_workers = workers;
        state.target_workers = workers;
    }

    /// Drops workers whose last heartbeat is older than the heartbeat
    /// timeout. Each eviction lowers the live count, never below the
    /// minimum. Returns the evicted ids.
    pub fn evict_stale_workers(&self) -> Vec<String> {
        let cutoff = time::cutoff(
            Utc::now(),
            Duration::from_secs(self.settings.heartbeat_timeout_seconds),
        );
        let mut state = self.lock();
        let stale: Vec<String> = state
            .workers
            .values()
            .filter(|w| w.last_heartbeat < cutoff)
            .map(|w| w.worker_id.clone())
            .collect();

        for worker_id in &stale {
            state.workers.remove(worker_id);
            if state.current_workers > self.settings.min_workers {
                state.current_workers -= 1;
            }
            warn!(worker_id = %worker_id, "Evicted stale worker");
        }
        stale
    }

    // ─── Decisions ───

    /// Samples system load and decides for the given queue depth.
    pub fn compute_decision(&self, queue_size: usize) -> ScaleDecision {
        let system = self.probe.sample();
        let mut state = self.lock();
        state.system = system;

        let total_capacity: usize = state.workers.values().map(|w| w.max_concurrent_jobs).sum();
        let current_load: usize = state.workers.values().map(|w| w.current_jobs).sum();
        let idle = state
            .workers
            .values()
            .filter(|w| w.status == WorkerStatus::Idle)
            .count();
        let load_fraction = if total_capacity > 0 {
            current_load as f64 / total_capacity as f64
        } else {
            0.0
        };

        let metrics = DecisionMetrics {
            load_score: (system.cpu_usage / 100.0)
                .max(system.memory_usage / 100.0)
                .max(load_fraction),
            queue_size,
            cpu_usage: system.cpu_usage,
            memory_usage: system.memory_usage,
            current_load,
            total_capacity,
        };
        decide(metrics, state.current_workers, idle, &self.settings)
    }

    fn cooldown_remaining(&self, state: &ScalerState, now: DateTime<Utc>) -> Duration {
        let Some(last) = state.last_scaled_at else {
            return Duration::ZERO;
        };
        let cooldown = Duration::from_secs(self.settings.cooldown_seconds);
        let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
        cooldown.saturating_sub(elapsed)
    }

    /// Applies a decision to `target`. Returns false when the cooldown
    /// suppressed it; a no-op decision counts as applied.
    pub fn apply_decision(&self, decision: &ScaleDecision, target: &dyn ScaleTarget) -> bool {
        if decision.action == ScaleAction::NoAction {
            debug!(reason = %decision.reason, "No scaling action needed");
            return true;
        }

        {
            let state = self.lock();
            let remaining = self.cooldown_remaining(&state, Utc::now());
            if !remaining.is_zero() {
                info!(
                    action = ?decision.action,
                    remaining_seconds = remaining.as_secs(),
                    "Scaling cooldown active, skipping"
                );
                return false;
            }
        }

        let applied = target.scale_to(decision.target_workers);

        let mut state = self.lock();
        state.current_workers = applied;
        state.target_workers = decision.target_workers;
        state.last_scaled_at = Some(Utc::now());
        state.history.push_back(decision.clone());
        while state.history.len() > HISTORY_LIMIT {
            state.history.pop_front();
        }
        info!(
            action = ?decision.action,
            from = decision.current_workers,
            to = applied,
            reason = %decision.reason,
            "Applied scaling decision"
        );
        true
    }

    /// Runs one monitor cycle against `target`.
    pub fn tick(&self, target: &dyn ScaleTarget) -> ScaleDecision {
        {
            let mut state = self.lock();
            state.current_workers = target.worker_count();
        }
        let decision = self.compute_decision(target.queue_size());
        if decision.action != ScaleAction::NoAction {
            self.apply_decision(&decision, target);
        }
        self.evict_stale_workers();
        decision
    }

    /// Monitor loop: one [`tick`](Self::tick) per monitor interval until
    /// `token` is cancelled.
    pub async fn run(self: Arc<Self>, token: CancellationToken, target: Arc<dyn ScaleTarget>) {
        let interval = Duration::from_secs(self.settings.monitor_interval_seconds.max(1));
        info!(interval_seconds = interval.as_secs(), "Worker scaler monitoring started");
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            self.tick(target.as_ref());
        }
        info!("Worker scaler monitoring stopped");
    }

    // ─── Telemetry ───

    pub fn history(&self) -> Vec<ScaleDecision> {
        self.lock().history.iter().cloned().collect()
    }

    pub fn snapshot(&self) -> ScalerSnapshot {
        let state = self.lock();
        let total_capacity: usize = state.workers.values().map(|w| w.max_concurrent_jobs).sum();
        let current_load: usize = state.workers.values().map(|w| w.current_jobs).sum();
        let count = |status: WorkerStatus| {
            state
                .workers
                .values()
                .filter(|w| w.status == status)
                .count()
        };
        let skip = state.history.len().saturating_sub(10);

        ScalerSnapshot {
            current_workers: state.current_workers,
            target_workers: state.target_workers,
            total_capacity,
            current_load,
            load_percentage: if total_capacity > 0 {
                current_load as f64 / total_capacity as f64 * 100.0
            } else {
                0.0
            },
            system_metrics: state.system,
            worker_count_by_status: WorkerCounts {
                idle: count(WorkerStatus::Idle),
                active: count(WorkerStatus::Active),
                busy: count(WorkerStatus::Busy),
            },
            workers: state.workers.values().cloned().collect(),
            recent_decisions: state.history.iter().skip(skip).cloned().collect(),
        }
    }

    pub fn scaling_stats(&self) -> ScalingStats {
        let state = self.lock();
        let count = |action: ScaleAction| state.history.iter().filter(|d| d.action == action).count();
        ScalingStats {
            decisions_applied: state.history.len(),
            scale_ups: count(ScaleAction::ScaleUp),
            scale_downs: count(ScaleAction::ScaleDown),
            last_scaled_at: state.last_scaled_at,
            cooldown_remaining_seconds: self.cooldown_remaining(&state, Utc::now()).as_secs(),
            current_workers: state.current_workers,
            target_workers: state.target_workers,
        }
    }
}
