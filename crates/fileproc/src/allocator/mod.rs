//! Resource allocation across logical workers.
//!
//! The allocator owns the shared job queue and each worker's capacity
//! ledger. Every mutation (queue, ledger, allocation table) happens under one
//! lock, so allocate/release pairs can never interleave into a lost update.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

pub mod queue;
pub mod requirements;

pub use queue::{JobQueue, QueuedJob};
pub use requirements::{
    complexity_bonus, requirements_for, total_requirements, ResourceRequirements, Resources,
};

use crate::models::{Job, JobPriority, ProcessingType};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AllocationError {
    #[error("Job is not queued: {0}")]
    NotQueued(String),

    #[error("Job {0} already holds an allocation")]
    AlreadyAllocated(String),

    #[error("Insufficient resources: job {job_id} needs {cpu_cores} cpu / {memory_mb} MB memory / {disk_mb} MB disk / {network_mbps} Mbps, more than any registered worker offers")]
    Unsatisfiable {
        job_id: String,
        cpu_cores: f64,
        memory_mb: u64,
        disk_mb: u64,
        network_mbps: u64,
    },
}

/// A logical worker's capacity ledger.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct WorkerResource {
    pub worker_id: String,
    pub max: Resources,
    pub available: Resources,
    /// Retired while busy: takes no new work and leaves once idle.
    pub draining: bool,
}

impl WorkerResource {
    fn utilization(&self) -> f64 {
        let cpu = if self.max.cpu_cores > 0.0 {
            (self.max.cpu_cores - self.available.cpu_cores) / self.max.cpu_cores
        } else {
            0.0
        };
        let mem = if self.max.memory_mb > 0 {
            (self.max.memory_mb - self.available.memory_mb) as f64 / self.max.memory_mb as f64
        } else {
            0.0
        };
        (cpu + mem) / 2.0
    }

    /// Sum of the CPU and memory fractions left free after taking `need`.
    /// Lower means a tighter fit.
    fn leftover_after(&self, need: &Resources) -> f64 {
        let cpu = (self.available.cpu_cores - need.cpu_cores) / self.max.cpu_cores;
        let mem = (self.available.memory_mb as f64 - need.memory_mb as f64)
            / self.max.memory_mb as f64;
        cpu + mem
    }
}

/// Binding of one in-flight job to the worker holding its resources.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ResourceAllocation {
    pub job_id: String,
    pub worker_id: String,
    pub allocated: Resources,
    pub estimated_duration_seconds: u64,
    pub priority_score: i64,
    pub allocated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub total_jobs: usize,
    pub jobs_by_priority: BTreeMap<String, usize>,
    /// Up to 50 entries, highest score first.
    pub jobs: Vec<QueuedJob>,
    pub oldest_wait_seconds: f64,
    pub average_wait_seconds: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResourceStatus {
    pub total: Resources,
    pub available: Resources,
    pub cpu_utilization_percent: f64,
    pub memory_utilization_percent: f64,
    pub disk_utilization_percent: f64,
    pub network_utilization_percent: f64,
    pub active_allocations: usize,
    pub workers: Vec<WorkerResource>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RebalanceRecommendation {
    pub job_id: String,
    pub from_worker: String,
    pub to_worker: String,
    pub current_utilization: f64,
    pub proposed_utilization: f64,
    pub improvement: f64,
}

#[derive(Default)]
struct AllocatorState {
    queue: JobQueue,
    workers: BTreeMap<String, WorkerResource>,
    allocations: HashMap<String, ResourceAllocation>,
}

impl AllocatorState {
    /// Best-fit worker for `need`, ignoring `exclude`.
    fn best_worker(&self, need: &Resources, exclude: Option<&str>) -> Option<&WorkerResource> {
        self.workers
            .values()
            .filter(|w| !w.draining && Some(w.worker_id.as_str()) != exclude)
            .filter(|w| w.available.covers(need))
            .min_by(|a, b| a.leftover_after(need).total_cmp(&b.leftover_after(need)))
    }
}

#[derive(Default)]
pub struct ResourceAllocator {
    state: Mutex<AllocatorState>,
    work_available: Notify,
}

/// Priority score for a job at `now`: priority weight + age bonus (up to 10
/// after an hour) + complexity bonus (up to 20) + user boost (up to 50).
pub fn priority_score(job: &Job, processing_types: &[ProcessingType], now: DateTime<Utc>) -> i64 {
    let age_hours = (now - job.created_at).num_milliseconds().max(0) as f64 / 3_600_000.0;
    let age_bonus = age_hours.min(1.0) * 10.0;
    let user_boost = job.user_priority().unwrap_or(0.0).clamp(0.0, 50.0);
    (job.priority.weight() + age_bonus + complexity_bonus(processing_types) + user_boost) as i64
}

impl ResourceAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, AllocatorState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            warn!("Allocator lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    // ─── Workers ───

    pub fn register_worker(&self, worker_id: &str, resources: Resources) {
        let mut state = self.lock();
        if let Some(existing) = state.workers.get_mut(worker_id) {
            if existing.draining {
                existing.draining = false;
                debug!(worker_id, "Revived draining worker");
                drop(state);
                self.work_available.notify_one();
                return;
            }
        }
        state.workers.insert(
            worker_id.to_string(),
            WorkerResource {
                worker_id: worker_id.to_string(),
                max: resources,
                available: resources,
                draining: false,
            },
        );
        info!(worker_id, "Registered worker");
        drop(state);
        self.work_available.notify_one();
    }

    /// Removes a worker that holds no allocations. Returns false if the
    /// worker is unknown or busy.
    pub fn unregister_worker(&self, worker_id: &str) -> bool {
        let mut state = self.lock();
        if state.allocations.values().any(|a| a.worker_id == worker_id) {
            debug!(worker_id, "Not unregistering busy worker");
            return false;
        }
        let removed = state.workers.remove(worker_id).is_some();
        if removed {
            info!(worker_id, "Unregistered worker");
        }
        removed
    }

    /// Removes a worker now if it is idle; otherwise stops giving it work and
    /// removes it when its last allocation is released. Returns true if it
    /// was removed immediately.
    pub fn retire_worker(&self, worker_id: &str) -> bool {
        let mut state = self.lock();
        let busy = state.allocations.values().any(|a| a.worker_id == worker_id);
        if !busy {
            let removed = state.workers.remove(worker_id).is_some();
            if removed {
                info!(worker_id, "Retired worker");
            }
            return removed;
        }
        if let Some(worker) = state.workers.get_mut(worker_id) {
            worker.draining = true;
            info!(worker_id, "Worker draining before retirement");
        }
        false
    }

    pub fn worker(&self, worker_id: &str) -> Option<WorkerResource> {
        self.lock().workers.get(worker_id).cloned()
    }

    pub fn worker_ids(&self) -> Vec<String> {
        self.lock().workers.keys().cloned().collect()
    }

    /// Workers with no active allocation.
    pub fn idle_worker_ids(&self) -> Vec<String> {
        let state = self.lock();
        state
            .workers
            .keys()
            .filter(|id| !state.allocations.values().any(|a| &a.worker_id == *id))
            .cloned()
            .collect()
    }

    // ─── Queue ───

    /// Scores and enqueues a job. Returns the score.
    pub fn queue_job(&self, job: &Job, processing_types: &[ProcessingType]) -> i64 {
        let score = priority_score(job, processing_types, Utc::now());
        self.lock()
            .queue
            .push(&job.job_id, job.priority, processing_types.to_vec(), score);
        debug!(job_id = %job.job_id, score, "Queued job");
        self.work_available.notify_one();
        score
    }

    /// Id of the job that would be served next.
    pub fn peek_next(&self) -> Option<String> {
        self.lock().queue.peek().map(|e| e.job_id.clone())
    }

    /// Drops a queued job (cancelled before dispatch).
    pub fn remove_job(&self, job_id: &str) -> bool {
        self.lock().queue.remove(job_id).is_some()
    }

    pub fn is_queued(&self, job_id: &str) -> bool {
        self.lock().queue.contains(job_id)
    }

    pub fn queue_len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Waits until work may be available, or `timeout` passes.
    pub async fn wait_for_work(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.work_available.notified()).await;
    }

    // ─── Allocation ───

    /// Claims a queued job onto the best-fitting worker.
    ///
    /// `Ok(None)` means no worker has headroom right now and the job stays
    /// queued. A job larger than every worker's total capacity is removed
    /// from the queue and reported as [`AllocationError::Unsatisfiable`].
    pub fn allocate_resources(
        &self,
        job_id: &str,
    ) -> Result<Option<ResourceAllocation>, AllocationError> {
        let mut state = self.lock();

        if state.allocations.contains_key(job_id) {
            return Err(AllocationError::AlreadyAllocated(job_id.to_string()));
        }
        let entry = state
            .queue
            .get(job_id)
            .cloned()
            .ok_or_else(|| AllocationError::NotQueued(job_id.to_string()))?;

        let need = total_requirements(&entry.processing_types);

        let worker_id = match state.best_worker(&need.resources, None) {
            Some(w) => w.worker_id.clone(),
            None => {
                let mut live = state.workers.values().filter(|w| !w.draining).peekable();
                let no_live_workers = live.peek().is_none();
                let ever_fits = live.any(|w| w.max.covers(&need.resources));
                if ever_fits || no_live_workers {
                    debug!(job_id, "No worker has headroom; job stays queued");
                    return Ok(None);
                }
                state.queue.remove(job_id);
                return Err(AllocationError::Unsatisfiable {
                    job_id: job_id.to_string(),
                    cpu_cores: need.resources.cpu_cores,
                    memory_mb: need.resources.memory_mb,
                    disk_mb: need.resources.disk_mb,
                    network_mbps: need.resources.network_mbps,
                });
            }
        };

        if let Some(worker) = state.workers.get_mut(&worker_id) {
            worker.available = worker.available.minus(&need.resources);
        }
        state.queue.remove(job_id);

        let allocation = ResourceAllocation {
            job_id: job_id.to_string(),
            worker_id: worker_id.clone(),
            allocated: need.resources,
            estimated_duration_seconds: need.estimated_duration_seconds,
            priority_score: entry.priority_score,
            allocated_at: Utc::now(),
        };
        state
            .allocations
            .insert(job_id.to_string(), allocation.clone());

        info!(
            job_id,
            worker_id = %worker_id,
            cpu = need.resources.cpu_cores,
            memory_mb = need.resources.memory_mb,
            "Allocated resources"
        );
        Ok(Some(allocation))
    }

    /// Returns a job's resources to its worker. Returns false if the job held
    /// no allocation (already released).
    pub fn release_resources(&self, job_id: &str) -> bool {
        let mut state = self.lock();
        let Some(allocation) = state.allocations.remove(job_id) else {
            return false;
        };
        if let Some(worker) = state.workers.get_mut(&allocation.worker_id) {
            worker.available = worker
                .available
                .plus_capped(&allocation.allocated, &worker.max);
        }
        let retire = state
            .workers
            .get(&allocation.worker_id)
            .is_some_and(|w| w.draining)
            && !state
                .allocations
                .values()
                .any(|a| a.worker_id == allocation.worker_id);
        if retire {
            state.workers.remove(&allocation.worker_id);
            info!(worker_id = %allocation.worker_id, "Retired drained worker");
        }
        drop(state);
        debug!(job_id, worker_id = %allocation.worker_id, "Released resources");
        self.work_available.notify_one();
        true
    }

    pub fn allocation(&self, job_id: &str) -> Option<ResourceAllocation> {
        self.lock().allocations.get(job_id).cloned()
    }

    pub fn active_allocations(&self) -> usize {
        self.lock().allocations.len()
    }

    // ─── Telemetry ───

    pub fn queue_status(&self) -> QueueStatus {
        let state = self.lock();
        let now = Utc::now();

        let mut jobs_by_priority: BTreeMap<String, usize> = [
            JobPriority::Urgent,
            JobPriority::High,
            JobPriority::Medium,
            JobPriority::Low,
        ]
        .iter()
        .map(|p| (p.as_str().to_string(), 0))
        .collect();

        let mut jobs: Vec<QueuedJob> = state.queue.iter().cloned().collect();
        for job in &jobs {
            *jobs_by_priority
                .entry(job.priority.as_str().to_string())
                .or_default() += 1;
        }

        let waits: Vec<f64> = jobs
            .iter()
            .map(|j| (now - j.queued_at).num_milliseconds().max(0) as f64 / 1000.0)
            .collect();
        let oldest_wait_seconds = waits.iter().copied().fold(0.0, f64::max);
        let average_wait_seconds = if waits.is_empty() {
            0.0
        } else {
            waits.iter().sum::<f64>() / waits.len() as f64
        };

        jobs.sort_by(|a, b| {
            b.priority_score
                .cmp(&a.priority_score)
                .then(a.seq.cmp(&b.seq))
        });
        jobs.truncate(50);

        QueueStatus {
            total_jobs: state.queue.len(),
            jobs_by_priority,
            jobs,
            oldest_wait_seconds,
            average_wait_seconds,
        }
    }

    pub fn resource_status(&self) -> ResourceStatus {
        let state = self.lock();
        let mut total = Resources::ZERO;
        let mut available = Resources::ZERO;
        for w in state.workers.values() {
            total.cpu_cores += w.max.cpu_cores;
            total.memory_mb += w.max.memory_mb;
            total.disk_mb += w.max.disk_mb;
            total.network_mbps += w.max.network_mbps;
            available.cpu_cores += w.available.cpu_cores;
            available.memory_mb += w.available.memory_mb;
            available.disk_mb += w.available.disk_mb;
            available.network_mbps += w.available.network_mbps;
        }

        fn percent(total: f64, available: f64) -> f64 {
            if total > 0.0 {
                (total - available) / total * 100.0
            } else {
                0.0
            }
        }

        ResourceStatus {
            cpu_utilization_percent: percent(total.cpu_cores, available.cpu_cores),
            memory_utilization_percent: percent(total.memory_mb as f64, available.memory_mb as f64),
            disk_utilization_percent: percent(total.disk_mb as f64, available.disk_mb as f64),
            network_utilization_percent: percent(
                total.network_mbps as f64,
                available.network_mbps as f64,
            ),
            total,
            available,
            active_allocations: state.allocations.len(),
            workers: state.workers.values().cloned().collect(),
        }
    }

    /// Suggests moving running jobs to workers where they would sit at a
    /// noticeably lower utilization. Advisory only; nothing is migrated.
    pub fn rebalance_recommendations(&self) -> Vec<RebalanceRecommendation> {
        let state = self.lock();
        let mut out = Vec::new();

        for allocation in state.allocations.values() {
            let Some(current) = state.workers.get(&allocation.worker_id) else {
                continue;
            };
            let current_utilization = current.utilization();

            let Some(better) =
                state.best_worker(&allocation.allocated, Some(&allocation.worker_id))
            else {
                continue;
            };
            let mut moved = better.clone();
            moved.available = moved.available.minus(&allocation.allocated);
            let proposed_utilization = moved.utilization();

            if proposed_utilization < current_utilization - 0.1 {
                out.push(RebalanceRecommendation {
                    job_id: allocation.job_id.clone(),
                    from_worker: allocation.worker_id.clone(),
                    to_worker: better.worker_id.clone(),
                    current_utilization,
                    proposed_utilization,
                    improvement: current_utilization - proposed_utilization,
                });
            }
        }

        out.sort_by(|a, b| b.improvement.total_cmp(&a.improvement));
        out.truncate(10);
        out
    }
}
