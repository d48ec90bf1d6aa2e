//! Job lifecycle and the worker pool that executes jobs.
//!
//! The manager is the only component that mutates jobs. Every status change
//! goes through the in-memory job table under one lock, is written to the
//! store, broadcast as a [`JobEvent`](crate::broadcast::JobEvent), and, for
//! terminal transitions, reported to the job's callback URL.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

mod worker;

use crate::allocator::{ResourceAllocation, ResourceAllocator};
use crate::broadcast::{JobEvent, JobEventBroadcaster, JobEventKind};
use crate::callback::{self, CallbackDispatcher, NoopCallbacks};
use crate::config::Settings;
use crate::dead_letter::{DeadLetterQueue, Resubmission};
use crate::error::{FileprocError, JobError, Result};
use crate::executor::ExecutorRegistry;
use crate::models::{Job, JobProgress, JobRequest, JobResult, JobStatus, ProcessingType};
use crate::pipeline::{
    PipelineOutput, PipelineRegistry, PipelineRunner, ProgressEvent, ProgressReporter,
};
use crate::resolver::{DirectoryResolver, FileResolver};
use crate::retry::RetryHandler;
use crate::scaler::{ProcProbe, ScaleTarget, SystemProbe, WorkerMetricsUpdate, WorkerScaler};
use crate::store::{self, RecordFilter, RecordKind, Store};

/// Terminal jobs beyond this many are evicted from the cache, oldest first.
const CACHE_LIMIT: usize = 10_000;

const MIN_HEARTBEAT_PERIOD: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct JobMetrics {
    pub total_jobs: usize,
    pub pending_jobs: usize,
    pub running_jobs: usize,
    pub completed_jobs: usize,
    pub failed_jobs: usize,
    pub cancelled_jobs: usize,
    pub queue_size: usize,
    pub in_flight: usize,
    pub worker_slots: usize,
    pub average_processing_time_seconds: f64,
    /// Percentage of finished (completed or failed) jobs that completed.
    pub success_rate: f64,
}

#[derive(Default)]
struct JobTable {
    jobs: HashMap<String, Job>,
    /// Cancellation handles of jobs currently executing.
    running: HashMap<String, CancellationToken>,
}

struct WorkerSlot {
    worker_id: String,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

enum RunOutcome {
    Finished(std::result::Result<PipelineOutput, JobError>),
    Cancelled,
}

// ─── Builder ───

pub struct JobManagerBuilder {
    settings: Settings,
    store: Arc<dyn Store>,
    executors: ExecutorRegistry,
    resolver: Option<Arc<dyn FileResolver>>,
    callbacks: Arc<dyn CallbackDispatcher>,
    probe: Box<dyn SystemProbe>,
    shutdown: CancellationToken,
}

impl JobManagerBuilder {
    pub fn with_executors(mut self, executors: ExecutorRegistry) -> Self {
        self.executors = executors;
        self
    }

    /// Defaults to a [`DirectoryResolver`] over `processing.files_dir`.
    pub fn with_resolver(mut self, resolver: Arc<dyn FileResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_callbacks(mut self, callbacks: Arc<dyn CallbackDispatcher>) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn with_probe(mut self, probe: Box<dyn SystemProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn build(self) -> Arc<JobManager> {
        let settings = self.settings;
        let (resubmit_tx, resubmit_rx) = mpsc::unbounded_channel();

        let resolver = self.resolver.unwrap_or_else(|| {
            Arc::new(DirectoryResolver::new(&settings.processing.files_dir))
        });
        let dead_letters = Arc::new(
            DeadLetterQueue::new(
                settings.dead_letter.clone(),
                self.store.clone(),
                self.callbacks.clone(),
            )
            .with_resubmit(resubmit_tx)
            .with_shutdown(self.shutdown.clone()),
        );
        let runner = PipelineRunner::new(self.executors, settings.processing.work_dir.clone());

        Arc::new_cyclic(|me| JobManager {
            me: me.clone(),
            allocator: Arc::new(ResourceAllocator::new()),
            retry: Arc::new(RetryHandler::new(settings.retry.clone())),
            dead_letters,
            scaler: Arc::new(WorkerScaler::new(settings.scaling.clone(), self.probe)),
            pipelines: Arc::new(PipelineRegistry::new(self.store.clone())),
            runner,
            resolver,
            callbacks: self.callbacks,
            events: JobEventBroadcaster::default(),
            store: self.store,
            shutdown: self.shutdown,
            table: Mutex::new(JobTable::default()),
            pool: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            started: AtomicBool::new(false),
            resubmissions: Mutex::new(Some(resubmit_rx)),
            settings,
        })
    }
}

// ─── Manager ───

pub struct JobManager {
    me: Weak<JobManager>,
    settings: Settings,
    store: Arc<dyn Store>,
    allocator: Arc<ResourceAllocator>,
    retry: Arc<RetryHandler>,
    dead_letters: Arc<DeadLetterQueue>,
    scaler: Arc<WorkerScaler>,
    pipelines: Arc<PipelineRegistry>,
    runner: PipelineRunner,
    resolver: Arc<dyn FileResolver>,
    callbacks: Arc<dyn CallbackDispatcher>,
    events: JobEventBroadcaster,
    shutdown: CancellationToken,
    table: Mutex<JobTable>,
    pool: Mutex<Vec<WorkerSlot>>,
    in_flight: AtomicUsize,
    started: AtomicBool,
    resubmissions: Mutex<Option<mpsc::UnboundedReceiver<Resubmission>>>,
}

impl JobManager {
    pub fn builder(settings: Settings, store: Arc<dyn Store>) -> JobManagerBuilder {
        JobManagerBuilder {
            settings,
            store,
            executors: ExecutorRegistry::new(),
            resolver: None,
            callbacks: Arc::new(NoopCallbacks),
            probe: Box::new(ProcProbe::default()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn allocator(&self) -> &Arc<ResourceAllocator> {
        &self.allocator
    }

    pub fn retry_handler(&self) -> &Arc<RetryHandler> {
        &self.retry
    }

    pub fn dead_letters(&self) -> &Arc<DeadLetterQueue> {
        &self.dead_letters
    }

    pub fn scaler(&self) -> &Arc<WorkerScaler> {
        &self.scaler
    }

    pub fn pipelines(&self) -> &Arc<PipelineRegistry> {
        &self.pipelines
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn callbacks(&self) -> &Arc<dyn CallbackDispatcher> {
        &self.callbacks
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    fn table(&self) -> MutexGuard<'_, JobTable> {
        self.table.lock().unwrap_or_else(|poisoned| {
            warn!("Job table lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn pool(&self) -> MutexGuard<'_, Vec<WorkerSlot>> {
        self.pool.lock().unwrap_or_else(|poisoned| {
            warn!("Worker pool lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    // ─── Startup & shutdown ───

    /// Loads persisted state, re-queues Pending jobs, and starts the worker
    /// pool and background tasks. Calling it again is a no-op.
    ///
    /// Jobs persisted as Running are cached but not resumed.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let pipelines = self.pipelines.load().await?;
        let dead_letters = self.dead_letters.load().await?;
        let requeued = self.reload_jobs().await?;

        let workers = self.resize_pool(self.initial_workers());
        self.scaler.set_current_workers(workers);

        let receiver = self
            .resubmissions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(receiver) = receiver {
            tokio::spawn(Arc::clone(self).consume_resubmissions(receiver));
        }

        let sweep_interval =
            Duration::from_secs(self.settings.dead_letter.sweep_interval_seconds.max(1));
        tokio::spawn(
            self.dead_letters
                .clone()
                .run_retention_sweep(self.shutdown.child_token(), sweep_interval),
        );

        if self.settings.scaling.enabled {
            let target: Arc<dyn ScaleTarget> = self.clone();
            tokio::spawn(
                self.scaler
                    .clone()
                    .run(self.shutdown.child_token(), target),
            );
        }

        info!(
            workers,
            requeued,
            custom_pipelines = pipelines,
            dead_letters,
            "Job manager started"
        );
        Ok(())
    }

    /// Stops accepting work, cancels in-flight execution and waits for every
    /// worker loop to exit.
    pub async fn shutdown(&self) {
        info!("Shutting down job manager...");
        self.shutdown.cancel();
        let slots: Vec<WorkerSlot> = self.pool().drain(..).collect();
        let handles = slots.into_iter().map(|slot| slot.handle);
        for result in futures_util::future::join_all(handles).await {
            if let Err(e) = result {
                error!(error = %e, "Worker task panicked");
            }
        }
        info!("All workers have stopped");
    }

    fn initial_workers(&self) -> usize {
        let wanted = self.settings.processing.max_concurrent_jobs.max(1);
        let scaling = &self.settings.scaling;
        if scaling.enabled {
            wanted.clamp(scaling.min_workers.max(1), scaling.max_workers.max(1))
        } else {
            wanted
        }
    }

    async fn reload_jobs(&self) -> Result<usize> {
        let pending: Vec<Job> = store::query_as(
            self.store.as_ref(),
            RecordKind::Job,
            &RecordFilter::status(JobStatus::Pending.as_str()),
            usize::MAX,
            0,
        )
        .await?;
        let running: Vec<Job> = store::query_as(
            self.store.as_ref(),
            RecordKind::Job,
            &RecordFilter::status(JobStatus::Running.as_str()),
            usize::MAX,
            0,
        )
        .await?;

        if !running.is_empty() {
            warn!(
                count = running.len(),
                "Jobs left Running by a previous process are not resumed"
            );
        }
        for job in running {
            self.cache_job(job);
        }

        let count = pending.len();
        for job in pending {
            self.cache_job(job.clone());
            self.enqueue(&job);
        }
        Ok(count)
    }

    async fn consume_resubmissions(self: Arc<Self>, mut receiver: mpsc::UnboundedReceiver<Resubmission>) {
        loop {
            let resubmission = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = receiver.recv() => match next {
                    Some(r) => r,
                    None => break,
                },
            };
            self.accept_resubmission(resubmission).await;
        }
        debug!("Resubmission consumer stopped");
    }

    async fn accept_resubmission(&self, resubmission: Resubmission) {
        let Resubmission {
            previous_job_id,
            job,
        } = resubmission;
        let next_id = job.job_id.clone();

        match self.submit(job).await {
            Ok(_) => info!(previous_job_id = %previous_job_id, job_id = %next_id, "Re-submitted dead-lettered job"),
            Err(e) => {
                error!(previous_job_id = %previous_job_id, error = %e, "Failed to re-submit job");
                return;
            }
        }

        if self.get_job(&previous_job_id).await.is_ok() {
            let updated = self.update_job(&previous_job_id, |j| {
                j.retried_as = Some(next_id.clone());
                true
            });
            if let Some(previous) = updated {
                self.persist(&previous).await;
            }
        }
    }

    // ─── Job operations ───

    /// Validates the request, persists a Pending job and queues it. Does not
    /// wait for execution.
    pub async fn create_job(&self, request: JobRequest) -> Result<Job> {
        if self.shutdown.is_cancelled() {
            return Err(FileprocError::ShutDown);
        }
        request.validate()?;
        self.submit(Job::from_request(request)).await
    }

    async fn submit(&self, job: Job) -> Result<Job> {
        store::save_as(self.store.as_ref(), RecordKind::Job, &job.job_id, &job).await?;
        self.cache_job(job.clone());
        self.events.publish(JobEventKind::Queued, &job, "Job queued");
        self.enqueue(&job);
        info!(
            job_id = %job.job_id,
            file_id = %job.file_id,
            priority = job.priority.as_str(),
            attempt = job.attempt,
            "Created job"
        );
        Ok(job)
    }

    /// Cache first, then the store.
    pub async fn get_job(&self, job_id: &str) -> Result<Job> {
        let cached = self.table().jobs.get(job_id).cloned();
        if let Some(job) = cached {
            return Ok(job);
        }
        let stored: Option<Job> = store::get_as(self.store.as_ref(), RecordKind::Job, job_id).await?;
        let job = stored.ok_or_else(|| FileprocError::JobNotFound(job_id.to_string()))?;
        let mut table = self.table();
        Ok(table
            .jobs
            .entry(job.job_id.clone())
            .or_insert(job)
            .clone())
    }

    /// Newest first.
    pub async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Job>> {
        let filter = status
            .map(|s| RecordFilter::status(s.as_str()))
            .unwrap_or_default();
        Ok(store::query_as(self.store.as_ref(), RecordKind::Job, &filter, limit, offset).await?)
    }

    /// Cancels a job that has not finished. Returns false if it already had.
    pub async fn cancel_job(&self, job_id: &str) -> Result<bool> {
        self.get_job(job_id).await?;

        let Some(job) = self.update_job(job_id, |j| j.finish(JobStatus::Cancelled, None)) else {
            return Ok(false);
        };

        self.allocator.remove_job(job_id);
        let running = self.table().running.get(job_id).cloned();
        if let Some(token) = running {
            token.cancel();
        }
        self.allocator.release_resources(job_id);

        self.persist(&job).await;
        self.events.publish(JobEventKind::Cancelled, &job, "Job cancelled");
        info!(job_id, "Cancelled job");
        self.send_callback(&job).await;
        Ok(true)
    }

    /// The most recent attempt in `job_id`'s retry chain.
    pub async fn latest_attempt(&self, job_id: &str) -> Result<Job> {
        let mut job = self.get_job(job_id).await?;
        while let Some(next) = job.retried_as.clone() {
            job = self.get_job(&next).await?;
        }
        Ok(job)
    }

    /// Waits until the job, or the last job of its retry chain, is terminal.
    pub async fn wait_for_outcome(&self, job_id: &str) -> Result<Job> {
        let mut events = self.events.subscribe();
        let mut current = job_id.to_string();
        loop {
            let job = self.get_job(&current).await?;
            if job.is_terminal() {
                match job.retried_as {
                    Some(next) => {
                        current = next;
                        continue;
                    }
                    None => return Ok(job),
                }
            }

            loop {
                let event = tokio::select! {
                    _ = self.shutdown.cancelled() => return Err(FileprocError::ShutDown),
                    event = events.recv() => event,
                };
                match event {
                    Ok(event) if event.job_id == current && event.is_final() => break,
                    Ok(_) => continue,
                    // Missed events; re-read the job instead.
                    Err(broadcast::error::RecvError::Lagged(_)) => break,
                    Err(broadcast::error::RecvError::Closed) => return Err(FileprocError::ShutDown),
                }
            }
        }
    }

    pub fn metrics(&self) -> JobMetrics {
        let table = self.table();
        let count = |status: JobStatus| table.jobs.values().filter(|j| j.status == status).count();
        let completed = count(JobStatus::Completed);
        let failed = count(JobStatus::Failed);

        let times: Vec<f64> = table
            .jobs
            .values()
            .filter_map(|j| j.result.as_ref())
            .map(|r| r.processing_time_seconds)
            .filter(|t| *t > 0.0)
            .collect();
        let average = if times.is_empty() {
            0.0
        } else {
            times.iter().sum::<f64>() / times.len() as f64
        };
        let finished = completed + failed;

        JobMetrics {
            total_jobs: table.jobs.len(),
            pending_jobs: count(JobStatus::Pending),
            running_jobs: count(JobStatus::Running),
            completed_jobs: completed,
            failed_jobs: failed,
            cancelled_jobs: count(JobStatus::Cancelled),
            queue_size: self.allocator.queue_len(),
            in_flight: self.in_flight.load(Ordering::Acquire),
            worker_slots: self.pool().len(),
            average_processing_time_seconds: average,
            success_rate: if finished > 0 {
                completed as f64 / finished as f64 * 100.0
            } else {
                0.0
            },
        }
    }

    // ─── Worker pool ───

    /// Grows or shrinks the pool to `target` slots (at least one). Removed
    /// slots finish their current job first. Returns the new size.
    pub fn resize_pool(&self, target: usize) -> usize {
        let target = target.max(1);
        let Some(me) = self.me.upgrade() else {
            return self.pool().len();
        };
        if self.shutdown.is_cancelled() {
            return self.pool().len();
        }

        let mut pool = self.pool();
        let before = pool.len();
        while pool.len() < target {
            let worker_id = format!("worker-{}", pool.len());
            self.allocator
                .register_worker(&worker_id, self.settings.worker_resources);
            self.scaler.register_worker(&worker_id, 1);
            let token = self.shutdown.child_token();
            let handle = tokio::spawn(worker::run_worker(
                me.clone(),
                worker_id.clone(),
                token.clone(),
            ));
            pool.push(WorkerSlot {
                worker_id,
                token,
                handle,
            });
        }
        while pool.len() > target {
            let Some(slot) = pool.pop() else { break };
            slot.token.cancel();
            self.allocator.retire_worker(&slot.worker_id);
            self.scaler.remove_worker(&slot.worker_id);
        }
        if pool.len() != before {
            info!(from = before, to = pool.len(), "Resized worker pool");
        }
        pool.len()
    }

    fn try_reserve_slot(&self) -> bool {
        let max = self.settings.processing.max_concurrent_jobs.max(1);
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .is_ok()
    }

    fn release_slot(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    fn heartbeat_update(&self, slot: &str, update: WorkerMetricsUpdate) {
        // Retired slots stop reporting.
        if !self.pool().iter().any(|s| s.worker_id == slot) {
            return;
        }
        self.scaler.update_worker_metrics(slot, update);
    }

    fn heartbeat(&self, slot: &str, current_jobs: usize, completed: u64, failed: u64) {
        self.heartbeat_update(
            slot,
            WorkerMetricsUpdate {
                current_jobs: Some(current_jobs),
                jobs_completed: Some(completed),
                jobs_failed: Some(failed),
                ..WorkerMetricsUpdate::default()
            },
        );
    }

    /// Beat interval for a busy slot: a third of the heartbeat timeout.
    fn heartbeat_period(&self) -> Duration {
        (Duration::from_secs(self.settings.scaling.heartbeat_timeout_seconds) / 3)
            .max(MIN_HEARTBEAT_PERIOD)
    }

    // ─── Execution ───

    /// Runs an allocated job to a terminal state. Returns the status this
    /// call moved the job to, if any.
    async fn execute(&self, slot: &str, allocation: ResourceAllocation) -> Option<JobStatus> {
        let job_id = allocation.job_id.clone();
        if let Err(e) = self.get_job(&job_id).await {
            warn!(job_id = %job_id, error = %e, "Dispatched job could not be loaded");
            self.allocator.release_resources(&job_id);
            return None;
        }

        let token = self.shutdown.child_token();
        let started = {
            let mut table = self.table();
            let started = match table.jobs.get_mut(&job_id) {
                Some(job) => job.start(&allocation.worker_id).then(|| job.clone()),
                None => None,
            };
            if started.is_some() {
                table.running.insert(job_id.clone(), token.clone());
            }
            started
        };
        let Some(job) = started else {
            debug!(job_id = %job_id, "Job is no longer pending, skipping");
            self.allocator.release_resources(&job_id);
            return None;
        };

        self.persist(&job).await;
        self.events.publish(JobEventKind::Started, &job, "Job started");

        let span = info_span!("job",
            job_id = %job_id,
            worker_id = %allocation.worker_id,
            slot = %slot,
        );
        let clock = Instant::now();
        let outcome = async {
            let work = self.run_pipeline(&job, slot);
            tokio::pin!(work);
            // Keeps the slot alive in the scaler while a single step runs
            // longer than the heartbeat timeout.
            let mut pulse = tokio::time::interval(self.heartbeat_period());
            pulse.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break RunOutcome::Cancelled,
                    result = &mut work => break RunOutcome::Finished(result),
                    _ = pulse.tick() => self.heartbeat_update(
                        slot,
                        WorkerMetricsUpdate {
                            current_jobs: Some(1),
                            ..WorkerMetricsUpdate::default()
                        },
                    ),
                }
            }
        }
        .instrument(span)
        .await;

        self.finalize(&job_id, outcome, clock.elapsed().as_secs_f64(), true)
            .await
    }

    async fn run_pipeline(
        &self,
        job: &Job,
        slot: &str,
    ) -> std::result::Result<PipelineOutput, JobError> {
        let input = self
            .resolver
            .resolve(&job.file_id)
            .await
            .ok_or_else(|| JobError::not_found(format!("File not found: {}", job.file_id)))?;
        let pipeline = self
            .pipelines
            .resolve(job)
            .map_err(|e| JobError::not_found(e.to_string()))?;

        let total = pipeline.steps.len();
        self.update_job(&job.job_id, |j| {
            j.progress = JobProgress::new(total);
            true
        });

        let reporter = ProgressSink {
            manager: self,
            job_id: &job.job_id,
            slot,
        };
        let limit = Duration::from_secs(self.settings.processing.job_timeout_seconds);
        match tokio::time::timeout(
            limit,
            self.runner.run(&job.job_id, &pipeline, &input, &reporter),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(JobError::timeout(format!(
                "Job exceeded timeout of {}s",
                self.settings.processing.job_timeout_seconds
            ))),
        }
    }

    /// Fails a job the allocator can never place. It goes straight to the
    /// dead letter queue; retrying cannot help.
    async fn fail_unplaceable(&self, job_id: &str, error: JobError) {
        if self.get_job(job_id).await.is_err() {
            return;
        }
        self.finalize(job_id, RunOutcome::Finished(Err(error)), 0.0, false)
            .await;
    }

    async fn finalize(
        &self,
        job_id: &str,
        outcome: RunOutcome,
        elapsed: f64,
        allow_retry: bool,
    ) -> Option<JobStatus> {
        self.allocator.release_resources(job_id);
        self.table().running.remove(job_id);

        let result = match outcome {
            RunOutcome::Cancelled => {
                debug!(job_id, "Execution stopped");
                let status = self.table().jobs.get(job_id).map(|j| j.status);
                return status.filter(|s| *s == JobStatus::Cancelled);
            }
            RunOutcome::Finished(result) => result,
        };

        let current = self.table().jobs.get(job_id).cloned()?;
        if current.is_terminal() {
            return None;
        }

        let (status, job_result, failure) = match result {
            Ok(output) => (
                JobStatus::Completed,
                JobResult {
                    success: true,
                    output_files: output
                        .output_files
                        .iter()
                        .map(|p| p.display().to_string())
                        .collect(),
                    metadata: output.metadata,
                    error_message: None,
                    processing_time_seconds: elapsed,
                },
                None,
            ),
            Err(err) => (
                JobStatus::Failed,
                JobResult::failure(err.message.clone(), elapsed),
                Some(err),
            ),
        };

        let retry = match &failure {
            Some(err) if allow_retry => {
                let decision = self.retry.should_retry(&current, err, None);
                if decision.retry {
                    Some((current.next_attempt(), decision))
                } else {
                    None
                }
            }
            _ => None,
        };
        let next_id = retry.as_ref().map(|(next, _)| next.job_id.clone());

        // The next attempt is cached under the same lock that publishes `retried_as`.
        let job = {
            let mut table = self.table();
            let job = table.jobs.get_mut(job_id)?;
            if !job.finish(status, Some(job_result)) {
                return None;
            }
            job.retried_as = next_id;
            let job = job.clone();
            if let Some((next, _)) = &retry {
                table.jobs.insert(next.job_id.clone(), next.clone());
            }
            job
        };

        if let Some((next, _)) = &retry {
            self.persist(next).await;
        }
        self.persist(&job).await;
        let message = if status == JobStatus::Completed {
            "Job completed"
        } else {
            "Job failed"
        };
        self.events
            .publish(JobEventKind::for_status(job.status), &job, message);
        info!(
            job_id,
            status = %job.status,
            elapsed_seconds = elapsed,
            error = job.error_message().unwrap_or_default(),
            "Job finished"
        );
        self.send_callback(&job).await;

        match (retry, failure) {
            (Some((next, decision)), _) => {
                self.events.publish(
                    JobEventKind::Retrying,
                    &job,
                    &format!(
                        "Retrying as {} in {:.1}s",
                        next.job_id, decision.delay_seconds
                    ),
                );
                self.schedule_retry(next, decision.delay());
            }
            (None, Some(err)) => self.dead_letter(&job, &err).await,
            (None, None) => self.retry.clear_history(job.lineage_id()),
        }
        Some(job.status)
    }

    async fn dead_letter(&self, job: &Job, error: &JobError) {
        let lineage = job.lineage_id().to_string();
        let retry_count = self.retry.attempt_count(&lineage);
        let attempts = self.retry.retry_history(&lineage);
        match self
            .dead_letters
            .add_job(job, error, retry_count, attempts)
            .await
        {
            Ok(entry_id) => info!(job_id = %entry_id, retry_count, "Moved job to dead letter queue"),
            Err(e) => error!(job_id = %job.job_id, error = %e, "Failed to dead-letter job"),
        }
        self.retry.clear_history(&lineage);
    }

    fn schedule_retry(&self, job: Job, delay: Duration) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!(job_id = %job.job_id, "Shut down before retry was queued; it stays Pending in the store");
                }
                _ = tokio::time::sleep(delay) => me.enqueue_if_pending(&job.job_id),
            }
        });
    }

    // ─── Helpers ───

    fn processing_types(&self, job: &Job) -> Vec<ProcessingType> {
        self.pipelines
            .resolve(job)
            .map(|p| p.processing_types())
            .unwrap_or_default()
    }

    fn enqueue(&self, job: &Job) {
        let score = self.allocator.queue_job(job, &self.processing_types(job));
        debug!(job_id = %job.job_id, score, "Enqueued job");
    }

    fn enqueue_if_pending(&self, job_id: &str) {
        let job = self.table().jobs.get(job_id).cloned();
        match job {
            Some(job) if job.status == JobStatus::Pending && !self.allocator.is_queued(job_id) => {
                self.enqueue(&job)
            }
            _ => debug!(job_id, "Retry no longer pending, not queued"),
        }
    }

    /// Applies `change` to the cached job. Returns the updated job when
    /// `change` reported a modification.
    fn update_job(&self, job_id: &str, change: impl FnOnce(&mut Job) -> bool) -> Option<Job> {
        let mut table = self.table();
        let job = table.jobs.get_mut(job_id)?;
        change(job).then(|| job.clone())
    }

    fn cache_job(&self, job: Job) {
        let mut table = self.table();
        table.jobs.insert(job.job_id.clone(), job);
        if table.jobs.len() > CACHE_LIMIT {
            evict_terminal(&mut table.jobs);
        }
    }

    async fn persist(&self, job: &Job) {
        if let Err(e) = store::save_as(self.store.as_ref(), RecordKind::Job, &job.job_id, job).await
        {
            error!(job_id = %job.job_id, error = %e, "Failed to persist job");
        }
    }

    async fn send_callback(&self, job: &Job) {
        if let Some(url) = &job.callback_url {
            callback::deliver(self.callbacks.as_ref(), url, &callback::job_payload(job)).await;
        }
    }
}

fn evict_terminal(jobs: &mut HashMap<String, Job>) {
    let excess = jobs.len().saturating_sub(CACHE_LIMIT);
    let mut terminal: Vec<_> = jobs
        .values()
        .filter(|j| j.is_terminal())
        .map(|j| (j.completed_at.unwrap_or(j.created_at), j.job_id.clone()))
        .collect();
    terminal.sort();
    for (_, job_id) in terminal.into_iter().take(excess) {
        jobs.remove(&job_id);
    }
}

impl ScaleTarget for JobManager {
    fn worker_count(&self) -> usize {
        self.pool().len()
    }

    fn queue_size(&self) -> usize {
        self.allocator.queue_len()
    }

    fn scale_to(&self, workers: usize) -> usize {
        self.resize_pool(workers)
    }
}

/// Mirrors runner progress into the job table, the event stream and the
/// scaler heartbeat.
struct ProgressSink<'a> {
    manager: &'a JobManager,
    job_id: &'a str,
    slot: &'a str,
}

impl ProgressReporter for ProgressSink<'_> {
    fn report(&self, event: ProgressEvent) {
        let updated = self.manager.update_job(self.job_id, |j| {
            if j.status != JobStatus::Running {
                return false;
            }
            match &event {
                ProgressEvent::StepStarted { total, name, .. } => {
                    j.progress.total_steps = *total;
                    j.progress.current_step_name = Some(name.clone());
                    j.progress.message = Some(format!("Processing step: {}", name));
                }
                ProgressEvent::StepCompleted {
                    completed, name, ..
                } => {
                    j.progress.advance(*completed, name);
                    j.progress.message = Some(format!("Completed step: {}", name));
                }
                ProgressEvent::Failed { step, error } => {
                    j.progress.message = Some(format!("Step {} failed: {}", step, error));
                }
            }
            true
        });

        if let Some(job) = updated {
            let message = job.progress.message.clone().unwrap_or_default();
            self.manager
                .events
                .publish(JobEventKind::Progress, &job, &message);
        }
        self.manager.heartbeat_update(
            self.slot,
            WorkerMetricsUpdate {
                current_jobs: Some(1),
                ..WorkerMetricsUpdate::default()
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use async_trait::async_trait;
    use tempfile::TempDir;

    use crate::error::ErrorKind;
    use crate::executor::{ProcessingExecutor, StepOutput};
    use crate::models::{JobPriority, Metadata};
    use crate::scaler::FixedProbe;
    use crate::store::MemoryStore;

    struct Passthrough;

    #[async_trait]
    impl ProcessingExecutor for Passthrough {
        async fn execute(
            &self,
            processing_type: ProcessingType,
            _input: &Path,
            _parameters: &Metadata,
            work_dir: &Path,
        ) -> std::result::Result<StepOutput, JobError> {
            Ok(StepOutput::new(vec![work_dir.join(processing_type.as_str())]))
        }
    }

    struct Failing(ErrorKind, &'static str);

    #[async_trait]
    impl ProcessingExecutor for Failing {
        async fn execute(
            &self,
            _processing_type: ProcessingType,
            _input: &Path,
            _parameters: &Metadata,
            _work_dir: &Path,
        ) -> std::result::Result<StepOutput, JobError> {
            Err(JobError::new(self.0, self.1))
        }
    }

    struct Hanging;

    #[async_trait]
    impl ProcessingExecutor for Hanging {
        async fn execute(
            &self,
            _processing_type: ProcessingType,
            _input: &Path,
            _parameters: &Metadata,
            _work_dir: &Path,
        ) -> std::result::Result<StepOutput, JobError> {
            std::future::pending::<()>().await;
            Ok(StepOutput::default())
        }
    }

    fn settings(tmp: &TempDir) -> Settings {
        let mut settings = Settings::default();
        settings.processing.files_dir = tmp.path().join("files");
        settings.processing.work_dir = tmp.path().join("work");
        settings.processing.max_concurrent_jobs = 2;
        settings.processing.backoff_millis = 5;
        settings.scaling.enabled = false;
        settings.retry.base_delay_seconds = 0.01;
        settings.retry.jitter = false;
        settings
    }

    fn manager(tmp: &TempDir, executor: Arc<dyn ProcessingExecutor>) -> Arc<JobManager> {
        std::fs::create_dir_all(tmp.path().join("files")).unwrap();
        std::fs::write(tmp.path().join("files").join("cat.jpg"), b"jpeg").unwrap();
        JobManager::builder(settings(tmp), Arc::new(MemoryStore::new()))
            .with_executors(ExecutorRegistry::uniform(executor))
            .with_probe(Box::new(FixedProbe::default()))
            .build()
    }

    #[tokio::test]
    async fn test_create_job_rejects_invalid_request() {
        let tmp = TempDir::new().unwrap();
        let m = manager(&tmp, Arc::new(Passthrough));
        let err = m
            .create_job(JobRequest {
                file_id: "cat.jpg".into(),
                ..JobRequest::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, FileprocError::Validation(_)));
    }

    #[tokio::test]
    async fn test_job_runs_to_completion() {
        let tmp = TempDir::new().unwrap();
        let m = manager(&tmp, Arc::new(Passthrough));
        m.start().await.unwrap();

        let job = m
            .create_job(JobRequest::new("cat.jpg", "image_optimize"))
            .await
            .unwrap();
        let done = m.wait_for_outcome(&job.job_id).await.unwrap();

        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.progress.percentage, 100.0);
        let result = done.result.unwrap();
        assert!(result.success);
        assert_eq!(result.output_files.len(), 2);
        assert!(done.worker_id.is_some());
        assert_eq!(m.allocator().active_allocations(), 0);

        let stored = m.list_jobs(Some(JobStatus::Completed), 10, 0).await.unwrap();
        assert_eq!(stored.len(), 1);
        m.shutdown().await;
    }

    #[tokio::test]
    async fn test_missing_file_is_dead_lettered_without_retry() {
        let tmp = TempDir::new().unwrap();
        let m = manager(&tmp, Arc::new(Passthrough));
        m.start().await.unwrap();

        let job = m
            .create_job(JobRequest::new("ghost.jpg", "image_resize"))
            .await
            .unwrap();
        let done = m.wait_for_outcome(&job.job_id).await.unwrap();

        assert_eq!(done.job_id, job.job_id);
        assert_eq!(done.status, JobStatus::Failed);
        assert_eq!(done.error_message(), Some("File not found: ghost.jpg"));
        assert!(done.retried_as.is_none());
        assert!(m.dead_letters().get_entry(&job.job_id).await.unwrap().is_some());
        m.shutdown().await;
    }

    #[tokio::test]
    async fn test_transient_failure_retries_then_dead_letters() {
        let tmp = TempDir::new().unwrap();
        let m = manager(
            &tmp,
            Arc::new(Failing(ErrorKind::Connection, "connection reset by peer")),
        );
        m.start().await.unwrap();

        let job = m
            .create_job(JobRequest::new("cat.jpg", "image_resize"))
            .await
            .unwrap();
        let last = m.wait_for_outcome(&job.job_id).await.unwrap();

        assert_eq!(last.status, JobStatus::Failed);
        assert_eq!(last.attempt, 4);
        assert_eq!(last.retry_of.as_deref(), Some(job.job_id.as_str()));

        let first = m.get_job(&job.job_id).await.unwrap();
        assert_eq!(first.status, JobStatus::Failed);
        assert!(first.retried_as.is_some());

        let entry = m
            .dead_letters()
            .get_entry(&last.job_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.retry_count, 3);
        assert_eq!(entry.processing_attempts.len(), 3);
        assert_eq!(m.retry_handler().attempt_count(&job.job_id), 0);
        m.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent_and_stops_execution() {
        let tmp = TempDir::new().unwrap();
        let m = manager(&tmp, Arc::new(Hanging));
        let mut events = m.subscribe();
        m.start().await.unwrap();

        let job = m
            .create_job(JobRequest::new("cat.jpg", "image_resize"))
            .await
            .unwrap();
        loop {
            let event = events.recv().await.unwrap();
            if event.job_id == job.job_id && event.kind == JobEventKind::Started {
                break;
            }
        }
        assert_eq!(m.allocator().active_allocations(), 1);

        assert!(m.cancel_job(&job.job_id).await.unwrap());
        assert!(!m.cancel_job(&job.job_id).await.unwrap());
        assert_eq!(m.allocator().active_allocations(), 0);

        let done = m.wait_for_outcome(&job.job_id).await.unwrap();
        assert_eq!(done.status, JobStatus::Cancelled);
        assert!(m.dead_letters().is_empty());
        m.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_unknown_job_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let m = manager(&tmp, Arc::new(Passthrough));
        assert!(matches!(
            m.cancel_job("nope").await,
            Err(FileprocError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_pending_jobs_are_requeued_on_start() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("files")).unwrap();
        std::fs::write(tmp.path().join("files").join("cat.jpg"), b"jpeg").unwrap();
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());

        let mut pending = Job::from_request(JobRequest::new("cat.jpg", "image_resize"));
        pending.priority = JobPriority::High;
        store::save_as(store.as_ref(), RecordKind::Job, &pending.job_id, &pending)
            .await
            .unwrap();
        let mut stuck = Job::from_request(JobRequest::new("cat.jpg", "image_resize"));
        stuck.start("worker-9");
        store::save_as(store.as_ref(), RecordKind::Job, &stuck.job_id, &stuck)
            .await
            .unwrap();

        let m = JobManager::builder(settings(&tmp), store)
            .with_executors(ExecutorRegistry::uniform(Arc::new(Passthrough)))
            .with_probe(Box::new(FixedProbe::default()))
            .build();
        m.start().await.unwrap();

        let done = m.wait_for_outcome(&pending.job_id).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        // Running jobs from a previous process are left alone.
        assert_eq!(m.get_job(&stuck.job_id).await.unwrap().status, JobStatus::Running);
        m.shutdown().await;
    }

    #[tokio::test]
    async fn test_resize_pool_registers_and_retires_workers() {
        let tmp = TempDir::new().unwrap();
        let m = manager(&tmp, Arc::new(Passthrough));

        assert_eq!(m.scale_to(3), 3);
        assert_eq!(m.allocator().worker_ids().len(), 3);
        assert!(m.scaler().worker("worker-2").is_some());

        assert_eq!(m.scale_to(1), 1);
        assert_eq!(m.allocator().worker_ids(), vec!["worker-0".to_string()]);
        assert!(m.scaler().worker("worker-2").is_none());
        assert_eq!(m.scale_to(0), 1);
        m.shutdown().await;
    }

    #[test]
    fn test_evict_terminal_keeps_active_jobs() {
        let mut jobs = HashMap::new();
        for i in 0..CACHE_LIMIT + 5 {
            let mut job = Job::from_request(JobRequest::new(&format!("f{}", i), "image_resize"));
            if i % 2 == 0 {
                job.finish(JobStatus::Cancelled, None);
            }
            jobs.insert(job.job_id.clone(), job);
        }
        evict_terminal(&mut jobs);
        assert_eq!(jobs.len(), CACHE_LIMIT);
        assert_eq!(
            jobs.values().filter(|j| !j.is_terminal()).count(),
            (CACHE_LIMIT + 5) / 2
        );
    }
}
