//! Batch fan-out: one job per file, run in chunks of `chunk_size`.
//!
//! Every job in a chunk is submitted at once and the next chunk starts only
//! when all of them are terminal, so at most `chunk_size` jobs of a batch are
//! in flight. A file that fails does not fail the batch; the batch completes
//! with `success = false` in its result. Only a pipeline that cannot be found
//! fails the batch itself.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::callback;
use crate::config::BatchSettings;
use crate::error::{FileprocError, Result, ValidationError};
use crate::manager::JobManager;
use crate::models::{
    BatchFileResult, BatchJob, BatchJobResult, BatchMetrics, BatchProgress, BatchRequest, Job,
    JobRequest, JobStatus,
};
use crate::store::{self, RecordFilter, RecordKind};
use crate::time;

struct BatchEntry {
    batch: BatchJob,
    token: CancellationToken,
}

pub struct BatchProcessor {
    manager: Arc<JobManager>,
    settings: BatchSettings,
    batches: Mutex<HashMap<String, BatchEntry>>,
}

impl BatchProcessor {
    pub fn new(manager: Arc<JobManager>) -> Self {
        let settings = manager.settings().batch.clone();
        Self {
            manager,
            settings,
            batches: Mutex::new(HashMap::new()),
        }
    }

    fn batches(&self) -> MutexGuard<'_, HashMap<String, BatchEntry>> {
        self.batches.lock().unwrap_or_else(|poisoned| {
            warn!("Batch table lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    // ─── Creation ───

    /// Validates and persists a Pending batch. Nothing runs until
    /// [`run_batch`](Self::run_batch) is called.
    pub async fn create_batch_job(&self, mut request: BatchRequest) -> Result<BatchJob> {
        let max = self.settings.max_batch_size;
        let size = request.file_ids.len();
        if size == 0 || size > max {
            return Err(ValidationError::BatchSize { size, max }.into());
        }
        if request.chunk_size == 0 {
            return Err(ValidationError::ChunkSize.into());
        }
        request.chunk_size = request.chunk_size.min(max);

        let batch = BatchJob::from_request(request);
        self.persist(&batch).await?;
        self.batches().insert(
            batch.batch_id.clone(),
            BatchEntry {
                batch: batch.clone(),
                token: self.manager.shutdown_token().child_token(),
            },
        );
        info!(
            batch_id = %batch.batch_id,
            files = batch.file_ids.len(),
            chunk_size = batch.chunk_size,
            "Created batch job"
        );
        Ok(batch)
    }

    /// Creates a batch and runs it in the background.
    pub async fn submit_batch(self: &Arc<Self>, request: BatchRequest) -> Result<BatchJob> {
        let batch = self.create_batch_job(request).await?;
        let me = Arc::clone(self);
        let batch_id = batch.batch_id.clone();
        tokio::spawn(async move {
            if let Err(e) = me.run_batch(&batch_id).await {
                error!(batch_id = %batch_id, error = %e, "Batch did not finish");
            }
        });
        Ok(batch)
    }

    // ─── Queries ───

    pub async fn get_batch_job(&self, batch_id: &str) -> Result<BatchJob> {
        let cached = self.batches().get(batch_id).map(|e| e.batch.clone());
        if let Some(batch) = cached {
            return Ok(batch);
        }
        let stored: Option<BatchJob> =
            store::get_as(self.manager.store().as_ref(), RecordKind::BatchJob, batch_id).await?;
        stored.ok_or_else(|| FileprocError::BatchNotFound(batch_id.to_string()))
    }

    /// Newest first.
    pub async fn list_batch_jobs(&self, status: Option<JobStatus>) -> Result<Vec<BatchJob>> {
        let filter = status
            .map(|s| RecordFilter::status(s.as_str()))
            .unwrap_or_default();
        Ok(store::query_as(
            self.manager.store().as_ref(),
            RecordKind::BatchJob,
            &filter,
            usize::MAX,
            0,
        )
        .await?)
    }

    /// Per-file outcome, in the batch's file order. Files that have not been
    /// dispatched yet have no job id or status.
    pub async fn batch_file_results(&self, batch_id: &str) -> Result<Vec<BatchFileResult>> {
        let batch = self.get_batch_job(batch_id).await?;
        let mut results = Vec::with_capacity(batch.file_ids.len());
        for (index, file_id) in batch.file_ids.iter().enumerate() {
            let job = match batch.job_id_at(index) {
                Some(job_id) => self.manager.latest_attempt(job_id).await.ok(),
                None => None,
            };
            results.push(match job {
                Some(job) => BatchFileResult {
                    file_id: file_id.clone(),
                    job_id: Some(job.job_id.clone()),
                    status: Some(job.status),
                    error_message: job.error_message().map(str::to_string),
                    output_files: job
                        .result
                        .as_ref()
                        .map(|r| r.output_files.clone())
                        .unwrap_or_default(),
                    processing_time_seconds: job
                        .result
                        .as_ref()
                        .map(|r| r.processing_time_seconds)
                        .unwrap_or(0.0),
                },
                None => BatchFileResult {
                    file_id: file_id.clone(),
                    job_id: None,
                    status: None,
                    error_message: None,
                    output_files: Vec::new(),
                    processing_time_seconds: 0.0,
                },
            });
        }
        Ok(results)
    }

    pub async fn batch_metrics(&self, batch_id: &str) -> Result<BatchMetrics> {
        let batch = self.get_batch_job(batch_id).await?;
        let progress = &batch.progress;
        let finished = progress.completed_files + progress.failed_files;

        let elapsed_seconds = match batch.started_at {
            Some(started) => {
                let end = batch.completed_at.unwrap_or_else(Utc::now);
                (end - started).num_milliseconds().max(0) as f64 / 1000.0
            }
            None => 0.0,
        };

        Ok(BatchMetrics {
            batch_id: batch.batch_id.clone(),
            status: batch.status,
            total_files: progress.total_files,
            completed_files: progress.completed_files,
            failed_files: progress.failed_files,
            success_rate: if finished > 0 {
                progress.completed_files as f64 / finished as f64 * 100.0
            } else {
                0.0
            },
            elapsed_seconds,
            throughput_files_per_second: if elapsed_seconds > 0.0 {
                finished as f64 / elapsed_seconds
            } else {
                0.0
            },
        })
    }

    // ─── Execution ───

    /// Drives a Pending batch to a terminal state and returns it.
    pub async fn run_batch(&self, batch_id: &str) -> Result<BatchJob> {
        self.ensure_cached(batch_id).await?;
        let (started, token) = {
            let mut batches = self.batches();
            let entry = batches
                .get_mut(batch_id)
                .ok_or_else(|| FileprocError::BatchNotFound(batch_id.to_string()))?;
            (
                entry
                    .batch
                    .transition(JobStatus::Running)
                    .then(|| entry.batch.clone()),
                entry.token.clone(),
            )
        };
        let Some(batch) = started else {
            debug!(batch_id, "Batch is not pending, nothing to run");
            return self.get_batch_job(batch_id).await;
        };
        self.persist_logged(&batch).await;

        let span = info_span!("batch", batch_id = %batch_id, files = batch.file_ids.len());
        self.execute(&batch, &token).instrument(span).await
    }

    async fn execute(&self, batch: &BatchJob, token: &CancellationToken) -> Result<BatchJob> {
        if self.manager.pipelines().get(&batch.pipeline_id).is_none() {
            return self.fail_batch(&batch.batch_id, "Pipeline not found").await;
        }
        self.run_chunks(batch, token).await?;
        self.complete_batch(&batch.batch_id).await
    }

    async fn run_chunks(&self, batch: &BatchJob, token: &CancellationToken) -> Result<()> {
        let chunk_size = batch.chunk_size.max(1);
        let chunks = batch.file_ids.len().div_ceil(chunk_size);

        for (chunk_index, chunk) in batch.file_ids.chunks(chunk_size).enumerate() {
            if token.is_cancelled() {
                break;
            }
            info!(
                chunk = chunk_index + 1,
                chunks,
                files = chunk.len(),
                "Processing chunk"
            );

            let offset = chunk_index * chunk_size;
            let mut waiting = Vec::with_capacity(chunk.len());
            for (i, file_id) in chunk.iter().enumerate() {
                if token.is_cancelled() {
                    break;
                }
                let index = offset + i;
                let job = match self
                    .manager
                    .create_job(member_request(batch, file_id, index))
                    .await
                {
                    Ok(job) => job,
                    Err(e) => {
                        warn!(file_id = %file_id, error = %e, "Could not create job for file");
                        continue;
                    }
                };
                self.update_batch(&batch.batch_id, |b| {
                    b.record_job(index, &job.job_id);
                    true
                });
                // A cancel that ran before the job was recorded did not see it.
                if token.is_cancelled() {
                    if let Err(e) = self.manager.cancel_job(&job.job_id).await {
                        warn!(job_id = %job.job_id, error = %e, "Failed to cancel batch member");
                    }
                    break;
                }
                waiting.push(job.job_id);
            }
            if let Some(batch) = self.cached(&batch.batch_id) {
                self.persist_logged(&batch).await;
            }

            let barrier = futures_util::future::join_all(
                waiting.iter().map(|id| self.manager.wait_for_outcome(id)),
            );
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("Batch cancelled while waiting for chunk");
                    break;
                }
                outcomes = barrier => {
                    if outcomes.iter().any(|o| matches!(o, Err(FileprocError::ShutDown))) {
                        return Err(FileprocError::ShutDown);
                    }
                }
            }

            let progress = self.recount(batch).await;
            debug!(percentage = progress.percentage, "Batch progress");
        }
        Ok(())
    }

    /// Recomputes progress from the latest attempt of every dispatched file.
    async fn recount(&self, batch: &BatchJob) -> BatchProgress {
        let jobs = self.member_jobs(&batch.batch_id).await;
        let count = |status: JobStatus| jobs.values().filter(|j| j.status == status).count();
        let progress = BatchProgress::from_counts(
            batch.file_ids.len(),
            count(JobStatus::Completed),
            count(JobStatus::Failed) + count(JobStatus::Cancelled),
            count(JobStatus::Running),
        );
        let updated = self.update_batch(&batch.batch_id, |b| {
            if b.is_terminal() {
                return false;
            }
            b.progress = progress.clone();
            true
        });
        if let Some(batch) = updated {
            self.persist_logged(&batch).await;
        }
        progress
    }

    /// Latest attempt of every dispatched file, keyed by batch position.
    async fn member_jobs(&self, batch_id: &str) -> BTreeMap<usize, Job> {
        let Some(batch) = self.cached(batch_id) else {
            return BTreeMap::new();
        };
        let mut jobs = BTreeMap::new();
        for (index, job_id) in batch.dispatched() {
            match self.manager.latest_attempt(job_id).await {
                Ok(job) => {
                    jobs.insert(index, job);
                }
                Err(e) => warn!(job_id = %job_id, error = %e, "Batch member job is missing"),
            }
        }
        jobs
    }

    async fn complete_batch(&self, batch_id: &str) -> Result<BatchJob> {
        let Some(snapshot) = self.cached(batch_id) else {
            return Err(FileprocError::BatchNotFound(batch_id.to_string()));
        };
        let jobs = self.member_jobs(batch_id).await;

        let mut successful = Vec::new();
        let mut failed = Vec::new();
        for (index, file_id) in snapshot.file_ids.iter().enumerate() {
            match jobs.get(&index) {
                Some(job) if job.status == JobStatus::Completed => successful.push(file_id.clone()),
                _ => failed.push(file_id.clone()),
            }
        }
        let error_summary = summarize_errors(jobs.values());

        let updated = self.update_batch(batch_id, |b| {
            if !b.transition(JobStatus::Completed) {
                return false;
            }
            let elapsed = match (b.started_at, b.completed_at) {
                (Some(start), Some(end)) => (end - start).num_milliseconds().max(0) as f64 / 1000.0,
                _ => 0.0,
            };
            b.progress = BatchProgress::from_counts(
                b.file_ids.len(),
                successful.len(),
                failed.len(),
                0,
            );
            b.result = Some(BatchJobResult {
                batch_id: b.batch_id.clone(),
                total_files: b.file_ids.len(),
                success: failed.is_empty(),
                successful_jobs: successful.clone(),
                failed_jobs: failed.clone(),
                processing_time_seconds: elapsed,
                error_summary: error_summary.clone(),
            });
            true
        });

        match updated {
            Some(batch) => {
                self.persist_logged(&batch).await;
                info!(
                    successful = successful.len(),
                    failed = failed.len(),
                    "Completed batch job"
                );
                self.send_callback(&batch).await;
                Ok(batch)
            }
            // Cancelled while the last chunk was finishing.
            None => self.get_batch_job(batch_id).await,
        }
    }

    async fn fail_batch(&self, batch_id: &str, message: &str) -> Result<BatchJob> {
        let updated = self.update_batch(batch_id, |b| {
            if !b.transition(JobStatus::Failed) {
                return false;
            }
            b.error_message = Some(message.to_string());
            true
        });
        match updated {
            Some(batch) => {
                self.persist_logged(&batch).await;
                error!(error = message, "Failed batch job");
                self.send_callback(&batch).await;
                Ok(batch)
            }
            None => self.get_batch_job(batch_id).await,
        }
    }

    // ─── Cancellation & cleanup ───

    /// Cancels a batch and every constituent job that has not finished.
    /// Returns false if the batch was already terminal.
    pub async fn cancel_batch_job(&self, batch_id: &str) -> Result<bool> {
        self.ensure_cached(batch_id).await?;
        let cancelled = {
            let mut batches = self.batches();
            match batches.get_mut(batch_id) {
                Some(entry) => {
                    if entry.batch.transition(JobStatus::Cancelled) {
                        entry.token.cancel();
                        Some(entry.batch.clone())
                    } else {
                        None
                    }
                }
                None => None,
            }
        };
        let Some(batch) = cancelled else {
            return Ok(false);
        };

        let mut stopped = 0;
        for job in self.member_jobs(batch_id).await.values() {
            if job.is_terminal() {
                continue;
            }
            match self.manager.cancel_job(&job.job_id).await {
                Ok(true) => stopped += 1,
                Ok(false) => {}
                Err(e) => warn!(job_id = %job.job_id, error = %e, "Failed to cancel batch member"),
            }
        }

        self.persist_logged(&batch).await;
        info!(batch_id, stopped, "Cancelled batch job");
        self.send_callback(&batch).await;
        Ok(true)
    }

    /// Deletes terminal batches that finished more than `older_than_hours`
    /// ago. Returns how many were removed.
    pub async fn cleanup_completed_batches(&self, older_than_hours: u64) -> Result<usize> {
        let cutoff = time::cutoff(Utc::now(), time::hours(older_than_hours));
        let stored = self.list_batch_jobs(None).await?;

        let mut removed = 0;
        for batch in stored {
            let expired = batch.is_terminal() && batch.completed_at.is_some_and(|t| t < cutoff);
            if !expired {
                continue;
            }
            self.manager
                .store()
                .delete(RecordKind::BatchJob, &batch.batch_id)
                .await?;
            self.batches().remove(&batch.batch_id);
            removed += 1;
        }
        info!(removed, older_than_hours, "Cleaned up completed batch jobs");
        Ok(removed)
    }

    /// Cleanup with the configured `cleanup_after_hours`.
    pub async fn cleanup_expired_batches(&self) -> Result<usize> {
        self.cleanup_completed_batches(self.settings.cleanup_after_hours)
            .await
    }

    // ─── Helpers ───

    async fn ensure_cached(&self, batch_id: &str) -> Result<()> {
        if self.batches().contains_key(batch_id) {
            return Ok(());
        }
        let batch = self.get_batch_job(batch_id).await?;
        let token = self.manager.shutdown_token().child_token();
        self.batches()
            .entry(batch_id.to_string())
            .or_insert(BatchEntry { batch, token });
        Ok(())
    }

    fn cached(&self, batch_id: &str) -> Option<BatchJob> {
        self.batches().get(batch_id).map(|e| e.batch.clone())
    }

    fn update_batch(
        &self,
        batch_id: &str,
        change: impl FnOnce(&mut BatchJob) -> bool,
    ) -> Option<BatchJob> {
        let mut batches = self.batches();
        let entry = batches.get_mut(batch_id)?;
        change(&mut entry.batch).then(|| entry.batch.clone())
    }

    async fn persist(&self, batch: &BatchJob) -> Result<()> {
        store::save_as(
            self.manager.store().as_ref(),
            RecordKind::BatchJob,
            &batch.batch_id,
            batch,
        )
        .await?;
        Ok(())
    }

    async fn persist_logged(&self, batch: &BatchJob) {
        if let Err(e) = self.persist(batch).await {
            error!(batch_id = %batch.batch_id, error = %e, "Failed to persist batch job");
        }
    }

    async fn send_callback(&self, batch: &BatchJob) {
        if let Some(url) = &batch.callback_url {
            callback::deliver(
                self.manager.callbacks().as_ref(),
                url,
                &callback::batch_payload(batch),
            )
            .await;
        }
    }
}

/// Job request for the file at `index` of `batch`. Batch metadata is copied
/// into the job together with the batch linkage keys.
fn member_request(batch: &BatchJob, file_id: &str, index: usize) -> JobRequest {
    let mut metadata = batch.metadata.clone();
    metadata.insert("batch_id".to_string(), json!(batch.batch_id));
    metadata.insert("batch_index".to_string(), json!(index));
    JobRequest {
        file_id: file_id.to_string(),
        pipeline_id: Some(batch.pipeline_id.clone()),
        custom_pipeline: None,
        priority: batch.priority,
        callback_url: None,
        metadata,
    }
}

/// Failed jobs counted by the text before the first ':' of their error, or
/// "unknown" when the error has no ':'.
fn summarize_errors<'a>(jobs: impl Iterator<Item = &'a Job>) -> BTreeMap<String, usize> {
    let mut summary = BTreeMap::new();
    for job in jobs.filter(|j| j.status == JobStatus::Failed) {
        let Some(message) = job.error_message() else {
            continue;
        };
        let key = match message.split_once(':') {
            Some((head, _)) => head.to_string(),
            None => "unknown".to_string(),
        };
        *summary.entry(key).or_insert(0) += 1;
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use serde_json::Value;

    use crate::config::Settings;
    use crate::error::JobError;
    use crate::models::JobResult;
    use crate::scaler::FixedProbe;
    use crate::store::{MemoryStore, Store, StoreError};

    /// Cancels the armed token as the first job record is written, which
    /// lands a cancel between creating a batch member and recording it.
    #[derive(Default)]
    struct CancelOnFirstJob {
        inner: MemoryStore,
        armed: Mutex<Option<CancellationToken>>,
        fired: AtomicBool,
    }

    #[async_trait]
    impl Store for CancelOnFirstJob {
        async fn save(
            &self,
            kind: RecordKind,
            id: &str,
            record: &Value,
        ) -> std::result::Result<(), StoreError> {
            if kind == RecordKind::Job && !self.fired.swap(true, Ordering::SeqCst) {
                if let Some(token) = self.armed.lock().unwrap().as_ref() {
                    token.cancel();
                }
            }
            self.inner.save(kind, id, record).await
        }

        async fn get(
            &self,
            kind: RecordKind,
            id: &str,
        ) -> std::result::Result<Option<Value>, StoreError> {
            self.inner.get(kind, id).await
        }

        async fn query(
            &self,
            kind: RecordKind,
            filter: &RecordFilter,
            limit: usize,
            offset: usize,
        ) -> std::result::Result<Vec<Value>, StoreError> {
            self.inner.query(kind, filter, limit, offset).await
        }

        async fn delete(&self, kind: RecordKind, id: &str) -> std::result::Result<bool, StoreError> {
            self.inner.delete(kind, id).await
        }
    }

    fn failed(message: &str) -> Job {
        let mut job = Job::from_request(JobRequest::new("f", "image_resize"));
        job.finish(
            JobStatus::Failed,
            Some(JobResult::failure(message, 0.1)),
        );
        job
    }

    #[test]
    fn test_error_summary_groups_by_prefix() {
        let jobs = vec![
            failed("File not found: a.jpg"),
            failed("File not found: b.jpg"),
            failed(&JobError::processing("decoder crashed").message),
        ];
        let summary = summarize_errors(jobs.iter());
        assert_eq!(summary.get("File not found"), Some(&2));
        assert_eq!(summary.get("unknown"), Some(&1));
    }

    #[tokio::test]
    async fn test_cancel_during_dispatch_stops_the_chunk() {
        let store = Arc::new(CancelOnFirstJob::default());
        let manager = JobManager::builder(Settings::default(), store.clone())
            .with_probe(Box::new(FixedProbe::default()))
            .build();
        let processor = BatchProcessor::new(manager.clone());

        let batch = processor
            .create_batch_job(BatchRequest::new("racy", "image_resize", &["a.jpg", "b.jpg"]))
            .await
            .unwrap();
        let token = processor.batches().get(&batch.batch_id).unwrap().token.clone();
        *store.armed.lock().unwrap() = Some(token);

        let done = processor.run_batch(&batch.batch_id).await.unwrap();

        let first = done.job_id_at(0).expect("first member was recorded");
        assert_eq!(done.job_id_at(1), None);
        let job = manager.get_job(first).await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(!manager.allocator().is_queued(first));
        manager.shutdown().await;
    }

    #[test]
    fn test_member_request_carries_batch_linkage() {
        let mut request = BatchRequest::new("nightly", "image_resize", &["a.jpg", "b.jpg"]);
        request.metadata.insert("owner".into(), json!("ops"));
        let batch = BatchJob::from_request(request);

        let job = member_request(&batch, "b.jpg", 1);
        assert_eq!(job.pipeline_id.as_deref(), Some("image_resize"));
        assert_eq!(job.metadata["batch_id"], json!(batch.batch_id));
        assert_eq!(job.metadata["batch_index"], json!(1));
        assert_eq!(job.metadata["owner"], json!("ops"));
        job.validate().unwrap();
    }
}
