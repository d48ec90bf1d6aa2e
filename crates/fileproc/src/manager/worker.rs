//! Worker slot loop: pull the best queued job, claim resources, run it.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::allocator::AllocationError;
use crate::error::JobError;
use crate::models::JobStatus;

use super::JobManager;

/// Longest an idle worker sleeps before looking at the queue again.
const IDLE_WAIT: Duration = Duration::from_secs(1);

#[derive(Default)]
struct SlotCounters {
    completed: u64,
    failed: u64,
}

pub(super) async fn run_worker(
    manager: Arc<JobManager>,
    worker_id: String,
    token: CancellationToken,
) {
    debug!(worker_id = %worker_id, "Worker started");
    let backoff = Duration::from_millis(manager.settings().processing.backoff_millis.max(1));
    let mut counters = SlotCounters::default();

    loop {
        if token.is_cancelled() {
            break;
        }

        let Some(job_id) = manager.allocator().peek_next() else {
            manager.heartbeat(&worker_id, 0, counters.completed, counters.failed);
            tokio::select! {
                _ = token.cancelled() => break,
                _ = manager.allocator().wait_for_work(IDLE_WAIT) => {}
            }
            continue;
        };

        if !manager.try_reserve_slot() {
            // At the global cap; the job stays queued for whoever frees up first.
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
            continue;
        }

        match manager.allocator().allocate_resources(&job_id) {
            Ok(Some(allocation)) => {
                manager.heartbeat(&worker_id, 1, counters.completed, counters.failed);
                let status = manager.execute(&worker_id, allocation).await;
                manager.release_slot();
                match status {
                    Some(JobStatus::Completed) => counters.completed += 1,
                    Some(JobStatus::Failed) => counters.failed += 1,
                    _ => {}
                }
                manager.heartbeat(&worker_id, 0, counters.completed, counters.failed);
            }
            Ok(None) => {
                manager.release_slot();
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
            Err(AllocationError::NotQueued(_)) | Err(AllocationError::AlreadyAllocated(_)) => {
                // Another worker claimed it between peek and allocate.
                manager.release_slot();
                tokio::task::yield_now().await;
            }
            Err(err @ AllocationError::Unsatisfiable { .. }) => {
                manager.release_slot();
                warn!(worker_id = %worker_id, job_id = %job_id, error = %err, "Job can never be placed");
                manager
                    .fail_unplaceable(&job_id, JobError::resource_exhausted(err.to_string()))
                    .await;
            }
        }
    }

    debug!(worker_id = %worker_id, "Worker stopped");
}
