//! Job lifecycle broadcaster for real-time status streaming.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::models::{Job, JobProgress, JobStatus};

/// What happened to the job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobEventKind {
    Queued,
    Started,
    Progress,
    Completed,
    Failed,
    Cancelled,
    /// A failed job was re-submitted; `retried_as` names the new attempt.
    Retrying,
}

impl JobEventKind {
    /// Event kind for a job that just reached `status`.
    pub fn for_status(status: JobStatus) -> Self {
        match status {
            JobStatus::Pending => JobEventKind::Queued,
            JobStatus::Running => JobEventKind::Started,
            JobStatus::Completed => JobEventKind::Completed,
            JobStatus::Failed => JobEventKind::Failed,
            JobStatus::Cancelled => JobEventKind::Cancelled,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEvent {
    pub job_id: String,
    pub file_id: String,
    pub kind: JobEventKind,
    pub status: JobStatus,
    pub progress: JobProgress,
    /// Human-readable description of the change.
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retried_as: Option<String>,
}

impl JobEvent {
    pub fn for_job(kind: JobEventKind, job: &Job, message: &str) -> Self {
        Self {
            job_id: job.job_id.clone(),
            file_id: job.file_id.clone(),
            kind,
            status: job.status,
            progress: job.progress.clone(),
            message: message.to_string(),
            timestamp: Utc::now(),
            error: job.error_message().map(str::to_string),
            batch_id: job.batch_id().map(str::to_string),
            retried_as: job.retried_as.clone(),
        }
    }

    /// Whether the job this event describes will not change again.
    pub fn is_final(&self) -> bool {
        self.status.is_terminal() && self.kind != JobEventKind::Progress
    }
}

/// Broadcasts job events to any number of subscribers.
#[derive(Clone)]
pub struct JobEventBroadcaster {
    sender: Arc<broadcast::Sender<JobEvent>>,
}

impl JobEventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn send(&self, event: JobEvent) {
        // No active receivers is fine
        let _ = self.sender.send(event);
    }

    /// Convenience for `send(JobEvent::for_job(..))`.
    pub fn publish(&self, kind: JobEventKind, job: &Job, message: &str) {
        self.send(JobEvent::for_job(kind, job, message));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for JobEventBroadcaster {
    fn default() -> Self {
        Self::new(1024)
    }
}
