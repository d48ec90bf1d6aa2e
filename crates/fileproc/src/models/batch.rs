use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::job::{JobPriority, JobStatus, Metadata};

/// Aggregated per-file counts for a batch. The four counts always sum to
/// `total_files`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct BatchProgress {
    pub total_files: usize,
    pub completed_files: usize,
    pub failed_files: usize,
    pub running_files: usize,
    pub pending_files: usize,
    pub percentage: f64,
}

impl BatchProgress {
    pub fn new(total_files: usize) -> Self {
        Self {
            total_files,
            pending_files: total_files,
            ..Self::default()
        }
    }

    /// Builds progress from observed counts; whatever is neither finished
    /// nor running counts as pending.
    pub fn from_counts(total: usize, completed: usize, failed: usize, running: usize) -> Self {
        let completed = completed.min(total);
        let failed = failed.min(total - completed);
        let running = running.min(total - completed - failed);
        let pending = total - completed - failed - running;
        let percentage = if total == 0 {
            0.0
        } else {
            completed as f64 / total as f64 * 100.0
        };
        Self {
            total_files: total,
            completed_files: completed,
            failed_files: failed,
            running_files: running,
            pending_files: pending,
            percentage,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct BatchJobResult {
    pub batch_id: String,
    pub total_files: usize,
    /// File ids whose job completed.
    pub successful_jobs: Vec<String>,
    /// File ids whose job failed or was cancelled.
    pub failed_jobs: Vec<String>,
    pub success: bool,
    pub processing_time_seconds: f64,
    /// Failure count keyed by the error text before the first ':'.
    #[serde(default)]
    pub error_summary: BTreeMap<String, usize>,
}

fn default_chunk_size() -> usize {
    50
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BatchRequest {
    pub name: String,
    pub file_ids: Vec<String>,
    pub pipeline_id: String,
    #[serde(default)]
    pub priority: JobPriority,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default)]
    pub callback_url: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl BatchRequest {
    pub fn new(name: &str, pipeline_id: &str, file_ids: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            file_ids: file_ids.iter().map(|f| f.to_string()).collect(),
            pipeline_id: pipeline_id.to_string(),
            chunk_size: default_chunk_size(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchJob {
    pub batch_id: String,
    pub name: String,
    pub file_ids: Vec<String>,
    pub pipeline_id: String,
    pub priority: JobPriority,
    pub chunk_size: usize,
    pub status: JobStatus,
    pub progress: BatchProgress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<BatchJobResult>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    /// Job created for each entry of `file_ids`, by position. `None` until
    /// that entry's chunk is dispatched. A file listed twice gets two jobs.
    #[serde(default)]
    pub job_ids: Vec<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl BatchJob {
    pub fn from_request(request: BatchRequest) -> Self {
        let total = request.file_ids.len();
        Self {
            batch_id: uuid::Uuid::new_v4().to_string(),
            name: request.name,
            file_ids: request.file_ids,
            pipeline_id: request.pipeline_id,
            priority: request.priority,
            chunk_size: request.chunk_size,
            status: JobStatus::Pending,
            progress: BatchProgress::new(total),
            result: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            callback_url: request.callback_url,
            metadata: request.metadata,
            job_ids: vec![None; total],
            error_message: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn job_id_at(&self, index: usize) -> Option<&str> {
        self.job_ids.get(index).and_then(|id| id.as_deref())
    }

    /// Records the job for the file at `index`. The first job recorded for a
    /// position wins.
    pub fn record_job(&mut self, index: usize, job_id: &str) {
        if self.job_ids.len() < self.file_ids.len() {
            self.job_ids.resize(self.file_ids.len(), None);
        }
        if let Some(slot) = self.job_ids.get_mut(index) {
            if slot.is_none() {
                *slot = Some(job_id.to_string());
            }
        }
    }

    /// `(position, job_id)` for every dispatched file.
    pub fn dispatched(&self) -> impl Iterator<Item = (usize, &str)> + '_ {
        self.job_ids
            .iter()
            .enumerate()
            .filter_map(|(i, id)| id.as_deref().map(|id| (i, id)))
    }

    /// Same lifecycle rules as a job.
    pub fn transition(&mut self, next: JobStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        match next {
            JobStatus::Running => self.started_at = Some(Utc::now()),
            s if s.is_terminal() => self.completed_at = Some(Utc::now()),
            _ => {}
        }
        true
    }
}

/// Outcome of one file within a batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchFileResult {
    pub file_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub output_files: Vec<String>,
    pub processing_time_seconds: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchMetrics {
    pub batch_id: String,
    pub status: JobStatus,
    pub total_files: usize,
    pub completed_files: usize,
    pub failed_files: usize,
    pub success_rate: f64,
    pub elapsed_seconds: f64,
    pub throughput_files_per_second: f64,
}
