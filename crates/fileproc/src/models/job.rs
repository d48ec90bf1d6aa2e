use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::models::pipeline::Pipeline;

/// Opaque key/value bag attached to jobs and batches.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

// ─── Status ───

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Allowed lifecycle edges: Pending → Running → {Completed | Failed | Cancelled},
    /// plus Pending → {Failed | Cancelled} for jobs that never start.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        match (self, next) {
            (JobStatus::Pending, JobStatus::Running) => true,
            (JobStatus::Pending, JobStatus::Failed | JobStatus::Cancelled) => true,
            (JobStatus::Running, next) => next.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Priority ───

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

impl JobPriority {
    /// Base weight contributed to the allocator's priority score.
    pub fn weight(self) -> f64 {
        match self {
            JobPriority::Urgent => 1000.0,
            JobPriority::High => 100.0,
            JobPriority::Medium => 10.0,
            JobPriority::Low => 1.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobPriority::Low => "low",
            JobPriority::Medium => "medium",
            JobPriority::High => "high",
            JobPriority::Urgent => "urgent",
        }
    }
}

// ─── Progress & result ───

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct JobProgress {
    pub current_step: usize,
    pub total_steps: usize,
    pub percentage: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl JobProgress {
    pub fn new(total_steps: usize) -> Self {
        Self {
            total_steps,
            ..Self::default()
        }
    }

    /// Records that `completed` of `total_steps` steps have finished.
    pub fn advance(&mut self, completed: usize, step_name: &str) {
        self.current_step = completed;
        self.current_step_name = Some(step_name.to_string());
        self.percentage = if self.total_steps == 0 {
            100.0
        } else {
            completed as f64 / self.total_steps as f64 * 100.0
        };
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct JobResult {
    pub success: bool,
    #[serde(default)]
    pub output_files: Vec<String>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub processing_time_seconds: f64,
}

impl JobResult {
    pub fn failure(error: impl Into<String>, processing_time_seconds: f64) -> Self {
        Self {
            success: false,
            error_message: Some(error.into()),
            processing_time_seconds,
            ..Self::default()
        }
    }
}

// ─── Request ───

/// A client's request to process one file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct JobRequest {
    pub file_id: String,
    #[serde(default)]
    pub pipeline_id: Option<String>,
    #[serde(default)]
    pub custom_pipeline: Option<Pipeline>,
    #[serde(default)]
    pub priority: JobPriority,
    #[serde(default)]
    pub callback_url: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl JobRequest {
    pub fn new(file_id: &str, pipeline_id: &str) -> Self {
        Self {
            file_id: file_id.to_string(),
            pipeline_id: Some(pipeline_id.to_string()),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.file_id.trim().is_empty() {
            return Err(ValidationError::EmptyFileId);
        }
        match (&self.pipeline_id, &self.custom_pipeline) {
            (None, None) => Err(ValidationError::MissingPipeline),
            (Some(_), Some(_)) => Err(ValidationError::ConflictingPipeline),
            (None, Some(pipeline)) => pipeline.validate(),
            (Some(_), None) => Ok(()),
        }
    }
}

// ─── Job ───

fn default_attempt() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub job_id: String,
    pub file_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_pipeline: Option<Pipeline>,
    pub status: JobStatus,
    pub priority: JobPriority,
    #[serde(default)]
    pub progress: JobProgress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    /// 1-based attempt number within a retry lineage.
    #[serde(default = "default_attempt")]
    pub attempt: u32,
    /// Id of the first job in this job's retry lineage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_of: Option<String>,
    /// Id of the job that re-submitted this one after a failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retried_as: Option<String>,
}

impl Job {
    /// Builds a Pending job from an already validated request.
    pub fn from_request(request: JobRequest) -> Self {
        Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            file_id: request.file_id,
            pipeline_id: request.pipeline_id,
            custom_pipeline: request.custom_pipeline,
            status: JobStatus::Pending,
            priority: request.priority,
            progress: JobProgress::default(),
            result: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            worker_id: None,
            callback_url: request.callback_url,
            metadata: request.metadata,
            attempt: 1,
            retry_of: None,
            retried_as: None,
        }
    }

    /// Builds the next attempt of a failed job: fresh id, same work.
    pub fn next_attempt(&self) -> Self {
        let mut retry = Self::from_request(JobRequest {
            file_id: self.file_id.clone(),
            pipeline_id: self.pipeline_id.clone(),
            custom_pipeline: self.custom_pipeline.clone(),
            priority: self.priority,
            callback_url: self.callback_url.clone(),
            metadata: self.metadata.clone(),
        });
        retry.attempt = self.attempt + 1;
        retry.retry_of = Some(self.lineage_id().to_string());
        retry
    }

    /// Id shared by every attempt of the same logical job.
    pub fn lineage_id(&self) -> &str {
        self.retry_of.as_deref().unwrap_or(&self.job_id)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Pending → Running. Returns false if the job was not Pending.
    pub fn start(&mut self, worker_id: &str) -> bool {
        if !self.status.can_transition_to(JobStatus::Running) {
            return false;
        }
        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
        self.worker_id = Some(worker_id.to_string());
        true
    }

    /// Moves the job into a terminal state. Returns false (and changes
    /// nothing) if the transition is not allowed, e.g. the job is already
    /// terminal.
    pub fn finish(&mut self, status: JobStatus, result: Option<JobResult>) -> bool {
        if !status.is_terminal() || !self.status.can_transition_to(status) {
            return false;
        }
        self.status = status;
        self.completed_at = Some(Utc::now());
        if result.is_some() {
            self.result = result;
        }
        true
    }

    /// The `user_priority` metadata hint, if present and numeric.
    pub fn user_priority(&self) -> Option<f64> {
        self.metadata.get("user_priority").and_then(|v| v.as_f64())
    }

    pub fn error_message(&self) -> Option<&str> {
        self.result.as_ref().and_then(|r| r.error_message.as_deref())
    }

    /// Batch this job belongs to, if any.
    pub fn batch_id(&self) -> Option<&str> {
        self.metadata.get("batch_id").and_then(|v| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending_job() -> Job {
        Job::from_request(JobRequest::new("file-1", "image_resize"))
    }

    #[test]
    fn test_status_transitions() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Cancelled));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Completed));
        for terminal in [JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled] {
            for next in [
                JobStatus::Pending,
                JobStatus::Running,
                JobStatus::Completed,
                JobStatus::Failed,
                JobStatus::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_status_string_roundtrip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("bogus"), None);
    }

    #[test]
    fn test_priority_weights_order_urgent_first() {
        assert!(JobPriority::Urgent.weight() > JobPriority::High.weight());
        assert!(JobPriority::High.weight() > JobPriority::Medium.weight());
        assert!(JobPriority::Medium.weight() > JobPriority::Low.weight());
    }

    #[test]
    fn test_request_requires_exactly_one_pipeline() {
        let mut request = JobRequest::new("f", "image_resize");
        assert!(request.validate().is_ok());

        request.pipeline_id = None;
        assert_eq!(request.validate(), Err(ValidationError::MissingPipeline));

        request.pipeline_id = Some("image_resize".into());
        request.custom_pipeline = Some(Pipeline {
            pipeline_id: "p".into(),
            name: "p".into(),
            description: String::new(),
            steps: vec![],
            input_formats: vec![],
            output_formats: vec![],
        });
        assert_eq!(request.validate(), Err(ValidationError::ConflictingPipeline));
    }

    #[test]
    fn test_request_rejects_blank_file_id() {
        let request = JobRequest::new("  ", "image_resize");
        assert_eq!(request.validate(), Err(ValidationError::EmptyFileId));
    }

    #[test]
    fn test_start_only_from_pending() {
        let mut job = pending_job();
        assert!(job.start("worker-0"));
        assert_eq!(job.status, JobStatus::Running);
        assert!(job.started_at.is_some());
        assert!(!job.start("worker-1"));
        assert_eq!(job.worker_id.as_deref(), Some("worker-0"));
    }

    #[test]
    fn test_terminal_state_is_final() {
        let mut job = pending_job();
        job.start("w");
        assert!(job.finish(JobStatus::Completed, None));
        assert!(!job.finish(JobStatus::Failed, None));
        assert!(!job.finish(JobStatus::Cancelled, None));
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[test]
    fn test_pending_cannot_complete() {
        let mut job = pending_job();
        assert!(!job.finish(JobStatus::Completed, None));
        assert!(job.finish(JobStatus::Cancelled, None));
    }

    #[test]
    fn test_next_attempt_links_lineage() {
        let first = pending_job();
        let second = first.next_attempt();
        let third = second.next_attempt();
        assert_ne!(first.job_id, second.job_id);
        assert_eq!(second.attempt, 2);
        assert_eq!(third.attempt, 3);
        assert_eq!(third.lineage_id(), first.job_id);
        assert_eq!(third.status, JobStatus::Pending);
    }

    #[test]
    fn test_progress_percentage() {
        let mut progress = JobProgress::new(4);
        progress.advance(1, "resize");
        assert_eq!(progress.percentage, 25.0);
        progress.advance(4, "convert");
        assert_eq!(progress.percentage, 100.0);
    }

    #[test]
    fn test_user_priority_reads_numeric_metadata() {
        let mut job = pending_job();
        assert_eq!(job.user_priority(), None);
        job.metadata
            .insert("user_priority".into(), serde_json::json!(12));
        assert_eq!(job.user_priority(), Some(12.0));
    }
}
