//! Dead letter queue for jobs that cannot proceed automatically.
//!
//! Entries are keyed by job id and mirrored to the store under
//! [`RecordKind::DeadLetter`]. The in-memory map is authoritative while the
//! process runs; [`DeadLetterQueue::load`] rebuilds it on start.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::callback::{deliver, CallbackDispatcher};
use crate::config::DeadLetterSettings;
use crate::error::{ErrorKind, FileprocError, JobError, Result};
use crate::models::{Job, JobPriority, Metadata};
use crate::retry::RetryAttempt;
use crate::store::{self, RecordFilter, RecordKind, Store, StoreError};
use crate::time;

/// Retry count at which an entry is always classified as exhausted.
const MAX_RETRIES_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    MaxRetriesExceeded,
    PermanentFailure,
    Timeout,
    InvalidInput,
    ResourceExhausted,
    ConfigurationError,
    Unknown,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::MaxRetriesExceeded => "max_retries_exceeded",
            FailureReason::PermanentFailure => "permanent_failure",
            FailureReason::Timeout => "timeout",
            FailureReason::InvalidInput => "invalid_input",
            FailureReason::ResourceExhausted => "resource_exhausted",
            FailureReason::ConfigurationError => "configuration_error",
            FailureReason::Unknown => "unknown",
        }
    }

    pub fn recommended_action(self) -> RecommendedAction {
        match self {
            FailureReason::MaxRetriesExceeded
            | FailureReason::InvalidInput
            | FailureReason::ConfigurationError
            | FailureReason::Unknown => RecommendedAction::ManualReview,
            FailureReason::Timeout | FailureReason::ResourceExhausted => {
                RecommendedAction::RetryLater
            }
            FailureReason::PermanentFailure => RecommendedAction::Archive,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    RetryLater,
    ManualReview,
    Archive,
    Delete,
    Notify,
}

impl RecommendedAction {
    pub fn as_str(self) -> &'static str {
        match self {
            RecommendedAction::RetryLater => "retry_later",
            RecommendedAction::ManualReview => "manual_review",
            RecommendedAction::Archive => "archive",
            RecommendedAction::Delete => "delete",
            RecommendedAction::Notify => "notify",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorDetails {
    pub error_type: String,
    pub kind: ErrorKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeadLetterEntry {
    pub job_id: String,
    pub file_id: String,
    pub original_job: Job,
    pub failure_reason: FailureReason,
    pub error_message: String,
    pub error_details: ErrorDetails,
    pub retry_count: u32,
    pub first_failed_at: DateTime<Utc>,
    pub last_failed_at: DateTime<Utc>,
    #[serde(default)]
    pub processing_attempts: Vec<RetryAttempt>,
    #[serde(default)]
    pub metadata: Metadata,
    pub recommended_action: RecommendedAction,
    /// Triage priority; higher is more urgent.
    pub priority: i64,
}

/// An entry disposed of with [`RecommendedAction::Archive`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArchivedDeadLetter {
    #[serde(flatten)]
    pub entry: DeadLetterEntry,
    pub archived_at: DateTime<Utc>,
}

/// A job handed back to the job manager for another run.
#[derive(Debug, Clone)]
pub struct Resubmission {
    pub previous_job_id: String,
    pub job: Job,
}

/// Optional inputs for [`DeadLetterQueue::process_entry`].
#[derive(Debug, Clone, Default)]
pub struct ActionParams {
    /// Delay before a RetryLater re-submission.
    pub delay: Option<Duration>,
    /// Overrides the configured notify URL.
    pub notify_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DeadLetterStatistics {
    pub total_entries: u64,
    pub current_entries: usize,
    pub entries_by_reason: BTreeMap<String, u64>,
    pub entries_by_action: BTreeMap<String, u64>,
    pub processed_entries: u64,
    pub failed_processing: u64,
    pub oldest_failure: Option<DateTime<Utc>>,
    pub newest_failure: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Default)]
pub struct AgeDistribution {
    pub less_than_1_hour: usize,
    pub less_than_24_hours: usize,
    pub less_than_7_days: usize,
    pub older_than_7_days: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct QueueHealth {
    pub total_entries: usize,
    pub max_queue_size: usize,
    pub queue_utilization: f64,
    pub age_distribution: AgeDistribution,
    /// Entries waiting on a human (manual review or notify).
    pub needs_attention: usize,
    pub retention_days: u64,
}

// ─── Classification ───

/// Disposal reason for a failure. A retry count at the threshold wins over
/// any message pattern.
pub fn classify_reason(error: &JobError, retry_count: u32) -> FailureReason {
    if retry_count >= MAX_RETRIES_THRESHOLD {
        return FailureReason::MaxRetriesExceeded;
    }

    let message = error.message.to_lowercase();
    let has = |patterns: &[&str]| patterns.iter().any(|p| message.contains(p));

    if has(&["invalid", "not found"]) {
        FailureReason::InvalidInput
    } else if has(&["timeout", "deadline"]) {
        FailureReason::Timeout
    } else if has(&["resource", "memory", "disk"]) {
        FailureReason::ResourceExhausted
    } else if has(&["config", "setting"]) {
        FailureReason::ConfigurationError
    } else if has(&["permanent", "fatal"]) {
        FailureReason::PermanentFailure
    } else {
        FailureReason::Unknown
    }
}

/// Triage priority: recency + reason bonus + retries (up to 5) + urgency.
pub fn triage_priority(
    job: &Job,
    reason: FailureReason,
    retry_count: u32,
    now: DateTime<Utc>,
) -> i64 {
    let mut priority = 0;

    let age_hours = (now - job.created_at).num_seconds() as f64 / 3600.0;
    if age_hours < 1.0 {
        priority += 10;
    } else if age_hours < 24.0 {
        priority += 5;
    }

    priority += match reason {
        FailureReason::ResourceExhausted => 8,
        FailureReason::ConfigurationError => 6,
        _ => 0,
    };

    priority += i64::from(retry_count.min(5));

    if job.priority == JobPriority::Urgent {
        priority += 10;
    }
    priority
}

// ─── Queue ───

#[derive(Default)]
struct Counters {
    total_entries: u64,
    entries_by_reason: BTreeMap<String, u64>,
    entries_by_action: BTreeMap<String, u64>,
    processed_entries: u64,
    failed_processing: u64,
}

#[derive(Default)]
struct DlqState {
    entries: HashMap<String, DeadLetterEntry>,
    counters: Counters,
}

pub struct DeadLetterQueue {
    settings: DeadLetterSettings,
    store: Arc<dyn Store>,
    callbacks: Arc<dyn CallbackDispatcher>,
    resubmit: Option<mpsc::UnboundedSender<Resubmission>>,
    shutdown: CancellationToken,
    state: Mutex<DlqState>,
}

impl DeadLetterQueue {
    pub fn new(
        settings: DeadLetterSettings,
        store: Arc<dyn Store>,
        callbacks: Arc<dyn CallbackDispatcher>,
    ) -> Self {
        info!(
            max_queue_size = settings.max_queue_size,
            retention_days = settings.retention_days,
            "Dead letter queue initialized"
        );
        Self {
            settings,
            store,
            callbacks,
            resubmit: None,
            shutdown: CancellationToken::new(),
            state: Mutex::new(DlqState::default()),
        }
    }

    /// Channel that receives RetryLater re-submissions.
    pub fn with_resubmit(mut self, sender: mpsc::UnboundedSender<Resubmission>) -> Self {
        self.resubmit = Some(sender);
        self
    }

    /// Token that aborts pending delayed re-submissions.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn settings(&self) -> &DeadLetterSettings {
        &self.settings
    }

    fn lock(&self) -> MutexGuard<'_, DlqState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            warn!("Dead letter lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Rebuilds the in-memory index from the store. Returns the number of
    /// entries loaded.
    pub async fn load(&self) -> std::result::Result<usize, StoreError> {
        let entries: Vec<DeadLetterEntry> = store::query_as(
            self.store.as_ref(),
            RecordKind::DeadLetter,
            &RecordFilter::default(),
            self.settings.max_queue_size,
            0,
        )
        .await?;
        let count = entries.len();
        let mut state = self.lock();
        for entry in entries {
            state.entries.insert(entry.job_id.clone(), entry);
        }
        info!(count, "Loaded dead letter entries");
        Ok(count)
    }

    /// Records a job that cannot proceed. Returns the entry id (the job id).
    pub async fn add_job(
        &self,
        job: &Job,
        error: &JobError,
        retry_count: u32,
        attempts: Vec<RetryAttempt>,
    ) -> std::result::Result<String, StoreError> {
        let now = Utc::now();
        let failure_reason = classify_reason(error, retry_count);
        let recommended_action = failure_reason.recommended_action();

        let first_failed_at = attempts
            .first()
            .map(|a| a.timestamp)
            .unwrap_or_else(|| job.started_at.unwrap_or(job.created_at));

        let entry = DeadLetterEntry {
            job_id: job.job_id.clone(),
            file_id: job.file_id.clone(),
            original_job: job.clone(),
            failure_reason,
            error_message: error.message.clone(),
            error_details: ErrorDetails {
                error_type: error.kind.name().to_string(),
                kind: error.kind,
            },
            retry_count,
            first_failed_at,
            last_failed_at: now,
            processing_attempts: attempts,
            metadata: job.metadata.clone(),
            recommended_action,
            priority: triage_priority(job, failure_reason, retry_count, now),
        };

        let evicted = {
            let mut state = self.lock();
            let evicted = if state.entries.contains_key(&entry.job_id) {
                Vec::new()
            } else {
                self.make_room(&mut state, now)
            };
            state.entries.insert(entry.job_id.clone(), entry.clone());
            let counters = &mut state.counters;
            counters.total_entries += 1;
            *counters
                .entries_by_reason
                .entry(failure_reason.as_str().to_string())
                .or_insert(0) += 1;
            *counters
                .entries_by_action
                .entry(recommended_action.as_str().to_string())
                .or_insert(0) += 1;
            evicted
        };

        for job_id in &evicted {
            self.store.delete(RecordKind::DeadLetter, job_id).await?;
        }
        store::save_as(self.store.as_ref(), RecordKind::DeadLetter, &entry.job_id, &entry).await?;

        warn!(
            job_id = %entry.job_id,
            reason = failure_reason.as_str(),
            action = recommended_action.as_str(),
            retry_count,
            "Added job to dead letter queue"
        );
        Ok(entry.job_id)
    }

    /// Frees a slot when at capacity: expired entries first, then the
    /// oldest by last failure. Returns the ids removed.
    fn make_room(&self, state: &mut DlqState, now: DateTime<Utc>) -> Vec<String> {
        let max = self.settings.max_queue_size.max(1);
        if state.entries.len() < max {
            return Vec::new();
        }

        let mut removed = self.expire(state, now);
        while state.entries.len() >= max {
            let Some(oldest) = state
                .entries
                .values()
                .min_by_key(|e| e.last_failed_at)
                .map(|e| e.job_id.clone())
            else {
                break;
            };
            state.entries.remove(&oldest);
            debug!(job_id = %oldest, "Evicted oldest dead letter entry");
            removed.push(oldest);
        }
        removed
    }

    fn expire(&self, state: &mut DlqState, now: DateTime<Utc>) -> Vec<String> {
        let cutoff = time::cutoff(now, time::days(self.settings.retention_days));
        let expired: Vec<String> = state
            .entries
            .values()
            .filter(|e| e.last_failed_at < cutoff)
            .map(|e| e.job_id.clone())
            .collect();
        for job_id in &expired {
            state.entries.remove(job_id);
        }
        expired
    }

    pub async fn get_entry(
        &self,
        job_id: &str,
    ) -> std::result::Result<Option<DeadLetterEntry>, StoreError> {
        if let Some(entry) = self.lock().entries.get(job_id).cloned() {
            return Ok(Some(entry));
        }
        let loaded: Option<DeadLetterEntry> =
            store::get_as(self.store.as_ref(), RecordKind::DeadLetter, job_id).await?;
        if let Some(entry) = &loaded {
            self.lock()
                .entries
                .insert(entry.job_id.clone(), entry.clone());
        }
        Ok(loaded)
    }

    /// Entries sorted by (priority desc, last failure desc).
    pub fn list_entries(
        &self,
        reason: Option<FailureReason>,
        action: Option<RecommendedAction>,
        limit: usize,
        offset: usize,
    ) -> Vec<DeadLetterEntry> {
        let state = self.lock();
        let mut entries: Vec<DeadLetterEntry> = state
            .entries
            .values()
            .filter(|e| reason.map_or(true, |r| e.failure_reason == r))
            .filter(|e| action.map_or(true, |a| e.recommended_action == a))
            .cloned()
            .collect();
        drop(state);

        entries.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| b.last_failed_at.cmp(&a.last_failed_at))
        });
        entries.into_iter().skip(offset).take(limit).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Applies `action` (or the entry's recommended action). On success the
    /// entry leaves the queue; otherwise it stays and the failure counter
    /// increments.
    pub async fn process_entry(
        &self,
        job_id: &str,
        action: Option<RecommendedAction>,
        params: ActionParams,
    ) -> Result<bool> {
        let entry = self
            .get_entry(job_id)
            .await?
            .ok_or_else(|| FileprocError::DeadLetterNotFound(job_id.to_string()))?;
        let action = action.unwrap_or(entry.recommended_action);

        let handled = match action {
            RecommendedAction::RetryLater => self.handle_retry_later(&entry, &params),
            RecommendedAction::ManualReview => {
                info!(
                    job_id,
                    error = %entry.error_message,
                    "Dead letter entry flagged for manual review"
                );
                true
            }
            RecommendedAction::Archive => self.handle_archive(&entry).await,
            RecommendedAction::Delete => {
                info!(job_id, "Deleting dead letter entry");
                true
            }
            RecommendedAction::Notify => self.handle_notify(&entry, &params).await,
        };

        if handled {
            self.remove_entry(job_id).await?;
            self.lock().counters.processed_entries += 1;
            info!(job_id, action = action.as_str(), "Processed dead letter entry");
        } else {
            self.lock().counters.failed_processing += 1;
            error!(job_id, action = action.as_str(), "Failed to process dead letter entry");
        }
        Ok(handled)
    }

    fn handle_retry_later(&self, entry: &DeadLetterEntry, params: &ActionParams) -> bool {
        let Some(sender) = self.resubmit.clone() else {
            warn!(job_id = %entry.job_id, "No re-submission channel configured");
            return false;
        };
        if sender.is_closed() {
            warn!(job_id = %entry.job_id, "Re-submission channel is closed");
            return false;
        }

        let delay = params
            .delay
            .unwrap_or(Duration::from_secs(self.settings.retry_later_delay_seconds));
        let resubmission = Resubmission {
            previous_job_id: entry.job_id.clone(),
            job: entry.original_job.next_attempt(),
        };
        let token = self.shutdown.clone();
        let job_id = entry.job_id.clone();

        info!(job_id = %job_id, delay_seconds = delay.as_secs_f64(), "Scheduling dead letter retry");
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(job_id = %job_id, "Dead letter retry abandoned on shutdown");
                }
                _ = tokio::time::sleep(delay) => {
                    if sender.send(resubmission).is_err() {
                        warn!(job_id = %job_id, "Job manager stopped before dead letter retry");
                    }
                }
            }
        });
        true
    }

    async fn handle_archive(&self, entry: &DeadLetterEntry) -> bool {
        let archived = ArchivedDeadLetter {
            entry: entry.clone(),
            archived_at: Utc::now(),
        };
        match store::save_as(
            self.store.as_ref(),
            RecordKind::ArchivedDeadLetter,
            &entry.job_id,
            &archived,
        )
        .await
        {
            Ok(()) => {
                info!(job_id = %entry.job_id, "Archived dead letter entry");
                true
            }
            Err(e) => {
                error!(job_id = %entry.job_id, error = %e, "Failed to archive dead letter entry");
                false
            }
        }
    }

    async fn handle_notify(&self, entry: &DeadLetterEntry, params: &ActionParams) -> bool {
        let Some(url) = params
            .notify_url
            .as_deref()
            .or(self.settings.notify_url.as_deref())
        else {
            warn!(job_id = %entry.job_id, "No notify URL configured");
            return false;
        };
        let payload = json!({
            "job_id": entry.job_id,
            "file_id": entry.file_id,
            "failure_reason": entry.failure_reason,
            "error_message": entry.error_message,
            "retry_count": entry.retry_count,
            "failed_at": entry.last_failed_at,
        });
        deliver(self.callbacks.as_ref(), url, &payload).await
    }

    pub async fn remove_entry(&self, job_id: &str) -> std::result::Result<bool, StoreError> {
        let in_memory = self.lock().entries.remove(job_id).is_some();
        let in_store = self.store.delete(RecordKind::DeadLetter, job_id).await?;
        Ok(in_memory || in_store)
    }

    /// Drops entries older than the retention window. Returns how many.
    pub async fn purge_expired(&self) -> std::result::Result<usize, StoreError> {
        let expired = {
            let mut state = self.lock();
            self.expire(&mut state, Utc::now())
        };
        for job_id in &expired {
            self.store.delete(RecordKind::DeadLetter, job_id).await?;
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "Purged expired dead letter entries");
        }
        Ok(expired.len())
    }

    /// Re-submits RetryLater entries that have waited at least the
    /// auto-retry interval. Returns how many were scheduled.
    pub async fn retry_due_entries(&self) -> Result<usize> {
        let cutoff = time::cutoff(
            Utc::now(),
            time::hours(self.settings.auto_retry_interval_hours),
        );
        let due: Vec<String> = self
            .lock()
            .entries
            .values()
            .filter(|e| e.recommended_action == RecommendedAction::RetryLater)
            .filter(|e| e.last_failed_at <= cutoff)
            .map(|e| e.job_id.clone())
            .collect();

        let mut scheduled = 0;
        for job_id in due {
            let params = ActionParams {
                delay: Some(Duration::ZERO),
                ..ActionParams::default()
            };
            if self.process_entry(&job_id, None, params).await? {
                scheduled += 1;
            }
        }
        Ok(scheduled)
    }

    /// Periodic retention sweep; also re-submits due RetryLater entries.
    pub async fn run_retention_sweep(self: Arc<Self>, token: CancellationToken, interval: Duration) {
        info!(interval_seconds = interval.as_secs(), "Dead letter sweep started");
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            if let Err(e) = self.purge_expired().await {
                error!(error = %e, "Dead letter retention sweep failed");
            }
            if self.resubmit.is_some() {
                if let Err(e) = self.retry_due_entries().await {
                    error!(error = %e, "Dead letter auto-retry failed");
                }
            }
        }
        info!("Dead letter sweep stopped");
    }

    // ─── Telemetry ───

    pub fn statistics(&self) -> DeadLetterStatistics {
        let state = self.lock();
        let c = &state.counters;
        DeadLetterStatistics {
            total_entries: c.total_entries,
            current_entries: state.entries.len(),
            entries_by_reason: c.entries_by_reason.clone(),
            entries_by_action: c.entries_by_action.clone(),
            processed_entries: c.processed_entries,
            failed_processing: c.failed_processing,
            oldest_failure: state.entries.values().map(|e| e.last_failed_at).min(),
            newest_failure: state.entries.values().map(|e| e.last_failed_at).max(),
        }
    }

    pub fn queue_health(&self) -> QueueHealth {
        let state = self.lock();
        let now = Utc::now();
        let mut age_distribution = AgeDistribution::default();
        let mut needs_attention = 0;

        for entry in state.entries.values() {
            let age_hours = (now - entry.last_failed_at).num_seconds() as f64 / 3600.0;
            if age_hours < 1.0 {
                age_distribution.less_than_1_hour += 1;
            } else if age_hours < 24.0 {
                age_distribution.less_than_24_hours += 1;
            } else if age_hours < 168.0 {
                age_distribution.less_than_7_days += 1;
            } else {
                age_distribution.older_than_7_days += 1;
            }
            if matches!(
                entry.recommended_action,
                RecommendedAction::ManualReview | RecommendedAction::Notify
            ) {
                needs_attention += 1;
            }
        }

        let total_entries = state.entries.len();
        let max_queue_size = self.settings.max_queue_size;
        QueueHealth {
            total_entries,
            max_queue_size,
            queue_utilization: if max_queue_size == 0 {
                0.0
            } else {
                total_entries as f64 / max_queue_size as f64
            },
            age_distribution,
            needs_attention,
            retention_days: self.settings.retention_days,
        }
    }
}
