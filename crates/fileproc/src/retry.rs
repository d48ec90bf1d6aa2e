//! Retry policy: failure classification, backoff, and attempt history.
//!
//! History is keyed by a job's lineage id, so every re-submitted attempt of
//! the same logical job counts against one budget.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ErrorKind, JobError};
use crate::models::Job;

const HISTORY_LIMIT: usize = 10;
const MIN_DELAY_SECONDS: f64 = 0.1;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    #[default]
    Exponential,
    Linear,
    Fixed,
    Immediate,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    Transient,
    Permanent,
    RateLimit,
    Timeout,
    Unknown,
}

impl FailureType {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureType::Transient => "transient",
            FailureType::Permanent => "permanent",
            FailureType::RateLimit => "rate_limit",
            FailureType::Timeout => "timeout",
            FailureType::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub strategy: BackoffStrategy,
    #[serde(default = "default_base_delay")]
    pub base_delay_seconds: f64,
    #[serde(default = "default_max_delay")]
    pub max_delay_seconds: f64,
    #[serde(default = "default_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_true")]
    pub jitter: bool,
    /// Error type names (see `ErrorKind::name`) that may be retried.
    #[serde(default = "default_retry_on")]
    pub retry_on: Vec<String>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> f64 {
    1.0
}

fn default_max_delay() -> f64 {
    300.0
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

fn default_retry_on() -> Vec<String> {
    [
        ErrorKind::Connection,
        ErrorKind::Timeout,
        ErrorKind::TemporaryFailure,
        ErrorKind::ResourceExhausted,
        ErrorKind::RateLimit,
        ErrorKind::Processing,
    ]
    .iter()
    .map(|k| k.name().to_string())
    .collect()
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            strategy: BackoffStrategy::default(),
            base_delay_seconds: default_base_delay(),
            max_delay_seconds: default_max_delay(),
            backoff_multiplier: default_multiplier(),
            jitter: true,
            retry_on: default_retry_on(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryAttempt {
    pub attempt_number: u32,
    pub timestamp: DateTime<Utc>,
    pub delay_seconds: f64,
    pub error_message: String,
    pub error_type: String,
    pub failure_type: FailureType,
    pub will_retry: bool,
}

/// Outcome of [`RetryHandler::should_retry`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryDecision {
    pub retry: bool,
    pub delay_seconds: f64,
    pub failure_type: FailureType,
    /// Number of the attempt being scheduled (1-based), or attempts used so
    /// far when giving up.
    pub attempt: u32,
}

impl RetryDecision {
    fn give_up(failure_type: FailureType, attempts: u32) -> Self {
        Self {
            retry: false,
            delay_seconds: 0.0,
            failure_type,
            attempt: attempts,
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::try_from_secs_f64(self.delay_seconds.max(0.0)).unwrap_or(Duration::MAX)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RetryStatistics {
    pub total_retries: usize,
    pub jobs_with_retries: usize,
    pub average_retries_per_job: f64,
    /// Attempts per error type name.
    pub error_types: BTreeMap<String, usize>,
    /// Attempts per failure class.
    pub failure_types: BTreeMap<String, usize>,
    /// Up to 10 most frequent error messages (first 100 chars).
    pub most_common_errors: Vec<(String, usize)>,
}

// Checked in order; the first substring hit wins.
const FAILURE_PATTERNS: &[(&str, FailureType)] = &[
    ("connection", FailureType::Transient),
    ("timeout", FailureType::Timeout),
    ("network", FailureType::Transient),
    ("temporary", FailureType::Transient),
    ("resource", FailureType::Transient),
    ("memory", FailureType::Transient),
    ("disk", FailureType::Transient),
    ("invalid", FailureType::Permanent),
    ("not found", FailureType::Permanent),
    ("permission", FailureType::Permanent),
    ("authentication", FailureType::Permanent),
    ("format", FailureType::Permanent),
    ("corrupt", FailureType::Permanent),
    ("rate limit", FailureType::RateLimit),
    ("too many", FailureType::RateLimit),
    ("quota", FailureType::RateLimit),
    ("deadline", FailureType::Timeout),
];

/// Classifies a failure by message and type-name substrings, falling back
/// to the error kind.
pub fn classify_failure(error: &JobError) -> FailureType {
    let message = error.message.to_lowercase();
    let type_name = error.kind.name().to_lowercase();

    for (pattern, failure_type) in FAILURE_PATTERNS {
        if message.contains(pattern) || type_name.contains(pattern) {
            return *failure_type;
        }
    }

    match error.kind {
        ErrorKind::Connection | ErrorKind::TemporaryFailure | ErrorKind::ResourceExhausted => {
            FailureType::Transient
        }
        ErrorKind::Validation
        | ErrorKind::Configuration
        | ErrorKind::Permission
        | ErrorKind::NotFound
        | ErrorKind::Cancelled => FailureType::Permanent,
        ErrorKind::Timeout => FailureType::Timeout,
        ErrorKind::RateLimit => FailureType::RateLimit,
        ErrorKind::Processing => FailureType::Unknown,
    }
}

/// Delay before attempt number `attempt` (1-based), without jitter.
pub fn base_delay(attempt: u32, config: &RetryConfig, failure_type: FailureType) -> f64 {
    let attempt = attempt.max(1);
    let mut delay = match config.strategy {
        BackoffStrategy::Immediate => return 0.0,
        BackoffStrategy::Fixed => config.base_delay_seconds,
        BackoffStrategy::Linear => config.base_delay_seconds * attempt as f64,
        BackoffStrategy::Exponential => {
            let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
            config.base_delay_seconds * config.backoff_multiplier.powi(exponent)
        }
    };

    match failure_type {
        FailureType::RateLimit => delay *= 2.0,
        FailureType::Timeout => delay *= 1.5,
        _ => {}
    }

    delay.min(config.max_delay_seconds)
}

fn jittered(delay: f64, config: &RetryConfig) -> f64 {
    let mut delay = delay;
    if config.jitter {
        let amount = delay * 0.1;
        if amount > 0.0 {
            delay += rand::thread_rng().gen_range(-amount..=amount);
        }
    }
    delay.clamp(MIN_DELAY_SECONDS, config.max_delay_seconds.max(MIN_DELAY_SECONDS))
}

#[derive(Debug, Default)]
struct LineageHistory {
    /// Every attempt scheduled, including ones dropped from `recent`.
    scheduled: u32,
    recent: VecDeque<RetryAttempt>,
}

pub struct RetryHandler {
    default_config: RetryConfig,
    history: Mutex<HashMap<String, LineageHistory>>,
}

impl RetryHandler {
    pub fn new(default_config: RetryConfig) -> Self {
        info!(
            max_attempts = default_config.max_attempts,
            strategy = ?default_config.strategy,
            "Retry handler initialized"
        );
        Self {
            default_config,
            history: Mutex::new(HashMap::new()),
        }
    }

    pub fn default_config(&self) -> &RetryConfig {
        &self.default_config
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, LineageHistory>> {
        self.history.lock().unwrap_or_else(|poisoned| {
            warn!("Retry history lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Decides whether the job's lineage gets another attempt and, if so,
    /// after how long. A positive decision is recorded in the history.
    pub fn should_retry(
        &self,
        job: &Job,
        error: &JobError,
        config: Option<&RetryConfig>,
    ) -> RetryDecision {
        self.decide(job.lineage_id(), error, config)
    }

    fn decide(&self, key: &str, error: &JobError, config: Option<&RetryConfig>) -> RetryDecision {
        let config = config.unwrap_or(&self.default_config);
        let used = self.attempt_count(key);
        let failure_type = classify_failure(error);

        if used >= config.max_attempts {
            info!(
                job_id = key,
                max_attempts = config.max_attempts,
                "Retry budget exhausted"
            );
            return RetryDecision::give_up(failure_type, used);
        }

        if failure_type == FailureType::Permanent {
            info!(job_id = key, error = %error, "Permanent failure, not retrying");
            return RetryDecision::give_up(failure_type, used);
        }

        let type_name = error.kind.name();
        if !config.retry_on.iter().any(|t| t == type_name) {
            info!(job_id = key, error_type = type_name, "Error type is not retryable");
            return RetryDecision::give_up(failure_type, used);
        }

        let attempt = used + 1;
        let delay = jittered(base_delay(attempt, config, failure_type), config);
        self.record_attempt(key, attempt, delay, error, failure_type, config);

        info!(
            job_id = key,
            attempt,
            max_attempts = config.max_attempts,
            delay_seconds = delay,
            "Scheduling retry"
        );
        RetryDecision {
            retry: true,
            delay_seconds: delay,
            failure_type,
            attempt,
        }
    }

    fn record_attempt(
        &self,
        key: &str,
        attempt: u32,
        delay_seconds: f64,
        error: &JobError,
        failure_type: FailureType,
        config: &RetryConfig,
    ) {
        let mut history = self.lock();
        let lineage = history.entry(key.to_string()).or_default();
        lineage.scheduled = lineage.scheduled.max(attempt);
        let attempts = &mut lineage.recent;
        attempts.push_back(RetryAttempt {
            attempt_number: attempt,
            timestamp: Utc::now(),
            delay_seconds,
            error_message: error.message.clone(),
            error_type: error.kind.name().to_string(),
            failure_type,
            will_retry: attempt < config.max_attempts,
        });
        while attempts.len() > HISTORY_LIMIT {
            attempts.pop_front();
        }
    }

    /// Runs `operation` until it succeeds, the error is not retryable, or
    /// the attempt budget is spent, sleeping between attempts. History for
    /// `key` is cleared on success; the last error is returned on failure.
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        key: &str,
        mut operation: F,
        config: Option<&RetryConfig>,
    ) -> Result<T, JobError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, JobError>>,
    {
        let max_attempts = config.unwrap_or(&self.default_config).max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => {
                    self.clear_history(key);
                    debug!(job_id = key, attempt, "Operation succeeded");
                    return Ok(value);
                }
                Err(error) => {
                    let decision = self.decide(key, &error, config);
                    if !decision.retry || attempt >= max_attempts {
                        warn!(job_id = key, attempt, error = %error, "Giving up after failure");
                        return Err(error);
                    }
                    if decision.delay_seconds > 0.0 {
                        tokio::time::sleep(decision.delay()).await;
                    }
                }
            }
        }
    }

    /// Retries scheduled so far for a lineage.
    pub fn attempt_count(&self, key: &str) -> u32 {
        self.lock().get(key).map(|h| h.scheduled).unwrap_or(0)
    }

    /// The most recent (up to 10) scheduled retries of a lineage.
    pub fn retry_history(&self, key: &str) -> Vec<RetryAttempt> {
        self.lock()
            .get(key)
            .map(|h| h.recent.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn clear_history(&self, key: &str) {
        self.lock().remove(key);
    }

    pub fn statistics(&self) -> RetryStatistics {
        let history = self.lock();
        let total_retries: usize = history.values().map(|h| h.scheduled as usize).sum();
        let jobs_with_retries = history.len();

        let mut error_types = BTreeMap::new();
        let mut failure_types = BTreeMap::new();
        let mut messages: HashMap<String, usize> = HashMap::new();
        for attempt in history.values().flat_map(|h| h.recent.iter()) {
            *error_types.entry(attempt.error_type.clone()).or_insert(0) += 1;
            *failure_types
                .entry(attempt.failure_type.as_str().to_string())
                .or_insert(0) += 1;
            let message: String = attempt.error_message.chars().take(100).collect();
            *messages.entry(message).or_insert(0) += 1;
        }

        let mut most_common_errors: Vec<(String, usize)> = messages.into_iter().collect();
        most_common_errors.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        most_common_errors.truncate(10);

        RetryStatistics {
            total_retries,
            jobs_with_retries,
            average_retries_per_job: if jobs_with_retries == 0 {
                0.0
            } else {
                total_retries as f64 / jobs_with_retries as f64
            },
            error_types,
            failure_types,
            most_common_errors,
        }
    }
}
