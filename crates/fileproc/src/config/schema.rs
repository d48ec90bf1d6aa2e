use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::allocator::Resources;
use crate::retry::RetryConfig;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub processing: ProcessingSettings,
    #[serde(default)]
    pub batch: BatchSettings,
    #[serde(default)]
    pub scaling: ScalingSettings,
    /// Capacity given to every logical worker registered with the allocator.
    #[serde(default)]
    pub worker_resources: Resources,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub dead_letter: DeadLetterSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub callbacks: CallbackSettings,
}

// ─── Processing ───

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingSettings {
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    #[serde(default = "default_job_timeout")]
    pub job_timeout_seconds: u64,
    /// Pause before a worker retries a pull when it cannot run a job.
    #[serde(default = "default_backoff_millis")]
    pub backoff_millis: u64,
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    #[serde(default = "default_files_dir")]
    pub files_dir: PathBuf,
}

fn default_max_concurrent_jobs() -> usize {
    10
}

fn default_job_timeout() -> u64 {
    3600
}

fn default_backoff_millis() -> u64 {
    100
}

fn default_work_dir() -> PathBuf {
    std::env::temp_dir().join("fileproc-work")
}

fn default_files_dir() -> PathBuf {
    PathBuf::from("files")
}

impl Default for ProcessingSettings {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            job_timeout_seconds: default_job_timeout(),
            backoff_millis: default_backoff_millis(),
            work_dir: default_work_dir(),
            files_dir: default_files_dir(),
        }
    }
}

// ─── Batch ───

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSettings {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_cleanup_after_hours")]
    pub cleanup_after_hours: u64,
}

fn default_chunk_size() -> usize {
    50
}

fn default_max_batch_size() -> usize {
    1000
}

fn default_cleanup_after_hours() -> u64 {
    24
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_batch_size: default_max_batch_size(),
            cleanup_after_hours: default_cleanup_after_hours(),
        }
    }
}

// ─── Scaling ───

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_min_workers")]
    pub min_workers: usize,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_scale_up_threshold")]
    pub scale_up_threshold: f64,
    #[serde(default = "default_scale_down_threshold")]
    pub scale_down_threshold: f64,
    #[serde(default = "default_cooldown")]
    pub cooldown_seconds: u64,
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_seconds: u64,
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_seconds: u64,
}

fn default_true() -> bool {
    true
}

fn default_min_workers() -> usize {
    2
}

fn default_max_workers() -> usize {
    20
}

fn default_scale_up_threshold() -> f64 {
    0.8
}

fn default_scale_down_threshold() -> f64 {
    0.2
}

fn default_cooldown() -> u64 {
    300
}

fn default_heartbeat_timeout() -> u64 {
    300
}

fn default_monitor_interval() -> u64 {
    30
}

impl Default for ScalingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            min_workers: default_min_workers(),
            max_workers: default_max_workers(),
            scale_up_threshold: default_scale_up_threshold(),
            scale_down_threshold: default_scale_down_threshold(),
            cooldown_seconds: default_cooldown(),
            heartbeat_timeout_seconds: default_heartbeat_timeout(),
            monitor_interval_seconds: default_monitor_interval(),
        }
    }
}

// ─── Dead letter ───

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterSettings {
    #[serde(default = "default_dlq_size")]
    pub max_queue_size: usize,
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
    #[serde(default = "default_auto_retry_interval")]
    pub auto_retry_interval_hours: u64,
    /// Delay before a RetryLater entry is re-submitted.
    #[serde(default = "default_retry_later_delay")]
    pub retry_later_delay_seconds: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
    #[serde(default)]
    pub notify_url: Option<String>,
}

fn default_dlq_size() -> usize {
    10_000
}

fn default_retention_days() -> u64 {
    30
}

fn default_auto_retry_interval() -> u64 {
    24
}

fn default_retry_later_delay() -> u64 {
    3600
}

fn default_sweep_interval() -> u64 {
    3600
}

impl Default for DeadLetterSettings {
    fn default() -> Self {
        Self {
            max_queue_size: default_dlq_size(),
            retention_days: default_retention_days(),
            auto_retry_interval_hours: default_auto_retry_interval(),
            retry_later_delay_seconds: default_retry_later_delay(),
            sweep_interval_seconds: default_sweep_interval(),
            notify_url: None,
        }
    }
}

// ─── Storage ───

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Memory,
    #[default]
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageSettings {
    #[serde(default)]
    pub backend: StorageBackend,
    /// SQLite file; defaults to `~/.fileproc/data/fileproc.db`.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

// ─── Logging ───

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

// ─── Callbacks ───

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackSettings {
    #[serde(default = "default_callback_timeout")]
    pub timeout_seconds: u64,
}

fn default_callback_timeout() -> u64 {
    30
}

impl Default for CallbackSettings {
    fn default() -> Self {
        Self {
            timeout_seconds: default_callback_timeout(),
        }
    }
}
