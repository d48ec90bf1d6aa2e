use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum FileprocError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Callback error: {0}")]
    Callback(#[from] CallbackError),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Batch job not found: {0}")]
    BatchNotFound(String),

    #[error("Pipeline not found: {0}")]
    PipelineNotFound(String),

    #[error("Dead letter entry not found: {0}")]
    DeadLetterNotFound(String),

    #[error("Job manager is not accepting work")]
    ShutDown,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Schema validation failed: {errors}")]
    SchemaValidation { errors: String },
}

/// Request-shape errors. These fail fast and are never retried.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Either pipeline_id or custom_pipeline must be provided")]
    MissingPipeline,

    #[error("Only one of pipeline_id or custom_pipeline may be provided")]
    ConflictingPipeline,

    #[error("file_id must not be empty")]
    EmptyFileId,

    #[error("Invalid pipeline '{pipeline_id}': {reason}")]
    InvalidPipeline { pipeline_id: String, reason: String },

    #[error("Pipeline id '{0}' is reserved by a built-in pipeline")]
    ReservedPipelineId(String),

    #[error("Batch must contain between 1 and {max} files, got {size}")]
    BatchSize { size: usize, max: usize },

    #[error("Batch chunk size must be at least 1")]
    ChunkSize,
}

#[derive(Error, Debug)]
pub enum CallbackError {
    #[error("Failed to deliver callback: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid callback URL: {0}")]
    InvalidUrl(String),

    #[error("Callback endpoint returned status {0}")]
    Status(u16),
}

/// Category of a job failure. `name()` is the stable type name that retry
/// policies list in `retry_on`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connection,
    Timeout,
    TemporaryFailure,
    ResourceExhausted,
    RateLimit,
    Processing,
    Validation,
    Configuration,
    Permission,
    NotFound,
    Cancelled,
}

impl ErrorKind {
    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::Connection => "ConnectionError",
            ErrorKind::Timeout => "TimeoutError",
            ErrorKind::TemporaryFailure => "TemporaryFailure",
            ErrorKind::ResourceExhausted => "ResourceExhausted",
            ErrorKind::RateLimit => "RateLimitError",
            ErrorKind::Processing => "ProcessingError",
            ErrorKind::Validation => "ValidationError",
            ErrorKind::Configuration => "ConfigurationError",
            ErrorKind::Permission => "PermissionError",
            ErrorKind::NotFound => "NotFoundError",
            ErrorKind::Cancelled => "CancelledError",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A job-level failure as seen by the retry handler and the dead letter queue.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{message}")]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn processing(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Processing, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ResourceExhausted, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "Job was cancelled")
    }
}

pub type Result<T> = std::result::Result<T, FileprocError>;
