//! Data model shared by the scheduler, the job manager and the batch layer.

pub mod batch;
pub mod job;
pub mod pipeline;

pub use batch::{BatchFileResult, BatchJob, BatchJobResult, BatchMetrics, BatchProgress, BatchRequest};
pub use job::{Job, JobPriority, JobProgress, JobRequest, JobResult, JobStatus, Metadata};
pub use pipeline::{Pipeline, PipelineStep, ProcessingType};
