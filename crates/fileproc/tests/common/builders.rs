//! Builder patterns for creating test data programmatically.

#![allow(dead_code)]

use serde_json::Value;

use fileproc::config::Settings;
use fileproc::models::{
    BatchRequest, JobPriority, JobRequest, Metadata, Pipeline, PipelineStep, ProcessingType,
};

/// Builder for creating `JobRequest` instances.
pub struct JobRequestBuilder {
    request: JobRequest,
}

impl JobRequestBuilder {
    /// A request for `file_id` through the built-in `image_resize` pipeline.
    pub fn new(file_id: &str) -> Self {
        Self {
            request: JobRequest::new(file_id, "image_resize"),
        }
    }

    pub fn pipeline(mut self, pipeline_id: &str) -> Self {
        self.request.pipeline_id = Some(pipeline_id.to_string());
        self.request.custom_pipeline = None;
        self
    }

    /// Replaces the pipeline id with an inline pipeline.
    pub fn custom_pipeline(mut self, pipeline: Pipeline) -> Self {
        self.request.pipeline_id = None;
        self.request.custom_pipeline = Some(pipeline);
        self
    }

    pub fn priority(mut self, priority: JobPriority) -> Self {
        self.request.priority = priority;
        self
    }

    pub fn callback(mut self, url: &str) -> Self {
        self.request.callback_url = Some(url.to_string());
        self
    }

    pub fn metadata(mut self, key: &str, value: Value) -> Self {
        self.request.metadata.insert(key.to_string(), value);
        self
    }

    pub fn build(self) -> JobRequest {
        self.request
    }
}

/// Builder for creating `BatchRequest` instances.
pub struct BatchRequestBuilder {
    request: BatchRequest,
}

impl BatchRequestBuilder {
    pub fn new(name: &str, file_ids: &[&str]) -> Self {
        Self {
            request: BatchRequest::new(name, "image_resize", file_ids),
        }
    }

    pub fn pipeline(mut self, pipeline_id: &str) -> Self {
        self.request.pipeline_id = pipeline_id.to_string();
        self
    }

    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.request.chunk_size = chunk_size;
        self
    }

    pub fn callback(mut self, url: &str) -> Self {
        self.request.callback_url = Some(url.to_string());
        self
    }

    pub fn metadata(mut self, key: &str, value: Value) -> Self {
        self.request.metadata.insert(key.to_string(), value);
        self
    }

    pub fn build(self) -> BatchRequest {
        self.request
    }
}

/// Builder for creating custom `Pipeline` instances.
pub struct PipelineBuilder {
    pipeline: Pipeline,
}

impl PipelineBuilder {
    pub fn new(pipeline_id: &str) -> Self {
        Self {
            pipeline: Pipeline {
                pipeline_id: pipeline_id.to_string(),
                name: pipeline_id.replace('_', " "),
                description: String::new(),
                steps: Vec::new(),
                input_formats: Vec::new(),
                output_formats: Vec::new(),
            },
        }
    }

    /// Appends a step named after its id.
    pub fn step(mut self, step_id: &str, processing_type: ProcessingType) -> Self {
        self.pipeline
            .steps
            .push(PipelineStep::new(step_id, step_id, processing_type));
        self
    }

    /// Appends a step that depends on the previous one.
    pub fn then(mut self, step_id: &str, processing_type: ProcessingType) -> Self {
        let mut step = PipelineStep::new(step_id, step_id, processing_type);
        if let Some(previous) = self.pipeline.steps.last() {
            step = step.depends_on(&previous.step_id);
        }
        self.pipeline.steps.push(step);
        self
    }

    pub fn step_parameters(mut self, parameters: Metadata) -> Self {
        if let Some(step) = self.pipeline.steps.last_mut() {
            step.parameters = parameters;
        }
        self
    }

    pub fn step_timeout(mut self, seconds: u64) -> Self {
        if let Some(step) = self.pipeline.steps.last_mut() {
            step.timeout_seconds = seconds;
        }
        self
    }

    pub fn input_formats(mut self, formats: &[&str]) -> Self {
        self.pipeline.input_formats = formats.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn build(self) -> Pipeline {
        self.pipeline
    }
}

/// Builder for creating `Settings` tuned for fast tests: no jitter, tiny
/// retry delays, scaling off.
pub struct SettingsBuilder {
    settings: Settings,
}

impl SettingsBuilder {
    pub fn new() -> Self {
        let mut settings = Settings::default();
        settings.processing.max_concurrent_jobs = 4;
        settings.processing.backoff_millis = 5;
        settings.processing.job_timeout_seconds = 30;
        settings.scaling.enabled = false;
        settings.retry.base_delay_seconds = 0.01;
        settings.retry.max_delay_seconds = 0.05;
        settings.retry.jitter = false;
        Self { settings }
    }

    pub fn max_concurrent_jobs(mut self, n: usize) -> Self {
        self.settings.processing.max_concurrent_jobs = n;
        self
    }

    pub fn job_timeout(mut self, seconds: u64) -> Self {
        self.settings.processing.job_timeout_seconds = seconds;
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.settings.retry.max_attempts = n;
        self
    }

    pub fn heartbeat_timeout(mut self, seconds: u64) -> Self {
        self.settings.scaling.heartbeat_timeout_seconds = seconds;
        self
    }

    pub fn batch_limits(mut self, chunk_size: usize, max_batch_size: usize) -> Self {
        self.settings.batch.chunk_size = chunk_size;
        self.settings.batch.max_batch_size = max_batch_size;
        self
    }

    pub fn build(self) -> Settings {
        self.settings
    }
}

impl Default for SettingsBuilder {
    fn default() -> Self {
        Self::new()
    }
}
