use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info_span, warn, Instrument};

use crate::error::{ErrorKind, JobError};
use crate::executor::ExecutorRegistry;
use crate::models::{Metadata, Pipeline};
use crate::sanitize;

use super::progress::{ProgressEvent, ProgressReporter};

/// Aggregated output of a fully successful pipeline run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineOutput {
    pub output_files: Vec<PathBuf>,
    pub metadata: Metadata,
}

/// Runs a pipeline's steps in list order against one input file.
pub struct PipelineRunner {
    executors: ExecutorRegistry,
    work_root: PathBuf,
}

impl PipelineRunner {
    pub fn new(executors: ExecutorRegistry, work_root: impl Into<PathBuf>) -> Self {
        Self {
            executors,
            work_root: work_root.into(),
        }
    }

    /// Per-job scratch directory.
    pub fn work_dir(&self, job_id: &str) -> PathBuf {
        self.work_root.join(format!("job_{}", job_id))
    }

    /// Run every step of `pipeline`, feeding each step's first output into
    /// the next step. The first failing step aborts the run; nothing from a
    /// partial run is reported as output.
    pub async fn run(
        &self,
        job_id: &str,
        pipeline: &Pipeline,
        input: &Path,
        progress: &dyn ProgressReporter,
    ) -> Result<PipelineOutput, JobError> {
        if !pipeline.accepts(input) {
            let ext = input
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| format!(".{}", e.to_ascii_lowercase()))
                .unwrap_or_default();
            return Err(JobError::validation(format!(
                "File format {} not supported by pipeline {}",
                if ext.is_empty() { "(none)" } else { ext.as_str() },
                pipeline.pipeline_id
            )));
        }

        let work_dir = self.work_dir(job_id);
        tokio::fs::create_dir_all(&work_dir).await.map_err(|e| {
            JobError::new(
                ErrorKind::TemporaryFailure,
                format!(
                    "Failed to create work directory {}: {}",
                    sanitize::redact_path(&work_dir),
                    e
                ),
            )
        })?;

        let total = pipeline.steps.len();
        let mut current_input = input.to_path_buf();
        let mut output = PipelineOutput::default();

        for (index, step) in pipeline.steps.iter().enumerate() {
            progress.report(ProgressEvent::StepStarted {
                index,
                total,
                name: step.name.clone(),
            });

            let executor = self.executors.executor_for(step.processing_type);
            let span = info_span!("step",
                job_id = %job_id,
                step = %step.step_id,
                processing_type = %step.processing_type,
            );
            let limit = Duration::from_secs(step.timeout_seconds);
            let call = executor.execute(
                step.processing_type,
                &current_input,
                &step.parameters,
                &work_dir,
            );

            let result = match tokio::time::timeout(limit, call).instrument(span).await {
                Ok(result) => result,
                Err(_) => Err(JobError::timeout(format!(
                    "timed out after {}s",
                    step.timeout_seconds
                ))),
            };

            match result {
                Ok(step_output) => {
                    debug!(
                        job_id,
                        step = %step.step_id,
                        outputs = step_output.output_paths.len(),
                        "Step finished"
                    );
                    if let Some(first) = step_output.output_paths.first() {
                        current_input = first.clone();
                    }
                    output.output_files.extend(step_output.output_paths);
                    output.metadata.extend(step_output.metadata);
                    progress.report(ProgressEvent::StepCompleted {
                        completed: index + 1,
                        total,
                        name: step.name.clone(),
                    });
                }
                Err(err) => {
                    warn!(job_id, step = %step.step_id, error = %err, "Step failed");
                    progress.report(ProgressEvent::Failed {
                        step: step.name.clone(),
                        error: err.message.clone(),
                    });
                    return Err(err);
                }
            }
        }

        Ok(output)
    }
}
