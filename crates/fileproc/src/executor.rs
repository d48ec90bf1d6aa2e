use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::JobError;
use crate::models::{Metadata, ProcessingType};

/// What one step produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutput {
    pub output_paths: Vec<PathBuf>,
    pub metadata: Metadata,
}

impl StepOutput {
    pub fn new(output_paths: Vec<PathBuf>) -> Self {
        Self {
            output_paths,
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}

/// Runs one processing operation against one input file.
///
/// Implementations must tolerate being re-invoked for the same input after a
/// failed attempt; nothing from a failed call is assumed to persist.
#[async_trait]
pub trait ProcessingExecutor: Send + Sync {
    async fn execute(
        &self,
        processing_type: ProcessingType,
        input: &Path,
        parameters: &Metadata,
        work_dir: &Path,
    ) -> Result<StepOutput, JobError>;
}

/// Group of processing types served by the same executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessingFamily {
    Image,
    Document,
    Video,
    Content,
    Custom,
}

impl ProcessingFamily {
    pub fn of(processing_type: ProcessingType) -> Self {
        match processing_type {
            ProcessingType::ImageResize | ProcessingType::ImageFormatConvert => {
                ProcessingFamily::Image
            }
            ProcessingType::DocumentTextExtract | ProcessingType::DocumentPdfGenerate => {
                ProcessingFamily::Document
            }
            ProcessingType::VideoThumbnail | ProcessingType::VideoCompress => {
                ProcessingFamily::Video
            }
            ProcessingType::ContentAnalysis => ProcessingFamily::Content,
            ProcessingType::Custom => ProcessingFamily::Custom,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProcessingFamily::Image => "image",
            ProcessingFamily::Document => "document",
            ProcessingFamily::Video => "video",
            ProcessingFamily::Content => "content",
            ProcessingFamily::Custom => "custom",
        }
    }
}

/// Stands in for a family nobody registered an executor for.
pub struct UnconfiguredExecutor;

#[async_trait]
impl ProcessingExecutor for UnconfiguredExecutor {
    async fn execute(
        &self,
        processing_type: ProcessingType,
        _input: &Path,
        _parameters: &Metadata,
        _work_dir: &Path,
    ) -> Result<StepOutput, JobError> {
        Err(JobError::configuration(format!(
            "No executor configured for {} processing ({})",
            ProcessingFamily::of(processing_type).as_str(),
            processing_type
        )))
    }
}

/// Routes each processing type to the executor registered for its family.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    image: Option<Arc<dyn ProcessingExecutor>>,
    document: Option<Arc<dyn ProcessingExecutor>>,
    video: Option<Arc<dyn ProcessingExecutor>>,
    content: Option<Arc<dyn ProcessingExecutor>>,
    custom: Option<Arc<dyn ProcessingExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// One executor for every family. Handy for tests and single-binary setups.
    pub fn uniform(executor: Arc<dyn ProcessingExecutor>) -> Self {
        let mut registry = Self::new();
        for family in [
            ProcessingFamily::Image,
            ProcessingFamily::Document,
            ProcessingFamily::Video,
            ProcessingFamily::Content,
            ProcessingFamily::Custom,
        ] {
            registry.register(family, executor.clone());
        }
        registry
    }

    pub fn register(&mut self, family: ProcessingFamily, executor: Arc<dyn ProcessingExecutor>) {
        *self.slot_mut(family) = Some(executor);
    }

    pub fn with_executor(
        mut self,
        family: ProcessingFamily,
        executor: Arc<dyn ProcessingExecutor>,
    ) -> Self {
        self.register(family, executor);
        self
    }

    pub fn is_configured(&self, family: ProcessingFamily) -> bool {
        self.slot(family).is_some()
    }

    pub fn executor_for(&self, processing_type: ProcessingType) -> Arc<dyn ProcessingExecutor> {
        self.slot(ProcessingFamily::of(processing_type))
            .clone()
            .unwrap_or_else(|| Arc::new(UnconfiguredExecutor))
    }

    fn slot(&self, family: ProcessingFamily) -> &Option<Arc<dyn ProcessingExecutor>> {
        match family {
            ProcessingFamily::Image => &self.image,
            ProcessingFamily::Document => &self.document,
            ProcessingFamily::Video => &self.video,
            ProcessingFamily::Content => &self.content,
            ProcessingFamily::Custom => &self.custom,
        }
    }

    fn slot_mut(&mut self, family: ProcessingFamily) -> &mut Option<Arc<dyn ProcessingExecutor>> {
        match family {
            ProcessingFamily::Image => &mut self.image,
            ProcessingFamily::Document => &mut self.document,
            ProcessingFamily::Video => &mut self.video,
            ProcessingFamily::Content => &mut self.content,
            ProcessingFamily::Custom => &mut self.custom,
        }
    }
}
