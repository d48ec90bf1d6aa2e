pub mod progress;
pub mod registry;
pub mod runner;

pub use progress::{NoopProgress, ProgressEvent, ProgressReporter, RecordingProgress};
pub use registry::{builtin_pipelines, PipelineRegistry};
pub use runner::{PipelineOutput, PipelineRunner};
