pub mod allocator;
pub mod batch;
pub mod broadcast;
pub mod callback;
pub mod config;
pub mod dead_letter;
pub mod error;
pub mod executor;
pub mod logging;
pub mod manager;
pub mod models;
pub mod pipeline;
pub mod resolver;
pub mod retry;
pub mod sanitize;
pub mod scaler;
pub mod store;
pub mod time;

pub use allocator::{AllocationError, ResourceAllocation, ResourceAllocator, Resources};
pub use batch::BatchProcessor;
pub use broadcast::{JobEvent, JobEventBroadcaster, JobEventKind};
pub use callback::{CallbackDispatcher, HttpCallbackDispatcher, NoopCallbacks};
pub use config::{load_settings, load_settings_from_env, Settings};
pub use dead_letter::{DeadLetterEntry, DeadLetterQueue, FailureReason, RecommendedAction};
pub use error::{ErrorKind, FileprocError, JobError, Result, ValidationError};
pub use executor::{ExecutorRegistry, ProcessingExecutor, ProcessingFamily, StepOutput};
pub use manager::{JobManager, JobManagerBuilder, JobMetrics};
pub use models::{
    BatchJob, BatchRequest, Job, JobPriority, JobRequest, JobStatus, Pipeline, PipelineStep,
    ProcessingType,
};
pub use pipeline::{PipelineRegistry, PipelineRunner};
pub use resolver::{DirectoryResolver, FileResolver};
pub use retry::{RetryConfig, RetryHandler};
pub use scaler::{ScaleTarget, WorkerScaler};
pub use store::{MemoryStore, SqliteStore, Store};
