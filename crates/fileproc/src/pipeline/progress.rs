use std::sync::Mutex;

/// Events emitted by the pipeline runner while a job executes.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// Step `index` (0-based) of `total` is about to run.
    StepStarted {
        index: usize,
        total: usize,
        name: String,
    },
    /// `completed` of `total` steps have finished.
    StepCompleted {
        completed: usize,
        total: usize,
        name: String,
    },
    Failed {
        step: String,
        error: String,
    },
}

pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// No-op reporter for unit tests.
pub struct NoopProgress;

impl ProgressReporter for NoopProgress {
    fn report(&self, _event: ProgressEvent) {}
}

/// Keeps every event. Used by tests that assert on the event sequence.
#[derive(Default)]
pub struct RecordingProgress {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingProgress {
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl ProgressReporter for RecordingProgress {
    fn report(&self, event: ProgressEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
