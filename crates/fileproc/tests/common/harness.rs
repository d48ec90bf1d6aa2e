//! Test harness for isolated job manager runs.
//!
//! The `TestHarness` struct provides:
//! - Temporary files and work directories
//! - An in-memory store and a recording callback dispatcher
//! - A job manager wired to a `ScriptedExecutor`

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tempfile::TempDir;

use fileproc::callback::CallbackDispatcher;
use fileproc::config::Settings;
use fileproc::error::{CallbackError, ErrorKind, JobError};
use fileproc::executor::{ExecutorRegistry, ProcessingExecutor, StepOutput};
use fileproc::models::{Job, Metadata, ProcessingType};
use fileproc::scaler::FixedProbe;
use fileproc::store::MemoryStore;
use fileproc::{BatchProcessor, JobManager};

use super::builders::SettingsBuilder;

/// What the scripted executor does for a given input.
#[derive(Debug, Clone)]
pub enum Outcome {
    Succeed,
    Fail(ErrorKind, String),
    /// Sleeps this long, then succeeds.
    Delay(Duration),
    /// Never returns.
    Hang,
}

/// Executor whose behavior is chosen per input file. An outcome is keyed by
/// a file-name prefix, so it also applies to the outputs derived from that
/// file in later steps.
pub struct ScriptedExecutor {
    outcomes: Mutex<HashMap<String, Outcome>>,
    fallback: Mutex<Outcome>,
    calls: Mutex<Vec<(String, ProcessingType)>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::with_fallback(Outcome::Succeed)
    }

    pub fn with_fallback(fallback: Outcome) -> Self {
        Self {
            outcomes: Mutex::new(HashMap::new()),
            fallback: Mutex::new(fallback),
            calls: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn set(&self, file_prefix: &str, outcome: Outcome) {
        self.outcomes
            .lock()
            .unwrap()
            .insert(file_prefix.to_string(), outcome);
    }

    pub fn set_fallback(&self, outcome: Outcome) {
        *self.fallback.lock().unwrap() = outcome;
    }

    /// `(input file name, processing type)` for every call, in call order.
    pub fn calls(&self) -> Vec<(String, ProcessingType)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, file_prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|(name, _)| name.starts_with(file_prefix))
            .count()
    }

    /// Highest number of executions that were running at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn outcome_for(&self, name: &str) -> Outcome {
        let outcomes = self.outcomes.lock().unwrap();
        outcomes
            .iter()
            .filter(|(prefix, _)| name.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, outcome)| outcome.clone())
            .unwrap_or_else(|| self.fallback.lock().unwrap().clone())
    }
}

impl Default for ScriptedExecutor {
    fn default() -> Self {
        Self::new()
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProcessingExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        processing_type: ProcessingType,
        input: &Path,
        _parameters: &Metadata,
        work_dir: &Path,
    ) -> Result<StepOutput, JobError> {
        let name = input
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        self.calls
            .lock()
            .unwrap()
            .push((name.clone(), processing_type));

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _guard = ActiveGuard(&self.active);

        match self.outcome_for(&name) {
            Outcome::Succeed => {}
            Outcome::Fail(kind, message) => return Err(JobError::new(kind, message)),
            Outcome::Delay(delay) => tokio::time::sleep(delay).await,
            Outcome::Hang => std::future::pending::<()>().await,
        }

        let output = work_dir.join(format!("{}.{}", name, processing_type));
        Ok(StepOutput::new(vec![output])
            .with_metadata(processing_type.as_str(), Value::Bool(true)))
    }
}

/// Callback dispatcher that records every payload and answers 200.
#[derive(Default)]
pub struct RecordingCallbacks {
    posts: Mutex<Vec<(String, Value)>>,
}

impl RecordingCallbacks {
    pub fn posts(&self) -> Vec<(String, Value)> {
        self.posts.lock().unwrap().clone()
    }

    /// Payloads posted to `url`, in order.
    pub fn payloads_for(&self, url: &str) -> Vec<Value> {
        self.posts()
            .into_iter()
            .filter(|(u, _)| u == url)
            .map(|(_, p)| p)
            .collect()
    }
}

#[async_trait]
impl CallbackDispatcher for RecordingCallbacks {
    async fn post(&self, url: &str, payload: &Value) -> Result<u16, CallbackError> {
        self.posts
            .lock()
            .unwrap()
            .push((url.to_string(), payload.clone()));
        Ok(200)
    }
}

/// Test harness providing an isolated job manager.
pub struct TestHarness {
    /// Keeps the temp tree alive for the harness's lifetime.
    temp_dir: TempDir,
    pub files_dir: PathBuf,
    pub work_dir: PathBuf,
    pub store: Arc<MemoryStore>,
    pub executor: Arc<ScriptedExecutor>,
    pub callbacks: Arc<RecordingCallbacks>,
    pub manager: Arc<JobManager>,
}

impl TestHarness {
    /// Harness with test-tuned default settings and an always-succeeding executor.
    pub fn new() -> Self {
        Self::with_settings(SettingsBuilder::new().build())
    }

    /// Harness with custom settings. The files and work directories are
    /// always redirected into the temp tree.
    pub fn with_settings(mut settings: Settings) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let files_dir = temp_dir.path().join("files");
        let work_dir = temp_dir.path().join("work");
        std::fs::create_dir_all(&files_dir).expect("Failed to create files dir");

        settings.processing.files_dir = files_dir.clone();
        settings.processing.work_dir = work_dir.clone();

        let store = Arc::new(MemoryStore::new());
        let executor = Arc::new(ScriptedExecutor::new());
        let callbacks = Arc::new(RecordingCallbacks::default());

        let manager = JobManager::builder(settings, store.clone())
            .with_executors(ExecutorRegistry::uniform(executor.clone()))
            .with_callbacks(callbacks.clone())
            .with_probe(Box::new(FixedProbe::default()))
            .build();

        Self {
            temp_dir,
            files_dir,
            work_dir,
            store,
            executor,
            callbacks,
            manager,
        }
    }

    /// Creates an input file and returns its path.
    pub fn add_file(&self, name: &str) -> PathBuf {
        let path = self.files_dir.join(name);
        std::fs::write(&path, name.as_bytes()).expect("Failed to write input file");
        path
    }

    pub fn add_files(&self, names: &[&str]) {
        for name in names {
            self.add_file(name);
        }
    }

    pub async fn start(&self) {
        self.manager.start().await.expect("Job manager failed to start");
    }

    pub fn batches(&self) -> Arc<BatchProcessor> {
        Arc::new(BatchProcessor::new(self.manager.clone()))
    }

    /// Waits for a job's retry chain to finish, failing the test after
    /// `limit`.
    pub async fn finish(&self, job_id: &str, limit: Duration) -> Job {
        tokio::time::timeout(limit, self.manager.wait_for_outcome(job_id))
            .await
            .expect("Job did not finish in time")
            .expect("Job manager shut down")
    }

    /// Waits until the job has been started by a worker.
    pub async fn wait_until_running(&self, job_id: &str) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let job = self.manager.get_job(job_id).await.expect("Job vanished");
            if job.status == fileproc::models::JobStatus::Running {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "Job {} never started",
                job_id
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub async fn shutdown(&self) {
        self.manager.shutdown().await;
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
