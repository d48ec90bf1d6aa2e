//! Shared test utilities for fileproc integration tests.
//!
//! This module provides:
//! - `TestHarness` for running a job manager against temp directories and an
//!   in-memory store
//! - Scripted executors and a recording callback dispatcher
//! - Builder patterns for requests, pipelines and settings

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::{Outcome, RecordingCallbacks, ScriptedExecutor, TestHarness};
