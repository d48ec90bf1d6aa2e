//! Broadcasting of job lifecycle events.
//!
//! Subscribers (an API layer, the batch driver, tests) receive every status
//! and progress change without polling the store.

pub mod job_events;

pub use job_events::{JobEvent, JobEventBroadcaster, JobEventKind};
