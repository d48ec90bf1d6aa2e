//! Outbound callback delivery.
//!
//! Delivery is best-effort: [`deliver`] logs failures and never surfaces them
//! to the job or batch that triggered the callback.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::CallbackSettings;
use crate::error::CallbackError;
use crate::models::{BatchJob, Job};
use crate::sanitize::redact_url;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait CallbackDispatcher: Send + Sync {
    /// POSTs `payload` as JSON and returns the response status code.
    async fn post(&self, url: &str, payload: &Value) -> Result<u16, CallbackError>;
}

/// JSON-over-HTTP dispatcher.
pub struct HttpCallbackDispatcher {
    client: Client,
}

impl HttpCallbackDispatcher {
    pub fn new(settings: &CallbackSettings) -> Result<Self, CallbackError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(Duration::from_secs(settings.timeout_seconds))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl CallbackDispatcher for HttpCallbackDispatcher {
    async fn post(&self, url: &str, payload: &Value) -> Result<u16, CallbackError> {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(CallbackError::InvalidUrl(redact_url(url)));
        }
        let response = self.client.post(url).json(payload).send().await?;
        Ok(response.status().as_u16())
    }
}

/// Dispatcher that accepts and drops every callback.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCallbacks;

#[async_trait]
impl CallbackDispatcher for NoopCallbacks {
    async fn post(&self, _url: &str, _payload: &Value) -> Result<u16, CallbackError> {
        Ok(204)
    }
}

/// Posts a callback, logging instead of failing. Returns whether the
/// endpoint answered with a 2xx status.
pub async fn deliver(dispatcher: &dyn CallbackDispatcher, url: &str, payload: &Value) -> bool {
    match dispatcher.post(url, payload).await {
        Ok(status) if (200..300).contains(&status) => {
            debug!(url = %redact_url(url), status, "Callback delivered");
            true
        }
        Ok(status) => {
            warn!(url = %redact_url(url), "{}", CallbackError::Status(status));
            false
        }
        Err(e) => {
            warn!(url = %redact_url(url), error = %e, "Callback delivery failed");
            false
        }
    }
}

// ─── Payloads ───

pub fn job_payload(job: &Job) -> Value {
    json!({
        "job_id": job.job_id,
        "file_id": job.file_id,
        "status": job.status,
        "created_at": job.created_at,
        "started_at": job.started_at,
        "completed_at": job.completed_at,
        "error_message": job.error_message(),
        "result": job.result,
        "progress": job.progress,
    })
}

pub fn batch_payload(batch: &BatchJob) -> Value {
    json!({
        "batch_id": batch.batch_id,
        "name": batch.name,
        "status": batch.status,
        "progress": batch.progress,
        "result": batch.result,
        "created_at": batch.created_at,
        "started_at": batch.started_at,
        "completed_at": batch.completed_at,
    })
}
