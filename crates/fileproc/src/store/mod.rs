//! Durable record storage for jobs, batches, dead letters and pipelines.
//!
//! Records are JSON documents addressed by `(kind, id)`. Queries filter on
//! the record's `status` field and return newest-first by `created_at`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

pub mod error;
pub mod memory;
pub mod migrations;
pub mod sqlite;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use sqlite::{default_database_path, Database, SqliteStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Job,
    BatchJob,
    DeadLetter,
    ArchivedDeadLetter,
    Pipeline,
}

impl RecordKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordKind::Job => "job",
            RecordKind::BatchJob => "batch_job",
            RecordKind::DeadLetter => "dead_letter",
            RecordKind::ArchivedDeadLetter => "archived_dead_letter",
            RecordKind::Pipeline => "pipeline",
        }
    }
}

/// Query filter parameters for record listing.
#[derive(Debug, Default, Clone)]
pub struct RecordFilter {
    pub status: Option<String>,
}

impl RecordFilter {
    pub fn status(status: &str) -> Self {
        Self {
            status: Some(status.to_string()),
        }
    }

    fn matches(&self, record: &Value) -> bool {
        match &self.status {
            Some(wanted) => record_status(record).as_deref() == Some(wanted.as_str()),
            None => true,
        }
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn save(&self, kind: RecordKind, id: &str, record: &Value) -> Result<(), StoreError>;

    async fn get(&self, kind: RecordKind, id: &str) -> Result<Option<Value>, StoreError>;

    async fn query(
        &self,
        kind: RecordKind,
        filter: &RecordFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Value>, StoreError>;

    /// Returns whether a record was removed.
    async fn delete(&self, kind: RecordKind, id: &str) -> Result<bool, StoreError>;
}

// ─── Typed helpers ───

pub async fn save_as<T: Serialize + Sync>(
    store: &dyn Store,
    kind: RecordKind,
    id: &str,
    value: &T,
) -> Result<(), StoreError> {
    let record = serde_json::to_value(value)?;
    store.save(kind, id, &record).await
}

pub async fn get_as<T: DeserializeOwned>(
    store: &dyn Store,
    kind: RecordKind,
    id: &str,
) -> Result<Option<T>, StoreError> {
    match store.get(kind, id).await? {
        Some(record) => Ok(Some(serde_json::from_value(record)?)),
        None => Ok(None),
    }
}

/// Like [`Store::query`], skipping records that no longer deserialize.
pub async fn query_as<T: DeserializeOwned>(
    store: &dyn Store,
    kind: RecordKind,
    filter: &RecordFilter,
    limit: usize,
    offset: usize,
) -> Result<Vec<T>, StoreError> {
    let records = store.query(kind, filter, limit, offset).await?;
    Ok(records
        .into_iter()
        .filter_map(|r| match serde_json::from_value(r) {
            Ok(v) => Some(v),
            Err(e) => {
                log::warn!("Skipping unreadable {} record: {}", kind.as_str(), e);
                None
            }
        })
        .collect())
}

// ─── Record field extraction ───

/// Creation time of a record: `created_at`, else `first_failed_at`.
pub(crate) fn record_created_at(record: &Value) -> Option<DateTime<Utc>> {
    ["created_at", "first_failed_at"]
        .iter()
        .filter_map(|field| record.get(*field).and_then(|v| v.as_str()))
        .find_map(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

pub(crate) fn record_status(record: &Value) -> Option<String> {
    record
        .get("status")
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_created_at_falls_back_to_first_failed_at() {
        let r = json!({"first_failed_at": "2026-01-02T03:04:05Z"});
        let dt = record_created_at(&r).unwrap();
        assert_eq!(dt.to_rfc3339(), "2026-01-02T03:04:05+00:00");
        assert!(record_created_at(&json!({})).is_none());
    }

    #[test]
    fn test_filter_matches_status() {
        let r = json!({"status": "pending"});
        assert!(RecordFilter::default().matches(&r));
        assert!(RecordFilter::status("pending").matches(&r));
        assert!(!RecordFilter::status("failed").matches(&r));
    }

    #[tokio::test]
    async fn test_typed_helpers_roundtrip() {
        #[derive(Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Thing {
            created_at: String,
            status: String,
            n: u32,
        }

        let store = MemoryStore::new();
        let thing = Thing {
            created_at: "2026-01-01T00:00:00Z".into(),
            status: "pending".into(),
            n: 7,
        };
        save_as(&store, RecordKind::Job, "t1", &thing).await.unwrap();
        let loaded: Option<Thing> = get_as(&store, RecordKind::Job, "t1").await.unwrap();
        assert_eq!(loaded, Some(thing));

        store
            .save(RecordKind::Job, "broken", &json!({"created_at": "2026-01-02T00:00:00Z"}))
            .await
            .unwrap();
        let all: Vec<Thing> = query_as(&store, RecordKind::Job, &RecordFilter::default(), 10, 0)
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
    }
}
