use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::Value;

use super::{record_created_at, RecordFilter, RecordKind, Store, StoreError};

/// Volatile store backed by in-process maps.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<RecordKind, HashMap<String, Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<RecordKind, HashMap<String, Value>>> {
        self.records.read().unwrap_or_else(|poisoned| {
            log::warn!("Memory store lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn write(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<RecordKind, HashMap<String, Value>>> {
        self.records.write().unwrap_or_else(|poisoned| {
            log::warn!("Memory store lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn save(&self, kind: RecordKind, id: &str, record: &Value) -> Result<(), StoreError> {
        self.write()
            .entry(kind)
            .or_default()
            .insert(id.to_string(), record.clone());
        Ok(())
    }

    async fn get(&self, kind: RecordKind, id: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.read().get(&kind).and_then(|m| m.get(id)).cloned())
    }

    async fn query(
        &self,
        kind: RecordKind,
        filter: &RecordFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Value>, StoreError> {
        let guard = self.read();
        let Some(records) = guard.get(&kind) else {
            return Ok(Vec::new());
        };

        let mut matching: Vec<&Value> = records.values().filter(|r| filter.matches(r)).collect();
        matching.sort_by(|a, b| record_created_at(b).cmp(&record_created_at(a)));

        Ok(matching
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn delete(&self, kind: RecordKind, id: &str) -> Result<bool, StoreError> {
        Ok(self
            .write()
            .get_mut(&kind)
            .map(|m| m.remove(id).is_some())
            .unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(created_at: &str, status: &str) -> Value {
        json!({"created_at": created_at, "status": status})
    }

    #[tokio::test]
    async fn test_query_newest_first_with_paging() {
        let store = MemoryStore::new();
        store
            .save(RecordKind::Job, "a", &record("2026-01-01T00:00:00Z", "pending"))
            .await
            .unwrap();
        store
            .save(RecordKind::Job, "b", &record("2026-01-03T00:00:00Z", "failed"))
            .await
            .unwrap();
        store
            .save(RecordKind::Job, "c", &record("2026-01-02T00:00:00.5Z", "pending"))
            .await
            .unwrap();

        let all = store
            .query(RecordKind::Job, &RecordFilter::default(), 10, 0)
            .await
            .unwrap();
        let dates: Vec<&str> = all.iter().map(|r| r["created_at"].as_str().unwrap()).collect();
        assert_eq!(
            dates,
            vec![
                "2026-01-03T00:00:00Z",
                "2026-01-02T00:00:00.5Z",
                "2026-01-01T00:00:00Z"
            ]
        );

        let page = store
            .query(RecordKind::Job, &RecordFilter::default(), 1, 1)
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0]["created_at"], "2026-01-02T00:00:00.5Z");

        let pending = store
            .query(RecordKind::Job, &RecordFilter::status("pending"), 10, 0)
            .await
            .unwrap();
        assert_eq!(pending.len(), 2);
    }

    #[tokio::test]
    async fn test_kinds_are_isolated() {
        let store = MemoryStore::new();
        store
            .save(RecordKind::Job, "x", &record("2026-01-01T00:00:00Z", "pending"))
            .await
            .unwrap();
        assert!(store.get(RecordKind::BatchJob, "x").await.unwrap().is_none());
        assert!(!store.delete(RecordKind::BatchJob, "x").await.unwrap());
        assert!(store.delete(RecordKind::Job, "x").await.unwrap());
        assert!(store.get(RecordKind::Job, "x").await.unwrap().is_none());
    }
}
