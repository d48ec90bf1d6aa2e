//! SQLite-backed record store.
//!
//! Uses rusqlite with a thread-safe `Database` handle. All access is
//! serialized through a `Mutex<Connection>`; statements are short, so they
//! run inline on the calling task.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use super::{migrations, record_created_at, record_status, RecordFilter, RecordKind, Store, StoreError};

/// Thread-safe database handle wrapping a single rusqlite connection.
///
/// Cloning is cheap (inner `Arc`). WAL mode is enabled for file databases.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Opens (or creates) the database at the given path and runs all
    /// pending migrations.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        migrations::run_all(&conn)?;

        log::info!("Database opened at {}", path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Opens an in-memory database. Runs all migrations.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        migrations::run_all(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Provides locked access to the underlying connection.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        let conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        f(&conn)
    }
}

/// Returns the canonical database path: `~/.fileproc/data/fileproc.db`.
pub fn default_database_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".fileproc").join("data").join("fileproc.db"))
}

pub struct SqliteStore {
    db: Database,
}

impl SqliteStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Ok(Self::new(Database::open(path)?))
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Ok(Self::new(Database::open_in_memory()?))
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn save(&self, kind: RecordKind, id: &str, record: &Value) -> Result<(), StoreError> {
        let now = Utc::now();
        // Fixed-width timestamps so ORDER BY on the text column is chronological.
        let created_at = record_created_at(record)
            .unwrap_or(now)
            .to_rfc3339_opts(SecondsFormat::Micros, true);
        let updated_at = now.to_rfc3339_opts(SecondsFormat::Micros, true);
        let status = record_status(record);
        let body = serde_json::to_string(record)?;

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO records (kind, id, status, created_at, updated_at, body)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(kind, id) DO UPDATE SET
                    status = excluded.status,
                    updated_at = excluded.updated_at,
                    body = excluded.body",
                params![kind.as_str(), id, status, created_at, updated_at, body],
            )?;
            Ok(())
        })
    }

    async fn get(&self, kind: RecordKind, id: &str) -> Result<Option<Value>, StoreError> {
        let body: Option<String> = self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT body FROM records WHERE kind = ?1 AND id = ?2",
                    params![kind.as_str(), id],
                    |r| r.get(0),
                )
                .optional()?)
        })?;

        match body {
            Some(body) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }

    async fn query(
        &self,
        kind: RecordKind,
        filter: &RecordFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Value>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let offset = i64::try_from(offset).unwrap_or(i64::MAX);

        let bodies: Vec<String> = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT body FROM records
                 WHERE kind = ?1 AND (?2 IS NULL OR status = ?2)
                 ORDER BY created_at DESC
                 LIMIT ?3 OFFSET ?4",
            )?;
            let rows = stmt.query_map(
                params![kind.as_str(), filter.status, limit, offset],
                |r| r.get::<_, String>(0),
            )?;
            let mut bodies = Vec::new();
            for row in rows {
                bodies.push(row?);
            }
            Ok(bodies)
        })?;

        bodies
            .iter()
            .map(|b| serde_json::from_str(b).map_err(StoreError::from))
            .collect()
    }

    async fn delete(&self, kind: RecordKind, id: &str) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM records WHERE kind = ?1 AND id = ?2",
                params![kind.as_str(), id],
            )?;
            Ok(n > 0)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_store() -> SqliteStore {
        SqliteStore::open_in_memory().unwrap()
    }

    #[tokio::test]
    async fn test_save_and_get() {
        let store = test_store();
        let record = json!({"created_at": "2026-01-01T00:00:00Z", "status": "pending", "n": 1});
        store.save(RecordKind::Job, "j1", &record).await.unwrap();
        assert_eq!(store.get(RecordKind::Job, "j1").await.unwrap(), Some(record));
        assert!(store.get(RecordKind::Job, "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_overwrites_and_keeps_created_at() {
        let store = test_store();
        store
            .save(
                RecordKind::Job,
                "j1",
                &json!({"created_at": "2026-01-01T00:00:00Z", "status": "pending"}),
            )
            .await
            .unwrap();
        store
            .save(
                RecordKind::Job,
                "j1",
                &json!({"created_at": "2026-01-01T00:00:00Z", "status": "completed"}),
            )
            .await
            .unwrap();

        let completed = store
            .query(RecordKind::Job, &RecordFilter::status("completed"), 10, 0)
            .await
            .unwrap();
        assert_eq!(completed.len(), 1);
        let pending = store
            .query(RecordKind::Job, &RecordFilter::status("pending"), 10, 0)
            .await
            .unwrap();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_query_orders_newest_first() {
        let store = test_store();
        for (id, ts) in [
            ("a", "2026-01-01T00:00:00Z"),
            ("b", "2026-01-01T00:00:00.250Z"),
            ("c", "2025-12-31T23:59:59Z"),
        ] {
            store
                .save(RecordKind::Job, id, &json!({"id": id, "created_at": ts}))
                .await
                .unwrap();
        }

        let rows = store
            .query(RecordKind::Job, &RecordFilter::default(), 10, 0)
            .await
            .unwrap();
        let ids: Vec<&str> = rows.iter().map(|r| r["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);

        let page = store
            .query(RecordKind::Job, &RecordFilter::default(), 1, 2)
            .await
            .unwrap();
        assert_eq!(page[0]["id"], "c");
    }

    #[tokio::test]
    async fn test_delete() {
        let store = test_store();
        store
            .save(RecordKind::DeadLetter, "d", &json!({"first_failed_at": "2026-01-01T00:00:00Z"}))
            .await
            .unwrap();
        assert!(store.delete(RecordKind::DeadLetter, "d").await.unwrap());
        assert!(!store.delete(RecordKind::DeadLetter, "d").await.unwrap());
    }

    #[tokio::test]
    async fn test_file_database_persists_across_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("fileproc.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .save(RecordKind::Pipeline, "p", &json!({"pipeline_id": "p"}))
                .await
                .unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert!(store.get(RecordKind::Pipeline, "p").await.unwrap().is_some());
    }

    #[test]
    fn test_default_database_path() {
        let path = default_database_path().unwrap();
        assert!(path.ends_with("fileproc.db"));
        assert!(path.to_string_lossy().contains(".fileproc"));
    }
}
