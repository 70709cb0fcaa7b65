//! SQLite-backed persistence (lazy pool, one row per operation).

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use silentq_core::OperationId;

use super::{PersistenceAdapter, SerializedOperation, StorageError};

#[derive(Debug, Clone)]
enum Location {
    File(PathBuf),
    Memory,
}

/// SQLite storage for durable operations.
///
/// The connection pool is opened on first use, creating the database file and
/// its parent directory if needed. Cheap to clone; clones share the pool.
#[derive(Debug, Clone)]
pub struct SqliteStorage {
    location: Location,
    pool: Arc<tokio::sync::Mutex<Option<SqlitePool>>>,
}

impl SqliteStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_location(Location::File(path.into()))
    }

    /// Private in-memory database; contents vanish with the value.
    pub fn in_memory() -> Self {
        Self::with_location(Location::Memory)
    }

    /// `{app_data_dir}/silentq/queue.db`
    pub fn at_default_location() -> anyhow::Result<Self> {
        Ok(Self::new(crate::config::default_database_path()?))
    }

    fn with_location(location: Location) -> Self {
        Self {
            location,
            pool: Arc::new(tokio::sync::Mutex::new(None)),
        }
    }

    async fn get_pool(&self) -> Result<SqlitePool, StorageError> {
        let mut guard = self.pool.lock().await;
        if let Some(pool) = guard.as_ref() {
            return Ok(pool.clone());
        }

        let pool = open(&self.location)
            .await
            .map_err(|e| StorageError::Backend(format!("{e:#}")))?;
        *guard = Some(pool.clone());
        Ok(pool)
    }
}

async fn open(location: &Location) -> anyhow::Result<SqlitePool> {
    let pool = match location {
        Location::File(path) => {
            ensure_parent_dir(path)?;
            let options = SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true);
            SqlitePoolOptions::new()
                .connect_with(options)
                .await
                .with_context(|| format!("failed to open silent queue database at {path:?}"))?
        }
        // A second connection to `:memory:` would see a different database.
        Location::Memory => SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("failed to open in-memory silent queue database")?,
    };

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS silent_queue (
            queue_name  TEXT NOT NULL,
            id          TEXT NOT NULL,
            sequence    INTEGER NOT NULL,
            payload     TEXT NOT NULL,
            updated_at  TEXT NOT NULL,
            PRIMARY KEY (queue_name, id)
        )
        "#,
    )
    .execute(&pool)
    .await
    .context("failed to create silent_queue table")?;

    tracing::debug!(location = ?location, "silent queue database ready");
    Ok(pool)
}

fn ensure_parent_dir(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create silent queue directory at {parent:?}"))?;
    }
    Ok(())
}

fn backend(err: sqlx::Error) -> StorageError {
    StorageError::Backend(err.to_string())
}

#[async_trait]
impl PersistenceAdapter for SqliteStorage {
    async fn save(&self, queue: &str, op: &SerializedOperation) -> Result<(), StorageError> {
        let pool = self.get_pool().await?;
        let payload = serde_json::to_string(op)?;
        let sequence = i64::try_from(op.sequence)
            .map_err(|_| StorageError::Serialization(format!("sequence {} out of range", op.sequence)))?;

        sqlx::query(
            r#"
            INSERT INTO silent_queue (queue_name, id, sequence, payload, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT (queue_name, id) DO UPDATE SET
                payload = excluded.payload,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(queue)
        .bind(op.id.to_string())
        .bind(sequence)
        .bind(payload)
        .bind(Utc::now().to_rfc3339())
        .execute(&pool)
        .await
        .map_err(backend)?;

        Ok(())
    }

    async fn load(&self, queue: &str) -> Result<Vec<SerializedOperation>, StorageError> {
        let pool = self.get_pool().await?;
        let rows = sqlx::query(
            r#"
            SELECT id, payload
            FROM silent_queue
            WHERE queue_name = ?1
            ORDER BY sequence ASC
            "#,
        )
        .bind(queue)
        .fetch_all(&pool)
        .await
        .map_err(backend)?;

        let mut ops = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("id").map_err(backend)?;
            let payload: String = row.try_get("payload").map_err(backend)?;
            match serde_json::from_str::<SerializedOperation>(&payload) {
                Ok(op) => ops.push(op),
                Err(err) => {
                    tracing::warn!(queue, operation_id = %id, error = %err, "skipping unreadable stored operation");
                }
            }
        }
        Ok(ops)
    }

    async fn remove(&self, queue: &str, id: OperationId) -> Result<(), StorageError> {
        let pool = self.get_pool().await?;
        sqlx::query("DELETE FROM silent_queue WHERE queue_name = ?1 AND id = ?2")
            .bind(queue)
            .bind(id.to_string())
            .execute(&pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn list_queues(&self) -> Result<BTreeSet<String>, StorageError> {
        let pool = self.get_pool().await?;
        let rows = sqlx::query("SELECT DISTINCT queue_name FROM silent_queue")
            .fetch_all(&pool)
            .await
            .map_err(backend)?;

        rows.into_iter()
            .map(|row| row.try_get::<String, _>("queue_name").map_err(backend))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use silentq_core::{Behavior, PlaceholderToken, RequestSpec, RetryPolicy};

    fn op(queue: &str, sequence: u64) -> SerializedOperation {
        SerializedOperation {
            id: OperationId::new(),
            queue: queue.to_string(),
            sequence,
            behavior: Behavior::Silent,
            request: RequestSpec::post("/todos", json!({"title": format!("t{sequence}")})),
            handler: None,
            handler_args: Vec::new(),
            retry: RetryPolicy::default(),
            attempt_count: 0,
            placeholder_refs: BTreeSet::from([PlaceholderToken::new()]),
            produces: Vec::new(),
            linked_state: Some("todos".to_string()),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn in_memory_round_trip() {
        let storage = SqliteStorage::in_memory();
        let (a, b) = (op("q1", 1), op("q1", 2));
        let other = op("q2", 3);

        storage.save("q1", &b).await.unwrap();
        storage.save("q1", &a).await.unwrap();
        storage.save("q2", &other).await.unwrap();

        let loaded = storage.load("q1").await.unwrap();
        assert_eq!(loaded, vec![a.clone(), b.clone()]);
        assert_eq!(
            storage.list_queues().await.unwrap(),
            BTreeSet::from(["q1".to_string(), "q2".to_string()])
        );

        storage.remove("q1", a.id).await.unwrap();
        storage.remove("q1", a.id).await.unwrap();
        assert_eq!(storage.load("q1").await.unwrap(), vec![b]);
    }

    #[tokio::test]
    async fn save_replaces_existing_row() {
        let storage = SqliteStorage::in_memory();
        let mut a = op("q", 1);
        storage.save("q", &a).await.unwrap();

        a.attempt_count = 2;
        storage.save("q", &a).await.unwrap();

        let loaded = storage.load("q").await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].attempt_count, 2);
    }

    #[tokio::test]
    async fn file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("queue.db");
        let a = op("q", 1);

        SqliteStorage::new(&path).save("q", &a).await.unwrap();

        let reopened = SqliteStorage::new(&path);
        assert_eq!(reopened.load("q").await.unwrap(), vec![a]);
    }
}
