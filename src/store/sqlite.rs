//! SQLite-backed document store.
//!
//! Documents live in one table keyed by `(container, partition_key, item_key)`,
//! with `id` unique per container.
//! Containers must be registered before use; their autoscale maximum is kept
//! alongside so throughput control has something real to read and replace.

use async_trait::async_trait;
use sqlx::SqlitePool;
use tracing::{debug, instrument};

use super::{DocumentStore, StoreError};
use crate::model::{CodeRecord, ItemKey};

const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

#[derive(Debug, Clone)]
pub struct SqliteDocumentStore {
    pool: SqlitePool,
}

impl SqliteDocumentStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Register `container` if missing. An existing container keeps its throughput.
    #[instrument(skip_all)]
    pub async fn register_container(
        &self,
        container: &str,
        autoscale_max: Option<u32>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO containers (container, autoscale_max) VALUES (?, ?) ON CONFLICT(container) DO NOTHING",
        )
        .bind(container)
        .bind(autoscale_max.map(i64::from))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip_all)]
    pub async fn count_items(&self, container: &str) -> anyhow::Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE container = ?")
            .bind(container)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn get_item(
        &self,
        container: &str,
        key: &ItemKey,
    ) -> anyhow::Result<Option<CodeRecord>> {
        let body: Option<String> = sqlx::query_scalar(
            "SELECT body FROM documents WHERE container = ? AND partition_key = ? AND item_key = ?",
        )
        .bind(container)
        .bind(&key.partition_key)
        .bind(&key.item_key)
        .fetch_optional(&self.pool)
        .await?;
        match body {
            Some(body) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }

    async fn contains_id(&self, container: &str, id: &str) -> Result<bool, StoreError> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM documents WHERE container = ? AND id = ?")
                .bind(container)
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
        Ok(found.is_some())
    }
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn create_item(
        &self,
        container: &str,
        key: &ItemKey,
        record: &CodeRecord,
    ) -> Result<(), StoreError> {
        let body =
            serde_json::to_string(record).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let res = sqlx::query(
            "INSERT INTO documents (container, partition_key, item_key, id, body) \
             SELECT ?, ?, ?, ?, ? WHERE EXISTS (SELECT 1 FROM containers WHERE container = ?)",
        )
        .bind(container)
        .bind(&key.partition_key)
        .bind(&key.item_key)
        .bind(&record.id)
        .bind(body)
        .bind(container)
        .execute(&self.pool)
        .await;

        match res {
            Ok(done) if done.rows_affected() == 0 => {
                Err(StoreError::ContainerNotFound(container.to_string()))
            }
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                // Ids are unique per container: if this id is already stored, under this
                // code or a regenerated one, the document exists and the create is done.
                if self.contains_id(container, &record.id).await? {
                    debug!(container, id = %record.id, "create acknowledged as already present");
                    return Ok(());
                }
                Err(StoreError::Conflict {
                    partition_key: key.partition_key.clone(),
                })
            }
            Err(err) => Err(map_sqlx_error(err)),
        }
    }

    async fn read_throughput(&self, container: &str) -> Result<Option<u32>, StoreError> {
        let row: Option<Option<i64>> =
            sqlx::query_scalar("SELECT autoscale_max FROM containers WHERE container = ?")
                .bind(container)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
        match row {
            None => Err(StoreError::ContainerNotFound(container.to_string())),
            Some(value) => Ok(value.and_then(|v| u32::try_from(v).ok())),
        }
    }

    async fn replace_throughput(
        &self,
        container: &str,
        max_throughput: u32,
    ) -> Result<(), StoreError> {
        let done = sqlx::query("UPDATE containers SET autoscale_max = ? WHERE container = ?")
            .bind(i64::from(max_throughput))
            .bind(container)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        if done.rows_affected() == 0 {
            return Err(StoreError::ContainerNotFound(container.to_string()));
        }
        Ok(())
    }
}

/// Busy/locked databases and pool exhaustion are capacity signals, not failures.
fn map_sqlx_error(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::PoolTimedOut => StoreError::Throttled { retry_after: None },
        sqlx::Error::Database(db) => {
            let primary = db
                .code()
                .and_then(|c| c.parse::<i32>().ok())
                .map(|c| c & 0xff);
            match primary {
                Some(SQLITE_BUSY) | Some(SQLITE_LOCKED) => {
                    StoreError::Throttled { retry_after: None }
                }
                _ => StoreError::Unavailable(err.to_string()),
            }
        }
        _ => StoreError::Unavailable(err.to_string()),
    }
}
