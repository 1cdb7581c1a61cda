//! Document store capability consumed by the gateway and throughput activities.
//!
//! The store owns uniqueness: a create either succeeds, reports a conflict on
//! the record's item key, or signals throttling with an optional retry hint.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::model::{CodeRecord, ItemKey};

pub mod sqlite;

pub use sqlite::SqliteDocumentStore;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("conflict on partition key {partition_key}")]
    Conflict { partition_key: String },
    #[error("throttled by store (retry after {retry_after:?})")]
    Throttled { retry_after: Option<Duration> },
    #[error("container '{0}' not found")]
    ContainerNotFound(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Create `record` under `key` if absent.
    async fn create_item(
        &self,
        container: &str,
        key: &ItemKey,
        record: &CodeRecord,
    ) -> Result<(), StoreError>;

    /// Current autoscale maximum, `None` when the container has no throughput configured.
    async fn read_throughput(&self, container: &str) -> Result<Option<u32>, StoreError>;

    async fn replace_throughput(&self, container: &str, max_throughput: u32)
        -> Result<(), StoreError>;
}
