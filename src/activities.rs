//! Activities: the side-effecting steps orchestrators call.
//!
//! Activities do not retry on their own beyond what the gateway does per item;
//! orchestrators decide how often to call them again.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, instrument};

use crate::config::ContainerSpec;
use crate::gateway::{BulkInsertError, StoreGateway};
use crate::model::CodeRecord;
use crate::store::StoreError;

#[derive(Debug, Error)]
#[error("throughput control on '{container}' failed: {source}")]
pub struct ThroughputError {
    pub container: String,
    #[source]
    pub source: StoreError,
}

/// Result of one batch insert call as recorded in the checkpoint log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InsertReport {
    pub requested: usize,
    pub inserted_ids: Vec<String>,
    /// Terminal store error, if the call failed after partial progress.
    pub failure: Option<String>,
}

impl InsertReport {
    pub fn from_result(requested: usize, result: &Result<Vec<CodeRecord>, BulkInsertError>) -> Self {
        let (inserted, failure) = match result {
            Ok(inserted) => (inserted.as_slice(), None),
            Err(err) => (err.inserted.as_slice(), Some(err.cause.to_string())),
        };
        Self {
            requested,
            inserted_ids: inserted.iter().map(|r| r.id.clone()).collect(),
            failure,
        }
    }

    pub fn inserted(&self) -> usize {
        self.inserted_ids.len()
    }

    pub fn shortfall(&self) -> usize {
        self.requested.saturating_sub(self.inserted())
    }
}

#[derive(Clone)]
pub struct Activities {
    gateway: StoreGateway,
}

impl Activities {
    pub fn new(gateway: StoreGateway) -> Self {
        Self { gateway }
    }

    pub fn gateway(&self) -> &StoreGateway {
        &self.gateway
    }

    /// Persist one batch through the gateway.
    #[instrument(skip_all, fields(container = %container.id, batch_index = batch_index))]
    pub async fn insert_batch(
        &self,
        container: &ContainerSpec,
        batch_index: u64,
        records: Vec<CodeRecord>,
    ) -> Result<Vec<CodeRecord>, BulkInsertError> {
        let requested = records.len();
        match self.gateway.bulk_insert(records, container).await {
            Ok(inserted) => {
                info!(
                    batch_index,
                    requested,
                    inserted = inserted.len(),
                    "batch insert activity completed"
                );
                Ok(inserted)
            }
            Err(err) => {
                error!(
                    batch_index,
                    requested,
                    inserted = err.inserted.len(),
                    cause = %err.cause,
                    "batch insert activity failed"
                );
                Err(err)
            }
        }
    }

    #[instrument(skip_all, fields(container = %container))]
    pub async fn read_throughput(&self, container: &str) -> Result<Option<u32>, ThroughputError> {
        self.gateway
            .store()
            .read_throughput(container)
            .await
            .map_err(|source| ThroughputError {
                container: container.to_string(),
                source,
            })
    }

    /// Set the autoscale maximum; `None` leaves the container untouched.
    #[instrument(skip_all, fields(container = %container))]
    pub async fn set_throughput(
        &self,
        container: &str,
        value: Option<u32>,
    ) -> Result<(), ThroughputError> {
        let Some(value) = value else {
            info!(container, "throughput unknown; leaving container untouched");
            return Ok(());
        };
        match self.gateway.store().replace_throughput(container, value).await {
            Ok(()) => {
                info!(container, throughput = value, "throughput adjusted");
                Ok(())
            }
            Err(source) => {
                error!(container, throughput = value, %source, "throughput adjustment failed");
                Err(ThroughputError {
                    container: container.to_string(),
                    source,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::gateway::InsertPolicy;
    use crate::generator;
    use crate::model::PartitionKeyPath;
    use crate::store::{DocumentStore, SqliteDocumentStore};
    use std::sync::Arc;

    async fn setup() -> (Activities, SqliteDocumentStore) {
        let pool = db::memory_pool().await.unwrap();
        let store = SqliteDocumentStore::new(pool);
        store.register_container("codes", Some(1000)).await.unwrap();
        let gateway = StoreGateway::new(Arc::new(store.clone()), InsertPolicy::default());
        (Activities::new(gateway), store)
    }

    #[tokio::test]
    async fn set_throughput_none_is_noop() {
        let (activities, store) = setup().await;
        activities.set_throughput("codes", None).await.unwrap();
        assert_eq!(store.read_throughput("codes").await.unwrap(), Some(1000));
        activities.set_throughput("codes", Some(5000)).await.unwrap();
        activities.set_throughput("codes", Some(5000)).await.unwrap();
        assert_eq!(activities.read_throughput("codes").await.unwrap(), Some(5000));
    }

    #[tokio::test]
    async fn set_throughput_reports_container() {
        let (activities, _store) = setup().await;
        let err = activities.set_throughput("nope", Some(1)).await.unwrap_err();
        assert_eq!(err.container, "nope");
        assert!(matches!(err.source, StoreError::ContainerNotFound(_)));
    }

    #[tokio::test]
    async fn insert_batch_persists_records() {
        let (activities, store) = setup().await;
        let spec = ContainerSpec {
            id: "codes".into(),
            partition_key: PartitionKeyPath::Value,
        };
        let records = generator::generate(25, 9, "B", "S");
        let result = activities.insert_batch(&spec, 0, records).await;
        let report = InsertReport::from_result(25, &result);
        assert_eq!(report.inserted(), 25);
        assert_eq!(report.shortfall(), 0);
        assert!(report.failure.is_none());
        assert_eq!(store.count_items("codes").await.unwrap(), 25);
    }

    #[test]
    fn report_from_partial_failure() {
        let inserted = generator::generate(3, 9, "B", "S");
        let result: Result<Vec<CodeRecord>, BulkInsertError> = Err(BulkInsertError {
            container: "codes".into(),
            inserted: inserted.clone(),
            cause: StoreError::Unavailable("gone".into()),
        });
        let report = InsertReport::from_result(10, &result);
        assert_eq!(report.inserted(), 3);
        assert_eq!(report.shortfall(), 7);
        assert_eq!(report.inserted_ids[0], inserted[0].id);
        assert!(report.failure.unwrap().contains("gone"));
    }
}
