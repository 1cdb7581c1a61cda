//! Store gateway: concurrent per-item creates with bounded conflict/throttle retry.
//!
//! An item counts as inserted only once the store has acknowledged its create.
//! Items that exhaust their retries are left out of the result so the caller
//! sees them as shortfall; a non-retryable store error fails the whole call
//! but still hands back every item confirmed so far.

use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::config::{self, ContainerSpec};
use crate::generator;
use crate::model::CodeRecord;
use crate::store::{DocumentStore, StoreError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertPolicy {
    pub max_insert_retries: u32,
    pub default_retry_after: Duration,
    pub max_concurrency: usize,
}

impl Default for InsertPolicy {
    fn default() -> Self {
        Self {
            max_insert_retries: 3,
            default_retry_after: Duration::from_secs(1),
            max_concurrency: 256,
        }
    }
}

impl From<&config::Gateway> for InsertPolicy {
    fn from(cfg: &config::Gateway) -> Self {
        Self {
            max_insert_retries: cfg.max_insert_retries,
            default_retry_after: cfg.default_retry_after(),
            max_concurrency: cfg.max_concurrency,
        }
    }
}

/// Terminal bulk insert failure carrying the items the store did confirm.
#[derive(Debug, Error)]
#[error("bulk insert into '{container}' failed after {} confirmed inserts: {cause}", inserted.len())]
pub struct BulkInsertError {
    pub container: String,
    pub inserted: Vec<CodeRecord>,
    pub cause: StoreError,
}

enum ItemOutcome {
    Inserted(CodeRecord),
    Exhausted(CodeRecord),
    Failed(CodeRecord, StoreError),
}

#[derive(Clone)]
pub struct StoreGateway {
    store: Arc<dyn DocumentStore>,
    policy: InsertPolicy,
}

impl StoreGateway {
    pub fn new(store: Arc<dyn DocumentStore>, policy: InsertPolicy) -> Self {
        Self { store, policy }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn policy(&self) -> &InsertPolicy {
        &self.policy
    }

    /// Insert `items` into `container`, returning the confirmed subset.
    #[instrument(skip_all, fields(container = %container.id, requested = items.len()))]
    pub async fn bulk_insert(
        &self,
        items: Vec<CodeRecord>,
        container: &ContainerSpec,
    ) -> Result<Vec<CodeRecord>, BulkInsertError> {
        let requested = items.len();
        let outcomes: Vec<ItemOutcome> = stream::iter(items)
            .map(|item| self.insert_with_retry(item, container))
            .buffer_unordered(self.policy.max_concurrency.max(1))
            .collect()
            .await;

        let mut inserted = Vec::with_capacity(requested);
        let mut exhausted = 0usize;
        let mut failures = Vec::new();
        for outcome in outcomes {
            match outcome {
                ItemOutcome::Inserted(item) => inserted.push(item),
                ItemOutcome::Exhausted(_) => exhausted += 1,
                ItemOutcome::Failed(item, err) => failures.push((item, err)),
            }
        }

        if let Some((item, cause)) = failures.into_iter().next() {
            warn!(
                inserted = inserted.len(),
                exhausted,
                failed_id = %item.id,
                %cause,
                "bulk insert hit a terminal store error"
            );
            return Err(BulkInsertError {
                container: container.id.clone(),
                inserted,
                cause,
            });
        }

        if exhausted > 0 {
            warn!(
                inserted = inserted.len(),
                exhausted, "some items exhausted their insert retries"
            );
        } else {
            info!(inserted = inserted.len(), "bulk insert completed");
        }
        Ok(inserted)
    }

    async fn insert_with_retry(&self, mut item: CodeRecord, container: &ContainerSpec) -> ItemOutcome {
        let code_length = item.value.len();
        let max = self.policy.max_insert_retries;
        for attempt in 1..=max {
            let key = container.partition_key.item_key(&item);
            match self.store.create_item(&container.id, &key, &item).await {
                Ok(()) => return ItemOutcome::Inserted(item),
                Err(StoreError::Conflict { partition_key }) => {
                    // Collision avoidance, not backoff: retry at once with a new code.
                    let fresh = fresh_code(&item.value, code_length);
                    debug!(id = %item.id, %partition_key, attempt, "conflict; regenerated code");
                    item.replace_value(fresh);
                }
                Err(StoreError::Throttled { retry_after }) => {
                    let delay = retry_after.unwrap_or(self.policy.default_retry_after);
                    debug!(id = %item.id, attempt, ?delay, "throttled");
                    if attempt < max {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(err) => return ItemOutcome::Failed(item, err),
            }
        }
        ItemOutcome::Exhausted(item)
    }
}

/// A new code of the same length that differs from `previous`.
fn fresh_code(previous: &str, length: usize) -> String {
    loop {
        let candidate = generator::random_code(length);
        if candidate != previous || length == 0 {
            return candidate;
        }
    }
}
