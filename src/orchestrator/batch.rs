//! Batch orchestrator: one batch's generate → insert → shortfall recovery loop.
//!
//! Round 0 generates the full batch. Every further round regenerates exactly
//! the missing count and inserts it again, up to `max_shortfall_rounds`.
//! Both the generated records and the insert report of each round are
//! journaled, so a replay resubmits the same records and the store
//! acknowledges the ones it already holds.

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use crate::activities::{Activities, InsertReport};
use crate::config::ContainerSpec;
use crate::db::{self, RunKind, RunStatus};
use crate::generator;
use crate::journal::{Journal, JournalError};
use crate::model::CodeRecord;

use super::OrchestrationError;

/// Everything a batch needs to run, persisted as the child run's input.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchInput {
    pub batch_index: u64,
    pub size: u64,
    pub code_length: usize,
    pub batch: String,
    pub sequence: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchPhase {
    Generating,
    Inserting,
    ShortfallDetected,
    Regenerating,
    Retrying,
    Complete,
    Failed,
}

impl BatchPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchPhase::Generating => "generating",
            BatchPhase::Inserting => "inserting",
            BatchPhase::ShortfallDetected => "shortfall_detected",
            BatchPhase::Regenerating => "regenerating",
            BatchPhase::Retrying => "retrying",
            BatchPhase::Complete => "complete",
            BatchPhase::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Every requested code is in the store.
    Complete,
    /// Shortfall rounds ran out; the missing codes were given up on.
    ShortfallAbandoned,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchOutcome {
    pub batch_index: u64,
    pub requested: u64,
    pub inserted: u64,
    pub rounds: u32,
    pub status: BatchStatus,
}

impl BatchOutcome {
    pub fn shortfall(&self) -> u64 {
        self.requested.saturating_sub(self.inserted)
    }
}

#[derive(Clone)]
pub struct BatchOrchestrator {
    journal: Journal,
    activities: Activities,
    container: ContainerSpec,
    max_shortfall_rounds: u32,
}

impl BatchOrchestrator {
    pub fn new(
        journal: Journal,
        activities: Activities,
        container: ContainerSpec,
        max_shortfall_rounds: u32,
    ) -> Self {
        Self {
            journal,
            activities,
            container,
            max_shortfall_rounds,
        }
    }

    /// Drive batch `input` under `run_id` to completion, replaying recorded rounds.
    #[instrument(skip_all, fields(run_id = %run_id, batch_index = input.batch_index))]
    pub async fn run(
        &self,
        run_id: &str,
        parent_id: Option<&str>,
        input: &BatchInput,
    ) -> Result<BatchOutcome, OrchestrationError> {
        let pool = self.journal.pool();
        let raw_input = serde_json::to_string(input).map_err(|source| JournalError::Codec {
            step: "input".to_string(),
            source,
        })?;
        if !db::create_run(pool, run_id, parent_id, RunKind::Batch, &raw_input)
            .await
            .map_err(JournalError::from)?
        {
            if let Some(outcome) = self.finished_outcome(run_id).await? {
                debug!(run_id, "batch already completed; replaying outcome");
                return Ok(outcome);
            }
        }

        match self.drive(run_id, input).await {
            Ok(outcome) => {
                let raw = serde_json::to_string(&outcome).map_err(|source| {
                    JournalError::Codec {
                        step: "output".to_string(),
                        source,
                    }
                })?;
                db::complete_run(pool, run_id, &raw)
                    .await
                    .map_err(JournalError::from)?;
                Ok(outcome)
            }
            Err(err) => {
                if let Err(mark) = db::fail_run(pool, run_id, &err.to_string()).await {
                    error!(run_id, error = %mark, "could not mark batch run failed");
                }
                Err(err)
            }
        }
    }

    async fn finished_outcome(&self, run_id: &str) -> Result<Option<BatchOutcome>, JournalError> {
        let Some(run) = db::get_run(self.journal.pool(), run_id).await? else {
            return Ok(None);
        };
        match (run.status, run.output) {
            (RunStatus::Completed, Some(raw)) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|source| JournalError::Codec {
                    step: "output".to_string(),
                    source,
                }),
            _ => Ok(None),
        }
    }

    async fn drive(&self, run_id: &str, input: &BatchInput) -> Result<BatchOutcome, OrchestrationError> {
        let requested = input.size;
        let last_round = self.max_shortfall_rounds;
        let mut inserted: u64 = 0;
        let mut round: u32 = 0;
        let mut phase = BatchPhase::Generating;

        loop {
            let missing = requested - inserted;
            debug!(phase = phase.as_str(), round, missing, "batch round starting");

            let records: Vec<CodeRecord> = self
                .journal
                .step(run_id, &format!("generate:{round}"), || async {
                    generator::generate(
                        missing as usize,
                        input.code_length,
                        &input.batch,
                        &input.sequence,
                    )
                })
                .await?;

            phase = if round == 0 {
                BatchPhase::Inserting
            } else {
                BatchPhase::Retrying
            };
            debug!(phase = phase.as_str(), round, submitted = records.len(), "submitting batch");

            let activities = &self.activities;
            let container = &self.container;
            let batch_index = input.batch_index;
            let report: InsertReport = self
                .journal
                .step(run_id, &format!("insert:{round}"), move || async move {
                    let submitted = records.len();
                    let result = activities.insert_batch(container, batch_index, records).await;
                    InsertReport::from_result(submitted, &result)
                })
                .await?;

            inserted += report.inserted() as u64;
            let shortfall = requested - inserted;
            if shortfall == 0 {
                info!(
                    phase = BatchPhase::Complete.as_str(),
                    batch_index,
                    requested,
                    inserted,
                    rounds = round + 1,
                    "batch complete"
                );
                return Ok(BatchOutcome {
                    batch_index,
                    requested,
                    inserted,
                    rounds: round + 1,
                    status: BatchStatus::Complete,
                });
            }

            if round >= last_round {
                if let Some(cause) = report.failure {
                    phase = BatchPhase::Failed;
                    error!(
                        phase = phase.as_str(),
                        batch_index,
                        requested,
                        inserted,
                        shortfall,
                        %cause,
                        "batch failed in its last round"
                    );
                    return Err(OrchestrationError::BatchFailed {
                        batch_index,
                        requested,
                        inserted,
                        cause,
                    });
                }
                error!(
                    batch_index,
                    requested,
                    inserted,
                    shortfall,
                    rounds = round + 1,
                    "shortfall rounds exhausted; abandoning missing codes"
                );
                return Ok(BatchOutcome {
                    batch_index,
                    requested,
                    inserted,
                    rounds: round + 1,
                    status: BatchStatus::ShortfallAbandoned,
                });
            }

            phase = BatchPhase::ShortfallDetected;
            warn!(
                phase = phase.as_str(),
                batch_index,
                requested,
                inserted,
                shortfall,
                failure = report.failure.as_deref().unwrap_or("none"),
                "batch fell short; regenerating the missing codes"
            );
            phase = BatchPhase::Regenerating;
            round += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{InsertPolicy, StoreGateway};
    use crate::model::{ItemKey, PartitionKeyPath};
    use crate::store::{DocumentStore, SqliteDocumentStore, StoreError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Answers the n-th create (1-based) with `rule(n)`.
    struct CountingStore {
        calls: AtomicUsize,
        rule: Box<dyn Fn(usize) -> Result<(), StoreError> + Send + Sync>,
    }

    impl CountingStore {
        fn new(rule: impl Fn(usize) -> Result<(), StoreError> + Send + Sync + 'static) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                rule: Box::new(rule),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DocumentStore for CountingStore {
        async fn create_item(
            &self,
            _container: &str,
            _key: &ItemKey,
            _record: &CodeRecord,
        ) -> Result<(), StoreError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            (self.rule)(n)
        }

        async fn read_throughput(&self, _container: &str) -> Result<Option<u32>, StoreError> {
            Ok(Some(400))
        }

        async fn replace_throughput(&self, _container: &str, _max: u32) -> Result<(), StoreError> {
            Ok(())
        }
    }

    async fn orchestrator(store: Arc<CountingStore>, rounds: u32) -> BatchOrchestrator {
        let journal = Journal::new(db::memory_pool().await.unwrap());
        let gateway = StoreGateway::new(store, InsertPolicy::default());
        BatchOrchestrator::new(
            journal,
            Activities::new(gateway),
            ContainerSpec {
                id: "codes".into(),
                partition_key: PartitionKeyPath::Value,
            },
            rounds,
        )
    }

    fn input(size: u64) -> BatchInput {
        BatchInput {
            batch_index: 2,
            size,
            code_length: 8,
            batch: "B1".into(),
            sequence: "S1".into(),
        }
    }

    #[tokio::test]
    async fn full_insert_completes_in_one_round() {
        let store = CountingStore::new(|_| Ok(()));
        let orch = orchestrator(store.clone(), 1).await;

        let outcome = orch.run("p:batch-2", None, &input(40)).await.unwrap();
        assert_eq!(outcome.status, BatchStatus::Complete);
        assert_eq!(outcome.inserted, 40);
        assert_eq!(outcome.rounds, 1);
        assert_eq!(store.calls(), 40);

        let run = db::get_run(orch.journal.pool(), "p:batch-2").await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn partial_failure_regenerates_exactly_the_shortfall() {
        // 10 items, creates 1..=7 succeed, 8..=10 fail terminally, later ones succeed.
        let store = CountingStore::new(|n| {
            if (8..=10).contains(&n) {
                Err(StoreError::Unavailable("disk".into()))
            } else {
                Ok(())
            }
        });
        let orch = orchestrator(store.clone(), 1).await;

        let outcome = orch.run("b", None, &input(10)).await.unwrap();
        assert_eq!(outcome.status, BatchStatus::Complete);
        assert_eq!(outcome.inserted, 10);
        assert_eq!(outcome.rounds, 2);

        let first: InsertReport = orch.journal.replayed("b", "insert:0").await.unwrap().unwrap();
        assert_eq!(first.inserted(), 7);
        assert!(first.failure.is_some());
        let regenerated: Vec<CodeRecord> =
            orch.journal.replayed("b", "generate:1").await.unwrap().unwrap();
        assert_eq!(regenerated.len(), 3);
    }

    #[tokio::test]
    async fn exhausted_last_round_abandons_shortfall() {
        let store = CountingStore::new(|_| {
            Err(StoreError::Conflict {
                partition_key: "x".into(),
            })
        });
        let orch = orchestrator(store.clone(), 1).await;

        let outcome = orch.run("b", None, &input(4)).await.unwrap();
        assert_eq!(outcome.status, BatchStatus::ShortfallAbandoned);
        assert_eq!(outcome.inserted, 0);
        assert_eq!(outcome.shortfall(), 4);
        assert_eq!(outcome.rounds, 2);
        // 4 items in each of two rounds, three attempts apiece.
        assert_eq!(store.calls(), 24);
    }

    #[tokio::test]
    async fn terminal_error_in_last_round_fails_the_batch() {
        let store = CountingStore::new(|_| Err(StoreError::Unavailable("down".into())));
        let orch = orchestrator(store.clone(), 0).await;

        let err = orch.run("b", Some("parent"), &input(5)).await.unwrap_err();
        match err {
            OrchestrationError::BatchFailed {
                batch_index,
                requested,
                inserted,
                ..
            } => {
                assert_eq!(batch_index, 2);
                assert_eq!(requested, 5);
                assert_eq!(inserted, 0);
            }
            other => panic!("unexpected error: {other}"),
        }
        let run = db::get_run(orch.journal.pool(), "b").await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.parent_id.as_deref(), Some("parent"));
    }

    #[tokio::test]
    async fn completed_run_is_not_executed_again() {
        let store = CountingStore::new(|_| Ok(()));
        let orch = orchestrator(store.clone(), 1).await;

        let first = orch.run("b", None, &input(6)).await.unwrap();
        let second = orch.run("b", None, &input(6)).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.calls(), 6);
    }

    #[tokio::test]
    async fn interrupted_run_replays_recorded_rounds() {
        let store = CountingStore::new(|_| Ok(()));
        let orch = orchestrator(store.clone(), 1).await;
        let pool = orch.journal.pool().clone();

        // Simulate a crash after round 0 was journaled but before completion.
        let records = generator::generate(3, 8, "B1", "S1");
        let report = InsertReport {
            requested: 3,
            inserted_ids: records.iter().map(|r| r.id.clone()).collect(),
            failure: None,
        };
        db::create_run(&pool, "b", None, RunKind::Batch, "{}").await.unwrap();
        orch.journal.record("b", "generate:0", &records).await.unwrap();
        orch.journal.record("b", "insert:0", &report).await.unwrap();

        let outcome = orch.run("b", None, &input(3)).await.unwrap();
        assert_eq!(outcome.status, BatchStatus::Complete);
        assert_eq!(store.calls(), 0);
    }

    #[tokio::test]
    async fn replayed_round_keeps_a_regenerated_record_stored_once() {
        let pool = db::memory_pool().await.unwrap();
        let store = Arc::new(SqliteDocumentStore::new(pool.clone()));
        store.register_container("codes", Some(400)).await.unwrap();
        let path = PartitionKeyPath::Value;
        let orch = BatchOrchestrator::new(
            Journal::new(pool.clone()),
            Activities::new(StoreGateway::new(store.clone(), InsertPolicy::default())),
            ContainerSpec {
                id: "codes".into(),
                partition_key: path,
            },
            1,
        );

        // Round 0 was generated and its first code collided with a stored one.
        // The record went in under a fresh code, then the process died before
        // the insert step was recorded.
        let records = generator::generate(3, 8, "B1", "S1");
        db::create_run(&pool, "b", None, RunKind::Batch, "{}").await.unwrap();
        orch.journal.record("b", "generate:0", &records).await.unwrap();
        let mut holder = generator::generate(1, 8, "B0", "S0").remove(0);
        holder.value = records[0].value.clone();
        store
            .create_item("codes", &path.item_key(&holder), &holder)
            .await
            .unwrap();
        let mut moved = records[0].clone();
        moved.replace_value(generator::random_code(8));
        store
            .create_item("codes", &path.item_key(&moved), &moved)
            .await
            .unwrap();

        let outcome = orch.run("b", None, &input(3)).await.unwrap();
        assert_eq!(outcome.status, BatchStatus::Complete);
        assert_eq!(outcome.inserted, 3);
        assert_eq!(outcome.rounds, 1);

        let stored: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE container = ? AND id = ?")
                .bind("codes")
                .bind(&records[0].id)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(stored, 1);
        assert_eq!(store.count_items("codes").await.unwrap(), 4);
    }
}
