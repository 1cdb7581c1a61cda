//! Pipeline orchestrator: bracket the bulk phase with a throughput raise and
//! restore, fan batches out with pacing, and join them.
//!
//! The restore runs on every exit path once throughput has been captured,
//! including batch failure and cancellation. Containers are leased for the
//! whole run so two pipelines never race on the captured restore point, and
//! the leases carry a heartbeat so resume can tell a live run from a dead one.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::activities::{Activities, ThroughputError};
use crate::db::{self, Pool, RunKind, RunStatus};
use crate::journal::{Journal, JournalError};
use crate::model::{plan_batches, GenerationRequest, ThroughputSnapshot};

use super::batch::{BatchInput, BatchOrchestrator, BatchOutcome, BatchStatus};
use super::{validate_request, OrchestrationError, PipelineSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelinePhase {
    Init,
    ThroughputRaised,
    BatchesDispatching,
    AwaitingCompletion,
    ThroughputReverted,
    Done,
}

impl PipelinePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelinePhase::Init => "init",
            PipelinePhase::ThroughputRaised => "throughput_raised",
            PipelinePhase::BatchesDispatching => "batches_dispatching",
            PipelinePhase::AwaitingCompletion => "awaiting_completion",
            PipelinePhase::ThroughputReverted => "throughput_reverted",
            PipelinePhase::Done => "done",
        }
    }
}

/// Refreshes a run's lease heartbeat until dropped.
struct LeaseHeartbeat(JoinHandle<()>);

impl LeaseHeartbeat {
    fn start(pool: Pool, run_id: String, every: Duration) -> Self {
        let every = every.max(Duration::from_millis(10));
        Self(tokio::spawn(async move {
            let mut ticks = tokio::time::interval(every);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                if let Err(err) = db::heartbeat_leases(&pool, &run_id, Utc::now()).await {
                    warn!(run_id = %run_id, error = %err, "could not refresh lease heartbeat");
                }
            }
        }))
    }
}

impl Drop for LeaseHeartbeat {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Output of a completed pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineReport {
    pub run_id: String,
    pub requested: u64,
    pub inserted: u64,
    pub batches: Vec<BatchOutcome>,
    pub snapshots: Vec<ThroughputSnapshot>,
}

impl PipelineReport {
    pub fn shortfall(&self) -> u64 {
        self.requested.saturating_sub(self.inserted)
    }
}

#[derive(Clone)]
pub struct PipelineOrchestrator {
    journal: Journal,
    activities: Activities,
    settings: PipelineSettings,
}

impl PipelineOrchestrator {
    pub fn new(journal: Journal, activities: Activities, settings: PipelineSettings) -> Self {
        Self {
            journal,
            activities,
            settings,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn child_run_id(run_id: &str, batch_index: u64) -> String {
        format!("{run_id}:batch-{batch_index}")
    }

    fn batch_orchestrator(&self) -> BatchOrchestrator {
        BatchOrchestrator::new(
            self.journal.clone(),
            self.activities.clone(),
            self.settings.target.clone(),
            self.settings.max_shortfall_rounds,
        )
    }

    /// Run (or resume) pipeline `run_id` for `request`.
    #[instrument(skip_all, fields(run_id = %run_id, total_count = request.total_count))]
    pub async fn run(
        &self,
        run_id: &str,
        request: &GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<PipelineReport, OrchestrationError> {
        validate_request(request)?;
        let pool = self.journal.pool();

        let raw_input = serde_json::to_string(request).map_err(|source| JournalError::Codec {
            step: "input".to_string(),
            source,
        })?;
        let created = db::create_run(pool, run_id, None, RunKind::Pipeline, &raw_input)
            .await
            .map_err(JournalError::from)?;
        if !created {
            if let Some(finished) = self.finished(run_id).await? {
                return finished;
            }
            info!(run_id, "continuing recorded pipeline run");
        }

        let containers = self.settings.bracketed_containers();
        if let Err(err) = self.acquire_leases(run_id, &containers).await {
            self.finish_failed(run_id, &err).await;
            return Err(err);
        }
        let _heartbeat =
            LeaseHeartbeat::start(pool.clone(), run_id.to_string(), self.settings.lease_heartbeat);

        let snapshots = match self.capture(run_id, &containers).await {
            Ok(snapshots) => snapshots,
            Err(err) => {
                self.release_leases(run_id, &containers).await;
                self.finish_failed(run_id, &err).await;
                return Err(err);
            }
        };

        let result = self.raise_and_dispatch(run_id, request, &snapshots, &cancel).await;

        self.restore(run_id, &snapshots).await;
        self.release_leases(run_id, &containers).await;

        match result {
            Ok(batches) => {
                let report = PipelineReport {
                    run_id: run_id.to_string(),
                    requested: request.total_count,
                    inserted: batches.iter().map(|b| b.inserted).sum(),
                    batches,
                    snapshots,
                };
                let raw = serde_json::to_string(&report).map_err(|source| JournalError::Codec {
                    step: "output".to_string(),
                    source,
                })?;
                db::complete_run(pool, run_id, &raw)
                    .await
                    .map_err(JournalError::from)?;
                if report.shortfall() > 0 {
                    warn!(
                        phase = PipelinePhase::Done.as_str(),
                        requested = report.requested,
                        inserted = report.inserted,
                        shortfall = report.shortfall(),
                        "pipeline finished short of the requested count"
                    );
                } else {
                    info!(
                        phase = PipelinePhase::Done.as_str(),
                        requested = report.requested,
                        inserted = report.inserted,
                        "pipeline finished"
                    );
                }
                Ok(report)
            }
            Err(err) => {
                error!(run_id, error = %err, "pipeline failed");
                self.finish_failed(run_id, &err).await;
                Err(err)
            }
        }
    }

    /// Replay a finished run: its report when completed, its error when failed.
    async fn finished(
        &self,
        run_id: &str,
    ) -> Result<Option<Result<PipelineReport, OrchestrationError>>, JournalError> {
        let Some(run) = db::get_run(self.journal.pool(), run_id).await? else {
            return Ok(None);
        };
        match run.status {
            RunStatus::Running => Ok(None),
            RunStatus::Completed => {
                let raw = run.output.unwrap_or_default();
                let report = serde_json::from_str(&raw).map_err(|source| JournalError::Codec {
                    step: "output".to_string(),
                    source,
                })?;
                debug!(run_id, "pipeline already completed; replaying report");
                Ok(Some(Ok(report)))
            }
            RunStatus::Failed => Ok(Some(Err(OrchestrationError::RunFailed {
                run_id: run_id.to_string(),
                error: run.error.unwrap_or_default(),
            }))),
        }
    }

    async fn finish_failed(&self, run_id: &str, err: &OrchestrationError) {
        if let Err(mark) = db::fail_run(self.journal.pool(), run_id, &err.to_string()).await {
            error!(run_id, error = %mark, "could not mark pipeline run failed");
        }
    }

    /// Stop every in-flight batch and record the ones cut off as failed.
    async fn abort_batches(
        &self,
        run_id: &str,
        tasks: &mut JoinSet<Result<BatchOutcome, OrchestrationError>>,
    ) {
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}

        let pool = self.journal.pool();
        let children = match db::list_child_runs(pool, run_id).await {
            Ok(children) => children,
            Err(err) => {
                error!(run_id, error = %err, "could not list batch runs after abort");
                return;
            }
        };
        let reason = OrchestrationError::Cancelled.to_string();
        for child in children.iter().filter(|c| c.status == RunStatus::Running) {
            if let Err(err) = db::fail_run(pool, &child.run_id, &reason).await {
                error!(run_id = %child.run_id, error = %err, "could not mark batch run failed");
            }
        }
    }

    async fn acquire_leases(&self, run_id: &str, containers: &[String]) -> Result<(), OrchestrationError> {
        let pool = self.journal.pool();
        for (i, container) in containers.iter().enumerate() {
            let holder = db::acquire_lease(pool, container, run_id)
                .await
                .map_err(JournalError::from)?;
            if holder != run_id {
                warn!(container = %container, holder = %holder, "container is busy");
                self.release_leases(run_id, &containers[..i]).await;
                return Err(OrchestrationError::ContainerBusy {
                    container: container.clone(),
                    holder,
                });
            }
        }
        Ok(())
    }

    async fn release_leases(&self, run_id: &str, containers: &[String]) {
        for container in containers {
            if let Err(err) = db::release_lease(self.journal.pool(), container, run_id).await {
                error!(container = %container, error = %err, "could not release container lease");
            }
        }
    }

    /// Record each container's current throughput; an unreadable value is kept as unknown.
    async fn capture(
        &self,
        run_id: &str,
        containers: &[String],
    ) -> Result<Vec<ThroughputSnapshot>, OrchestrationError> {
        let mut snapshots = Vec::with_capacity(containers.len());
        for container in containers {
            let activities = &self.activities;
            let original: Option<u32> = self
                .journal
                .step(run_id, &format!("capture:{container}"), || async {
                    match activities.read_throughput(container).await {
                        Ok(value) => value,
                        Err(err) => {
                            warn!(container = %container, error = %err, "could not read throughput; restore will be skipped");
                            None
                        }
                    }
                })
                .await?;
            debug!(
                phase = PipelinePhase::Init.as_str(),
                container = %container,
                original = ?original,
                "throughput captured"
            );
            snapshots.push(ThroughputSnapshot {
                container_id: container.clone(),
                original_max_throughput: original,
            });
        }
        Ok(snapshots)
    }

    async fn raise_and_dispatch(
        &self,
        run_id: &str,
        request: &GenerationRequest,
        snapshots: &[ThroughputSnapshot],
        cancel: &CancellationToken,
    ) -> Result<Vec<BatchOutcome>, OrchestrationError> {
        let ceiling = self.settings.throughput_ceiling;
        for snapshot in snapshots {
            if cancel.is_cancelled() {
                return Err(OrchestrationError::Cancelled);
            }
            let container = &snapshot.container_id;
            if snapshot.original_max_throughput.is_none() {
                warn!(container = %container, "original throughput unknown; not raising");
                continue;
            }
            self.apply_throughput(
                run_id,
                &format!("raise:{container}"),
                container,
                Some(ceiling),
                OrchestrationError::ThroughputRaise,
            )
            .await?;
        }
        info!(
            phase = PipelinePhase::ThroughputRaised.as_str(),
            ceiling, "throughput raised"
        );

        self.dispatch(run_id, request, cancel).await
    }

    async fn dispatch(
        &self,
        run_id: &str,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<BatchOutcome>, OrchestrationError> {
        let plan = plan_batches(request.total_count, self.settings.batch_size);
        let pacing = self.settings.pacing_delay();
        info!(
            phase = PipelinePhase::BatchesDispatching.as_str(),
            batches = plan.len(),
            pacing_secs = pacing.as_secs_f64(),
            "dispatching batches"
        );

        let mut tasks = JoinSet::new();
        for (position, entry) in plan.iter().enumerate() {
            let child_id = Self::child_run_id(run_id, entry.batch_index);
            let parent_id = run_id.to_string();
            let input = BatchInput {
                batch_index: entry.batch_index,
                size: entry.size,
                code_length: request.code_length,
                batch: request.batch.clone(),
                sequence: request.sequence.clone(),
            };
            let batch = self.batch_orchestrator();
            debug!(batch_index = entry.batch_index, size = entry.size, "launching batch");
            tasks.spawn(async move { batch.run(&child_id, Some(&parent_id), &input).await });

            if position + 1 == plan.len() {
                break;
            }
            let pace_step = format!("pace:{}", entry.batch_index);
            tokio::select! {
                _ = cancel.cancelled() => {
                    warn!(launched = position + 1, "cancelled while dispatching; aborting batches");
                    self.abort_batches(run_id, &mut tasks).await;
                    return Err(OrchestrationError::Cancelled);
                }
                paced = self.journal.sleep(run_id, &pace_step, pacing) => paced?,
            }
        }

        info!(
            phase = PipelinePhase::AwaitingCompletion.as_str(),
            in_flight = tasks.len(),
            "awaiting batches"
        );
        let mut outcomes = Vec::with_capacity(plan.len());
        let mut first_error: Option<OrchestrationError> = None;
        loop {
            let joined = tokio::select! {
                _ = cancel.cancelled() => {
                    warn!(remaining = tasks.len(), "cancelled while awaiting batches; aborting");
                    self.abort_batches(run_id, &mut tasks).await;
                    return Err(OrchestrationError::Cancelled);
                }
                joined = tasks.join_next() => joined,
            };
            match joined {
                None => break,
                Some(Ok(Ok(outcome))) => {
                    if outcome.status == BatchStatus::ShortfallAbandoned {
                        warn!(
                            batch_index = outcome.batch_index,
                            shortfall = outcome.shortfall(),
                            "batch abandoned part of its codes"
                        );
                    }
                    outcomes.push(outcome);
                }
                Some(Ok(Err(err))) => {
                    error!(error = %err, "batch failed");
                    first_error.get_or_insert(err);
                }
                Some(Err(join_err)) => {
                    error!(error = %join_err, "batch task did not finish");
                    first_error.get_or_insert(OrchestrationError::BatchAborted(join_err.to_string()));
                }
            }
        }

        if let Some(err) = first_error {
            return Err(err);
        }
        outcomes.sort_by_key(|o| o.batch_index);
        Ok(outcomes)
    }

    /// Restore every captured value, target first, settling between containers.
    /// Failures are logged; the remaining containers are still restored.
    async fn restore(&self, run_id: &str, snapshots: &[ThroughputSnapshot]) {
        let mut restored_any = false;
        for snapshot in snapshots {
            let container = &snapshot.container_id;
            let Some(original) = snapshot.original_max_throughput else {
                warn!(container = %container, "original throughput unknown; leaving it untouched");
                continue;
            };
            if restored_any {
                let settle_step = format!("settle:{container}");
                if let Err(err) = self
                    .journal
                    .sleep(run_id, &settle_step, self.settings.restore_settle)
                    .await
                {
                    error!(container = %container, error = %err, "settle timer unavailable");
                }
            }
            match self
                .apply_throughput(
                    run_id,
                    &format!("restore:{container}"),
                    container,
                    Some(original),
                    OrchestrationError::ThroughputRestore,
                )
                .await
            {
                Ok(()) => {
                    info!(
                        phase = PipelinePhase::ThroughputReverted.as_str(),
                        container = %container,
                        throughput = original,
                        "throughput restored"
                    );
                }
                Err(err) => {
                    error!(container = %container, error = %err, "throughput restore gave up");
                }
            }
            restored_any = true;
        }
    }

    /// Journaled throughput change, attempted up to `throughput_attempts` times.
    async fn apply_throughput(
        &self,
        run_id: &str,
        step: &str,
        container: &str,
        value: Option<u32>,
        wrap: fn(ThroughputError) -> OrchestrationError,
    ) -> Result<(), OrchestrationError> {
        let attempts = self.settings.throughput_attempts.max(1);
        let delay = self.settings.throughput_retry_delay;
        let activities = &self.activities;
        let _: bool = self
            .journal
            .try_step(run_id, step, || async move {
                let mut attempt = 1;
                loop {
                    match activities.set_throughput(container, value).await {
                        Ok(()) => return Ok(true),
                        Err(err) if attempt < attempts => {
                            warn!(container, attempt, error = %err, "throughput change failed; retrying");
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                        }
                        Err(err) => return Err(wrap(err)),
                    }
                }
            })
            .await?;
        Ok(())
    }
}
