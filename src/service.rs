//! Trigger layer: accept generation requests and hand them to the pipeline
//! orchestrator in the background, resume interrupted runs, report status.

use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::activities::Activities;
use crate::config::Config;
use crate::db::{self, Pool, RunKind, RunRecord, RunStatus};
use crate::gateway::{InsertPolicy, StoreGateway};
use crate::generator;
use crate::journal::{Journal, JournalError};
use crate::model::GenerationRequest;
use crate::orchestrator::{
    validate_request, OrchestrationError, PipelineOrchestrator, PipelineReport, PipelineSettings,
};
use crate::store::DocumentStore;

pub type RunHandle = JoinHandle<Result<PipelineReport, OrchestrationError>>;

/// Acknowledgement returned as soon as a run is recorded; the work continues in `handle`.
pub struct Accepted {
    pub run_id: String,
    pub request: GenerationRequest,
    pub handle: RunHandle,
}

/// A pipeline run together with its batch runs.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run: RunRecord,
    pub batches: Vec<RunRecord>,
}

impl RunSummary {
    pub fn count_batches(&self, status: RunStatus) -> usize {
        self.batches.iter().filter(|b| b.status == status).count()
    }
}

#[derive(Clone)]
pub struct PipelineService {
    pool: Pool,
    orchestrator: PipelineOrchestrator,
}

impl PipelineService {
    pub fn new(pool: Pool, orchestrator: PipelineOrchestrator) -> Self {
        Self { pool, orchestrator }
    }

    /// Wire gateway, activities and orchestrator for `store` as configured.
    pub fn from_config(pool: Pool, store: Arc<dyn DocumentStore>, cfg: &Config) -> Self {
        let gateway = StoreGateway::new(store, InsertPolicy::from(&cfg.gateway));
        let orchestrator = PipelineOrchestrator::new(
            Journal::new(pool.clone()),
            Activities::new(gateway),
            PipelineSettings::from(cfg),
        );
        Self::new(pool, orchestrator)
    }

    /// Validate and record `request`, then start it in the background.
    /// An empty batch tag is replaced with a generated batch number.
    pub async fn submit(
        &self,
        mut request: GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<Accepted, OrchestrationError> {
        if request.batch.trim().is_empty() {
            request.batch = generator::batch_number(Utc::now());
        }
        validate_request(&request)?;

        let run_id = Uuid::new_v4().to_string();
        let input = serde_json::to_string(&request).map_err(|source| JournalError::Codec {
            step: "input".to_string(),
            source,
        })?;
        db::create_run(&self.pool, &run_id, None, RunKind::Pipeline, &input)
            .await
            .map_err(JournalError::from)?;
        info!(
            run_id = %run_id,
            total_count = request.total_count,
            batch = %request.batch,
            sequence = %request.sequence,
            "generation request accepted"
        );

        let handle = self.spawn(run_id.clone(), request.clone(), cancel);
        Ok(Accepted {
            run_id,
            request,
            handle,
        })
    }

    /// Restart every pipeline run still marked running whose driving process is gone;
    /// their journals replay. A run whose leases were refreshed within
    /// `lease_stale_after` is still being driven elsewhere and is left alone.
    pub async fn resume_incomplete(&self, cancel: CancellationToken) -> Result<Vec<(String, RunHandle)>> {
        let runs = db::list_runs(&self.pool, RunKind::Pipeline, RunStatus::Running)
            .await
            .context("listing running pipeline runs")?;
        let stale_after = self.orchestrator.settings().lease_stale_after;
        let mut handles = Vec::with_capacity(runs.len());
        for run in runs {
            if let Some(beat) = db::last_heartbeat(&self.pool, &run.run_id).await? {
                let age = (Utc::now() - beat).to_std().unwrap_or_default();
                if age < stale_after {
                    info!(
                        run_id = %run.run_id,
                        heartbeat_age_secs = age.as_secs_f64(),
                        "run is still driven by a live process; not resuming"
                    );
                    continue;
                }
            }
            let request: GenerationRequest = match serde_json::from_str(&run.input) {
                Ok(request) => request,
                Err(err) => {
                    warn!(run_id = %run.run_id, error = %err, "unreadable run input; marking failed");
                    db::fail_run(&self.pool, &run.run_id, &format!("unreadable input: {err}")).await?;
                    continue;
                }
            };
            info!(run_id = %run.run_id, "resuming pipeline run");
            let handle = self.spawn(run.run_id.clone(), request, cancel.child_token());
            handles.push((run.run_id, handle));
        }
        Ok(handles)
    }

    pub async fn status(&self, run_id: &str) -> Result<Option<RunSummary>> {
        let Some(run) = db::get_run(&self.pool, run_id).await? else {
            return Ok(None);
        };
        let batches = db::list_child_runs(&self.pool, run_id).await?;
        Ok(Some(RunSummary { run, batches }))
    }

    fn spawn(&self, run_id: String, request: GenerationRequest, cancel: CancellationToken) -> RunHandle {
        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            let result = orchestrator.run(&run_id, &request, cancel).await;
            if let Err(err) = &result {
                error!(run_id = %run_id, error = %err, "pipeline run ended with an error");
            }
            result
        })
    }
}
