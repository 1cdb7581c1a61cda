//! Orchestrators: the pipeline (parent) and per-batch (child) state machines.
//!
//! Both drive their work through the [`Journal`](crate::journal::Journal) so a
//! restarted process resumes from the last recorded step.

use std::time::Duration;
use thiserror::Error;

use crate::activities::ThroughputError;
use crate::config::{self, Config, ContainerSpec};
use crate::journal::JournalError;
use crate::model::GenerationRequest;

pub mod batch;
pub mod pipeline;

pub use batch::{BatchInput, BatchOrchestrator, BatchOutcome, BatchPhase, BatchStatus};
pub use pipeline::{PipelinePhase, PipelineOrchestrator, PipelineReport};

#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("invalid generation request: {0}")]
    InvalidRequest(&'static str),
    #[error("container '{container}' is held by run {holder}")]
    ContainerBusy { container: String, holder: String },
    #[error("throughput raise failed: {0}")]
    ThroughputRaise(#[source] ThroughputError),
    #[error("throughput restore failed: {0}")]
    ThroughputRestore(#[source] ThroughputError),
    #[error("batch {batch_index} failed with {inserted} of {requested} codes inserted: {cause}")]
    BatchFailed {
        batch_index: u64,
        requested: u64,
        inserted: u64,
        cause: String,
    },
    #[error("batch task aborted: {0}")]
    BatchAborted(String),
    #[error("run {run_id} already failed: {error}")]
    RunFailed { run_id: String, error: String },
    #[error("pipeline cancelled")]
    Cancelled,
    #[error(transparent)]
    Journal(#[from] JournalError),
}

/// Knobs shared by the pipeline and its batches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    pub batch_size: u64,
    pub request_units_per_item: u64,
    pub throughput_ceiling: u32,
    pub max_shortfall_rounds: u32,
    pub throughput_attempts: u32,
    pub throughput_retry_delay: Duration,
    pub restore_settle: Duration,
    pub lease_heartbeat: Duration,
    pub lease_stale_after: Duration,
    pub target: ContainerSpec,
    pub companions: Vec<String>,
}

impl From<&Config> for PipelineSettings {
    fn from(cfg: &Config) -> Self {
        Self {
            batch_size: cfg.pipeline.batch_size,
            request_units_per_item: cfg.pipeline.request_units_per_item,
            throughput_ceiling: cfg.pipeline.throughput_ceiling,
            max_shortfall_rounds: cfg.pipeline.max_shortfall_rounds,
            throughput_attempts: cfg.pipeline.throughput_attempts,
            throughput_retry_delay: cfg.gateway.default_retry_after(),
            restore_settle: Duration::from_secs(cfg.pipeline.restore_settle_seconds),
            lease_heartbeat: Duration::from_secs(cfg.pipeline.lease_heartbeat_seconds),
            lease_stale_after: Duration::from_secs(cfg.pipeline.lease_stale_seconds),
            target: cfg.containers.target.clone(),
            companions: cfg.containers.companions.clone(),
        }
    }
}

impl PipelineSettings {
    /// Containers whose throughput is bracketed, target first.
    pub fn bracketed_containers(&self) -> Vec<String> {
        let mut ids = vec![self.target.id.clone()];
        for id in &self.companions {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        ids
    }

    pub fn pacing_delay(&self) -> Duration {
        pacing_delay(
            self.request_units_per_item,
            self.batch_size,
            self.throughput_ceiling,
        )
    }
}

/// Spacing between batch launches so a full batch fits under the ceiling:
/// `request_units_per_item * batch_size / throughput_ceiling` seconds.
pub fn pacing_delay(request_units_per_item: u64, batch_size: u64, throughput_ceiling: u32) -> Duration {
    if throughput_ceiling == 0 {
        return Duration::ZERO;
    }
    let units = request_units_per_item as f64 * batch_size as f64;
    Duration::from_secs_f64(units / f64::from(throughput_ceiling))
}

pub fn validate_request(request: &GenerationRequest) -> Result<(), OrchestrationError> {
    if request.total_count == 0 {
        return Err(OrchestrationError::InvalidRequest("total_count must be > 0"));
    }
    if request.code_length == 0 {
        return Err(OrchestrationError::InvalidRequest("code_length must be > 0"));
    }
    if !config::is_valid_identifier(&request.batch) {
        return Err(OrchestrationError::InvalidRequest(
            "batch must be a non-empty identifier",
        ));
    }
    if !config::is_valid_identifier(&request.sequence) {
        return Err(OrchestrationError::InvalidRequest(
            "sequence must be a non-empty identifier",
        ));
    }
    Ok(())
}
