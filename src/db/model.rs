//! Rows of the orchestration checkpoint log.
//!
//! Keep these focused on what queries return; replay logic lives in `journal`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RunKind {
    Pipeline,
    Batch,
}

impl RunKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunKind::Pipeline => "pipeline",
            RunKind::Batch => "batch",
        }
    }

    pub fn parse_kind(value: &str) -> Option<Self> {
        match value {
            "pipeline" => Some(RunKind::Pipeline),
            "batch" => Some(RunKind::Batch),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse_status(value: &str) -> Option<Self> {
        match value {
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

/// One orchestration instance, parent or child.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub run_id: String,
    pub parent_id: Option<String>,
    pub kind: RunKind,
    pub input: String,
    pub status: RunStatus,
    pub output: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
