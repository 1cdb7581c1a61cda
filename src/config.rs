//! Configuration loader and validator for the code generation pipeline.
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::model::PartitionKeyPath;

static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*$").expect("valid identifier regex"));

/// Container ids, batch tags and sequence tags share one identifier shape.
pub fn is_valid_identifier(value: &str) -> bool {
    IDENTIFIER.is_match(value)
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    #[serde(default)]
    pub store: Store,
    pub pipeline: Pipeline,
    pub gateway: Gateway,
    pub containers: Containers,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
}

/// Where the checkpoint log and the document store live.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Store {
    #[serde(default)]
    pub database_url: Option<String>,
    /// Autoscale maximum given to containers registered on first start.
    #[serde(default)]
    pub initial_autoscale_max: Option<u32>,
}

/// Batch planning, pacing and throughput bracketing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pipeline {
    pub batch_size: u64,
    pub request_units_per_item: u64,
    pub throughput_ceiling: u32,
    pub max_shortfall_rounds: u32,
    pub throughput_attempts: u32,
    pub restore_settle_seconds: u64,
    /// How often a driving process refreshes its container leases.
    #[serde(default = "default_lease_heartbeat_seconds")]
    pub lease_heartbeat_seconds: u64,
    /// A lease not refreshed for this long belongs to a dead process.
    #[serde(default = "default_lease_stale_seconds")]
    pub lease_stale_seconds: u64,
}

fn default_lease_heartbeat_seconds() -> u64 {
    10
}

fn default_lease_stale_seconds() -> u64 {
    60
}

/// Per-item insert behaviour of the store gateway.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Gateway {
    pub max_insert_retries: u32,
    pub default_retry_after_ms: u64,
    pub max_concurrency: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Containers {
    pub target: ContainerSpec,
    #[serde(default)]
    pub companions: Vec<String>,
}

/// A container and the record field it partitions on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerSpec {
    pub id: String,
    pub partition_key: PartitionKeyPath,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// `DATABASE_URL` wins over `store.database_url`, which wins over the data dir default.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .ok()
            .or_else(|| self.store.database_url.clone())
            .unwrap_or_else(|| format!("sqlite://{}/codegen.db", self.app.data_dir))
    }
}

impl Gateway {
    pub fn default_retry_after(&self) -> Duration {
        Duration::from_millis(self.default_retry_after_ms)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }

    let p = &cfg.pipeline;
    if p.batch_size == 0 {
        return Err(ConfigError::Invalid("pipeline.batch_size must be > 0"));
    }
    if p.throughput_ceiling == 0 {
        return Err(ConfigError::Invalid("pipeline.throughput_ceiling must be > 0"));
    }
    if p.throughput_attempts == 0 {
        return Err(ConfigError::Invalid("pipeline.throughput_attempts must be > 0"));
    }
    if p.lease_heartbeat_seconds == 0 {
        return Err(ConfigError::Invalid("pipeline.lease_heartbeat_seconds must be > 0"));
    }
    if p.lease_stale_seconds <= p.lease_heartbeat_seconds {
        return Err(ConfigError::Invalid(
            "pipeline.lease_stale_seconds must exceed lease_heartbeat_seconds",
        ));
    }

    if cfg.gateway.max_insert_retries == 0 {
        return Err(ConfigError::Invalid("gateway.max_insert_retries must be > 0"));
    }
    if cfg.gateway.max_concurrency == 0 {
        return Err(ConfigError::Invalid("gateway.max_concurrency must be > 0"));
    }

    if !is_valid_identifier(&cfg.containers.target.id) {
        return Err(ConfigError::Invalid(
            "containers.target.id must be a non-empty identifier",
        ));
    }
    if cfg
        .containers
        .companions
        .iter()
        .any(|id| !is_valid_identifier(id))
    {
        return Err(ConfigError::Invalid(
            "containers.companions entries must be non-empty identifiers",
        ));
    }

    Ok(())
}

/// Returns the reference YAML document.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"

store:
  database_url: null
  initial_autoscale_max: 4000

pipeline:
  batch_size: 10000
  request_units_per_item: 23
  throughput_ceiling: 10000
  max_shortfall_rounds: 1
  throughput_attempts: 3
  restore_settle_seconds: 60
  lease_heartbeat_seconds: 10
  lease_stale_seconds: 60

gateway:
  max_insert_retries: 3
  default_retry_after_ms: 1000
  max_concurrency: 256

containers:
  target:
    id: "codes"
    partition_key: value
  companions:
    - "codes-by-batch"
"#
}
