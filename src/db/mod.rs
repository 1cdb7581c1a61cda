//! Database module: checkpoint-log entities and SQL repositories.
//!
//! - `model`: typed rows for runs and their statuses.
//! - `repo`: SQL-only functions over runs, steps and container leases.
//!
//! The repository API is re-exported at `crate::db::*`.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{RunKind, RunRecord, RunStatus};
