use super::model::{RunKind, RunRecord, RunStatus};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use sqlx::SqlitePool;
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized)
        .await
        .with_context(|| format!("failed to open database {}", normalized))?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// Single-connection in-memory database with migrations applied.
///
/// Every connection to `sqlite::memory:` is its own database, so the pool is
/// capped at one connection.
pub async fn memory_pool() -> Result<Pool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/`, ensure the parent
/// directory exists and ask SQLite to create the file. In-memory URLs pass through.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);

    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };

    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    match query_part {
        Some(q) => {
            rebuilt.push('?');
            rebuilt.push_str(q);
        }
        None => rebuilt.push_str("?mode=rwc"),
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn run_from_row(row: &SqliteRow) -> Result<RunRecord> {
    let kind: String = row.get("kind");
    let status: String = row.get("status");
    Ok(RunRecord {
        run_id: row.get("run_id"),
        parent_id: row.get("parent_id"),
        kind: RunKind::parse_kind(&kind).ok_or_else(|| anyhow!("unknown run kind {}", kind))?,
        input: row.get("input"),
        status: RunStatus::parse_status(&status)
            .ok_or_else(|| anyhow!("unknown run status {}", status))?,
        output: row.get("output"),
        error: row.get("error"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

/// Insert a run in `running` state. Returns false if the run already exists.
#[instrument(skip_all)]
pub async fn create_run(
    pool: &Pool,
    run_id: &str,
    parent_id: Option<&str>,
    kind: RunKind,
    input: &str,
) -> Result<bool> {
    let now = Utc::now();
    let done = sqlx::query(
        "INSERT INTO runs (run_id, parent_id, kind, input, status, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?) ON CONFLICT(run_id) DO NOTHING",
    )
    .bind(run_id)
    .bind(parent_id)
    .bind(kind.as_str())
    .bind(input)
    .bind(RunStatus::Running.as_str())
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(done.rows_affected() == 1)
}

#[instrument(skip_all)]
pub async fn get_run(pool: &Pool, run_id: &str) -> Result<Option<RunRecord>> {
    let row = sqlx::query("SELECT * FROM runs WHERE run_id = ?")
        .bind(run_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(run_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn list_runs(pool: &Pool, kind: RunKind, status: RunStatus) -> Result<Vec<RunRecord>> {
    let rows = sqlx::query("SELECT * FROM runs WHERE kind = ? AND status = ? ORDER BY created_at ASC")
        .bind(kind.as_str())
        .bind(status.as_str())
        .fetch_all(pool)
        .await?;
    rows.iter().map(run_from_row).collect()
}

#[instrument(skip_all)]
pub async fn list_child_runs(pool: &Pool, parent_id: &str) -> Result<Vec<RunRecord>> {
    let rows = sqlx::query("SELECT * FROM runs WHERE parent_id = ? ORDER BY run_id ASC")
        .bind(parent_id)
        .fetch_all(pool)
        .await?;
    rows.iter().map(run_from_row).collect()
}

#[instrument(skip_all)]
pub async fn complete_run(pool: &Pool, run_id: &str, output: &str) -> Result<()> {
    finish_run(pool, run_id, RunStatus::Completed, Some(output), None).await
}

#[instrument(skip_all)]
pub async fn fail_run(pool: &Pool, run_id: &str, error: &str) -> Result<()> {
    finish_run(pool, run_id, RunStatus::Failed, None, Some(error)).await
}

async fn finish_run(
    pool: &Pool,
    run_id: &str,
    status: RunStatus,
    output: Option<&str>,
    error: Option<&str>,
) -> Result<()> {
    let done = sqlx::query(
        "UPDATE runs SET status = ?, output = ?, error = ?, updated_at = ? WHERE run_id = ?",
    )
    .bind(status.as_str())
    .bind(output)
    .bind(error)
    .bind(Utc::now())
    .bind(run_id)
    .execute(pool)
    .await?;
    if done.rows_affected() == 0 {
        return Err(anyhow!("run {} not found", run_id));
    }
    Ok(())
}

#[instrument(skip_all)]
pub async fn load_step(pool: &Pool, run_id: &str, step_key: &str) -> Result<Option<String>> {
    let output = sqlx::query_scalar::<_, String>(
        "SELECT output FROM steps WHERE run_id = ? AND step_key = ?",
    )
    .bind(run_id)
    .bind(step_key)
    .fetch_optional(pool)
    .await?;
    Ok(output)
}

/// Record a completed step. A step that is already recorded keeps its first output.
#[instrument(skip_all)]
pub async fn record_step(pool: &Pool, run_id: &str, step_key: &str, output: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO steps (run_id, step_key, output, completed_at) VALUES (?, ?, ?, ?) \
         ON CONFLICT(run_id, step_key) DO NOTHING",
    )
    .bind(run_id)
    .bind(step_key)
    .bind(output)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn count_steps(pool: &Pool, run_id: &str) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM steps WHERE run_id = ?")
        .bind(run_id)
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// Try to take the throughput lease on `container` for `run_id`.
/// Returns the run currently holding it, which equals `run_id` on success.
#[instrument(skip_all)]
pub async fn acquire_lease(pool: &Pool, container: &str, run_id: &str) -> Result<String> {
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO container_leases (container, run_id, acquired_at, heartbeat_at) VALUES (?, ?, ?, ?) \
         ON CONFLICT(container) DO NOTHING",
    )
    .bind(container)
    .bind(run_id)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;
    let holder: String =
        sqlx::query_scalar("SELECT run_id FROM container_leases WHERE container = ?")
            .bind(container)
            .fetch_one(pool)
            .await?;
    Ok(holder)
}

/// Release the lease only if `run_id` holds it.
#[instrument(skip_all)]
pub async fn release_lease(pool: &Pool, container: &str, run_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM container_leases WHERE container = ? AND run_id = ?")
        .bind(container)
        .bind(run_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Stamp every lease held by `run_id` as alive at `at`. Returns the number of leases touched.
#[instrument(skip_all)]
pub async fn heartbeat_leases(pool: &Pool, run_id: &str, at: DateTime<Utc>) -> Result<u64> {
    let done = sqlx::query("UPDATE container_leases SET heartbeat_at = ? WHERE run_id = ?")
        .bind(at)
        .bind(run_id)
        .execute(pool)
        .await?;
    Ok(done.rows_affected())
}

/// Most recent heartbeat across the leases held by `run_id`, if it holds any.
#[instrument(skip_all)]
pub async fn last_heartbeat(pool: &Pool, run_id: &str) -> Result<Option<DateTime<Utc>>> {
    let beats: Vec<DateTime<Utc>> =
        sqlx::query_scalar("SELECT heartbeat_at FROM container_leases WHERE run_id = ?")
            .bind(run_id)
            .fetch_all(pool)
            .await?;
    Ok(beats.into_iter().max())
}
