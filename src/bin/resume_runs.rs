use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use codegen_pipeline::config;
use codegen_pipeline::db;
use codegen_pipeline::service::PipelineService;
use codegen_pipeline::store::SqliteDocumentStore;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Resume pipeline runs left behind by a crashed or killed process and exit when they finish",
    long_about = "Resume pipeline runs left behind by a crashed or killed process and exit when they finish.\n\n\
                  A run whose container leases were refreshed within pipeline.lease_stale_seconds \
                  is still being driven and is skipped."
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))
        .with_context(|| format!("loading {}", args.config.display()))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;
    let store = SqliteDocumentStore::new(pool.clone());
    let service = PipelineService::from_config(pool, Arc::new(store), &cfg);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling resumed runs");
            on_signal.cancel();
        }
    });

    let handles = service.resume_incomplete(cancel).await?;
    if handles.is_empty() {
        info!("No incomplete runs, exiting");
        return Ok(());
    }
    info!(runs = handles.len(), "resuming incomplete runs");

    let mut failed = 0usize;
    for (run_id, handle) in handles {
        match handle.await {
            Ok(Ok(report)) => info!(
                run_id = %run_id,
                requested = report.requested,
                inserted = report.inserted,
                "resumed run finished"
            ),
            Ok(Err(err)) => {
                failed += 1;
                error!(run_id = %run_id, error = %err, "resumed run failed");
            }
            Err(err) => {
                failed += 1;
                error!(run_id = %run_id, error = %err, "resumed run task panicked");
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{failed} resumed run(s) failed");
    }
    Ok(())
}
