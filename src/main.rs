use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use codegen_pipeline::config::{self, Config};
use codegen_pipeline::db::{self, RunStatus};
use codegen_pipeline::model::GenerationRequest;
use codegen_pipeline::service::PipelineService;
use codegen_pipeline::store::SqliteDocumentStore;

#[derive(Debug, Parser)]
#[command(author, version, about = "Generate unique codes into the document store")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Submit a generation request and wait for the pipeline to finish
    Generate {
        /// Number of codes to generate
        #[arg(long)]
        count: u64,
        /// Length of each code
        #[arg(long, default_value = "9")]
        length: usize,
        /// Batch tag; generated from the current time when omitted
        #[arg(long, default_value = "")]
        batch: String,
        /// Sequence tag
        #[arg(long)]
        sequence: String,
    },
    /// Show a run and its batches
    Status {
        run_id: String,
    },
    /// Print the reference configuration
    ExampleConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    if let Command::ExampleConfig = args.command {
        print!("{}", config::example());
        return Ok(());
    }

    let cfg = config::load(Some(&args.config))
        .with_context(|| format!("loading {}", args.config.display()))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;
    let store = SqliteDocumentStore::new(pool.clone());
    register_containers(&store, &cfg).await?;
    let service = PipelineService::from_config(pool, Arc::new(store.clone()), &cfg);

    match args.command {
        Command::Generate {
            count,
            length,
            batch,
            sequence,
        } => {
            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; cancelling pipeline");
                    on_signal.cancel();
                }
            });

            let request = GenerationRequest {
                total_count: count,
                code_length: length,
                batch,
                sequence,
            };
            let accepted = service.submit(request, cancel).await?;
            info!(run_id = %accepted.run_id, batch = %accepted.request.batch, "run started");

            match accepted.handle.await? {
                Ok(report) => {
                    let stored = store.count_items(&cfg.containers.target.id).await?;
                    info!(
                        run_id = %report.run_id,
                        requested = report.requested,
                        inserted = report.inserted,
                        stored,
                        "generation finished"
                    );
                    println!("{}", serde_json::to_string_pretty(&report)?);
                }
                Err(err) => {
                    error!(run_id = %accepted.run_id, error = %err, "generation failed");
                    return Err(err.into());
                }
            }
        }
        Command::Status { run_id } => match service.status(&run_id).await? {
            Some(summary) => {
                println!(
                    "run {} [{}] created {}",
                    summary.run.run_id,
                    summary.run.status.as_str(),
                    summary.run.created_at
                );
                println!(
                    "batches: {} completed, {} failed, {} running",
                    summary.count_batches(RunStatus::Completed),
                    summary.count_batches(RunStatus::Failed),
                    summary.count_batches(RunStatus::Running)
                );
                if let Some(err) = &summary.run.error {
                    println!("error: {err}");
                }
                let stored = store.count_items(&cfg.containers.target.id).await?;
                println!("codes in '{}': {}", cfg.containers.target.id, stored);
            }
            None => println!("run {run_id} not found"),
        },
        Command::ExampleConfig => {}
    }

    Ok(())
}

async fn register_containers(store: &SqliteDocumentStore, cfg: &Config) -> Result<()> {
    let mut ids = vec![cfg.containers.target.id.as_str()];
    ids.extend(cfg.containers.companions.iter().map(String::as_str));
    for id in ids {
        store
            .register_container(id, cfg.store.initial_autoscale_max)
            .await
            .with_context(|| format!("registering container {id}"))?;
    }
    Ok(())
}
