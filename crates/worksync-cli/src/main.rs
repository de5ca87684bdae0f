use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use worksync_storage::{
    connect_with_retry, run_migrations, wait_for_schema, BackoffPolicy, MemoryWorkStore, PgWorkStore, WorkStore,
};
use worksync_sync::{maybe_build_scheduler, SyncConfig, SyncService, TriggerOutcome, TriggerSource};
use worksync_web::WebConfig;

const SCHEMA_POLL_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Debug, Parser)]
#[command(name = "worksync")]
#[command(about = "Works catalog sync worker")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the startup pass, the cron schedule and the trigger endpoint.
    Serve,
    /// Run a single pass in the foreground.
    Sync {
        /// Write to an in-memory store instead of Postgres.
        #[arg(long)]
        dry_run: bool,
    },
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await?,
        Commands::Sync { dry_run } => {
            let store: Arc<dyn WorkStore> = if dry_run {
                Arc::new(MemoryWorkStore::new())
            } else {
                Arc::new(connect_store(&config).await?)
            };
            let service = SyncService::from_config(&config, store)?;
            let report = service.run_now(TriggerSource::Cli).await?;
            println!(
                "sync complete: run_id={} attempted={} succeeded={} failed={} inserted={} updated={} seeded={}",
                report.run_id,
                report.attempted,
                report.succeeded,
                report.failed,
                report.inserted,
                report.updated,
                report.seeded
            );
        }
        Commands::Migrate => {
            let pool = connect_with_retry(&config.database_url, backoff(&config)).await?;
            run_migrations(&pool).await.context("applying migrations")?;
            info!("migrations applied");
        }
    }

    Ok(())
}

async fn serve(config: SyncConfig) -> Result<()> {
    let web = WebConfig::from_env();
    let store = connect_store(&config).await?;
    let service = SyncService::from_config(&config, Arc::new(store))?;

    if config.run_on_startup {
        match service.trigger(TriggerSource::Startup) {
            TriggerOutcome::Accepted(ticket) => info!(run_id = %ticket.run_id, "startup sync started"),
            TriggerOutcome::AlreadyRunning => warn!("startup sync skipped; a pass is already running"),
        }
    }

    let scheduler = maybe_build_scheduler(service.clone(), &config).await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
        info!(cron = %config.sync_cron, "scheduler started");
    }

    worksync_web::serve(&web, service).await
}

async fn connect_store(config: &SyncConfig) -> Result<PgWorkStore> {
    let pool = connect_with_retry(&config.database_url, backoff(config)).await?;
    wait_for_schema(&pool, config.schema_wait_attempts, SCHEMA_POLL_INTERVAL).await;
    Ok(PgWorkStore::new(pool))
}

fn backoff(config: &SyncConfig) -> BackoffPolicy {
    BackoffPolicy {
        max_attempts: config.db_connect_attempts,
        ..BackoffPolicy::default()
    }
}
