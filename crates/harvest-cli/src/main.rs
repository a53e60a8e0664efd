use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use harvest_sync::{maybe_build_scheduler, HarvestPipeline, SyncConfig};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "harvest-cli")]
#[command(about = "Dataset metadata harvester command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Harvest every due repository once, or run on the cron schedule when enabled.
    Sync,
    /// Create the database and register the repositories of the registry file.
    Init,
    /// Remove soft-deleted records for good.
    Purge,
    /// List records the next refresh pass would revisit.
    Stale,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let pipeline = HarvestPipeline::new(SyncConfig::from_env()).await?;

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            if pipeline.config().scheduler_enabled {
                run_scheduled(Arc::new(pipeline)).await?;
            } else {
                let summary = pipeline.run_once().await?;
                println!(
                    "sync complete: run_id={} harvested={} created={} updated={} deleted={} reports={}",
                    summary.run_id,
                    summary.harvested(),
                    summary.total(|r| r.created),
                    summary.total(|r| r.updated),
                    summary.total(|r| r.deleted),
                    summary.reports_dir
                );
            }
        }
        Commands::Init => {
            let repositories = pipeline.register_repositories().await?;
            println!(
                "database ready at {} (schema v{}), {} repositories registered",
                pipeline.config().database_path.display(),
                harvest_storage::DB_VERSION,
                repositories.len()
            );
            for stored in repositories {
                println!(
                    "  {:>4} {} enabled={} last_crawl={} items={}",
                    stored.repository_id,
                    stored.repository.url,
                    stored.repository.enabled,
                    stored.last_crawl_timestamp,
                    stored.item_count
                );
            }
        }
        Commands::Purge => {
            let purged = pipeline.purge_deleted().await?;
            println!("purged {purged} deleted records");
        }
        Commands::Stale => {
            for (stored, stale) in pipeline.stale_records().await? {
                println!("{} ({} stale)", stored.repository.url, stale.len());
                for record in stale {
                    println!("  {} modified={}", record.local_identifier, record.modified_timestamp);
                }
            }
        }
    }

    Ok(())
}

async fn run_scheduled(pipeline: Arc<HarvestPipeline>) -> Result<()> {
    let cron = pipeline.config().sync_cron.clone();
    let Some(mut sched) = maybe_build_scheduler(pipeline).await? else {
        return Ok(());
    };
    sched.start().await.context("starting scheduler")?;
    info!(%cron, "scheduler running; ctrl-c to stop");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}
