use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use aquatrack_adapters::FixtureFeedClient;
use aquatrack_storage::PgStore;
use aquatrack_sync::{CycleSummary, IngestConfig, IngestionWorker, Stores};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "aquatrack-cli")]
#[command(about = "AquaTrack water-monitoring ingestion")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Poll the feed every interval until interrupted.
    Run,
    /// Run a single ingestion cycle.
    Once {
        /// Replay a saved feed response instead of calling the live service.
        #[arg(long)]
        fixture: Option<PathBuf>,
        /// Print the cycle summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Apply database migrations.
    Migrate,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

async fn connect(config: &IngestConfig) -> Result<Arc<PgStore>> {
    let store = PgStore::connect(&config.database_url, config.db_max_connections)
        .await
        .context("connecting to database")?;
    Ok(Arc::new(store))
}

fn print_summary(summary: &CycleSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }
    println!(
        "ingest complete: run_id={} series={} new_sensors={} written={} duplicates={} \
         dropped={} watermark={}",
        summary.run_id,
        summary.series,
        summary.new_sensors,
        summary.written,
        summary.duplicates,
        summary.dropped_points,
        summary
            .watermark
            .map(|w| w.to_rfc3339())
            .unwrap_or_else(|| "-".to_string()),
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();
    let config = IngestConfig::from_env();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let store = connect(&config).await?;
            let worker = IngestionWorker::usgs(config, Stores::shared(store))?;

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("shutdown requested");
                    on_signal.cancel();
                }
            });

            worker.run(cancel).await;
        }
        Commands::Once { fixture, json } => {
            let store = connect(&config).await?;
            let stores = Stores::shared(store);
            let worker = match fixture {
                Some(path) => {
                    IngestionWorker::new(config, Arc::new(FixtureFeedClient::new(path)), stores)
                }
                None => IngestionWorker::usgs(config, stores)?,
            };
            let summary = worker.run_cycle(&CancellationToken::new()).await?;
            print_summary(&summary, json)?;
        }
        Commands::Migrate => {
            let store = connect(&config).await?;
            store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
    }

    Ok(())
}
