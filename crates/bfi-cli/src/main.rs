use anyhow::{Context, Result};
use bfi_storage::{InspectionStore, PgStore};
use bfi_sync::SyncConfig;
use bfi_web::ServerConfig;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "bfi-cli")]
#[command(about = "Boston food inspections sync and API")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch the trailing window of inspections and upsert them.
    Sync {
        /// Days to look back; defaults to SYNC_DAYS_BACK.
        days: Option<u32>,
    },
    /// Create tables and indexes if they do not exist.
    InitDb,
    /// Serve the JSON API and the dashboard front end.
    Serve,
}

fn init_tracing(default_filter: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {}", e))
}

#[tokio::main]
async fn main() -> Result<()> {
    let dotenv_path = bfi_sync::load_dotenv();
    init_tracing("info")?;
    if let Some(path) = dotenv_path {
        info!(path = %path.display(), "loaded environment file");
    }

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync { days: None }) {
        Commands::Sync { days } => {
            let report = bfi_sync::run_sync_once_from_env(days).await?;
            println!(
                "sync complete: run_id={} days={} fetched={} inserted={} updated={} skipped={}",
                report.run_id,
                report.days_back,
                report.counts.fetched,
                report.counts.inserted,
                report.counts.updated,
                report.skipped
            );
        }
        Commands::InitDb => {
            let config = SyncConfig::from_env();
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to inspections database")?;
            store.ensure_schema().await?;
            println!("database schema ready");
        }
        Commands::Serve => {
            let sync_config = SyncConfig::from_env();
            let scheduler = bfi_sync::maybe_build_scheduler(&sync_config).await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
            }
            bfi_web::serve(&ServerConfig::from_env()).await?;
        }
    }

    Ok(())
}
