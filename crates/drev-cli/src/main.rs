use anyhow::Result;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use drev_storage::RecordStore;
use drev_sync::{open_store, SourceRegistry, SyncConfig};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "drev")]
#[command(about = "Dialog recording ingestion and review")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync over every enabled source and print the reports.
    Sync,
    Migrate,
    /// Serve the HTTP API, with the cron scheduler when enabled.
    Serve,
    /// List the configured sources.
    Sources,
    /// Delete the records of one source for one calendar day.
    Purge {
        #[arg(long)]
        source: String,
        #[arg(long)]
        date: NaiveDate,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,sqlx=warn")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let reports = drev_sync::run_sync_once_from_env().await?;
            for report in &reports {
                println!(
                    "{}: outcome={} seen={} written={} skipped={} rejected={} write_failures={}",
                    report.source_id,
                    report.outcome.as_str(),
                    report.candidates_seen,
                    report.written,
                    report.skipped_known,
                    report.rejected,
                    report.write_failures
                );
            }
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let store = open_store(&config).await?;
            store.close().await;
            println!("migrations applied to {}", config.database_url);
        }
        Commands::Serve => {
            drev_web::serve_from_env().await?;
        }
        Commands::Sources => {
            let config = SyncConfig::from_env();
            let registry = SourceRegistry::load(&config.workspace_root).await?;
            for source in &registry.sources {
                println!(
                    "{}\t{}\t{}\t{}",
                    source.source_id,
                    if source.enabled { "enabled" } else { "disabled" },
                    source.grammar,
                    source.resolved_root(|name| std::env::var(name).ok())
                );
            }
        }
        Commands::Purge { source, date } => {
            let config = SyncConfig::from_env();
            let store = open_store(&config).await?;
            let removed = store.delete_by_date(&source, date).await?;
            info!(source_id = %source, %date, removed, "purged records");
            println!("removed {removed} records for {source} on {date}");
            store.close().await;
        }
    }

    Ok(())
}
