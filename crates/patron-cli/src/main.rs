use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use patron_storage::SponsorStore;
use patron_sync::{start_scheduler, SyncConfig, SyncOrchestrator};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "patron-cli")]
#[command(about = "Sponsor synchronization service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP server and the recurring sync job.
    Serve,
    /// Run one synchronization pass and exit.
    Sync,
    /// Verify the upstream credentials and signing scheme.
    Ping,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env()?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await?,
        Commands::Sync => {
            let store = open_store(&config).await?;
            let client = config.client()?;
            let orchestrator = SyncOrchestrator::new(Arc::new(client), store);
            match orchestrator.run().await {
                Some(summary) => println!(
                    "sync complete: pages={} synced={} skipped={} completed={} elapsed={}ms",
                    summary.pages_fetched,
                    summary.synced,
                    summary.skipped,
                    summary.completed,
                    summary.elapsed().num_milliseconds()
                ),
                None => println!("sync already in progress"),
            }
        }
        Commands::Ping => {
            let client = config.client()?;
            let data = client.ping().await.context("upstream ping failed")?;
            println!("pong: {data}");
        }
    }

    Ok(())
}

async fn open_store(config: &SyncConfig) -> Result<SponsorStore> {
    let store = SponsorStore::connect(&config.database_url)
        .await
        .with_context(|| format!("opening database {}", config.database_url))?;
    store.setup_schema().await.context("preparing database schema")?;
    Ok(store)
}

async fn serve(config: SyncConfig) -> Result<()> {
    let store = open_store(&config).await?;
    let client = config.client()?;
    let orchestrator = Arc::new(SyncOrchestrator::new(Arc::new(client), store.clone()));
    let mut scheduler = start_scheduler(orchestrator, &config.sync_cron).await?;

    let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3000);

    patron_web::serve(store, &host, port, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
    })
    .await?;

    scheduler.shutdown().await.context("stopping scheduler")?;
    info!("service stopped");
    Ok(())
}
