//! Horde scheduler server entrypoint.

use clap::Parser;
use horde_server::telemetry::init_tracing;
use horde_server::{Server, ServerConfig};
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::info;

#[derive(Parser)]
#[command(name = "horde-server")]
#[command(author, version, about = "Horde build scheduler", long_about = None)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Emit logs as JSON.
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::default(),
    };
    if cli.json_logs {
        config.logging.format = horde_server::config::LogFormat::Json;
    }
    init_tracing(&config.logging)?;

    let server = Server::build(&config).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
        }
        let _ = shutdown_tx.send(true);
    });

    info!(version = env!("CARGO_PKG_VERSION"), "Horde scheduler started");
    server.run(shutdown_rx).await;
    info!("Horde scheduler stopped");
    Ok(())
}
