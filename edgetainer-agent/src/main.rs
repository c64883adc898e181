//! Edgetainer agent
//!
//! Entry point: load configuration, start the tunnel client, run until
//! interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use edgetainer_agent::commands::{ContainerRuntime, NullRuntime};
use edgetainer_agent::config::Config;
use edgetainer_agent::TunnelClient;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "edgetainer-agent", version, about = "Edgetainer device agent")]
struct Cli {
    /// Path to the agent configuration file
    #[arg(short, long, default_value = "/etc/edgetainer/agent.toml")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.debug {
        "edgetainer_agent=debug,edgetainer_protocol=debug,info"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    if let Err(e) = run(cli).await {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(&cli.config)?;
    info!(
        device_id = %config.device.id,
        server = %config.server_addr(),
        "starting agent"
    );

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(NullRuntime);
    let client = TunnelClient::new(config, runtime).context("Tunnel client setup failed")?;

    client.connect().await;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("shutting down");
    client.disconnect().await;

    Ok(())
}
