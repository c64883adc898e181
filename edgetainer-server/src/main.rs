//! Edgetainer server
//!
//! Entry point: load configuration, bootstrap the host key and device
//! directory, start the tunnel endpoint and the reverse proxy, and run until
//! interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use edgetainer_server::config::Config;
use edgetainer_server::directory::DeviceDirectory;
use edgetainer_server::proxy::{DeviceStreams, ProxyServer};
use edgetainer_server::tunnel::TunnelServer;
use edgetainer_server::{directory, hostkey};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "edgetainer-server", version, about = "Edgetainer fleet server")]
struct Cli {
    /// Path to the server configuration file
    #[arg(short, long, default_value = "/etc/edgetainer/server.toml")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.debug {
        "edgetainer_server=debug,edgetainer_protocol=debug,info"
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

    let host_key = hostkey::load_or_generate(&config.ssh.host_key_path)
        .context("Host key bootstrap failed")?;

    let directory = Arc::new(
        directory::open(
            &config.directory.path,
            config.directory.authorized_keys_dir.clone(),
        )
        .context("Device directory load failed")?,
    );
    info!(
        devices = directory.len().await,
        path = %config.directory.path.display(),
        "device directory loaded"
    );

    let directory_dyn = Arc::clone(&directory) as Arc<dyn DeviceDirectory>;
    let tunnel = Arc::new(TunnelServer::new(
        &config,
        host_key,
        Arc::clone(&directory_dyn),
    ));
    tunnel.start().await.context("Tunnel endpoint start failed")?;

    let proxy = if config.proxy.enabled {
        let streams = Arc::clone(&tunnel) as Arc<dyn DeviceStreams>;
        let proxy = Arc::new(ProxyServer::new(
            config.proxy.clone(),
            directory_dyn,
            streams,
            config.ssh.channel_idle(),
        ));
        proxy.start().await.context("Proxy start failed")?;
        Some(proxy)
    } else {
        None
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("shutting down");

    if let Some(proxy) = &proxy {
        proxy.shutdown().await;
    }
    tunnel.shutdown().await;

    info!("shutdown complete");
    Ok(())
}
