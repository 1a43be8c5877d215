//! The Palaver hub server binary.
//!
//! Configuration is loaded from (in order, later wins):
//! 1. Compiled defaults
//! 2. /etc/palaver/config.toml
//! 3. ~/.config/palaver/config.toml
//! 4. ./palaver.toml (or --config path)
//! 5. Environment variables (HUB_PORT, LOG_LEVEL, ...)

use anyhow::{Context, Result};
use clap::Parser;
use palaver::lifecycle::{self, CleanupRegistry};
use palaver::HubServer;
use palaverconf::Config;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

/// Correlating websocket hub between tool clients and a browser automator
#[derive(Parser, Debug)]
#[command(name = "palaver")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to config file (overrides ./palaver.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Show loaded configuration and exit
    #[arg(long)]
    show_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (config, sources) = Config::load_with_sources_from(cli.config.as_deref())
        .context("Failed to load configuration")?;

    if cli.show_config {
        println!("# Configuration sources:");
        for path in &sources.files {
            println!("#   - {}", path.display());
        }
        if !sources.env_overrides.is_empty() {
            println!("# Environment overrides:");
            for var in &sources.env_overrides {
                println!("#   - {}", var);
            }
        }
        println!();
        println!("{}", config.to_toml());
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.tracing_directive())),
        )
        .init();

    info!("Configuration loaded from:");
    for path in &sources.files {
        info!("   - {}", path.display());
    }
    if !sources.env_overrides.is_empty() {
        info!("   Environment overrides: {:?}", sources.env_overrides);
    }

    let health_port = config.health_port;
    let parent_pid = config.parent_pid;

    let server = HubServer::bind(config).await.map_err(|e| {
        anyhow::anyhow!("{} (code {})", e, e.code())
    })?;
    let hub = server.hub();
    let cancel = server.cancel_token();

    if let Some(port) = health_port {
        let hub = hub.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = palaver::health::serve(hub, port, cancel).await {
                tracing::error!(error = %e, "health endpoint failed");
            }
        });
    }

    if let Some(pid) = parent_pid {
        lifecycle::spawn_parent_watcher(pid, cancel.clone());
    }

    let cleanup = CleanupRegistry::new();
    cleanup.register("hub-drain", move || async move {
        server.shutdown().await;
    });

    // Wait for a signal or for the parent watcher to pull the plug.
    tokio::select! {
        _ = lifecycle::shutdown_signal() => {}
        _ = cancel.cancelled() => {
            info!("shutdown requested internally");
        }
    }

    cleanup.run_all(Duration::from_secs(35)).await;

    info!("Shutdown complete");
    Ok(())
}
