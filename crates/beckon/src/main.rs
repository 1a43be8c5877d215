//! beckon - hub client CLI for the Palaver system
//!
//! Subcommands:
//! - `beckon ping` - Measure the welcome round trip against a hub
//! - `beckon send <tool> [params]` - Send one tool request and print the result
//! - `beckon wait <operation-id>` - Block until an operation is terminal
//!
//! Configuration is loaded from (in order, later wins):
//! 1. Compiled defaults
//! 2. /etc/palaver/config.toml
//! 3. ~/.config/palaver/config.toml
//! 4. ./palaver.toml (or --config path)
//! 5. Environment variables (HUB_PORT, LOG_LEVEL, ...)

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use palaverconf::Config;
use palaverproto::{ClientInfo, Frame};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use beckon::{discovery, Beckon, BeckonConfig};

/// Hub client CLI for Palaver
#[derive(Parser)]
#[command(name = "beckon")]
#[command(about = "Hub client CLI for the Palaver system")]
#[command(version)]
struct Cli {
    /// Path to config file (overrides ./palaver.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Test connectivity to a hub
    ///
    /// Example: beckon ping --port 54321
    Ping {
        /// Hub port (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Timeout in milliseconds
        #[arg(short, long, default_value = "5000")]
        timeout: u64,
    },

    /// Send one tool request and print the response
    Send {
        /// Tool name (e.g. tab_create)
        tool: String,

        /// JSON params (defaults to {})
        params: Option<String>,

        /// Timeout in milliseconds
        #[arg(short, long, default_value = "30000")]
        timeout: u64,
    },

    /// Wait for an operation to reach a terminal state
    Wait {
        /// Operation id
        operation_id: String,

        /// Timeout in milliseconds
        #[arg(short, long, default_value = "30000")]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (config, _sources) = Config::load_with_sources_from(cli.config.as_deref())
        .context("Failed to load configuration")?;

    // stdout carries command output; logs go to stderr.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.tracing_directive())),
        )
        .init();

    match cli.command {
        Commands::Ping { port, timeout } => {
            ping(port.unwrap_or(config.hub_port), timeout).await?;
        }
        Commands::Send {
            tool,
            params,
            timeout,
        } => {
            let params = match params {
                Some(raw) => serde_json::from_str(&raw).context("params is not valid JSON")?,
                None => serde_json::json!({}),
            };
            let client = connect(&config).await?;
            let result = client
                .request_with_timeout(&tool, params, Duration::from_millis(timeout))
                .await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            client.shutdown().await;
        }
        Commands::Wait {
            operation_id,
            timeout,
        } => {
            let client = connect(&config).await?;
            let record = client.wait_for_operation(&operation_id, timeout).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            client.shutdown().await;
        }
    }

    Ok(())
}

async fn connect(config: &Config) -> Result<Beckon> {
    let client_info = ClientInfo::named("beckon-cli").with_id(format!(
        "beckon-cli-{}",
        std::process::id()
    ));
    Beckon::connect(BeckonConfig::from_config(config, client_info)).await
}

/// Connect raw and time the welcome frame; does not register.
async fn ping(port: u16, timeout_ms: u64) -> Result<()> {
    let url = format!("ws://127.0.0.1:{}", port);
    let start = Instant::now();
    let mut ws = discovery::try_connect(&url, Duration::from_millis(timeout_ms)).await?;

    while let Some(msg) = ws.next().await {
        if let Ok(WsMessage::Text(text)) = msg {
            if let Ok(frame) = Frame::parse(text.as_str()) {
                if frame.frame_type() == "welcome" {
                    let elapsed = start.elapsed();
                    let hub = frame.get("hub").cloned().unwrap_or_default();
                    println!("welcome in {:?}", elapsed);
                    println!("hub: {}", serde_json::to_string_pretty(&hub)?);
                    return Ok(());
                }
            }
        }
    }

    Err(anyhow!("connection closed before welcome"))
}
