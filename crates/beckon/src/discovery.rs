//! Hub discovery: connect to an existing hub or bring one up in-process.
//!
//! The first client on a host transparently becomes the hub owner; everyone
//! else joins it. The losing side of a bind race falls back to connecting
//! with a longer timeout. Orphaned hubs from a previous owner look exactly
//! like an existing hub and are simply joined.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use palaver::HubServer;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

use crate::BeckonConfig;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connect with a deadline.
pub async fn try_connect(url: &str, timeout: Duration) -> Result<WsStream> {
    let (ws, _response) = tokio::time::timeout(timeout, connect_async(url))
        .await
        .map_err(|_| anyhow!("connect to {} timed out after {:?}", url, timeout))?
        .with_context(|| format!("connect to {} failed", url))?;
    Ok(ws)
}

/// Try the well-known port, start an embedded hub on refusal, and if the
/// bind races with another starter, go back to connecting with a longer
/// timeout.
pub async fn connect_or_start(
    config: &BeckonConfig,
    embedded: &mut Option<HubServer>,
) -> Result<WsStream> {
    let url = format!("ws://127.0.0.1:{}", config.hub_port);

    if !config.force_hub_creation {
        match try_connect(&url, config.connect_timeout).await {
            Ok(ws) => {
                debug!(url = %url, "joined existing hub");
                return Ok(ws);
            }
            Err(e) => debug!(url = %url, error = %e, "no hub answered"),
        }
    }

    if !config.start_embedded {
        return Err(anyhow!(
            "no hub is listening on port {} and embedded startup is disabled",
            config.hub_port
        ));
    }

    // A previously-started embedded hub that no longer answers is dead
    // weight; drop it before rebinding.
    if let Some(old) = embedded.take() {
        debug!("discarding stale embedded hub");
        old.shutdown().await;
    }

    let mut hub_config = config.hub_config.clone();
    hub_config.hub_port = config.hub_port;

    match HubServer::bind(hub_config).await {
        Ok(server) => {
            info!(port = server.port(), "started embedded hub");
            *embedded = Some(server);
        }
        Err(e) if e.is_addr_in_use() => {
            // Lost the startup race; someone else owns the port now.
            debug!(port = config.hub_port, "bind race lost, retrying connect");
            return try_connect(&url, config.retry_connect_timeout)
                .await
                .with_context(|| port_diagnostic(config.hub_port));
        }
        Err(e) => {
            return Err(anyhow::Error::new(e)).context("failed to start embedded hub");
        }
    }

    try_connect(&url, config.connect_timeout)
        .await
        .context("embedded hub started but did not answer")
}

/// Best-effort description of what owns the port, for the terminal failure
/// message.
fn port_diagnostic(port: u16) -> String {
    let probe = std::net::TcpStream::connect_timeout(
        &std::net::SocketAddr::from(([127, 0, 0, 1], port)),
        Duration::from_millis(500),
    );
    match probe {
        Ok(_) => format!(
            "port {} is owned by a process that accepts TCP but does not speak the hub protocol",
            port
        ),
        Err(e) => format!("port {} is in use but unreachable: {}", port, e),
    }
}
