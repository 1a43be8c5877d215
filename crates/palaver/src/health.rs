//! HTTP health endpoint on the port adjacent to the hub.
//!
//! Enabled only when `HEALTH_PORT` is configured. Serves a single JSON
//! summary; anything richer belongs to the clients' own observability.

use std::sync::Arc;

use anyhow::Context;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::hub::Hub;

/// The health router; split out so tests can serve it on any listener.
pub fn router(hub: Arc<Hub>) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .with_state(hub)
}

/// Serve `/health` until the token fires.
pub async fn serve(hub: Arc<Hub>, port: u16, cancel: CancellationToken) -> anyhow::Result<()> {
    let app = router(hub);

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
        .await
        .with_context(|| format!("failed to bind health endpoint on port {}", port))?;
    info!(port, "health endpoint listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("health endpoint error")?;
    Ok(())
}

async fn handle_health(State(hub): State<Arc<Hub>>) -> Json<Value> {
    Json(json!({
        "state": hub.state_str(),
        "uptime": hub.uptime_secs(),
        "clientCount": hub.registry.requester_count().await,
        "operationsCount": hub.operations.count(),
    }))
}
