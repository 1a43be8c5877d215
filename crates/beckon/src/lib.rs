//! beckon - hub client for the Palaver system.
//!
//! "Either connect to the hub or become it": `Beckon::connect` joins a
//! running hub on the well-known port, and when none answers it starts an
//! embedded [`palaver`] hub in-process and joins that. After that it keeps
//! the connection alive (keepalive, health self-check, reconnect with
//! backoff and jitter), correlates requests with responses through a
//! pending table, and surfaces hub pushes as [`BeckonEvent`]s.
//!
//! ```ignore
//! let client = Beckon::connect(BeckonConfig::new(ClientInfo::named("inspector"))).await?;
//! let result = client.request("tab_create", serde_json::json!({})).await?;
//! ```

pub mod backoff;
pub mod discovery;
pub mod events;
mod reactor;

pub use events::BeckonEvent;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use palaverproto::{now_ms, ClientInfo, Message};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::info;

use reactor::ReactorCommand;

/// Client configuration. Derivable from the shared [`palaverconf::Config`]
/// or built directly for tests and embedders.
#[derive(Debug, Clone)]
pub struct BeckonConfig {
    pub hub_port: u16,
    pub client: ClientInfo,
    /// Default per-request deadline.
    pub request_timeout: Duration,
    /// Discovery step 1 deadline.
    pub connect_timeout: Duration,
    /// Longer deadline used after losing a bind race.
    pub retry_connect_timeout: Duration,
    pub keepalive_interval: Duration,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    /// `None` is unbounded.
    pub max_reconnect_attempts: Option<u32>,
    /// Skip discovery step 1 and always start the embedded hub.
    pub force_hub_creation: bool,
    /// Allow starting an embedded hub at all.
    pub start_embedded: bool,
    /// Configuration handed to an embedded hub.
    pub hub_config: palaverconf::Config,
}

impl BeckonConfig {
    pub fn new(client: ClientInfo) -> Self {
        Self::from_config(&palaverconf::Config::default(), client)
    }

    /// Wire the documented knobs into client behavior.
    pub fn from_config(config: &palaverconf::Config, client: ClientInfo) -> Self {
        Self {
            hub_port: config.hub_port,
            client,
            request_timeout: Duration::from_millis(config.operation_timeout_ms),
            connect_timeout: Duration::from_secs(2),
            retry_connect_timeout: Duration::from_secs(5),
            keepalive_interval: Duration::from_millis(config.keepalive_interval_ms),
            reconnect_base: Duration::from_millis(config.reconnect_base_ms),
            reconnect_max: Duration::from_millis(config.reconnect_max_ms),
            max_reconnect_attempts: config.max_reconnect_attempts,
            force_hub_creation: config.force_hub_creation,
            start_embedded: true,
            hub_config: config.clone(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.hub_port = port;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, max: u32) -> Self {
        self.max_reconnect_attempts = Some(max);
        self
    }

    /// Join-only mode: never start a hub (tests, secondary processes).
    pub fn without_embedded_hub(mut self) -> Self {
        self.start_embedded = false;
        self
    }
}

/// A connected hub client. Cheap to share behind an `Arc`; all socket work
/// happens in the reactor task.
pub struct Beckon {
    cmd_tx: mpsc::Sender<ReactorCommand>,
    events_tx: broadcast::Sender<BeckonEvent>,
    client_id_rx: watch::Receiver<Option<String>>,
    shutdown: CancellationToken,
    base_id: String,
    seq: AtomicU64,
    request_timeout: Duration,
}

impl Beckon {
    /// Run discovery, register, and return once the hub confirms
    /// registration.
    pub async fn connect(config: BeckonConfig) -> Result<Self> {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (events_tx, mut events_rx) = broadcast::channel(256);
        let (client_id_tx, client_id_rx) = watch::channel(None);

        let base_id = config
            .client
            .id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("client-{}", uuid::Uuid::new_v4().simple()));
        let request_timeout = config.request_timeout;

        // Enough for discovery, a lost bind race, and registration.
        let connect_deadline =
            config.connect_timeout + config.retry_connect_timeout + Duration::from_secs(10);

        let shutdown = CancellationToken::new();
        tokio::spawn(reactor::reactor_task(
            config,
            cmd_rx,
            events_tx.clone(),
            client_id_tx,
            shutdown.clone(),
        ));

        let outcome = tokio::time::timeout(connect_deadline, async {
            loop {
                match events_rx.recv().await {
                    Ok(BeckonEvent::Connected { client_id }) => return Ok(client_id),
                    Ok(BeckonEvent::Disconnected { reason }) => {
                        return Err(anyhow!("hub unreachable: {}", reason))
                    }
                    Ok(BeckonEvent::HubShutdown { reason }) => {
                        return Err(anyhow!("hub shut down during connect: {}", reason))
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(anyhow!("reactor exited during connect"))
                    }
                }
            }
        })
        .await;

        match outcome {
            Ok(Ok(client_id)) => {
                info!(client_id = %client_id, "connected to hub");
                Ok(Self {
                    cmd_tx,
                    events_tx,
                    client_id_rx,
                    shutdown,
                    base_id,
                    seq: AtomicU64::new(0),
                    request_timeout,
                })
            }
            Ok(Err(e)) => {
                shutdown.cancel();
                Err(e)
            }
            Err(_) => {
                shutdown.cancel();
                Err(anyhow!("timed out connecting to hub"))
            }
        }
    }

    /// Subscribe to connection and progress events.
    pub fn subscribe(&self) -> broadcast::Receiver<BeckonEvent> {
        self.events_tx.subscribe()
    }

    /// The hub-assigned client id (possibly suffixed); `None` while
    /// disconnected.
    pub fn client_id(&self) -> Option<String> {
        self.client_id_rx.borrow().clone()
    }

    /// Monotonically increasing, scoped to this client.
    fn next_request_id(&self) -> String {
        format!("{}-{}", self.base_id, self.seq.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Send a tool request and wait for the correlated response.
    pub async fn request(&self, tool_name: &str, params: Value) -> Result<Value> {
        self.request_with_timeout(tool_name, params, self.request_timeout)
            .await
    }

    /// Same, with a per-call deadline.
    pub async fn request_with_timeout(
        &self,
        tool_name: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value> {
        let request_id = self.next_request_id();
        let frame_text = Message::Request {
            request_id: request_id.clone(),
            tool_name: tool_name.to_string(),
            params,
        }
        .to_text(now_ms());
        self.submit(frame_text, request_id, tool_name.to_string(), timeout)
            .await
    }

    /// Block until the operation reaches a terminal state; resolves with
    /// the full operation record.
    pub async fn wait_for_operation(&self, operation_id: &str, timeout_ms: u64) -> Result<Value> {
        let request_id = self.next_request_id();
        let frame_text = Message::WaitForOperation {
            request_id: request_id.clone(),
            operation_id: operation_id.to_string(),
            timeout_ms: Some(timeout_ms),
        }
        .to_text(now_ms());
        // Slack on top of the hub-side wait so its verdict arrives first.
        let deadline = Duration::from_millis(timeout_ms) + Duration::from_secs(5);
        self.submit(frame_text, request_id, "wait_for_operation".to_string(), deadline)
            .await
    }

    /// Fetch the current operation record.
    pub async fn get_operation(&self, operation_id: &str) -> Result<Value> {
        let request_id = self.next_request_id();
        let frame_text = Message::GetOperation {
            request_id: request_id.clone(),
            operation_id: operation_id.to_string(),
        }
        .to_text(now_ms());
        self.submit(
            frame_text,
            request_id,
            "get_operation".to_string(),
            self.request_timeout,
        )
        .await
    }

    /// Request cooperative cancellation. Idempotent after a terminal state.
    pub async fn cancel_operation(&self, operation_id: &str) -> Result<Value> {
        let request_id = self.next_request_id();
        let frame_text = Message::CancelOperation {
            request_id: request_id.clone(),
            operation_id: operation_id.to_string(),
        }
        .to_text(now_ms());
        self.submit(
            frame_text,
            request_id,
            "cancel_operation".to_string(),
            self.request_timeout,
        )
        .await
    }

    async fn submit(
        &self,
        frame_text: String,
        request_id: String,
        tool_name: String,
        timeout: Duration,
    ) -> Result<Value> {
        let (response_tx, response_rx) = oneshot::channel();
        self.cmd_tx
            .send(ReactorCommand::Request {
                frame_text,
                request_id,
                tool_name,
                deadline: Instant::now() + timeout,
                response_tx,
            })
            .await
            .map_err(|_| anyhow!("reactor is gone"))?;

        response_rx
            .await
            .map_err(|_| anyhow!("reactor dropped response channel"))?
    }

    /// Close cleanly. Pending requests are rejected; no reconnect follows.
    pub async fn shutdown(&self) {
        // The token covers the disconnected phases; the command gives the
        // session loop an orderly close.
        self.shutdown.cancel();
        let _ = self.cmd_tx.send(ReactorCommand::Shutdown).await;
    }
}
