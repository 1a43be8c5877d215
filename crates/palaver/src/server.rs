//! The hub server: bind, accept, per-connection tasks, background tickers,
//! graceful drain.
//!
//! Each accepted socket gets a reader task (this module) and a writer task
//! fed by the connection's outbound queue. The reader feeds frames to the
//! router; everything outbound goes through the queue so the sink has one
//! writer.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use palaverproto::{is_control_text, ErrorCode, Frame, Message, WireError};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::conn::{ConnHandle, ConnId};
use crate::hub::Hub;
use crate::{router, snapshot};

/// Cadence of the dead-connection reaper.
const REAPER_INTERVAL: Duration = Duration::from_secs(60);

/// Cadence of the operation GC and route sweep.
const GC_INTERVAL: Duration = Duration::from_secs(60);

/// Overall budget for flushing client connections during drain.
const DRAIN_BUDGET: Duration = Duration::from_secs(30);

/// Why the hub could not start.
#[derive(Debug, Error)]
pub enum BindError {
    #[error("port {port} is already in use")]
    PortInUse { port: u16 },

    #[error("permission denied binding port {port}")]
    PortPermissionDenied { port: u16 },

    #[error("failed to bind port {port}: {source}")]
    Io {
        port: u16,
        source: std::io::Error,
    },
}

impl BindError {
    pub fn from_io(port: u16, source: std::io::Error) -> Self {
        match source.kind() {
            std::io::ErrorKind::AddrInUse => BindError::PortInUse { port },
            std::io::ErrorKind::PermissionDenied => BindError::PortPermissionDenied { port },
            _ => BindError::Io { port, source },
        }
    }

    pub fn is_addr_in_use(&self) -> bool {
        matches!(self, BindError::PortInUse { .. })
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            BindError::PortInUse { .. } => ErrorCode::PortInUse,
            BindError::PortPermissionDenied { .. } => ErrorCode::PortPermissionDenied,
            BindError::Io { .. } => ErrorCode::PortInUse,
        }
    }
}

/// A running hub bound to its port.
pub struct HubServer {
    local_addr: SocketAddr,
    hub: Arc<Hub>,
    cancel: CancellationToken,
    accept_task: JoinHandle<()>,
    tickers: Vec<JoinHandle<()>>,
}

impl HubServer {
    /// Bind the loopback port and start accepting. Port 0 binds an
    /// ephemeral port; `local_addr` reports what was actually bound.
    pub async fn bind(config: palaverconf::Config) -> Result<Self, BindError> {
        let port = config.hub_port;
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| BindError::from_io(port, e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| BindError::from_io(port, e))?;

        let hub = Arc::new(Hub::new(config));
        if let Some(path) = hub.config.snapshot_path.clone() {
            snapshot::load(&hub.operations, &path);
        }

        let cancel = CancellationToken::new();
        let accept_task = tokio::spawn(accept_loop(hub.clone(), listener, cancel.clone()));
        let tickers = vec![
            tokio::spawn(keepalive_ticker(hub.clone(), cancel.clone())),
            tokio::spawn(reaper_ticker(hub.clone(), cancel.clone())),
            tokio::spawn(gc_ticker(hub.clone(), cancel.clone())),
        ];

        info!(addr = %local_addr, hub_id = %hub.info.hub_id, "hub listening");
        Ok(Self {
            local_addr,
            hub,
            cancel,
            accept_task,
            tickers,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn hub(&self) -> Arc<Hub> {
        self.hub.clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Graceful drain: stop accepting, tell every client, flush writes
    /// within the budget, snapshot operations, stop.
    pub async fn shutdown(self) {
        info!("hub draining");
        self.hub.begin_drain();
        self.cancel.cancel();

        for conn in self.hub.conns().await {
            let _ = conn
                .send(Message::HubShutdown {
                    reason: "shutdown".to_string(),
                })
                .await;
            conn.begin_close();
        }

        let start = Instant::now();
        while self.hub.conn_count().await > 0 && start.elapsed() < DRAIN_BUDGET {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let remaining = self.hub.conn_count().await;
        if remaining > 0 {
            warn!(remaining, "drain budget elapsed with connections still open");
        }

        if let Some(path) = self.hub.config.snapshot_path.clone() {
            if let Err(e) = snapshot::save(&self.hub.operations, &path) {
                warn!(error = %e, "operation snapshot failed during shutdown");
            }
        }

        self.accept_task.abort();
        for ticker in self.tickers {
            ticker.abort();
        }
        info!("hub shutdown complete");
    }
}

async fn accept_loop(hub: Arc<Hub>, listener: TcpListener, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    if hub.is_draining() {
                        continue;
                    }
                    tokio::spawn(run_conn(hub.clone(), stream, addr));
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
        }
    }
}

/// One connection from handshake to teardown.
async fn run_conn(hub: Arc<Hub>, stream: TcpStream, addr: SocketAddr) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(addr = %addr, error = %e, "websocket handshake failed");
            return;
        }
    };

    let conn_id = hub.next_conn_id();
    let cancel = CancellationToken::new();
    let (handle, outbound_rx) = ConnHandle::new(conn_id, addr, cancel.clone());
    hub.track_conn(handle.clone()).await;

    let (sink, mut ws_stream) = ws.split();
    let writer = tokio::spawn(writer_task(sink, outbound_rx, conn_id));

    let _ = handle
        .send(Message::Welcome {
            assigned_id: conn_id.0,
            hub: hub.info.clone(),
        })
        .await;
    info!(conn = %conn_id, addr = %addr, "connection open");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(conn = %conn_id, "close requested");
                break;
            }
            inbound = ws_stream.next() => match inbound {
                None => break,
                Some(Err(e)) => {
                    debug!(conn = %conn_id, error = %e, "read error");
                    break;
                }
                Some(Ok(WsMessage::Close(_))) => break,
                Some(Ok(msg)) => handle_ws_message(&hub, &handle, msg).await,
            },
        }
    }

    // Drain whatever is queued, then close the socket.
    let _ = handle.send_ws(WsMessage::Close(None)).await;
    hub.handle_disconnect(conn_id).await;
    drop(handle);
    let _ = tokio::time::timeout(crate::conn::DRAIN_DEADLINE, writer).await;
}

async fn handle_ws_message(hub: &Arc<Hub>, conn: &ConnHandle, msg: WsMessage) {
    conn.touch();
    match msg {
        WsMessage::Text(text) => {
            if text.len() > hub.config.max_payload_bytes {
                warn!(
                    conn = %conn.id,
                    len = text.len(),
                    max = hub.config.max_payload_bytes,
                    "oversized frame rejected"
                );
                let error = WireError::new(ErrorCode::InvalidParamType)
                    .with_message("payload exceeds the configured maximum")
                    .with_details(serde_json::json!({
                        "length": text.len(),
                        "max": hub.config.max_payload_bytes,
                    }));
                let _ = conn.send(Message::error_for(None, error)).await;
                return;
            }
            if is_control_text(text.as_str()) {
                trace!(conn = %conn.id, "control text ignored");
                return;
            }
            match Frame::parse(text.as_str()) {
                Ok(frame) => router::handle_frame(hub, conn, frame).await,
                Err(e) => {
                    debug!(conn = %conn.id, error = %e, "malformed frame");
                    let error = WireError::new(ErrorCode::InvalidParamType)
                        .with_message("frame must be a JSON object with a string `type`")
                        .with_details(serde_json::json!({ "parseError": e.to_string() }));
                    let _ = conn.send(Message::error_for(None, error)).await;
                }
            }
        }
        WsMessage::Binary(_) => {
            let error = WireError::new(ErrorCode::InvalidParamType)
                .with_message("binary frames are not supported");
            let _ = conn.send(Message::error_for(None, error)).await;
        }
        WsMessage::Ping(payload) => {
            let _ = conn.try_send_ws(WsMessage::Pong(payload));
        }
        // touch() above already refreshed liveness.
        WsMessage::Pong(_) => {}
        WsMessage::Close(_) | WsMessage::Frame(_) => {}
    }
}

async fn writer_task(
    mut sink: futures::stream::SplitSink<WebSocketStream<TcpStream>, WsMessage>,
    mut rx: mpsc::Receiver<WsMessage>,
    conn_id: ConnId,
) {
    while let Some(msg) = rx.recv().await {
        let closing = matches!(msg, WsMessage::Close(_));
        if let Err(e) = sink.send(msg).await {
            debug!(conn = %conn_id, error = %e, "write failed");
            break;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}

/// Low-level websocket ping on every live connection; pongs (or any inbound
/// frame) set the liveness flag back.
async fn keepalive_ticker(hub: Arc<Hub>, cancel: CancellationToken) {
    let period = Duration::from_millis(hub.config.keepalive_interval_ms.max(1000));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for conn in hub.conns().await {
                    conn.clear_alive();
                    let _ = conn.try_send_ws(WsMessage::Ping(b"palaver".as_slice().into()));
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
}

/// Terminates connections that stopped answering pings and have been idle
/// past the dead threshold. Strictly wall-clock; application traffic only
/// matters insofar as it refreshed last-activity.
async fn reaper_ticker(hub: Arc<Hub>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(REAPER_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for conn in hub.conns().await {
                    if !conn.is_live() {
                        warn!(
                            conn = %conn.id,
                            idle_secs = conn.idle_for().as_secs(),
                            "terminating dead connection"
                        );
                        conn.begin_close();
                    }
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
}

async fn gc_ticker(hub: Arc<Hub>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(GC_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let route_age = Duration::from_millis(hub.config.operation_timeout_ms);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let stats = hub.operations.sweep();
                if stats.removed > 0 || stats.abandoned > 0 {
                    debug!(
                        removed = stats.removed,
                        abandoned = stats.abandoned,
                        "operation sweep"
                    );
                }
                let dropped = hub.routes.sweep(route_age);
                if dropped > 0 {
                    debug!(dropped, "expired route entries dropped");
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
}
