//! The reactor task: owns the websocket, the pending-request table, and the
//! reconnect loop.
//!
//! Callers never touch the socket. Requests arrive over a command channel
//! and resolve through oneshot senders keyed by request id; each entry
//! leaves the table exactly once (response, error, deadline expiry, or
//! reconnect invalidation). On an unexpected close the reactor rejects
//! everything pending with `RECONNECTED` (callers decide whether to retry),
//! backs off with jitter, reconnects, and re-registers. Nothing is ever
//! replayed.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use futures::{SinkExt, StreamExt};
use palaver::HubServer;
use palaverproto::{
    is_control_text, now_ms, Compat, ErrorCode, Frame, Message, WireError,
};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::events::BeckonEvent;
use crate::{backoff, discovery, BeckonConfig};

/// Self-check cadence: socket state plus time-since-last-activity.
const HEALTH_INTERVAL: Duration = Duration::from_secs(10);

/// Activity staleness that triggers a soft reconnect.
const STALE_AFTER: Duration = Duration::from_secs(60);

/// Command sent to the reactor task.
pub(crate) enum ReactorCommand {
    /// Send a request frame and resolve the oneshot with the correlated
    /// response.
    Request {
        frame_text: String,
        request_id: String,
        tool_name: String,
        deadline: Instant,
        response_tx: oneshot::Sender<Result<Value>>,
    },
    /// Close cleanly; pending requests are rejected, no reconnect.
    Shutdown,
}

/// A request waiting for its response.
struct PendingRequest {
    response_tx: oneshot::Sender<Result<Value>>,
    tool_name: String,
    deadline: Instant,
}

/// Why a session ended.
enum SessionEnd {
    /// Unexpected: socket dropped, read error, or stale health check.
    Dropped(String),
    /// The hub said goodbye; expected, no reconnect.
    HubShutdown(String),
    /// Caller asked us to stop.
    Shutdown,
}

fn reject_all(pending: &mut HashMap<String, PendingRequest>, code: ErrorCode) {
    for (request_id, entry) in pending.drain() {
        trace!(request_id = %request_id, "rejecting pending request");
        let error = WireError::new(code)
            .with_details(serde_json::json!({ "toolName": entry.tool_name }));
        let _ = entry.response_tx.send(Err(anyhow::Error::new(error)));
    }
}

/// Wait out the backoff before the next attempt. Returns `false` when the
/// attempt budget is exhausted (permanent failure) or the caller shut us
/// down while we slept.
async fn schedule_reconnect(
    config: &BeckonConfig,
    attempt: &mut u32,
    events: &broadcast::Sender<BeckonEvent>,
    shutdown: &CancellationToken,
    reason: &str,
) -> bool {
    if let Some(max) = config.max_reconnect_attempts {
        if *attempt >= max {
            warn!(reason, attempts = *attempt, "reconnect attempts exhausted");
            let _ = events.send(BeckonEvent::Disconnected {
                reason: reason.to_string(),
            });
            return false;
        }
    }

    let delay = backoff::delay(
        *attempt,
        config.reconnect_base.as_millis() as u64,
        config.reconnect_max.as_millis() as u64,
    );
    debug!(reason, attempt = *attempt + 1, ?delay, "scheduling reconnect");
    let _ = events.send(BeckonEvent::Reconnecting {
        attempt: *attempt + 1,
        delay,
    });
    *attempt += 1;
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = shutdown.cancelled() => false,
    }
}

pub(crate) async fn reactor_task(
    config: BeckonConfig,
    mut cmd_rx: mpsc::Receiver<ReactorCommand>,
    events: broadcast::Sender<BeckonEvent>,
    client_id_tx: watch::Sender<Option<String>>,
    shutdown: CancellationToken,
) {
    let mut pending: HashMap<String, PendingRequest> = HashMap::new();
    let mut embedded: Option<HubServer> = None;
    let mut reconnect_attempt: u32 = 0;

    debug!(name = %config.client.name, "reactor started");

    'outer: loop {
        if shutdown.is_cancelled() {
            break;
        }

        let ws = match discovery::connect_or_start(&config, &mut embedded).await {
            Ok(ws) => ws,
            Err(e) => {
                let reason = format!("{:#}", e);
                warn!(error = %reason, "hub connection failed");
                if !schedule_reconnect(
                    &config,
                    &mut reconnect_attempt,
                    &events,
                    &shutdown,
                    &reason,
                )
                .await
                {
                    break 'outer;
                }
                continue;
            }
        };

        let (mut sink, mut stream) = ws.split();

        let register = Message::RegisterRequester {
            client_info: config.client.clone(),
        };
        if sink
            .send(WsMessage::text(register.to_text(now_ms())))
            .await
            .is_err()
        {
            if !schedule_reconnect(
                &config,
                &mut reconnect_attempt,
                &events,
                &shutdown,
                "register failed",
            )
            .await
            {
                break 'outer;
            }
            continue;
        }

        let mut last_activity = Instant::now();
        let mut cleanup = tokio::time::interval(Duration::from_secs(1));
        cleanup.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut keepalive = tokio::time::interval(config.keepalive_interval);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first interval tick fires immediately; that keepalive is
        // harmless, but skip the immediate health probe.
        let mut health = tokio::time::interval_at(
            tokio::time::Instant::now() + HEALTH_INTERVAL,
            HEALTH_INTERVAL,
        );
        health.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let session_end;

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    session_end = SessionEnd::Shutdown;
                    break;
                }

                cmd = cmd_rx.recv() => match cmd {
                    Some(ReactorCommand::Request { frame_text, request_id, tool_name, deadline, response_tx }) => {
                        if Instant::now() >= deadline {
                            let error = WireError::new(ErrorCode::RequestTimeout)
                                .with_details(serde_json::json!({ "toolName": tool_name }));
                            let _ = response_tx.send(Err(anyhow::Error::new(error)));
                            continue;
                        }
                        trace!(request_id = %request_id, tool_name = %tool_name, "sending request");
                        if let Err(e) = sink.send(WsMessage::text(frame_text)).await {
                            let _ = response_tx.send(Err(anyhow!("send failed: {}", e)));
                            session_end = SessionEnd::Dropped(format!("write failed: {}", e));
                            break;
                        }
                        pending.insert(request_id, PendingRequest { response_tx, tool_name, deadline });
                    }
                    Some(ReactorCommand::Shutdown) | None => {
                        let _ = sink.send(WsMessage::Close(None)).await;
                        session_end = SessionEnd::Shutdown;
                        break;
                    }
                },

                inbound = stream.next() => match inbound {
                    None => {
                        session_end = SessionEnd::Dropped("closed by hub".to_string());
                        break;
                    }
                    Some(Err(e)) => {
                        session_end = SessionEnd::Dropped(format!("read error: {}", e));
                        break;
                    }
                    Some(Ok(msg)) => {
                        last_activity = Instant::now();
                        match msg {
                            WsMessage::Text(text) => {
                                if is_control_text(text.as_str()) {
                                    continue;
                                }
                                match Frame::parse(text.as_str()) {
                                    Ok(frame) => {
                                        if let Some(end) = process_frame(
                                            frame,
                                            &mut pending,
                                            &events,
                                            &client_id_tx,
                                            &mut reconnect_attempt,
                                        ) {
                                            session_end = end;
                                            break;
                                        }
                                    }
                                    Err(e) => debug!(error = %e, "unparseable frame from hub"),
                                }
                            }
                            WsMessage::Ping(payload) => {
                                let _ = sink.send(WsMessage::Pong(payload)).await;
                            }
                            WsMessage::Close(_) => {
                                session_end = SessionEnd::Dropped("closed by hub".to_string());
                                break;
                            }
                            _ => {}
                        }
                    }
                },

                _ = cleanup.tick() => {
                    let now = Instant::now();
                    let expired: Vec<String> = pending
                        .iter()
                        .filter(|(_, p)| now > p.deadline)
                        .map(|(id, _)| id.clone())
                        .collect();
                    for request_id in expired {
                        if let Some(entry) = pending.remove(&request_id) {
                            debug!(request_id = %request_id, tool_name = %entry.tool_name, "request timed out");
                            let error = WireError::new(ErrorCode::RequestTimeout)
                                .with_details(serde_json::json!({ "toolName": entry.tool_name }));
                            let _ = entry.response_tx.send(Err(anyhow::Error::new(error)));
                        }
                    }
                }

                _ = keepalive.tick() => {
                    let _ = sink.send(WsMessage::text(Message::Keepalive.to_text(now_ms()))).await;
                }

                _ = health.tick() => {
                    if last_activity.elapsed() > STALE_AFTER {
                        warn!(
                            idle_secs = last_activity.elapsed().as_secs(),
                            "hub went quiet, soft reconnect"
                        );
                        session_end = SessionEnd::Dropped("no activity from hub".to_string());
                        break;
                    }
                }
            }
        }

        match session_end {
            SessionEnd::Shutdown => {
                reject_all(&mut pending, ErrorCode::HubShuttingDown);
                break 'outer;
            }
            SessionEnd::HubShutdown(reason) => {
                info!(reason = %reason, "hub shut down");
                reject_all(&mut pending, ErrorCode::HubShuttingDown);
                break 'outer;
            }
            SessionEnd::Dropped(reason) => {
                // Pending requests do not survive the socket; no replays.
                reject_all(&mut pending, ErrorCode::Reconnected);
                let _ = client_id_tx.send(None);
                if !schedule_reconnect(
                    &config,
                    &mut reconnect_attempt,
                    &events,
                    &shutdown,
                    &reason,
                )
                .await
                {
                    break 'outer;
                }
            }
        }
    }

    if let Some(server) = embedded.take() {
        server.shutdown().await;
    }
    debug!(name = %config.client.name, "reactor exiting");
}

/// Handle one frame from the hub. Returns `Some` when the session must end.
fn process_frame(
    frame: Frame,
    pending: &mut HashMap<String, PendingRequest>,
    events: &broadcast::Sender<BeckonEvent>,
    client_id_tx: &watch::Sender<Option<String>>,
    reconnect_attempt: &mut u32,
) -> Option<SessionEnd> {
    match frame.frame_type() {
        "welcome" => {
            if let Some(hub_version) = frame
                .get("hub")
                .and_then(|h| h.get("version"))
                .and_then(Value::as_str)
            {
                if Compat::check(palaverproto::PROTOCOL_VERSION, hub_version) != Compat::Same {
                    warn!(
                        ours = palaverproto::PROTOCOL_VERSION,
                        hub = hub_version,
                        "version drift against hub"
                    );
                }
            }
        }
        "registration_confirmed" => {
            let client_id = frame.get_str("clientId").unwrap_or_default().to_string();
            info!(client_id = %client_id, "registered with hub");
            *reconnect_attempt = 0;
            let _ = client_id_tx.send(Some(client_id.clone()));
            let _ = events.send(BeckonEvent::Connected { client_id });
        }
        "keepalive_response" => {}
        "response" => {
            let Some(request_id) = frame.request_id() else {
                debug!("response frame without requestId");
                return None;
            };
            if let Some(entry) = pending.remove(request_id) {
                let result = frame.get("result").cloned().unwrap_or(Value::Null);
                let _ = entry.response_tx.send(Ok(result));
            } else {
                debug!(request_id = %request_id, "discarding orphan response");
            }
        }
        "error" => {
            let error = frame
                .get("error")
                .cloned()
                .and_then(|v| serde_json::from_value::<WireError>(v).ok());
            match frame.request_id() {
                Some(request_id) => {
                    if let Some(entry) = pending.remove(request_id) {
                        let err = match error {
                            Some(wire) => anyhow::Error::new(wire),
                            None => anyhow!("hub error without payload"),
                        };
                        let _ = entry.response_tx.send(Err(err));
                    } else {
                        debug!(request_id = %request_id, "discarding orphan error");
                    }
                }
                None => warn!(
                    error = ?error,
                    "connection-level error from hub"
                ),
            }
        }
        "progress" => {
            let operation_id = frame.operation_id().unwrap_or_default().to_string();
            let milestone = frame.get_str("milestone").unwrap_or_default().to_string();
            let data = frame.get("data").cloned().unwrap_or(Value::Null);
            let _ = events.send(BeckonEvent::Progress {
                operation_id,
                milestone,
                data,
            });
        }
        "client_list_update" => {
            let clients = frame
                .get("clients")
                .cloned()
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default();
            let _ = events.send(BeckonEvent::ClientListUpdate { clients });
        }
        "hub_shutdown" => {
            let reason = frame.get_str("reason").unwrap_or("unknown").to_string();
            let _ = events.send(BeckonEvent::HubShutdown {
                reason: reason.clone(),
            });
            return Some(SessionEnd::HubShutdown(reason));
        }
        other => debug!(frame_type = other, "unhandled frame from hub"),
    }
    None
}
