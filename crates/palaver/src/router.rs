//! Frame classification and forwarding.
//!
//! The allow-list below is the contract: registration, keepalive, and the
//! operation surface are handled locally; everything else a requester sends
//! is assumed to be an extension tool call and forwarded to the automator,
//! annotated with its origin. New tools need no hub changes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use palaverproto::{now_ms, Compat, ErrorCode, Frame, Message, Role, WireError};
use serde_json::Value;
use tracing::{debug, warn};

use crate::conn::ConnHandle;
use crate::hub::{Hub, RouteEntry};
use crate::operations::{Applied, CancelDisposition, WaitError};

/// Types only the hub or the automator may originate; a requester sending
/// one is a protocol violation, not a tool call.
fn is_reserved_for_hub(frame_type: &str) -> bool {
    matches!(
        frame_type,
        "response"
            | "error"
            | "progress"
            | "welcome"
            | "registration_confirmed"
            | "client_list_update"
            | "hub_shutdown"
            | "keepalive_response"
    )
}

/// Route one inbound frame according to the rules in the module docs.
pub async fn handle_frame(hub: &Arc<Hub>, conn: &ConnHandle, frame: Frame) {
    match frame.frame_type() {
        "register_automator" => register_automator(hub, conn, frame).await,
        "register_requester" => register_requester(hub, conn, frame).await,
        "keepalive" => {
            let _ = conn
                .send(Message::KeepaliveResponse {
                    server_time: now_ms(),
                })
                .await;
        }
        "wait_for_operation" => wait_for_operation(hub, conn, frame).await,
        "get_operation" => get_operation(hub, conn, frame).await,
        "cancel_operation" => cancel_operation(hub, conn, frame).await,
        other => match conn.role() {
            Role::Requester => {
                if is_reserved_for_hub(other) {
                    send_unknown_type(conn, &frame).await;
                } else {
                    forward_to_automator(hub, conn, frame).await;
                }
            }
            Role::Automator => match other {
                "response" | "error" => deliver_to_requester(hub, frame).await,
                "progress" => handle_progress(hub, conn, frame).await,
                _ => send_unknown_type(conn, &frame).await,
            },
            Role::Unassigned => send_unknown_type(conn, &frame).await,
        },
    }
}

async fn send_unknown_type(conn: &ConnHandle, frame: &Frame) {
    debug!(conn = %conn.id, frame_type = frame.frame_type(), "unknown message type");
    let error = WireError::new(ErrorCode::UnknownMessageType)
        .with_details(serde_json::json!({ "type": frame.frame_type() }));
    let _ = conn
        .send(Message::error_for(
            frame.request_id().map(str::to_string),
            error,
        ))
        .await;
}

async fn send_validation_error(conn: &ConnHandle, frame: &Frame, message: &str) {
    let error = WireError::new(ErrorCode::MissingParam).with_message(message.to_string());
    let _ = conn
        .send(Message::error_for(
            frame.request_id().map(str::to_string),
            error,
        ))
        .await;
}

fn report_version_drift(peer: &str, version: Option<&str>) {
    let Some(theirs) = version else { return };
    match Compat::check(palaverproto::PROTOCOL_VERSION, theirs) {
        Compat::Same => {}
        Compat::PatchDrift | Compat::MinorDrift => warn!(
            peer,
            ours = palaverproto::PROTOCOL_VERSION,
            theirs,
            "version drift at registration"
        ),
        Compat::Incompatible => warn!(
            peer,
            ours = palaverproto::PROTOCOL_VERSION,
            theirs,
            "major version mismatch at registration (continuing)"
        ),
    }
}

async fn register_automator(hub: &Arc<Hub>, conn: &ConnHandle, frame: Frame) {
    let (extension_id, version) = match frame.decode::<Message>() {
        Ok(Message::RegisterAutomator {
            extension_id,
            version,
        }) => (extension_id, version),
        _ => {
            send_validation_error(conn, &frame, "register_automator requires extensionId").await;
            return;
        }
    };
    report_version_drift("automator", version.as_deref());

    let evicted = hub
        .registry
        .register_automator(conn.clone(), extension_id, now_ms())
        .await;
    if let Some(old) = evicted {
        let _ = old
            .conn
            .send(Message::HubShutdown {
                reason: "replaced".to_string(),
            })
            .await;
        old.conn.begin_close();
    }

    conn.set_role(Role::Automator);
    conn.set_client_id("automator");
    let _ = conn
        .send(Message::RegistrationConfirmed {
            role: Role::Automator,
            client_id: "automator".to_string(),
            hub: hub.info.clone(),
        })
        .await;

    hub.broadcast_client_list().await;
}

async fn register_requester(hub: &Arc<Hub>, conn: &ConnHandle, frame: Frame) {
    let client_info = match frame.decode::<Message>() {
        Ok(Message::RegisterRequester { client_info }) => client_info,
        _ => {
            send_validation_error(conn, &frame, "register_requester requires clientInfo").await;
            return;
        }
    };
    report_version_drift(&client_info.name, client_info.version.as_deref());

    let client_id = hub
        .registry
        .register_requester(conn.clone(), client_info, now_ms())
        .await;
    conn.set_role(Role::Requester);
    conn.set_client_id(&client_id);

    let _ = conn
        .send(Message::RegistrationConfirmed {
            role: Role::Requester,
            client_id,
            hub: hub.info.clone(),
        })
        .await;

    hub.broadcast_client_list().await;
}

/// Rule 2/3: annotate with the origin and hand to the automator. Applies to
/// `request` and to any type the hub does not recognize.
async fn forward_to_automator(hub: &Arc<Hub>, conn: &ConnHandle, mut frame: Frame) {
    let Some(client_id) = conn.client_id() else {
        send_unknown_type(conn, &frame).await;
        return;
    };

    let automator = match hub.registry.automator().await {
        Some(a) if a.is_live() => a,
        _ => {
            let error = WireError::new(ErrorCode::AutomatorNotConnected).with_details(
                serde_json::json!({ "toolName": frame.tool_name() }),
            );
            let _ = conn
                .send(Message::error_for(
                    frame.request_id().map(str::to_string),
                    error,
                ))
                .await;
            return;
        }
    };

    let request_id = frame.request_id().map(str::to_string);
    let operation_id = frame.operation_id().map(str::to_string);
    let tool_name = frame.tool_name().map(str::to_string);
    let client_name = hub
        .registry
        .requester_name(&client_id)
        .await
        .unwrap_or_default();

    frame.insert("sourceClientId", Value::String(client_id.clone()));
    frame.insert("sourceClientName", Value::String(client_name.clone()));
    frame.insert("hubMessageId", Value::from(hub.next_hub_message_id()));

    // Frames without a requestId forward fire-and-forget: no route entry,
    // nothing to correlate a reply against.
    if let Some(ref rid) = request_id {
        hub.routes.insert(
            rid,
            RouteEntry {
                source_client_id: client_id.clone(),
                source_client_name: client_name,
                tool_name: tool_name.clone(),
                created: Instant::now(),
            },
        );
    }

    // An async tool declares its operation up front; the owner is the
    // requester the progress milestones must reach.
    if let Some(ref op_id) = operation_id {
        hub.operations
            .register(op_id, &client_id, tool_name.as_deref());
    }

    hub.registry.bump_request_count(&client_id).await;

    debug!(
        conn = %conn.id,
        client_id = %client_id,
        request_id = request_id.as_deref().unwrap_or("-"),
        tool_name = tool_name.as_deref().unwrap_or(frame.frame_type()),
        "forwarding to automator"
    );
    if let Err(e) = automator.send_frame(&frame).await {
        warn!(error = %e, "failed to forward request to automator");
    }
}

/// Rule 4: `response`/`error` from the automator back to its origin.
async fn deliver_to_requester(hub: &Arc<Hub>, frame: Frame) {
    let request_id = frame.request_id().map(str::to_string);
    let route = request_id.as_deref().and_then(|rid| hub.routes.take(rid));

    let target = frame
        .target_client_id()
        .map(str::to_string)
        .or_else(|| route.map(|r| r.source_client_id));

    let Some(target) = target else {
        warn!(
            request_id = request_id.as_deref().unwrap_or("-"),
            "automator frame with no resolvable target dropped"
        );
        return;
    };

    // An async tool may announce its operation in the acceptance response.
    if frame.frame_type() == "response" {
        if let Some(result) = frame.get("result") {
            let announced = result.get("operationId").and_then(Value::as_str);
            let started = result.get("status").and_then(Value::as_str) == Some("started");
            if let (Some(op_id), true) = (announced, started) {
                hub.operations.register(op_id, &target, None);
            }
        }
    }

    match hub.registry.requester(&target).await {
        Some(requester) => {
            if let Err(e) = requester.send_frame(&frame).await {
                warn!(target = %target, error = %e, "failed to deliver to requester");
            }
        }
        None => warn!(
            target = %target,
            request_id = request_id.as_deref().unwrap_or("-"),
            "response for departed requester dropped"
        ),
    }
}

/// Rule 5: apply the milestone, then forward to the operation's owner.
async fn handle_progress(hub: &Arc<Hub>, conn: &ConnHandle, frame: Frame) {
    let Some(operation_id) = frame.operation_id().map(str::to_string) else {
        send_validation_error(conn, &frame, "progress requires operationId").await;
        return;
    };
    let Some(milestone) = frame.get_str("milestone").map(str::to_string) else {
        send_validation_error(conn, &frame, "progress requires milestone").await;
        return;
    };
    let data = frame.get("data").cloned().unwrap_or(Value::Null);

    let owner = hub.operations.owner_of(&operation_id);
    match hub.operations.apply_progress(&operation_id, &milestone, data) {
        Applied::Recorded { .. } => {
            let Some(owner) = owner else { return };
            match hub.registry.requester(&owner).await {
                Some(requester) => {
                    let _ = requester.send_frame(&frame).await;
                }
                None => debug!(
                    operation = %operation_id, owner = %owner,
                    "operation owner disconnected; milestone recorded, not forwarded"
                ),
            }
        }
        // The manager already logged the late arrival.
        Applied::LateIgnored => {}
        Applied::Unknown => {
            warn!(operation = %operation_id, "progress for unknown operation dropped")
        }
    }
}

async fn wait_for_operation(hub: &Arc<Hub>, conn: &ConnHandle, frame: Frame) {
    let (request_id, operation_id, timeout_ms) = match frame.decode::<Message>() {
        Ok(Message::WaitForOperation {
            request_id,
            operation_id,
            timeout_ms,
        }) => (request_id, operation_id, timeout_ms),
        _ => {
            send_validation_error(conn, &frame, "wait_for_operation requires operationId").await;
            return;
        }
    };

    // The wait can outlast many routed frames; it gets its own task.
    let hub = hub.clone();
    let conn = conn.clone();
    tokio::spawn(async move {
        let timeout =
            Duration::from_millis(timeout_ms.unwrap_or(hub.config.operation_timeout_ms));
        let reply = match hub
            .operations
            .wait_for_completion(&operation_id, timeout)
            .await
        {
            Ok(op) => Message::Response {
                request_id,
                target_client_id: None,
                result: op.to_json(),
            },
            Err(WaitError::Unknown) => Message::error_for(
                Some(request_id),
                WireError::new(ErrorCode::UnknownOperation)
                    .with_details(serde_json::json!({ "operationId": operation_id })),
            ),
            Err(WaitError::Timeout) => Message::error_for(
                Some(request_id),
                WireError::new(ErrorCode::OperationTimeout)
                    .with_details(serde_json::json!({ "operationId": operation_id })),
            ),
        };
        let _ = conn.send(reply).await;
    });
}

async fn get_operation(hub: &Arc<Hub>, conn: &ConnHandle, frame: Frame) {
    let (request_id, operation_id) = match frame.decode::<Message>() {
        Ok(Message::GetOperation {
            request_id,
            operation_id,
        }) => (request_id, operation_id),
        _ => {
            send_validation_error(conn, &frame, "get_operation requires operationId").await;
            return;
        }
    };

    let reply = match hub.operations.get(&operation_id) {
        Some(op) => Message::Response {
            request_id,
            target_client_id: None,
            result: op.to_json(),
        },
        None => Message::error_for(
            Some(request_id),
            WireError::new(ErrorCode::UnknownOperation)
                .with_details(serde_json::json!({ "operationId": operation_id })),
        ),
    };
    let _ = conn.send(reply).await;
}

/// Cancellation is cooperative: pre-terminal cancels forward to the
/// automator; anything else answers locally, idempotently.
async fn cancel_operation(hub: &Arc<Hub>, conn: &ConnHandle, frame: Frame) {
    let (request_id, operation_id) = match frame.decode::<Message>() {
        Ok(Message::CancelOperation {
            request_id,
            operation_id,
        }) => (request_id, operation_id),
        _ => {
            send_validation_error(conn, &frame, "cancel_operation requires operationId").await;
            return;
        }
    };

    match hub.operations.cancel_disposition(&operation_id) {
        CancelDisposition::Unknown => {
            let _ = conn
                .send(Message::error_for(
                    Some(request_id),
                    WireError::new(ErrorCode::UnknownOperation)
                        .with_details(serde_json::json!({ "operationId": operation_id })),
                ))
                .await;
        }
        CancelDisposition::AlreadyTerminal(op) => {
            let _ = conn
                .send(Message::Response {
                    request_id,
                    target_client_id: None,
                    result: serde_json::json!({
                        "operationId": operation_id,
                        "status": "alreadyTerminal",
                        "terminalStatus": op.status.as_str(),
                    }),
                })
                .await;
        }
        CancelDisposition::Forward => forward_to_automator(hub, conn, frame).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palaverconf::Config;
    use palaverproto::ClientInfo;
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tokio_util::sync::CancellationToken;

    struct Peer {
        conn: ConnHandle,
        rx: mpsc::Receiver<WsMessage>,
    }

    impl Peer {
        fn new(hub: &Arc<Hub>) -> Self {
            let (conn, rx) = ConnHandle::new(
                hub.next_conn_id(),
                "127.0.0.1:9".parse().unwrap(),
                CancellationToken::new(),
            );
            Self { conn, rx }
        }

        async fn recv(&mut self) -> Frame {
            let msg = tokio::time::timeout(Duration::from_secs(1), self.rx.recv())
                .await
                .expect("timed out waiting for frame")
                .expect("connection queue closed");
            match msg {
                WsMessage::Text(text) => Frame::parse(text.as_str()).expect("invalid frame"),
                other => panic!("unexpected ws message: {:?}", other),
            }
        }

        /// Skip frames until one of the given type arrives.
        async fn recv_type(&mut self, frame_type: &str) -> Frame {
            loop {
                let frame = self.recv().await;
                if frame.frame_type() == frame_type {
                    return frame;
                }
            }
        }
    }

    fn hub() -> Arc<Hub> {
        Arc::new(Hub::new(Config::default()))
    }

    async fn track(hub: &Arc<Hub>, peer: &Peer) {
        hub.track_conn(peer.conn.clone()).await;
    }

    async fn register_automator_peer(hub: &Arc<Hub>) -> Peer {
        let mut peer = Peer::new(hub);
        track(hub, &peer).await;
        let frame =
            Frame::parse(r#"{"type":"register_automator","extensionId":"ext-1"}"#).unwrap();
        handle_frame(hub, &peer.conn, frame).await;
        let confirmed = peer.recv_type("registration_confirmed").await;
        assert_eq!(confirmed.get_str("role"), Some("automator"));
        peer
    }

    async fn register_requester_peer(hub: &Arc<Hub>, id: &str, name: &str) -> Peer {
        let mut peer = Peer::new(hub);
        track(hub, &peer).await;
        let frame = Frame::parse(&format!(
            r#"{{"type":"register_requester","clientInfo":{{"id":"{id}","name":"{name}","type":"mcp"}}}}"#
        ))
        .unwrap();
        handle_frame(hub, &peer.conn, frame).await;
        peer.recv_type("registration_confirmed").await;
        peer
    }

    #[tokio::test]
    async fn request_without_automator_is_rejected() {
        let hub = hub();
        let mut requester = register_requester_peer(&hub, "a", "A").await;

        let frame = Frame::parse(
            r#"{"type":"request","requestId":"r2","toolName":"tab_create","params":{}}"#,
        )
        .unwrap();
        handle_frame(&hub, &requester.conn, frame).await;

        let error = requester.recv_type("error").await;
        assert_eq!(error.request_id(), Some("r2"));
        assert_eq!(
            error.get("error").unwrap()["code"],
            "AUTOMATOR_NOT_CONNECTED"
        );
    }

    #[tokio::test]
    async fn happy_path_annotates_and_correlates() {
        let hub = hub();
        let mut automator = register_automator_peer(&hub).await;
        let mut requester = register_requester_peer(&hub, "a", "A").await;

        let frame = Frame::parse(
            r#"{"type":"request","requestId":"r1","toolName":"tab_create","params":{}}"#,
        )
        .unwrap();
        handle_frame(&hub, &requester.conn, frame).await;

        let forwarded = automator.recv_type("request").await;
        assert_eq!(forwarded.get_str("sourceClientId"), Some("a"));
        assert_eq!(forwarded.get_str("sourceClientName"), Some("A"));
        assert!(forwarded.get("hubMessageId").unwrap().is_u64());

        let reply = Frame::parse(
            r#"{"type":"response","requestId":"r1","targetClientId":"a","result":{"tabId":42}}"#,
        )
        .unwrap();
        handle_frame(&hub, &automator.conn, reply).await;

        let response = requester.recv_type("response").await;
        assert_eq!(response.request_id(), Some("r1"));
        assert_eq!(response.get("result").unwrap()["tabId"], 42);
    }

    #[tokio::test]
    async fn unknown_requester_types_forward() {
        let hub = hub();
        let mut automator = register_automator_peer(&hub).await;
        let requester = register_requester_peer(&hub, "a", "A").await;

        let frame =
            Frame::parse(r#"{"type":"tab_freeze","requestId":"r7","extra":true}"#).unwrap();
        handle_frame(&hub, &requester.conn, frame).await;

        let forwarded = automator.recv_type("tab_freeze").await;
        assert_eq!(forwarded.get_str("sourceClientId"), Some("a"));
        assert_eq!(forwarded.get("extra"), Some(&serde_json::json!(true)));
    }

    #[tokio::test]
    async fn response_resolves_target_via_route_table() {
        let hub = hub();
        let mut automator = register_automator_peer(&hub).await;
        let mut requester = register_requester_peer(&hub, "a", "A").await;

        let frame = Frame::parse(
            r#"{"type":"request","requestId":"r3","toolName":"tab_list","params":{}}"#,
        )
        .unwrap();
        handle_frame(&hub, &requester.conn, frame).await;
        automator.recv_type("request").await;

        // No targetClientId on the reply; the hub must remember.
        let reply =
            Frame::parse(r#"{"type":"response","requestId":"r3","result":{"tabs":[]}}"#).unwrap();
        handle_frame(&hub, &automator.conn, reply).await;

        let response = requester.recv_type("response").await;
        assert_eq!(response.request_id(), Some("r3"));
    }

    #[tokio::test]
    async fn responses_are_not_cross_delivered() {
        let hub = hub();
        let mut automator = register_automator_peer(&hub).await;
        let mut alpha = register_requester_peer(&hub, "alpha", "Alpha").await;
        let mut beta = register_requester_peer(&hub, "beta", "Beta").await;

        for (rid, peer) in [("ra", &alpha.conn), ("rb", &beta.conn)] {
            let frame = Frame::parse(&format!(
                r#"{{"type":"request","requestId":"{rid}","toolName":"tab_list","params":{{}}}}"#
            ))
            .unwrap();
            handle_frame(&hub, peer, frame).await;
            automator.recv_type("request").await;
        }

        // Replies land out of order.
        for (rid, who) in [("rb", "beta"), ("ra", "alpha")] {
            let reply = Frame::parse(&format!(
                r#"{{"type":"response","requestId":"{rid}","result":{{"for":"{who}"}}}}"#
            ))
            .unwrap();
            handle_frame(&hub, &automator.conn, reply).await;
        }

        let to_alpha = alpha.recv_type("response").await;
        assert_eq!(to_alpha.get("result").unwrap()["for"], "alpha");
        let to_beta = beta.recv_type("response").await;
        assert_eq!(to_beta.get("result").unwrap()["for"], "beta");
    }

    #[tokio::test]
    async fn response_for_departed_requester_is_dropped() {
        let hub = hub();
        let mut automator = register_automator_peer(&hub).await;
        let requester = register_requester_peer(&hub, "a", "A").await;

        let frame = Frame::parse(
            r#"{"type":"request","requestId":"r5","toolName":"tab_list","params":{}}"#,
        )
        .unwrap();
        handle_frame(&hub, &requester.conn, frame).await;
        automator.recv_type("request").await;

        hub.handle_disconnect(requester.conn.id).await;
        assert!(hub.routes.is_empty());

        // Late unsolicited reply: dropped, no panic, nothing forwarded.
        let reply =
            Frame::parse(r#"{"type":"response","requestId":"r5","result":{}}"#).unwrap();
        handle_frame(&hub, &automator.conn, reply).await;
    }

    #[tokio::test]
    async fn progress_applies_and_forwards_to_owner() {
        let hub = hub();
        let mut automator = register_automator_peer(&hub).await;
        let mut requester = register_requester_peer(&hub, "a", "A").await;

        let frame = Frame::parse(
            r#"{"type":"request","requestId":"r1","toolName":"tab_send_message","operationId":"op1","params":{}}"#,
        )
        .unwrap();
        handle_frame(&hub, &requester.conn, frame).await;
        automator.recv_type("request").await;

        for milestone in ["input_filled", "send_clicked"] {
            let progress = Frame::parse(&format!(
                r#"{{"type":"progress","operationId":"op1","milestone":"{milestone}"}}"#
            ))
            .unwrap();
            handle_frame(&hub, &automator.conn, progress).await;
            let seen = requester.recv_type("progress").await;
            assert_eq!(seen.get_str("milestone"), Some(milestone));
        }

        let done = Frame::parse(
            r#"{"type":"progress","operationId":"op1","milestone":"completed","data":{"tabId":42}}"#,
        )
        .unwrap();
        handle_frame(&hub, &automator.conn, done).await;
        requester.recv_type("progress").await;

        let op = hub.operations.get("op1").unwrap();
        assert_eq!(op.owner, "a");
        assert_eq!(op.result.unwrap()["tabId"], 42);
    }

    #[tokio::test]
    async fn wait_for_operation_resolves_with_terminal_record() {
        let hub = hub();
        let mut automator = register_automator_peer(&hub).await;
        let mut requester = register_requester_peer(&hub, "a", "A").await;

        let frame = Frame::parse(
            r#"{"type":"request","requestId":"r1","toolName":"tab_send_message","operationId":"op1","params":{}}"#,
        )
        .unwrap();
        handle_frame(&hub, &requester.conn, frame).await;
        automator.recv_type("request").await;

        let wait = Frame::parse(
            r#"{"type":"wait_for_operation","requestId":"w1","operationId":"op1","timeoutMs":30000}"#,
        )
        .unwrap();
        handle_frame(&hub, &requester.conn, wait).await;

        let done = Frame::parse(
            r#"{"type":"progress","operationId":"op1","milestone":"completed","data":{"tabId":42}}"#,
        )
        .unwrap();
        handle_frame(&hub, &automator.conn, done).await;

        // Both the forwarded milestone and the wait response arrive; order
        // between them is not guaranteed.
        let response = requester.recv_type("response").await;
        assert_eq!(response.request_id(), Some("w1"));
        let result = response.get("result").unwrap();
        assert_eq!(result["status"], "completed");
        assert_eq!(result["result"]["tabId"], 42);
    }

    #[tokio::test]
    async fn wait_for_unknown_operation_errors() {
        let hub = hub();
        let mut requester = register_requester_peer(&hub, "a", "A").await;

        let wait = Frame::parse(
            r#"{"type":"wait_for_operation","requestId":"w2","operationId":"op404","timeoutMs":1000}"#,
        )
        .unwrap();
        handle_frame(&hub, &requester.conn, wait).await;

        let error = requester.recv_type("error").await;
        assert_eq!(error.request_id(), Some("w2"));
        assert_eq!(error.get("error").unwrap()["code"], "UNKNOWN_OPERATION");
    }

    #[tokio::test]
    async fn cancel_after_terminal_is_idempotent() {
        let hub = hub();
        hub.operations.register("op1", "a", None);
        hub.operations
            .apply_progress("op1", "completed", Value::Null);

        let mut requester = register_requester_peer(&hub, "a", "A").await;
        let cancel = Frame::parse(
            r#"{"type":"cancel_operation","requestId":"c1","operationId":"op1"}"#,
        )
        .unwrap();
        handle_frame(&hub, &requester.conn, cancel).await;

        let response = requester.recv_type("response").await;
        assert_eq!(
            response.get("result").unwrap()["status"],
            "alreadyTerminal"
        );
    }

    #[tokio::test]
    async fn cancel_before_terminal_forwards_to_automator() {
        let hub = hub();
        let mut automator = register_automator_peer(&hub).await;
        let requester = register_requester_peer(&hub, "a", "A").await;

        hub.operations.register("op1", "a", None);
        let cancel = Frame::parse(
            r#"{"type":"cancel_operation","requestId":"c1","operationId":"op1"}"#,
        )
        .unwrap();
        handle_frame(&hub, &requester.conn, cancel).await;

        let forwarded = automator.recv_type("cancel_operation").await;
        assert_eq!(forwarded.get_str("sourceClientId"), Some("a"));
        assert_eq!(forwarded.operation_id(), Some("op1"));
    }

    #[tokio::test]
    async fn keepalive_gets_server_time() {
        let hub = hub();
        let mut requester = register_requester_peer(&hub, "a", "A").await;

        let frame = Frame::parse(r#"{"type":"keepalive"}"#).unwrap();
        handle_frame(&hub, &requester.conn, frame).await;

        let response = requester.recv_type("keepalive_response").await;
        assert!(response.get("serverTime").unwrap().is_i64());
    }

    #[tokio::test]
    async fn reserved_types_from_requester_are_rejected() {
        let hub = hub();
        register_automator_peer(&hub).await;
        let mut requester = register_requester_peer(&hub, "a", "A").await;

        let frame =
            Frame::parse(r#"{"type":"progress","operationId":"op1","milestone":"m"}"#).unwrap();
        handle_frame(&hub, &requester.conn, frame).await;

        let error = requester.recv_type("error").await;
        assert_eq!(error.get("error").unwrap()["code"], "UNKNOWN_MESSAGE_TYPE");
    }

    #[tokio::test]
    async fn automator_replacement_notifies_old() {
        let hub = hub();
        let mut old = register_automator_peer(&hub).await;
        let mut new = Peer::new(&hub);
        track(&hub, &new).await;

        let frame =
            Frame::parse(r#"{"type":"register_automator","extensionId":"ext-2"}"#).unwrap();
        handle_frame(&hub, &new.conn, frame).await;

        let shutdown = old.recv_type("hub_shutdown").await;
        assert_eq!(shutdown.get_str("reason"), Some("replaced"));
        assert!(old.conn.closed().is_cancelled());

        new.recv_type("registration_confirmed").await;
        assert_eq!(
            hub.registry.automator().await.unwrap().id,
            new.conn.id
        );
    }

    #[tokio::test]
    async fn client_list_update_reaches_automator_on_registration() {
        let hub = hub();
        let mut automator = register_automator_peer(&hub).await;
        register_requester_peer(&hub, "a", "A").await;

        let update = automator.recv_type("client_list_update").await;
        let clients = update.get("clients").unwrap().as_array().unwrap();
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0]["id"], "a");
        assert_eq!(clients[0]["type"], "mcp");
    }

    #[tokio::test]
    async fn response_announcing_operation_registers_it() {
        let hub = hub();
        let mut automator = register_automator_peer(&hub).await;
        let mut requester = register_requester_peer(&hub, "a", "A").await;

        let frame = Frame::parse(
            r#"{"type":"request","requestId":"r1","toolName":"page_export","params":{}}"#,
        )
        .unwrap();
        handle_frame(&hub, &requester.conn, frame).await;
        automator.recv_type("request").await;

        let reply = Frame::parse(
            r#"{"type":"response","requestId":"r1","result":{"operationId":"op9","status":"started"}}"#,
        )
        .unwrap();
        handle_frame(&hub, &automator.conn, reply).await;
        requester.recv_type("response").await;

        assert_eq!(hub.operations.owner_of("op9").as_deref(), Some("a"));
    }
}
