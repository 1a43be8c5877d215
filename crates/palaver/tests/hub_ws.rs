//! End-to-end hub tests over real loopback websockets.
//!
//! Each test binds an ephemeral port, drives raw websocket peers against
//! the hub, and asserts on the frames that come back.

use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use palaver::HubServer;
use palaverconf::Config;
use palaverproto::Frame;
use pretty_assertions::assert_eq;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

fn ephemeral_config() -> Config {
    Config {
        hub_port: 0,
        ..Config::default()
    }
}

async fn start_hub() -> HubServer {
    HubServer::bind(ephemeral_config())
        .await
        .expect("hub failed to bind")
}

struct TestPeer {
    ws: Ws,
}

impl TestPeer {
    async fn connect(server: &HubServer) -> Self {
        let url = format!("ws://{}", server.local_addr());
        let (ws, _) = connect_async(&url).await.expect("connect failed");
        Self { ws }
    }

    async fn send(&mut self, text: &str) {
        self.ws
            .send(WsMessage::text(text.to_string()))
            .await
            .expect("send failed");
    }

    /// Read frames (skipping pings and non-matching types) until one of the
    /// wanted type arrives.
    async fn recv_type(&mut self, frame_type: &str) -> Frame {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), self.ws.next())
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {frame_type}"))
                .expect("connection closed")
                .expect("websocket error");
            if let WsMessage::Text(text) = msg {
                let frame = Frame::parse(text.as_str()).expect("invalid frame from hub");
                if frame.frame_type() == frame_type {
                    return frame;
                }
            }
        }
    }

    /// Read until the peer closes the stream.
    async fn recv_close(&mut self) {
        loop {
            match tokio::time::timeout(Duration::from_secs(5), self.ws.next())
                .await
                .expect("timed out waiting for close")
            {
                None | Some(Ok(WsMessage::Close(_))) | Some(Err(_)) => return,
                Some(Ok(_)) => {}
            }
        }
    }

    async fn register_requester(&mut self, id: &str, name: &str) -> Frame {
        self.send(&format!(
            r#"{{"type":"register_requester","clientInfo":{{"id":"{id}","name":"{name}","type":"test"}}}}"#
        ))
        .await;
        self.recv_type("registration_confirmed").await
    }

    async fn register_automator(&mut self, extension_id: &str) -> Frame {
        self.send(&format!(
            r#"{{"type":"register_automator","extensionId":"{extension_id}"}}"#
        ))
        .await;
        self.recv_type("registration_confirmed").await
    }
}

#[tokio::test]
async fn welcome_then_register_within_a_second() {
    let server = start_hub().await;
    let start = Instant::now();

    let mut peer = TestPeer::connect(&server).await;
    let welcome = peer.recv_type("welcome").await;
    assert!(welcome.get("assignedId").unwrap().is_u64());
    assert!(welcome.get("hub").unwrap()["version"].is_string());

    let confirmed = peer.register_requester("a", "A").await;
    assert_eq!(confirmed.get_str("clientId"), Some("a"));
    assert_eq!(confirmed.get_str("role"), Some("requester"));

    assert!(
        start.elapsed() < Duration::from_secs(1),
        "welcome/register took {:?}",
        start.elapsed()
    );
    server.shutdown().await;
}

#[tokio::test]
async fn relay_happy_path() {
    let server = start_hub().await;

    let mut requester = TestPeer::connect(&server).await;
    requester.register_requester("a", "A").await;

    let mut automator = TestPeer::connect(&server).await;
    automator.register_automator("ext-1").await;

    requester
        .send(r#"{"type":"request","requestId":"r1","toolName":"tab_create","params":{}}"#)
        .await;

    let forwarded = automator.recv_type("request").await;
    assert_eq!(forwarded.request_id(), Some("r1"));
    assert_eq!(forwarded.get_str("sourceClientId"), Some("a"));
    assert_eq!(forwarded.get_str("sourceClientName"), Some("A"));
    assert!(forwarded.get("hubMessageId").unwrap().is_u64());

    automator
        .send(r#"{"type":"response","requestId":"r1","targetClientId":"a","result":{"tabId":42}}"#)
        .await;

    let response = requester.recv_type("response").await;
    assert_eq!(response.request_id(), Some("r1"));
    assert_eq!(response.get("result").unwrap()["tabId"], 42);

    server.shutdown().await;
}

#[tokio::test]
async fn automator_missing_is_rejected_quickly() {
    let server = start_hub().await;
    let mut requester = TestPeer::connect(&server).await;
    requester.register_requester("a", "A").await;

    let start = Instant::now();
    requester
        .send(r#"{"type":"request","requestId":"r2","toolName":"tab_create","params":{}}"#)
        .await;

    let error = requester.recv_type("error").await;
    assert_eq!(error.request_id(), Some("r2"));
    assert_eq!(
        error.get("error").unwrap()["code"],
        "AUTOMATOR_NOT_CONNECTED"
    );
    assert!(
        start.elapsed() < Duration::from_millis(500),
        "rejection took {:?}",
        start.elapsed()
    );

    server.shutdown().await;
}

#[tokio::test]
async fn automator_replacement_closes_the_old_one() {
    let server = start_hub().await;

    let mut old = TestPeer::connect(&server).await;
    old.register_automator("ext-old").await;

    let mut new = TestPeer::connect(&server).await;
    new.register_automator("ext-new").await;

    let shutdown = old.recv_type("hub_shutdown").await;
    assert_eq!(shutdown.get_str("reason"), Some("replaced"));
    old.recv_close().await;

    // The replacement is the live automator now.
    let mut requester = TestPeer::connect(&server).await;
    requester.register_requester("a", "A").await;
    new.recv_type("client_list_update").await;

    server.shutdown().await;
}

#[tokio::test]
async fn progress_milestones_reach_the_owner_and_wait_resolves() {
    let server = start_hub().await;

    let mut automator = TestPeer::connect(&server).await;
    automator.register_automator("ext-1").await;

    let mut requester = TestPeer::connect(&server).await;
    requester.register_requester("a", "A").await;

    requester
        .send(r#"{"type":"request","requestId":"r1","toolName":"tab_send_message","operationId":"op1","params":{}}"#)
        .await;
    automator.recv_type("request").await;

    requester
        .send(r#"{"type":"wait_for_operation","requestId":"w1","operationId":"op1","timeoutMs":30000}"#)
        .await;

    for milestone in ["input_filled", "send_clicked"] {
        automator
            .send(&format!(
                r#"{{"type":"progress","operationId":"op1","milestone":"{milestone}"}}"#
            ))
            .await;
        let seen = requester.recv_type("progress").await;
        assert_eq!(seen.get_str("milestone"), Some(milestone));
    }

    automator
        .send(r#"{"type":"progress","operationId":"op1","milestone":"completed","data":{"tabId":42}}"#)
        .await;

    let response = requester.recv_type("response").await;
    assert_eq!(response.request_id(), Some("w1"));
    let result = response.get("result").unwrap();
    assert_eq!(result["status"], "completed");
    assert_eq!(result["result"]["tabId"], 42);

    server.shutdown().await;
}

#[tokio::test]
async fn keepalive_returns_server_time() {
    let server = start_hub().await;
    let mut peer = TestPeer::connect(&server).await;
    peer.register_requester("a", "A").await;

    peer.send(r#"{"type":"keepalive"}"#).await;
    let response = peer.recv_type("keepalive_response").await;
    assert!(response.get("serverTime").unwrap().is_i64());

    server.shutdown().await;
}

#[tokio::test]
async fn oversized_payload_is_rejected_without_closing() {
    let config = Config {
        hub_port: 0,
        max_payload_bytes: 1024,
        ..Config::default()
    };
    let server = HubServer::bind(config).await.expect("bind");

    let mut peer = TestPeer::connect(&server).await;
    peer.register_requester("a", "A").await;

    let big = "x".repeat(4096);
    peer.send(&format!(
        r#"{{"type":"request","requestId":"big","toolName":"t","params":{{"blob":"{big}"}}}}"#
    ))
    .await;

    let error = peer.recv_type("error").await;
    assert_eq!(error.get("error").unwrap()["code"], "INVALID_PARAM_TYPE");

    // The connection survives.
    peer.send(r#"{"type":"keepalive"}"#).await;
    peer.recv_type("keepalive_response").await;

    server.shutdown().await;
}

#[tokio::test]
async fn one_mib_payload_round_trips() {
    let server = start_hub().await;

    let mut automator = TestPeer::connect(&server).await;
    automator.register_automator("ext-1").await;
    let mut requester = TestPeer::connect(&server).await;
    requester.register_requester("a", "A").await;

    let blob = "y".repeat(1024 * 1024);
    requester
        .send(&format!(
            r#"{{"type":"request","requestId":"r1","toolName":"blob_echo","params":{{"blob":"{blob}"}}}}"#
        ))
        .await;

    let forwarded = automator.recv_type("request").await;
    let received = forwarded.get("params").unwrap()["blob"].as_str().unwrap();
    assert_eq!(received.len(), blob.len());

    automator
        .send(&format!(
            r#"{{"type":"response","requestId":"r1","targetClientId":"a","result":{{"blob":"{blob}"}}}}"#
        ))
        .await;
    let response = requester.recv_type("response").await;
    let echoed = response.get("result").unwrap()["blob"].as_str().unwrap();
    assert_eq!(echoed.len(), blob.len());

    server.shutdown().await;
}

#[tokio::test]
async fn malformed_frames_get_an_error_and_the_connection_survives() {
    let server = start_hub().await;
    let mut peer = TestPeer::connect(&server).await;
    peer.recv_type("welcome").await;

    peer.send("this is not json").await;
    let error = peer.recv_type("error").await;
    assert!(error.request_id().is_none());
    assert_eq!(error.get("error").unwrap()["code"], "INVALID_PARAM_TYPE");

    // Literal control strings are ignored entirely.
    peer.send("ping").await;

    peer.register_requester("a", "A").await;
    server.shutdown().await;
}

#[tokio::test]
async fn late_response_for_departed_requester_is_dropped() {
    let server = start_hub().await;

    let mut automator = TestPeer::connect(&server).await;
    automator.register_automator("ext-1").await;

    let mut requester = TestPeer::connect(&server).await;
    requester.register_requester("a", "A").await;
    requester
        .send(r#"{"type":"request","requestId":"r5","toolName":"slow_tool","params":{}}"#)
        .await;
    automator.recv_type("request").await;

    // Requester vanishes mid-flight.
    drop(requester);
    automator.recv_type("client_list_update").await;

    // The unsolicited reply is dropped; the automator stays healthy.
    automator
        .send(r#"{"type":"response","requestId":"r5","result":{}}"#)
        .await;
    automator.send(r#"{"type":"keepalive"}"#).await;
    automator.recv_type("keepalive_response").await;

    server.shutdown().await;
}

#[tokio::test]
async fn duplicate_ids_are_suffixed_over_the_wire() {
    let server = start_hub().await;

    let mut first = TestPeer::connect(&server).await;
    let confirmed = first.register_requester("tool", "First").await;
    assert_eq!(confirmed.get_str("clientId"), Some("tool"));

    let mut second = TestPeer::connect(&server).await;
    let confirmed = second.register_requester("tool", "Second").await;
    assert_eq!(confirmed.get_str("clientId"), Some("tool-2"));

    server.shutdown().await;
}

#[tokio::test]
async fn shutdown_notifies_connected_clients() {
    let server = start_hub().await;
    let mut peer = TestPeer::connect(&server).await;
    peer.register_requester("a", "A").await;

    let shutdown = tokio::spawn(server.shutdown());
    let notice = peer.recv_type("hub_shutdown").await;
    assert_eq!(notice.get_str("reason"), Some("shutdown"));
    peer.recv_close().await;
    shutdown.await.expect("shutdown task failed");
}

#[tokio::test]
async fn health_endpoint_reports_counts() {
    let server = start_hub().await;
    let hub = server.hub();

    let mut peer = TestPeer::connect(&server).await;
    peer.register_requester("a", "A").await;
    hub.operations.register("op1", "a", None);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let health_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, palaver::health::router(hub)).await.ok();
    });

    let body: serde_json::Value = reqwest::get(format!("http://{}/health", health_addr))
        .await
        .expect("health request failed")
        .json()
        .await
        .expect("health body was not json");

    assert_eq!(body["state"], "running");
    assert_eq!(body["clientCount"], 1);
    assert_eq!(body["operationsCount"], 1);

    server.shutdown().await;
}
