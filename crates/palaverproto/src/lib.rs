//! palaverproto - Protocol types for the Palaver websocket hub
//!
//! This crate defines the messages exchanged between the hub, the single
//! Automator (a browser extension), and any number of Requesters (tool
//! clients). Messages are JSON objects, one per websocket text frame, with a
//! string `type` discriminator and an integer `timestamp` in ms since epoch.
//!
//! Two views of the wire exist on purpose:
//!
//! - [`Frame`] is the raw object. The hub relays requester traffic it does
//!   not understand (new tools need no hub changes), so the relay path
//!   annotates the raw object and re-serializes it, preserving unknown
//!   fields.
//! - [`Message`] is the typed union for everything handled locally by the
//!   hub or the client.

pub mod error;
pub mod frame;
pub mod version;

pub use error::{ErrorCode, WireError};
pub use frame::{is_control_text, Frame, FrameError};
pub use version::{Compat, PROTOCOL_VERSION};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Current wall time in ms since epoch, as stamped on outbound frames.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Role a connection assumes after registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Unassigned,
    Automator,
    Requester,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Unassigned => "unassigned",
            Role::Automator => "automator",
            Role::Requester => "requester",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Identity a Requester presents at registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    /// Stable client id; synthesized by the hub when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Human-readable name.
    pub name: String,
    /// Free-form type tag ("mcp", "cli", ...).
    #[serde(rename = "type", default)]
    pub client_type: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Client semantic version, for drift reporting.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl ClientInfo {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            client_type: String::new(),
            capabilities: Vec::new(),
            version: Some(PROTOCOL_VERSION.to_string()),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// One entry of a `client_list_update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSummary {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub client_type: String,
    pub capabilities: Vec<String>,
    /// Registration wall time, ms since epoch.
    pub registered_at: i64,
    pub request_count: u64,
    /// Last observed activity, ms since epoch.
    pub last_activity: i64,
}

/// Hub identity advertised in `welcome` and `registration_confirmed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubInfo {
    pub version: String,
    pub hub_id: String,
    /// Hub start wall time, ms since epoch.
    pub started_at: i64,
}

/// All typed message shapes in the Palaver system.
///
/// The hub's router treats this as the allow-list of locally-understood
/// types; anything a Requester sends outside it is assumed to be an
/// extension tool call and forwarded raw.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Message {
    // === Registration ===
    RegisterAutomator {
        extension_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        version: Option<String>,
    },
    RegisterRequester {
        client_info: ClientInfo,
    },

    // === Keepalive (application level; liveness is websocket ping/pong) ===
    Keepalive,
    KeepaliveResponse {
        /// Server wall time, ms since epoch.
        server_time: i64,
    },

    // === Request/response relay ===
    Request {
        request_id: String,
        tool_name: String,
        #[serde(default)]
        params: Value,
    },
    Response {
        request_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        target_client_id: Option<String>,
        #[serde(default)]
        result: Value,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        target_client_id: Option<String>,
        error: WireError,
    },

    // === Operation progress (Automator -> hub -> owning Requester) ===
    Progress {
        operation_id: String,
        milestone: String,
        #[serde(default)]
        data: Value,
    },

    // === Hub -> client ===
    Welcome {
        /// Hub-assigned connection id.
        assigned_id: u64,
        hub: HubInfo,
    },
    RegistrationConfirmed {
        role: Role,
        /// Final client id (may carry a uniqueness suffix).
        client_id: String,
        hub: HubInfo,
    },
    ClientListUpdate {
        clients: Vec<ClientSummary>,
    },
    HubShutdown {
        reason: String,
    },

    // === Operation surface handled by the hub itself ===
    WaitForOperation {
        request_id: String,
        operation_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    GetOperation {
        request_id: String,
        operation_id: String,
    },
    CancelOperation {
        request_id: String,
        operation_id: String,
    },
}

impl Message {
    /// Serialize into a [`Frame`], stamping `timestamp`.
    pub fn into_frame(self, now_ms: i64) -> Frame {
        let value = serde_json::to_value(&self).expect("Message serializes to a JSON object");
        let mut frame = Frame::from_value(value).expect("Message carries a `type` tag");
        frame.insert("timestamp", Value::from(now_ms));
        frame
    }

    /// Serialize straight to frame text, stamping `timestamp`.
    pub fn to_text(self, now_ms: i64) -> String {
        self.into_frame(now_ms).to_text()
    }

    /// An `error` frame addressed back to a request.
    pub fn error_for(request_id: Option<String>, error: WireError) -> Self {
        Message::Error {
            request_id,
            target_client_id: None,
            error,
        }
    }
}
