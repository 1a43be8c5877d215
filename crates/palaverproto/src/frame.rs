//! Raw frame handling for the hub's relay path.
//!
//! Every wire message is one JSON object per websocket text frame, carrying a
//! string `type` discriminator and an integer `timestamp` (ms since epoch).
//! The hub forwards most requester traffic without understanding it, so the
//! relay path works on the raw object: parse once, annotate in place,
//! serialize back out. Foreign keys survive untouched; only the fields the
//! hub adds (`sourceClientId`, `sourceClientName`, `hubMessageId`) change.
//!
//! Typed views (`Frame::decode`) are used for the messages the hub handles
//! locally; see the `Message` enum in the crate root.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors produced while parsing or decoding a frame.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame is not valid JSON: {0}")]
    NotJson(String),

    #[error("frame is not a JSON object")]
    NotObject,

    #[error("frame has no `type` field")]
    MissingType,

    #[error("frame `type` is not a string")]
    NonStringType,

    #[error("failed to decode {type_name}: {message}")]
    Decode {
        type_name: &'static str,
        message: String,
    },
}

/// A parsed wire frame: a JSON object with a string `type`.
///
/// Owns the full object so unknown fields round-trip through the relay.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    obj: Map<String, Value>,
}

impl Frame {
    /// Parse a text frame. Fails unless the text is a JSON object with a
    /// string `type` field.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| FrameError::NotJson(e.to_string()))?;
        Self::from_value(value)
    }

    /// Build a frame from an already-parsed JSON value.
    pub fn from_value(value: Value) -> Result<Self, FrameError> {
        let obj = match value {
            Value::Object(obj) => obj,
            _ => return Err(FrameError::NotObject),
        };
        match obj.get("type") {
            Some(Value::String(_)) => Ok(Self { obj }),
            Some(_) => Err(FrameError::NonStringType),
            None => Err(FrameError::MissingType),
        }
    }

    /// The `type` discriminator. Guaranteed present by construction.
    pub fn frame_type(&self) -> &str {
        match self.obj.get("type") {
            Some(Value::String(s)) => s,
            _ => unreachable!("Frame invariant: validated at construction"),
        }
    }

    /// `timestamp` in ms since epoch, accepting both integer and numeric
    /// string encodings (the wire allows either).
    pub fn timestamp_ms(&self) -> Option<i64> {
        match self.obj.get("timestamp") {
            Some(Value::Number(n)) => n.as_i64(),
            Some(Value::String(s)) => s.parse().ok(),
            _ => None,
        }
    }

    /// `requestId`, if present.
    pub fn request_id(&self) -> Option<&str> {
        self.get_str("requestId")
    }

    /// `toolName`, if present.
    pub fn tool_name(&self) -> Option<&str> {
        self.get_str("toolName")
    }

    /// `targetClientId`, if present.
    pub fn target_client_id(&self) -> Option<&str> {
        self.get_str("targetClientId")
    }

    /// `operationId`, looked up at the top level first, then inside
    /// `params` (async tools may declare it either way).
    pub fn operation_id(&self) -> Option<&str> {
        self.get_str("operationId").or_else(|| {
            self.obj
                .get("params")
                .and_then(|p| p.get("operationId"))
                .and_then(|v| v.as_str())
        })
    }

    /// String field accessor.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.obj.get(key).and_then(|v| v.as_str())
    }

    /// Raw field accessor.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.obj.get(key)
    }

    /// Insert or replace a field. Used by the hub to annotate forwarded
    /// requests; never touches fields it did not add.
    pub fn insert(&mut self, key: &str, value: Value) {
        self.obj.insert(key.to_string(), value);
    }

    /// Serialize back to a text frame.
    pub fn to_text(&self) -> String {
        // A Map of valid JSON values cannot fail to serialize.
        serde_json::to_string(&Value::Object(self.obj.clone()))
            .unwrap_or_else(|_| String::from("{}"))
    }

    /// Decode the whole frame into a typed message.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, FrameError> {
        serde_json::from_value(Value::Object(self.obj.clone())).map_err(|e| FrameError::Decode {
            type_name: std::any::type_name::<T>(),
            message: e.to_string(),
        })
    }

    /// Consume the frame, returning the underlying object.
    pub fn into_value(self) -> Value {
        Value::Object(self.obj)
    }
}

/// Literal "ping"/"pong" text frames sent by some websocket stacks in place
/// of control frames. Ignored by the connection layer without logging above
/// trace level.
pub fn is_control_text(text: &str) -> bool {
    matches!(text.trim(), "ping" | "pong")
}
