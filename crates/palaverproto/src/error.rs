//! Wire error taxonomy.
//!
//! Every error delivered to a client is `{ code, message, details? }`. The
//! `message` strings are stable and safe to present; `details` carries
//! whatever diagnostic context the producing side had.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Stable error codes, SCREAMING_SNAKE_CASE on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation
    MissingParam,
    InvalidParamType,
    InvalidUuid,
    InvalidUrl,

    // Routing
    AutomatorNotConnected,
    TargetClientGone,
    UnknownMessageType,
    UnknownOperation,

    // Timing
    RequestTimeout,
    OperationTimeout,
    Reconnected,

    // Lifecycle
    HubShuttingDown,
    ReplacedByNewAutomator,
    Abandoned,

    // Resource
    PortInUse,
    PortPermissionDenied,
}

impl ErrorCode {
    /// Canonical, presentable message for this code.
    pub fn message(&self) -> &'static str {
        match self {
            ErrorCode::MissingParam => "a required parameter is missing",
            ErrorCode::InvalidParamType => "a parameter has the wrong type or exceeds limits",
            ErrorCode::InvalidUuid => "identifier is not a valid UUID",
            ErrorCode::InvalidUrl => "URL could not be parsed",
            ErrorCode::AutomatorNotConnected => "no automator is connected to the hub",
            ErrorCode::TargetClientGone => "the target client has disconnected",
            ErrorCode::UnknownMessageType => "message type is not recognized",
            ErrorCode::UnknownOperation => "no such operation",
            ErrorCode::RequestTimeout => "request timed out waiting for a response",
            ErrorCode::OperationTimeout => "operation did not reach a terminal state in time",
            ErrorCode::Reconnected => "connection was re-established; pending request invalidated",
            ErrorCode::HubShuttingDown => "the hub is shutting down",
            ErrorCode::ReplacedByNewAutomator => "a new automator registered and replaced this one",
            ErrorCode::Abandoned => "operation was abandoned without reaching a terminal state",
            ErrorCode::PortInUse => "the hub port is already in use",
            ErrorCode::PortPermissionDenied => "permission denied binding the hub port",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::MissingParam => "MISSING_PARAM",
            ErrorCode::InvalidParamType => "INVALID_PARAM_TYPE",
            ErrorCode::InvalidUuid => "INVALID_UUID",
            ErrorCode::InvalidUrl => "INVALID_URL",
            ErrorCode::AutomatorNotConnected => "AUTOMATOR_NOT_CONNECTED",
            ErrorCode::TargetClientGone => "TARGET_CLIENT_GONE",
            ErrorCode::UnknownMessageType => "UNKNOWN_MESSAGE_TYPE",
            ErrorCode::UnknownOperation => "UNKNOWN_OPERATION",
            ErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ErrorCode::OperationTimeout => "OPERATION_TIMEOUT",
            ErrorCode::Reconnected => "RECONNECTED",
            ErrorCode::HubShuttingDown => "HUB_SHUTTING_DOWN",
            ErrorCode::ReplacedByNewAutomator => "REPLACED_BY_NEW_AUTOMATOR",
            ErrorCode::Abandoned => "ABANDONED",
            ErrorCode::PortInUse => "PORT_IN_USE",
            ErrorCode::PortPermissionDenied => "PORT_PERMISSION_DENIED",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The error payload carried in `error` frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{code}: {message}")]
pub struct WireError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl WireError {
    /// Error with the code's canonical message.
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            message: code.message().to_string(),
            details: None,
        }
    }

    /// Override the message (still expected to be stable and presentable).
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl From<ErrorCode> for WireError {
    fn from(code: ErrorCode) -> Self {
        Self::new(code)
    }
}
