//! Minimal configuration loading for Palaver.
//!
//! This crate provides configuration loading with minimal dependencies,
//! imported by both the hub and the client without dragging either's
//! runtime stack along.
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/palaver/config.toml` (system)
//! 2. `~/.config/palaver/config.toml` (user)
//! 3. `./palaver.toml` (local override, or `--config` path)
//! 4. Environment variables
//!
//! # Environment variables
//!
//! The env knobs are the system's external interface and are deliberately
//! unprefixed: `HUB_PORT`, `HEALTH_PORT`, `OPERATION_TIMEOUT_MS`,
//! `OPERATION_CLEANUP_AGE_MS`, `OPERATION_ABANDONED_AGE_MS`,
//! `KEEPALIVE_INTERVAL_MS`, `RECONNECT_BASE_MS`, `RECONNECT_MAX_MS`,
//! `MAX_RECONNECT_ATTEMPTS`, `LOG_LEVEL`, `FORCE_HUB_CREATION`,
//! `PARENT_PID`, `MAX_PAYLOAD_BYTES`, `SNAPSHOT_PATH`.
//!
//! # Example Config
//!
//! ```toml
//! hub_port = 54321
//! health_port = 54322
//! operation_timeout_ms = 180000
//! log_level = "info"
//! snapshot_path = "/var/lib/palaver/operations.json"
//! ```

pub mod loader;

pub use loader::{discover_config_files_with_override, ConfigSources};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid value for {var}: {value:?} ({message})")]
    InvalidValue {
        var: &'static str,
        value: String,
        message: String,
    },
}

fn default_hub_port() -> u16 {
    54321
}
fn default_operation_timeout_ms() -> u64 {
    180_000
}
fn default_operation_cleanup_age_ms() -> u64 {
    3_600_000
}
fn default_keepalive_interval_ms() -> u64 {
    30_000
}
fn default_reconnect_base_ms() -> u64 {
    1_000
}
fn default_reconnect_max_ms() -> u64 {
    30_000
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_max_payload_bytes() -> usize {
    8 * 1024 * 1024
}

/// All Palaver configuration, shared by hub and client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Websocket bind/connect port on loopback.
    pub hub_port: u16,
    /// If set, the hub serves an HTTP health endpoint on this port.
    pub health_port: Option<u16>,
    /// Default per-request deadline for extension calls.
    pub operation_timeout_ms: u64,
    /// Terminal operations older than this are swept.
    pub operation_cleanup_age_ms: u64,
    /// Hard ceiling for non-terminal operations; `None` means twice the
    /// cleanup age.
    pub operation_abandoned_age_ms: Option<u64>,
    /// Application-level keepalive cadence.
    pub keepalive_interval_ms: u64,
    /// Reconnect backoff base delay.
    pub reconnect_base_ms: u64,
    /// Reconnect backoff ceiling.
    pub reconnect_max_ms: u64,
    /// `None` means unbounded.
    pub max_reconnect_attempts: Option<u32>,
    /// error | warn | info | debug | verbose
    pub log_level: String,
    /// Skip discovery and always start an embedded hub.
    pub force_hub_creation: bool,
    /// Enables the parent-liveness monitor.
    pub parent_pid: Option<u32>,
    /// Inbound frames larger than this are rejected.
    pub max_payload_bytes: usize,
    /// Enables the operation snapshot on graceful shutdown.
    pub snapshot_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hub_port: default_hub_port(),
            health_port: None,
            operation_timeout_ms: default_operation_timeout_ms(),
            operation_cleanup_age_ms: default_operation_cleanup_age_ms(),
            operation_abandoned_age_ms: None,
            keepalive_interval_ms: default_keepalive_interval_ms(),
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            max_reconnect_attempts: None,
            log_level: default_log_level(),
            force_hub_creation: false,
            parent_pid: None,
            max_payload_bytes: default_max_payload_bytes(),
            snapshot_path: None,
        }
    }
}

impl Config {
    /// Load from discovered files plus environment overlay.
    pub fn load() -> Result<Config, ConfigError> {
        Ok(Self::load_with_sources_from(None)?.0)
    }

    /// Load, reporting where every value came from.
    pub fn load_with_sources_from(
        cli_path: Option<&Path>,
    ) -> Result<(Config, ConfigSources), ConfigError> {
        loader::load(cli_path)
    }

    /// The non-terminal hard ceiling, defaulting to twice the cleanup age.
    pub fn abandoned_age_ms(&self) -> u64 {
        self.operation_abandoned_age_ms
            .unwrap_or(self.operation_cleanup_age_ms.saturating_mul(2))
    }

    /// Map the configured level onto a tracing directive. `verbose` is the
    /// wire name for `trace`.
    pub fn tracing_directive(&self) -> &str {
        match self.log_level.as_str() {
            "error" => "error",
            "warn" => "warn",
            "debug" => "debug",
            "verbose" => "trace",
            _ => "info",
        }
    }

    /// Render the effective configuration as TOML for `--show-config`.
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }
}
