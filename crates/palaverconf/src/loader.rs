//! Config file discovery, loading, and environment variable overlay.

use crate::{Config, ConfigError};
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files, optionally with a CLI override path.
///
/// Returns paths in load order (system, user, local/cli). Only returns files
/// that exist. A CLI path replaces the local override.
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/palaver/config.toml");
    if system.exists() {
        files.push(system);
    }

    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("palaver/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("palaver.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Load config: discovered files in order (later wins per field via full
/// re-parse of merged tables), then the environment overlay.
pub fn load(cli_path: Option<&Path>) -> Result<(Config, ConfigSources), ConfigError> {
    let mut sources = ConfigSources::default();
    let mut merged = toml::Table::new();

    for path in discover_config_files_with_override(cli_path) {
        let contents = std::fs::read_to_string(&path).map_err(|e| ConfigError::FileRead {
            path: path.clone(),
            source: e,
        })?;
        let table: toml::Table =
            contents
                .parse()
                .map_err(|e: toml::de::Error| ConfigError::Parse {
                    path: path.clone(),
                    message: e.to_string(),
                })?;
        for (key, value) in table {
            merged.insert(key, value);
        }
        sources.files.push(path);
    }

    let mut config: Config =
        toml::Table::try_into(merged).map_err(|e| ConfigError::Parse {
            path: PathBuf::from("<merged>"),
            message: e.to_string(),
        })?;

    apply_env(&mut config, &mut sources)?;
    Ok((config, sources))
}

fn env_var(name: &'static str) -> Option<(&'static str, String)> {
    env::var(name).ok().map(|v| (name, v))
}

fn parse_env<T: std::str::FromStr>(
    var: &'static str,
    value: &str,
) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        var,
        value: value.to_string(),
        message: format!("expected a {}", std::any::type_name::<T>()),
    })
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            var,
            value: value.to_string(),
            message: "expected a boolean".to_string(),
        }),
    }
}

/// Apply the documented environment knobs on top of file config.
fn apply_env(config: &mut Config, sources: &mut ConfigSources) -> Result<(), ConfigError> {
    if let Some((var, v)) = env_var("HUB_PORT") {
        config.hub_port = parse_env(var, &v)?;
        sources.env_overrides.push(var.to_string());
    }
    if let Some((var, v)) = env_var("HEALTH_PORT") {
        config.health_port = Some(parse_env(var, &v)?);
        sources.env_overrides.push(var.to_string());
    }
    if let Some((var, v)) = env_var("OPERATION_TIMEOUT_MS") {
        config.operation_timeout_ms = parse_env(var, &v)?;
        sources.env_overrides.push(var.to_string());
    }
    if let Some((var, v)) = env_var("OPERATION_CLEANUP_AGE_MS") {
        config.operation_cleanup_age_ms = parse_env(var, &v)?;
        sources.env_overrides.push(var.to_string());
    }
    if let Some((var, v)) = env_var("OPERATION_ABANDONED_AGE_MS") {
        config.operation_abandoned_age_ms = Some(parse_env(var, &v)?);
        sources.env_overrides.push(var.to_string());
    }
    if let Some((var, v)) = env_var("KEEPALIVE_INTERVAL_MS") {
        config.keepalive_interval_ms = parse_env(var, &v)?;
        sources.env_overrides.push(var.to_string());
    }
    if let Some((var, v)) = env_var("RECONNECT_BASE_MS") {
        config.reconnect_base_ms = parse_env(var, &v)?;
        sources.env_overrides.push(var.to_string());
    }
    if let Some((var, v)) = env_var("RECONNECT_MAX_MS") {
        config.reconnect_max_ms = parse_env(var, &v)?;
        sources.env_overrides.push(var.to_string());
    }
    if let Some((var, v)) = env_var("MAX_RECONNECT_ATTEMPTS") {
        config.max_reconnect_attempts = Some(parse_env(var, &v)?);
        sources.env_overrides.push(var.to_string());
    }
    if let Some((var, v)) = env_var("LOG_LEVEL") {
        config.log_level = v;
        sources.env_overrides.push(var.to_string());
    }
    if let Some((var, v)) = env_var("FORCE_HUB_CREATION") {
        config.force_hub_creation = parse_bool(var, &v)?;
        sources.env_overrides.push(var.to_string());
    }
    if let Some((var, v)) = env_var("PARENT_PID") {
        config.parent_pid = Some(parse_env(var, &v)?);
        sources.env_overrides.push(var.to_string());
    }
    if let Some((var, v)) = env_var("MAX_PAYLOAD_BYTES") {
        config.max_payload_bytes = parse_env(var, &v)?;
        sources.env_overrides.push(var.to_string());
    }
    if let Some((var, v)) = env_var("SNAPSHOT_PATH") {
        config.snapshot_path = Some(PathBuf::from(v));
        sources.env_overrides.push(var.to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn cli_path_wins_over_local() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "hub_port = 40000").unwrap();

        let files = discover_config_files_with_override(Some(&path));
        assert!(files.contains(&path));
    }

    #[test]
    fn file_values_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("palaver.toml");
        std::fs::write(
            &path,
            "hub_port = 41000\nlog_level = \"debug\"\nmax_payload_bytes = 1024\n",
        )
        .unwrap();

        let (config, sources) = load(Some(&path)).unwrap();
        assert_eq!(config.hub_port, 41000);
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.max_payload_bytes, 1024);
        assert_eq!(sources.files, vec![path]);
    }

    #[test]
    fn bool_parsing_is_lenient() {
        assert!(parse_bool("FORCE_HUB_CREATION", "TRUE").unwrap());
        assert!(parse_bool("FORCE_HUB_CREATION", "1").unwrap());
        assert!(!parse_bool("FORCE_HUB_CREATION", "off").unwrap());
        assert!(parse_bool("FORCE_HUB_CREATION", "maybe").is_err());
    }

    #[test]
    fn invalid_numeric_value_is_reported() {
        let err = parse_env::<u16>("HUB_PORT", "not-a-port").unwrap_err();
        match err {
            ConfigError::InvalidValue { var, .. } => assert_eq!(var, "HUB_PORT"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
