// SPDX-License-Identifier: MIT OR Apache-2.0
//! Layered configuration for the agent (`wardend`) and master (`ward-masterd`): a
//! `config.toml` found via `--config` or the current directory, overridable by
//! `WARDEN_*`/`WARD_MASTER_*` environment variables, overridable in turn by CLI flags.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::path::Path;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use warden_error::{AsErrorCode, ErrorCode};

/// Errors arising from configuration loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file was not found.
    #[error("config file not found: {0}")]
    FileNotFound(String),

    /// The file could not be parsed as valid TOML.
    #[error("failed to parse config: {0}")]
    Parse(String),

    /// Semantic validation failed.
    #[error("config validation failed: {0:?}")]
    Invalid(Vec<String>),
}

impl AsErrorCode for ConfigError {
    fn code(&self) -> ErrorCode {
        ErrorCode::InvalidConfig
    }
}

const VALID_LOG_LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];

fn validate_log_level(level: &str, errors: &mut Vec<String>) {
    if !VALID_LOG_LEVELS.contains(&level) {
        errors.push(format!("invalid log_level '{level}'"));
    }
}

// ---------------------------------------------------------------------------
// Agent configuration
// ---------------------------------------------------------------------------

/// Runtime configuration for the agent process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct AgentConfig {
    /// Directory holding `agent.db`, certs, and the module cache.
    pub data_dir: String,
    /// `host:port` of the master's control-plane endpoint.
    pub master_addr: String,
    /// Log level: `error`, `warn`, `info`, `debug`, or `trace`.
    pub log_level: String,
    /// Seconds between catalog/assignment sync polls.
    pub sync_interval_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            data_dir: "/var/lib/warden-agent".into(),
            master_addr: "127.0.0.1:8443".into(),
            log_level: "info".into(),
            sync_interval_secs: 30,
        }
    }
}

/// Load an [`AgentConfig`] from an optional TOML file, then apply `WARDEN_*` env
/// overrides. `path = None` starts from [`AgentConfig::default()`].
///
/// # Errors
/// [`ConfigError::FileNotFound`] or [`ConfigError::Parse`].
pub fn load_agent_config(path: Option<&Path>) -> Result<AgentConfig, ConfigError> {
    let mut config = match path {
        Some(p) => parse_toml(&read_file(p)?)?,
        None => AgentConfig::default(),
    };
    apply_agent_env_overrides(&mut config);
    Ok(config)
}

fn parse_toml(content: &str) -> Result<AgentConfig, ConfigError> {
    toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
}

/// Apply `WARDEN_DATA_DIR`, `WARDEN_MASTER_ADDR`, `WARDEN_LOG_LEVEL`,
/// `WARDEN_SYNC_INTERVAL_SECS` on top of `config`.
pub fn apply_agent_env_overrides(config: &mut AgentConfig) {
    if let Ok(val) = std::env::var("WARDEN_DATA_DIR") {
        config.data_dir = val;
    }
    if let Ok(val) = std::env::var("WARDEN_MASTER_ADDR") {
        config.master_addr = val;
    }
    if let Ok(val) = std::env::var("WARDEN_LOG_LEVEL") {
        config.log_level = val;
    }
    if let Ok(val) = std::env::var("WARDEN_SYNC_INTERVAL_SECS")
        && let Ok(secs) = val.parse()
    {
        config.sync_interval_secs = secs;
    }
}

/// Validate an [`AgentConfig`].
///
/// # Errors
/// [`ConfigError::Invalid`] listing every problem found.
pub fn validate_agent_config(config: &AgentConfig) -> Result<(), ConfigError> {
    let mut errors = Vec::new();
    validate_log_level(&config.log_level, &mut errors);
    if config.data_dir.trim().is_empty() {
        errors.push("data_dir must not be empty".into());
    }
    if config.master_addr.trim().is_empty() {
        errors.push("master_addr must not be empty".into());
    }
    if config.sync_interval_secs == 0 {
        errors.push("sync_interval_secs must be at least 1".into());
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::Invalid(errors))
    }
}

// ---------------------------------------------------------------------------
// Master configuration
// ---------------------------------------------------------------------------

/// Runtime configuration for the master process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct MasterConfig {
    /// Directory holding `master.db`, the CA, images, and the module signing key.
    pub data_dir: String,
    /// Address the control-plane and admin REST surface bind on.
    pub bind_addr: String,
    /// Log level: `error`, `warn`, `info`, `debug`, or `trace`.
    pub log_level: String,
    /// Sandbox node endpoints available for high-interaction session escalation.
    pub sandbox_nodes: Vec<String>,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            data_dir: "/var/lib/warden-master".into(),
            bind_addr: "0.0.0.0:8443".into(),
            log_level: "info".into(),
            sandbox_nodes: Vec::new(),
        }
    }
}

/// Load a [`MasterConfig`] from an optional TOML file, then apply `WARD_MASTER_*` env
/// overrides. `path = None` starts from [`MasterConfig::default()`].
///
/// # Errors
/// [`ConfigError::FileNotFound`] or [`ConfigError::Parse`].
pub fn load_master_config(path: Option<&Path>) -> Result<MasterConfig, ConfigError> {
    let mut config = match path {
        Some(p) => parse_master_toml(&read_file(p)?)?,
        None => MasterConfig::default(),
    };
    apply_master_env_overrides(&mut config);
    Ok(config)
}

fn parse_master_toml(content: &str) -> Result<MasterConfig, ConfigError> {
    toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
}

/// Apply `WARD_MASTER_DATA_DIR`, `WARD_MASTER_BIND_ADDR`, `WARD_MASTER_LOG_LEVEL`,
/// `WARD_MASTER_SANDBOX_NODES` (comma-separated) on top of `config`.
pub fn apply_master_env_overrides(config: &mut MasterConfig) {
    if let Ok(val) = std::env::var("WARD_MASTER_DATA_DIR") {
        config.data_dir = val;
    }
    if let Ok(val) = std::env::var("WARD_MASTER_BIND_ADDR") {
        config.bind_addr = val;
    }
    if let Ok(val) = std::env::var("WARD_MASTER_LOG_LEVEL") {
        config.log_level = val;
    }
    if let Ok(val) = std::env::var("WARD_MASTER_SANDBOX_NODES") {
        config.sandbox_nodes = val
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
    }
}

/// Validate a [`MasterConfig`].
///
/// # Errors
/// [`ConfigError::Invalid`] listing every problem found.
pub fn validate_master_config(config: &MasterConfig) -> Result<(), ConfigError> {
    let mut errors = Vec::new();
    validate_log_level(&config.log_level, &mut errors);
    if config.data_dir.trim().is_empty() {
        errors.push("data_dir must not be empty".into());
    }
    if config.bind_addr.trim().is_empty() {
        errors.push("bind_addr must not be empty".into());
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::Invalid(errors))
    }
}

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound(path.display().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn agent_default_is_valid() {
        validate_agent_config(&AgentConfig::default()).unwrap();
    }

    #[test]
    fn master_default_is_valid() {
        validate_master_config(&MasterConfig::default()).unwrap();
    }

    #[test]
    fn agent_config_rejects_bad_log_level() {
        let config = AgentConfig {
            log_level: "verbose".into(),
            ..AgentConfig::default()
        };
        assert!(matches!(
            validate_agent_config(&config),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn agent_config_rejects_zero_sync_interval() {
        let config = AgentConfig {
            sync_interval_secs: 0,
            ..AgentConfig::default()
        };
        assert!(matches!(
            validate_agent_config(&config),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn load_agent_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "master_addr = \"10.0.0.1:8443\"\nlog_level = \"debug\"").unwrap();
        let config = load_agent_config(Some(&path)).unwrap();
        assert_eq!(config.master_addr, "10.0.0.1:8443");
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.sync_interval_secs, 30); // untouched default
    }

    #[test]
    fn load_missing_agent_config_file_errors() {
        let err = load_agent_config(Some(Path::new("/nonexistent/config.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }

    #[test]
    fn master_sandbox_nodes_env_override_splits_on_comma() {
        let mut config = MasterConfig::default();
        // SAFETY-equivalent: tests run single-threaded per-process for env vars in
        // practice, but avoid relying on this; set and immediately read back.
        unsafe {
            std::env::set_var("WARD_MASTER_SANDBOX_NODES", "10.0.0.1:9000, 10.0.0.2:9000");
        }
        apply_master_env_overrides(&mut config);
        unsafe {
            std::env::remove_var("WARD_MASTER_SANDBOX_NODES");
        }
        assert_eq!(
            config.sandbox_nodes,
            vec!["10.0.0.1:9000".to_string(), "10.0.0.2:9000".to_string()]
        );
    }
}
