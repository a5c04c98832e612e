//! Per-agent deployment entities: listeners, module assignments, signed config (§3, §4.4, §4.7).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::module::ResourceLimits;

/// How an agent should execute a given module instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Run as an unprivileged local process. The default unless a module requires more.
    #[default]
    Userspace,
    /// Run as a privileged local process (elevated capabilities or root).
    Privileged,
    /// Run under a container runtime (e.g. containerd).
    Containerd,
}

/// How the agent should hand attacker connections to a running module.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionMode {
    /// Duplicate the accepted socket and pass its file descriptor to the module (Unix only).
    Fdpass,
    /// Relay bytes over a loopback TCP connection to the module's data port.
    #[default]
    TcpRelay,
    /// Reserved; currently behaves identically to `tcp_relay`.
    Proxy,
}

/// One bound port an agent listens on for a given assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ListenerAssignment {
    /// Stable listener id, unique within the agent.
    pub id: String,
    /// `"tcp"` or `"udp"`.
    pub protocol: String,
    /// Port to bind on all interfaces.
    pub port: u16,
    /// When true, connections escalate to a sandbox session instead of a local module.
    #[serde(default)]
    pub high_interaction: bool,
}

/// A single module the agent should run, with its listeners and overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ModuleAssignment {
    /// Module id to run.
    pub module_id: String,
    /// Module version to run.
    pub version: String,
    /// Whether this assignment is active. Disabled assignments are skipped by the reconciler.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Listeners this module instance should be reachable on.
    #[serde(default)]
    pub listeners: Vec<ListenerAssignment>,
    /// Environment variables passed to the module process, in addition to `WARDEN_*`.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Per-assignment resource overrides, merged over the module's defaults.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_overrides: Option<ResourceLimits>,
    /// Execution mode override; `None` defers to automatic selection (§4.8).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_mode: Option<ExecutionMode>,
    /// Connection mode override; `None` defers to the forwarder's default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_mode: Option<ConnectionMode>,
}

fn default_true() -> bool {
    true
}

/// The signed, versioned set of module assignments for a single agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AgentModuleConfig {
    /// Agent this configuration applies to.
    pub agent_id: String,
    /// Modules the agent should run.
    pub assignments: Vec<ModuleAssignment>,
    /// Monotonically increasing version; a higher version always supersedes.
    pub version: i64,
    /// Signature over the config with `signature` cleared, base64-encoded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl AgentModuleConfig {
    /// Module ids with `enabled == true`, the "desired running set" the reconciler targets.
    #[must_use]
    pub fn desired_module_ids(&self) -> Vec<&str> {
        self.assignments
            .iter()
            .filter(|a| a.enabled)
            .map(|a| a.module_id.as_str())
            .collect()
    }
}

/// Master-side record of what a satellite should be running, prior to signing into
/// an [`AgentModuleConfig`] and handing to the agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Deployment {
    /// Satellite this deployment targets.
    pub satellite_id: String,
    /// Modules to run.
    pub modules: Vec<ModuleAssignment>,
    /// Monotonically increasing version.
    pub version: i64,
    /// Signature, once published.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// When this deployment was last changed.
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn desired_module_ids_skips_disabled() {
        let config = AgentModuleConfig {
            agent_id: "agent-1".into(),
            assignments: vec![
                ModuleAssignment {
                    module_id: "a".into(),
                    version: "1.0".into(),
                    enabled: true,
                    listeners: vec![],
                    env: BTreeMap::new(),
                    resource_overrides: None,
                    execution_mode: None,
                    connection_mode: None,
                },
                ModuleAssignment {
                    module_id: "b".into(),
                    version: "1.0".into(),
                    enabled: false,
                    listeners: vec![],
                    env: BTreeMap::new(),
                    resource_overrides: None,
                    execution_mode: None,
                    connection_mode: None,
                },
            ],
            version: 3,
            signature: None,
        };
        assert_eq!(config.desired_module_ids(), vec!["a"]);
    }

    #[test]
    fn execution_mode_defaults_to_userspace() {
        assert_eq!(ExecutionMode::default(), ExecutionMode::Userspace);
    }
}
