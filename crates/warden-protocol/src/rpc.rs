//! Request/response DTOs for the control-plane RPC surface (`AgentControl`,
//! `ModuleCatalogService`, `SandboxService`), shared between the master's HTTP handlers
//! and the agent's syncer/downloader clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use warden_core::{AgentModuleConfig, ModuleCatalog};

/// `AgentControl.Register` request: presented once, over plain TLS, using a pairing token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    /// The pairing token the admin minted, normalized or display-formatted.
    pub token: String,
    /// Hostname reported by the enrolling agent.
    pub hostname: String,
    /// IP addresses the agent is reachable on.
    pub ips: Vec<String>,
    /// Operating system, e.g. `"linux"`.
    pub os: String,
    /// CPU architecture, e.g. `"x86_64"`.
    pub arch: String,
}

/// `AgentControl.Register` response: issues the new agent its identity and mTLS material.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    /// Newly minted agent id, prefixed `sat-` or `agent-`.
    pub agent_id: String,
    /// PEM-encoded leaf certificate for this agent.
    pub certificate_pem: String,
    /// PEM-encoded private key for the leaf certificate.
    pub private_key_pem: String,
    /// PEM-encoded CA bundle the agent should trust for the master's own certificate.
    pub ca_bundle_pem: String,
}

/// `AgentControl.Heartbeat` request: a periodic agent-is-alive signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    /// The reporting agent.
    pub agent_id: String,
    /// Wall-clock time the agent sent this heartbeat.
    pub sent_at: DateTime<Utc>,
}

/// `AgentControl.Heartbeat` response: acknowledges receipt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    /// Time the master recorded the heartbeat.
    pub received_at: DateTime<Utc>,
}

/// `ModuleCatalogService.GetCatalog` request: the agent's last-known catalog version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetCatalogRequest {
    /// Catalog version the caller already has.
    pub known_version: i64,
}

/// `ModuleCatalogService.GetCatalog` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetCatalogResponse {
    /// `false` if `known_version` was already current; `catalog` is omitted in that case.
    pub updated: bool,
    /// The full catalog, present iff `updated`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog: Option<ModuleCatalog>,
}

/// `ModuleCatalogService.GetAssignments` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetAssignmentsRequest {
    /// Requesting agent's id.
    pub agent_id: String,
    /// Assignment config version the caller already has.
    pub known_version: i64,
}

/// `ModuleCatalogService.GetAssignments` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetAssignmentsResponse {
    /// `false` if `known_version` was already current; `config` is omitted in that case.
    pub updated: bool,
    /// The agent's signed assignment config, present iff `updated`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<AgentModuleConfig>,
}

/// `ModuleCatalogService.VerifyModule` request/response: confirm a downloaded image's
/// digest matches the catalog before the agent trusts its local cache entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyModuleRequest {
    /// Module id to verify.
    pub module_id: String,
    /// Module version to verify.
    pub version: String,
    /// Digest the caller computed locally.
    pub digest: String,
}

/// Response to [`VerifyModuleRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyModuleResponse {
    /// `true` if `digest` matches the catalog's record for `(module_id, version)`.
    pub valid: bool,
    /// The catalog entry's signature, base64-encoded, present iff `valid` and signed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// Key id of the signer, present iff `valid` and signed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signed_by: Option<String>,
    /// Timestamp the manifest was signed, present iff `valid` and signed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signed_at: Option<DateTime<Utc>>,
}

/// `SandboxService.CreateSession` / `AgentControl.RequestHISession` request: escalate an
/// accepted connection on a `high_interaction` listener to a sandboxed session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestHiSessionRequest {
    /// Requesting agent's id.
    pub agent_id: String,
    /// Listener the connection arrived on.
    pub listener_id: String,
    /// Attacker source IP.
    pub source_ip: String,
    /// Attacker source port.
    pub source_port: u16,
}

/// Response to [`RequestHiSessionRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestHiSessionResponse {
    /// Newly created session id.
    pub session_id: String,
    /// `host:port` the agent should tunnel the connection to.
    pub sandbox_endpoint: String,
    /// Shared secret authenticating the tunnel to the sandbox node.
    pub tunnel_key: [u8; 32],
}

/// `SandboxService.StopSession` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopSessionRequest {
    /// Session to end.
    pub session_id: String,
}
