//! The master's HTTP surface: the control-plane RPC endpoints agents poll
//! (`AgentControl`, `ModuleCatalogService`, `SandboxService`) and the admin REST API.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path as AxPath, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::json;

use warden_ca::CertRequest;
use warden_core::{
    Deployment, ModuleAssignment, ModuleCatalog, ModuleImage, RequiredCapabilities, ResourceLimits,
    Satellite, SatelliteStatus,
};
use warden_protocol::rpc::{
    GetAssignmentsRequest, GetAssignmentsResponse, GetCatalogRequest, GetCatalogResponse,
    HeartbeatRequest, HeartbeatResponse, RegisterRequest, RegisterResponse,
    RequestHiSessionRequest, RequestHiSessionResponse, StopSessionRequest, VerifyModuleRequest,
    VerifyModuleResponse,
};

use crate::MasterError;
use crate::MasterServices;

/// Shared handler state: the composed service set behind an `Arc`.
#[derive(Clone)]
pub struct AppState {
    /// Every service the master composed at startup.
    pub services: Arc<MasterServices>,
}

/// Whether the TLS-terminating listener saw a verified client certificate on this
/// connection. Inserted as a per-connection `Extension` by the server that owns the
/// `rustls` handshake; absent (or `false`) means the connection is plain-TLS-only,
/// the exception `Register` is documented to allow for not-yet-enrolled agents.
#[derive(Debug, Clone, Copy)]
pub struct ClientCertVerified(pub bool);

/// Rejects any request whose connection did not present a client certificate verified
/// against the fleet root. Applied to every agent RPC route except `Register`.
async fn require_client_cert(request: Request, next: Next) -> Result<Response, ApiError> {
    let verified = request
        .extensions()
        .get::<ClientCertVerified>()
        .is_some_and(|v| v.0);
    if !verified {
        return Err(ApiError::new(
            StatusCode::UNAUTHORIZED,
            "client certificate required",
        ));
    }
    Ok(next.run(request).await)
}

/// A JSON error body plus HTTP status, the uniform shape every handler fails into.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<MasterError> for ApiError {
    fn from(err: MasterError) -> Self {
        use warden_error::{AsErrorCode, ErrorCode};
        let status = match err.code() {
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::InvalidToken | ErrorCode::InvalidSignature => StatusCode::UNAUTHORIZED,
            ErrorCode::InvariantViolation | ErrorCode::InvalidConfig => StatusCode::BAD_REQUEST,
            ErrorCode::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::Transient => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::Fatal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError::new(status, err.to_string())
    }
}

macro_rules! via_master_error {
    ($($source:ty),+ $(,)?) => {
        $(
            impl From<$source> for ApiError {
                fn from(err: $source) -> Self {
                    ApiError::from(MasterError::from(err))
                }
            }
        )+
    };
}

via_master_error!(
    warden_ca::CaError,
    warden_artifact::ArtifactError,
    warden_catalog::CatalogError,
    warden_pairing::PairingError,
    warden_session::SessionError,
);

/// Assemble the full router: control-plane RPC plus admin REST, over one `AppState`.
///
/// `Register` is the one documented exception that runs over plain TLS before an agent
/// holds a client certificate to present; every other agent RPC route requires a client
/// certificate verified against the fleet root, enforced by [`require_client_cert`]. The
/// admin REST surface is reachable by a human operator, not an enrolled agent, and is
/// left ungated here — deployments that expose it beyond a trusted network should front
/// it with their own authentication.
pub fn build_app(state: AppState) -> Router {
    let agent_rpc = Router::new()
        .route("/heartbeat", post(rpc_heartbeat))
        .route("/catalog", post(rpc_get_catalog))
        .route("/assignments", post(rpc_get_assignments))
        .route("/verify-module", post(rpc_verify_module))
        .route("/sessions", post(rpc_request_hi_session))
        .route("/sessions/stop", post(rpc_stop_session))
        .route_layer(middleware::from_fn(require_client_cert));

    let admin = Router::new()
        .route("/pairings", post(create_pairing))
        .route("/modules", get(list_modules).post(publish_module))
        .route("/modules/{id}/{version}", get(get_module).delete(retract_module))
        .route("/modules/{id}/{version}/download", get(download_module))
        .route("/satellites", get(list_satellites))
        .route("/satellites/{id}", get(get_satellite))
        .route(
            "/satellites/{id}/deployments",
            get(get_deployment).post(set_deployment).delete(delete_deployment),
        )
        .route("/module-signing-key", get(get_signing_key));

    Router::new()
        .route("/rpc/v1/register", post(rpc_register))
        .nest("/rpc/v1", agent_rpc)
        .nest("/api/v1", admin)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Control-plane RPC
// ---------------------------------------------------------------------------

async fn rpc_register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, ApiError> {
    let services = &state.services;

    let pairing = services
        .pairing
        .get_by_token(&req.token)?
        .ok_or_else(|| MasterError::BadRequest("unknown pairing token".into()))?;
    if !pairing.is_redeemable(Utc::now()) {
        return Err(MasterError::BadRequest("pairing token already used or expired".into()).into());
    }

    let agent_id = generate_agent_id();
    let signed = services.ca.issue_certificate(&CertRequest {
        agent_id: agent_id.clone(),
        hostname: req.hostname.clone(),
        public_ips: req.ips.clone(),
    })?;

    services.satellites.register(Satellite {
        id: agent_id.clone(),
        hostname: req.hostname.clone(),
        ip_addresses: req.ips,
        os: req.os,
        arch: req.arch,
        status: SatelliteStatus::Pending,
        registered_at: Utc::now(),
        last_seen_at: Utc::now(),
        cert_serial: signed.serial,
    })?;
    services
        .pairing
        .redeem(&req.token, &agent_id, Some(req.hostname.clone()))
        .ok();

    let ca_bundle_pem =
        warden_ca::build_ca_bundle(services.ca.root_cert_pem(), &services.signing_pub_pem);

    Ok(Json(RegisterResponse {
        agent_id,
        certificate_pem: signed.certificate_pem,
        private_key_pem: signed.private_key_pem,
        ca_bundle_pem,
    }))
}

fn generate_agent_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    format!("agent-{hex}")
}

async fn rpc_heartbeat(
    State(state): State<AppState>,
    Json(req): Json<HeartbeatRequest>,
) -> Result<Json<HeartbeatResponse>, ApiError> {
    state.services.satellites.heartbeat(&req.agent_id)?;
    Ok(Json(HeartbeatResponse {
        received_at: Utc::now(),
    }))
}

async fn rpc_get_catalog(
    State(state): State<AppState>,
    Json(req): Json<GetCatalogRequest>,
) -> Result<Json<GetCatalogResponse>, ApiError> {
    let catalog = state.services.catalog.catalog()?;
    if catalog.version <= req.known_version {
        return Ok(Json(GetCatalogResponse {
            updated: false,
            catalog: None,
        }));
    }
    Ok(Json(GetCatalogResponse {
        updated: true,
        catalog: Some(catalog),
    }))
}

async fn rpc_get_assignments(
    State(state): State<AppState>,
    Json(req): Json<GetAssignmentsRequest>,
) -> Result<Json<GetAssignmentsResponse>, ApiError> {
    let config = state.services.catalog.agent_config(&req.agent_id)?;
    match config {
        Some(config) if config.version > req.known_version => Ok(Json(GetAssignmentsResponse {
            updated: true,
            config: Some(config),
        })),
        _ => Ok(Json(GetAssignmentsResponse {
            updated: false,
            config: None,
        })),
    }
}

async fn rpc_verify_module(
    State(state): State<AppState>,
    Json(req): Json<VerifyModuleRequest>,
) -> Result<Json<VerifyModuleResponse>, ApiError> {
    let catalog = state.services.catalog.catalog()?;
    let entry = catalog.get(&req.module_id, &req.version);
    let valid = entry.is_some_and(|m| m.digest == req.digest);
    let signed = entry.filter(|_| valid);
    Ok(Json(VerifyModuleResponse {
        valid,
        signature: signed.and_then(|m| m.signature.clone()),
        signed_by: signed.and_then(|m| m.signed_by.clone()),
        signed_at: signed.and_then(|m| m.signed_at),
    }))
}

async fn rpc_request_hi_session(
    State(state): State<AppState>,
    Json(req): Json<RequestHiSessionRequest>,
) -> Result<Json<RequestHiSessionResponse>, ApiError> {
    let session = state.services.sessions.create_session(
        &req.agent_id,
        &req.listener_id,
        &req.source_ip,
        req.source_port,
        &state.services.sandbox_nodes,
    )?;
    Ok(Json(RequestHiSessionResponse {
        session_id: session.id,
        sandbox_endpoint: session.sandbox_endpoint,
        tunnel_key: session.tunnel_key,
    }))
}

async fn rpc_stop_session(
    State(state): State<AppState>,
    Json(req): Json<StopSessionRequest>,
) -> Result<StatusCode, ApiError> {
    state.services.sessions.end_session(&req.session_id)?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Admin REST: pairings
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CreatePairingRequest {
    #[serde(default)]
    ttl_seconds: Option<i64>,
}

#[derive(Debug, Serialize)]
struct CreatePairingResponse {
    id: String,
    token: String,
    display_token: String,
    expires_at: chrono::DateTime<Utc>,
}

async fn create_pairing(
    State(state): State<AppState>,
    body: axum::body::Bytes,
) -> Result<Json<CreatePairingResponse>, ApiError> {
    let ttl_seconds = if body.is_empty() {
        None
    } else {
        serde_json::from_slice::<CreatePairingRequest>(&body)
            .map_err(|e| MasterError::BadRequest(format!("invalid request body: {e}")))?
            .ttl_seconds
    };
    let ttl = ttl_seconds
        .map(chrono::Duration::seconds)
        .unwrap_or(warden_pairing::DEFAULT_PAIRING_TTL);
    let pairing = state.services.pairing.create(ttl)?;
    Ok(Json(CreatePairingResponse {
        id: pairing.id,
        token: pairing.token,
        display_token: pairing.display_token,
        expires_at: pairing.expires_at,
    }))
}

// ---------------------------------------------------------------------------
// Admin REST: modules
// ---------------------------------------------------------------------------

async fn list_modules(State(state): State<AppState>) -> Result<Json<ModuleCatalog>, ApiError> {
    Ok(Json(state.services.catalog.catalog()?))
}

async fn get_module(
    State(state): State<AppState>,
    AxPath((id, version)): AxPath<(String, String)>,
) -> Result<Json<ModuleImage>, ApiError> {
    let catalog = state.services.catalog.catalog()?;
    catalog
        .get(&id, &version)
        .cloned()
        .map(Json)
        .ok_or_else(|| MasterError::NotFound(format!("{id}@{version}")).into())
}

#[derive(Debug, Deserialize)]
struct PublishModuleRequest {
    id: String,
    version: String,
    image_base64: String,
    #[serde(default)]
    required_capabilities: RequiredCapabilities,
    #[serde(default)]
    min_agent_version: Option<String>,
    #[serde(default)]
    protocols: Vec<String>,
    #[serde(default)]
    resources: ResourceLimits,
    #[serde(default)]
    labels: BTreeMap<String, String>,
}

async fn publish_module(
    State(state): State<AppState>,
    Json(req): Json<PublishModuleRequest>,
) -> Result<Json<ModuleCatalog>, ApiError> {
    let bytes = BASE64
        .decode(&req.image_base64)
        .map_err(|e| MasterError::BadRequest(format!("invalid base64 image: {e}")))?;
    let (digest, size_bytes) = state.services.artifacts.put(&req.id, &req.version, &bytes).await?;

    let now = Utc::now();
    let image = ModuleImage {
        id: req.id,
        version: req.version,
        digest,
        image_ref: None,
        size_bytes,
        signature: None,
        signed_by: None,
        signed_at: None,
        required_capabilities: req.required_capabilities,
        min_agent_version: req.min_agent_version,
        protocols: req.protocols,
        resources: req.resources,
        labels: req.labels,
        created_at: now,
        updated_at: now,
    };

    let catalog = state
        .services
        .catalog
        .publish_module(&state.services.signing_keypair, image)?;
    Ok(Json(catalog))
}

async fn retract_module(
    State(state): State<AppState>,
    AxPath((id, version)): AxPath<(String, String)>,
) -> Result<Json<ModuleCatalog>, ApiError> {
    let catalog = state
        .services
        .catalog
        .retract_module(&state.services.signing_keypair, &id, &version)?;
    state.services.artifacts.delete(&id, &version).await?;
    Ok(Json(catalog))
}

async fn download_module(
    State(state): State<AppState>,
    AxPath((id, version)): AxPath<(String, String)>,
) -> Result<Vec<u8>, ApiError> {
    Ok(state.services.artifacts.get(&id, &version).await?)
}

// ---------------------------------------------------------------------------
// Admin REST: satellites and deployments
// ---------------------------------------------------------------------------

async fn list_satellites(State(state): State<AppState>) -> Result<Json<Vec<Satellite>>, ApiError> {
    Ok(Json(state.services.satellites.list()?))
}

async fn get_satellite(
    State(state): State<AppState>,
    AxPath(id): AxPath<String>,
) -> Result<Json<Satellite>, ApiError> {
    state
        .services
        .satellites
        .get(&id)?
        .map(Json)
        .ok_or_else(|| MasterError::NotFound(id).into())
}

#[derive(Debug, Deserialize)]
struct SetDeploymentRequest {
    modules: Vec<ModuleAssignment>,
}

async fn get_deployment(
    State(state): State<AppState>,
    AxPath(id): AxPath<String>,
) -> Result<Json<Deployment>, ApiError> {
    state
        .services
        .deployments
        .get(&id)?
        .map(Json)
        .ok_or_else(|| MasterError::NotFound(id).into())
}

async fn set_deployment(
    State(state): State<AppState>,
    AxPath(id): AxPath<String>,
    Json(req): Json<SetDeploymentRequest>,
) -> Result<Json<Deployment>, ApiError> {
    if state.services.satellites.get(&id)?.is_none() {
        return Err(MasterError::NotFound(id).into());
    }
    let deployment = state.services.deployments.set(&id, req.modules.clone())?;
    state
        .services
        .catalog
        .set_agent_assignments(&state.services.signing_keypair, &id, req.modules)?;
    Ok(Json(deployment))
}

async fn delete_deployment(
    State(state): State<AppState>,
    AxPath(id): AxPath<String>,
) -> Result<StatusCode, ApiError> {
    state.services.deployments.delete(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Admin REST: one-shot signing key download
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct SigningKeyResponse {
    private_key_pem: String,
}

async fn get_signing_key(State(state): State<AppState>) -> Result<Json<SigningKeyResponse>, ApiError> {
    match state.services.signing_key_gate.take() {
        Some(private_key_pem) => Ok(Json(SigningKeyResponse { private_key_pem })),
        None => Err(ApiError::new(
            StatusCode::GONE,
            "signing key has already been downloaded",
        )),
    }
}
