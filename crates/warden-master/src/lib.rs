// SPDX-License-Identifier: MIT OR Apache-2.0
//! Master-side service composition: the satellite registry, the deployment store, the
//! catalog/pairing/session services, and the control-plane + admin HTTP surface built
//! on top of them.
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod api;
mod deployments;
mod satellites;
mod signing_key;

pub use api::{build_app, AppState, ClientCertVerified};
pub use deployments::DeploymentStore;
pub use satellites::SatelliteStore;
pub use signing_key::SigningKeyGate;

use std::path::PathBuf;

use warden_config::MasterConfig;
use warden_error::{AsErrorCode, ErrorCode};

/// Errors arising anywhere in the master's service composition.
#[derive(Debug, thiserror::Error)]
pub enum MasterError {
    /// Underlying key-value store failure.
    #[error("store error: {0}")]
    Kv(#[from] warden_kv::KvError),

    /// Catalog or assignment signing/versioning failure.
    #[error("catalog error: {0}")]
    Catalog(#[from] warden_catalog::CatalogError),

    /// Pairing issuance/redemption failure.
    #[error("pairing error: {0}")]
    Pairing(#[from] warden_pairing::PairingError),

    /// Session lifecycle failure.
    #[error("session error: {0}")]
    Session(#[from] warden_session::SessionError),

    /// Artifact store failure.
    #[error("artifact error: {0}")]
    Artifact(#[from] warden_artifact::ArtifactError),

    /// CA bootstrap or issuance failure.
    #[error("ca error: {0}")]
    Ca(#[from] warden_ca::CaError),

    /// Signing key failure.
    #[error("crypto error: {0}")]
    Crypto(#[from] warden_crypto::CryptoError),

    /// The requested resource (satellite, deployment, module) does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The request body or path failed validation.
    #[error("bad request: {0}")]
    BadRequest(String),
}

impl AsErrorCode for MasterError {
    fn code(&self) -> ErrorCode {
        match self {
            MasterError::Kv(e) => e.code(),
            MasterError::Catalog(e) => e.code(),
            MasterError::Pairing(e) => e.code(),
            MasterError::Session(e) => e.code(),
            MasterError::Artifact(e) => e.code(),
            MasterError::Ca(e) => e.code(),
            MasterError::Crypto(e) => e.code(),
            MasterError::NotFound(_) => ErrorCode::NotFound,
            MasterError::BadRequest(_) => ErrorCode::InvariantViolation,
        }
    }
}

/// Every persistent service the master composes, wired together at startup.
pub struct MasterServices {
    /// Enrolled satellite registry.
    pub satellites: SatelliteStore,
    /// Per-satellite desired deployments.
    pub deployments: DeploymentStore,
    /// Pairing issuance/redemption.
    pub pairing: warden_pairing::PairingService,
    /// Module catalog and signed per-agent assignments.
    pub catalog: warden_catalog::CatalogService,
    /// High-interaction session lifecycle.
    pub sessions: warden_session::SessionService,
    /// Raw module image bytes.
    pub artifacts: warden_artifact::ArtifactStore,
    /// The fleet's mTLS certificate authority.
    pub ca: warden_ca::Ca,
    /// The module-catalog signing keypair.
    pub signing_keypair: warden_crypto::KeyPair,
    /// PEM-encoded signing public key, folded into every enrollment's CA bundle.
    pub signing_pub_pem: String,
    /// One-shot download gate for the signing key's private half.
    pub signing_key_gate: SigningKeyGate,
    /// Sandbox nodes available for high-interaction escalation.
    pub sandbox_nodes: Vec<String>,
}

impl MasterServices {
    /// Open the master's database, load or bootstrap the CA and signing key, and wire
    /// every service together. `<data_dir>/modules/signing.key` is generated once, on
    /// first boot; every later boot loads the existing key without re-exposing it.
    pub async fn bootstrap(config: &MasterConfig) -> Result<Self, MasterError> {
        let data_dir = PathBuf::from(&config.data_dir);
        let store = warden_kv::Store::open(data_dir.join("master.db"))?;

        let ca = warden_ca::Ca::load_or_generate(warden_ca::CaConfig {
            data_dir: data_dir.clone(),
            ..Default::default()
        })?;

        let modules_dir = data_dir.join("modules");
        std::fs::create_dir_all(&modules_dir).map_err(warden_crypto::CryptoError::Io)?;
        let key_path = modules_dir.join("signing.key");
        let pub_path = modules_dir.join("signing.pub");
        let (signing_keypair, signing_pem) = if key_path.exists() {
            (warden_crypto::KeyPair::load_private_key(&key_path)?, None)
        } else {
            let keypair = warden_crypto::KeyPair::generate();
            keypair.save_private_key(&key_path)?;
            keypair.save_public_key(&pub_path)?;
            let pem = std::fs::read_to_string(&key_path).map_err(warden_crypto::CryptoError::Io)?;
            (keypair, Some(pem))
        };
        let signing_pub_pem = std::fs::read_to_string(&pub_path).map_err(warden_crypto::CryptoError::Io)?;

        let artifacts = warden_artifact::ArtifactStore::open(data_dir.join("images")).await?;

        Ok(Self {
            satellites: SatelliteStore::open(&store)?,
            deployments: DeploymentStore::open(&store)?,
            pairing: warden_pairing::PairingService::open(&store)?,
            catalog: warden_catalog::CatalogService::open(&store)?,
            sessions: warden_session::SessionService::open(&store)?,
            artifacts,
            ca,
            signing_keypair,
            signing_pub_pem,
            signing_key_gate: SigningKeyGate::new(signing_pem),
            sandbox_nodes: config.sandbox_nodes.clone(),
        })
    }
}
