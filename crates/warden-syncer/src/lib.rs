// SPDX-License-Identifier: MIT OR Apache-2.0
//! Agent-side catalog/assignment polling: holds `(catalog_version, config_version)`
//! high-water marks in the agent's KV store and periodically asks the master whether
//! either has moved on.
#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod retry;

use std::time::Duration;

use warden_core::{AgentModuleConfig, ModuleCatalog};
use warden_crypto::{KeyPair, Verifier};
use warden_error::{AsErrorCode, ErrorCode};
use warden_kv::{Bucket, Store};
use warden_protocol::rpc::{GetAssignmentsRequest, GetAssignmentsResponse, GetCatalogRequest, GetCatalogResponse};

pub use retry::{RetryConfig, RetryError};

const CATALOG_VERSION_KEY: &str = "catalog_version";
const CONFIG_VERSION_KEY: &str = "config_version";
const CURRENT_KEY: &str = "current";

/// Errors arising from a single sync tick.
#[derive(Debug, thiserror::Error)]
pub enum SyncerError {
    /// The HTTP request to the master failed or returned a non-success status.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Underlying sync-state store failure.
    #[error("store error: {0}")]
    Kv(#[from] warden_kv::KvError),

    /// Catalog or assignment signature verification failed.
    #[error("signature error: {0}")]
    Signature(#[from] warden_catalog::CatalogError),

    /// The master claimed an update but the response carried no payload.
    #[error("master reported an update to {0} but sent no payload")]
    MalformedResponse(&'static str),
}

impl AsErrorCode for SyncerError {
    fn code(&self) -> ErrorCode {
        match self {
            SyncerError::Http(_) => ErrorCode::Transient,
            SyncerError::Kv(_) => ErrorCode::Fatal,
            SyncerError::Signature(e) => e.code(),
            SyncerError::MalformedResponse(_) => ErrorCode::InvariantViolation,
        }
    }
}

/// What changed during a sync tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    /// `true` if a newer catalog was fetched and adopted this tick.
    pub catalog_updated: bool,
    /// `true` if newer assignments were fetched and adopted this tick.
    pub assignments_updated: bool,
}

/// Fixed parameters for a [`Syncer`], set once at construction.
pub struct SyncerConfig {
    /// This agent's id, used in `GetAssignments` requests.
    pub agent_id: String,
    /// Base URL of the master's control-plane surface, e.g. `"https://10.0.0.1:8443"`.
    pub master_base_url: String,
    /// Time between sync ticks in [`Syncer::run`].
    pub tick_interval: Duration,
    /// Backoff policy for a single tick's HTTP calls.
    pub retry: RetryConfig,
}

/// Polls the master for catalog and assignment updates, verifying and persisting
/// whatever it fetches.
///
/// Signatures are optional only when no trusted key is configured (`trusted_key:
/// None`); an absent signature is then logged and skipped rather than rejected. Once a
/// trusted key is configured, verification is strict: a missing or invalid signature
/// fails the tick instead of being adopted.
pub struct Syncer {
    http: reqwest::Client,
    config: SyncerConfig,
    trusted_key: Option<KeyPair>,
    state: Bucket<i64>,
    catalog: Bucket<ModuleCatalog>,
    assignments: Bucket<AgentModuleConfig>,
}

impl Syncer {
    /// Open the syncer's persisted high-water marks and cached catalog/assignments in
    /// `store`.
    ///
    /// # Errors
    /// Propagates a store-open failure.
    pub fn open(
        store: &Store,
        http: reqwest::Client,
        config: SyncerConfig,
        trusted_key: Option<KeyPair>,
    ) -> Result<Self, SyncerError> {
        Ok(Self {
            http,
            config,
            trusted_key,
            state: store.bucket("sync_state")?,
            catalog: store.bucket("sync_catalog")?,
            assignments: store.bucket("sync_assignments")?,
        })
    }

    /// The most recently adopted catalog, if any tick has ever succeeded.
    ///
    /// # Errors
    /// Propagates the underlying store's read failure.
    pub fn latest_catalog(&self) -> Result<Option<ModuleCatalog>, SyncerError> {
        Ok(self.catalog.get(CURRENT_KEY)?)
    }

    /// The most recently adopted assignment config, if any tick has ever succeeded.
    ///
    /// # Errors
    /// Propagates the underlying store's read failure.
    pub fn latest_assignments(&self) -> Result<Option<AgentModuleConfig>, SyncerError> {
        Ok(self.assignments.get(CURRENT_KEY)?)
    }

    fn verifier(&self) -> Option<Verifier> {
        self.trusted_key.as_ref().map(|key| {
            let mut v = Verifier::new();
            v.add_trusted_key(key.clone());
            v
        })
    }

    /// Perform one GetCatalog + GetAssignments round-trip, verifying and persisting
    /// whatever updated.
    ///
    /// # Errors
    /// [`SyncerError::Signature`] on a strict verification failure,
    /// [`SyncerError::MalformedResponse`] if the master's contract is violated, or an
    /// HTTP/store error from either call.
    pub async fn tick(&self) -> Result<SyncOutcome, SyncerError> {
        Ok(SyncOutcome {
            catalog_updated: self.sync_catalog().await?,
            assignments_updated: self.sync_assignments().await?,
        })
    }

    async fn sync_catalog(&self) -> Result<bool, SyncerError> {
        let known_version = self.state.get(CATALOG_VERSION_KEY)?.unwrap_or(0);
        let url = format!("{}/rpc/v1/catalog", self.config.master_base_url);
        let response: GetCatalogResponse = self
            .http
            .post(url)
            .json(&GetCatalogRequest { known_version })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if !response.updated {
            return Ok(false);
        }
        let catalog = response.catalog.ok_or(SyncerError::MalformedResponse("catalog"))?;

        match self.verifier() {
            Some(verifier) => warden_catalog::verify_catalog(&verifier, &catalog)?,
            None => tracing::warn!("adopting unverified catalog: no trusted signing key configured"),
        }

        self.state.put(CATALOG_VERSION_KEY, &catalog.version)?;
        self.catalog.put(CURRENT_KEY, &catalog)?;
        Ok(true)
    }

    async fn sync_assignments(&self) -> Result<bool, SyncerError> {
        let known_version = self.state.get(CONFIG_VERSION_KEY)?.unwrap_or(0);
        let url = format!("{}/rpc/v1/assignments", self.config.master_base_url);
        let response: GetAssignmentsResponse = self
            .http
            .post(url)
            .json(&GetAssignmentsRequest {
                agent_id: self.config.agent_id.clone(),
                known_version,
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if !response.updated {
            return Ok(false);
        }
        let config = response.config.ok_or(SyncerError::MalformedResponse("assignments"))?;

        match &self.trusted_key {
            Some(key) => warden_catalog::verify_agent_config(key, &config)?,
            None => tracing::warn!("adopting unverified assignment config: no trusted signing key configured"),
        }

        self.state.put(CONFIG_VERSION_KEY, &config.version)?;
        self.assignments.put(CURRENT_KEY, &config)?;
        Ok(true)
    }

    /// Run sync ticks forever, spaced `config.tick_interval` apart, retrying each
    /// tick's HTTP calls per `config.retry` before logging and moving on to the next
    /// tick. Never returns; intended to be spawned as its own task.
    pub async fn run(&self) {
        loop {
            match retry::retry_async(&self.config.retry, || self.tick()).await {
                Ok(outcome) => {
                    if outcome.catalog_updated || outcome.assignments_updated {
                        tracing::info!(
                            catalog_updated = outcome.value.catalog_updated,
                            assignments_updated = outcome.value.assignments_updated,
                            "sync tick adopted new state"
                        );
                    }
                }
                Err(err) => tracing::warn!(error = %err, "sync tick failed"),
            }
            tokio::time::sleep(self.config.tick_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use warden_core::{ModuleAssignment, ModuleImage, RequiredCapabilities, ResourceLimits};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sample_image() -> ModuleImage {
        let now = Utc::now();
        ModuleImage {
            id: "ssh-honeypot".into(),
            version: "1.0.0".into(),
            digest: "sha256:deadbeef".into(),
            image_ref: None,
            size_bytes: 10,
            signature: None,
            signed_by: None,
            signed_at: None,
            required_capabilities: RequiredCapabilities::default(),
            min_agent_version: None,
            protocols: vec![],
            resources: ResourceLimits::default(),
            labels: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    fn syncer(server: &MockServer, store: &Store, trusted_key: Option<KeyPair>) -> Syncer {
        Syncer::open(
            store,
            reqwest::Client::new(),
            SyncerConfig {
                agent_id: "agent-1".into(),
                master_base_url: server.uri(),
                tick_interval: Duration::from_secs(30),
                retry: RetryConfig {
                    max_retries: 0,
                    ..RetryConfig::default()
                },
            },
            trusted_key,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn tick_adopts_a_signed_catalog_and_persists_version() {
        let server = MockServer::start().await;
        let keypair = KeyPair::generate();
        let mut catalog = ModuleCatalog {
            version: 1,
            updated_at: Utc::now(),
            modules: vec![sample_image()],
            signature: None,
            signed_by: None,
        };
        warden_catalog::sign_catalog(&keypair, &mut catalog).unwrap();

        Mock::given(method("POST"))
            .and(path("/rpc/v1/catalog"))
            .respond_with(ResponseTemplate::new(200).set_body_json(GetCatalogResponse {
                updated: true,
                catalog: Some(catalog.clone()),
            }))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/rpc/v1/assignments"))
            .respond_with(ResponseTemplate::new(200).set_body_json(GetAssignmentsResponse {
                updated: false,
                config: None,
            }))
            .mount(&server)
            .await;

        let store = Store::open_temporary().unwrap();
        let syncer = syncer(&server, &store, Some(KeyPair::from_public_key(keypair.public_key)));

        let outcome = syncer.tick().await.unwrap();
        assert!(outcome.catalog_updated);
        assert!(!outcome.assignments_updated);
        assert_eq!(syncer.latest_catalog().unwrap().unwrap().version, 1);
    }

    #[tokio::test]
    async fn tick_rejects_a_catalog_signed_by_an_untrusted_key() {
        let server = MockServer::start().await;
        let signer = KeyPair::generate();
        let impostor_trust = KeyPair::generate();
        let mut catalog = ModuleCatalog {
            version: 1,
            updated_at: Utc::now(),
            modules: vec![],
            signature: None,
            signed_by: None,
        };
        warden_catalog::sign_catalog(&signer, &mut catalog).unwrap();

        Mock::given(method("POST"))
            .and(path("/rpc/v1/catalog"))
            .respond_with(ResponseTemplate::new(200).set_body_json(GetCatalogResponse {
                updated: true,
                catalog: Some(catalog),
            }))
            .mount(&server)
            .await;

        let store = Store::open_temporary().unwrap();
        let syncer = syncer(&server, &store, Some(KeyPair::from_public_key(impostor_trust.public_key)));

        let err = syncer.sync_catalog().await.unwrap_err();
        assert!(matches!(err, SyncerError::Signature(_)));
        assert!(syncer.latest_catalog().unwrap().is_none());
    }

    #[tokio::test]
    async fn tick_adopts_an_unverified_catalog_when_no_trusted_key_is_configured() {
        let server = MockServer::start().await;
        let catalog = ModuleCatalog {
            version: 1,
            updated_at: Utc::now(),
            modules: vec![],
            signature: None,
            signed_by: None,
        };

        Mock::given(method("POST"))
            .and(path("/rpc/v1/catalog"))
            .respond_with(ResponseTemplate::new(200).set_body_json(GetCatalogResponse {
                updated: true,
                catalog: Some(catalog),
            }))
            .mount(&server)
            .await;

        let store = Store::open_temporary().unwrap();
        let syncer = syncer(&server, &store, None);

        assert!(syncer.sync_catalog().await.unwrap());
    }

    #[tokio::test]
    async fn not_updated_response_leaves_state_untouched() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rpc/v1/catalog"))
            .respond_with(ResponseTemplate::new(200).set_body_json(GetCatalogResponse {
                updated: false,
                catalog: None,
            }))
            .mount(&server)
            .await;

        let store = Store::open_temporary().unwrap();
        let syncer = syncer(&server, &store, None);

        assert!(!syncer.sync_catalog().await.unwrap());
        assert!(syncer.latest_catalog().unwrap().is_none());
    }

    #[tokio::test]
    async fn tick_adopts_signed_assignments_for_this_agent() {
        let server = MockServer::start().await;
        let keypair = KeyPair::generate();
        let mut config = AgentModuleConfig {
            agent_id: "agent-1".into(),
            assignments: vec![ModuleAssignment {
                module_id: "ssh-honeypot".into(),
                version: "1.0.0".into(),
                enabled: true,
                listeners: vec![],
                env: BTreeMap::new(),
                resource_overrides: None,
                execution_mode: None,
                connection_mode: None,
            }],
            version: 1,
            signature: None,
        };
        warden_catalog::sign_agent_config(&keypair, &mut config).unwrap();

        Mock::given(method("POST"))
            .and(path("/rpc/v1/catalog"))
            .respond_with(ResponseTemplate::new(200).set_body_json(GetCatalogResponse {
                updated: false,
                catalog: None,
            }))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/rpc/v1/assignments"))
            .respond_with(ResponseTemplate::new(200).set_body_json(GetAssignmentsResponse {
                updated: true,
                config: Some(config),
            }))
            .mount(&server)
            .await;

        let store = Store::open_temporary().unwrap();
        let syncer = syncer(&server, &store, Some(KeyPair::from_public_key(keypair.public_key)));

        let outcome = syncer.tick().await.unwrap();
        assert!(outcome.assignments_updated);
        let adopted = syncer.latest_assignments().unwrap().unwrap();
        assert_eq!(adopted.desired_module_ids(), vec!["ssh-honeypot"]);
    }
}
