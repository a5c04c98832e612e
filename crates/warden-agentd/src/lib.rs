// SPDX-License-Identifier: MIT OR Apache-2.0
//! Agent daemon composition: enrollment, then the sync → reconcile loop that keeps the
//! locally running module set converged on the master's latest signed assignment.
#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod identity;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub use identity::{AgentIdentity, IdentityError};
use warden_config::AgentConfig;
use warden_error::{AsErrorCode, ErrorCode};
use warden_forwarder::ConnectionForwarder;
use warden_listener::ListenerManager;
use warden_reconciler::Reconciler;
use warden_runtime::{RuntimeManager, RuntimeManagerConfig};
use warden_supervisor::{HealthCheckConfig, RestartPolicy, Supervisor};
use warden_syncer::{RetryConfig, Syncer, SyncerConfig};

/// Errors composing or running the agent daemon.
#[derive(Debug, thiserror::Error)]
pub enum AgentdError {
    /// This agent's enrolled identity couldn't be loaded or minted.
    #[error(transparent)]
    Identity(#[from] IdentityError),

    /// The agent's local KV store couldn't be opened.
    #[error("store error: {0}")]
    Kv(#[from] warden_kv::KvError),

    /// The syncer's state couldn't be initialized.
    #[error("syncer error: {0}")]
    Syncer(#[from] warden_syncer::SyncerError),

    /// The module cache/downloader couldn't be initialized.
    #[error("downloader error: {0}")]
    Downloader(#[from] warden_downloader::DownloaderError),

    /// The reconciler's applied-version bucket couldn't be opened.
    #[error("reconciler error: {0}")]
    Reconciler(#[from] warden_reconciler::ReconcilerError),

    /// The telemetry spool couldn't be opened.
    #[error("telemetry error: {0}")]
    Telemetry(#[from] warden_telemetry::TelemetryError),
}

impl AsErrorCode for AgentdError {
    fn code(&self) -> ErrorCode {
        match self {
            AgentdError::Identity(e) => e.code(),
            AgentdError::Kv(e) => e.code(),
            AgentdError::Syncer(e) => e.code(),
            AgentdError::Downloader(e) => e.code(),
            AgentdError::Reconciler(e) => e.code(),
            AgentdError::Telemetry(e) => e.code(),
        }
    }
}

/// Every long-lived component the agent daemon wires together, ready for [`Daemon::run`].
pub struct Daemon {
    supervisor: Arc<Supervisor>,
    listeners: Arc<ListenerManager>,
    syncer: Syncer,
    reconciler: Reconciler,
    tick_interval: Duration,
}

impl Daemon {
    /// Open the agent's local store and compose every service against `config` and
    /// `identity`. `data_dir` holds `agent.db`, the module cache, and module control
    /// sockets.
    ///
    /// # Errors
    /// Propagates any component's open failure.
    pub async fn bootstrap(config: &AgentConfig, identity: &AgentIdentity, http: reqwest::Client) -> Result<Self, AgentdError> {
        let data_dir = PathBuf::from(&config.data_dir);
        std::fs::create_dir_all(&data_dir).map_err(IdentityError::Io)?;
        let store = warden_kv::Store::open(data_dir.join("agent.db"))?;

        let trusted_key = identity.trusted_signing_key()?;

        let runtime_manager = Arc::new(RuntimeManager::new(RuntimeManagerConfig::default()));
        let telemetry = Arc::new(warden_telemetry::FileSpoolSink::open(data_dir.join("telemetry"))?);
        let supervisor = Arc::new(Supervisor::new(
            identity.agent_id.clone(),
            runtime_manager,
            telemetry,
            RestartPolicy::default(),
            HealthCheckConfig::default(),
        ));

        let forwarder = Arc::new(ConnectionForwarder::new(Default::default()));
        let listeners = Arc::new(ListenerManager::new(
            identity.agent_id.clone(),
            config.master_addr.clone(),
            http.clone(),
            supervisor.clone(),
            forwarder.clone(),
        ));

        let downloader = warden_downloader::Downloader::open(
            &store,
            data_dir.join("cache"),
            http.clone(),
            config.master_addr.clone(),
            {
                let mut verifier = warden_crypto::Verifier::new();
                verifier.add_trusted_key(trusted_key.clone());
                verifier
            },
        )
        .await?;

        let reconciler = Reconciler::open(&store, downloader, supervisor.clone(), listeners.clone(), forwarder, data_dir.join("sockets"))?;

        let syncer = Syncer::open(
            &store,
            http,
            SyncerConfig {
                agent_id: identity.agent_id.clone(),
                master_base_url: config.master_addr.clone(),
                tick_interval: Duration::from_secs(config.sync_interval_secs),
                retry: RetryConfig::default(),
            },
            Some(trusted_key),
        )?;

        Ok(Self {
            supervisor,
            listeners,
            syncer,
            reconciler,
            tick_interval: Duration::from_secs(config.sync_interval_secs),
        })
    }

    /// Run the daemon until `shutdown` resolves: the supervisor's health-check loop runs
    /// as a background task; in the foreground, each tick polls the master for catalog
    /// and assignment updates and feeds the result straight into one reconciliation
    /// pass, so a newly adopted assignment converges without waiting for a second tick.
    pub async fn run(&self, shutdown: impl std::future::Future<Output = ()>) {
        let supervisor = self.supervisor.clone();
        let health_task = tokio::spawn(async move { supervisor.run().await });

        tokio::pin!(shutdown);
        let mut ticker = tokio::time::interval(self.tick_interval);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => self.tick().await,
            }
        }

        tracing::info!("shutting down: stopping all modules and listeners");
        self.listeners.stop_all().await;
        self.supervisor.stop_all().await;
        health_task.abort();
    }

    async fn tick(&self) {
        match self.syncer.tick().await {
            Ok(outcome) => {
                if outcome.catalog_updated || outcome.assignments_updated {
                    tracing::info!(?outcome, "sync adopted new state, reconciling");
                }
            }
            Err(err) => tracing::warn!(error = %err, "sync tick failed"),
        }

        let catalog = self.syncer.latest_catalog().ok().flatten().unwrap_or_default();
        let Ok(Some(config)) = self.syncer.latest_assignments() else {
            return;
        };
        match self.reconciler.reconcile(&catalog, &config).await {
            Ok(outcome) => {
                if !outcome.started.is_empty() || !outcome.stopped.is_empty() || !outcome.failed.is_empty() {
                    tracing::info!(
                        started = ?outcome.started,
                        stopped = ?outcome.stopped,
                        failed = ?outcome.failed,
                        "reconcile pass complete"
                    );
                }
            }
            Err(err) => tracing::error!(error = %err, "reconcile pass failed"),
        }
    }
}
