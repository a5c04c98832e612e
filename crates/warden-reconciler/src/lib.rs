// SPDX-License-Identifier: MIT OR Apache-2.0
//! Diffs the desired module set (the latest signed [`AgentModuleConfig`]) against what's
//! actually running, and drives the downloader/supervisor/listener manager/forwarder to
//! converge: start what's missing, stop what's no longer assigned, and restart anything
//! whose assigned version changed.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use warden_core::{AgentModuleConfig, ModuleCatalog, ModuleAssignment, RequiredCapabilities, ResourceLimits};
use warden_downloader::Downloader;
use warden_error::{AsErrorCode, ErrorCode};
use warden_forwarder::ConnectionForwarder;
use warden_kv::{Bucket, Store};
use warden_listener::ListenerManager;
use warden_runtime::RuntimeSpec;
use warden_supervisor::Supervisor;

const APPLIED_VERSION_BUCKET: &str = "reconciler_applied_versions";

/// Errors from a single reconciliation pass. A per-module failure inside the pass is
/// logged and skipped rather than raised here — this only surfaces failures that abort
/// the whole pass (reading persisted state).
#[derive(Debug, thiserror::Error)]
pub enum ReconcilerError {
    /// The applied-version store couldn't be read.
    #[error("store error: {0}")]
    Kv(#[from] warden_kv::KvError),
}

impl AsErrorCode for ReconcilerError {
    fn code(&self) -> ErrorCode {
        match self {
            ReconcilerError::Kv(_) => ErrorCode::Fatal,
        }
    }
}

/// What a single [`Reconciler::reconcile`] pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Module ids started (or restarted) this pass.
    pub started: Vec<String>,
    /// Module ids stopped this pass (no longer assigned, or restarted for a version bump).
    pub stopped: Vec<String>,
    /// Module ids whose start or stop failed; the pass continues past these.
    pub failed: Vec<String>,
}

/// Converges an agent's running module set onto its latest assignment config.
pub struct Reconciler {
    downloader: Downloader,
    supervisor: Arc<Supervisor>,
    listeners: Arc<ListenerManager>,
    forwarder: Arc<ConnectionForwarder>,
    sockets_dir: PathBuf,
    applied_versions: Bucket<String>,
}

impl Reconciler {
    /// Build a reconciler. `sockets_dir` is where each started module's control socket
    /// is placed, one file per module id.
    ///
    /// # Errors
    /// Propagates a store-open failure for the applied-version bucket.
    pub fn open(
        store: &Store,
        downloader: Downloader,
        supervisor: Arc<Supervisor>,
        listeners: Arc<ListenerManager>,
        forwarder: Arc<ConnectionForwarder>,
        sockets_dir: impl Into<PathBuf>,
    ) -> Result<Self, ReconcilerError> {
        Ok(Self {
            downloader,
            supervisor,
            listeners,
            forwarder,
            sockets_dir: sockets_dir.into(),
            applied_versions: store.bucket(APPLIED_VERSION_BUCKET)?,
        })
    }

    fn socket_path(&self, module_id: &str) -> PathBuf {
        self.sockets_dir.join(format!("{module_id}.sock"))
    }

    /// Run one reconciliation pass: `catalog` supplies per-version required capabilities
    /// for modules being newly started; `config` is the desired assignment set.
    ///
    /// Deterministic and idempotent: an unchanged `config` produces no starts or stops.
    /// Starts happen before stops, so a module being replaced by a new version never
    /// leaves its listeners unbound in between.
    ///
    /// # Errors
    /// Only if the applied-version store can't be read; individual module failures are
    /// logged and recorded in the returned [`ReconcileOutcome::failed`] instead.
    pub async fn reconcile(&self, catalog: &ModuleCatalog, config: &AgentModuleConfig) -> Result<ReconcileOutcome, ReconcilerError> {
        let desired: HashMap<&str, &ModuleAssignment> = config
            .assignments
            .iter()
            .filter(|a| a.enabled)
            .map(|a| (a.module_id.as_str(), a))
            .collect();

        let running: HashSet<String> = self.supervisor.module_ids().await.into_iter().collect();

        let mut needs_restart = HashSet::new();
        for (module_id, assignment) in &desired {
            if running.contains(*module_id) {
                let applied_version = self.applied_versions.get(*module_id)?;
                if applied_version.as_deref() != Some(assignment.version.as_str()) {
                    needs_restart.insert(module_id.to_string());
                }
            }
        }

        let to_start: Vec<String> = desired
            .keys()
            .filter(|id| !running.contains(**id) || needs_restart.contains(**id))
            .map(|id| id.to_string())
            .collect();
        let to_stop: Vec<String> = running
            .iter()
            .filter(|id| !desired.contains_key(id.as_str()) || needs_restart.contains(*id))
            .cloned()
            .collect();

        let mut outcome = ReconcileOutcome::default();

        for module_id in &to_start {
            let assignment = desired[module_id.as_str()];
            match self.start_one(catalog, assignment).await {
                Ok(()) => outcome.started.push(module_id.clone()),
                Err(err) => {
                    tracing::error!(module = module_id, error = %err, "failed to start module");
                    outcome.failed.push(module_id.clone());
                }
            }
        }

        for module_id in &to_stop {
            match self.stop_one(module_id).await {
                Ok(()) => outcome.stopped.push(module_id.clone()),
                Err(err) => {
                    tracing::warn!(module = module_id, error = %err, "failed to stop module");
                    outcome.failed.push(module_id.clone());
                }
            }
        }

        Ok(outcome)
    }

    async fn start_one(&self, catalog: &ModuleCatalog, assignment: &ModuleAssignment) -> Result<(), StartError> {
        let cache_entry = self.downloader.ensure(&assignment.module_id, &assignment.version).await?;

        let required_capabilities = catalog
            .get(&assignment.module_id, &assignment.version)
            .map(|image| image.required_capabilities.clone())
            .unwrap_or_default();

        let spec = RuntimeSpec {
            id: assignment.module_id.clone(),
            image_path: PathBuf::from(cache_entry.image_path),
            socket_path: self.socket_path(&assignment.module_id),
            env: assignment.env.clone(),
            working_dir: None,
            required_capabilities,
            resources: assignment.resource_overrides.clone().unwrap_or_else(ResourceLimits::default),
        };

        self.supervisor.start_module(spec, assignment.execution_mode).await?;

        self.forwarder
            .register_module(
                assignment.module_id.clone(),
                self.socket_path(&assignment.module_id),
                None,
                assignment.connection_mode,
            )
            .await?;

        for listener in &assignment.listeners {
            if let Err(err) = self
                .listeners
                .start(&listener.id, &assignment.module_id, &listener.protocol, listener.port, listener.high_interaction)
                .await
            {
                tracing::error!(
                    module = %assignment.module_id,
                    listener = %listener.id,
                    port = listener.port,
                    error = %err,
                    "failed to start listener"
                );
            }
        }

        self.applied_versions.put(&assignment.module_id, &assignment.version)?;
        tracing::info!(module = %assignment.module_id, version = %assignment.version, "module started");
        Ok(())
    }

    async fn stop_one(&self, module_id: &str) -> Result<(), StopError> {
        for listener_id in self.listeners.listener_ids_for_module(module_id).await {
            self.listeners.stop(&listener_id).await;
        }
        self.forwarder.unregister_module(module_id).await;
        self.supervisor.stop_module(module_id).await?;
        self.applied_versions.remove(module_id)?;
        tracing::info!(module = module_id, "module stopped");
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
enum StartError {
    #[error(transparent)]
    Download(#[from] warden_downloader::DownloaderError),
    #[error(transparent)]
    Supervisor(#[from] warden_supervisor::SupervisorError),
    #[error(transparent)]
    Forward(#[from] warden_forwarder::ForwarderError),
    #[error(transparent)]
    Kv(#[from] warden_kv::KvError),
}

#[derive(Debug, thiserror::Error)]
enum StopError {
    #[error(transparent)]
    Supervisor(#[from] warden_supervisor::SupervisorError),
    #[error(transparent)]
    Kv(#[from] warden_kv::KvError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use warden_core::{ConnectionMode, ExecutionMode, ListenerAssignment, ModuleImage, ModuleState};
    use warden_runtime::{Runtime, RuntimeError, RuntimeInstance, RuntimeManager, RuntimeManagerConfig};

    struct StubRuntime;

    #[async_trait::async_trait]
    impl Runtime for StubRuntime {
        fn name(&self) -> &'static str {
            "stub"
        }
        fn mode(&self) -> ExecutionMode {
            ExecutionMode::Userspace
        }
        async fn start(&self, spec: &RuntimeSpec) -> Result<RuntimeInstance, RuntimeError> {
            Ok(RuntimeInstance::without_stop_fn(
                spec.id.clone(),
                None,
                None,
                spec.socket_path.clone(),
                None,
                Utc::now(),
                ModuleState::Running,
            ))
        }
        async fn stop(&self, instance: &mut RuntimeInstance) -> Result<(), RuntimeError> {
            instance.state = ModuleState::Stopped;
            Ok(())
        }
        async fn signal(&self, _instance: &RuntimeInstance, _signal: i32) -> Result<(), RuntimeError> {
            Ok(())
        }
        async fn is_running(&self, _instance: &RuntimeInstance) -> bool {
            true
        }
    }

    fn image(module_id: &str, version: &str) -> ModuleImage {
        let now = Utc::now();
        ModuleImage {
            id: module_id.to_string(),
            version: version.to_string(),
            digest: "sha256:deadbeef".to_string(),
            image_ref: None,
            size_bytes: 0,
            signature: None,
            signed_by: None,
            signed_at: None,
            required_capabilities: RequiredCapabilities::default(),
            min_agent_version: None,
            protocols: vec![],
            resources: Default::default(),
            labels: Default::default(),
            created_at: now,
            updated_at: now,
        }
    }

    async fn reconciler(tmp: &tempfile::TempDir) -> Reconciler {
        let store = Store::open_temporary().unwrap();
        let http = reqwest::Client::new();
        let downloader = Downloader::open(
            &store,
            tmp.path().join("cache"),
            http.clone(),
            "https://master.invalid",
            warden_crypto::Verifier::new(),
        )
        .await
        .unwrap();

        let runtime_manager = RuntimeManager::new(RuntimeManagerConfig::default());
        runtime_manager.register(Box::new(StubRuntime));
        let supervisor = Arc::new(Supervisor::new(
            "agent-1".to_string(),
            Arc::new(runtime_manager),
            Arc::new(warden_core::NullSink),
            Default::default(),
            Default::default(),
        ));

        let forwarder = Arc::new(ConnectionForwarder::new(ConnectionMode::TcpRelay));
        let listeners = Arc::new(ListenerManager::new(
            "agent-1".to_string(),
            "https://master.invalid".to_string(),
            http,
            supervisor.clone(),
            forwarder.clone(),
        ));

        Reconciler::open(&store, downloader, supervisor, listeners, forwarder, tmp.path().join("sockets")).unwrap()
    }

    fn assignment(module_id: &str, version: &str, listeners: Vec<ListenerAssignment>) -> ModuleAssignment {
        ModuleAssignment {
            module_id: module_id.to_string(),
            version: version.to_string(),
            enabled: true,
            listeners,
            env: Default::default(),
            resource_overrides: None,
            execution_mode: Some(ExecutionMode::Userspace),
            connection_mode: Some(ConnectionMode::TcpRelay),
        }
    }

    #[tokio::test]
    async fn an_empty_config_starts_and_stops_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let reconciler = reconciler(&tmp).await;
        let catalog = ModuleCatalog::default();
        let config = AgentModuleConfig {
            agent_id: "agent-1".into(),
            assignments: vec![],
            version: 1,
            signature: None,
        };
        let outcome = reconciler.reconcile(&catalog, &config).await.unwrap();
        assert!(outcome.started.is_empty());
        assert!(outcome.stopped.is_empty());
        assert!(outcome.failed.is_empty());
    }

    #[tokio::test]
    async fn a_newly_assigned_module_that_cannot_be_downloaded_is_recorded_as_failed() {
        let tmp = tempfile::tempdir().unwrap();
        let reconciler = reconciler(&tmp).await;
        let catalog = ModuleCatalog::default();
        let config = AgentModuleConfig {
            agent_id: "agent-1".into(),
            assignments: vec![assignment("ssh-honeypot", "1.0.0", vec![])],
            version: 1,
            signature: None,
        };
        // master_base_url is unreachable, so downloader.ensure fails before anything starts.
        let outcome = reconciler.reconcile(&catalog, &config).await.unwrap();
        assert_eq!(outcome.failed, vec!["ssh-honeypot".to_string()]);
        assert!(outcome.started.is_empty());
    }

    #[test]
    fn catalog_lookup_finds_the_exact_assigned_version() {
        let catalog = ModuleCatalog {
            version: 1,
            updated_at: Utc::now(),
            modules: vec![image("ssh-honeypot", "1.0.0"), image("ssh-honeypot", "1.1.0")],
            signature: None,
            signed_by: None,
        };
        let found = catalog.modules.iter().find(|m| m.id == "ssh-honeypot" && m.version == "1.1.0");
        assert!(found.is_some());
    }
}
