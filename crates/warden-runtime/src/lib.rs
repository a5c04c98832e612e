// SPDX-License-Identifier: MIT OR Apache-2.0
//! Uniform start/stop/signal/is-running surface over the three ways a module can run:
//! an unprivileged local process, a privileged local process, or a containerd task.
//!
//! [`RuntimeManager`] holds one [`Runtime`] per configured [`ExecutionMode`] and selects
//! among them per module capability; callers go through the manager, not a concrete
//! runtime, so the supervisor never needs to know which mode a module ended up on.
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod containerd;
mod privileged;
mod userspace;
mod util;

pub use containerd::ContainerdRuntime;
pub use privileged::{PrivilegedConfig, PrivilegedRuntime};
pub use userspace::UserspaceRuntime;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use warden_core::{ExecutionMode, ModuleState, RequiredCapabilities, ResourceLimits};
use warden_error::{AsErrorCode, ErrorCode};

/// Errors from starting, stopping, signaling, or selecting a runtime.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// No runtime is registered for the requested or selected execution mode.
    #[error("runtime {0:?} is not available")]
    NotAvailable(ExecutionMode),

    /// Spawning the module process failed.
    #[error("starting module process: {0}")]
    Spawn(#[source] std::io::Error),

    /// The module's control socket never appeared within the startup timeout.
    #[error("timed out waiting for module socket at {0}")]
    SocketTimeout(PathBuf),

    /// Signaling or waiting on a running instance failed.
    #[error("signaling module: {0}")]
    Signal(#[source] std::io::Error),

    /// This runtime cannot perform the requested operation.
    #[error("{0}")]
    Unsupported(String),
}

impl AsErrorCode for RuntimeError {
    fn code(&self) -> ErrorCode {
        match self {
            RuntimeError::NotAvailable(_) | RuntimeError::Unsupported(_) => ErrorCode::InvalidConfig,
            RuntimeError::Spawn(_) | RuntimeError::Signal(_) => ErrorCode::Fatal,
            RuntimeError::SocketTimeout(_) => ErrorCode::Timeout,
        }
    }
}

/// What a runtime needs to start a module instance.
#[derive(Debug, Clone)]
pub struct RuntimeSpec {
    /// Stable instance id, unique per running module (usually the module id).
    pub id: String,
    /// Path to the module's executable image on disk.
    pub image_path: PathBuf,
    /// Unix domain socket the module's control-plane server listens on once up.
    pub socket_path: PathBuf,
    /// Extra environment variables, merged over `WARDEN_SOCKET`/`WARDEN_MODULE_ID`.
    pub env: BTreeMap<String, String>,
    /// Working directory for the module process, if not the agent's own.
    pub working_dir: Option<PathBuf>,
    /// Capabilities the module declares it needs, used by [`RuntimeManager::select`].
    pub required_capabilities: RequiredCapabilities,
    /// Resource limits to apply to the instance, runtime permitting.
    pub resources: ResourceLimits,
}

/// A running (or just-stopped) module instance.
pub struct RuntimeInstance {
    /// Matches the [`RuntimeSpec::id`] it was started from.
    pub id: String,
    /// Process id, for the userspace/privileged runtimes.
    pub pid: Option<u32>,
    /// Container id, for the containerd runtime.
    pub container_id: Option<String>,
    /// Control socket path.
    pub socket_path: PathBuf,
    /// Loopback TCP port the module accepts forwarded connections on, once known.
    pub data_port: Option<u16>,
    /// When the instance was started.
    pub started_at: DateTime<Utc>,
    /// Current lifecycle state.
    pub state: ModuleState,
    /// Number of times the supervisor has restarted this instance.
    pub restart_count: u32,
    /// The most recent failure observed, if any.
    pub last_error: Option<String>,
    /// Owns whatever handle is needed to tear the instance down; consumed by `stop`.
    stop_fn: Option<Box<dyn FnOnce() + Send>>,
}

impl std::fmt::Debug for RuntimeInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeInstance")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("container_id", &self.container_id)
            .field("socket_path", &self.socket_path)
            .field("state", &self.state)
            .field("restart_count", &self.restart_count)
            .finish_non_exhaustive()
    }
}

impl RuntimeInstance {
    /// Build an instance with no teardown closure, for runtimes (real or test doubles)
    /// whose `stop` doesn't need one — e.g. a runtime that tears down via its own `stop`
    /// implementation rather than a closure captured at spawn time.
    #[must_use]
    pub fn without_stop_fn(
        id: String,
        pid: Option<u32>,
        container_id: Option<String>,
        socket_path: PathBuf,
        data_port: Option<u16>,
        started_at: DateTime<Utc>,
        state: ModuleState,
    ) -> Self {
        Self {
            id,
            pid,
            container_id,
            socket_path,
            data_port,
            started_at,
            state,
            restart_count: 0,
            last_error: None,
            stop_fn: None,
        }
    }

    /// Run the instance's teardown closure, if it hasn't already been consumed.
    pub fn stop(&mut self) {
        if let Some(stop_fn) = self.stop_fn.take() {
            stop_fn();
        }
    }
}

/// Uniform operations every concrete runtime implements.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Short, stable name for logging (`"userspace"`, `"privileged"`, `"containerd"`).
    fn name(&self) -> &'static str;

    /// The [`ExecutionMode`] this runtime serves.
    fn mode(&self) -> ExecutionMode;

    /// Launch a module instance and wait for its control socket to come up.
    async fn start(&self, spec: &RuntimeSpec) -> Result<RuntimeInstance, RuntimeError>;

    /// Tear an instance down, waiting briefly for a graceful exit before killing it.
    async fn stop(&self, instance: &mut RuntimeInstance) -> Result<(), RuntimeError>;

    /// Send a signal to the instance's process, if the runtime supports it.
    async fn signal(&self, instance: &RuntimeInstance, signal: i32) -> Result<(), RuntimeError>;

    /// Whether the instance's process/task is still alive.
    async fn is_running(&self, instance: &RuntimeInstance) -> bool;
}

/// Which runtimes to bring up and how to configure the ones that need it.
#[derive(Debug, Clone, Default)]
pub struct RuntimeManagerConfig {
    /// Execution mode used when a module spec doesn't request one explicitly.
    pub default_mode: Option<ExecutionMode>,
    /// Bring up the privileged runtime.
    pub enable_privileged: bool,
    /// Configuration for the privileged runtime, if enabled.
    pub privileged: Option<PrivilegedConfig>,
    /// Bring up the containerd runtime.
    pub enable_containerd: bool,
    /// containerd socket address; defaults to `/run/containerd/containerd.sock`.
    pub containerd_address: Option<String>,
    /// containerd namespace; defaults to `"warden"`.
    pub containerd_namespace: Option<String>,
}

/// Holds one [`Runtime`] per available [`ExecutionMode`] and selects among them.
pub struct RuntimeManager {
    runtimes: RwLock<Vec<(ExecutionMode, Box<dyn Runtime>)>>,
    default_mode: ExecutionMode,
}

fn find(runtimes: &[(ExecutionMode, Box<dyn Runtime>)], mode: ExecutionMode) -> Option<&dyn Runtime> {
    runtimes.iter().find(|(m, _)| *m == mode).map(|(_, r)| r.as_ref())
}

impl RuntimeManager {
    /// Bring up the userspace runtime unconditionally, plus privileged/containerd if
    /// `config` enables them. A failure to initialize an optional runtime is logged and
    /// skipped rather than propagated, matching the fleet's "run with what's available"
    /// posture on agents that aren't root or don't have containerd installed.
    pub fn new(config: RuntimeManagerConfig) -> Self {
        let mut runtimes: Vec<(ExecutionMode, Box<dyn Runtime>)> = Vec::new();
        runtimes.push((ExecutionMode::Userspace, Box::new(UserspaceRuntime::new())));

        if config.enable_privileged {
            let priv_config = config.privileged.clone().unwrap_or_default();
            match PrivilegedRuntime::new(priv_config) {
                Ok(runtime) => runtimes.push((ExecutionMode::Privileged, Box::new(runtime))),
                Err(err) => tracing::warn!(error = %err, "failed to initialize privileged runtime"),
            }
        }

        if config.enable_containerd {
            let address = config
                .containerd_address
                .clone()
                .unwrap_or_else(|| "/run/containerd/containerd.sock".to_string());
            let namespace = config.containerd_namespace.clone().unwrap_or_else(|| "warden".to_string());
            match ContainerdRuntime::new(address, namespace) {
                Ok(runtime) => runtimes.push((ExecutionMode::Containerd, Box::new(runtime))),
                Err(err) => tracing::warn!(error = %err, "failed to initialize containerd runtime"),
            }
        }

        let default_mode = config.default_mode.unwrap_or(ExecutionMode::Userspace);
        tracing::info!(
            default = ?default_mode,
            runtimes = ?runtimes.iter().map(|(m, _)| *m).collect::<Vec<_>>(),
            "runtime manager initialized"
        );

        Self {
            runtimes: RwLock::new(runtimes),
            default_mode,
        }
    }

    /// Register or replace the runtime for a mode, mainly for tests.
    pub fn register(&self, runtime: Box<dyn Runtime>) {
        let mode = runtime.mode();
        let mut runtimes = self.runtimes.write().unwrap();
        runtimes.retain(|(m, _)| *m != mode);
        runtimes.push((mode, runtime));
    }

    /// Whether a runtime is registered for `mode`.
    #[must_use]
    pub fn is_available(&self, mode: ExecutionMode) -> bool {
        self.runtimes.read().unwrap().iter().any(|(m, _)| *m == mode)
    }

    /// Every registered execution mode.
    #[must_use]
    pub fn available_modes(&self) -> Vec<ExecutionMode> {
        self.runtimes.read().unwrap().iter().map(|(m, _)| *m).collect()
    }

    /// Select the runtime a module spec should use: its explicit `execution_mode` if
    /// one is set and registered; otherwise the privileged runtime if the module needs
    /// root or raw packets and one is available; otherwise the default.
    ///
    /// # Errors
    /// [`RuntimeError::NotAvailable`] if an explicitly requested mode has no registered
    /// runtime.
    pub fn select(
        &self,
        execution_mode: Option<ExecutionMode>,
        capabilities: &RequiredCapabilities,
    ) -> Result<ExecutionMode, RuntimeError> {
        if let Some(mode) = execution_mode {
            return if self.is_available(mode) {
                Ok(mode)
            } else {
                Err(RuntimeError::NotAvailable(mode))
            };
        }

        if capabilities.requires_root || capabilities.can_handle_raw_packets {
            if self.is_available(ExecutionMode::Privileged) {
                return Ok(ExecutionMode::Privileged);
            }
            tracing::warn!("module requires root but privileged runtime not available, using default");
        }

        Ok(self.default_mode)
    }

    /// Select a runtime for `spec` and start it.
    ///
    /// # Errors
    /// Propagates [`RuntimeManager::select`]'s or the chosen runtime's `start` failure.
    pub async fn start_module(
        &self,
        spec: &RuntimeSpec,
        execution_mode: Option<ExecutionMode>,
    ) -> Result<(ExecutionMode, RuntimeInstance), RuntimeError> {
        let mode = self.select(execution_mode, &spec.required_capabilities)?;
        let instance = {
            let runtimes = self.runtimes.read().unwrap();
            let runtime = find(&runtimes, mode).ok_or(RuntimeError::NotAvailable(mode))?;
            tracing::debug!(module = %spec.id, runtime = runtime.name(), "starting module with selected runtime");
            runtime.start(spec).await?
        };
        Ok((mode, instance))
    }

    /// Stop an instance using the runtime it was started on.
    ///
    /// # Errors
    /// [`RuntimeError::NotAvailable`] if that mode's runtime was unregistered since
    /// start, or the runtime's own `stop` failure.
    pub async fn stop_module(&self, mode: ExecutionMode, instance: &mut RuntimeInstance) -> Result<(), RuntimeError> {
        let runtimes = self.runtimes.read().unwrap();
        let runtime = find(&runtimes, mode).ok_or(RuntimeError::NotAvailable(mode))?;
        runtime.stop(instance).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeRuntime {
        mode: ExecutionMode,
    }

    #[async_trait]
    impl Runtime for FakeRuntime {
        fn name(&self) -> &'static str {
            "fake"
        }
        fn mode(&self) -> ExecutionMode {
            self.mode
        }
        async fn start(&self, spec: &RuntimeSpec) -> Result<RuntimeInstance, RuntimeError> {
            Ok(RuntimeInstance {
                id: spec.id.clone(),
                pid: Some(1),
                container_id: None,
                socket_path: spec.socket_path.clone(),
                data_port: None,
                started_at: Utc::now(),
                state: ModuleState::Running,
                restart_count: 0,
                last_error: None,
                stop_fn: None,
            })
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

    fn manager_with(modes: &[ExecutionMode]) -> RuntimeManager {
        let manager = RuntimeManager::new(RuntimeManagerConfig::default());
        for &mode in modes {
            manager.register(Box::new(FakeRuntime { mode }));
        }
        manager
    }

    fn spec(capabilities: RequiredCapabilities) -> RuntimeSpec {
        RuntimeSpec {
            id: "ssh-honeypot".into(),
            image_path: "/opt/warden/modules/ssh-honeypot".into(),
            socket_path: "/tmp/ssh-honeypot.sock".into(),
            env: BTreeMap::new(),
            working_dir: None,
            required_capabilities: capabilities,
            resources: ResourceLimits::default(),
        }
    }

    #[test]
    fn defaults_to_userspace_when_nothing_requires_root() {
        let manager = manager_with(&[]);
        let mode = manager.select(None, &RequiredCapabilities::default()).unwrap();
        assert_eq!(mode, ExecutionMode::Userspace);
    }

    #[test]
    fn prefers_privileged_when_capability_requires_root_and_available() {
        let manager = manager_with(&[ExecutionMode::Privileged]);
        let caps = RequiredCapabilities {
            requires_root: true,
            can_handle_raw_packets: false,
        };
        let mode = manager.select(None, &caps).unwrap();
        assert_eq!(mode, ExecutionMode::Privileged);
    }

    #[test]
    fn falls_back_to_default_when_privileged_required_but_unavailable() {
        let manager = manager_with(&[]);
        let caps = RequiredCapabilities {
            requires_root: true,
            can_handle_raw_packets: false,
        };
        let mode = manager.select(None, &caps).unwrap();
        assert_eq!(mode, ExecutionMode::Userspace);
    }

    #[test]
    fn explicit_mode_request_for_unavailable_runtime_errors() {
        let manager = manager_with(&[]);
        let err = manager
            .select(Some(ExecutionMode::Containerd), &RequiredCapabilities::default())
            .unwrap_err();
        assert!(matches!(err, RuntimeError::NotAvailable(ExecutionMode::Containerd)));
    }

    #[tokio::test]
    async fn start_module_uses_the_selected_runtime() {
        let manager = manager_with(&[ExecutionMode::Privileged]);
        let caps = RequiredCapabilities {
            requires_root: true,
            can_handle_raw_packets: false,
        };
        let (mode, instance) = manager.start_module(&spec(caps), None).await.unwrap();
        assert_eq!(mode, ExecutionMode::Privileged);
        assert_eq!(instance.state, ModuleState::Running);
    }
}
