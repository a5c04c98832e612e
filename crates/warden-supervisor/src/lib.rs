// SPDX-License-Identifier: MIT OR Apache-2.0
//! Owns the set of modules an agent currently runs: starts and stops them through a
//! [`warden_runtime::RuntimeManager`], talks `ModuleService` over their control socket,
//! and runs the health-check loop that restarts a module with exponential backoff after
//! repeated failures.
//!
//! State transitions for a single module are serialized by holding that module's
//! [`tokio::sync::Mutex`] for the duration of the operation; concurrent callers for
//! different modules never block each other.
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod client;
mod policy;

pub use client::ModuleClient;
pub use policy::{HealthCheckConfig, RestartPolicy};

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use warden_core::event::{AgentEvent, EventKind, TelemetrySink};
use warden_core::{ConnectionHandshake, ExecutionMode, ModuleState};
use warden_error::{AsErrorCode, ErrorCode};
use warden_protocol::ModuleResponse;
use warden_runtime::{RuntimeError, RuntimeManager, RuntimeSpec};

/// Errors from starting, stopping, or talking to a supervised module.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// No module is registered under this id.
    #[error("module {0} is not registered")]
    NotFound(String),

    /// The module is not in a state that can serve the requested operation.
    #[error("module {0} is {1:?}, not running")]
    NotRunning(String, ModuleState),

    /// Selecting or driving the runtime failed.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// Framing or encoding a control-socket message failed.
    #[error(transparent)]
    Protocol(#[from] warden_protocol::ProtocolError),

    /// Dialing the module's control socket failed.
    #[error("connecting to module control socket: {0}")]
    Connect(#[source] std::io::Error),

    /// The module didn't respond within the operation's deadline.
    #[error("module did not respond to {0} in time")]
    Timeout(&'static str),
}

impl AsErrorCode for SupervisorError {
    fn code(&self) -> ErrorCode {
        match self {
            SupervisorError::NotFound(_) => ErrorCode::NotFound,
            SupervisorError::NotRunning(_, _) => ErrorCode::InvariantViolation,
            SupervisorError::Runtime(e) => e.code(),
            SupervisorError::Protocol(e) => e.code(),
            SupervisorError::Connect(_) => ErrorCode::Transient,
            SupervisorError::Timeout(_) => ErrorCode::Timeout,
        }
    }
}

/// Point-in-time counters for a supervised module, surfaced to the reconciler/RPC layer.
///
/// `memory_bytes`/`cpu_percent` are reserved for a future resource-sampling hook; nothing
/// in this crate populates them yet.
#[derive(Debug, Clone, Default)]
pub struct ModuleMetrics {
    /// Total connections handed to this module since it last started.
    pub connections_total: u64,
    /// Connections currently believed to be open (tracked by the forwarder, not here).
    pub connections_active: u64,
    /// Bytes received from attackers, aggregated from the forwarder.
    pub bytes_received: u64,
    /// Bytes sent to attackers, aggregated from the forwarder.
    pub bytes_sent: u64,
    /// Control-socket or health-check failures observed.
    pub errors_total: u64,
    /// Exponential moving average of health-check round-trip time, in milliseconds.
    pub avg_response_ms: f64,
    /// Resident memory of the module process, in bytes. Not yet sampled.
    pub memory_bytes: u64,
    /// CPU utilization of the module process, as a percentage. Not yet sampled.
    pub cpu_percent: f64,
    /// Health checks that returned `healthy: true`.
    pub health_checks_passed: u64,
    /// Health checks that failed, timed out, or returned `healthy: false`.
    pub health_checks_failed: u64,
    /// When the last health check completed, successful or not.
    pub last_health_check: Option<chrono::DateTime<Utc>>,
}

/// One module under supervision: its spec, runtime instance, control-socket client, and
/// restart/health bookkeeping.
struct ManagedModule {
    spec: RuntimeSpec,
    requested_mode: Option<ExecutionMode>,
    actual_mode: Option<ExecutionMode>,
    instance: Option<warden_runtime::RuntimeInstance>,
    client: Option<ModuleClient>,
    state: ModuleState,
    restart_count: u32,
    last_error: Option<String>,
    metrics: ModuleMetrics,
}

impl ManagedModule {
    fn new(spec: RuntimeSpec, requested_mode: Option<ExecutionMode>) -> Self {
        Self {
            spec,
            requested_mode,
            actual_mode: None,
            instance: None,
            client: None,
            state: ModuleState::Stopped,
            restart_count: 0,
            last_error: None,
            metrics: ModuleMetrics::default(),
        }
    }
}

/// Supervises every module an agent runs: owns their lifecycle, control-socket clients,
/// and the restart-with-backoff health loop.
pub struct Supervisor {
    agent_id: String,
    runtime_manager: Arc<RuntimeManager>,
    telemetry: Arc<dyn TelemetrySink>,
    restart_policy: RestartPolicy,
    health_check: HealthCheckConfig,
    modules: RwLock<HashMap<String, Arc<Mutex<ManagedModule>>>>,
}

impl Supervisor {
    /// Build a supervisor with no modules registered yet.
    pub fn new(
        agent_id: impl Into<String>,
        runtime_manager: Arc<RuntimeManager>,
        telemetry: Arc<dyn TelemetrySink>,
        restart_policy: RestartPolicy,
        health_check: HealthCheckConfig,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            runtime_manager,
            telemetry,
            restart_policy,
            health_check,
            modules: RwLock::new(HashMap::new()),
        }
    }

    fn emit(&self, kind: EventKind, module_id: &str) {
        let mut attributes = std::collections::BTreeMap::new();
        attributes.insert("module_id".to_string(), module_id.to_string());
        self.telemetry.emit(AgentEvent {
            event_id: uuid::Uuid::new_v4().to_string(),
            agent_id: self.agent_id.clone(),
            kind,
            occurred_at: Utc::now(),
            attributes,
        });
    }

    async fn handle_for(&self, module_id: &str) -> Result<Arc<Mutex<ManagedModule>>, SupervisorError> {
        self.modules
            .read()
            .await
            .get(module_id)
            .cloned()
            .ok_or_else(|| SupervisorError::NotFound(module_id.to_string()))
    }

    /// Current lifecycle state of a module, if registered.
    pub async fn state(&self, module_id: &str) -> Option<ModuleState> {
        let handle = self.modules.read().await.get(module_id).cloned()?;
        Some(handle.lock().await.state)
    }

    /// A snapshot of a module's metrics, if registered.
    pub async fn metrics(&self, module_id: &str) -> Option<ModuleMetrics> {
        let handle = self.modules.read().await.get(module_id).cloned()?;
        Some(handle.lock().await.metrics.clone())
    }

    /// Every module id currently registered, regardless of state.
    pub async fn module_ids(&self) -> Vec<String> {
        self.modules.read().await.keys().cloned().collect()
    }

    /// Register and start a module. If the module is already registered and running,
    /// this is a no-op.
    ///
    /// # Errors
    /// Propagates [`RuntimeManager::start_module`] or dialing the control socket.
    pub async fn start_module(&self, spec: RuntimeSpec, execution_mode: Option<ExecutionMode>) -> Result<(), SupervisorError> {
        let module_id = spec.id.clone();
        let handle = {
            let mut modules = self.modules.write().await;
            modules
                .entry(module_id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(ManagedModule::new(spec.clone(), execution_mode))))
                .clone()
        };

        let mut module = handle.lock().await;
        if module.state == ModuleState::Running {
            return Ok(());
        }
        module.spec = spec;
        module.requested_mode = execution_mode;
        self.start_locked(&module_id, &mut module).await
    }

    async fn start_locked(&self, module_id: &str, module: &mut ManagedModule) -> Result<(), SupervisorError> {
        module.state = ModuleState::Starting;
        match self.runtime_manager.start_module(&module.spec, module.requested_mode).await {
            Ok((mode, instance)) => {
                let client = ModuleClient::connect(&instance.socket_path).await?;
                module.actual_mode = Some(mode);
                module.instance = Some(instance);
                module.client = Some(client);
                module.state = ModuleState::Running;
                module.last_error = None;
                tracing::info!(module = module_id, ?mode, "module started");
                self.emit(EventKind::ModuleStarted, module_id);
                Ok(())
            }
            Err(err) => {
                module.state = ModuleState::Failed;
                module.last_error = Some(err.to_string());
                tracing::warn!(module = module_id, error = %err, "module failed to start");
                Err(err.into())
            }
        }
    }

    /// Stop a module. If it's already stopped, this is a no-op.
    ///
    /// # Errors
    /// [`SupervisorError::NotFound`] if the module isn't registered.
    pub async fn stop_module(&self, module_id: &str) -> Result<(), SupervisorError> {
        let handle = self.handle_for(module_id).await?;
        let mut module = handle.lock().await;
        self.stop_locked(module_id, &mut module).await
    }

    async fn stop_locked(&self, module_id: &str, module: &mut ManagedModule) -> Result<(), SupervisorError> {
        if module.instance.is_none() {
            module.state = ModuleState::Stopped;
            return Ok(());
        }
        module.state = ModuleState::Stopping;
        module.client = None;
        if let (Some(mode), Some(mut instance)) = (module.actual_mode, module.instance.take()) {
            self.runtime_manager.stop_module(mode, &mut instance).await?;
        }
        module.state = ModuleState::Stopped;
        tracing::info!(module = module_id, "module stopped");
        self.emit(EventKind::ModuleStopped, module_id);
        Ok(())
    }

    /// Stop every registered module, best-effort; the first error is returned after all
    /// modules have been attempted.
    pub async fn stop_all(&self) -> Result<(), SupervisorError> {
        let handles: Vec<(String, Arc<Mutex<ManagedModule>>)> =
            self.modules.read().await.iter().map(|(id, h)| (id.clone(), h.clone())).collect();
        let mut first_err = None;
        for (module_id, handle) in handles {
            let mut module = handle.lock().await;
            if let Err(err) = self.stop_locked(&module_id, &mut module).await {
                tracing::warn!(module = %module_id, error = %err, "error stopping module during stop_all");
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Hand an accepted connection to the module responsible for it.
    ///
    /// # Errors
    /// [`SupervisorError::NotFound`] if unregistered, [`SupervisorError::NotRunning`] if
    /// the module has no live control-socket client, or the control-socket round trip's
    /// own failure.
    pub async fn handle_connection(
        &self,
        module_id: &str,
        handshake: ConnectionHandshake,
    ) -> Result<ModuleResponse, SupervisorError> {
        let handle = self.handle_for(module_id).await?;
        let mut module = handle.lock().await;
        if module.state != ModuleState::Running {
            return Err(SupervisorError::NotRunning(module_id.to_string(), module.state));
        }
        let client = module
            .client
            .as_mut()
            .ok_or_else(|| SupervisorError::NotRunning(module_id.to_string(), module.state))?;
        let response = client.handle_connection(handshake, self.health_check.timeout).await;
        match &response {
            Ok(_) => module.metrics.connections_total += 1,
            Err(_) => module.metrics.errors_total += 1,
        }
        response
    }

    /// Run the health-check loop forever, polling every registered `Running` module
    /// every [`HealthCheckConfig::interval`] and restarting it with backoff on failure.
    ///
    /// Never returns under normal operation; intended to be spawned as its own task.
    /// Requires an `Arc<Supervisor>` since an unhealthy module's restart-with-backoff is
    /// spawned as its own task, so it can outlive this tick without blocking the health
    /// check of every other module on the agent.
    pub async fn run(self: Arc<Self>) {
        if !self.health_check.enabled {
            tracing::info!("health checks disabled, supervisor health loop idle");
            return;
        }
        let mut ticker = tokio::time::interval(self.health_check.interval);
        loop {
            ticker.tick().await;
            self.check_all().await;
        }
    }

    async fn check_all(self: &Arc<Self>) {
        let handles: Vec<(String, Arc<Mutex<ManagedModule>>)> =
            self.modules.read().await.iter().map(|(id, h)| (id.clone(), h.clone())).collect();
        for (module_id, handle) in handles {
            self.check_one(module_id, handle).await;
        }
    }

    /// Probe one module's health. This awaits only the bounded health-check RPC, never a
    /// restart backoff: on failure it marks the module `Stopping` (so it's skipped by
    /// later ticks until the restart completes) and hands the stop/sleep/start sequence
    /// to its own spawned task, so one module's multi-minute backoff can never stall the
    /// health checks of every other module running on this agent.
    async fn check_one(self: &Arc<Self>, module_id: String, handle: Arc<Mutex<ManagedModule>>) {
        let mut module = handle.lock().await;
        if module.state != ModuleState::Running {
            return;
        }
        let Some(client) = module.client.as_mut() else {
            return;
        };

        let started = tokio::time::Instant::now();
        let result = client.health_check(self.health_check.timeout).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        module.metrics.last_health_check = Some(Utc::now());

        match result {
            Ok(true) => {
                module.metrics.health_checks_passed += 1;
                module.metrics.avg_response_ms = ema(module.metrics.avg_response_ms, elapsed_ms);
                module.restart_count = 0;
                return;
            }
            Ok(false) => {
                tracing::warn!(module = %module_id, "module reported unhealthy");
            }
            Err(err) => {
                tracing::warn!(module = %module_id, error = %err, "health check failed");
            }
        }
        module.metrics.health_checks_failed += 1;

        if module.restart_count >= self.restart_policy.max_restarts {
            tracing::error!(module = %module_id, restarts = module.restart_count, "module exhausted restart budget, leaving it failed");
            module.state = ModuleState::Failed;
            return;
        }

        let delay = self.restart_policy.delay_for(module.restart_count);
        module.restart_count += 1;
        // Mark the module out of `Running` before releasing the lock so the next tick's
        // `check_all` pass doesn't also see it as healthy-but-unpolled and spawn a second
        // concurrent restart for the same module.
        module.state = ModuleState::Stopping;
        drop(module);

        let supervisor = self.clone();
        tokio::spawn(async move {
            supervisor.restart_with_backoff(module_id, handle, delay).await;
        });
    }

    /// Stop, wait out the backoff delay, then start a module again. Runs as its own
    /// spawned task per restart so it never blocks [`check_all`]'s loop over the other
    /// modules.
    async fn restart_with_backoff(
        self: Arc<Self>,
        module_id: String,
        handle: Arc<Mutex<ManagedModule>>,
        delay: std::time::Duration,
    ) {
        tracing::info!(module = %module_id, delay_ms = delay.as_millis(), "restarting unhealthy module");
        {
            let mut module = handle.lock().await;
            if let Err(err) = self.stop_locked(&module_id, &mut module).await {
                tracing::warn!(module = %module_id, error = %err, "error stopping unhealthy module before restart");
            }
        }

        tokio::time::sleep(delay).await;

        let mut module = handle.lock().await;
        match self.start_locked(&module_id, &mut module).await {
            Ok(()) => self.emit(EventKind::ModuleRestarted, &module_id),
            Err(err) => tracing::warn!(module = %module_id, error = %err, "restart attempt failed"),
        }
    }
}

fn ema(previous: f64, sample: f64) -> f64 {
    if previous == 0.0 {
        sample
    } else {
        previous * 0.8 + sample * 0.2
    }
}
