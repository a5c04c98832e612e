use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::process::Command;

use crate::util::wait_for_socket;
use crate::{Runtime, RuntimeError, RuntimeInstance, RuntimeSpec};
use warden_core::{ExecutionMode, ModuleState};

const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);
const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Runs a module as a plain, unprivileged child process. No sandboxing of any kind;
/// the default runtime for development and for modules with no elevated needs.
pub struct UserspaceRuntime;

impl UserspaceRuntime {
    /// Construct the runtime. Always succeeds; spawning a process needs no setup.
    #[must_use]
    pub fn new() -> Self {
        tracing::warn!("using userspace runtime: no process isolation, for development/low-risk modules only");
        Self
    }
}

impl Default for UserspaceRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Runtime for UserspaceRuntime {
    fn name(&self) -> &'static str {
        "userspace"
    }

    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Userspace
    }

    #[allow(unsafe_code)]
    async fn start(&self, spec: &RuntimeSpec) -> Result<RuntimeInstance, RuntimeError> {
        if let Some(dir) = spec.socket_path.parent() {
            tokio::fs::create_dir_all(dir).await.map_err(RuntimeError::Spawn)?;
        }
        let _ = tokio::fs::remove_file(&spec.socket_path).await;

        let mut cmd = Command::new(&spec.image_path);
        cmd.env("WARDEN_SOCKET", &spec.socket_path);
        cmd.env("WARDEN_MODULE_ID", &spec.id);
        for (k, v) in &spec.env {
            cmd.env(k, v);
        }
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(RuntimeError::Spawn)?;
        let pid = child.id();

        if let Err(err) = wait_for_socket(&spec.socket_path, STARTUP_TIMEOUT).await {
            let _ = child.start_kill();
            return Err(err);
        }

        tracing::info!(module = %spec.id, pid, socket = %spec.socket_path.display(), "userspace module started");

        Ok(RuntimeInstance {
            id: spec.id.clone(),
            pid,
            container_id: None,
            socket_path: spec.socket_path.clone(),
            data_port: None,
            started_at: Utc::now(),
            state: ModuleState::Running,
            restart_count: 0,
            last_error: None,
            stop_fn: Some(Box::new(move || {
                #[cfg(unix)]
                if let Some(pid) = child.id() {
                    // SAFETY: signaling a pid we observed via `Child::id()`.
                    unsafe {
                        libc::kill(pid as libc::pid_t, libc::SIGINT);
                    }
                }
                tokio::spawn(async move {
                    if tokio::time::timeout(GRACEFUL_STOP_TIMEOUT, child.wait()).await.is_err() {
                        let _ = child.start_kill();
                    }
                });
            })),
        })
    }

    async fn stop(&self, instance: &mut RuntimeInstance) -> Result<(), RuntimeError> {
        instance.stop();
        instance.state = ModuleState::Stopped;
        tracing::info!(module = %instance.id, "userspace module stopped");
        Ok(())
    }

    async fn signal(&self, instance: &RuntimeInstance, signal: i32) -> Result<(), RuntimeError> {
        let Some(pid) = instance.pid else {
            return Err(RuntimeError::Unsupported(format!("no pid recorded for module {}", instance.id)));
        };
        send_signal(pid, signal)
    }

    async fn is_running(&self, instance: &RuntimeInstance) -> bool {
        match instance.pid {
            Some(pid) => send_signal(pid, 0).is_ok(),
            None => false,
        }
    }
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn send_signal(pid: u32, signal: i32) -> Result<(), RuntimeError> {
    // SAFETY: `kill(2)` with signal `0` or a standard termination signal on a pid we
    // observed from our own `Child::id()` is a well-defined, side-effect-free probe
    // (signal 0) or a normal termination request otherwise.
    let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(RuntimeError::Signal(std::io::Error::last_os_error()))
    }
}

#[cfg(not(unix))]
fn send_signal(_pid: u32, _signal: i32) -> Result<(), RuntimeError> {
    Err(RuntimeError::Unsupported("signaling is only supported on unix".into()))
}
