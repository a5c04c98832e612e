use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::process::Command;

use crate::util::wait_for_socket;
use crate::{Runtime, RuntimeError, RuntimeInstance, RuntimeSpec};
use warden_core::{ExecutionMode, ModuleState};

const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);
const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for the privileged runtime.
#[derive(Debug, Clone, Default)]
pub struct PrivilegedConfig {
    /// Path to `sudo`; looked up on `PATH` if `None`.
    pub sudo_path: Option<String>,
    /// Drop back to `target_user`/`target_group` after gaining privileges.
    pub drop_privileges: bool,
    /// User to drop to when `drop_privileges` is set.
    pub target_user: Option<String>,
    /// Group to drop to when `drop_privileges` is set.
    pub target_group: Option<String>,
    /// Scope the process to `required_capabilities` via `capsh` rather than full root.
    pub use_capabilities: bool,
    /// Linux capability names passed to `capsh --caps`, e.g. `"cap_net_raw"`.
    pub required_capabilities: Vec<String>,
}

/// Runs a module under `sudo`, optionally scoped to a capability set via `capsh` and
/// optionally dropped to an unprivileged user/group after the privileged step.
///
/// Modules selected onto this runtime run with elevated privileges; unlike the
/// userspace runtime, failing to initialize this one is non-fatal to the agent — the
/// manager simply has no `Privileged` entry and any module that needs one fails
/// selection instead of silently running unprivileged.
pub struct PrivilegedRuntime {
    sudo_path: String,
    config: PrivilegedConfig,
}

impl PrivilegedRuntime {
    /// Resolve `sudo` on `PATH` (unless `config.sudo_path` is set) and confirm it's
    /// accessible.
    ///
    /// # Errors
    /// [`RuntimeError::Unsupported`] if `sudo` cannot be found or stat'd.
    pub fn new(config: PrivilegedConfig) -> Result<Self, RuntimeError> {
        let sudo_path = match &config.sudo_path {
            Some(path) => path.clone(),
            None => which_sudo().ok_or_else(|| RuntimeError::Unsupported("sudo not found on PATH".into()))?,
        };
        if !std::path::Path::new(&sudo_path).exists() {
            return Err(RuntimeError::Unsupported(format!("sudo not accessible at {sudo_path}")));
        }

        tracing::warn!(
            sudo_path,
            drop_privileges = config.drop_privileges,
            use_capabilities = config.use_capabilities,
            "privileged runtime initialized: modules will run with elevated privileges"
        );

        Ok(Self { sudo_path, config })
    }

    fn build_args(&self, spec: &RuntimeSpec) -> Vec<String> {
        let mut args = vec![self.sudo_path.clone(), "-E".to_string()];

        if self.config.use_capabilities && !self.config.required_capabilities.is_empty() {
            args.push("capsh".to_string());
            args.push(format!("--caps={}+eip", self.config.required_capabilities.join(",")));
            args.push("--".to_string());
        }

        if self.config.drop_privileges {
            if let Some(user) = &self.config.target_user {
                args.push("-u".to_string());
                args.push(user.clone());
                if let Some(group) = &self.config.target_group {
                    args.push("-g".to_string());
                    args.push(group.clone());
                }
            }
        }

        args.push(spec.image_path.display().to_string());
        args
    }
}

fn which_sudo() -> Option<String> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join("sudo"))
        .find(|candidate| candidate.exists())
        .map(|p| p.display().to_string())
}

#[async_trait]
impl Runtime for PrivilegedRuntime {
    fn name(&self) -> &'static str {
        "privileged"
    }

    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Privileged
    }

    #[allow(unsafe_code)]
    async fn start(&self, spec: &RuntimeSpec) -> Result<RuntimeInstance, RuntimeError> {
        if let Some(dir) = spec.socket_path.parent() {
            tokio::fs::create_dir_all(dir).await.map_err(RuntimeError::Spawn)?;
        }
        let _ = tokio::fs::remove_file(&spec.socket_path).await;

        let args = self.build_args(spec);
        let mut cmd = Command::new(&args[0]);
        cmd.args(&args[1..]);
        cmd.env("WARDEN_SOCKET", &spec.socket_path);
        cmd.env("WARDEN_MODULE_ID", &spec.id);
        for (k, v) in &spec.env {
            cmd.env(k, v);
        }
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }
        cmd.kill_on_drop(true);

        tracing::debug!(module = %spec.id, command = ?args, "starting privileged module");

        let mut child = cmd.spawn().map_err(RuntimeError::Spawn)?;
        let pid = child.id();

        if let Err(err) = wait_for_socket(&spec.socket_path, STARTUP_TIMEOUT).await {
            let _ = child.start_kill();
            return Err(err);
        }

        tracing::info!(module = %spec.id, pid, socket = %spec.socket_path.display(), "privileged module started");

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
                        libc::kill(pid as libc::pid_t, libc::SIGTERM);
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
        tracing::info!(module = %instance.id, "privileged module stopped");
        Ok(())
    }

    #[allow(unsafe_code)]
    async fn signal(&self, instance: &RuntimeInstance, signal: i32) -> Result<(), RuntimeError> {
        let Some(pid) = instance.pid else {
            return Err(RuntimeError::Unsupported(format!("no pid recorded for module {}", instance.id)));
        };
        #[cfg(unix)]
        {
            // SAFETY: signaling a pid we observed via `Child::id()`.
            let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
            if rc == 0 {
                Ok(())
            } else {
                Err(RuntimeError::Signal(std::io::Error::last_os_error()))
            }
        }
        #[cfg(not(unix))]
        {
            let _ = (pid, signal);
            Err(RuntimeError::Unsupported("signaling is only supported on unix".into()))
        }
    }

    #[allow(unsafe_code)]
    async fn is_running(&self, instance: &RuntimeInstance) -> bool {
        let Some(pid) = instance.pid else { return false };
        #[cfg(unix)]
        {
            // SAFETY: signal 0 only probes for existence, no side effects.
            unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
        }
        #[cfg(not(unix))]
        {
            let _ = pid;
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_args_wraps_the_image_with_sudo_dash_e() {
        let runtime = PrivilegedRuntime {
            sudo_path: "/usr/bin/sudo".into(),
            config: PrivilegedConfig::default(),
        };
        let spec = RuntimeSpec {
            id: "raw-sniffer".into(),
            image_path: "/opt/warden/modules/raw-sniffer".into(),
            socket_path: "/tmp/raw-sniffer.sock".into(),
            env: Default::default(),
            working_dir: None,
            required_capabilities: warden_core::RequiredCapabilities::default(),
            resources: warden_core::ResourceLimits::default(),
        };
        let args = runtime.build_args(&spec);
        assert_eq!(args, vec!["/usr/bin/sudo", "-E", "/opt/warden/modules/raw-sniffer"]);
    }

    #[test]
    fn build_args_inserts_capsh_when_capabilities_are_scoped() {
        let runtime = PrivilegedRuntime {
            sudo_path: "/usr/bin/sudo".into(),
            config: PrivilegedConfig {
                use_capabilities: true,
                required_capabilities: vec!["cap_net_raw".into(), "cap_net_admin".into()],
                ..Default::default()
            },
        };
        let spec = RuntimeSpec {
            id: "raw-sniffer".into(),
            image_path: "/opt/warden/modules/raw-sniffer".into(),
            socket_path: "/tmp/raw-sniffer.sock".into(),
            env: Default::default(),
            working_dir: None,
            required_capabilities: warden_core::RequiredCapabilities::default(),
            resources: warden_core::ResourceLimits::default(),
        };
        let args = runtime.build_args(&spec);
        assert!(args.contains(&"capsh".to_string()));
        assert!(args.iter().any(|a| a == "--caps=cap_net_raw,cap_net_admin+eip"));
    }

    #[test]
    fn build_args_drops_to_target_user_when_configured() {
        let runtime = PrivilegedRuntime {
            sudo_path: "/usr/bin/sudo".into(),
            config: PrivilegedConfig {
                drop_privileges: true,
                target_user: Some("warden-module".into()),
                target_group: Some("warden-module".into()),
                ..Default::default()
            },
        };
        let spec = RuntimeSpec {
            id: "m".into(),
            image_path: "/opt/m".into(),
            socket_path: "/tmp/m.sock".into(),
            env: Default::default(),
            working_dir: None,
            required_capabilities: warden_core::RequiredCapabilities::default(),
            resources: warden_core::ResourceLimits::default(),
        };
        let args = runtime.build_args(&spec);
        assert_eq!(
            args,
            vec!["/usr/bin/sudo", "-E", "-u", "warden-module", "-g", "warden-module", "/opt/m"]
        );
    }
}
