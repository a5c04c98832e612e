use async_trait::async_trait;

use crate::{Runtime, RuntimeError, RuntimeInstance, RuntimeSpec};
use warden_core::ExecutionMode;

/// Placeholder for running modules as containerd tasks.
///
/// Talking to containerd for real needs its client/gRPC stack, which isn't part of
/// this workspace's dependency set; this type exists so `RuntimeManagerConfig {
/// enable_containerd: true, .. }` fails the way the Go agent's runtime manager does —
/// logged and skipped at manager construction, rather than the process refusing to
/// build — and so `start`/`stop` have a concrete place to land once that integration is
/// written. Until then, selecting `ExecutionMode::Containerd` starts but every
/// operation reports [`RuntimeError::Unsupported`].
pub struct ContainerdRuntime {
    address: String,
    namespace: String,
}

impl ContainerdRuntime {
    /// Record the containerd socket address and namespace to use once this runtime is
    /// wired up to an actual client.
    ///
    /// # Errors
    /// Currently infallible; kept `Result`-returning to match [`super::PrivilegedRuntime::new`]'s
    /// shape, since a real client dial belongs here.
    pub fn new(address: String, namespace: String) -> Result<Self, RuntimeError> {
        Ok(Self { address, namespace })
    }
}

#[async_trait]
impl Runtime for ContainerdRuntime {
    fn name(&self) -> &'static str {
        "containerd"
    }

    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Containerd
    }

    async fn start(&self, _spec: &RuntimeSpec) -> Result<RuntimeInstance, RuntimeError> {
        Err(RuntimeError::Unsupported(format!(
            "containerd runtime ({} / {}) has no client integration in this build",
            self.address, self.namespace
        )))
    }

    async fn stop(&self, _instance: &mut RuntimeInstance) -> Result<(), RuntimeError> {
        Err(RuntimeError::Unsupported("containerd runtime has no client integration in this build".into()))
    }

    async fn signal(&self, _instance: &RuntimeInstance, _signal: i32) -> Result<(), RuntimeError> {
        Err(RuntimeError::Unsupported("containerd runtime has no client integration in this build".into()))
    }

    async fn is_running(&self, _instance: &RuntimeInstance) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construction_always_succeeds_and_records_config() {
        let runtime = ContainerdRuntime::new("/run/containerd/containerd.sock".into(), "warden".into()).unwrap();
        assert_eq!(runtime.name(), "containerd");
        assert_eq!(runtime.mode(), ExecutionMode::Containerd);
    }

    #[tokio::test]
    async fn start_reports_unsupported() {
        let runtime = ContainerdRuntime::new("sock".into(), "ns".into()).unwrap();
        let spec = RuntimeSpec {
            id: "m".into(),
            image_path: "docker.io/warden/m:latest".into(),
            socket_path: "/tmp/m.sock".into(),
            env: Default::default(),
            working_dir: None,
            required_capabilities: warden_core::RequiredCapabilities::default(),
            resources: warden_core::ResourceLimits::default(),
        };
        assert!(runtime.start(&spec).await.is_err());
    }
}
