// SPDX-License-Identifier: MIT OR Apache-2.0
//! Binds one TCP listener per [`warden_core::ListenerAssignment`] and dispatches each
//! accepted connection to either the [`warden_forwarder::ConnectionForwarder`] or, for
//! `high_interaction` listeners, a freshly requested sandbox session.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use uuid::Uuid;
use warden_core::ConnectionHandshake;
use warden_error::{AsErrorCode, ErrorCode};
use warden_forwarder::ConnectionForwarder;
use warden_protocol::rpc::RequestHiSessionRequest;
use warden_protocol::ModuleResponse;
use warden_supervisor::Supervisor;

const HI_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors from binding, stopping, or dispatching a listener.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    /// Only `"tcp"` listeners are currently bindable; UDP has no accept-loop model and
    /// is rejected up front rather than silently degraded.
    #[error("unsupported listener protocol: {0}")]
    UnsupportedProtocol(String),

    /// Binding the requested port failed.
    #[error("binding :{port}: {source}")]
    Bind {
        /// Port that failed to bind.
        port: u16,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },
}

impl AsErrorCode for ListenerError {
    fn code(&self) -> ErrorCode {
        match self {
            ListenerError::UnsupportedProtocol(_) => ErrorCode::InvalidConfig,
            ListenerError::Bind { .. } => ErrorCode::Fatal,
        }
    }
}

struct BoundListener {
    module_id: String,
    high_interaction: bool,
    accept_task: JoinHandle<()>,
}

/// Binds and tears down per-assignment listeners, dispatching each accepted connection
/// through the forwarder or, for `high_interaction` listeners, a sandbox session.
pub struct ListenerManager {
    agent_id: String,
    master_base_url: String,
    http: reqwest::Client,
    supervisor: Arc<Supervisor>,
    forwarder: Arc<ConnectionForwarder>,
    listeners: RwLock<HashMap<String, BoundListener>>,
}

impl ListenerManager {
    /// Build a manager with no listeners bound yet.
    #[must_use]
    pub fn new(
        agent_id: String,
        master_base_url: String,
        http: reqwest::Client,
        supervisor: Arc<Supervisor>,
        forwarder: Arc<ConnectionForwarder>,
    ) -> Self {
        Self {
            agent_id,
            master_base_url,
            http,
            supervisor,
            forwarder,
            listeners: RwLock::new(HashMap::new()),
        }
    }

    /// Bind `listener_id` on `:port`/`protocol` and spawn its accept loop. A no-op if
    /// `listener_id` is already bound.
    ///
    /// # Errors
    /// [`ListenerError::UnsupportedProtocol`] if `protocol` isn't `"tcp"`,
    /// [`ListenerError::Bind`] if the port can't be bound.
    pub async fn start(
        &self,
        listener_id: &str,
        module_id: &str,
        protocol: &str,
        port: u16,
        high_interaction: bool,
    ) -> Result<(), ListenerError> {
        if self.listeners.read().await.contains_key(listener_id) {
            return Ok(());
        }
        if protocol != "tcp" {
            return Err(ListenerError::UnsupportedProtocol(protocol.to_string()));
        }

        let tcp = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|source| ListenerError::Bind { port, source })?;

        let accept_task = self.spawn_accept_loop(listener_id.to_string(), module_id.to_string(), high_interaction, tcp);

        self.listeners.write().await.insert(
            listener_id.to_string(),
            BoundListener {
                module_id: module_id.to_string(),
                high_interaction,
                accept_task,
            },
        );

        tracing::info!(listener = listener_id, module = module_id, port, high_interaction, "listener started");
        Ok(())
    }

    /// Cancel `listener_id`'s accept loop and drop its bound socket. A no-op if it isn't
    /// currently bound.
    pub async fn stop(&self, listener_id: &str) {
        if let Some(bound) = self.listeners.write().await.remove(listener_id) {
            bound.accept_task.abort();
            tracing::info!(listener = listener_id, module = %bound.module_id, "listener stopped");
        }
    }

    /// Cancel every bound listener's accept loop.
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.listeners.read().await.keys().cloned().collect();
        for id in ids {
            self.stop(&id).await;
        }
    }

    /// Listener ids currently bound.
    pub async fn listener_ids(&self) -> Vec<String> {
        self.listeners.read().await.keys().cloned().collect()
    }

    /// Listener ids currently bound to `module_id`, so a caller tearing the module down
    /// knows which listeners to stop with it.
    pub async fn listener_ids_for_module(&self, module_id: &str) -> Vec<String> {
        self.listeners
            .read()
            .await
            .iter()
            .filter(|(_, bound)| bound.module_id == module_id)
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn spawn_accept_loop(
        &self,
        listener_id: String,
        module_id: String,
        high_interaction: bool,
        tcp: TcpListener,
    ) -> JoinHandle<()> {
        let agent_id = self.agent_id.clone();
        let master_base_url = self.master_base_url.clone();
        let http = self.http.clone();
        let supervisor = self.supervisor.clone();
        let forwarder = self.forwarder.clone();

        tokio::spawn(async move {
            loop {
                let (socket, peer_addr) = match tcp.accept().await {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        tracing::warn!(listener = %listener_id, error = %err, "accept error");
                        continue;
                    }
                };

                let listener_id = listener_id.clone();
                let module_id = module_id.clone();
                let agent_id = agent_id.clone();
                let master_base_url = master_base_url.clone();
                let http = http.clone();
                let supervisor = supervisor.clone();
                let forwarder = forwarder.clone();

                tokio::spawn(async move {
                    let local_addr = match socket.local_addr() {
                        Ok(addr) => addr,
                        Err(err) => {
                            tracing::warn!(listener = %listener_id, error = %err, "could not read local addr");
                            return;
                        }
                    };

                    let connection_id = Uuid::new_v4().to_string();
                    tracing::debug!(
                        connection = %connection_id,
                        listener = %listener_id,
                        source = %peer_addr,
                        dest = %local_addr,
                        "accepted connection"
                    );

                    if high_interaction {
                        handle_hi_connection(&http, &master_base_url, &agent_id, &listener_id, socket, peer_addr).await;
                        return;
                    }

                    handle_forwarded_connection(&supervisor, &forwarder, &module_id, &listener_id, socket, peer_addr, local_addr, connection_id)
                        .await;
                });
            }
        })
    }
}

async fn handle_forwarded_connection(
    supervisor: &Supervisor,
    forwarder: &ConnectionForwarder,
    module_id: &str,
    listener_id: &str,
    socket: TcpStream,
    peer_addr: std::net::SocketAddr,
    local_addr: std::net::SocketAddr,
    connection_id: String,
) {
    let handshake = ConnectionHandshake {
        connection_id: connection_id.clone(),
        source_ip: peer_addr.ip().to_string(),
        source_port: peer_addr.port(),
        dest_ip: local_addr.ip().to_string(),
        dest_port: local_addr.port(),
        protocol: "tcp".to_string(),
        timestamp_ns: Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64,
        metadata: Default::default(),
    };

    let response = match supervisor.handle_connection(module_id, handshake.clone()).await {
        Ok(response) => response,
        Err(err) => {
            tracing::warn!(module = module_id, listener = listener_id, error = %err, "module rejected connection");
            return;
        }
    };

    match response {
        ModuleResponse::ConnectionAccepted { data_port, .. } => {
            if let Some(port) = data_port {
                if let Err(err) = forwarder.note_data_port(module_id, port).await {
                    tracing::warn!(module = module_id, error = %err, "could not record module data port");
                    return;
                }
            }
            if let Err(err) = forwarder.forward(module_id, socket, handshake).await {
                tracing::warn!(module = module_id, connection = %connection_id, error = %err, "forwarding connection failed");
            }
        }
        ModuleResponse::ConnectionRejected { reason } => {
            tracing::debug!(module = module_id, connection = %connection_id, reason, "module declined connection");
        }
        ModuleResponse::Health { .. } => {
            tracing::warn!(module = module_id, "module sent a health response to a connection handoff");
        }
    }
}

async fn handle_hi_connection(
    http: &reqwest::Client,
    master_base_url: &str,
    agent_id: &str,
    listener_id: &str,
    client: TcpStream,
    peer_addr: std::net::SocketAddr,
) {
    let request = RequestHiSessionRequest {
        agent_id: agent_id.to_string(),
        listener_id: listener_id.to_string(),
        source_ip: peer_addr.ip().to_string(),
        source_port: peer_addr.port(),
    };

    let url = format!("{master_base_url}/rpc/v1/sessions");
    let response = match http.post(url).json(&request).send().await {
        Ok(response) => response,
        Err(err) => {
            tracing::warn!(listener = listener_id, error = %err, "requesting HI session failed");
            return;
        }
    };
    let response = match response.error_for_status() {
        Ok(response) => response,
        Err(err) => {
            tracing::warn!(listener = listener_id, error = %err, "master rejected HI session request");
            return;
        }
    };
    let session: warden_protocol::rpc::RequestHiSessionResponse = match response.json().await {
        Ok(body) => body,
        Err(err) => {
            tracing::warn!(listener = listener_id, error = %err, "malformed HI session response");
            return;
        }
    };

    tracing::debug!(
        listener = listener_id,
        session = %session.session_id,
        endpoint = %session.sandbox_endpoint,
        "HI session established"
    );

    let mut sandbox = match tokio::time::timeout(HI_DIAL_TIMEOUT, TcpStream::connect(&session.sandbox_endpoint)).await {
        Ok(Ok(conn)) => conn,
        Ok(Err(err)) => {
            tracing::warn!(listener = listener_id, session = %session.session_id, error = %err, "dialing sandbox endpoint failed");
            return;
        }
        Err(_) => {
            tracing::warn!(listener = listener_id, session = %session.session_id, "dialing sandbox endpoint timed out");
            return;
        }
    };

    let mut client = client;
    if let Err(err) = tokio::io::copy_bidirectional(&mut client, &mut sandbox).await {
        tracing::debug!(listener = listener_id, session = %session.session_id, error = %err, "HI relay ended with an error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use warden_core::ConnectionMode;
    use warden_runtime::{Runtime, RuntimeError, RuntimeInstance, RuntimeManager, RuntimeManagerConfig, RuntimeSpec};
    use warden_supervisor::Supervisor;

    struct StubRuntime;

    #[async_trait::async_trait]
    impl Runtime for StubRuntime {
        fn name(&self) -> &'static str {
            "stub"
        }
        fn mode(&self) -> warden_core::ExecutionMode {
            warden_core::ExecutionMode::Userspace
        }
        async fn start(&self, spec: &RuntimeSpec) -> Result<RuntimeInstance, RuntimeError> {
            Ok(RuntimeInstance::without_stop_fn(
                spec.id.clone(),
                None,
                None,
                spec.socket_path.clone(),
                None,
                Utc::now(),
                warden_core::ModuleState::Running,
            ))
        }
        async fn stop(&self, instance: &mut RuntimeInstance) -> Result<(), RuntimeError> {
            instance.state = warden_core::ModuleState::Stopped;
            Ok(())
        }
        async fn signal(&self, _instance: &RuntimeInstance, _signal: i32) -> Result<(), RuntimeError> {
            Ok(())
        }
        async fn is_running(&self, _instance: &RuntimeInstance) -> bool {
            true
        }
    }

    async fn serve_fake_module(socket_path: std::path::PathBuf, data_port: u16) {
        let _ = tokio::fs::remove_file(&socket_path).await;
        let listener = tokio::net::UnixListener::bind(&socket_path).unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else { return };
                tokio::spawn(async move {
                    loop {
                        let request: Result<warden_protocol::ModuleRequest, _> = warden_protocol::read_frame(&mut stream).await;
                        let Ok(request) = request else { return };
                        let response = match request {
                            warden_protocol::ModuleRequest::HealthCheck => ModuleResponse::Health { healthy: true },
                            warden_protocol::ModuleRequest::HandleConnection { .. } => ModuleResponse::ConnectionAccepted {
                                data_port: Some(data_port),
                                fd_pass: false,
                            },
                        };
                        if warden_protocol::write_frame(&mut stream, &response).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn a_connection_on_a_non_hi_listener_is_handed_to_the_forwarder() {
        let tmp = tempfile::tempdir().unwrap();
        let socket_path = tmp.path().join("echo.sock");

        let echo_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let data_port = echo_listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = echo_listener.accept().await.unwrap();
            let _received: ConnectionHandshake = warden_protocol::read_frame(&mut stream).await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
        });

        serve_fake_module(socket_path.clone(), data_port).await;

        let runtime_manager = RuntimeManager::new(RuntimeManagerConfig::default());
        runtime_manager.register(Box::new(StubRuntime));
        let runtime_manager = StdArc::new(runtime_manager);

        let supervisor = StdArc::new(Supervisor::new(
            "agent-1".to_string(),
            runtime_manager,
            StdArc::new(warden_core::NullSink),
            Default::default(),
            Default::default(),
        ));
        supervisor
            .start_module(
                RuntimeSpec {
                    id: "echo".into(),
                    image_path: "/bin/true".into(),
                    socket_path: socket_path.clone(),
                    env: Default::default(),
                    working_dir: None,
                    required_capabilities: Default::default(),
                    resources: Default::default(),
                },
                Some(warden_core::ExecutionMode::Userspace),
            )
            .await
            .unwrap();

        let forwarder = StdArc::new(ConnectionForwarder::new(ConnectionMode::TcpRelay));
        forwarder.register_module("echo", socket_path.clone(), None, None).await.unwrap();

        let manager = ListenerManager::new(
            "agent-1".to_string(),
            "https://master.invalid".to_string(),
            reqwest::Client::new(),
            supervisor,
            forwarder.clone(),
        );

        let free_port = {
            let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
            probe.local_addr().unwrap().port()
        };
        manager.start("l1", "echo", "tcp", free_port, false).await.unwrap();

        let mut attacker = TcpStream::connect(("127.0.0.1", free_port)).await.unwrap();
        attacker.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        attacker.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        manager.stop("l1").await;
        assert!(manager.listener_ids().await.is_empty());
    }

    #[test]
    fn udp_is_rejected_up_front() {
        let err = ListenerError::UnsupportedProtocol("udp".into());
        assert_eq!(err.code(), ErrorCode::InvalidConfig);
    }
}
