// SPDX-License-Identifier: MIT OR Apache-2.0
//! Hands an accepted attacker connection off to the module responsible for it, in one of
//! three modes per module: `fdpass` (duplicate the fd and send it over the module's
//! control socket, Unix only), `tcp_relay` (dial the module's loopback data port and copy
//! bytes both ways), or `proxy` (currently an alias for `tcp_relay`).
//!
//! Every mode writes the same length-prefixed JSON [`ConnectionHandshake`] before any
//! payload bytes flow, so a module never has to guess which mode delivered a connection.
#![deny(unsafe_code)]
#![warn(missing_docs)]

#[cfg(unix)]
mod fdpass;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use warden_core::{ConnectionHandshake, ConnectionMode};
use warden_error::{AsErrorCode, ErrorCode};
use warden_protocol::write_frame;

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors from registering a module or forwarding a connection to it.
#[derive(Debug, thiserror::Error)]
pub enum ForwarderError {
    /// No forwarder is registered for this module.
    #[error("module {0} is not registered with the forwarder")]
    NotRegistered(String),

    /// The module uses `tcp_relay`/`proxy` but has no data port on record.
    #[error("module {0} has no data port configured for tcp relay")]
    NoDataPort(String),

    /// The module uses `fdpass` but its control connection isn't open.
    #[error("module {0} has no control connection for fd passing")]
    NoControlConnection(String),

    /// This build/platform can't serve the requested mode.
    #[error("{0}")]
    UnsupportedMode(&'static str),

    /// Duplicating or sending a file descriptor failed.
    #[error("fd-passing: {0}")]
    Fd(String),

    /// Framing the handshake failed.
    #[error(transparent)]
    Protocol(#[from] warden_protocol::ProtocolError),

    /// Dialing the module or relaying bytes failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// `what` didn't complete before its deadline.
    #[error("{0} timed out")]
    Timeout(&'static str),
}

impl AsErrorCode for ForwarderError {
    fn code(&self) -> ErrorCode {
        match self {
            ForwarderError::NotRegistered(_) => ErrorCode::NotFound,
            ForwarderError::NoDataPort(_) | ForwarderError::NoControlConnection(_) | ForwarderError::UnsupportedMode(_) => {
                ErrorCode::InvalidConfig
            }
            ForwarderError::Fd(_) => ErrorCode::Fatal,
            ForwarderError::Protocol(e) => e.code(),
            ForwarderError::Io(_) => ErrorCode::Transient,
            ForwarderError::Timeout(_) => ErrorCode::Timeout,
        }
    }
}

/// Point-in-time counters for one module's forwarder.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ForwarderMetrics {
    /// Connections handed to this module since it was registered.
    pub connections_total: u64,
    /// Connections currently relaying bytes (always 0 for `fdpass`, which hands off the
    /// fd and forgets the connection).
    pub connections_active: u64,
    /// Bytes copied from the module to the attacker.
    pub bytes_sent: u64,
    /// Bytes copied from the attacker to the module.
    pub bytes_received: u64,
    /// Dial, handshake, or relay failures.
    pub errors_total: u64,
}

#[derive(Default)]
struct MetricsInner {
    connections_total: AtomicU64,
    connections_active: AtomicI64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    errors_total: AtomicU64,
}

impl MetricsInner {
    fn snapshot(&self) -> ForwarderMetrics {
        ForwarderMetrics {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed).max(0) as u64,
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            errors_total: self.errors_total.load(Ordering::Relaxed),
        }
    }
}

/// One module's forwarding configuration: its mode, where to reach it, and its metrics.
struct ModuleForwarder {
    module_id: String,
    mode: ConnectionMode,
    data_port: StdMutex<Option<u16>>,
    control: Option<Mutex<tokio::net::UnixStream>>,
    metrics: MetricsInner,
    active: StdMutex<HashMap<String, DateTime<Utc>>>,
}

impl ModuleForwarder {
    fn set_data_port(&self, data_port: u16) {
        *self.data_port.lock().unwrap() = Some(data_port);
    }

    async fn forward(self: Arc<Self>, client: TcpStream, handshake: ConnectionHandshake) -> Result<(), ForwarderError> {
        match self.mode {
            ConnectionMode::Fdpass => self.forward_fdpass(client, handshake).await,
            ConnectionMode::TcpRelay | ConnectionMode::Proxy => self.forward_tcp_relay(client, handshake).await,
        }
    }

    async fn forward_tcp_relay(self: Arc<Self>, client: TcpStream, handshake: ConnectionHandshake) -> Result<(), ForwarderError> {
        let data_port = self.data_port.lock().unwrap().ok_or_else(|| ForwarderError::NoDataPort(self.module_id.clone()))?;
        let mut module_conn = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(("127.0.0.1", data_port)))
            .await
            .map_err(|_| ForwarderError::Timeout("dialing module data port"))??;

        if let Err(err) = write_frame(&mut module_conn, &handshake).await {
            self.metrics.errors_total.fetch_add(1, Ordering::Relaxed);
            return Err(err.into());
        }

        let connection_id = handshake.connection_id.clone();
        self.metrics.connections_total.fetch_add(1, Ordering::Relaxed);
        self.metrics.connections_active.fetch_add(1, Ordering::Relaxed);
        self.active.lock().unwrap().insert(connection_id.clone(), Utc::now());
        tracing::debug!(module = %self.module_id, connection = %connection_id, data_port, "tcp relay established");

        let forwarder = self.clone();
        tokio::spawn(async move {
            let mut client = client;
            let result = tokio::io::copy_bidirectional(&mut client, &mut module_conn).await;
            forwarder.metrics.connections_active.fetch_sub(1, Ordering::Relaxed);
            forwarder.active.lock().unwrap().remove(&connection_id);
            match result {
                Ok((received, sent)) => {
                    forwarder.metrics.bytes_received.fetch_add(received, Ordering::Relaxed);
                    forwarder.metrics.bytes_sent.fetch_add(sent, Ordering::Relaxed);
                }
                Err(err) => {
                    forwarder.metrics.errors_total.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(module = %forwarder.module_id, connection = %connection_id, error = %err, "relay ended with an error");
                }
            }
        });

        Ok(())
    }

    #[cfg(unix)]
    async fn forward_fdpass(self: Arc<Self>, client: TcpStream, handshake: ConnectionHandshake) -> Result<(), ForwarderError> {
        use std::os::fd::AsRawFd;

        let control = self.control.as_ref().ok_or_else(|| ForwarderError::NoControlConnection(self.module_id.clone()))?;
        let mut guard = control.lock().await;
        write_frame(&mut *guard, &handshake).await?;

        let control_fd = guard.as_raw_fd();
        let client_fd = client.as_raw_fd();
        fdpass::send_fd(control_fd, client_fd)?;
        drop(guard);
        drop(client);

        self.metrics.connections_total.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(module = %self.module_id, connection = %handshake.connection_id, "connection fd passed to module");
        Ok(())
    }

    #[cfg(not(unix))]
    async fn forward_fdpass(self: Arc<Self>, _client: TcpStream, _handshake: ConnectionHandshake) -> Result<(), ForwarderError> {
        Err(ForwarderError::UnsupportedMode("fd passing is only supported on unix"))
    }
}

/// Owns every module's forwarding configuration and routes accepted connections to it.
pub struct ConnectionForwarder {
    default_mode: ConnectionMode,
    forwarders: RwLock<HashMap<String, Arc<ModuleForwarder>>>,
}

impl ConnectionForwarder {
    /// Build a forwarder with no modules registered; `default_mode` is used for any
    /// module registered without an explicit mode.
    #[must_use]
    pub fn new(default_mode: ConnectionMode) -> Self {
        Self {
            default_mode,
            forwarders: RwLock::new(HashMap::new()),
        }
    }

    /// Register a module for forwarding. `fdpass` dials the module's control socket up
    /// front; other modes just record the data port.
    ///
    /// # Errors
    /// [`ForwarderError::Io`] if `fdpass` can't dial the control socket.
    pub async fn register_module(
        &self,
        module_id: impl Into<String>,
        socket_path: PathBuf,
        data_port: Option<u16>,
        mode: Option<ConnectionMode>,
    ) -> Result<(), ForwarderError> {
        let module_id = module_id.into();
        let mode = mode.unwrap_or(self.default_mode);

        let control = if mode == ConnectionMode::Fdpass {
            Some(Mutex::new(tokio::net::UnixStream::connect(&socket_path).await?))
        } else {
            None
        };

        let forwarder = Arc::new(ModuleForwarder {
            module_id: module_id.clone(),
            mode,
            data_port: StdMutex::new(data_port),
            control,
            metrics: MetricsInner::default(),
            active: StdMutex::new(HashMap::new()),
        });

        self.forwarders.write().await.insert(module_id.clone(), forwarder);
        tracing::info!(module = %module_id, ?mode, ?data_port, "module registered for connection forwarding");
        Ok(())
    }

    /// Drop a module's forwarding registration. A no-op if it wasn't registered.
    pub async fn unregister_module(&self, module_id: &str) {
        self.forwarders.write().await.remove(module_id);
    }

    /// Record a freshly learned data port for an already-registered `tcp_relay`/`proxy`
    /// module, e.g. one a [`ModuleResponse::ConnectionAccepted`] reported. A no-op for
    /// `fdpass` modules, which have no data port.
    ///
    /// # Errors
    /// [`ForwarderError::NotRegistered`] if the module isn't registered.
    ///
    /// [`ModuleResponse::ConnectionAccepted`]: warden_protocol::ModuleResponse::ConnectionAccepted
    pub async fn note_data_port(&self, module_id: &str, data_port: u16) -> Result<(), ForwarderError> {
        let forwarders = self.forwarders.read().await;
        let forwarder = forwarders.get(module_id).ok_or_else(|| ForwarderError::NotRegistered(module_id.to_string()))?;
        forwarder.set_data_port(data_port);
        Ok(())
    }

    /// Hand `client` to `module_id`'s forwarder, which writes the handshake and then
    /// either passes the fd or relays bytes, depending on its configured mode.
    ///
    /// # Errors
    /// [`ForwarderError::NotRegistered`] if the module isn't registered, or the chosen
    /// mode's own dial/handshake/fd-passing failure.
    pub async fn forward(&self, module_id: &str, client: TcpStream, handshake: ConnectionHandshake) -> Result<(), ForwarderError> {
        let forwarder = self
            .forwarders
            .read()
            .await
            .get(module_id)
            .cloned()
            .ok_or_else(|| ForwarderError::NotRegistered(module_id.to_string()))?;
        forwarder.forward(client, handshake).await
    }

    /// A snapshot of a module's forwarding metrics, if registered.
    pub async fn metrics(&self, module_id: &str) -> Option<ForwarderMetrics> {
        self.forwarders.read().await.get(module_id).map(|f| f.metrics.snapshot())
    }

    /// Connection ids currently relaying through a module (`tcp_relay`/`proxy` only;
    /// `fdpass` hands the fd off and tracks nothing further).
    pub async fn active_connections(&self, module_id: &str) -> Option<Vec<String>> {
        let forwarders = self.forwarders.read().await;
        let forwarder = forwarders.get(module_id)?;
        Some(forwarder.active.lock().unwrap().keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use warden_protocol::read_frame;

    fn handshake(connection_id: &str) -> ConnectionHandshake {
        ConnectionHandshake {
            connection_id: connection_id.to_string(),
            source_ip: "203.0.113.5".into(),
            source_port: 5555,
            dest_ip: "10.0.0.1".into(),
            dest_port: 22,
            protocol: "tcp".into(),
            timestamp_ns: 0,
            metadata: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn forward_to_an_unregistered_module_is_not_registered() {
        let forwarder = ConnectionForwarder::new(ConnectionMode::TcpRelay);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (client, _) = tokio::join!(TcpStream::connect(listener.local_addr().unwrap()), listener.accept());
        let err = forwarder.forward("ghost", client.unwrap(), handshake("c1")).await.unwrap_err();
        assert!(matches!(err, ForwarderError::NotRegistered(_)));
    }

    #[tokio::test]
    async fn tcp_relay_writes_the_handshake_and_copies_bytes_both_ways() {
        let module_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let data_port = module_listener.local_addr().unwrap().port();

        let forwarder = ConnectionForwarder::new(ConnectionMode::TcpRelay);
        forwarder.register_module("echo", "/unused".into(), Some(data_port), None).await.unwrap();

        let module_side = tokio::spawn(async move {
            let (mut stream, _) = module_listener.accept().await.unwrap();
            let received: ConnectionHandshake = read_frame(&mut stream).await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
            received
        });

        let attacker_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let attacker_addr = attacker_listener.local_addr().unwrap();
        let attacker_side = tokio::spawn(async move {
            let mut stream = TcpStream::connect(attacker_addr).await.unwrap();
            stream.write_all(b"hello").await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            buf
        });
        let (client, _) = attacker_listener.accept().await.unwrap();

        forwarder.forward("echo", client, handshake("c2")).await.unwrap();

        let echoed = attacker_side.await.unwrap();
        assert_eq!(&echoed, b"hello");
        let received_handshake = module_side.await.unwrap();
        assert_eq!(received_handshake.connection_id, "c2");

        // Give the spawned relay a moment to finish tallying bytes before asserting.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let metrics = forwarder.metrics("echo").await.unwrap();
        assert_eq!(metrics.connections_total, 1);
        assert!(metrics.bytes_received >= 5);
    }

    #[tokio::test]
    async fn tcp_relay_without_a_registered_data_port_fails_fast() {
        let forwarder = ConnectionForwarder::new(ConnectionMode::TcpRelay);
        forwarder.register_module("no-port", "/unused".into(), None, None).await.unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (client, _) = tokio::join!(TcpStream::connect(listener.local_addr().unwrap()), listener.accept());
        let err = forwarder.forward("no-port", client.unwrap(), handshake("c3")).await.unwrap_err();
        assert!(matches!(err, ForwarderError::NoDataPort(_)));
    }
}
