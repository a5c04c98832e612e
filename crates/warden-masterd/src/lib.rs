// SPDX-License-Identifier: MIT OR Apache-2.0
//! Master daemon composition: bootstrap every `warden-master` service, terminate mTLS,
//! then serve the control-plane/admin HTTP surface until shutdown.
//!
//! The control plane is reached over TLS with client-certificate verification against
//! the fleet root: `Register` is reachable by any TLS client (an agent presents no
//! certificate before it is enrolled), every other route requires one, enforced by
//! `warden_master`'s own [`warden_master::ClientCertVerified`] route gate. The listener
//! is a manual `rustls`/`hyper` accept loop rather than bare `axum::serve`, since
//! surfacing per-connection client-cert verification into axum's extension map isn't
//! something the `axum::serve` helper exposes.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::Extension;
use warden_config::MasterConfig;
use warden_error::{AsErrorCode, ErrorCode};
use warden_master::{AppState, ClientCertVerified, MasterError, MasterServices};

/// Errors bringing up or running the master daemon.
#[derive(Debug, thiserror::Error)]
pub enum MasterdError {
    /// Service composition failed.
    #[error(transparent)]
    Services(#[from] MasterError),

    /// Issuing or loading the master's own server certificate failed.
    #[error("server certificate: {0}")]
    Tls(#[from] warden_ca::CaError),

    /// The server certificate, key, or fleet root could not be parsed into a TLS config.
    #[error("tls config: {0}")]
    TlsConfig(String),

    /// The HTTP listener couldn't bind `bind_addr`.
    #[error("bind {addr}: {source}")]
    Bind {
        /// The address that failed to bind.
        addr: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// An I/O failure persisting or loading the server certificate/key.
    #[error("io: {0}")]
    Io(std::io::Error),
}

impl AsErrorCode for MasterdError {
    fn code(&self) -> ErrorCode {
        match self {
            MasterdError::Services(e) => e.code(),
            MasterdError::Tls(e) => e.code(),
            MasterdError::TlsConfig(_) => ErrorCode::InvalidConfig,
            MasterdError::Bind { .. } | MasterdError::Io(_) => ErrorCode::Fatal,
        }
    }
}

/// Everything needed to run the control-plane listener: the composed app state, the
/// bound socket, and the TLS acceptor wrapping it.
pub struct MasterListener {
    state: AppState,
    listener: tokio::net::TcpListener,
    acceptor: tokio_rustls::TlsAcceptor,
}

impl MasterListener {
    /// The address the control-plane/admin surface is bound to.
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }
}

/// Bootstrap every master service against `config`, bind the HTTP listener, and load or
/// issue the master's own TLS server certificate. Splitting bind from serve lets `main`
/// log the bound address (and tests bind to an ephemeral port) before the server loop
/// takes over.
pub async fn bootstrap(config: &MasterConfig) -> Result<MasterListener, MasterdError> {
    // rustls 0.23 needs a process-wide crypto provider installed before building any
    // `ServerConfig`; a second daemon instance in the same process (e.g. tests) would
    // find one already installed, so a failure here is not itself fatal.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let services = MasterServices::bootstrap(config).await?;
    let tls_config = load_or_issue_server_tls(&services.ca, &config.data_dir, &config.bind_addr)?;
    let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(tls_config));

    let state = AppState {
        services: Arc::new(services),
    };
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .map_err(|source| MasterdError::Bind {
            addr: config.bind_addr.clone(),
            source,
        })?;

    Ok(MasterListener {
        state,
        listener,
        acceptor,
    })
}

/// Load the persisted server certificate/key from `<data_dir>/server.{pem,key}`, or
/// issue and persist a fresh one on first boot, then build the `rustls` server config
/// that verifies client certificates against the fleet root. Unauthenticated handshakes
/// are still allowed to complete at the TLS layer, since `Register` is reachable by an
/// agent that holds no certificate yet; every other route is gated on
/// [`ClientCertVerified`] at the HTTP layer instead.
fn load_or_issue_server_tls(
    ca: &warden_ca::Ca,
    data_dir: &str,
    bind_addr: &str,
) -> Result<rustls::ServerConfig, MasterdError> {
    let dir = PathBuf::from(data_dir);
    let cert_path = dir.join("server.pem");
    let key_path = dir.join("server.key");

    let (cert_pem, key_pem) = if cert_path.exists() && key_path.exists() {
        let cert_pem = std::fs::read_to_string(&cert_path).map_err(MasterdError::Io)?;
        let key_pem = std::fs::read_to_string(&key_path).map_err(MasterdError::Io)?;
        (cert_pem, key_pem)
    } else {
        let (hostnames, ips) = server_identity(bind_addr);
        let signed = ca.issue_server_certificate(&hostnames, &ips)?;
        std::fs::create_dir_all(&dir).map_err(MasterdError::Io)?;
        std::fs::write(&cert_path, &signed.certificate_pem).map_err(MasterdError::Io)?;
        std::fs::write(&key_path, &signed.private_key_pem).map_err(MasterdError::Io)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))
                .map_err(MasterdError::Io)?;
        }
        (signed.certificate_pem, signed.private_key_pem)
    };

    let cert_chain = rustls_pemfile::certs(&mut cert_pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| MasterdError::TlsConfig(format!("parsing server certificate: {e}")))?;
    let private_key = rustls_pemfile::private_key(&mut key_pem.as_bytes())
        .map_err(|e| MasterdError::TlsConfig(format!("parsing server key: {e}")))?
        .ok_or_else(|| MasterdError::TlsConfig("no private key found in server.key".into()))?;

    let mut root_store = rustls::RootCertStore::empty();
    let root_certs = rustls_pemfile::certs(&mut ca.root_cert_pem().as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| MasterdError::TlsConfig(format!("parsing fleet root: {e}")))?;
    for cert in root_certs {
        root_store
            .add(cert)
            .map_err(|e| MasterdError::TlsConfig(e.to_string()))?;
    }

    let client_verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(root_store))
        .allow_unauthenticated()
        .build()
        .map_err(|e| MasterdError::TlsConfig(e.to_string()))?;

    rustls::ServerConfig::builder()
        .with_client_cert_verifier(client_verifier)
        .with_single_cert(cert_chain, private_key)
        .map_err(|e| MasterdError::TlsConfig(e.to_string()))
}

/// Derive the server certificate's SAN set from the configured bind address: the literal
/// bind IP (when it isn't a wildcard address) plus loopback and a couple of conventional
/// hostnames, enough for an agent dialing the master by IP or by name.
fn server_identity(bind_addr: &str) -> (Vec<String>, Vec<IpAddr>) {
    let host = bind_addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(bind_addr);
    let mut hostnames = vec!["warden-master".to_string(), "localhost".to_string()];
    let mut ips = vec![IpAddr::from([127, 0, 0, 1])];

    match host.parse::<IpAddr>() {
        Ok(ip) if !ip.is_unspecified() => ips.push(ip),
        Ok(_) => {}
        Err(_) if !host.is_empty() => hostnames.push(host.to_string()),
        Err(_) => {}
    }
    (hostnames, ips)
}

/// Serve the control-plane/admin HTTP surface on `listener` until `shutdown` resolves.
/// Each connection gets its own task: the TLS handshake completes, whether the peer
/// presented a verified client certificate is recorded as a per-connection
/// [`ClientCertVerified`] extension, and the request is dispatched into the shared
/// `axum` router through `hyper`'s low-level connection driver.
pub async fn serve(
    listener: MasterListener,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), MasterdError> {
    let MasterListener {
        state,
        listener,
        acceptor,
    } = listener;
    let app = warden_master::build_app(state);
    tokio::pin!(shutdown);

    loop {
        let (tcp_stream, peer_addr) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    tracing::warn!(error = %err, "accept failed");
                    continue;
                }
            },
            () = &mut shutdown => {
                tracing::info!("shutting down control-plane listener");
                return Ok(());
            }
        };

        let acceptor = acceptor.clone();
        let app = app.clone();
        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(tcp_stream).await {
                Ok(stream) => stream,
                Err(err) => {
                    tracing::debug!(peer = %peer_addr, error = %err, "tls handshake failed");
                    return;
                }
            };

            let verified = tls_stream.get_ref().1.peer_certificates().is_some();
            let app = app.layer(Extension(ClientCertVerified(verified)));

            let io = hyper_util::rt::TokioIo::new(tls_stream);
            let service = hyper::service::service_fn(move |req: hyper::Request<hyper::body::Incoming>| {
                let app = app.clone();
                async move {
                    let response = tower::ServiceExt::oneshot(app, req.map(axum::body::Body::new))
                        .await
                        .unwrap_or_else(|err: std::convert::Infallible| match err {});
                    Ok::<_, std::convert::Infallible>(response)
                }
            });

            let result = hyper_util::server::conn::auto::Builder::new(hyper_util::rt::TokioExecutor::new())
                .serve_connection(io, service)
                .await;
            if let Err(err) = result {
                tracing::debug!(peer = %peer_addr, error = %err, "connection error");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bootstrap_binds_an_ephemeral_port_and_issues_a_server_certificate() {
        let dir = tempfile::tempdir().unwrap();
        let config = MasterConfig {
            data_dir: dir.path().to_string_lossy().to_string(),
            bind_addr: "127.0.0.1:0".to_string(),
            ..Default::default()
        };

        let listener = bootstrap(&config).await.unwrap();
        assert!(listener.local_addr().unwrap().port() > 0);
        assert!(dir.path().join("server.pem").exists());
        assert!(dir.path().join("server.key").exists());
    }

    #[tokio::test]
    async fn rebooting_against_the_same_data_dir_reuses_the_server_certificate() {
        let dir = tempfile::tempdir().unwrap();
        let config = MasterConfig {
            data_dir: dir.path().to_string_lossy().to_string(),
            bind_addr: "127.0.0.1:0".to_string(),
            ..Default::default()
        };

        let first = bootstrap(&config).await.unwrap();
        let first_pem = std::fs::read_to_string(dir.path().join("server.pem")).unwrap();
        drop(first);
        let _second = bootstrap(&config).await.unwrap();
        let second_pem = std::fs::read_to_string(dir.path().join("server.pem")).unwrap();
        assert_eq!(first_pem, second_pem);
    }
}
