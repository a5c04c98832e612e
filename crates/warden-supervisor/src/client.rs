//! `ModuleService` control-socket client: one connection per supervised module.

use std::path::Path;
use std::time::Duration;

use tokio::net::UnixStream;
use warden_core::ConnectionHandshake;
use warden_protocol::{read_frame, write_frame, ModuleRequest, ModuleResponse};

use crate::SupervisorError;

/// A connection to a single module's `ModuleService` control socket.
pub struct ModuleClient {
    stream: UnixStream,
}

impl ModuleClient {
    /// Dial the module's control socket. The runtime has already waited for the socket
    /// to appear by the time a module reaches `Running`, so this should not block.
    ///
    /// # Errors
    /// [`SupervisorError::Connect`] if the socket can't be dialed.
    pub async fn connect(socket_path: &Path) -> Result<Self, SupervisorError> {
        let stream = UnixStream::connect(socket_path).await.map_err(SupervisorError::Connect)?;
        Ok(Self { stream })
    }

    /// Send a [`ModuleRequest::HealthCheck`] and report whether the module answered
    /// healthy within `timeout`.
    ///
    /// # Errors
    /// [`SupervisorError::Timeout`] if the module doesn't respond in time, or the
    /// underlying framing failure otherwise.
    pub async fn health_check(&mut self, timeout: Duration) -> Result<bool, SupervisorError> {
        let round_trip = async {
            write_frame(&mut self.stream, &ModuleRequest::HealthCheck).await?;
            let response: ModuleResponse = read_frame(&mut self.stream).await?;
            Ok::<_, SupervisorError>(matches!(response, ModuleResponse::Health { healthy: true }))
        };
        tokio::time::timeout(timeout, round_trip)
            .await
            .map_err(|_| SupervisorError::Timeout("health_check"))?
    }

    /// Send a [`ModuleRequest::HandleConnection`] and return the module's response.
    ///
    /// # Errors
    /// [`SupervisorError::Timeout`] if the module doesn't respond in time, or the
    /// underlying framing failure otherwise.
    pub async fn handle_connection(
        &mut self,
        handshake: ConnectionHandshake,
        timeout: Duration,
    ) -> Result<ModuleResponse, SupervisorError> {
        let round_trip = async {
            write_frame(&mut self.stream, &ModuleRequest::HandleConnection { handshake }).await?;
            let response: ModuleResponse = read_frame(&mut self.stream).await?;
            Ok::<_, SupervisorError>(response)
        };
        tokio::time::timeout(timeout, round_trip)
            .await
            .map_err(|_| SupervisorError::Timeout("handle_connection"))?
    }
}
