//! `ModuleService` envelope: the agent's control-socket protocol with a supervised module.

use serde::{Deserialize, Serialize};
use warden_core::ConnectionHandshake;

/// A request sent from the agent to a module over the control socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ModuleRequest {
    /// A new attacker connection was accepted; hand it to the module.
    HandleConnection {
        /// Handshake metadata describing the accepted connection.
        handshake: ConnectionHandshake,
    },
    /// Liveness probe; the module should answer promptly.
    HealthCheck,
}

/// A module's response to a [`ModuleRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ModuleResponse {
    /// Accepted the connection. Exactly one of `data_port`/`fd_pass` governs how the
    /// forwarder hands over the data stream.
    ConnectionAccepted {
        /// Localhost TCP port the module is listening on for the data stream, if using
        /// `tcp_relay`. Absent when `fd_pass` is used instead.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data_port: Option<u16>,
        /// `true` if the module expects the raw file descriptor passed via `SCM_RIGHTS`
        /// on this same control socket, following this response.
        #[serde(default)]
        fd_pass: bool,
    },
    /// The module declined the connection.
    ConnectionRejected {
        /// Why the module declined.
        reason: String,
    },
    /// Response to [`ModuleRequest::HealthCheck`].
    Health {
        /// `true` if the module considers itself healthy.
        healthy: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_connection_request_round_trips_through_json() {
        let request = ModuleRequest::HandleConnection {
            handshake: ConnectionHandshake {
                connection_id: "c1".into(),
                source_ip: "10.0.0.1".into(),
                source_port: 4444,
                dest_ip: "10.0.0.2".into(),
                dest_port: 2222,
                protocol: "tcp".into(),
                timestamp_ns: 1,
                metadata: Default::default(),
            },
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"op\":\"handle_connection\""));
        let decoded: ModuleRequest = serde_json::from_str(&json).unwrap();
        assert!(matches!(decoded, ModuleRequest::HandleConnection { .. }));
    }

    #[test]
    fn connection_accepted_response_omits_absent_data_port() {
        let response = ModuleResponse::ConnectionAccepted {
            data_port: None,
            fd_pass: true,
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(!json.contains("data_port"));
    }
}
