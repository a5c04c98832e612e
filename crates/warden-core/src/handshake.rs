//! The wire handshake that precedes every forwarded connection's byte stream (§4.10, §6).

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Metadata sent once, before the byte stream, so the receiving module knows what it's
/// looking at. Exactly one handshake precedes each forwarded connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ConnectionHandshake {
    /// Unique id for this connection, scoped to the agent.
    pub connection_id: String,
    /// Attacker source IP.
    pub source_ip: String,
    /// Attacker source port.
    pub source_port: u16,
    /// Local destination IP the connection was accepted on.
    pub dest_ip: String,
    /// Local destination port (the listener's bound port).
    pub dest_port: u16,
    /// `"tcp"` or `"udp"`.
    pub protocol: String,
    /// Nanosecond timestamp the connection was accepted, for latency accounting.
    pub timestamp_ns: u64,
    /// Free-form metadata (e.g. TLS SNI, proxy-protocol header fields).
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let handshake = ConnectionHandshake {
            connection_id: "c-1".into(),
            source_ip: "203.0.113.5".into(),
            source_port: 51234,
            dest_ip: "0.0.0.0".into(),
            dest_port: 2222,
            protocol: "tcp".into(),
            timestamp_ns: 1_000_000,
            metadata: BTreeMap::new(),
        };
        let json = serde_json::to_string(&handshake).unwrap();
        let back: ConnectionHandshake = serde_json::from_str(&json).unwrap();
        assert_eq!(handshake, back);
    }
}
