//! Satellite (fleet agent) identity entities, master- and agent-side (§3, §4.3, §4.9).

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Master-side lifecycle status of a satellite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SatelliteStatus {
    /// Enrolled but has not yet sent a heartbeat.
    Pending,
    /// Heartbeat received within the liveness window.
    Online,
    /// Explicitly disconnected (graceful shutdown observed).
    Offline,
    /// No heartbeat within the liveness window; presumed crashed or network-partitioned.
    Unreachable,
    /// Offline long enough that its assignments should be considered abandoned.
    Stale,
}

impl SatelliteStatus {
    /// Statuses from which a heartbeat transitions directly to `Online`.
    #[must_use]
    pub fn valid_transitions(self) -> &'static [SatelliteStatus] {
        use SatelliteStatus::{Offline, Online, Pending, Stale, Unreachable};
        match self {
            Pending => &[Online, Unreachable],
            Online => &[Offline, Unreachable],
            Offline => &[Online],
            Unreachable => &[Online, Stale],
            Stale => &[Online],
        }
    }

    /// Whether transitioning from `self` to `next` is a legal state-machine edge.
    #[must_use]
    pub fn can_transition_to(self, next: SatelliteStatus) -> bool {
        self.valid_transitions().contains(&next)
    }
}

/// Master-side record of a fleet agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Satellite {
    /// Stable agent identifier minted at enrollment (`sat-<hex>` or `agent-<hex>`).
    pub id: String,
    /// Reported hostname.
    pub hostname: String,
    /// Reported IP addresses, used as cert SANs.
    pub ip_addresses: Vec<String>,
    /// Reported OS (e.g. `"linux"`).
    pub os: String,
    /// Reported architecture (e.g. `"x86_64"`).
    pub arch: String,
    /// Current lifecycle status.
    pub status: SatelliteStatus,
    /// When this satellite was enrolled.
    pub registered_at: DateTime<Utc>,
    /// Last time a heartbeat was received.
    pub last_seen_at: DateTime<Utc>,
    /// Serial number of the currently issued mTLS client certificate.
    pub cert_serial: String,
}

/// Agent-side persisted identity and sync bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AgentState {
    /// This agent's own id, once enrolled.
    pub agent_id: String,
    /// Whether enrollment has completed.
    pub registered: bool,
    /// Path to the mTLS client certificate on disk.
    pub cert_path: String,
    /// Path to the mTLS client private key on disk.
    pub key_path: String,
    /// Last catalog version this agent has verified and applied.
    pub catalog_version: i64,
    /// Last assignment config version this agent has verified and applied.
    pub config_version: i64,
    /// When enrollment completed.
    pub registered_at: DateTime<Utc>,
    /// When the last successful sync tick completed.
    pub last_sync_at: Option<DateTime<Utc>>,
}

impl AgentState {
    /// An unregistered, empty agent state, the value written before enrollment succeeds.
    #[must_use]
    pub fn unregistered() -> Self {
        Self {
            agent_id: String::new(),
            registered: false,
            cert_path: String::new(),
            key_path: String::new(),
            catalog_version: 0,
            config_version: 0,
            registered_at: Utc::now(),
            last_sync_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_can_go_online_or_unreachable_but_not_stale() {
        assert!(SatelliteStatus::Pending.can_transition_to(SatelliteStatus::Online));
        assert!(SatelliteStatus::Pending.can_transition_to(SatelliteStatus::Unreachable));
        assert!(!SatelliteStatus::Pending.can_transition_to(SatelliteStatus::Stale));
    }

    #[test]
    fn stale_can_only_recover_to_online() {
        assert!(SatelliteStatus::Stale.can_transition_to(SatelliteStatus::Online));
        assert!(!SatelliteStatus::Stale.can_transition_to(SatelliteStatus::Offline));
    }

    #[test]
    fn unregistered_state_has_zeroed_versions() {
        let state = AgentState::unregistered();
        assert!(!state.registered);
        assert_eq!(state.catalog_version, 0);
        assert_eq!(state.config_version, 0);
    }
}
