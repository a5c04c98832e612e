//! High-interaction session entities (§3, §4.12).

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Lifecycle of a high-interaction sandbox session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Created, sandbox endpoint not yet confirmed reachable.
    Pending,
    /// Traffic is actively being tunnelled.
    Active,
    /// Session has ended; the record is retained, never deleted.
    Ended,
}

impl SessionState {
    /// `true` for `Ended`, from which no further transition is legal.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Ended)
    }

    /// Whether `self -> next` is a legal state-machine edge.
    #[must_use]
    pub fn can_transition_to(self, next: SessionState) -> bool {
        matches!(
            (self, next),
            (SessionState::Pending, SessionState::Active)
                | (SessionState::Pending, SessionState::Ended)
                | (SessionState::Active, SessionState::Ended)
        )
    }
}

/// A single attacker's escalation into an isolated sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct HISession {
    /// Session id, formatted `hi-<agent_id>-<counter>`.
    pub id: String,
    /// Agent that requested this session.
    pub agent_id: String,
    /// Listener the triggering connection arrived on.
    pub listener_id: String,
    /// Attacker source IP.
    pub source_ip: String,
    /// Attacker source port.
    pub source_port: u16,
    /// Sandbox node selected to host this session.
    pub sandbox_node: String,
    /// Endpoint (`host:port`) the agent should tunnel to.
    pub sandbox_endpoint: String,
    /// 32-byte tunnel key, produced by the sandbox, never reused across sessions.
    pub tunnel_key: [u8; 32],
    /// Current lifecycle state.
    pub state: SessionState,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
    /// When the session ended, if it has.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_can_become_active_or_ended() {
        assert!(SessionState::Pending.can_transition_to(SessionState::Active));
        assert!(SessionState::Pending.can_transition_to(SessionState::Ended));
    }

    #[test]
    fn active_cannot_go_back_to_pending() {
        assert!(!SessionState::Active.can_transition_to(SessionState::Pending));
    }

    #[test]
    fn ended_is_terminal() {
        assert!(SessionState::Ended.is_terminal());
        assert!(!SessionState::Ended.can_transition_to(SessionState::Active));
    }
}
