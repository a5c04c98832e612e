// SPDX-License-Identifier: MIT OR Apache-2.0
//! High-interaction session lifecycle: creation (with round-robin sandbox node
//! selection and tunnel key generation), lookup, and ending.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::Utc;
use rand::RngCore;
use warden_core::session::{HISession, SessionState};
use warden_error::{AsErrorCode, ErrorCode};
use warden_kv::{Bucket, Store};

const SESSION_ID_COUNTER_KEY: &str = "session_id";
const NODE_INDEX_COUNTER_KEY: &str = "node_idx";

/// Errors arising from session creation, lookup, or state transitions.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Underlying key-value store failure.
    #[error("store error: {0}")]
    Kv(#[from] warden_kv::KvError),

    /// No session exists for the given id.
    #[error("unknown session: {0}")]
    NotFound(String),

    /// No sandbox nodes are configured to host a new session.
    #[error("no sandbox nodes configured")]
    NoSandboxNodes,

    /// The requested state change is not a legal transition from the session's
    /// current state.
    #[error("cannot transition session {0} from {1:?} to {2:?}")]
    InvalidTransition(String, SessionState, SessionState),
}

impl AsErrorCode for SessionError {
    fn code(&self) -> ErrorCode {
        match self {
            SessionError::Kv(_) => ErrorCode::Fatal,
            SessionError::NotFound(_) => ErrorCode::NotFound,
            SessionError::NoSandboxNodes => ErrorCode::InvalidConfig,
            SessionError::InvalidTransition(..) => ErrorCode::InvariantViolation,
        }
    }
}

/// Creates, looks up, and ends [`HISession`]s, round-robining new sessions across
/// the configured sandbox nodes.
pub struct SessionService {
    sessions: Bucket<HISession>,
    counters: Bucket<i64>,
}

impl SessionService {
    /// Open (or create) the session buckets within `store`.
    pub fn open(store: &Store) -> Result<Self, SessionError> {
        Ok(Self {
            sessions: store.bucket("sessions")?,
            counters: store.bucket("session_counters")?,
        })
    }

    /// Create a new high-interaction session for a connection arriving at `agent_id`'s
    /// `listener_id` from `source_ip:source_port`, selecting the next sandbox node in
    /// round-robin order from `sandbox_nodes`.
    ///
    /// # Errors
    /// [`SessionError::NoSandboxNodes`] if `sandbox_nodes` is empty.
    pub fn create_session(
        &self,
        agent_id: &str,
        listener_id: &str,
        source_ip: &str,
        source_port: u16,
        sandbox_nodes: &[String],
    ) -> Result<HISession, SessionError> {
        if sandbox_nodes.is_empty() {
            return Err(SessionError::NoSandboxNodes);
        }

        let counter = self
            .counters
            .update_and_fetch(SESSION_ID_COUNTER_KEY, |cur| cur.unwrap_or(0) + 1)?;
        let id = format!("hi-{agent_id}-{counter}");

        let node_turn = self
            .counters
            .update_and_fetch(NODE_INDEX_COUNTER_KEY, |cur| cur.unwrap_or(0) + 1)?;
        let node_idx = (node_turn - 1) as usize % sandbox_nodes.len();
        let sandbox_node = sandbox_nodes[node_idx].clone();
        let sandbox_endpoint = format!("{sandbox_node}:5000");

        let mut tunnel_key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut tunnel_key);

        let session = HISession {
            id: id.clone(),
            agent_id: agent_id.to_string(),
            listener_id: listener_id.to_string(),
            source_ip: source_ip.to_string(),
            source_port,
            sandbox_node,
            sandbox_endpoint,
            tunnel_key,
            state: SessionState::Pending,
            created_at: Utc::now(),
            ended_at: None,
        };

        self.sessions.put(&id, &session)?;
        Ok(session)
    }

    /// Look up a session by id.
    pub fn get_session(&self, id: &str) -> Result<Option<HISession>, SessionError> {
        Ok(self.sessions.get(id)?)
    }

    /// Transition a session to [`SessionState::Active`], confirming the sandbox
    /// endpoint accepted the tunnel.
    ///
    /// # Errors
    /// [`SessionError::NotFound`] if `id` is unknown, [`SessionError::InvalidTransition`]
    /// if the session is already active or ended.
    pub fn activate_session(&self, id: &str) -> Result<HISession, SessionError> {
        self.transition(id, SessionState::Active, |session| {
            session.state = SessionState::Active;
        })
    }

    /// End a session, stamping `ended_at`. The record is retained, never deleted.
    ///
    /// # Errors
    /// [`SessionError::NotFound`] if `id` is unknown, [`SessionError::InvalidTransition`]
    /// if the session has already ended.
    pub fn end_session(&self, id: &str) -> Result<HISession, SessionError> {
        self.transition(id, SessionState::Ended, |session| {
            session.state = SessionState::Ended;
            session.ended_at = Some(Utc::now());
        })
    }

    fn transition(
        &self,
        id: &str,
        next: SessionState,
        apply: impl FnOnce(&mut HISession),
    ) -> Result<HISession, SessionError> {
        let mut session = self
            .sessions
            .get(id)?
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        if !session.state.can_transition_to(next) {
            return Err(SessionError::InvalidTransition(
                id.to_string(),
                session.state,
                next,
            ));
        }
        apply(&mut session);
        self.sessions.put(id, &session)?;
        Ok(session)
    }

    /// List every session not yet in a terminal state.
    pub fn list_active_sessions(&self) -> Result<Vec<HISession>, SessionError> {
        let mut active = Vec::new();
        for session in self.sessions.iter_values() {
            let session = session?;
            if !session.state.is_terminal() {
                active.push(session);
            }
        }
        Ok(active)
    }
}
