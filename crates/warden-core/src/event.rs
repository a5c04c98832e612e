//! Telemetry event entity emitted at lifecycle transitions (§4.15, out-of-scope Gateway payload).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The kind of lifecycle transition an [`AgentEvent`] records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A module process/container was started.
    ModuleStarted,
    /// A module process/container exited (requested or crashed).
    ModuleStopped,
    /// A module was restarted after a failed health check.
    ModuleRestarted,
    /// A listener socket was bound.
    ListenerBound,
    /// A listener socket was closed.
    ListenerClosed,
    /// A connection was handed to the forwarder.
    ConnectionForwarded,
    /// A high-interaction session was created.
    SessionCreated,
    /// A high-interaction session ended.
    SessionEnded,
    /// A catalog/assignment sync tick completed with a version bump.
    SyncCompleted,
}

/// A typed record of a single lifecycle transition, the payload the out-of-scope
/// telemetry pipeline ingests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AgentEvent {
    /// Unique event id.
    pub event_id: String,
    /// Agent that produced this event.
    pub agent_id: String,
    /// What kind of transition this is.
    pub kind: EventKind,
    /// When the transition occurred.
    pub occurred_at: DateTime<Utc>,
    /// Free-form structured attributes (module_id, listener_id, session_id, etc).
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

/// Abstracts "emit an [`AgentEvent`]" so core logic can be driven in tests without a
/// live Gateway connection.
pub trait TelemetrySink: Send + Sync {
    /// Record one event. Implementations should not block the caller on network I/O;
    /// spool-and-forward is expected for real sinks.
    fn emit(&self, event: AgentEvent);
}

/// A [`TelemetrySink`] that discards every event, used in tests and as a safe default.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn emit(&self, _event: AgentEvent) {}
}
