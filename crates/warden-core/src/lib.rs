// SPDX-License-Identifier: MIT OR Apache-2.0
//! Shared entity types for the warden fleet: catalog, assignments, satellites, pairings,
//! sessions, the wire handshake, and telemetry events.
#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod assignment;
pub mod cache;
pub mod digest;
pub mod event;
pub mod handshake;
pub mod module;
pub mod module_state;
pub mod pairing;
pub mod satellite;
pub mod session;

pub use assignment::{
    AgentModuleConfig, ConnectionMode, Deployment, ExecutionMode, ListenerAssignment,
    ModuleAssignment,
};
pub use cache::ModuleCacheEntry;
pub use event::{AgentEvent, EventKind, NullSink, TelemetrySink};
pub use handshake::ConnectionHandshake;
pub use module::{ModuleCatalog, ModuleImage, ModuleManifest, RequiredCapabilities, ResourceLimits};
pub use module_state::ModuleState;
pub use pairing::{PairingRequest, format_display_token, normalize_token};
pub use satellite::{AgentState, Satellite, SatelliteStatus};
pub use session::{HISession, SessionState};
