//! Supervisor-owned per-module runtime state machine (§4.9).

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Lifecycle state of a single supervised module instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ModuleState {
    /// No process/container exists for this module.
    Stopped,
    /// Start has been requested; waiting for the control socket to come up.
    Starting,
    /// Control socket is up and the last health check (if any) passed.
    Running,
    /// A stop has been requested; waiting for the process/container to exit.
    Stopping,
    /// Start failed, or restarts have been exhausted after repeated health-check failures.
    Failed,
}

impl ModuleState {
    /// `true` for `Failed` and `Stopped` — states from which the supervisor takes no
    /// further automatic action without an explicit start request.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, ModuleState::Stopped | ModuleState::Failed)
    }

    /// States `self` may legally transition to.
    #[must_use]
    pub fn valid_transitions(self) -> &'static [ModuleState] {
        use ModuleState::{Failed, Running, Starting, Stopped, Stopping};
        match self {
            Stopped => &[Starting],
            Starting => &[Running, Failed],
            Running => &[Stopping, Failed],
            Stopping => &[Stopped],
            Failed => &[Starting],
        }
    }

    /// Whether `self -> next` is a legal state-machine edge.
    #[must_use]
    pub fn can_transition_to(self, next: ModuleState) -> bool {
        self.valid_transitions().contains(&next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stopped_only_goes_to_starting() {
        assert_eq!(ModuleState::Stopped.valid_transitions(), &[ModuleState::Starting]);
    }

    #[test]
    fn running_can_fail_or_stop() {
        assert!(ModuleState::Running.can_transition_to(ModuleState::Stopping));
        assert!(ModuleState::Running.can_transition_to(ModuleState::Failed));
        assert!(!ModuleState::Running.can_transition_to(ModuleState::Starting));
    }

    #[test]
    fn failed_and_stopped_are_terminal() {
        assert!(ModuleState::Failed.is_terminal());
        assert!(ModuleState::Stopped.is_terminal());
        assert!(!ModuleState::Running.is_terminal());
    }

    #[test]
    fn failed_can_restart() {
        assert!(ModuleState::Failed.can_transition_to(ModuleState::Starting));
    }
}
