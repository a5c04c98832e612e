//! Restart and health-check defaults applied to every supervised module.

use std::time::Duration;

/// How the supervisor restarts a module after repeated health-check failures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RestartPolicy {
    /// Stop restarting once this many consecutive restarts have happened.
    pub max_restarts: u32,
    /// Base delay before the first restart attempt.
    pub restart_delay: Duration,
    /// Delay multiplier applied per additional restart (`restart_delay * multiplier^n`).
    pub backoff_multiplier: f64,
    /// Upper bound on the computed backoff delay.
    pub max_backoff_delay: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            restart_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            max_backoff_delay: Duration::from_secs(5 * 60),
        }
    }
}

impl RestartPolicy {
    /// The delay to wait before the `restart_count`-th restart (0-indexed), clamped to
    /// `max_backoff_delay`.
    #[must_use]
    pub fn delay_for(&self, restart_count: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(restart_count as i32);
        let millis = (self.restart_delay.as_millis() as f64 * factor) as u64;
        Duration::from_millis(millis).min(self.max_backoff_delay)
    }
}

/// How often and how aggressively the supervisor probes a running module's liveness.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthCheckConfig {
    /// Whether the health-check loop runs at all.
    pub enabled: bool,
    /// Time between health checks for a given module.
    pub interval: Duration,
    /// Deadline for a single health-check round trip.
    pub timeout: Duration,
    /// Consecutive failures tolerated before a restart is scheduled. Reserved for a
    /// future "tolerate N blips" mode; today the supervisor restarts on the first
    /// failure, matching the retry-free check in the reference agent's health loop.
    pub retries: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(5),
            retries: 3,
        }
    }
}
