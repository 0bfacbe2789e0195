//! # Global runtime configuration.
//!
//! Provides [`Config`] centralized settings for the machine runtime.
//!
//! Config is used in three ways:
//! 1. **Supervisor**: stop grace, shutdown grace, health probe defaults.
//! 2. **Service defaults**: restart policy and backoff inherited by services
//!    that do not override them.
//! 3. **Controller runtime**: restart backoff for failing controllers and
//!    the event bus capacity.

use std::time::Duration;

use crate::policies::{BackoffPolicy, RestartPolicy};

/// Health probe settings for a supervised service.
///
/// A probe failure never stops a service; crossing `failure_threshold`
/// consecutive failures only flips the health field and emits an event.
#[derive(Clone, Copy, Debug)]
pub struct HealthSettings {
    /// Delay before the first probe after the runner starts.
    pub initial_delay: Duration,
    /// Interval between probes.
    pub period: Duration,
    /// Per-probe deadline; an overrunning probe counts as a failure.
    pub timeout: Duration,
    /// Consecutive failures required to flip health to unhealthy.
    pub failure_threshold: u32,
}

impl Default for HealthSettings {
    /// Probe every 5 s with a 5 s deadline; 10 consecutive failures flip
    /// health to unhealthy, a single success flips it back.
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            period: Duration::from_secs(5),
            timeout: Duration::from_secs(5),
            failure_threshold: 10,
        }
    }
}

/// Global configuration for the machine runtime.
#[derive(Clone, Debug)]
pub struct Config {
    /// Maximum time to wait for services to stop during shutdown before the
    /// runtime reports [`RuntimeError::GraceExceeded`](crate::error::RuntimeError::GraceExceeded).
    pub grace: Duration,

    /// Per-service graceful-stop deadline: after a stop is requested, the
    /// runner is force-aborted once this elapses.
    pub stop_grace: Duration,

    /// Default restart policy for services.
    pub restart: RestartPolicy,

    /// Default restart backoff for services (100 ms doubling to 60 s).
    pub backoff: BackoffPolicy,

    /// A runner that stays up at least this long resets the restart backoff.
    pub backoff_reset_after: Duration,

    /// Restart backoff for failed reconciliation controllers.
    pub controller_backoff: BackoffPolicy,

    /// Default health probe settings.
    pub health: HealthSettings,

    /// Capacity of the event bus broadcast channel ring buffer.
    pub bus_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(60),
            stop_grace: Duration::from_secs(30),
            restart: RestartPolicy::default(),
            backoff: BackoffPolicy::default(),
            backoff_reset_after: Duration::from_secs(60),
            controller_backoff: BackoffPolicy::controller(),
            health: HealthSettings::default(),
            bus_capacity: 1024,
        }
    }
}
