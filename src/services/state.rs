//! Service lifecycle states, health, and the bounded transition ring.

use std::collections::VecDeque;
use std::fmt;
use std::time::SystemTime;

/// Capacity of the per-service transition ring.
const EVENT_RING_CAP: usize = 64;

/// Lifecycle state of a supervised service.
///
/// ```text
/// Initializing → Preparing → Waiting → Running → Finished
///                                    ↘        ↘
///                                     Failed ←─┘ (on fatal)
/// Skipped (condition permanently false)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Record created; no action taken yet.
    Initializing,
    /// Pre-start hook in flight.
    Preparing,
    /// Blocked on dependencies and the optional condition.
    Waiting,
    /// Runner started; health is being polled.
    Running,
    /// Condition is permanently false; the service will never start.
    Skipped,
    /// Runner or hook failed.
    Failed,
    /// Runner exited cleanly or the service was stopped.
    Finished,
}

impl ServiceState {
    /// Short stable label.
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Initializing => "initializing",
            ServiceState::Preparing => "preparing",
            ServiceState::Waiting => "waiting",
            ServiceState::Running => "running",
            ServiceState::Skipped => "skipped",
            ServiceState::Failed => "failed",
            ServiceState::Finished => "finished",
        }
    }

    /// Whether the state is terminal for the current supervision cycle.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ServiceState::Skipped | ServiceState::Failed | ServiceState::Finished
        )
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health of a running service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    /// No probe result yet.
    Unknown,
    /// Last probes succeeded.
    Healthy,
    /// The failure threshold was crossed.
    Unhealthy,
    /// The service declares no health check.
    NotApplicable,
}

impl Health {
    /// Short stable label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Health::Unknown => "unknown",
            Health::Healthy => "healthy",
            Health::Unhealthy => "unhealthy",
            Health::NotApplicable => "not-applicable",
        }
    }

    /// Whether this health satisfies a dependency edge.
    pub fn satisfies_dependency(&self) -> bool {
        matches!(self, Health::Healthy | Health::NotApplicable)
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Combined state + health, published on the per-service watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateSnapshot {
    /// Lifecycle state.
    pub state: ServiceState,
    /// Health of the runner.
    pub health: Health,
}

impl Default for StateSnapshot {
    fn default() -> Self {
        Self {
            state: ServiceState::Initializing,
            health: Health::Unknown,
        }
    }
}

/// One recorded state transition.
#[derive(Debug, Clone)]
pub struct ServiceEvent {
    /// The state entered.
    pub state: ServiceState,
    /// Human-readable context.
    pub message: String,
    /// When the transition happened.
    pub at: SystemTime,
}

/// Bounded, append-only ring of state transitions.
#[derive(Debug, Default)]
pub(crate) struct EventRing {
    events: VecDeque<ServiceEvent>,
}

impl EventRing {
    pub(crate) fn push(&mut self, state: ServiceState, message: impl Into<String>) {
        if self.events.len() == EVENT_RING_CAP {
            self.events.pop_front();
        }

        self.events.push_back(ServiceEvent {
            state,
            message: message.into(),
            at: SystemTime::now(),
        });
    }

    /// The most recent `n` events, oldest first.
    pub(crate) fn last(&self, n: usize) -> Vec<ServiceEvent> {
        self.events
            .iter()
            .skip(self.events.len().saturating_sub(n))
            .cloned()
            .collect()
    }
}

/// Snapshot of a service returned by `info`.
#[derive(Debug, Clone)]
pub struct ServiceInfo {
    /// Service id.
    pub id: String,
    /// Current lifecycle state.
    pub state: ServiceState,
    /// Current health.
    pub health: Health,
    /// Recent transitions, oldest first.
    pub events: Vec<ServiceEvent>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_is_bounded() {
        let mut ring = EventRing::default();

        for i in 0..(EVENT_RING_CAP + 10) {
            ring.push(ServiceState::Running, format!("event {i}"));
        }

        let events = ring.last(usize::MAX);
        assert_eq!(events.len(), EVENT_RING_CAP);
        assert_eq!(events.last().unwrap().message, "event 73");
        assert_eq!(events.first().unwrap().message, "event 10");
    }
}
