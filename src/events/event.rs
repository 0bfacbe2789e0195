//! # Runtime events emitted by the supervisor, sequencer, and controllers.
//!
//! The [`EventKind`] enum classifies event types across four categories:
//! - **Shutdown events**: runtime-wide termination flow
//! - **Service events**: per-service state and health transitions
//! - **Sequence events**: lifecycle sequence and phase progress
//! - **Controller events**: reconciliation loop restarts
//!
//! ## Ordering guarantees
//! Each event has a globally unique sequence number (`seq`) that increases
//! monotonically, so events can be ordered correctly even when delivered
//! out-of-order through async channels.

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{Duration, SystemTime};

/// Global sequence counter for event ordering.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Classification of runtime events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    // === Shutdown events ===
    /// Shutdown requested (OS signal or Shutdown sequence).
    ShutdownRequested,
    /// All services stopped within the configured grace period.
    AllStoppedWithin,
    /// Grace period exceeded; some services did not stop in time.
    GraceExceeded,

    // === Service events ===
    /// Service registered with the supervisor.
    ServiceLoaded,
    /// Service moved to a new lifecycle state.
    ServiceStateChanged,
    /// Service health flipped (healthy <-> unhealthy).
    ServiceHealthChanged,
    /// Service runner exited and a restart was scheduled after backoff.
    ServiceRestartScheduled,

    // === Sequence events ===
    /// A lifecycle sequence started executing.
    SequenceStarted,
    /// A lifecycle sequence completed successfully.
    SequenceFinished,
    /// A lifecycle sequence failed (one of its phases failed).
    SequenceFailed,
    /// A running sequence was cancelled by a preempting request.
    SequencePreempted,
    /// A phase of the active sequence started.
    PhaseStarted,
    /// A phase of the active sequence completed successfully.
    PhaseFinished,
    /// A phase of the active sequence failed; later phases are skipped.
    PhaseFailed,
    /// An individual task within a phase failed.
    TaskFailed,

    // === Controller events ===
    /// A reconciliation controller returned an error and will be restarted.
    ControllerRestarted,
}

/// Runtime event with optional metadata.
///
/// ## Fields
/// - `seq`: Unique sequence number for ordering (monotonically increasing)
/// - `at`: Wall-clock timestamp (may go backwards due to NTP, use for logging only)
/// - `kind`: Event classification
/// - `subject`, `sequence`, `phase`, `state`, `error`, `delay`: optional metadata
#[derive(Debug, Clone)]
pub struct Event {
    /// Globally unique, monotonically increasing sequence number.
    pub seq: u64,
    /// Wall-clock timestamp.
    pub at: SystemTime,
    /// The kind of event.
    pub kind: EventKind,
    /// Service, task, or controller name the event refers to.
    pub subject: Option<String>,
    /// Sequence name, for sequence and phase events.
    pub sequence: Option<String>,
    /// Phase name, for phase and task events.
    pub phase: Option<String>,
    /// New state label, for service transitions.
    pub state: Option<String>,
    /// Error message, if the event represents a failure.
    pub error: Option<String>,
    /// Backoff delay before restart (if relevant).
    pub delay: Option<Duration>,
}

impl Event {
    /// Creates a new event of the given kind with the current timestamp and
    /// next sequence number.
    pub fn now(kind: EventKind) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            at: SystemTime::now(),
            kind,
            subject: None,
            sequence: None,
            phase: None,
            state: None,
            error: None,
            delay: None,
        }
    }

    /// Attaches a subject (service/task/controller name).
    pub fn with_subject(mut self, name: impl Into<String>) -> Self {
        self.subject = Some(name.into());
        self
    }

    /// Attaches a sequence name.
    pub fn with_sequence(mut self, name: impl Into<String>) -> Self {
        self.sequence = Some(name.into());
        self
    }

    /// Attaches a phase name.
    pub fn with_phase(mut self, name: impl Into<String>) -> Self {
        self.phase = Some(name.into());
        self
    }

    /// Attaches a state label.
    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    /// Attaches an error message.
    pub fn with_error(mut self, msg: impl Into<String>) -> Self {
        self.error = Some(msg.into());
        self
    }

    /// Attaches a backoff delay.
    pub fn with_delay(mut self, d: Duration) -> Self {
        self.delay = Some(d);
        self
    }
}
