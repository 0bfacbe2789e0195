//! # Error types used by the nodevisor runtime and lifecycle tasks.
//!
//! This module defines two main error enums:
//!
//! - [`RuntimeError`] errors raised by the machine runtime itself
//!   (sequencer slot, service registry, graceful shutdown).
//! - [`TaskError`] errors raised by lifecycle task and service executions.
//!
//! Both types provide `as_label` for logs. [`TaskError`] additionally
//! classifies errors by kind: `is_retryable()` and `is_fatal()`. Whether an
//! error is worth retrying is a property of the kind, never of the call site.

use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::policies::BackoffPolicy;
use crate::sequencer::Sequence;

/// # Errors produced by the machine runtime.
///
/// These represent failures in the orchestration system itself.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// A sequence was requested while another non-preemptible one was active.
    #[error("sequence {requested} rejected: {running} is already in progress")]
    SequenceInProgress {
        /// The sequence currently holding the execution slot.
        running: Sequence,
        /// The rejected sequence.
        requested: Sequence,
    },

    /// A phase of a sequence failed; the remaining phases were skipped.
    #[error("sequence {sequence} failed in phase '{phase}': {} task error(s)", errors.len())]
    PhaseFailed {
        /// The sequence that was running.
        sequence: Sequence,
        /// The phase in which the failure occurred.
        phase: String,
        /// Task name and error, one entry per failed task.
        errors: Vec<(String, TaskError)>,
    },

    /// The sequence was cancelled by a preempting request.
    #[error("sequence {sequence} cancelled")]
    SequenceCanceled {
        /// The sequence that was preempted.
        sequence: Sequence,
    },

    /// Attempted to operate on a service that is not registered.
    #[error("service '{id}' not found")]
    ServiceNotFound {
        /// The missing service id.
        id: String,
    },

    /// Attempted to load a different service under an already-registered id.
    #[error("service '{id}' is already registered")]
    ServiceAlreadyExists {
        /// The duplicate service id.
        id: String,
    },

    /// Timeout waiting for a service to reach one of the requested states.
    #[error("timed out after {timeout:?} waiting for service '{id}'")]
    WaitTimeout {
        /// The service being waited on.
        id: String,
        /// The configured wait deadline.
        timeout: Duration,
    },

    /// Shutdown grace period was exceeded; some services remained stuck.
    #[error("shutdown grace {grace:?} exceeded; stuck: {stuck:?}")]
    GraceExceeded {
        /// The configured grace duration.
        grace: Duration,
        /// Ids of services that did not stop in time.
        stuck: Vec<String>,
    },
}

impl RuntimeError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            RuntimeError::SequenceInProgress { .. } => "runtime_sequence_in_progress",
            RuntimeError::PhaseFailed { .. } => "runtime_phase_failed",
            RuntimeError::SequenceCanceled { .. } => "runtime_sequence_canceled",
            RuntimeError::ServiceNotFound { .. } => "runtime_service_not_found",
            RuntimeError::ServiceAlreadyExists { .. } => "runtime_service_already_exists",
            RuntimeError::WaitTimeout { .. } => "runtime_wait_timeout",
            RuntimeError::GraceExceeded { .. } => "runtime_grace_exceeded",
        }
    }
}

/// # Errors produced by lifecycle tasks and service hooks.
///
/// The kind encodes the handling policy:
/// - [`TaskError::Transient`] is safe to retry with capped backoff;
/// - [`TaskError::Config`] and [`TaskError::Fatal`] abort the sequence;
/// - [`TaskError::Canceled`] signals cooperative preemption, not failure.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum TaskError {
    /// Recoverable I/O failure (netlink EBUSY, HTTP 5xx from metadata, ...).
    #[error("transient: {reason}")]
    Transient {
        /// Human-readable cause.
        reason: String,
    },

    /// Invalid user input (bad YAML, unknown bond mode, blacklisted etcd arg).
    ///
    /// Fatal within the task; the sequence aborts.
    #[error("configuration: {reason}")]
    Config {
        /// Human-readable cause.
        reason: String,
    },

    /// Non-recoverable failure (mount syscall error, installer failure).
    #[error("fatal (no retry): {reason}")]
    Fatal {
        /// Human-readable cause.
        reason: String,
    },

    /// Task was cancelled by sequence preemption or runtime shutdown.
    ///
    /// This is **not an error** in the traditional sense; it signals
    /// intentional termination at the next suspension point.
    #[error("context canceled")]
    Canceled,
}

impl TaskError {
    /// Recoverable I/O failure with the given cause.
    pub fn transient(reason: impl Into<String>) -> Self {
        TaskError::Transient {
            reason: reason.into(),
        }
    }

    /// Configuration failure with the given cause.
    pub fn config(reason: impl Into<String>) -> Self {
        TaskError::Config {
            reason: reason.into(),
        }
    }

    /// Non-recoverable failure with the given cause.
    pub fn fatal(reason: impl Into<String>) -> Self {
        TaskError::Fatal {
            reason: reason.into(),
        }
    }

    /// Returns a short stable label.
    pub fn as_label(&self) -> &'static str {
        match self {
            TaskError::Transient { .. } => "task_transient",
            TaskError::Config { .. } => "task_config",
            TaskError::Fatal { .. } => "task_fatal",
            TaskError::Canceled => "task_canceled",
        }
    }

    /// Indicates whether the error kind is safe to retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskError::Transient { .. })
    }

    /// Indicates whether the error aborts the enclosing sequence.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TaskError::Fatal { .. } | TaskError::Config { .. })
    }
}

impl From<std::io::Error> for TaskError {
    fn from(e: std::io::Error) -> Self {
        TaskError::Transient {
            reason: e.to_string(),
        }
    }
}

/// Retries `f` while it returns a retryable [`TaskError`], sleeping per
/// `backoff` between attempts, up to `attempts` total tries.
///
/// Non-retryable errors and cancellation are returned immediately.
pub async fn retry_transient<T, F, Fut>(
    backoff: BackoffPolicy,
    attempts: u32,
    token: &CancellationToken,
    mut f: F,
) -> Result<T, TaskError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, TaskError>>,
{
    let mut prev = None;
    let mut attempt = 0u32;

    loop {
        if token.is_cancelled() {
            return Err(TaskError::Canceled);
        }

        attempt += 1;

        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt < attempts => {
                let delay = backoff.next(prev);
                prev = Some(delay);

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = token.cancelled() => return Err(TaskError::Canceled),
                }
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_classify() {
        assert!(TaskError::transient("EBUSY").is_retryable());
        assert!(!TaskError::transient("EBUSY").is_fatal());
        assert!(TaskError::fatal("mount failed").is_fatal());
        assert!(TaskError::config("unknown bond mode").is_fatal());
        assert!(!TaskError::Canceled.is_fatal());
        assert!(!TaskError::Canceled.is_retryable());
    }

    #[tokio::test]
    async fn retry_stops_on_fatal() {
        let token = CancellationToken::new();
        let mut calls = 0u32;

        let res: Result<(), _> = retry_transient(BackoffPolicy::default(), 5, &token, || {
            calls += 1;
            async move { Err(TaskError::fatal("boom")) }
        })
        .await;

        assert!(matches!(res, Err(TaskError::Fatal { .. })));
        assert_eq!(calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_exhausts_transient() {
        let token = CancellationToken::new();
        let mut calls = 0u32;

        let res: Result<(), _> = retry_transient(BackoffPolicy::default(), 3, &token, || {
            calls += 1;
            async move { Err(TaskError::transient("EBUSY")) }
        })
        .await;

        assert!(matches!(res, Err(TaskError::Transient { .. })));
        assert_eq!(calls, 3);
    }
}
