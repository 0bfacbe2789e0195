//! # Restart policies for supervised services.
//!
//! [`RestartPolicy`] determines whether a service is restarted after its
//! runner exits.
//!
//! - [`RestartPolicy::Never`] the runner executes once and is never restarted.
//! - [`RestartPolicy::Always`] the runner is restarted unconditionally.
//! - [`RestartPolicy::OnFailure`] the runner is restarted only if it failed
//!   (default).
//!
//! Pre-start hook failures are terminal regardless of policy; only runner
//! exits are subject to restart decisions.

/// Policy controlling whether a service runner is restarted after it exits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestartPolicy {
    /// Never restart: the runner executes once and exits permanently.
    Never,
    /// Always restart: the runner restarts after it finishes or fails.
    Always,
    /// Restart only on failure (default).
    OnFailure,
}

impl Default for RestartPolicy {
    /// Returns [`RestartPolicy::OnFailure`].
    fn default() -> Self {
        RestartPolicy::OnFailure
    }
}

impl RestartPolicy {
    /// Returns `true` when the policy permits a restart after an exit with
    /// the given outcome.
    pub fn permits(&self, failed: bool) -> bool {
        match self {
            RestartPolicy::Never => false,
            RestartPolicy::Always => true,
            RestartPolicy::OnFailure => failed,
        }
    }
}
