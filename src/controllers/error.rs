//! Errors produced by controllers and the controller runtime.

use thiserror::Error;

use crate::controllers::netlink::NetlinkError;
use crate::resources::StoreError;

/// # Errors returned by controller registration and reconciliation.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ControllerError {
    /// A store operation failed in a way the pass cannot absorb.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A kernel operation through the netlink seam failed.
    #[error(transparent)]
    Netlink(#[from] NetlinkError),

    /// Two controllers were registered under the same name.
    #[error("controller '{name}' is already registered")]
    DuplicateController {
        /// The duplicate name.
        name: &'static str,
    },

    /// Two controllers contend for an output type that admits one writer.
    #[error("output type '{ty}' conflict: '{first}' vs '{second}'")]
    OutputConflict {
        /// The contended type.
        ty: &'static str,
        /// The first registered writer.
        first: &'static str,
        /// The rejected writer.
        second: &'static str,
    },

    /// The controller dependency graph has a cycle.
    #[error("controller dependency cycle: {path}")]
    DependencyCycle {
        /// Human-readable cycle path (`a -> b -> a`).
        path: String,
    },

    /// The runtime was started twice.
    #[error("controller runtime is already running")]
    AlreadyRunning,
}

impl ControllerError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            ControllerError::Store(e) => e.as_label(),
            ControllerError::Netlink(_) => "controller_netlink",
            ControllerError::DuplicateController { .. } => "controller_duplicate",
            ControllerError::OutputConflict { .. } => "controller_output_conflict",
            ControllerError::DependencyCycle { .. } => "controller_dependency_cycle",
            ControllerError::AlreadyRunning => "controller_already_running",
        }
    }
}
