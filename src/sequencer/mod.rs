//! Lifecycle sequencing: ordered phases of concurrently-executed tasks.
//!
//! ## Files & responsibilities
//! - **task.rs**: the task contract (`setup` branching on sequence and
//!   request data, `execute` doing the work) and the [`Phase`] grouping.
//! - **plan.rs**: the phase plans for every defined sequence.
//! - **sequencer.rs**: the single-flight executor with preemption.
//! - **tasks.rs**: the lifecycle tasks (mounts, config load, controller and
//!   service startup, install/upgrade/wipe, ADV marker, reboot/poweroff,
//!   recovery, configuration apply).

mod plan;
mod sequencer;
mod task;
pub mod tasks;

pub use sequencer::Sequencer;
pub use task::{Phase, PhaseTask, TaskSetup};

use std::fmt;

/// A named lifecycle operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sequence {
    /// Normal power-on path: mounts, config, controllers, services, kubelet.
    Boot,
    /// One-shot install-to-disk when no prior installation is discovered;
    /// chains into a reboot on success.
    Initialize,
    /// Install from the installer image.
    Install,
    /// Stop workloads, write the new image preserving data, mark the ADV,
    /// reboot into the new image.
    Upgrade,
    /// Wipe ephemeral (and optionally data) partitions, then reboot.
    Reset,
    /// Stop services in reverse order, unmount, kernel reboot.
    Reboot,
    /// Stop services in reverse order, unmount, kernel power-off.
    Shutdown,
    /// Restore control-plane static manifests from a snapshot source.
    Recover,
    /// Hot-swap the machine configuration.
    ApplyConfiguration,
}

impl Sequence {
    /// Short stable label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Sequence::Boot => "boot",
            Sequence::Initialize => "initialize",
            Sequence::Install => "install",
            Sequence::Upgrade => "upgrade",
            Sequence::Reset => "reset",
            Sequence::Reboot => "reboot",
            Sequence::Shutdown => "shutdown",
            Sequence::Recover => "recover",
            Sequence::ApplyConfiguration => "apply-configuration",
        }
    }

    /// Whether this sequence cancels a running one instead of being rejected.
    pub fn preempts(&self) -> bool {
        matches!(self, Sequence::Reboot | Sequence::Shutdown | Sequence::Reset)
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runtime data accompanying a sequence invocation.
#[derive(Debug, Clone, Default)]
pub struct Request {
    /// Raw machine-config document, for `ApplyConfiguration` (and as an
    /// override for `Boot`'s config phase).
    pub config_bytes: Option<Vec<u8>>,
    /// `Reset` also wipes the data partitions.
    pub wipe_data: bool,
    /// `ApplyConfiguration` also persists the document to the config path.
    pub persist: bool,
    /// `ApplyConfiguration` reboots once the new document is published.
    pub reboot: bool,
}
