//! # The kernel seam: mounts, partition wipes, hostname, reboot.
//!
//! Sequencer tasks that must touch the kernel before the controllers start
//! go through [`Kernel`]. The Linux implementation uses direct syscalls via
//! `nix`; [`RecordingKernel`] records calls for tests and container mode,
//! where the host owns these operations.
//!
//! Error kinds follow the runtime taxonomy: a failed mount or reboot is
//! fatal, a busy unmount is transient.

use async_trait::async_trait;

use crate::error::TaskError;

/// Kernel operations used by lifecycle tasks.
#[async_trait]
pub trait Kernel: Send + Sync + 'static {
    /// Mounts `source` on `target` with the given filesystem type;
    /// an already-mounted target converges silently.
    async fn mount(&self, source: &str, target: &str, fstype: &str) -> Result<(), TaskError>;

    /// Unmounts `target`; a target that is not mounted converges silently.
    async fn unmount(&self, target: &str) -> Result<(), TaskError>;

    /// Destroys the contents of the partition with the given label.
    async fn wipe_partition(&self, label: &str) -> Result<(), TaskError>;

    /// Sets the kernel hostname.
    async fn set_hostname(&self, hostname: &str) -> Result<(), TaskError>;

    /// Reboots the machine; does not return on success.
    async fn reboot(&self) -> Result<(), TaskError>;

    /// Powers the machine off; does not return on success.
    async fn poweroff(&self) -> Result<(), TaskError>;
}

/// Records every call instead of touching the kernel.
///
/// Used by tests and by container mode, where the host manages mounts and
/// power state.
#[derive(Default)]
pub struct RecordingKernel {
    calls: std::sync::Mutex<Vec<String>>,
}

impl RecordingKernel {
    /// The recorded calls, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("call log poisoned").clone()
    }

    /// Whether any recorded call starts with `prefix`.
    pub fn saw(&self, prefix: &str) -> bool {
        self.calls().iter().any(|c| c.starts_with(prefix))
    }

    fn record(&self, call: String) {
        self.calls.lock().expect("call log poisoned").push(call);
    }
}

#[async_trait]
impl Kernel for RecordingKernel {
    async fn mount(&self, source: &str, target: &str, fstype: &str) -> Result<(), TaskError> {
        self.record(format!("mount {source} {target} {fstype}"));
        Ok(())
    }

    async fn unmount(&self, target: &str) -> Result<(), TaskError> {
        self.record(format!("unmount {target}"));
        Ok(())
    }

    async fn wipe_partition(&self, label: &str) -> Result<(), TaskError> {
        self.record(format!("wipe {label}"));
        Ok(())
    }

    async fn set_hostname(&self, hostname: &str) -> Result<(), TaskError> {
        self.record(format!("hostname {hostname}"));
        Ok(())
    }

    async fn reboot(&self) -> Result<(), TaskError> {
        self.record("reboot".to_string());
        Ok(())
    }

    async fn poweroff(&self) -> Result<(), TaskError> {
        self.record("poweroff".to_string());
        Ok(())
    }
}

#[cfg(target_os = "linux")]
pub use sys::LinuxKernel;

#[cfg(target_os = "linux")]
mod sys {
    //! Syscall-backed kernel operations.

    use async_trait::async_trait;
    use nix::mount::{mount, umount, MsFlags};
    use nix::sys::reboot::{reboot, RebootMode};
    use nix::unistd::sethostname;

    use super::Kernel;
    use crate::error::TaskError;

    /// Size of the zeroed region written over a wiped partition.
    const WIPE_LEN: usize = 1024 * 1024;

    /// Kernel operations via direct syscalls.
    #[derive(Default)]
    pub struct LinuxKernel;

    #[async_trait]
    impl Kernel for LinuxKernel {
        async fn mount(&self, source: &str, target: &str, fstype: &str) -> Result<(), TaskError> {
            let source = source.to_string();
            let target = target.to_string();
            let fstype = fstype.to_string();

            tokio::task::spawn_blocking(move || {
                std::fs::create_dir_all(&target)
                    .map_err(|e| TaskError::fatal(format!("mkdir {target}: {e}")))?;

                match mount(
                    Some(source.as_str()),
                    target.as_str(),
                    Some(fstype.as_str()),
                    MsFlags::empty(),
                    None::<&str>,
                ) {
                    Ok(()) => Ok(()),
                    Err(nix::errno::Errno::EBUSY) => Ok(()), // already mounted
                    Err(e) => Err(TaskError::fatal(format!("mount {target}: {e}"))),
                }
            })
            .await
            .map_err(|e| TaskError::fatal(e.to_string()))?
        }

        async fn unmount(&self, target: &str) -> Result<(), TaskError> {
            let target = target.to_string();

            tokio::task::spawn_blocking(move || match umount(target.as_str()) {
                Ok(()) => Ok(()),
                Err(nix::errno::Errno::EINVAL) => Ok(()), // not mounted
                Err(nix::errno::Errno::EBUSY) => {
                    Err(TaskError::transient(format!("unmount {target}: busy")))
                }
                Err(e) => Err(TaskError::fatal(format!("unmount {target}: {e}"))),
            })
            .await
            .map_err(|e| TaskError::fatal(e.to_string()))?
        }

        async fn wipe_partition(&self, label: &str) -> Result<(), TaskError> {
            use tokio::io::AsyncWriteExt;

            let device = format!("/dev/disk/by-label/{label}");

            let mut file = tokio::fs::OpenOptions::new()
                .write(true)
                .open(&device)
                .await
                .map_err(|e| TaskError::fatal(format!("open {device}: {e}")))?;

            file.write_all(&vec![0u8; WIPE_LEN])
                .await
                .map_err(|e| TaskError::fatal(format!("wipe {device}: {e}")))?;
            file.flush()
                .await
                .map_err(|e| TaskError::fatal(format!("wipe {device}: {e}")))?;

            Ok(())
        }

        async fn set_hostname(&self, hostname: &str) -> Result<(), TaskError> {
            sethostname(hostname).map_err(|e| TaskError::fatal(format!("sethostname: {e}")))
        }

        async fn reboot(&self) -> Result<(), TaskError> {
            tokio::task::spawn_blocking(|| {
                reboot(RebootMode::RB_AUTOBOOT)
                    .map(|_| ())
                    .map_err(|e| TaskError::fatal(format!("reboot: {e}")))
            })
            .await
            .map_err(|e| TaskError::fatal(e.to_string()))?
        }

        async fn poweroff(&self) -> Result<(), TaskError> {
            tokio::task::spawn_blocking(|| {
                reboot(RebootMode::RB_POWER_OFF)
                    .map(|_| ())
                    .map_err(|e| TaskError::fatal(format!("poweroff: {e}")))
            })
            .await
            .map_err(|e| TaskError::fatal(e.to_string()))?
        }
    }
}
