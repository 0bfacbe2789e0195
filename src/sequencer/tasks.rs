//! # Lifecycle tasks.
//!
//! Every task is a `(setup, execute)` pair: `setup` branches on the sequence
//! and request data (returning `None` skips the task), `execute` performs the
//! work through the runtime's collaborator seams. Tasks are idempotent: a
//! re-run within the same sequence converges to the same state.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::adv::Adv;
use crate::error::TaskError;
use crate::machine::MachineConfig;
use crate::resources::{Payload, Resource, CONFIG_NAMESPACE, MACHINE_CONFIG_ID};
use crate::runtime::Runtime;
use crate::sequencer::{PhaseTask, Request, Sequence};
use crate::services::ServiceState;

/// Pseudo filesystems mounted in the `mounts` phase, in order.
const PSEUDO_FILESYSTEMS: &[(&str, &str, &str)] = &[
    ("devtmpfs", "/dev", "devtmpfs"),
    ("proc", "/proc", "proc"),
    ("sysfs", "/sys", "sysfs"),
    ("tmpfs", "/run", "tmpfs"),
    ("tmpfs", "/tmp", "tmpfs"),
];

/// Partition label wiped on every reset.
const EPHEMERAL_LABEL: &str = "EPHEMERAL";

/// Partition label wiped only when the reset requests a data wipe.
const STATE_LABEL: &str = "STATE";

/// Id of the workload service stopped before an upgrade.
const KUBELET_ID: &str = "kubelet";

/// Id of the container runtime service gating the kubelet start.
const CONTAINERD_ID: &str = "containerd";

/// How long boot waits for the container runtime before giving up.
const CONTAINER_RUNTIME_WAIT: Duration = Duration::from_secs(120);

/// Mounts the pseudo filesystems the rest of the boot depends on.
pub fn mount_pseudo_filesystems(_seq: Sequence, _req: &Request) -> Option<PhaseTask> {
    Some(PhaseTask::new("mount-pseudo-filesystems", |_token, rt| async move {
        for (source, target, fstype) in PSEUDO_FILESYSTEMS {
            rt.kernel().mount(source, target, fstype).await?;
        }

        Ok(())
    }))
}

/// Loads the machine configuration from the request override or the platform
/// and publishes it into the store. Booting without a configuration is fine;
/// the controllers converge once one arrives.
pub fn load_machine_config(_seq: Sequence, req: &Request) -> Option<PhaseTask> {
    let override_bytes = req.config_bytes.clone();

    Some(PhaseTask::new("load-machine-config", move |_token, rt| {
        let override_bytes = override_bytes.clone();

        async move {
            let bytes = match override_bytes {
                Some(bytes) => Some(bytes),
                None => rt.platform().configuration().await?,
            };

            let Some(bytes) = bytes else {
                debug!("no machine configuration available, continuing unconfigured");
                return Ok(());
            };

            publish_config(&rt, &bytes).await
        }
    }))
}

/// Applies a new machine configuration pushed by the operator.
pub fn apply_machine_config(_seq: Sequence, req: &Request) -> Option<PhaseTask> {
    let bytes = req.config_bytes.clone()?;

    Some(PhaseTask::new("apply-machine-config", move |_token, rt| {
        let bytes = bytes.clone();

        async move { publish_config(&rt, &bytes).await }
    }))
}

/// Persists the applied machine configuration to the config path, so the
/// document survives the next boot.
pub fn persist_machine_config(_seq: Sequence, req: &Request) -> Option<PhaseTask> {
    if !req.persist {
        return None;
    }

    let bytes = req.config_bytes.clone()?;

    Some(PhaseTask::new("persist-machine-config", move |_token, rt| {
        let bytes = bytes.clone();

        async move {
            let path = rt.config_path();

            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| TaskError::fatal(format!("creating {parent:?}: {e}")))?;
            }

            tokio::fs::write(&path, &bytes)
                .await
                .map_err(|e| TaskError::fatal(format!("writing {path:?}: {e}")))?;

            info!(path = ?path, "machine configuration persisted");
            Ok(())
        }
    }))
}

/// Issues the kernel reboot when the apply request asked for one.
pub fn reboot_if_requested(seq: Sequence, req: &Request) -> Option<PhaseTask> {
    if !req.reboot {
        return None;
    }

    reboot(seq, req)
}

async fn publish_config(rt: &Runtime, bytes: &[u8]) -> Result<(), TaskError> {
    let cfg = MachineConfig::from_yaml(bytes)?;
    cfg.validate()?;

    rt.store()
        .upsert_owned(
            CONFIG_NAMESPACE,
            MACHINE_CONFIG_ID,
            Payload::MachineConfig(Arc::new(cfg)),
            "",
        )
        .await
        .map_err(|e| TaskError::fatal(e.to_string()))?;

    info!("machine configuration published");
    Ok(())
}

/// Starts the controller runtime; idempotent across sequences.
pub fn start_controllers(_seq: Sequence, _req: &Request) -> Option<PhaseTask> {
    Some(PhaseTask::new("start-controllers", |_token, rt| async move {
        if rt.start_controllers()? {
            info!("controller runtime started");
        }

        Ok(())
    }))
}

/// Loads the service catalog and starts everything except the kubelet.
pub fn start_system_services(_seq: Sequence, _req: &Request) -> Option<PhaseTask> {
    Some(PhaseTask::new("start-system-services", |_token, rt| async move {
        let mut ids = Vec::new();

        for svc in rt.catalog() {
            let id = svc.id().to_string();
            rt.services()
                .load(svc)
                .map_err(|e| TaskError::fatal(e.to_string()))?;

            if id != KUBELET_ID {
                ids.push(id);
            }
        }

        let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        rt.services()
            .start(&rt, &refs)
            .await
            .map_err(|e| TaskError::fatal(e.to_string()))
    }))
}

/// Boot gate: blocks phase progress until the container runtime reports
/// running, so the kubelet never races its socket.
pub fn wait_for_container_runtime(_seq: Sequence, _req: &Request) -> Option<PhaseTask> {
    Some(PhaseTask::new("wait-for-container-runtime", |_token, rt| async move {
        if rt.services().info(CONTAINERD_ID).is_err() {
            debug!("no container runtime in the service catalog");
            return Ok(());
        }

        wait_for_service(&rt, CONTAINERD_ID, CONTAINER_RUNTIME_WAIT).await
    }))
}

/// Starts the kubelet once the system services are up.
pub fn start_kubelet(_seq: Sequence, _req: &Request) -> Option<PhaseTask> {
    Some(PhaseTask::new("start-kubelet", |_token, rt| async move {
        match rt.services().start(&rt, &[KUBELET_ID]).await {
            Ok(()) => Ok(()),
            // A node without a kubelet in its catalog boots headless.
            Err(crate::error::RuntimeError::ServiceNotFound { .. }) => {
                debug!("no kubelet in the service catalog");
                Ok(())
            }
            Err(e) => Err(TaskError::fatal(e.to_string())),
        }
    }))
}

/// Installs to disk when no prior installation is discovered; flags the
/// chained reboot on success.
pub fn install_if_missing(_seq: Sequence, _req: &Request) -> Option<PhaseTask> {
    Some(PhaseTask::new("install-if-missing", |_token, rt| async move {
        if rt.installer().is_installed().await? {
            debug!("installation present, nothing to do");
            return Ok(());
        }

        let (disk, image) = install_target(&rt).await?;
        rt.installer().install(&disk, &image).await?;
        rt.set_pending_reboot();

        info!(disk = %disk, image = %image, "installed to disk");
        Ok(())
    }))
}

/// Installs from the installer image unconditionally.
pub fn install(_seq: Sequence, _req: &Request) -> Option<PhaseTask> {
    Some(PhaseTask::new("install", |_token, rt| async move {
        let (disk, image) = install_target(&rt).await?;
        rt.installer().install(&disk, &image).await?;

        info!(disk = %disk, image = %image, "installed to disk");
        Ok(())
    }))
}

/// Writes the new image, preserving the data partitions.
pub fn upgrade_install(_seq: Sequence, _req: &Request) -> Option<PhaseTask> {
    Some(PhaseTask::new("upgrade", |_token, rt| async move {
        let (disk, image) = install_target(&rt).await?;
        rt.installer().upgrade(&disk, &image, true).await?;

        info!(disk = %disk, image = %image, "upgrade image written");
        Ok(())
    }))
}

async fn install_target(rt: &Runtime) -> Result<(String, String), TaskError> {
    let res = rt
        .store()
        .get(CONFIG_NAMESPACE, Resource::MACHINE_CONFIG, MACHINE_CONFIG_ID)
        .await
        .map_err(|_| TaskError::config("no machine configuration for install"))?;

    let cfg = res
        .as_machine_config()
        .ok_or_else(|| TaskError::config("no machine configuration for install"))?;

    let install = &cfg.machine.install;
    if install.disk.is_empty() || install.image.is_empty() {
        return Err(TaskError::config(
            "machine.install requires both disk and image",
        ));
    }

    Ok((install.disk.clone(), install.image.clone()))
}

/// Records the upgrade marker in the bootloader ADV area.
pub fn set_upgrade_marker(_seq: Sequence, _req: &Request) -> Option<PhaseTask> {
    Some(PhaseTask::new("set-upgrade-marker", |_token, rt| async move {
        let path = rt.adv_path();

        let mut adv = Adv::load(&path).await?;
        adv.set_upgrade(true);
        adv.save(&path).await?;

        Ok(())
    }))
}

/// Stops the workload services ahead of an upgrade.
pub fn stop_workload_services(_seq: Sequence, _req: &Request) -> Option<PhaseTask> {
    Some(PhaseTask::new("stop-workload-services", |_token, rt| async move {
        match rt.services().stop(&[KUBELET_ID]).await {
            Ok(()) => Ok(()),
            Err(crate::error::RuntimeError::ServiceNotFound { .. }) => Ok(()),
            Err(e) => Err(TaskError::fatal(e.to_string())),
        }
    }))
}

/// Stops every service in reverse dependency order.
pub fn stop_all_services(_seq: Sequence, _req: &Request) -> Option<PhaseTask> {
    Some(PhaseTask::new("stop-all-services", |_token, rt| async move {
        rt.services()
            .shutdown(&rt)
            .await
            .map_err(|e| TaskError::fatal(e.to_string()))
    }))
}

/// Wipes the ephemeral (and optionally data) partitions.
pub fn wipe_partitions(_seq: Sequence, req: &Request) -> Option<PhaseTask> {
    let wipe_data = req.wipe_data;

    Some(PhaseTask::new("wipe-partitions", move |_token, rt| async move {
        rt.kernel().wipe_partition(EPHEMERAL_LABEL).await?;

        if wipe_data {
            rt.kernel().wipe_partition(STATE_LABEL).await?;
        }

        Ok(())
    }))
}

/// Unmounts the pseudo filesystems, newest first.
pub fn unmount_filesystems(_seq: Sequence, _req: &Request) -> Option<PhaseTask> {
    Some(PhaseTask::new("unmount-filesystems", |_token, rt| async move {
        for (_, target, _) in PSEUDO_FILESYSTEMS.iter().rev() {
            rt.kernel().unmount(target).await?;
        }

        Ok(())
    }))
}

/// Issues the kernel reboot.
pub fn reboot(_seq: Sequence, _req: &Request) -> Option<PhaseTask> {
    Some(PhaseTask::new("reboot", |_token, rt| async move {
        rt.kernel().reboot().await
    }))
}

/// Issues the kernel reboot only when an earlier task requested one.
pub fn reboot_if_pending(_seq: Sequence, _req: &Request) -> Option<PhaseTask> {
    Some(PhaseTask::new("reboot-if-pending", |_token, rt| async move {
        if rt.take_pending_reboot() {
            rt.kernel().reboot().await
        } else {
            Ok(())
        }
    }))
}

/// Issues the kernel power-off.
pub fn poweroff(_seq: Sequence, _req: &Request) -> Option<PhaseTask> {
    Some(PhaseTask::new("poweroff", |_token, rt| async move {
        rt.kernel().poweroff().await
    }))
}

/// Restores control-plane static manifests from the snapshot source.
pub fn recover_manifests(_seq: Sequence, _req: &Request) -> Option<PhaseTask> {
    Some(PhaseTask::new("recover-manifests", |_token, rt| async move {
        let source = rt
            .recovery()
            .ok_or_else(|| TaskError::config("no recovery source configured"))?;

        let manifests = source.fetch_manifests().await?;
        let dir = rt.manifests_dir();

        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| TaskError::fatal(format!("creating {dir:?}: {e}")))?;

        for manifest in &manifests {
            let path = dir.join(&manifest.name);
            tokio::fs::write(&path, &manifest.content)
                .await
                .map_err(|e| TaskError::fatal(format!("writing {path:?}: {e}")))?;
        }

        info!(count = manifests.len(), "static manifests restored");
        Ok(())
    }))
}

/// Blocks until the named service reports running; used by callers that need
/// a service health gate between phases.
pub async fn wait_for_service(
    rt: &Runtime,
    id: &str,
    timeout: std::time::Duration,
) -> Result<(), TaskError> {
    rt.services()
        .wait(id, &[ServiceState::Running], timeout)
        .await
        .map(|_| ())
        .map_err(|e| TaskError::fatal(e.to_string()))
}
