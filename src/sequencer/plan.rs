//! Phase plans for every defined sequence.

use crate::sequencer::{tasks, Phase, Request, Sequence};

/// Returns the ordered phases of `sequence`.
pub(crate) fn phases(sequence: Sequence, _request: &Request) -> Vec<Phase> {
    match sequence {
        Sequence::Boot => vec![
            Phase::new("mounts", vec![tasks::mount_pseudo_filesystems]),
            Phase::new("config", vec![tasks::load_machine_config]),
            Phase::new("controllers", vec![tasks::start_controllers]),
            Phase::new("services", vec![tasks::start_system_services]),
            Phase::new("wait-services", vec![tasks::wait_for_container_runtime]),
            Phase::new("kubelet", vec![tasks::start_kubelet]),
        ],

        Sequence::Initialize => vec![
            Phase::new("install", vec![tasks::install_if_missing]),
            Phase::new("reboot", vec![tasks::reboot_if_pending]),
        ],

        Sequence::Install => vec![Phase::new("install", vec![tasks::install])],

        Sequence::Upgrade => vec![
            Phase::new("drain", vec![tasks::stop_workload_services]),
            Phase::new("upgrade", vec![tasks::upgrade_install]),
            Phase::new("adv", vec![tasks::set_upgrade_marker]),
            Phase::new("reboot", vec![tasks::reboot]),
        ],

        Sequence::Reset => vec![
            Phase::new("stop-services", vec![tasks::stop_all_services]),
            Phase::new("wipe", vec![tasks::wipe_partitions]),
            Phase::new("reboot", vec![tasks::reboot]),
        ],

        Sequence::Reboot => vec![
            Phase::new("stop-services", vec![tasks::stop_all_services]),
            Phase::new("unmount", vec![tasks::unmount_filesystems]),
            Phase::new("reboot", vec![tasks::reboot]),
        ],

        Sequence::Shutdown => vec![
            Phase::new("stop-services", vec![tasks::stop_all_services]),
            Phase::new("unmount", vec![tasks::unmount_filesystems]),
            Phase::new("poweroff", vec![tasks::poweroff]),
        ],

        Sequence::Recover => vec![Phase::new("recover", vec![tasks::recover_manifests])],

        Sequence::ApplyConfiguration => vec![
            Phase::new("config", vec![tasks::apply_machine_config]),
            Phase::new("persist", vec![tasks::persist_machine_config]),
            Phase::new("reboot", vec![tasks::reboot_if_requested]),
        ],
    }
}
