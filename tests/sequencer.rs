//! Sequencer behavior: strict phase ordering, single-flight execution with
//! preemption, and the Boot/Upgrade flows against recording collaborators.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use nodevisor::adv::Adv;
use nodevisor::error::{RuntimeError, TaskError};
use nodevisor::events::EventKind;
use nodevisor::install::Installer;
use nodevisor::kernel::RecordingKernel;
use nodevisor::machine::MachineConfig;
use nodevisor::resources::{Payload, Resource, CONFIG_NAMESPACE, MACHINE_CONFIG_ID};
use nodevisor::{Request, Runtime, RuntimeBuilder, Sequence};

use common::eventually;

const INSTALL_CONFIG: &str = r#"
version: v1alpha1
machine:
  install:
    disk: /dev/sda
    image: ghcr.io/example/installer:v2
"#;

async fn publish_install_config(rt: &Runtime) {
    let cfg = MachineConfig::from_yaml(INSTALL_CONFIG.as_bytes()).unwrap();

    rt.store()
        .create(Resource::new(
            CONFIG_NAMESPACE,
            MACHINE_CONFIG_ID,
            Payload::MachineConfig(Arc::new(cfg)),
        ))
        .await
        .unwrap();
}

/// Installer whose upgrade blocks until the test releases the gate.
struct GatedInstaller {
    gate: Semaphore,
    calls: Mutex<Vec<String>>,
}

impl Default for GatedInstaller {
    fn default() -> Self {
        Self {
            gate: Semaphore::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl GatedInstaller {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Installer for GatedInstaller {
    async fn is_installed(&self) -> Result<bool, TaskError> {
        Ok(true)
    }

    async fn install(&self, disk: &str, image: &str) -> Result<(), TaskError> {
        self.calls.lock().unwrap().push(format!("install {disk} {image}"));
        Ok(())
    }

    async fn upgrade(&self, disk: &str, image: &str, preserve: bool) -> Result<(), TaskError> {
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| TaskError::Canceled)?;

        self.calls
            .lock()
            .unwrap()
            .push(format!("upgrade {disk} {image} preserve={preserve}"));
        Ok(())
    }
}

// Property 5: every task of phase k completes before phase k+1 starts.
#[tokio::test]
async fn phases_are_strictly_ordered() {
    let kernel = Arc::new(RecordingKernel::default());
    let adv_dir = tempfile::tempdir().unwrap();

    let rt = RuntimeBuilder::new()
        .with_kernel(kernel.clone())
        .with_adv_path(adv_dir.path().join("adv"))
        .build();

    publish_install_config(&rt).await;

    let mut events = rt.bus().subscribe();

    rt.run_sequence(Sequence::Upgrade, Request::default())
        .await
        .unwrap();

    // Collect the phase boundary events in publication order.
    let mut boundaries = Vec::new();
    while let Ok(ev) = events.try_recv() {
        match ev.kind {
            EventKind::PhaseStarted | EventKind::PhaseFinished => {
                boundaries.push((ev.kind, ev.phase.unwrap(), ev.seq));
            }
            _ => {}
        }
    }

    let expected = ["drain", "upgrade", "adv", "reboot"];
    assert_eq!(boundaries.len(), expected.len() * 2);

    for (i, phase) in expected.iter().enumerate() {
        let (start_kind, start_phase, start_seq) = &boundaries[i * 2];
        let (end_kind, end_phase, end_seq) = &boundaries[i * 2 + 1];

        assert_eq!(*start_kind, EventKind::PhaseStarted);
        assert_eq!(*end_kind, EventKind::PhaseFinished);
        assert_eq!(start_phase, phase);
        assert_eq!(end_phase, phase);
        assert!(start_seq < end_seq);

        if i > 0 {
            let (_, _, prev_end_seq) = &boundaries[i * 2 - 1];
            assert!(prev_end_seq < start_seq, "phase {phase} overlapped its predecessor");
        }
    }

    // The upgrade marker was recorded and the machine rebooted.
    let adv = Adv::load(&rt.adv_path()).await.unwrap();
    assert!(adv.upgrade());
    assert!(kernel.saw("reboot"));
}

// S6: Reboot preempts a running Upgrade; the upgrade reports cancellation
// and the reboot completes.
#[tokio::test]
async fn reboot_preempts_upgrade() {
    let kernel = Arc::new(RecordingKernel::default());
    let installer = Arc::new(GatedInstaller::default());
    let adv_dir = tempfile::tempdir().unwrap();
    let adv_path = adv_dir.path().join("adv");

    let rt = RuntimeBuilder::new()
        .with_kernel(kernel.clone())
        .with_installer(installer.clone())
        .with_adv_path(adv_path.clone())
        .build();

    publish_install_config(&rt).await;

    let mut events = rt.bus().subscribe();

    let upgrade = {
        let rt = Arc::clone(&rt);
        tokio::spawn(async move { rt.run_sequence(Sequence::Upgrade, Request::default()).await })
    };

    // Wait until the upgrade phase is in flight (blocked on the gate).
    loop {
        let ev = events.recv().await.unwrap();
        if ev.kind == EventKind::PhaseStarted && ev.phase.as_deref() == Some("upgrade") {
            break;
        }
    }

    let reboot = {
        let rt = Arc::clone(&rt);
        tokio::spawn(async move { rt.run_sequence(Sequence::Reboot, Request::default()).await })
    };

    // The preemption is announced before the upgrade is released: in-flight
    // tasks are awaited, not killed.
    loop {
        let ev = events.recv().await.unwrap();
        if ev.kind == EventKind::SequencePreempted {
            break;
        }
    }

    installer.gate.add_permits(1);

    let upgrade_result = upgrade.await.unwrap();
    assert!(matches!(
        upgrade_result,
        Err(RuntimeError::SequenceCanceled {
            sequence: Sequence::Upgrade
        })
    ));

    reboot.await.unwrap().unwrap();
    assert!(kernel.saw("reboot"));

    // The upgrade never reached its ADV phase.
    let adv = Adv::load(&adv_path).await.unwrap();
    assert!(!adv.upgrade());
}

// Non-preempting sequences are rejected while another one runs.
#[tokio::test]
async fn concurrent_sequences_are_rejected() {
    let installer = Arc::new(GatedInstaller::default());
    let adv_dir = tempfile::tempdir().unwrap();

    let rt = RuntimeBuilder::new()
        .with_installer(installer.clone())
        .with_adv_path(adv_dir.path().join("adv"))
        .build();

    publish_install_config(&rt).await;

    let mut events = rt.bus().subscribe();

    let upgrade = {
        let rt = Arc::clone(&rt);
        tokio::spawn(async move { rt.run_sequence(Sequence::Upgrade, Request::default()).await })
    };

    loop {
        let ev = events.recv().await.unwrap();
        if ev.kind == EventKind::PhaseStarted && ev.phase.as_deref() == Some("upgrade") {
            break;
        }
    }

    let err = rt
        .run_sequence(
            Sequence::ApplyConfiguration,
            Request {
                config_bytes: Some(b"version: v1alpha1\n".to_vec()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        RuntimeError::SequenceInProgress {
            running: Sequence::Upgrade,
            requested: Sequence::ApplyConfiguration,
        }
    ));

    installer.gate.add_permits(1);
    upgrade.await.unwrap().unwrap();

    assert_eq!(
        installer.calls(),
        vec!["upgrade /dev/sda ghcr.io/example/installer:v2 preserve=true"]
    );
}

// Boot is idempotent: a second run converges without errors, and the
// mounts are recorded once per run.
#[tokio::test]
async fn boot_converges_and_is_repeatable() {
    let kernel = Arc::new(RecordingKernel::default());

    let rt = RuntimeBuilder::new().with_kernel(kernel.clone()).build();

    rt.run_sequence(Sequence::Boot, Request::default())
        .await
        .unwrap();
    rt.run_sequence(Sequence::Boot, Request::default())
        .await
        .unwrap();

    assert!(kernel.saw("mount proc /proc"));

    rt.stop();
}

// ApplyConfiguration hot-swaps the machine config resource.
#[tokio::test]
async fn apply_configuration_swaps_the_config() {
    let rt = RuntimeBuilder::new().build();

    rt.run_sequence(
        Sequence::ApplyConfiguration,
        Request {
            config_bytes: Some(
                b"version: v1alpha1\nmachine:\n  network:\n    hostname: node-9\n".to_vec(),
            ),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    {
        let rt = Arc::clone(&rt);
        eventually("config visible", Duration::from_secs(3), move || {
            let rt = Arc::clone(&rt);
            async move {
                rt.store()
                    .get(CONFIG_NAMESPACE, Resource::MACHINE_CONFIG, MACHINE_CONFIG_ID)
                    .await
                    .map(|r| {
                        r.as_machine_config()
                            .map(|c| c.machine.network.hostname == "node-9")
                            .unwrap_or(false)
                    })
                    .unwrap_or(false)
            }
        })
        .await;
    }

    // A second apply bumps the resource version.
    rt.run_sequence(
        Sequence::ApplyConfiguration,
        Request {
            config_bytes: Some(
                b"version: v1alpha1\nmachine:\n  network:\n    hostname: node-10\n".to_vec(),
            ),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let res = rt
        .store()
        .get(CONFIG_NAMESPACE, Resource::MACHINE_CONFIG, MACHINE_CONFIG_ID)
        .await
        .unwrap();
    assert_eq!(res.meta.version, 2);
    assert_eq!(
        res.as_machine_config().unwrap().machine.network.hostname,
        "node-10"
    );
}

// ApplyConfiguration with persist + reboot writes the document to the
// config path and issues the kernel reboot after publishing it.
#[tokio::test]
async fn apply_configuration_persists_and_reboots_on_request() {
    let kernel = Arc::new(RecordingKernel::default());
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("state").join("config.yaml");

    let rt = RuntimeBuilder::new()
        .with_kernel(kernel.clone())
        .with_config_path(config_path.clone())
        .build();

    let bytes = b"version: v1alpha1\nmachine:\n  network:\n    hostname: node-11\n".to_vec();

    rt.run_sequence(
        Sequence::ApplyConfiguration,
        Request {
            config_bytes: Some(bytes.clone()),
            persist: true,
            reboot: true,
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let written = tokio::fs::read(&config_path).await.unwrap();
    assert_eq!(written, bytes);
    assert!(kernel.saw("reboot"));

    let res = rt
        .store()
        .get(CONFIG_NAMESPACE, Resource::MACHINE_CONFIG, MACHINE_CONFIG_ID)
        .await
        .unwrap();
    assert_eq!(
        res.as_machine_config().unwrap().machine.network.hostname,
        "node-11"
    );
}

// A failing task aborts the sequence with the offending phase name, and
// later phases never run.
#[tokio::test]
async fn failed_phase_skips_the_rest() {
    struct BrokenInstaller;

    #[async_trait]
    impl Installer for BrokenInstaller {
        async fn is_installed(&self) -> Result<bool, TaskError> {
            Ok(true)
        }

        async fn install(&self, _disk: &str, _image: &str) -> Result<(), TaskError> {
            Err(TaskError::fatal("short write"))
        }

        async fn upgrade(
            &self,
            _disk: &str,
            _image: &str,
            _preserve: bool,
        ) -> Result<(), TaskError> {
            Err(TaskError::fatal("short write"))
        }
    }

    let kernel = Arc::new(RecordingKernel::default());
    let adv_dir = tempfile::tempdir().unwrap();
    let adv_path = adv_dir.path().join("adv");

    let rt = RuntimeBuilder::new()
        .with_kernel(kernel.clone())
        .with_installer(Arc::new(BrokenInstaller))
        .with_adv_path(adv_path.clone())
        .build();

    publish_install_config(&rt).await;

    let err = rt
        .run_sequence(Sequence::Upgrade, Request::default())
        .await
        .unwrap_err();

    match err {
        RuntimeError::PhaseFailed {
            sequence,
            phase,
            errors,
        } => {
            assert_eq!(sequence, Sequence::Upgrade);
            assert_eq!(phase, "upgrade");
            assert_eq!(errors.len(), 1);
            assert!(errors[0].1.is_fatal());
        }
        other => panic!("unexpected error: {other}"),
    }

    // Neither the ADV marker nor the reboot happened.
    assert!(!Adv::load(&adv_path).await.unwrap().upgrade());
    assert!(!kernel.saw("reboot"));
}
