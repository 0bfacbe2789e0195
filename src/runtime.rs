//! # Runtime: the explicit owner of all machine state.
//!
//! [`Runtime`] threads the subsystems through tasks, services, and
//! controllers: there are no process globals beyond the one value built
//! here. It owns:
//!
//! - the resource [`Store`] and the event [`Bus`];
//! - the service [`Supervisor`] and the [`Sequencer`] (each the single owner
//!   of its subsystem);
//! - the collaborator seams: [`Platform`], [`Kernel`], [`Installer`],
//!   [`Netlink`], [`RecoverySource`];
//! - the controller runtime, started once by the Boot sequence.
//!
//! Construction goes through [`RuntimeBuilder`]; the defaults are the
//! in-memory collaborator implementations, so an embedder opts into the
//! syscall-backed ones explicitly.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::controllers::{
    AddressConfigController, AddressSpecController, ControllerError, ControllerRuntime,
    HostnameConfigController, InMemoryNetlink, LinkConfigController, LinkSpecController, Netlink,
    ResolverConfigController, RouteConfigController, RouteSpecController,
};
use crate::error::{RuntimeError, TaskError};
use crate::events::Bus;
use crate::install::{Installer, RecordingInstaller, RecoverySource};
use crate::kernel::{Kernel, RecordingKernel};
use crate::machine::{parse_cmdline_network, sys_interfaces, Cmdline};
use crate::platform::Platform;
use crate::resources::Store;
use crate::sequencer::{Request, Sequence, Sequencer};
use crate::services::{Service, Supervisor};

/// Default location of the bootloader ADV block.
const DEFAULT_ADV_PATH: &str = "/boot/syslinux/adv";

/// Default location of the control-plane static manifests.
const DEFAULT_MANIFESTS_DIR: &str = "/etc/kubernetes/manifests";

/// Default location of the persisted machine configuration.
const DEFAULT_CONFIG_PATH: &str = "/system/state/config.yaml";

/// Builder for a [`Runtime`].
pub struct RuntimeBuilder {
    cfg: Config,
    cmdline: Cmdline,
    platform: Option<Arc<dyn Platform>>,
    kernel: Arc<dyn Kernel>,
    installer: Arc<dyn Installer>,
    netlink: Arc<dyn Netlink>,
    recovery: Option<Arc<dyn RecoverySource>>,
    catalog: Vec<Arc<dyn Service>>,
    adv_path: PathBuf,
    manifests_dir: PathBuf,
    config_path: PathBuf,
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeBuilder {
    /// Starts from defaults: in-memory collaborators, empty cmdline, the
    /// platform selected from the cmdline at build time.
    pub fn new() -> Self {
        Self {
            cfg: Config::default(),
            cmdline: Cmdline::default(),
            platform: None,
            kernel: Arc::new(RecordingKernel::default()),
            installer: Arc::new(RecordingInstaller::default()),
            netlink: Arc::new(InMemoryNetlink::default()),
            recovery: None,
            catalog: Vec::new(),
            adv_path: PathBuf::from(DEFAULT_ADV_PATH),
            manifests_dir: PathBuf::from(DEFAULT_MANIFESTS_DIR),
            config_path: PathBuf::from(DEFAULT_CONFIG_PATH),
        }
    }

    /// Sets the runtime configuration.
    pub fn with_config(mut self, cfg: Config) -> Self {
        self.cfg = cfg;
        self
    }

    /// Sets the kernel command line.
    pub fn with_cmdline(mut self, cmdline: Cmdline) -> Self {
        self.cmdline = cmdline;
        self
    }

    /// Overrides the platform adapter (default: selected from the cmdline).
    pub fn with_platform(mut self, platform: Arc<dyn Platform>) -> Self {
        self.platform = Some(platform);
        self
    }

    /// Sets the kernel seam.
    pub fn with_kernel(mut self, kernel: Arc<dyn Kernel>) -> Self {
        self.kernel = kernel;
        self
    }

    /// Sets the installer seam.
    pub fn with_installer(mut self, installer: Arc<dyn Installer>) -> Self {
        self.installer = installer;
        self
    }

    /// Sets the netlink seam used by the applier controllers.
    pub fn with_netlink(mut self, netlink: Arc<dyn Netlink>) -> Self {
        self.netlink = netlink;
        self
    }

    /// Sets the recovery source for the Recover sequence.
    pub fn with_recovery(mut self, recovery: Arc<dyn RecoverySource>) -> Self {
        self.recovery = Some(recovery);
        self
    }

    /// Adds a service to the catalog started by the Boot sequence.
    pub fn with_service(mut self, service: Arc<dyn Service>) -> Self {
        self.catalog.push(service);
        self
    }

    /// Overrides the ADV block location.
    pub fn with_adv_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.adv_path = path.into();
        self
    }

    /// Overrides the static manifests directory.
    pub fn with_manifests_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.manifests_dir = dir.into();
        self
    }

    /// Overrides the persisted machine-config location.
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = path.into();
        self
    }

    /// Builds the runtime.
    pub fn build(self) -> Arc<Runtime> {
        let root = CancellationToken::new();
        let bus = Bus::new(self.cfg.bus_capacity);
        let store = Store::default();

        let platform = self
            .platform
            .unwrap_or_else(|| crate::platform::select(&self.cmdline));

        let services = Supervisor::new(self.cfg.clone(), bus.clone(), root.clone());
        let sequencer = Sequencer::new(bus.clone());

        Arc::new(Runtime {
            cfg: self.cfg,
            bus,
            store,
            services,
            sequencer,
            platform,
            kernel: self.kernel,
            installer: self.installer,
            netlink: self.netlink,
            recovery: self.recovery,
            cmdline: self.cmdline,
            catalog: self.catalog,
            controllers: Mutex::new(None),
            pending_reboot: AtomicBool::new(false),
            adv_path: self.adv_path,
            manifests_dir: self.manifests_dir,
            config_path: self.config_path,
            root,
        })
    }
}

/// The machine runtime.
pub struct Runtime {
    cfg: Config,
    bus: Bus,
    store: Store,
    services: Supervisor,
    sequencer: Sequencer,
    platform: Arc<dyn Platform>,
    kernel: Arc<dyn Kernel>,
    installer: Arc<dyn Installer>,
    netlink: Arc<dyn Netlink>,
    recovery: Option<Arc<dyn RecoverySource>>,
    cmdline: Cmdline,
    catalog: Vec<Arc<dyn Service>>,
    controllers: Mutex<Option<JoinHandle<Result<(), ControllerError>>>>,
    pending_reboot: AtomicBool,
    adv_path: PathBuf,
    manifests_dir: PathBuf,
    config_path: PathBuf,
    root: CancellationToken,
}

impl Runtime {
    /// The runtime configuration.
    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// The shared event bus.
    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// The resource store.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// The service supervisor.
    pub fn services(&self) -> &Supervisor {
        &self.services
    }

    /// The sequence executor.
    pub fn sequencer(&self) -> &Sequencer {
        &self.sequencer
    }

    /// The platform adapter.
    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    /// The kernel seam.
    pub fn kernel(&self) -> &Arc<dyn Kernel> {
        &self.kernel
    }

    /// The installer seam.
    pub fn installer(&self) -> &Arc<dyn Installer> {
        &self.installer
    }

    /// The netlink seam.
    pub fn netlink(&self) -> &Arc<dyn Netlink> {
        &self.netlink
    }

    /// The recovery source, when configured.
    pub fn recovery(&self) -> Option<&Arc<dyn RecoverySource>> {
        self.recovery.as_ref()
    }

    /// The kernel command line.
    pub fn cmdline(&self) -> &Cmdline {
        &self.cmdline
    }

    /// The service catalog started by the Boot sequence.
    pub fn catalog(&self) -> Vec<Arc<dyn Service>> {
        self.catalog.clone()
    }

    /// The bootloader ADV block location.
    pub fn adv_path(&self) -> PathBuf {
        self.adv_path.clone()
    }

    /// The static manifests directory.
    pub fn manifests_dir(&self) -> &Path {
        &self.manifests_dir
    }

    /// The persisted machine-config location.
    pub fn config_path(&self) -> PathBuf {
        self.config_path.clone()
    }

    /// The root cancellation token; cancelled when the agent stops.
    pub fn root_token(&self) -> &CancellationToken {
        &self.root
    }

    /// Runs a lifecycle sequence under the preemption policy.
    pub async fn run_sequence(
        self: &Arc<Self>,
        sequence: Sequence,
        request: Request,
    ) -> Result<(), RuntimeError> {
        self.sequencer.run(self, sequence, request).await
    }

    /// Starts the controller runtime with the network controllers.
    ///
    /// Idempotent: returns `Ok(false)` when already started.
    pub fn start_controllers(self: &Arc<Self>) -> Result<bool, TaskError> {
        let mut slot = self.controllers.lock().expect("controller slot poisoned");
        if slot.is_some() {
            return Ok(false);
        }

        let cmdline_net = parse_cmdline_network(&self.cmdline)?;
        let interfaces = sys_interfaces();

        let mut crt =
            ControllerRuntime::new(self.store.clone(), self.bus.clone(), self.cfg.controller_backoff);

        let registrations: Vec<Arc<dyn crate::controllers::Controller>> = vec![
            Arc::new(LinkConfigController::new(
                cmdline_net.clone(),
                interfaces.clone(),
            )),
            Arc::new(AddressConfigController::new(
                cmdline_net.clone(),
                interfaces.clone(),
            )),
            Arc::new(RouteConfigController::new(cmdline_net.clone(), interfaces)),
            Arc::new(ResolverConfigController::new(cmdline_net.clone())),
            Arc::new(HostnameConfigController::new(cmdline_net)),
            Arc::new(LinkSpecController::new(Arc::clone(&self.netlink))),
            Arc::new(AddressSpecController::new(Arc::clone(&self.netlink))),
            Arc::new(RouteSpecController::new(Arc::clone(&self.netlink))),
        ];

        for controller in registrations {
            crt.register(controller)
                .map_err(|e| TaskError::fatal(e.to_string()))?;
        }

        let token = self.root.child_token();
        *slot = Some(tokio::spawn(crt.run(token)));

        Ok(true)
    }

    /// Flags a reboot to be issued by a later `reboot-if-pending` task.
    pub fn set_pending_reboot(&self) {
        self.pending_reboot.store(true, Ordering::SeqCst);
    }

    /// Takes the pending-reboot flag.
    pub fn take_pending_reboot(&self) -> bool {
        self.pending_reboot.swap(false, Ordering::SeqCst)
    }

    /// Stops the runtime: cancels every controller, service actor, and
    /// in-flight sequence task.
    pub fn stop(&self) {
        self.root.cancel();
    }
}
