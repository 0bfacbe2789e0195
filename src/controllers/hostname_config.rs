//! # HostnameConfigController: desired hostname.
//!
//! Produces one layered [`HostnameSpec`] per source: `localhost` at the
//! default layer, the `ip=`-carried name at the cmdline layer, and the
//! machine-config hostname (split into host and domain parts) at the
//! configuration layer.

use async_trait::async_trait;

use crate::controllers::{
    read_machine_config, Controller, ControllerError, Input, InputKind, Output, OutputKind,
    ReconcilerContext,
};
use crate::machine::CmdlineNetwork;
use crate::resources::{
    ConfigLayer, HostnameSpec, Payload, Resource, CONFIG_NAMESPACE, MACHINE_CONFIG_ID,
    NETWORK_CONFIG_NAMESPACE,
};

/// Derives the desired hostname from the machine config and kernel cmdline.
pub struct HostnameConfigController {
    cmdline: Option<CmdlineNetwork>,
}

impl HostnameConfigController {
    /// Creates the controller.
    pub fn new(cmdline: Option<CmdlineNetwork>) -> Self {
        Self { cmdline }
    }
}

#[async_trait]
impl Controller for HostnameConfigController {
    fn name(&self) -> &'static str {
        "HostnameConfigController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input {
            namespace: CONFIG_NAMESPACE,
            ty: Resource::MACHINE_CONFIG,
            id: Some(MACHINE_CONFIG_ID.to_string()),
            kind: InputKind::Weak,
        }]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output {
            ty: Resource::HOSTNAME_SPEC,
            kind: OutputKind::Shared,
        }]
    }

    async fn run(&self, ctx: &mut ReconcilerContext) -> Result<(), ControllerError> {
        loop {
            let cancelled = ctx.cancellation_token();
            tokio::select! {
                _ = cancelled.cancelled() => return Ok(()),
                _ = ctx.changed() => {}
            }

            let cfg = read_machine_config(ctx).await?;

            let mut specs = vec![HostnameSpec::parse("localhost", ConfigLayer::Default)];

            if let Some(hostname) = self.cmdline.as_ref().and_then(|c| c.hostname.as_deref()) {
                specs.push(HostnameSpec::parse(hostname, ConfigLayer::Cmdline));
            }

            if let Some(cfg) = cfg.as_deref() {
                let hostname = &cfg.machine.network.hostname;
                if !hostname.is_empty() {
                    specs.push(HostnameSpec::parse(hostname, ConfigLayer::MachineConfig));
                }
            }

            let produced = specs
                .into_iter()
                .map(|s| (s.id(), Payload::Hostname(s)))
                .collect();

            ctx.reconcile_outputs(NETWORK_CONFIG_NAMESPACE, Resource::HOSTNAME_SPEC, produced)
                .await?;
        }
    }
}
