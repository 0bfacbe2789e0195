//! # AddressConfigController: desired addresses from config and cmdline.
//!
//! Produces layered [`AddressSpec`] resources:
//! - `lo` gets `127.0.0.1/8` and `::1/128` at the default layer, scope host;
//! - the cmdline address lands on the named interface (or the
//!   lexicographically first non-loopback one) at the cmdline layer;
//! - machine-config devices and their VLAN subdevices at the configuration
//!   layer. Ignored devices are skipped entirely.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use async_trait::async_trait;
use tracing::warn;

use crate::controllers::{
    read_machine_config, Controller, ControllerError, Input, InputKind, Output, OutputKind,
    ReconcilerContext,
};
use crate::machine::{CmdlineNetwork, MachineConfig};
use crate::resources::{
    AddressSpec, ConfigLayer, IpPrefix, Payload, Resource, Scope, CONFIG_NAMESPACE,
    MACHINE_CONFIG_ID, NETWORK_CONFIG_NAMESPACE,
};

/// Derives desired addresses from the machine config and kernel cmdline.
pub struct AddressConfigController {
    cmdline: Option<CmdlineNetwork>,
    interfaces: Vec<String>,
}

impl AddressConfigController {
    /// Creates the controller; `interfaces` is consulted when the cmdline
    /// names no interface.
    pub fn new(cmdline: Option<CmdlineNetwork>, interfaces: Vec<String>) -> Self {
        Self { cmdline, interfaces }
    }

    fn default_addresses(&self) -> Vec<AddressSpec> {
        let mut lo4 = AddressSpec::new(
            IpPrefix::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8),
            "lo",
            ConfigLayer::Default,
        );
        lo4.scope = Scope::Host;

        let mut lo6 = AddressSpec::new(
            IpPrefix::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 128),
            "lo",
            ConfigLayer::Default,
        );
        lo6.scope = Scope::Host;

        vec![lo4, lo6]
    }

    fn cmdline_address(&self) -> Option<AddressSpec> {
        let cmdline = self.cmdline.as_ref()?;
        let address = cmdline.address?;

        let link = match &cmdline.link_name {
            Some(name) => name.clone(),
            None => match super::first_nonloopback(&self.interfaces) {
                Some(name) => name,
                None => {
                    warn!("cmdline address has no interface and none are available");
                    return None;
                }
            },
        };

        Some(AddressSpec::new(address, link, ConfigLayer::Cmdline))
    }

    fn config_addresses(&self, cfg: &MachineConfig) -> Vec<AddressSpec> {
        let mut specs = Vec::new();

        for device in &cfg.machine.network.interfaces {
            if device.ignore {
                continue;
            }

            if !device.cidr.is_empty() {
                match device.cidr.parse() {
                    Ok(prefix) => specs.push(AddressSpec::new(
                        prefix,
                        &device.interface,
                        ConfigLayer::MachineConfig,
                    )),
                    Err(e) => {
                        warn!(device = %device.interface, error = %e, "skipping malformed cidr");
                    }
                }
            }

            for vlan in &device.vlans {
                if vlan.cidr.is_empty() {
                    continue;
                }

                match vlan.cidr.parse() {
                    Ok(prefix) => specs.push(AddressSpec::new(
                        prefix,
                        format!("{}.{}", device.interface, vlan.id),
                        ConfigLayer::MachineConfig,
                    )),
                    Err(e) => {
                        warn!(
                            device = %device.interface,
                            vlan = vlan.id,
                            error = %e,
                            "skipping malformed vlan cidr",
                        );
                    }
                }
            }
        }

        specs
    }
}

#[async_trait]
impl Controller for AddressConfigController {
    fn name(&self) -> &'static str {
        "AddressConfigController"
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
            ty: Resource::ADDRESS_SPEC,
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

            let mut specs = self.default_addresses();

            if let Some(spec) = self.cmdline_address() {
                specs.push(spec);
            }

            if let Some(cfg) = cfg.as_deref() {
                specs.extend(self.config_addresses(cfg));
            }

            let produced = specs
                .into_iter()
                .map(|s| (s.id(), Payload::Address(s)))
                .collect();

            ctx.reconcile_outputs(NETWORK_CONFIG_NAMESPACE, Resource::ADDRESS_SPEC, produced)
                .await?;
        }
    }
}
