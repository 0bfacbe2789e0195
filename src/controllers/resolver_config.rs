//! # ResolverConfigController: desired DNS resolvers.
//!
//! Produces one layered [`ResolverSpec`] per source: well-known public
//! resolvers at the default layer, cmdline-carried servers at the cmdline
//! layer, and machine-config nameservers at the configuration layer.

use std::net::{IpAddr, Ipv4Addr};

use async_trait::async_trait;
use tracing::warn;

use crate::controllers::{
    read_machine_config, Controller, ControllerError, Input, InputKind, Output, OutputKind,
    ReconcilerContext,
};
use crate::machine::CmdlineNetwork;
use crate::resources::{
    ConfigLayer, Payload, ResolverSpec, Resource, CONFIG_NAMESPACE, MACHINE_CONFIG_ID,
    NETWORK_CONFIG_NAMESPACE,
};

/// Fallback resolvers used when no other layer provides any.
const DEFAULT_RESOLVERS: [IpAddr; 2] = [
    IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
    IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
];

/// Derives desired resolvers from the machine config and kernel cmdline.
pub struct ResolverConfigController {
    cmdline: Option<CmdlineNetwork>,
}

impl ResolverConfigController {
    /// Creates the controller.
    pub fn new(cmdline: Option<CmdlineNetwork>) -> Self {
        Self { cmdline }
    }
}

#[async_trait]
impl Controller for ResolverConfigController {
    fn name(&self) -> &'static str {
        "ResolverConfigController"
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
            ty: Resource::RESOLVER_SPEC,
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

            let mut specs = vec![ResolverSpec {
                servers: DEFAULT_RESOLVERS.to_vec(),
                layer: ConfigLayer::Default,
            }];

            if let Some(cmdline) = &self.cmdline {
                if !cmdline.resolvers.is_empty() {
                    specs.push(ResolverSpec {
                        servers: cmdline.resolvers.clone(),
                        layer: ConfigLayer::Cmdline,
                    });
                }
            }

            if let Some(cfg) = cfg.as_deref() {
                let mut servers: Vec<IpAddr> = Vec::new();

                for ns in &cfg.machine.network.nameservers {
                    match ns.parse() {
                        Ok(addr) => servers.push(addr),
                        Err(_) => warn!(nameserver = %ns, "skipping malformed nameserver"),
                    }
                }

                if !servers.is_empty() {
                    specs.push(ResolverSpec {
                        servers,
                        layer: ConfigLayer::MachineConfig,
                    });
                }
            }

            let produced = specs
                .into_iter()
                .map(|s| (s.id(), Payload::Resolver(s)))
                .collect();

            ctx.reconcile_outputs(NETWORK_CONFIG_NAMESPACE, Resource::RESOLVER_SPEC, produced)
                .await?;
        }
    }
}
