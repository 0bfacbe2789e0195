//! # RouteConfigController: desired routes from config and cmdline.
//!
//! Produces layered [`RouteSpec`] resources: the cmdline gateway becomes a
//! default route at the cmdline layer; machine-config device and VLAN routes
//! land at the configuration layer. Ignored devices contribute nothing.

use async_trait::async_trait;
use tracing::warn;

use crate::controllers::{
    read_machine_config, Controller, ControllerError, Input, InputKind, Output, OutputKind,
    ReconcilerContext,
};
use crate::machine::{CmdlineNetwork, DeviceRoute, MachineConfig};
use crate::resources::{
    ConfigLayer, Family, Payload, Resource, RouteSpec, CONFIG_NAMESPACE, MACHINE_CONFIG_ID,
    NETWORK_CONFIG_NAMESPACE,
};

/// Metric assigned to routes that do not specify one.
const DEFAULT_ROUTE_METRIC: u32 = 1024;

/// Derives desired routes from the machine config and kernel cmdline.
pub struct RouteConfigController {
    cmdline: Option<CmdlineNetwork>,
    interfaces: Vec<String>,
}

impl RouteConfigController {
    /// Creates the controller; `interfaces` is consulted when the cmdline
    /// names no interface.
    pub fn new(cmdline: Option<CmdlineNetwork>, interfaces: Vec<String>) -> Self {
        Self { cmdline, interfaces }
    }

    fn cmdline_route(&self) -> Option<RouteSpec> {
        let cmdline = self.cmdline.as_ref()?;
        let gateway = cmdline.gateway?;

        let out_link = match &cmdline.link_name {
            Some(name) => name.clone(),
            None => super::first_nonloopback(&self.interfaces)?,
        };

        Some(RouteSpec {
            family: if gateway.is_ipv4() {
                Family::Inet4
            } else {
                Family::Inet6
            },
            destination: None,
            gateway: Some(gateway),
            out_link,
            priority: DEFAULT_ROUTE_METRIC,
            layer: ConfigLayer::Cmdline,
        })
    }

    fn config_routes(&self, cfg: &MachineConfig) -> Vec<RouteSpec> {
        let mut specs = Vec::new();

        for device in &cfg.machine.network.interfaces {
            if device.ignore {
                continue;
            }

            for route in &device.routes {
                if let Some(spec) = parse_route(route, &device.interface) {
                    specs.push(spec);
                }
            }

            for vlan in &device.vlans {
                let link = format!("{}.{}", device.interface, vlan.id);

                for route in &vlan.routes {
                    if let Some(spec) = parse_route(route, &link) {
                        specs.push(spec);
                    }
                }
            }
        }

        specs
    }
}

fn parse_route(route: &DeviceRoute, out_link: &str) -> Option<RouteSpec> {
    let destination: Option<crate::resources::IpPrefix> = if route.network.is_empty() || route.network == "0.0.0.0/0" || route.network == "::/0" {
        None
    } else {
        match route.network.parse() {
            Ok(prefix) => Some(prefix),
            Err(e) => {
                warn!(link = out_link, error = %e, "skipping malformed route network");
                return None;
            }
        }
    };

    let gateway = if route.gateway.is_empty() {
        None
    } else {
        match route.gateway.parse() {
            Ok(gw) => Some(gw),
            Err(_) => {
                warn!(link = out_link, gateway = %route.gateway, "skipping malformed gateway");
                return None;
            }
        }
    };

    let family = match (destination, gateway) {
        (Some(dest), _) => dest.family(),
        (None, Some(std::net::IpAddr::V4(_))) => Family::Inet4,
        (None, Some(std::net::IpAddr::V6(_))) => Family::Inet6,
        (None, None) => {
            warn!(link = out_link, "skipping route with neither network nor gateway");
            return None;
        }
    };

    Some(RouteSpec {
        family,
        destination,
        gateway,
        out_link: out_link.to_string(),
        priority: if route.metric > 0 {
            route.metric
        } else {
            DEFAULT_ROUTE_METRIC
        },
        layer: ConfigLayer::MachineConfig,
    })
}

#[async_trait]
impl Controller for RouteConfigController {
    fn name(&self) -> &'static str {
        "RouteConfigController"
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
            ty: Resource::ROUTE_SPEC,
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

            let mut specs = Vec::new();

            if let Some(spec) = self.cmdline_route() {
                specs.push(spec);
            }

            if let Some(cfg) = cfg.as_deref() {
                specs.extend(self.config_routes(cfg));
            }

            let produced = specs
                .into_iter()
                .map(|s| (s.id(), Payload::Route(s)))
                .collect();

            ctx.reconcile_outputs(NETWORK_CONFIG_NAMESPACE, Resource::ROUTE_SPEC, produced)
                .await?;
        }
    }
}
