//! # LinkConfigController: desired link state from config and cmdline.
//!
//! Produces layered [`LinkSpec`] resources:
//! - `lo` up at the default layer;
//! - the cmdline interface up at the cmdline layer;
//! - machine-config devices at the configuration layer, including bond
//!   masters and slaves, VLAN subdevices (`<parent>.<vid>`), wireguard
//!   tunnels, and dummy links.
//!
//! ## Rules
//! - Ignored devices (and their subdevices) are absent from the desired set,
//!   not merely down.
//! - A link enslaved by more than one bond is logged; the last-seen
//!   assignment wins.
//! - Bond slaves are produced with `up = false` and the master name; the
//!   master carries the bond parameters.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use tracing::warn;

use crate::controllers::{
    read_machine_config, Controller, ControllerError, Input, InputKind, Output, OutputKind,
    ReconcilerContext,
};
use crate::machine::{CmdlineNetwork, Device, MachineConfig, Vlan};
use crate::resources::{
    BondMode, BondSpec, ConfigLayer, HashPolicy, LacpRate, LinkKind, LinkSpec, Payload, Resource,
    VlanSpec, WireguardPeer, WireguardSpec, CONFIG_NAMESPACE, MACHINE_CONFIG_ID,
    NETWORK_CONFIG_NAMESPACE,
};

/// Derives desired link state from the machine config and kernel cmdline.
pub struct LinkConfigController {
    cmdline: Option<CmdlineNetwork>,
    interfaces: Vec<String>,
}

impl LinkConfigController {
    /// Creates the controller.
    ///
    /// `interfaces` is the kernel link list used when the cmdline names no
    /// interface; pass [`crate::machine::Cmdline`]-derived settings and a
    /// sysfs snapshot in production.
    pub fn new(cmdline: Option<CmdlineNetwork>, interfaces: Vec<String>) -> Self {
        Self { cmdline, interfaces }
    }

    fn cmdline_link(&self, ignored: &HashSet<&str>) -> Option<LinkSpec> {
        let cmdline = self.cmdline.as_ref()?;
        if cmdline.is_empty() {
            return None;
        }

        let name = match &cmdline.link_name {
            Some(name) => name.clone(),
            None => super::first_nonloopback(&self.interfaces)?,
        };

        if ignored.contains(name.as_str()) {
            return None;
        }

        Some(LinkSpec::up(name, ConfigLayer::Cmdline))
    }

    fn config_links(&self, cfg: &MachineConfig) -> Vec<LinkSpec> {
        let mut links = Vec::new();

        // Scan for bond enslavements first: slave -> master.
        let mut bonded: HashMap<&str, &str> = HashMap::new();

        for device in &cfg.machine.network.interfaces {
            if device.ignore {
                continue;
            }

            let Some(bond) = &device.bond else { continue };

            for slave in &bond.interfaces {
                if bonded.contains_key(slave.as_str()) {
                    warn!(link = %slave, "link is enslaved by more than one bond");
                }

                bonded.insert(slave, &device.interface);
            }
        }

        for device in &cfg.machine.network.interfaces {
            if device.ignore {
                continue;
            }

            let mut link = LinkSpec::up(&device.interface, ConfigLayer::MachineConfig);
            link.mtu = device.mtu;

            if let Some(master) = bonded.get(device.interface.as_str()) {
                bond_slave(&mut link, master);
            }

            if let Some(bond) = &device.bond {
                bond_master(&mut link, bond);
            }

            if let Some(wg) = &device.wireguard {
                wireguard_link(&mut link, wg);
            }

            if device.dummy {
                dummy_link(&mut link);
            }

            for vlan in &device.vlans {
                links.push(vlan_link(device, vlan));
            }

            links.push(link);
        }

        links
    }
}

#[async_trait]
impl Controller for LinkConfigController {
    fn name(&self) -> &'static str {
        "LinkConfigController"
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
            ty: Resource::LINK_SPEC,
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

            let ignored: HashSet<&str> = cfg
                .as_deref()
                .map(|cfg| {
                    cfg.machine
                        .network
                        .interfaces
                        .iter()
                        .filter(|d| d.ignore)
                        .map(|d| d.interface.as_str())
                        .collect()
                })
                .unwrap_or_default();

            let mut links = vec![LinkSpec::up("lo", ConfigLayer::Default)];

            if let Some(link) = self.cmdline_link(&ignored) {
                links.push(link);
            }

            if let Some(cfg) = cfg.as_deref() {
                links.extend(self.config_links(cfg));
            }

            // Last write wins for duplicate ids within a pass.
            let produced: BTreeMap<String, Payload> = links
                .into_iter()
                .map(|l| (l.id(), Payload::Link(l)))
                .collect();

            ctx.reconcile_outputs(
                NETWORK_CONFIG_NAMESPACE,
                Resource::LINK_SPEC,
                produced.into_iter().collect(),
            )
            .await?;
        }
    }
}

fn bond_slave(link: &mut LinkSpec, master: &str) {
    link.up = false;
    link.master = master.to_string();
}

fn bond_master(link: &mut LinkSpec, bond: &crate::machine::Bond) {
    link.logical = true;
    link.kind = LinkKind::Bond;

    // Validation rejects unknown names up front; leftovers degrade to
    // defaults with a warning so a pass never aborts on one device.
    let mode = BondMode::by_name(&bond.mode).unwrap_or_else(|e| {
        warn!(link = %link.name, error = %e, "falling back to default bond mode");
        BondMode::default()
    });
    let hash_policy = HashPolicy::by_name(&bond.hash_policy).unwrap_or_else(|e| {
        warn!(link = %link.name, error = %e, "falling back to default hash policy");
        HashPolicy::default()
    });
    let lacp_rate = LacpRate::by_name(&bond.lacp_rate).unwrap_or_else(|e| {
        warn!(link = %link.name, error = %e, "falling back to default LACP rate");
        LacpRate::default()
    });

    link.bond = Some(BondSpec {
        mode,
        hash_policy,
        lacp_rate,
        mii_mon: bond.miimon,
        up_delay: bond.updelay,
        down_delay: bond.downdelay,
        min_links: bond.min_links,
    });
}

fn vlan_link(device: &Device, vlan: &Vlan) -> LinkSpec {
    let mut link = LinkSpec::up(
        format!("{}.{}", device.interface, vlan.id),
        ConfigLayer::MachineConfig,
    );

    link.logical = true;
    link.kind = LinkKind::Vlan;
    link.parent = device.interface.clone();
    link.vlan = Some(VlanSpec { vid: vlan.id });

    link
}

fn wireguard_link(link: &mut LinkSpec, wg: &crate::machine::Wireguard) {
    link.logical = true;
    link.kind = LinkKind::Wireguard;

    let mut spec = WireguardSpec {
        private_key: wg.private_key.clone(),
        listen_port: wg.listen_port,
        firewall_mark: wg.firewall_mark,
        peers: Vec::new(),
    };

    for peer in &wg.peers {
        let mut allowed_ips = Vec::with_capacity(peer.allowed_ips.len());

        for ip in &peer.allowed_ips {
            match ip.parse() {
                Ok(prefix) => allowed_ips.push(prefix),
                Err(e) => {
                    warn!(link = %link.name, error = %e, "skipping wireguard allowed ip");
                }
            }
        }

        spec.peers.push(WireguardPeer {
            public_key: peer.public_key.clone(),
            endpoint: peer.endpoint.clone(),
            persistent_keepalive: peer.persistent_keepalive_interval,
            allowed_ips,
        });
    }

    link.wireguard = Some(spec);
}

fn dummy_link(link: &mut LinkSpec) {
    link.logical = true;
    link.kind = LinkKind::Dummy;
}
