//! # AddressSpecController: converges desired addresses into kernel state.
//!
//! Subscribes to [`AddressSpec`] resources, computes the effective set
//! (highest config layer per `(link, address)` key), assigns the winning
//! addresses through the [`Netlink`] seam, and writes back observed
//! [`AddressStatus`].
//!
//! Watches [`LinkStatus`] as well: an address whose link does not exist yet
//! is deferred and re-applied once the link applier reports the link.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::controllers::netlink::{Netlink, NetlinkError};
use crate::controllers::{
    Controller, ControllerError, Input, InputKind, Output, OutputKind, ReconcilerContext,
};
use crate::resources::{
    AddressSpec, AddressStatus, Payload, Phase, Resource, NETWORK_CONFIG_NAMESPACE,
    NETWORK_NAMESPACE,
};

/// Applies desired addresses to the kernel.
pub struct AddressSpecController {
    netlink: Arc<dyn Netlink>,
}

impl AddressSpecController {
    /// Creates the applier over the given netlink backend.
    pub fn new(netlink: Arc<dyn Netlink>) -> Self {
        Self { netlink }
    }
}

#[async_trait]
impl Controller for AddressSpecController {
    fn name(&self) -> &'static str {
        "AddressSpecController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input {
                namespace: NETWORK_CONFIG_NAMESPACE,
                ty: Resource::ADDRESS_SPEC,
                id: None,
                kind: InputKind::DestroyReady,
            },
            Input {
                namespace: NETWORK_NAMESPACE,
                ty: Resource::LINK_STATUS,
                id: None,
                kind: InputKind::Weak,
            },
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output {
            ty: Resource::ADDRESS_STATUS,
            kind: OutputKind::Exclusive,
        }]
    }

    async fn run(&self, ctx: &mut ReconcilerContext) -> Result<(), ControllerError> {
        loop {
            let cancelled = ctx.cancellation_token();
            tokio::select! {
                _ = cancelled.cancelled() => return Ok(()),
                _ = ctx.changed() => {}
            }

            self.reconcile(ctx).await?;
        }
    }
}

impl AddressSpecController {
    async fn reconcile(&self, ctx: &ReconcilerContext) -> Result<(), ControllerError> {
        let resources = ctx
            .list(NETWORK_CONFIG_NAMESPACE, Resource::ADDRESS_SPEC)
            .await;

        // Effective set: highest layer per (link, address) among live specs.
        let mut winners: BTreeMap<String, (&Resource, &AddressSpec)> = BTreeMap::new();
        let mut tearing_down: Vec<(&Resource, &AddressSpec)> = Vec::new();

        for res in &resources {
            let Some(spec) = res.as_address() else { continue };

            if res.meta.phase == Phase::TearingDown {
                tearing_down.push((res, spec));
                continue;
            }

            let key = spec.logical_id();
            match winners.get(&key) {
                Some((_, current)) if current.layer >= spec.layer => {}
                _ => {
                    winners.insert(key, (res, spec));
                }
            }
        }

        // Two-phase destroy: remove the kernel address unless a live spec
        // still wants the same (link, address), then release the claim.
        for (res, spec) in tearing_down {
            if !winners.contains_key(&spec.logical_id()) {
                match self.netlink.address_del(&spec.link_name, &spec.address).await {
                    Ok(()) => {}
                    Err(NetlinkError::LinkNotFound(_)) => {}
                    Err(e) => return Err(e.into()),
                }
            }

            ctx.remove_finalizer(NETWORK_CONFIG_NAMESPACE, Resource::ADDRESS_SPEC, &res.meta.id)
                .await?;
        }

        // Claim winners, release superseded specs.
        for res in &resources {
            let Some(spec) = res.as_address() else { continue };
            if res.meta.phase != Phase::Running {
                continue;
            }

            let is_winner = winners
                .get(&spec.logical_id())
                .map(|(w, _)| w.meta.id == res.meta.id)
                .unwrap_or(false);

            if is_winner {
                ctx.add_finalizer(NETWORK_CONFIG_NAMESPACE, Resource::ADDRESS_SPEC, &res.meta.id)
                    .await?;
            } else {
                ctx.remove_finalizer(
                    NETWORK_CONFIG_NAMESPACE,
                    Resource::ADDRESS_SPEC,
                    &res.meta.id,
                )
                .await?;
            }
        }

        // Assign missing addresses, one kernel listing per involved link.
        let mut kernel: BTreeMap<String, Vec<crate::resources::IpPrefix>> = BTreeMap::new();
        let mut produced = Vec::new();

        for (key, (_, spec)) in &winners {
            if !kernel.contains_key(&spec.link_name) {
                match self.netlink.address_list(&spec.link_name).await {
                    Ok(addrs) => {
                        kernel.insert(spec.link_name.clone(), addrs);
                    }
                    Err(NetlinkError::LinkNotFound(name)) => {
                        debug!(link = %name, "link not present yet, deferring address");
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            let assigned = kernel
                .get(&spec.link_name)
                .expect("listed above")
                .contains(&spec.address);

            if !assigned {
                match self.netlink.address_add(&spec.link_name, &spec.address).await {
                    Ok(()) => {
                        kernel
                            .get_mut(&spec.link_name)
                            .expect("cached above")
                            .push(spec.address);
                    }
                    Err(NetlinkError::LinkNotFound(name)) => {
                        debug!(link = %name, "link not present yet, deferring address");
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            produced.push((
                key.clone(),
                Payload::AddressStatus(AddressStatus {
                    address: spec.address,
                    link_name: spec.link_name.clone(),
                    layer: spec.layer,
                }),
            ));
        }

        ctx.reconcile_outputs(NETWORK_NAMESPACE, Resource::ADDRESS_STATUS, produced)
            .await
    }
}
