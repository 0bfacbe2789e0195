//! # LinkSpecController: converges desired link specs into kernel state.
//!
//! Subscribes to [`LinkSpec`] resources, computes the effective set (highest
//! config layer per link name), applies it through the [`Netlink`] seam, and
//! writes back observed [`LinkStatus`].
//!
//! ## Rules
//! - The applier claims winning specs with its finalizer; superseded specs
//!   are released so their producer may destroy them freely.
//! - Teardown is two-phase: on a tearing-down spec the applier undoes kernel
//!   state (deletes logical links; physical links are left alone) and drops
//!   its finalizer; the producing controller then destroys the resource.
//! - Apply order resolves the link DAG flatly: bond masters first, then
//!   plain devices, then VLAN subdevices (whose parents must exist).
//! - A physical link that does not exist yet is skipped; the pass re-runs
//!   when specs or statuses change.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::controllers::netlink::{Netlink, NetlinkError};
use crate::controllers::{
    Controller, ControllerError, Input, InputKind, Output, OutputKind, ReconcilerContext,
};
use crate::resources::{
    LinkKind, LinkSpec, LinkStatus, Payload, Phase, Resource, NETWORK_CONFIG_NAMESPACE,
    NETWORK_NAMESPACE,
};

/// Applies desired link state to the kernel.
pub struct LinkSpecController {
    netlink: Arc<dyn Netlink>,
}

impl LinkSpecController {
    /// Creates the applier over the given netlink backend.
    pub fn new(netlink: Arc<dyn Netlink>) -> Self {
        Self { netlink }
    }
}

#[async_trait]
impl Controller for LinkSpecController {
    fn name(&self) -> &'static str {
        "LinkSpecController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input {
            namespace: NETWORK_CONFIG_NAMESPACE,
            ty: Resource::LINK_SPEC,
            id: None,
            kind: InputKind::DestroyReady,
        }]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output {
            ty: Resource::LINK_STATUS,
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

impl LinkSpecController {
    async fn reconcile(&self, ctx: &ReconcilerContext) -> Result<(), ControllerError> {
        let resources = ctx.list(NETWORK_CONFIG_NAMESPACE, Resource::LINK_SPEC).await;

        // Effective set: highest layer per link name among live specs.
        let mut winners: BTreeMap<String, (&Resource, &LinkSpec)> = BTreeMap::new();
        let mut tearing_down: Vec<(&Resource, &LinkSpec)> = Vec::new();

        for res in &resources {
            let Some(spec) = res.as_link() else { continue };

            if res.meta.phase == Phase::TearingDown {
                tearing_down.push((res, spec));
                continue;
            }

            match winners.get(&spec.name) {
                Some((_, current)) if current.layer >= spec.layer => {}
                _ => {
                    winners.insert(spec.name.clone(), (res, spec));
                }
            }
        }

        // Two-phase destroy: undo kernel state, then release the claim.
        for (res, spec) in tearing_down {
            if spec.logical && !winners.contains_key(&spec.name) {
                self.netlink.link_delete(&spec.name).await?;
            }

            ctx.remove_finalizer(NETWORK_CONFIG_NAMESPACE, Resource::LINK_SPEC, &res.meta.id)
                .await?;
        }

        // Claim winners, release superseded specs.
        for res in &resources {
            let Some(spec) = res.as_link() else { continue };
            if res.meta.phase != Phase::Running {
                continue;
            }

            let is_winner = winners
                .get(&spec.name)
                .map(|(w, _)| w.meta.id == res.meta.id)
                .unwrap_or(false);

            if is_winner {
                ctx.add_finalizer(NETWORK_CONFIG_NAMESPACE, Resource::LINK_SPEC, &res.meta.id)
                    .await?;
            } else {
                ctx.remove_finalizer(NETWORK_CONFIG_NAMESPACE, Resource::LINK_SPEC, &res.meta.id)
                    .await?;
            }
        }

        // Apply in DAG order: bonds, plain links, VLAN subdevices.
        let mut ordered: Vec<&LinkSpec> = winners.values().map(|(_, s)| *s).collect();
        ordered.sort_by_key(|s| match s.kind {
            LinkKind::Bond => 0u8,
            LinkKind::Vlan => 2,
            _ => 1,
        });

        for spec in ordered {
            match self.netlink.link_ensure(spec).await {
                Ok(()) => {}
                Err(NetlinkError::LinkNotFound(name)) => {
                    debug!(link = %name, "link not present yet, deferring");
                }
                Err(e) => return Err(e.into()),
            }
        }

        // Write back observed state for the links we manage.
        let kernel: BTreeMap<String, _> = self
            .netlink
            .link_list()
            .await?
            .into_iter()
            .map(|l| (l.name.clone(), l))
            .collect();

        let mut produced = Vec::new();

        for (name, (_, spec)) in &winners {
            let Some(state) = kernel.get(name) else { continue };

            produced.push((
                name.clone(),
                Payload::LinkStatus(LinkStatus {
                    name: name.clone(),
                    index: state.index,
                    up: state.up,
                    mtu: state.mtu,
                    kind: state.kind,
                    layer: spec.layer,
                }),
            ));
        }

        ctx.reconcile_outputs(NETWORK_NAMESPACE, Resource::LINK_STATUS, produced)
            .await
    }
}
