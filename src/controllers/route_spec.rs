//! # RouteSpecController: converges desired routes into kernel state.
//!
//! Subscribes to [`RouteSpec`] resources, computes the effective set
//! (highest config layer per logical route key), installs the winning routes
//! through the [`Netlink`] seam, and writes back observed [`RouteStatus`].
//!
//! Watches [`LinkStatus`] as well: a route whose output link does not exist
//! yet is deferred and re-applied once the link applier reports the link.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::controllers::netlink::{Netlink, NetlinkError};
use crate::controllers::{
    Controller, ControllerError, Input, InputKind, Output, OutputKind, ReconcilerContext,
};
use crate::resources::{
    Payload, Phase, Resource, RouteSpec, RouteStatus, NETWORK_CONFIG_NAMESPACE, NETWORK_NAMESPACE,
};

/// Applies desired routes to the kernel.
pub struct RouteSpecController {
    netlink: Arc<dyn Netlink>,
}

impl RouteSpecController {
    /// Creates the applier over the given netlink backend.
    pub fn new(netlink: Arc<dyn Netlink>) -> Self {
        Self { netlink }
    }
}

#[async_trait]
impl Controller for RouteSpecController {
    fn name(&self) -> &'static str {
        "RouteSpecController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input {
                namespace: NETWORK_CONFIG_NAMESPACE,
                ty: Resource::ROUTE_SPEC,
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
            ty: Resource::ROUTE_STATUS,
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

impl RouteSpecController {
    async fn reconcile(&self, ctx: &ReconcilerContext) -> Result<(), ControllerError> {
        let resources = ctx.list(NETWORK_CONFIG_NAMESPACE, Resource::ROUTE_SPEC).await;

        // Effective set: highest layer per logical route among live specs.
        let mut winners: BTreeMap<String, (&Resource, &RouteSpec)> = BTreeMap::new();
        let mut tearing_down: Vec<(&Resource, &RouteSpec)> = Vec::new();

        for res in &resources {
            let Some(spec) = res.as_route() else { continue };

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

        // Two-phase destroy: remove the kernel route unless a live spec
        // still wants the same logical route, then release the claim.
        for (res, spec) in tearing_down {
            if !winners.contains_key(&spec.logical_id()) {
                match self.netlink.route_del(spec).await {
                    Ok(()) => {}
                    Err(NetlinkError::LinkNotFound(_)) => {}
                    Err(e) => return Err(e.into()),
                }
            }

            ctx.remove_finalizer(NETWORK_CONFIG_NAMESPACE, Resource::ROUTE_SPEC, &res.meta.id)
                .await?;
        }

        // Claim winners, release superseded specs.
        for res in &resources {
            let Some(spec) = res.as_route() else { continue };
            if res.meta.phase != Phase::Running {
                continue;
            }

            let is_winner = winners
                .get(&spec.logical_id())
                .map(|(w, _)| w.meta.id == res.meta.id)
                .unwrap_or(false);

            if is_winner {
                ctx.add_finalizer(NETWORK_CONFIG_NAMESPACE, Resource::ROUTE_SPEC, &res.meta.id)
                    .await?;
            } else {
                ctx.remove_finalizer(NETWORK_CONFIG_NAMESPACE, Resource::ROUTE_SPEC, &res.meta.id)
                    .await?;
            }
        }

        // Install winners; `route_add` is idempotent on both backends.
        let mut produced = Vec::new();

        for (key, (_, spec)) in &winners {
            match self.netlink.route_add(spec).await {
                Ok(()) => {}
                Err(NetlinkError::LinkNotFound(name)) => {
                    debug!(link = %name, "link not present yet, deferring route");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }

            produced.push((
                key.clone(),
                Payload::RouteStatus(RouteStatus {
                    family: spec.family,
                    destination: spec.destination,
                    gateway: spec.gateway,
                    out_link: spec.out_link.clone(),
                    priority: spec.priority,
                    layer: spec.layer,
                }),
            ));
        }

        ctx.reconcile_outputs(NETWORK_NAMESPACE, Resource::ROUTE_STATUS, produced)
            .await
    }
}
