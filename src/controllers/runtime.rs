//! # Controller runtime: hosts reconciliation controllers.
//!
//! The runtime owns controller registration and the per-controller
//! supervision loops.
//!
//! ## Architecture
//! ```text
//! register(ctrl)*  ──►  verify: unique names, one writer per exclusive
//!                       output, acyclic controller graph
//!
//! run(token)
//!   └─ per controller:
//!        ├─► waker task: store feed ──filter inputs ∪ own outputs──► bump wake counter
//!        └─► loop {
//!              ctrl.run(ctx)            // long-lived reconcile loop
//!              Ok        → exit (cancellation)
//!              Err(e)    → log + publish ControllerRestarted, backoff, restart
//!            }
//! ```
//!
//! ## Rules
//! - Wakes are **coalesced**: any number of input events before a pass
//!   produce a single wake (a `watch` counter, not a queue).
//! - Controllers also wake on their **own output** events, so finalizer
//!   drains on produced resources are observed without declaring them as
//!   inputs.
//! - Within a controller, reconciliation is single-threaded by construction.
//! - A restart backoff that survived a run longer than the backoff cap is
//!   reset.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, warn};

use crate::controllers::{Controller, ControllerError, Input, Output, OutputKind};
use crate::events::{Bus, Event, EventKind};
use crate::policies::BackoffPolicy;
use crate::resources::{Payload, Phase, Resource, Store, StoreError};

/// The store facade handed to a controller's `run`.
///
/// All writes are stamped with the controller's name as owner; writes to
/// resources owned by another controller are rejected by the store.
pub struct ReconcilerContext {
    name: &'static str,
    store: Store,
    token: CancellationToken,
    wake: watch::Receiver<u64>,
}

impl ReconcilerContext {
    /// The owning controller's name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Completes when the runtime is shutting down.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    /// A cheaply-cloneable handle on the shutdown token, for waiting on
    /// cancellation concurrently with a `&mut self` future (e.g. `changed`)
    /// in the same `select!`.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Whether the runtime is shutting down.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Completes on the next coalesced wake. The first call after a (re)start
    /// completes immediately so the controller performs an initial pass.
    pub async fn changed(&mut self) {
        if self.wake.changed().await.is_err() {
            // Waker gone: the runtime is tearing down; park until cancelled.
            self.token.cancelled().await;
        }
    }

    /// Reads a single resource.
    pub async fn get(
        &self,
        namespace: &str,
        ty: &'static str,
        id: &str,
    ) -> Result<Resource, StoreError> {
        self.store.get(namespace, ty, id).await
    }

    /// Lists resources of a type.
    pub async fn list(&self, namespace: &str, ty: &'static str) -> Vec<Resource> {
        self.store.list(namespace, ty, None).await
    }

    /// Creates or updates a single output resource, skipping no-op writes.
    pub async fn upsert(
        &self,
        namespace: &str,
        id: &str,
        payload: Payload,
    ) -> Result<(), ControllerError> {
        self.store
            .upsert_owned(namespace, id, payload, self.name)
            .await?;

        Ok(())
    }

    /// Registers this controller's finalizer on a resource.
    pub async fn add_finalizer(
        &self,
        namespace: &str,
        ty: &'static str,
        id: &str,
    ) -> Result<(), StoreError> {
        self.store.add_finalizer(namespace, ty, id, self.name).await
    }

    /// Releases this controller's finalizer from a resource.
    pub async fn remove_finalizer(
        &self,
        namespace: &str,
        ty: &'static str,
        id: &str,
    ) -> Result<(), StoreError> {
        self.store
            .remove_finalizer(namespace, ty, id, self.name)
            .await
    }

    /// Converges the set of resources this controller owns under
    /// `(namespace, ty)` towards `produced`:
    ///
    /// - produced resources are upserted (no version bump when unchanged);
    /// - owned resources no longer produced are destroyed, going through
    ///   teardown first when finalizers are registered.
    ///
    /// Resources owned by other controllers (shared output types) are left
    /// untouched.
    pub async fn reconcile_outputs(
        &self,
        namespace: &str,
        ty: &'static str,
        produced: Vec<(String, Payload)>,
    ) -> Result<(), ControllerError> {
        let mut touched: HashMap<String, ()> = HashMap::with_capacity(produced.len());

        for (id, payload) in produced {
            self.store
                .upsert_owned(namespace, &id, payload, self.name)
                .await?;
            touched.insert(id, ());
        }

        for stale in self.store.list(namespace, ty, None).await {
            if stale.meta.owner != self.name || touched.contains_key(&stale.meta.id) {
                continue;
            }

            self.retire(namespace, ty, &stale.meta.id).await?;
        }

        Ok(())
    }

    /// Destroys a resource this controller owns, tearing it down first while
    /// finalizers are registered. Returns once the resource is gone or the
    /// teardown is pending on claimants.
    pub async fn retire(
        &self,
        namespace: &str,
        ty: &'static str,
        id: &str,
    ) -> Result<(), ControllerError> {
        // A residual CAS conflict means a claimant raced us; the wake from
        // its write retries the retirement.
        for _ in 0..2 {
            let ready = match self.store.teardown(namespace, ty, id).await {
                Ok(ready) => ready,
                Err(StoreError::NotFound { .. }) => return Ok(()),
                Err(e) => return Err(e.into()),
            };

            if !ready {
                return Ok(());
            }

            let current = match self.store.get(namespace, ty, id).await {
                Ok(r) => r.meta.version,
                Err(StoreError::NotFound { .. }) => return Ok(()),
                Err(e) => return Err(e.into()),
            };

            match self
                .store
                .destroy_owned(namespace, ty, id, current, self.name)
                .await
            {
                Ok(()) => return Ok(()),
                Err(StoreError::Conflict { .. }) | Err(StoreError::HasFinalizers { .. }) => {
                    continue
                }
                Err(StoreError::NotFound { .. }) => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }
}

struct Registration {
    controller: Arc<dyn Controller>,
    inputs: Vec<Input>,
    outputs: Vec<Output>,
}

/// Hosts registered controllers and supervises their reconcile loops.
pub struct ControllerRuntime {
    store: Store,
    bus: Bus,
    backoff: BackoffPolicy,
    registrations: Vec<Registration>,
}

impl ControllerRuntime {
    /// Creates an empty runtime over the given store.
    pub fn new(store: Store, bus: Bus, backoff: BackoffPolicy) -> Self {
        Self {
            store,
            bus,
            backoff,
            registrations: Vec::new(),
        }
    }

    /// Registers a controller, verifying name uniqueness and the exclusive
    /// output discipline.
    pub fn register(&mut self, controller: Arc<dyn Controller>) -> Result<(), ControllerError> {
        let name = controller.name();

        if self.registrations.iter().any(|r| r.controller.name() == name) {
            return Err(ControllerError::DuplicateController { name });
        }

        let outputs = controller.outputs();

        for output in &outputs {
            for existing in &self.registrations {
                for other in &existing.outputs {
                    if other.ty != output.ty {
                        continue;
                    }

                    if output.kind == OutputKind::Exclusive || other.kind == OutputKind::Exclusive {
                        return Err(ControllerError::OutputConflict {
                            ty: output.ty,
                            first: existing.controller.name(),
                            second: name,
                        });
                    }
                }
            }
        }

        let inputs = controller.inputs();
        self.registrations.push(Registration {
            controller,
            inputs,
            outputs,
        });

        Ok(())
    }

    /// Verifies that the controller graph (output type -> input type edges)
    /// is acyclic.
    fn verify_acyclic(&self) -> Result<(), ControllerError> {
        let n = self.registrations.len();

        // adjacency: a -> b when some output type of a is an input type of b
        let mut adj: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (a, ra) in self.registrations.iter().enumerate() {
            for (b, rb) in self.registrations.iter().enumerate() {
                if a == b {
                    continue;
                }

                if ra
                    .outputs
                    .iter()
                    .any(|o| rb.inputs.iter().any(|i| i.ty == o.ty))
                {
                    adj[a].push(b);
                }
            }
        }

        // 0 = unvisited, 1 = on stack, 2 = done
        let mut state = vec![0u8; n];
        let mut stack: Vec<usize> = Vec::new();

        fn dfs(
            v: usize,
            adj: &[Vec<usize>],
            state: &mut [u8],
            stack: &mut Vec<usize>,
        ) -> Option<Vec<usize>> {
            state[v] = 1;
            stack.push(v);

            for &w in &adj[v] {
                match state[w] {
                    0 => {
                        if let Some(cycle) = dfs(w, adj, state, stack) {
                            return Some(cycle);
                        }
                    }
                    1 => {
                        let start = stack.iter().position(|&x| x == w).unwrap_or(0);
                        let mut cycle = stack[start..].to_vec();
                        cycle.push(w);
                        return Some(cycle);
                    }
                    _ => {}
                }
            }

            stack.pop();
            state[v] = 2;
            None
        }

        for v in 0..n {
            if state[v] == 0 {
                if let Some(cycle) = dfs(v, &adj, &mut state, &mut stack) {
                    let path = cycle
                        .iter()
                        .map(|&i| self.registrations[i].controller.name())
                        .collect::<Vec<_>>()
                        .join(" -> ");

                    return Err(ControllerError::DependencyCycle { path });
                }
            }
        }

        Ok(())
    }

    /// Runs all registered controllers until the token is cancelled.
    pub async fn run(self, token: CancellationToken) -> Result<(), ControllerError> {
        self.verify_acyclic()?;

        let mut set = JoinSet::new();

        for reg in self.registrations {
            let store = self.store.clone();
            let bus = self.bus.clone();
            let backoff = self.backoff;
            let token = token.clone();

            set.spawn(async move {
                supervise_controller(reg, store, bus, backoff, token).await;
            });
        }

        while set.join_next().await.is_some() {}

        Ok(())
    }
}

/// Runs one controller with wake plumbing and restart-on-error.
async fn supervise_controller(
    reg: Registration,
    store: Store,
    bus: Bus,
    backoff: BackoffPolicy,
    token: CancellationToken,
) {
    let name = reg.controller.name();
    let (wake_tx, wake_rx) = watch::channel(0u64);

    spawn_waker(&store, reg.inputs.clone(), &reg.outputs, wake_tx, &token);

    let mut prev_delay = None;

    loop {
        let mut ctx = ReconcilerContext {
            name,
            store: store.clone(),
            token: token.clone(),
            wake: wake_rx.clone(),
        };
        // Force an initial pass even if no event arrived yet.
        ctx.wake.mark_changed();

        let started = Instant::now();

        match reg.controller.run(&mut ctx).await {
            Ok(()) => {
                debug!(controller = name, "controller exited");
                return;
            }
            Err(e) => {
                if token.is_cancelled() {
                    return;
                }

                if started.elapsed() > backoff.max {
                    prev_delay = None;
                }

                let delay = backoff.next(prev_delay);
                prev_delay = Some(delay);

                warn!(
                    controller = name,
                    error = %e,
                    label = e.as_label(),
                    ?delay,
                    "controller failed, restarting",
                );
                bus.publish(
                    Event::now(EventKind::ControllerRestarted)
                        .with_subject(name)
                        .with_error(e.to_string())
                        .with_delay(delay),
                );

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = token.cancelled() => return,
                }
            }
        }
    }
}

/// Spawns the waker task: filters the store feed down to the controller's
/// inputs and own outputs, bumping the wake counter on each match.
fn spawn_waker(
    store: &Store,
    inputs: Vec<Input>,
    outputs: &[Output],
    wake_tx: watch::Sender<u64>,
    token: &CancellationToken,
) {
    let mut feed = store.subscribe_all();
    let output_types: Vec<&'static str> = outputs.iter().map(|o| o.ty).collect();
    let token = token.clone();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                ev = feed.recv() => match ev {
                    Ok(ev) => {
                        let meta = &ev.resource.meta;
                        let matches_input = inputs.iter().any(|i| {
                            i.namespace == meta.namespace
                                && i.ty == meta.ty
                                && i.id.as_deref().map_or(true, |id| id == meta.id)
                        });
                        let matches_output = output_types.contains(&meta.ty);

                        if matches_input || matches_output {
                            wake_tx.send_modify(|v| *v = v.wrapping_add(1));
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                        // Missed events still warrant a pass.
                        wake_tx.send_modify(|v| *v = v.wrapping_add(1));
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
        }
    });
}

/// Returns `true` when the resource is live (not tearing down).
pub(crate) fn is_running(resource: &Resource) -> bool {
    resource.meta.phase == Phase::Running
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Probe {
        name: &'static str,
        input_ty: &'static str,
        output_ty: &'static str,
        output_kind: OutputKind,
    }

    #[async_trait]
    impl Controller for Probe {
        fn name(&self) -> &'static str {
            self.name
        }

        fn inputs(&self) -> Vec<Input> {
            vec![Input {
                namespace: "test",
                ty: self.input_ty,
                id: None,
                kind: crate::controllers::InputKind::Weak,
            }]
        }

        fn outputs(&self) -> Vec<Output> {
            vec![Output {
                ty: self.output_ty,
                kind: self.output_kind,
            }]
        }

        async fn run(&self, ctx: &mut ReconcilerContext) -> Result<(), ControllerError> {
            ctx.cancelled().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn rejects_duplicate_names() {
        let mut rt = ControllerRuntime::new(Store::default(), Bus::new(16), BackoffPolicy::default());

        rt.register(Arc::new(Probe {
            name: "a",
            input_ty: "A",
            output_ty: "B",
            output_kind: OutputKind::Exclusive,
        }))
        .unwrap();

        let err = rt
            .register(Arc::new(Probe {
                name: "a",
                input_ty: "C",
                output_ty: "D",
                output_kind: OutputKind::Exclusive,
            }))
            .unwrap_err();

        assert!(matches!(err, ControllerError::DuplicateController { .. }));
    }

    #[tokio::test]
    async fn rejects_exclusive_output_conflict() {
        let mut rt = ControllerRuntime::new(Store::default(), Bus::new(16), BackoffPolicy::default());

        rt.register(Arc::new(Probe {
            name: "a",
            input_ty: "A",
            output_ty: "B",
            output_kind: OutputKind::Exclusive,
        }))
        .unwrap();

        let err = rt
            .register(Arc::new(Probe {
                name: "b",
                input_ty: "A",
                output_ty: "B",
                output_kind: OutputKind::Shared,
            }))
            .unwrap_err();

        assert!(matches!(err, ControllerError::OutputConflict { .. }));
    }

    #[tokio::test]
    async fn rejects_cycles() {
        let mut rt = ControllerRuntime::new(Store::default(), Bus::new(16), BackoffPolicy::default());

        rt.register(Arc::new(Probe {
            name: "a",
            input_ty: "B",
            output_ty: "A",
            output_kind: OutputKind::Exclusive,
        }))
        .unwrap();
        rt.register(Arc::new(Probe {
            name: "b",
            input_ty: "A",
            output_ty: "B",
            output_kind: OutputKind::Exclusive,
        }))
        .unwrap();

        let err = rt.verify_acyclic().unwrap_err();
        assert!(matches!(err, ControllerError::DependencyCycle { .. }));
    }
}
