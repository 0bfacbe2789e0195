//! Reconciliation controller framework.
//!
//! Controllers derive declarative output resources from declarative input
//! resources. Each controller runs in its own task, wakes on coalesced input
//! events, and converges its outputs through
//! [`ReconcilerContext::reconcile_outputs`]: produced resources are upserted
//! (skipping no-op writes so a fixed point is reachable), resources no longer
//! produced are torn down and destroyed once their finalizers drain.
//!
//! ## Files & responsibilities
//! - **runtime.rs**: [`ControllerRuntime`] (registration, exclusive-output
//!   and cycle verification, per-controller restart loops) and
//!   [`ReconcilerContext`] (the store facade handed to `run`).
//! - **link_config.rs / address_config.rs / route_config.rs /
//!   resolver_config.rs / hostname_config.rs**: config controllers that
//!   translate machine config and kernel cmdline into layered desired-state
//!   specs.
//! - **link_spec.rs / address_spec.rs / route_spec.rs**: applier controllers
//!   that reconcile the winning specs against kernel state through
//!   [`Netlink`] and write back observed status.
//! - **netlink.rs**: the [`Netlink`] seam with the Linux rtnetlink backend
//!   and an in-memory implementation for tests and container mode.

mod address_config;
mod address_spec;
mod error;
mod hostname_config;
mod link_config;
mod link_spec;
mod netlink;
mod resolver_config;
mod route_config;
mod route_spec;
mod runtime;

pub use address_config::AddressConfigController;
pub use address_spec::AddressSpecController;
pub use error::ControllerError;
pub use hostname_config::HostnameConfigController;
pub use link_config::LinkConfigController;
pub use link_spec::LinkSpecController;
pub use netlink::{InMemoryNetlink, LinkState, Netlink, NetlinkError};
pub use resolver_config::ResolverConfigController;
pub use route_config::RouteConfigController;
pub use route_spec::RouteSpecController;
pub use runtime::{ControllerRuntime, ReconcilerContext};

use std::sync::Arc;

use async_trait::async_trait;

use crate::machine::MachineConfig;
use crate::resources::{Resource, CONFIG_NAMESPACE, MACHINE_CONFIG_ID};

/// How a controller depends on an input resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    /// Blocks controller teardown until the input is released.
    Strong,
    /// Plain read dependency.
    Weak,
    /// The controller also wants tearing-down inputs, so it can release
    /// finalizers.
    DestroyReady,
}

/// A declared input: `(namespace, type, id?)` plus the dependency kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Input {
    /// Namespace of the input resources.
    pub namespace: &'static str,
    /// Type of the input resources.
    pub ty: &'static str,
    /// Restrict to a single id, or watch the whole type.
    pub id: Option<String>,
    /// Dependency kind.
    pub kind: InputKind,
}

/// Whether an output type admits other writers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    /// No other controller may write this type.
    Exclusive,
    /// Multiple controllers may write this type; each resource still has
    /// exactly one owner.
    Shared,
}

/// A declared output type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Output {
    /// Type of the produced resources.
    pub ty: &'static str,
    /// Sharing discipline.
    pub kind: OutputKind,
}

/// Reads the machine configuration, treating an absent or tearing-down
/// document as "not yet available" (a missing precondition, not an error).
pub(crate) async fn read_machine_config(
    ctx: &ReconcilerContext,
) -> Result<Option<Arc<MachineConfig>>, ControllerError> {
    match ctx
        .get(CONFIG_NAMESPACE, Resource::MACHINE_CONFIG, MACHINE_CONFIG_ID)
        .await
    {
        Ok(res) if runtime::is_running(&res) => Ok(res.as_machine_config().cloned()),
        Ok(_) => Ok(None),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Picks the lexicographically first non-loopback interface.
pub(crate) fn first_nonloopback(interfaces: &[String]) -> Option<String> {
    let mut sorted: Vec<&String> = interfaces.iter().collect();
    sorted.sort();

    sorted.into_iter().find(|n| n.as_str() != "lo").cloned()
}

/// A reconciliation controller.
///
/// `run` is long-lived: it must wait on [`ReconcilerContext::changed`],
/// re-reconcile on each wake, and return only on cancellation. Missing inputs
/// and store conflicts are handled inside the pass; any other error restarts
/// the controller after backoff.
#[async_trait]
pub trait Controller: Send + Sync + 'static {
    /// Unique identifier, used as the `owner` of produced resources.
    fn name(&self) -> &'static str;

    /// Input resources the controller reconciles on.
    fn inputs(&self) -> Vec<Input>;

    /// Output types the controller produces.
    fn outputs(&self) -> Vec<Output>;

    /// The reconciliation loop.
    async fn run(&self, ctx: &mut ReconcilerContext) -> Result<(), ControllerError>;
}
