//! The [`Resource`] unit: metadata plus a typed spec payload.

use std::sync::Arc;

use crate::machine::MachineConfig;
use crate::resources::network::{
    AddressSpec, AddressStatus, HostnameSpec, LinkSpec, LinkStatus, ResolverSpec, RouteSpec,
    RouteStatus,
};
use crate::resources::Metadata;

/// Typed spec payloads the core manipulates.
///
/// The variant determines the resource type name; the store indexes resources
/// by `(namespace, type, id)` so payloads of different types never collide.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// The authoritative machine configuration document.
    MachineConfig(Arc<MachineConfig>),
    /// Desired link state.
    Link(LinkSpec),
    /// Desired address on a link.
    Address(AddressSpec),
    /// Desired route.
    Route(RouteSpec),
    /// Desired DNS resolvers.
    Resolver(ResolverSpec),
    /// Desired hostname.
    Hostname(HostnameSpec),
    /// Observed link state written back by the applier.
    LinkStatus(LinkStatus),
    /// Observed address state written back by the applier.
    AddressStatus(AddressStatus),
    /// Observed route state written back by the applier.
    RouteStatus(RouteStatus),
}

impl Payload {
    /// Resource type name of the payload.
    pub fn type_name(&self) -> &'static str {
        match self {
            Payload::MachineConfig(_) => Resource::MACHINE_CONFIG,
            Payload::Link(_) => Resource::LINK_SPEC,
            Payload::Address(_) => Resource::ADDRESS_SPEC,
            Payload::Route(_) => Resource::ROUTE_SPEC,
            Payload::Resolver(_) => Resource::RESOLVER_SPEC,
            Payload::Hostname(_) => Resource::HOSTNAME_SPEC,
            Payload::LinkStatus(_) => Resource::LINK_STATUS,
            Payload::AddressStatus(_) => Resource::ADDRESS_STATUS,
            Payload::RouteStatus(_) => Resource::ROUTE_STATUS,
        }
    }
}

/// The atomic unit of reconciled state.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    /// Identity, versioning, ownership, phase, finalizers.
    pub meta: Metadata,
    /// The typed spec.
    pub spec: Payload,
}

impl Resource {
    /// Type name of machine configuration resources.
    pub const MACHINE_CONFIG: &'static str = "MachineConfig";
    /// Type name of desired link state resources.
    pub const LINK_SPEC: &'static str = "LinkSpec";
    /// Type name of desired address resources.
    pub const ADDRESS_SPEC: &'static str = "AddressSpec";
    /// Type name of desired route resources.
    pub const ROUTE_SPEC: &'static str = "RouteSpec";
    /// Type name of desired resolver resources.
    pub const RESOLVER_SPEC: &'static str = "ResolverSpec";
    /// Type name of desired hostname resources.
    pub const HOSTNAME_SPEC: &'static str = "HostnameSpec";
    /// Type name of observed link state resources.
    pub const LINK_STATUS: &'static str = "LinkStatus";
    /// Type name of observed address state resources.
    pub const ADDRESS_STATUS: &'static str = "AddressStatus";
    /// Type name of observed route state resources.
    pub const ROUTE_STATUS: &'static str = "RouteStatus";

    /// Creates a new, unversioned resource; the type name derives from the
    /// payload.
    pub fn new(namespace: impl Into<String>, id: impl Into<String>, spec: Payload) -> Self {
        let ty = spec.type_name();

        Self {
            meta: Metadata::new(namespace, ty, id),
            spec,
        }
    }

    /// The machine config payload, if this resource carries one.
    pub fn as_machine_config(&self) -> Option<&Arc<MachineConfig>> {
        match &self.spec {
            Payload::MachineConfig(cfg) => Some(cfg),
            _ => None,
        }
    }

    /// The link spec payload, if this resource carries one.
    pub fn as_link(&self) -> Option<&LinkSpec> {
        match &self.spec {
            Payload::Link(spec) => Some(spec),
            _ => None,
        }
    }

    /// The address spec payload, if this resource carries one.
    pub fn as_address(&self) -> Option<&AddressSpec> {
        match &self.spec {
            Payload::Address(spec) => Some(spec),
            _ => None,
        }
    }

    /// The route spec payload, if this resource carries one.
    pub fn as_route(&self) -> Option<&RouteSpec> {
        match &self.spec {
            Payload::Route(spec) => Some(spec),
            _ => None,
        }
    }

    /// The resolver spec payload, if this resource carries one.
    pub fn as_resolver(&self) -> Option<&ResolverSpec> {
        match &self.spec {
            Payload::Resolver(spec) => Some(spec),
            _ => None,
        }
    }

    /// The hostname spec payload, if this resource carries one.
    pub fn as_hostname(&self) -> Option<&HostnameSpec> {
        match &self.spec {
            Payload::Hostname(spec) => Some(spec),
            _ => None,
        }
    }
}
