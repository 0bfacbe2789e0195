//! Versioned in-memory resource model.
//!
//! Resources are the atomic unit of reconciled state: metadata (namespace,
//! type, id, version, owner, phase, finalizers) plus a typed spec payload.
//! They live in the [`Store`], organized by namespace and type; controllers
//! read inputs and write outputs through it, and watchers observe every
//! version of a resource in order.
//!
//! ## Files & responsibilities
//! - **meta.rs**: resource [`Metadata`], lifecycle [`Phase`], and the
//!   [`ConfigLayer`] precedence tiers for desired state.
//! - **resource.rs**: [`Resource`] and the typed [`Payload`] enum.
//! - **network.rs**: typed network specs (link, address, route, resolver,
//!   hostname) and their observed-status counterparts.
//! - **store.rs**: the versioned store with CAS updates, finalizer-guarded
//!   destruction, and the broadcast watch feed.

mod meta;
mod network;
mod resource;
mod store;

mod error;

pub use error::StoreError;
pub use meta::{ConfigLayer, Metadata, Phase};
pub use network::{
    AddressSpec, AddressStatus, BondMode, BondSpec, Family, HashPolicy, IpPrefix, LacpRate,
    LinkKind, LinkSpec, LinkStatus, HostnameSpec, ResolverSpec, RouteSpec, RouteStatus, Scope,
    VlanSpec, WireguardPeer, WireguardSpec,
};
pub use resource::{Payload, Resource};
pub use store::{Store, StoreEvent, StoreEventKind, Watch};

/// Namespace holding the authoritative machine configuration.
pub const CONFIG_NAMESPACE: &str = "config";

/// Namespace holding desired-state network specs produced by config
/// controllers and consumed by appliers.
pub const NETWORK_CONFIG_NAMESPACE: &str = "network-config";

/// Namespace holding observed network state written back by appliers.
pub const NETWORK_NAMESPACE: &str = "network";

/// Well-known id of the machine configuration resource.
pub const MACHINE_CONFIG_ID: &str = "v1alpha1";
