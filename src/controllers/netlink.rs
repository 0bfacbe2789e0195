//! # The netlink seam between applier controllers and the kernel.
//!
//! Appliers reconcile desired-state specs against kernel state exclusively
//! through the [`Netlink`] trait:
//!
//! - [`RtNetlink`] (Linux) drives the kernel over route netlink sockets;
//! - [`InMemoryNetlink`] models a kernel in memory, for tests and container
//!   mode where the host owns the network namespace.
//!
//! Errors from the kernel surface as [`NetlinkError::Io`]; appliers treat
//! them as transient (the controller restarts with backoff).

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

use crate::resources::{IpPrefix, LinkKind, LinkSpec, RouteSpec};

/// Errors produced by the netlink seam.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum NetlinkError {
    /// The kernel rejected or failed the operation; retried with backoff.
    #[error("netlink: {0}")]
    Io(String),

    /// The named link does not exist.
    #[error("link not found: {0}")]
    LinkNotFound(String),
}

/// Observed kernel state of one link.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkState {
    /// Interface name.
    pub name: String,
    /// Kernel interface index.
    pub index: u32,
    /// Administrative up flag.
    pub up: bool,
    /// Effective MTU.
    pub mtu: u32,
    /// Link kind (physical for devices without link info).
    pub kind: LinkKind,
    /// Name of the enslaving master, empty when free.
    pub master: String,
}

/// Kernel network operations used by the applier controllers.
#[async_trait]
pub trait Netlink: Send + Sync + 'static {
    /// Lists all links.
    async fn link_list(&self) -> Result<Vec<LinkState>, NetlinkError>;

    /// Converges one link towards its spec: creates logical links that do
    /// not exist, applies MTU, master enslavement, and the admin flag.
    async fn link_ensure(&self, spec: &LinkSpec) -> Result<(), NetlinkError>;

    /// Deletes a (logical) link; a missing link is not an error.
    async fn link_delete(&self, name: &str) -> Result<(), NetlinkError>;

    /// Lists addresses assigned to a link.
    async fn address_list(&self, link: &str) -> Result<Vec<IpPrefix>, NetlinkError>;

    /// Assigns an address to a link; idempotent.
    async fn address_add(&self, link: &str, addr: &IpPrefix) -> Result<(), NetlinkError>;

    /// Removes an address from a link; a missing address is not an error.
    async fn address_del(&self, link: &str, addr: &IpPrefix) -> Result<(), NetlinkError>;

    /// Installs a route; idempotent.
    async fn route_add(&self, spec: &RouteSpec) -> Result<(), NetlinkError>;

    /// Removes a route; a missing route is not an error.
    async fn route_del(&self, spec: &RouteSpec) -> Result<(), NetlinkError>;
}

#[derive(Default)]
struct MemState {
    links: BTreeMap<String, LinkState>,
    addrs: BTreeMap<String, Vec<IpPrefix>>,
    routes: Vec<RouteSpec>,
    next_index: u32,
}

/// In-memory kernel model.
///
/// Seeded with physical links via [`InMemoryNetlink::with_links`]; appliers
/// then mutate it exactly as they would mutate the kernel.
#[derive(Default)]
pub struct InMemoryNetlink {
    state: Mutex<MemState>,
}

impl InMemoryNetlink {
    /// Creates a model with the given pre-existing physical links (plus `lo`).
    pub fn with_links<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let me = Self::default();

        {
            let mut state = me.state.lock().expect("netlink model poisoned");
            state.next_index = 1;

            let mut seed = vec!["lo".to_string()];
            seed.extend(names.into_iter().map(Into::into));

            for name in seed {
                let index = state.next_index;
                state.next_index += 1;
                state.links.insert(
                    name.clone(),
                    LinkState {
                        name,
                        index,
                        up: false,
                        mtu: 1500,
                        kind: LinkKind::Physical,
                        master: String::new(),
                    },
                );
            }
        }

        me
    }

    /// Snapshot of a link, if it exists.
    pub fn link(&self, name: &str) -> Option<LinkState> {
        self.state
            .lock()
            .expect("netlink model poisoned")
            .links
            .get(name)
            .cloned()
    }

    /// Snapshot of the addresses on a link.
    pub fn addresses(&self, link: &str) -> Vec<IpPrefix> {
        self.state
            .lock()
            .expect("netlink model poisoned")
            .addrs
            .get(link)
            .cloned()
            .unwrap_or_default()
    }

    /// Snapshot of installed routes.
    pub fn routes(&self) -> Vec<RouteSpec> {
        self.state
            .lock()
            .expect("netlink model poisoned")
            .routes
            .clone()
    }
}

#[async_trait]
impl Netlink for InMemoryNetlink {
    async fn link_list(&self) -> Result<Vec<LinkState>, NetlinkError> {
        let state = self.state.lock().expect("netlink model poisoned");
        Ok(state.links.values().cloned().collect())
    }

    async fn link_ensure(&self, spec: &LinkSpec) -> Result<(), NetlinkError> {
        let mut state = self.state.lock().expect("netlink model poisoned");

        if !state.links.contains_key(&spec.name) {
            if !spec.logical {
                return Err(NetlinkError::LinkNotFound(spec.name.clone()));
            }

            let index = state.next_index;
            state.next_index += 1;
            state.links.insert(
                spec.name.clone(),
                LinkState {
                    name: spec.name.clone(),
                    index,
                    up: false,
                    mtu: 1500,
                    kind: spec.kind,
                    master: String::new(),
                },
            );
        }

        let link = state.links.get_mut(&spec.name).expect("inserted above");
        if spec.mtu > 0 {
            link.mtu = spec.mtu;
        }
        link.master = spec.master.clone();
        link.up = spec.up;

        Ok(())
    }

    async fn link_delete(&self, name: &str) -> Result<(), NetlinkError> {
        let mut state = self.state.lock().expect("netlink model poisoned");
        state.links.remove(name);
        state.addrs.remove(name);
        Ok(())
    }

    async fn address_list(&self, link: &str) -> Result<Vec<IpPrefix>, NetlinkError> {
        let state = self.state.lock().expect("netlink model poisoned");
        Ok(state.addrs.get(link).cloned().unwrap_or_default())
    }

    async fn address_add(&self, link: &str, addr: &IpPrefix) -> Result<(), NetlinkError> {
        let mut state = self.state.lock().expect("netlink model poisoned");

        if !state.links.contains_key(link) {
            return Err(NetlinkError::LinkNotFound(link.to_string()));
        }

        let addrs = state.addrs.entry(link.to_string()).or_default();
        if !addrs.contains(addr) {
            addrs.push(*addr);
        }

        Ok(())
    }

    async fn address_del(&self, link: &str, addr: &IpPrefix) -> Result<(), NetlinkError> {
        let mut state = self.state.lock().expect("netlink model poisoned");

        if let Some(addrs) = state.addrs.get_mut(link) {
            addrs.retain(|a| a != addr);
        }

        Ok(())
    }

    async fn route_add(&self, spec: &RouteSpec) -> Result<(), NetlinkError> {
        let mut state = self.state.lock().expect("netlink model poisoned");

        if !state.routes.iter().any(|r| r.logical_id() == spec.logical_id()) {
            state.routes.push(spec.clone());
        }

        Ok(())
    }

    async fn route_del(&self, spec: &RouteSpec) -> Result<(), NetlinkError> {
        let mut state = self.state.lock().expect("netlink model poisoned");
        state.routes.retain(|r| r.logical_id() != spec.logical_id());
        Ok(())
    }
}

#[cfg(target_os = "linux")]
pub use sys::RtNetlink;

#[cfg(target_os = "linux")]
mod sys {
    //! Route netlink backend.

    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    use async_trait::async_trait;
    use futures::TryStreamExt;
    use netlink_packet_route::address::AddressAttribute;
    use netlink_packet_route::link::{InfoKind, LinkAttribute, LinkFlags, LinkInfo};
    use rtnetlink::{
        Handle, LinkBond, LinkDummy, LinkUnspec, LinkVlan, LinkWireguard, RouteMessageBuilder,
    };

    use super::{LinkState, Netlink, NetlinkError};
    use crate::resources::{Family, IpPrefix, LinkKind, LinkSpec, RouteSpec};

    /// Kernel-backed [`Netlink`] implementation over an rtnetlink socket.
    pub struct RtNetlink {
        handle: Handle,
    }

    impl RtNetlink {
        /// Opens a route netlink connection; the connection task is spawned
        /// onto the current runtime.
        pub fn connect() -> Result<Self, NetlinkError> {
            let (connection, handle, _messages) =
                rtnetlink::new_connection().map_err(|e| NetlinkError::Io(e.to_string()))?;

            tokio::spawn(connection);

            Ok(Self { handle })
        }

        async fn link_index(&self, name: &str) -> Result<u32, NetlinkError> {
            for link in self.link_list().await? {
                if link.name == name {
                    return Ok(link.index);
                }
            }

            Err(NetlinkError::LinkNotFound(name.to_string()))
        }
    }

    fn io_err(e: rtnetlink::Error) -> NetlinkError {
        NetlinkError::Io(e.to_string())
    }

    #[async_trait]
    impl Netlink for RtNetlink {
        async fn link_list(&self) -> Result<Vec<LinkState>, NetlinkError> {
            let mut links = self.handle.link().get().execute();
            let mut out = Vec::new();
            let mut masters: Vec<(String, u32)> = Vec::new();

            while let Some(msg) = links.try_next().await.map_err(io_err)? {
                let mut state = LinkState {
                    name: String::new(),
                    index: msg.header.index,
                    up: msg.header.flags.contains(LinkFlags::Up),
                    mtu: 0,
                    kind: LinkKind::Physical,
                    master: String::new(),
                };
                let mut master_index = 0u32;

                for attr in &msg.attributes {
                    match attr {
                        LinkAttribute::IfName(name) => state.name = name.clone(),
                        LinkAttribute::Mtu(mtu) => state.mtu = *mtu,
                        LinkAttribute::Controller(idx) => master_index = *idx,
                        LinkAttribute::LinkInfo(infos) => {
                            for info in infos {
                                if let LinkInfo::Kind(kind) = info {
                                    state.kind = match kind {
                                        InfoKind::Bond => LinkKind::Bond,
                                        InfoKind::Vlan => LinkKind::Vlan,
                                        InfoKind::Wireguard => LinkKind::Wireguard,
                                        InfoKind::Dummy => LinkKind::Dummy,
                                        _ => LinkKind::Physical,
                                    };
                                }
                            }
                        }
                        _ => {}
                    }
                }

                if master_index != 0 {
                    masters.push((state.name.clone(), master_index));
                }

                out.push(state);
            }

            // Resolve master indices to names.
            for (name, master_index) in masters {
                let master_name = out
                    .iter()
                    .find(|l| l.index == master_index)
                    .map(|l| l.name.clone())
                    .unwrap_or_default();

                if let Some(slave) = out.iter_mut().find(|l| l.name == name) {
                    slave.master = master_name;
                }
            }

            Ok(out)
        }

        async fn link_ensure(&self, spec: &LinkSpec) -> Result<(), NetlinkError> {
            let existing = self.link_index(&spec.name).await;

            let index = match existing {
                Ok(index) => index,
                Err(NetlinkError::LinkNotFound(_)) if spec.logical => {
                    let message = match spec.kind {
                        LinkKind::Vlan => {
                            let vid = spec.vlan.as_ref().map(|v| v.vid).unwrap_or_default();
                            let parent = self.link_index(&spec.parent).await?;
                            LinkVlan::new(&spec.name, parent, vid).build()
                        }
                        LinkKind::Bond => LinkBond::new(&spec.name).build(),
                        LinkKind::Wireguard => LinkWireguard::new(&spec.name).build(),
                        LinkKind::Dummy => LinkDummy::new(&spec.name).build(),
                        LinkKind::Physical => {
                            return Err(NetlinkError::LinkNotFound(spec.name.clone()));
                        }
                    };

                    self.handle
                        .link()
                        .add(message)
                        .execute()
                        .await
                        .map_err(io_err)?;

                    self.link_index(&spec.name).await?
                }
                Err(e) => return Err(e),
            };

            if spec.mtu > 0 {
                self.handle
                    .link()
                    .set(LinkUnspec::new_with_index(index).mtu(spec.mtu).build())
                    .execute()
                    .await
                    .map_err(io_err)?;
            }

            if !spec.master.is_empty() {
                let master = self.link_index(&spec.master).await?;
                self.handle
                    .link()
                    .set(LinkUnspec::new_with_index(index).controller(master).build())
                    .execute()
                    .await
                    .map_err(io_err)?;
            }

            let builder = LinkUnspec::new_with_index(index);
            let builder = if spec.up { builder.up() } else { builder.down() };
            self.handle
                .link()
                .set(builder.build())
                .execute()
                .await
                .map_err(io_err)?;

            Ok(())
        }

        async fn link_delete(&self, name: &str) -> Result<(), NetlinkError> {
            match self.link_index(name).await {
                Ok(index) => self.handle.link().del(index).execute().await.map_err(io_err),
                Err(NetlinkError::LinkNotFound(_)) => Ok(()),
                Err(e) => Err(e),
            }
        }

        async fn address_list(&self, link: &str) -> Result<Vec<IpPrefix>, NetlinkError> {
            let index = self.link_index(link).await?;
            let mut addrs = self
                .handle
                .address()
                .get()
                .set_link_index_filter(index)
                .execute();

            let mut out = Vec::new();
            while let Some(msg) = addrs.try_next().await.map_err(io_err)? {
                for attr in &msg.attributes {
                    if let AddressAttribute::Address(addr) = attr {
                        out.push(IpPrefix::new(*addr, msg.header.prefix_len));
                    }
                }
            }

            Ok(out)
        }

        async fn address_add(&self, link: &str, addr: &IpPrefix) -> Result<(), NetlinkError> {
            let index = self.link_index(link).await?;

            match self
                .handle
                .address()
                .add(index, addr.addr(), addr.bits())
                .execute()
                .await
            {
                Ok(()) => Ok(()),
                // EEXIST from the kernel is convergence, not failure.
                Err(e) if e.to_string().contains("File exists") => Ok(()),
                Err(e) => Err(io_err(e)),
            }
        }

        async fn address_del(&self, link: &str, addr: &IpPrefix) -> Result<(), NetlinkError> {
            let index = self.link_index(link).await?;
            let mut addrs = self
                .handle
                .address()
                .get()
                .set_link_index_filter(index)
                .execute();

            while let Some(msg) = addrs.try_next().await.map_err(io_err)? {
                if msg.header.prefix_len != addr.bits() {
                    continue;
                }

                let matches = msg.attributes.iter().any(
                    |attr| matches!(attr, AddressAttribute::Address(a) if *a == addr.addr()),
                );

                if matches {
                    self.handle.address().del(msg).execute().await.map_err(io_err)?;
                    return Ok(());
                }
            }

            Ok(())
        }

        async fn route_add(&self, spec: &RouteSpec) -> Result<(), NetlinkError> {
            let index = self.link_index(&spec.out_link).await?;

            let message = match spec.family {
                Family::Inet4 => {
                    let mut builder =
                        RouteMessageBuilder::<Ipv4Addr>::new().output_interface(index);

                    if let Some(dest) = spec.destination {
                        if let IpAddr::V4(v4) = dest.addr() {
                            builder = builder.destination_prefix(v4, dest.bits());
                        }
                    }
                    if let Some(IpAddr::V4(gw)) = spec.gateway {
                        builder = builder.gateway(gw);
                    }
                    if spec.priority > 0 {
                        builder = builder.priority(spec.priority);
                    }

                    builder.build()
                }
                Family::Inet6 => {
                    let mut builder =
                        RouteMessageBuilder::<Ipv6Addr>::new().output_interface(index);

                    if let Some(dest) = spec.destination {
                        if let IpAddr::V6(v6) = dest.addr() {
                            builder = builder.destination_prefix(v6, dest.bits());
                        }
                    }
                    if let Some(IpAddr::V6(gw)) = spec.gateway {
                        builder = builder.gateway(gw);
                    }
                    if spec.priority > 0 {
                        builder = builder.priority(spec.priority);
                    }

                    builder.build()
                }
            };

            match self.handle.route().add(message).execute().await {
                Ok(()) => Ok(()),
                Err(e) if e.to_string().contains("File exists") => Ok(()),
                Err(e) => Err(io_err(e)),
            }
        }

        async fn route_del(&self, spec: &RouteSpec) -> Result<(), NetlinkError> {
            let filter = match spec.family {
                Family::Inet4 => RouteMessageBuilder::<Ipv4Addr>::new().build(),
                Family::Inet6 => RouteMessageBuilder::<Ipv6Addr>::new().build(),
            };

            let mut routes = self.handle.route().get(filter).execute();
            let want_len = spec.destination.map(|d| d.bits()).unwrap_or(0);

            while let Some(msg) = routes.try_next().await.map_err(io_err)? {
                if msg.header.destination_prefix_length != want_len {
                    continue;
                }

                self.handle.route().del(msg).execute().await.map_err(io_err)?;
                return Ok(());
            }

            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::ConfigLayer;

    #[tokio::test]
    async fn model_creates_logical_links_only() {
        let nl = InMemoryNetlink::with_links(["eth0"]);

        // A physical link that does not exist cannot be ensured.
        let ghost = LinkSpec::up("eth7", ConfigLayer::MachineConfig);
        assert!(matches!(
            nl.link_ensure(&ghost).await,
            Err(NetlinkError::LinkNotFound(_))
        ));

        // A logical one is created on demand.
        let mut vlan = LinkSpec::up("eth0.24", ConfigLayer::MachineConfig);
        vlan.logical = true;
        vlan.kind = LinkKind::Vlan;
        vlan.parent = "eth0".into();
        nl.link_ensure(&vlan).await.unwrap();

        let created = nl.link("eth0.24").unwrap();
        assert!(created.up);
        assert_eq!(created.kind, LinkKind::Vlan);
    }

    #[tokio::test]
    async fn model_addresses_are_idempotent() {
        let nl = InMemoryNetlink::with_links(["eth0"]);
        let addr: IpPrefix = "10.0.0.1/24".parse().unwrap();

        nl.address_add("eth0", &addr).await.unwrap();
        nl.address_add("eth0", &addr).await.unwrap();
        assert_eq!(nl.addresses("eth0").len(), 1);

        nl.address_del("eth0", &addr).await.unwrap();
        nl.address_del("eth0", &addr).await.unwrap();
        assert!(nl.addresses("eth0").is_empty());
    }
}
