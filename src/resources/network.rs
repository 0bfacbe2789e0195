//! Typed network specs: the desired-state payloads produced by config
//! controllers and consumed by appliers, plus the observed-status payloads
//! appliers write back.
//!
//! Logical IDs follow the kernel naming: an address spec for `10.0.0.1/8` on
//! `eth0.24` has logical id `eth0.24/10.0.0.1/8`; prefixed with the config
//! layer it becomes the resource id `configuration/eth0.24/10.0.0.1/8`.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::resources::ConfigLayer;

/// Address family of a prefix or route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    /// IPv4.
    Inet4,
    /// IPv6.
    Inet6,
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::Inet4 => f.write_str("inet4"),
            Family::Inet6 => f.write_str("inet6"),
        }
    }
}

/// Address scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Valid everywhere.
    Global,
    /// Valid only on this link.
    Link,
    /// Valid only inside this host (loopback).
    Host,
}

/// An IP address with a prefix length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpPrefix {
    addr: IpAddr,
    bits: u8,
}

impl IpPrefix {
    /// Creates a prefix, clamping `bits` to the family's maximum.
    pub fn new(addr: IpAddr, bits: u8) -> Self {
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };

        Self {
            addr,
            bits: bits.min(max),
        }
    }

    /// Creates a host prefix (/32 or /128).
    pub fn host(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Self::new(addr, 32),
            IpAddr::V6(_) => Self::new(addr, 128),
        }
    }

    /// The address part.
    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    /// The prefix length.
    pub fn bits(&self) -> u8 {
        self.bits
    }

    /// The address family.
    pub fn family(&self) -> Family {
        match self.addr {
            IpAddr::V4(_) => Family::Inet4,
            IpAddr::V6(_) => Family::Inet6,
        }
    }
}

impl fmt::Display for IpPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.bits)
    }
}

impl FromStr for IpPrefix {
    type Err = String;

    /// Parses `addr/bits`; a bare address becomes a host prefix.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((addr, bits)) => {
                let addr: IpAddr = addr.parse().map_err(|_| format!("invalid address: {s}"))?;
                let bits: u8 = bits.parse().map_err(|_| format!("invalid prefix length: {s}"))?;

                let max = match addr {
                    IpAddr::V4(_) => 32,
                    IpAddr::V6(_) => 128,
                };
                if bits > max {
                    return Err(format!("prefix length out of range: {s}"));
                }

                Ok(Self { addr, bits })
            }
            None => {
                let addr: IpAddr = s.parse().map_err(|_| format!("invalid address: {s}"))?;
                Ok(Self::host(addr))
            }
        }
    }
}

/// Kind of a logical link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkKind {
    /// A physical (or externally-created) device.
    #[default]
    Physical,
    /// Bond master.
    Bond,
    /// 802.1Q VLAN subdevice.
    Vlan,
    /// Wireguard tunnel device.
    Wireguard,
    /// Dummy device.
    Dummy,
}

impl LinkKind {
    /// The kernel `IFLA_INFO_KIND` string for logical links.
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkKind::Physical => "",
            LinkKind::Bond => "bond",
            LinkKind::Vlan => "vlan",
            LinkKind::Wireguard => "wireguard",
            LinkKind::Dummy => "dummy",
        }
    }
}

/// Bond operating mode, by kernel name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BondMode {
    /// Round-robin.
    #[default]
    BalanceRR,
    /// Active-backup.
    ActiveBackup,
    /// XOR of hardware addresses.
    BalanceXOR,
    /// Broadcast on all slaves.
    Broadcast,
    /// IEEE 802.3ad dynamic link aggregation.
    Lacp,
    /// Adaptive transmit load balancing.
    BalanceTLB,
    /// Adaptive load balancing.
    BalanceALB,
}

impl BondMode {
    /// Resolves a bond mode by its kernel name.
    pub fn by_name(name: &str) -> Result<Self, String> {
        match name {
            "balance-rr" => Ok(BondMode::BalanceRR),
            "active-backup" => Ok(BondMode::ActiveBackup),
            "balance-xor" => Ok(BondMode::BalanceXOR),
            "broadcast" => Ok(BondMode::Broadcast),
            "802.3ad" => Ok(BondMode::Lacp),
            "balance-tlb" => Ok(BondMode::BalanceTLB),
            "balance-alb" => Ok(BondMode::BalanceALB),
            _ => Err(format!("unknown bond mode: {name}")),
        }
    }
}

/// Bond transmit hash policy, by kernel name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HashPolicy {
    /// Layer 2 only.
    #[default]
    Layer2,
    /// Layer 3 + 4.
    Layer34,
    /// Layer 2 + 3.
    Layer23,
    /// Encapsulated layer 2 + 3.
    Encap23,
    /// Encapsulated layer 3 + 4.
    Encap34,
}

impl HashPolicy {
    /// Resolves a hash policy by its kernel name; empty selects the default.
    pub fn by_name(name: &str) -> Result<Self, String> {
        match name {
            "" | "layer2" => Ok(HashPolicy::Layer2),
            "layer3+4" => Ok(HashPolicy::Layer34),
            "layer2+3" => Ok(HashPolicy::Layer23),
            "encap2+3" => Ok(HashPolicy::Encap23),
            "encap3+4" => Ok(HashPolicy::Encap34),
            _ => Err(format!("unknown hash policy: {name}")),
        }
    }
}

/// LACPDU transmit rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LacpRate {
    /// Every 30 seconds.
    #[default]
    Slow,
    /// Every second.
    Fast,
}

impl LacpRate {
    /// Resolves a LACP rate by name; empty selects the default.
    pub fn by_name(name: &str) -> Result<Self, String> {
        match name {
            "" | "slow" => Ok(LacpRate::Slow),
            "fast" => Ok(LacpRate::Fast),
            _ => Err(format!("unknown LACP rate: {name}")),
        }
    }
}

/// Bond master parameters carried by the bond link spec.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BondSpec {
    /// Operating mode.
    pub mode: BondMode,
    /// Transmit hash policy.
    pub hash_policy: HashPolicy,
    /// LACPDU rate (802.3ad only).
    pub lacp_rate: LacpRate,
    /// MII link monitoring interval, ms.
    pub mii_mon: u32,
    /// Delay before enabling a slave after link recovery, ms.
    pub up_delay: u32,
    /// Delay before disabling a slave after link failure, ms.
    pub down_delay: u32,
    /// Minimum number of active slaves.
    pub min_links: u32,
}

/// VLAN parameters carried by a VLAN subdevice link spec.
#[derive(Debug, Clone, PartialEq)]
pub struct VlanSpec {
    /// 802.1Q VLAN id.
    pub vid: u16,
}

/// A single wireguard peer.
#[derive(Debug, Clone, PartialEq)]
pub struct WireguardPeer {
    /// Peer public key, base64.
    pub public_key: String,
    /// Peer endpoint, `host:port`.
    pub endpoint: String,
    /// Keepalive interval in seconds; 0 disables.
    pub persistent_keepalive: u64,
    /// Networks routed to this peer.
    pub allowed_ips: Vec<IpPrefix>,
}

/// Wireguard device parameters.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WireguardSpec {
    /// Device private key, base64.
    pub private_key: String,
    /// UDP listen port; 0 picks an ephemeral port.
    pub listen_port: u16,
    /// Firewall mark applied to tunnel traffic.
    pub firewall_mark: u32,
    /// Configured peers.
    pub peers: Vec<WireguardPeer>,
}

/// Desired state of a network link.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkSpec {
    /// Kernel interface name.
    pub name: String,
    /// Whether the link must be created (bond, VLAN, wireguard, dummy) as
    /// opposed to matched against an existing device.
    pub logical: bool,
    /// Administrative up.
    pub up: bool,
    /// MTU; 0 leaves the kernel default untouched.
    pub mtu: u32,
    /// Link kind for logical links.
    pub kind: LinkKind,
    /// Parent device name (VLAN subdevices).
    pub parent: String,
    /// Bond master name when this link is enslaved.
    pub master: String,
    /// VLAN parameters, when `kind` is [`LinkKind::Vlan`].
    pub vlan: Option<VlanSpec>,
    /// Bond master parameters, when `kind` is [`LinkKind::Bond`].
    pub bond: Option<BondSpec>,
    /// Wireguard parameters, when `kind` is [`LinkKind::Wireguard`].
    pub wireguard: Option<WireguardSpec>,
    /// Precedence tier this spec originated from.
    pub layer: ConfigLayer,
}

impl LinkSpec {
    /// A plain up physical link at the given layer.
    pub fn up(name: impl Into<String>, layer: ConfigLayer) -> Self {
        Self {
            name: name.into(),
            logical: false,
            up: true,
            mtu: 0,
            kind: LinkKind::Physical,
            parent: String::new(),
            master: String::new(),
            vlan: None,
            bond: None,
            wireguard: None,
            layer,
        }
    }

    /// The logical id (the link name).
    pub fn logical_id(&self) -> String {
        self.name.clone()
    }

    /// The layered resource id.
    pub fn id(&self) -> String {
        self.layer.layered_id(self.logical_id())
    }
}

/// Desired IP address on a link.
#[derive(Debug, Clone, PartialEq)]
pub struct AddressSpec {
    /// Address and prefix length.
    pub address: IpPrefix,
    /// Kernel interface the address lives on.
    pub link_name: String,
    /// Address family.
    pub family: Family,
    /// Address scope.
    pub scope: Scope,
    /// Precedence tier this spec originated from.
    pub layer: ConfigLayer,
}

impl AddressSpec {
    /// Creates a global-scope address spec.
    pub fn new(address: IpPrefix, link_name: impl Into<String>, layer: ConfigLayer) -> Self {
        let family = address.family();

        Self {
            address,
            link_name: link_name.into(),
            family,
            scope: Scope::Global,
            layer,
        }
    }

    /// The logical id: `<link>/<address>/<bits>`.
    pub fn logical_id(&self) -> String {
        format!("{}/{}", self.link_name, self.address)
    }

    /// The layered resource id.
    pub fn id(&self) -> String {
        self.layer.layered_id(self.logical_id())
    }
}

/// Desired route.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteSpec {
    /// Address family.
    pub family: Family,
    /// Destination prefix; `None` is the default route.
    pub destination: Option<IpPrefix>,
    /// Gateway address, if any.
    pub gateway: Option<IpAddr>,
    /// Output interface.
    pub out_link: String,
    /// Route priority (metric).
    pub priority: u32,
    /// Precedence tier this spec originated from.
    pub layer: ConfigLayer,
}

impl RouteSpec {
    /// The logical id: `<family>/<dest|default>/<gateway|->/<priority>`.
    pub fn logical_id(&self) -> String {
        let dest = self
            .destination
            .map(|d| d.to_string())
            .unwrap_or_else(|| "default".to_string());
        let gw = self
            .gateway
            .map(|g| g.to_string())
            .unwrap_or_else(|| "-".to_string());

        format!("{}/{}/{}/{}", self.family, dest, gw, self.priority)
    }

    /// The layered resource id.
    pub fn id(&self) -> String {
        self.layer.layered_id(self.logical_id())
    }
}

/// Desired DNS resolver set.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolverSpec {
    /// Resolver addresses, in priority order.
    pub servers: Vec<IpAddr>,
    /// Precedence tier this spec originated from.
    pub layer: ConfigLayer,
}

impl ResolverSpec {
    /// The logical id (a single resolver set per layer).
    pub fn logical_id(&self) -> String {
        "resolvers".to_string()
    }

    /// The layered resource id.
    pub fn id(&self) -> String {
        self.layer.layered_id(self.logical_id())
    }
}

/// Desired hostname.
#[derive(Debug, Clone, PartialEq)]
pub struct HostnameSpec {
    /// Host part.
    pub hostname: String,
    /// Domain part, possibly empty.
    pub domainname: String,
    /// Precedence tier this spec originated from.
    pub layer: ConfigLayer,
}

impl HostnameSpec {
    /// Splits a fully-qualified name into host and domain parts.
    pub fn parse(fqdn: &str, layer: ConfigLayer) -> Self {
        match fqdn.split_once('.') {
            Some((host, domain)) => Self {
                hostname: host.to_string(),
                domainname: domain.to_string(),
                layer,
            },
            None => Self {
                hostname: fqdn.to_string(),
                domainname: String::new(),
                layer,
            },
        }
    }

    /// The fully-qualified name.
    pub fn fqdn(&self) -> String {
        if self.domainname.is_empty() {
            self.hostname.clone()
        } else {
            format!("{}.{}", self.hostname, self.domainname)
        }
    }

    /// The logical id (a single hostname per layer).
    pub fn logical_id(&self) -> String {
        "hostname".to_string()
    }

    /// The layered resource id.
    pub fn id(&self) -> String {
        self.layer.layered_id(self.logical_id())
    }
}

/// Observed state of a link, written back by the applier.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkStatus {
    /// Kernel interface name.
    pub name: String,
    /// Kernel interface index, 0 when not yet resolved.
    pub index: u32,
    /// Operational up.
    pub up: bool,
    /// Effective MTU.
    pub mtu: u32,
    /// Link kind.
    pub kind: LinkKind,
    /// Layer of the spec that produced this state.
    pub layer: ConfigLayer,
}

/// Observed state of an address, written back by the applier.
#[derive(Debug, Clone, PartialEq)]
pub struct AddressStatus {
    /// Address and prefix length.
    pub address: IpPrefix,
    /// Kernel interface the address lives on.
    pub link_name: String,
    /// Layer of the spec that produced this state.
    pub layer: ConfigLayer,
}

/// Observed state of a route, written back by the applier.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteStatus {
    /// Address family.
    pub family: Family,
    /// Destination prefix; `None` is the default route.
    pub destination: Option<IpPrefix>,
    /// Gateway address, if any.
    pub gateway: Option<IpAddr>,
    /// Output interface.
    pub out_link: String,
    /// Route priority (metric).
    pub priority: u32,
    /// Layer of the spec that produced this state.
    pub layer: ConfigLayer,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_parse_and_display() {
        let p: IpPrefix = "192.168.0.24/28".parse().unwrap();
        assert_eq!(p.to_string(), "192.168.0.24/28");
        assert_eq!(p.family(), Family::Inet4);

        let p6: IpPrefix = "2001:470:6d:30e::1/64".parse().unwrap();
        assert_eq!(p6.to_string(), "2001:470:6d:30e::1/64");
        assert_eq!(p6.family(), Family::Inet6);

        let host: IpPrefix = "172.20.0.2".parse().unwrap();
        assert_eq!(host.bits(), 32);

        assert!("300.0.0.1/8".parse::<IpPrefix>().is_err());
        assert!("10.0.0.1/33".parse::<IpPrefix>().is_err());
    }

    #[test]
    fn address_spec_ids() {
        let spec = AddressSpec::new(
            "127.0.0.1/8".parse().unwrap(),
            "lo",
            ConfigLayer::Default,
        );
        assert_eq!(spec.id(), "default/lo/127.0.0.1/8");

        let spec = AddressSpec::new(
            "10.0.0.1/8".parse().unwrap(),
            "eth0.24",
            ConfigLayer::MachineConfig,
        );
        assert_eq!(spec.id(), "configuration/eth0.24/10.0.0.1/8");
    }

    #[test]
    fn bond_mode_names() {
        assert_eq!(BondMode::by_name("802.3ad").unwrap(), BondMode::Lacp);
        assert_eq!(
            BondMode::by_name("active-backup").unwrap(),
            BondMode::ActiveBackup
        );
        assert!(BondMode::by_name("magic").is_err());
    }

    #[test]
    fn hostname_split() {
        let h = HostnameSpec::parse("node-1.example.org", ConfigLayer::MachineConfig);
        assert_eq!(h.hostname, "node-1");
        assert_eq!(h.domainname, "example.org");
        assert_eq!(h.fqdn(), "node-1.example.org");

        let bare = HostnameSpec::parse("node-1", ConfigLayer::Cmdline);
        assert_eq!(bare.domainname, "");
        assert_eq!(bare.fqdn(), "node-1");
    }
}
