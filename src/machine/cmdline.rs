//! # Kernel command-line surface.
//!
//! Parses `/proc/cmdline` into key/value parameters and extracts the static
//! network bootstrap from the classic nfsroot `ip=` argument:
//!
//! ```text
//! ip=<client-ip>:<server-ip>:<gw-ip>:<netmask>:<hostname>:<device>:<autoconf>:<dns1>:<dns2>
//! ```
//!
//! A missing netmask implies a host prefix (/32 or /128); a missing device
//! leaves the interface choice to the consuming controller (which picks the
//! lexicographically first non-loopback link).

use std::net::IpAddr;
use std::path::Path;

use crate::machine::ConfigError;
use crate::resources::IpPrefix;

/// Cmdline key selecting the platform adapter.
pub const PLATFORM_KEY: &str = "talos.platform";

/// Cmdline key pointing at the machine-config source.
pub const CONFIG_KEY: &str = "talos.config";

/// Parsed kernel command line.
#[derive(Debug, Clone, Default)]
pub struct Cmdline {
    params: Vec<(String, Option<String>)>,
}

impl Cmdline {
    /// Parses a raw command line.
    pub fn parse(raw: &str) -> Self {
        let params = raw
            .split_whitespace()
            .map(|tok| match tok.split_once('=') {
                Some((k, v)) => (k.to_string(), Some(v.to_string())),
                None => (tok.to_string(), None),
            })
            .collect();

        Self { params }
    }

    /// Reads and parses the command line from `path` (normally
    /// `/proc/cmdline`); a missing file yields an empty command line.
    pub async fn read(path: impl AsRef<Path>) -> Self {
        match tokio::fs::read_to_string(path).await {
            Ok(raw) => Self::parse(raw.trim()),
            Err(_) => Self::default(),
        }
    }

    /// Returns the value of the first occurrence of `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .and_then(|(_, v)| v.as_deref())
    }

    /// Whether the command line is empty.
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

/// Static network bootstrap extracted from `ip=`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CmdlineNetwork {
    /// Static address; prefix defaults to the host length without a netmask.
    pub address: Option<IpPrefix>,
    /// Default gateway.
    pub gateway: Option<IpAddr>,
    /// Interface name; `None` leaves the choice to the consumer.
    pub link_name: Option<String>,
    /// Hostname, when carried in the `ip=` argument.
    pub hostname: Option<String>,
    /// DNS resolvers, when carried in the `ip=` argument.
    pub resolvers: Vec<IpAddr>,
}

impl CmdlineNetwork {
    /// Whether the argument carried any usable settings.
    pub fn is_empty(&self) -> bool {
        self.address.is_none()
            && self.gateway.is_none()
            && self.link_name.is_none()
            && self.hostname.is_none()
            && self.resolvers.is_empty()
    }
}

/// Parses the `ip=` argument of the command line.
///
/// Returns `Ok(None)` when the argument is absent. Malformed fields are a
/// configuration error: booting with a broken static network bootstrap would
/// otherwise fail much later and far less legibly.
pub fn parse_cmdline_network(cmdline: &Cmdline) -> Result<Option<CmdlineNetwork>, ConfigError> {
    let Some(raw) = cmdline.get("ip") else {
        return Ok(None);
    };

    let fields: Vec<&str> = raw.split(':').collect();
    let field = |i: usize| fields.get(i).copied().unwrap_or("");

    let mut settings = CmdlineNetwork::default();

    let client_ip = field(0);
    let netmask = field(3);

    if !client_ip.is_empty() {
        let addr: IpAddr = client_ip.parse().map_err(|_| ConfigError::Invalid {
            field: "ip".into(),
            reason: format!("invalid client ip: {client_ip}"),
        })?;

        let prefix = if netmask.is_empty() {
            IpPrefix::host(addr)
        } else {
            IpPrefix::new(addr, netmask_to_bits(netmask)?)
        };

        settings.address = Some(prefix);
    }

    let gateway = field(2);
    if !gateway.is_empty() {
        settings.gateway = Some(gateway.parse().map_err(|_| ConfigError::Invalid {
            field: "ip".into(),
            reason: format!("invalid gateway: {gateway}"),
        })?);
    }

    let hostname = field(4);
    if !hostname.is_empty() {
        settings.hostname = Some(hostname.to_string());
    }

    let device = field(5);
    if !device.is_empty() {
        settings.link_name = Some(device.to_string());
    }

    for dns in [field(7), field(8)] {
        if dns.is_empty() {
            continue;
        }

        settings
            .resolvers
            .push(dns.parse().map_err(|_| ConfigError::Invalid {
                field: "ip".into(),
                reason: format!("invalid dns server: {dns}"),
            })?);
    }

    Ok(Some(settings))
}

/// Converts a netmask field into a prefix length.
///
/// Accepts a dotted-quad IPv4 mask, a plain prefix length, or an IPv6 mask.
fn netmask_to_bits(netmask: &str) -> Result<u8, ConfigError> {
    if let Ok(bits) = netmask.parse::<u8>() {
        if bits <= 128 {
            return Ok(bits);
        }
    }

    let addr: IpAddr = netmask.parse().map_err(|_| ConfigError::Invalid {
        field: "ip".into(),
        reason: format!("invalid netmask: {netmask}"),
    })?;

    let bits = match addr {
        IpAddr::V4(v4) => u32::from(v4).count_ones(),
        IpAddr::V6(v6) => u128::from(v6).count_ones(),
    };

    Ok(bits as u8)
}

/// Lists kernel interface names from sysfs, sorted.
///
/// Used by config controllers when the cmdline names no interface. Outside
/// Linux (or without sysfs) the list is empty.
pub(crate) fn sys_interfaces() -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir("/sys/class/net")
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();

    names.sort();
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_keys() {
        let cmdline = Cmdline::parse("console=ttyS0 talos.platform=metal talos.config=https://cfg quiet");
        assert_eq!(cmdline.get(PLATFORM_KEY), Some("metal"));
        assert_eq!(cmdline.get(CONFIG_KEY), Some("https://cfg"));
        assert_eq!(cmdline.get("quiet"), None);
        assert_eq!(cmdline.get("missing"), None);
    }

    #[test]
    fn parses_full_ip_argument() {
        let cmdline = Cmdline::parse("ip=172.20.0.2::172.20.0.1:255.255.255.0::eth1:::::");
        let net = parse_cmdline_network(&cmdline).unwrap().unwrap();

        assert_eq!(net.address.unwrap().to_string(), "172.20.0.2/24");
        assert_eq!(net.gateway.unwrap().to_string(), "172.20.0.1");
        assert_eq!(net.link_name.as_deref(), Some("eth1"));
        assert!(net.hostname.is_none());
    }

    #[test]
    fn missing_netmask_implies_host_prefix() {
        let cmdline = Cmdline::parse("ip=172.20.0.2::172.20.0.1");
        let net = parse_cmdline_network(&cmdline).unwrap().unwrap();

        assert_eq!(net.address.unwrap().to_string(), "172.20.0.2/32");
        assert_eq!(net.gateway.unwrap().to_string(), "172.20.0.1");
        assert!(net.link_name.is_none());
    }

    #[test]
    fn carries_hostname_and_dns() {
        let cmdline =
            Cmdline::parse("ip=10.0.0.5::10.0.0.1:255.255.255.0:node-1:eth0:off:1.1.1.1:8.8.8.8");
        let net = parse_cmdline_network(&cmdline).unwrap().unwrap();

        assert_eq!(net.hostname.as_deref(), Some("node-1"));
        assert_eq!(net.resolvers.len(), 2);
    }

    #[test]
    fn absent_argument_is_none() {
        let cmdline = Cmdline::parse("console=ttyS0");
        assert!(parse_cmdline_network(&cmdline).unwrap().is_none());
    }

    #[test]
    fn malformed_address_is_rejected() {
        let cmdline = Cmdline::parse("ip=999.0.0.1::10.0.0.1");
        assert!(parse_cmdline_network(&cmdline).is_err());
    }

    #[test]
    fn netmask_formats() {
        assert_eq!(netmask_to_bits("255.255.255.0").unwrap(), 24);
        assert_eq!(netmask_to_bits("255.255.240.0").unwrap(), 20);
        assert_eq!(netmask_to_bits("24").unwrap(), 24);
        assert!(netmask_to_bits("garbage").is_err());
    }
}
