//! # The v1alpha1 machine configuration document.
//!
//! The authoritative user input, parsed from YAML. The document is kept as
//! written (CIDRs and modes stay strings); [`MachineConfig::validate`]
//! rejects documents the controllers could not act on, so reconciliation
//! passes may parse leniently.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::TaskError;
use crate::resources::{BondMode, HashPolicy, IpPrefix, LacpRate};

/// Errors produced while parsing or validating a machine configuration.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    /// The document is not valid YAML for the expected schema.
    #[error("config parse error: {0}")]
    Parse(String),

    /// The document declares an unsupported version.
    #[error("unsupported config version '{0}', expected 'v1alpha1'")]
    Version(String),

    /// A field value is invalid.
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// Dotted path of the offending field.
        field: String,
        /// Why the value was rejected.
        reason: String,
    },
}

impl ConfigError {
    fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl From<ConfigError> for TaskError {
    fn from(e: ConfigError) -> Self {
        TaskError::Config {
            reason: e.to_string(),
        }
    }
}

/// The root machine configuration document.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineConfig {
    /// Schema version; only `v1alpha1` is accepted.
    #[serde(default)]
    pub version: String,
    /// Machine-scoped configuration.
    #[serde(default)]
    pub machine: Machine,
    /// Cluster-scoped configuration.
    #[serde(default)]
    pub cluster: Cluster,
}

/// Machine-scoped configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Machine {
    /// Role of this machine (`init`, `controlplane`, `join`).
    #[serde(default, rename = "type")]
    pub machine_type: String,
    /// Network configuration.
    #[serde(default)]
    pub network: MachineNetwork,
    /// Install target configuration.
    #[serde(default)]
    pub install: Install,
    /// Extra environment variables for system services.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Extra files written during boot.
    #[serde(default)]
    pub files: Vec<MachineFile>,
}

/// Machine network configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineNetwork {
    /// Static hostname, possibly fully qualified.
    #[serde(default)]
    pub hostname: String,
    /// Per-device configuration.
    #[serde(default)]
    pub interfaces: Vec<Device>,
    /// DNS resolvers.
    #[serde(default)]
    pub nameservers: Vec<String>,
    /// Additional /etc/hosts entries.
    #[serde(default)]
    pub extra_hosts: Vec<ExtraHost>,
}

/// A single /etc/hosts entry.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtraHost {
    /// The IP address.
    #[serde(default)]
    pub ip: String,
    /// Host aliases for the address.
    #[serde(default)]
    pub aliases: Vec<String>,
}

/// Configuration of one network device.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    /// Kernel interface name.
    #[serde(default)]
    pub interface: String,
    /// Static address in CIDR notation; empty when DHCP or address-less.
    #[serde(default)]
    pub cidr: String,
    /// MTU; 0 keeps the kernel default.
    #[serde(default)]
    pub mtu: u32,
    /// Acquire the address over DHCP.
    #[serde(default)]
    pub dhcp: bool,
    /// Exclude this device (and its subdevices) from management entirely.
    #[serde(default)]
    pub ignore: bool,
    /// Create the device as a dummy link.
    #[serde(default)]
    pub dummy: bool,
    /// Static routes through this device.
    #[serde(default)]
    pub routes: Vec<DeviceRoute>,
    /// Bond parameters; present makes this device a bond master.
    #[serde(default)]
    pub bond: Option<Bond>,
    /// VLAN subdevices.
    #[serde(default)]
    pub vlans: Vec<Vlan>,
    /// Wireguard parameters; present makes this device a wireguard tunnel.
    #[serde(default)]
    pub wireguard: Option<Wireguard>,
}

/// A static route attached to a device.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRoute {
    /// Destination network in CIDR notation; empty for the default route.
    #[serde(default)]
    pub network: String,
    /// Gateway address.
    #[serde(default)]
    pub gateway: String,
    /// Route metric; 0 keeps the kernel default.
    #[serde(default)]
    pub metric: u32,
}

/// Bond master parameters.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bond {
    /// Physical slave interfaces.
    #[serde(default)]
    pub interfaces: Vec<String>,
    /// Bond mode, by kernel name (`802.3ad`, `active-backup`, ...).
    #[serde(default)]
    pub mode: String,
    /// Transmit hash policy, by kernel name.
    #[serde(default, alias = "xmitHashPolicy")]
    pub hash_policy: String,
    /// LACPDU rate (`slow`, `fast`).
    #[serde(default)]
    pub lacp_rate: String,
    /// MII monitoring interval, ms.
    #[serde(default)]
    pub miimon: u32,
    /// Slave enable delay, ms.
    #[serde(default)]
    pub updelay: u32,
    /// Slave disable delay, ms.
    #[serde(default)]
    pub downdelay: u32,
    /// Minimum number of active slaves.
    #[serde(default)]
    pub min_links: u32,
}

/// A VLAN subdevice.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vlan {
    /// 802.1Q VLAN id.
    #[serde(default, alias = "vlanId")]
    pub id: u16,
    /// Static address in CIDR notation.
    #[serde(default)]
    pub cidr: String,
    /// Static routes through the subdevice.
    #[serde(default)]
    pub routes: Vec<DeviceRoute>,
}

/// Wireguard device parameters.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Wireguard {
    /// Device private key, base64.
    #[serde(default)]
    pub private_key: String,
    /// UDP listen port.
    #[serde(default)]
    pub listen_port: u16,
    /// Firewall mark for tunnel traffic.
    #[serde(default)]
    pub firewall_mark: u32,
    /// Configured peers.
    #[serde(default)]
    pub peers: Vec<WireguardPeerConfig>,
}

/// A wireguard peer as configured.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireguardPeerConfig {
    /// Peer public key, base64.
    #[serde(default)]
    pub public_key: String,
    /// Peer endpoint, `host:port`.
    #[serde(default)]
    pub endpoint: String,
    /// Keepalive interval, seconds.
    #[serde(default)]
    pub persistent_keepalive_interval: u64,
    /// Networks routed to this peer, CIDR notation.
    #[serde(default, alias = "allowedIps")]
    pub allowed_ips: Vec<String>,
}

/// Install target configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Install {
    /// Target disk device.
    #[serde(default)]
    pub disk: String,
    /// Installer image reference.
    #[serde(default)]
    pub image: String,
    /// Whether to install the bootloader.
    #[serde(default)]
    pub bootloader: bool,
    /// Whether to wipe the target disk first.
    #[serde(default)]
    pub wipe: bool,
}

/// An extra file written during boot.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineFile {
    /// Absolute destination path.
    #[serde(default)]
    pub path: String,
    /// File contents.
    #[serde(default)]
    pub content: String,
    /// Octal permissions.
    #[serde(default)]
    pub permissions: u32,
}

/// Cluster-scoped configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    /// Control-plane endpoint.
    #[serde(default)]
    pub control_plane: ControlPlane,
    /// Cluster networking.
    #[serde(default)]
    pub network: ClusterNetwork,
    /// Etcd configuration.
    #[serde(default)]
    pub etcd: Etcd,
    /// API server configuration.
    #[serde(default)]
    pub api_server: ApiServer,
}

/// Control-plane endpoint configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlane {
    /// URL of the control-plane endpoint.
    #[serde(default)]
    pub endpoint: String,
}

/// Cluster networking configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterNetwork {
    /// CNI name.
    #[serde(default)]
    pub cni: String,
    /// Pod subnet, CIDR notation.
    #[serde(default)]
    pub pod_subnet: String,
    /// Service subnet, CIDR notation.
    #[serde(default)]
    pub service_subnet: String,
}

/// Etcd configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Etcd {
    /// Container image reference.
    #[serde(default)]
    pub image: String,
    /// CA certificate, PEM.
    #[serde(default)]
    pub ca: String,
    /// Extra arguments merged into the etcd invocation.
    #[serde(default)]
    pub extra_args: BTreeMap<String, String>,
}

/// API server configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiServer {
    /// Additional SANs for the serving certificate.
    #[serde(default, rename = "certSANs")]
    pub cert_sans: Vec<String>,
}

impl MachineConfig {
    /// Parses a YAML document.
    pub fn from_yaml(bytes: &[u8]) -> Result<Self, ConfigError> {
        serde_yaml::from_slice(bytes).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Validates the document: schema version, addresses, bond parameters.
    ///
    /// Controllers assume a validated document and may skip malformed
    /// leftovers with a warning instead of failing the reconciliation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version != "v1alpha1" {
            return Err(ConfigError::Version(self.version.clone()));
        }

        for (i, device) in self.machine.network.interfaces.iter().enumerate() {
            let field = |suffix: &str| format!("machine.network.interfaces[{i}].{suffix}");

            if device.interface.is_empty() {
                return Err(ConfigError::invalid(field("interface"), "must not be empty"));
            }

            if !device.cidr.is_empty() {
                device
                    .cidr
                    .parse::<IpPrefix>()
                    .map_err(|e| ConfigError::invalid(field("cidr"), e))?;
            }

            if let Some(bond) = &device.bond {
                BondMode::by_name(&bond.mode)
                    .map_err(|e| ConfigError::invalid(field("bond.mode"), e))?;
                HashPolicy::by_name(&bond.hash_policy)
                    .map_err(|e| ConfigError::invalid(field("bond.hashPolicy"), e))?;
                LacpRate::by_name(&bond.lacp_rate)
                    .map_err(|e| ConfigError::invalid(field("bond.lacpRate"), e))?;
            }

            for (j, vlan) in device.vlans.iter().enumerate() {
                if !vlan.cidr.is_empty() {
                    vlan.cidr.parse::<IpPrefix>().map_err(|e| {
                        ConfigError::invalid(
                            format!("machine.network.interfaces[{i}].vlans[{j}].cidr"),
                            e,
                        )
                    })?;
                }
            }

            if let Some(wg) = &device.wireguard {
                for (j, peer) in wg.peers.iter().enumerate() {
                    for ip in &peer.allowed_ips {
                        ip.parse::<IpPrefix>().map_err(|e| {
                            ConfigError::invalid(
                                field(&format!("wireguard.peers[{j}].allowedIps")),
                                e,
                            )
                        })?;
                    }
                }
            }
        }

        for (i, ns) in self.machine.network.nameservers.iter().enumerate() {
            ns.parse::<std::net::IpAddr>().map_err(|_| {
                ConfigError::invalid(
                    format!("machine.network.nameservers[{i}]"),
                    format!("invalid address: {ns}"),
                )
            })?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
version: v1alpha1
machine:
  type: controlplane
  network:
    hostname: node-1.example.org
    nameservers:
      - 1.1.1.1
      - 8.8.8.8
    interfaces:
      - interface: eth0
        cidr: 192.168.0.10/24
        routes:
          - network: 0.0.0.0/0
            gateway: 192.168.0.1
        vlans:
          - vlanId: 24
            cidr: 10.0.0.1/8
      - interface: bond0
        cidr: 10.1.0.2/16
        bond:
          mode: 802.3ad
          lacpRate: fast
          interfaces:
            - eth1
            - eth2
  install:
    disk: /dev/sda
    image: ghcr.io/example/installer:v1
    bootloader: true
cluster:
  controlPlane:
    endpoint: https://cp.example.org:6443
  network:
    podSubnet: 10.244.0.0/16
    serviceSubnet: 10.96.0.0/12
  etcd:
    image: gcr.io/etcd-development/etcd:v3.4.14
    extraArgs:
      election-timeout: "5000"
"#;

    #[test]
    fn parses_and_validates_sample() {
        let cfg = MachineConfig::from_yaml(SAMPLE.as_bytes()).unwrap();
        cfg.validate().unwrap();

        assert_eq!(cfg.machine.machine_type, "controlplane");
        assert_eq!(cfg.machine.network.interfaces.len(), 2);
        assert_eq!(cfg.machine.network.interfaces[0].vlans[0].id, 24);
        assert_eq!(
            cfg.machine.network.interfaces[1]
                .bond
                .as_ref()
                .unwrap()
                .mode,
            "802.3ad"
        );
        assert_eq!(cfg.cluster.control_plane.endpoint, "https://cp.example.org:6443");
        assert_eq!(
            cfg.cluster.etcd.extra_args.get("election-timeout").unwrap(),
            "5000"
        );
    }

    #[test]
    fn rejects_unknown_version() {
        let cfg = MachineConfig::from_yaml(b"version: v0\n").unwrap();
        assert!(matches!(cfg.validate(), Err(ConfigError::Version(_))));
    }

    #[test]
    fn rejects_unknown_bond_mode() {
        let yaml = r#"
version: v1alpha1
machine:
  network:
    interfaces:
      - interface: bond0
        bond:
          mode: teleport
"#;
        let cfg = MachineConfig::from_yaml(yaml.as_bytes()).unwrap();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("bond.mode"));
    }

    #[test]
    fn rejects_bad_cidr() {
        let yaml = r#"
version: v1alpha1
machine:
  network:
    interfaces:
      - interface: eth0
        cidr: 300.1.1.1/8
"#;
        let cfg = MachineConfig::from_yaml(yaml.as_bytes()).unwrap();
        assert!(cfg.validate().is_err());
    }
}
