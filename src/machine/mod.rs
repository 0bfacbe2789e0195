//! Operator-facing machine inputs: the v1alpha1 machine-config document and
//! the kernel command line.

mod cmdline;
mod config;

pub use cmdline::{parse_cmdline_network, Cmdline, CmdlineNetwork};
pub(crate) use cmdline::sys_interfaces;
pub use cmdline::{CONFIG_KEY, PLATFORM_KEY};
pub use config::{
    ApiServer, Bond, Cluster, ClusterNetwork, ConfigError, ControlPlane, Device, DeviceRoute,
    Etcd, ExtraHost, Install, Machine, MachineConfig, MachineFile, MachineNetwork, Vlan,
    Wireguard, WireguardPeerConfig,
};
