//! # Etcd invocation assembly.
//!
//! Builds the argument list for the etcd system service from the cluster
//! configuration. The listen address choice is explicit: `::` when any
//! configured node address is IPv6, `0.0.0.0` otherwise. A handful of
//! arguments are owned by the runtime and may not be overridden by
//! `cluster.etcd.extraArgs`.

use std::collections::BTreeMap;
use std::net::IpAddr;

use crate::machine::{ConfigError, MachineConfig};

/// Etcd data directory.
pub const ETCD_DATA_PATH: &str = "/var/lib/etcd";

/// Etcd PKI directory (CA cert/key, peer cert/key).
pub const ETCD_PKI_PATH: &str = "/etc/kubernetes/pki/etcd";

/// Arguments owned by the runtime; user overrides are a config error.
const DENIED_EXTRA_ARGS: [&str; 3] = ["name", "data-dir", "initial-cluster-state"];

/// Formats an address for a URL, bracketing IPv6 literals.
fn url_host(addr: &IpAddr) -> String {
    match addr {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{v6}]"),
    }
}

/// Assembles the etcd argument list.
///
/// `hostname` becomes the member name; `addresses` are the node's configured
/// addresses and drive both the listen-address family choice and the
/// advertised URLs.
pub fn etcd_args(
    cfg: &MachineConfig,
    hostname: &str,
    addresses: &[IpAddr],
) -> Result<Vec<String>, ConfigError> {
    for denied in DENIED_EXTRA_ARGS {
        if cfg.cluster.etcd.extra_args.contains_key(denied) {
            return Err(ConfigError::Invalid {
                field: format!("cluster.etcd.extraArgs.{denied}"),
                reason: "this argument is managed by the runtime".to_string(),
            });
        }
    }

    let listen = if addresses.iter().any(IpAddr::is_ipv6) {
        "[::]".to_string()
    } else {
        "0.0.0.0".to_string()
    };

    let advertised = addresses
        .first()
        .map(url_host)
        .unwrap_or_else(|| listen.clone());

    let mut args: BTreeMap<String, String> = BTreeMap::new();

    args.insert("name".into(), hostname.to_string());
    args.insert("data-dir".into(), ETCD_DATA_PATH.into());
    args.insert(
        "listen-peer-urls".into(),
        format!("https://{listen}:2380"),
    );
    args.insert(
        "listen-client-urls".into(),
        format!("https://{listen}:2379"),
    );
    args.insert(
        "initial-advertise-peer-urls".into(),
        format!("https://{advertised}:2380"),
    );
    args.insert(
        "advertise-client-urls".into(),
        format!("https://{advertised}:2379"),
    );
    args.insert("cert-file".into(), format!("{ETCD_PKI_PATH}/peer.crt"));
    args.insert("key-file".into(), format!("{ETCD_PKI_PATH}/peer.key"));
    args.insert("trusted-ca-file".into(), format!("{ETCD_PKI_PATH}/ca.crt"));
    args.insert("peer-cert-file".into(), format!("{ETCD_PKI_PATH}/peer.crt"));
    args.insert("peer-key-file".into(), format!("{ETCD_PKI_PATH}/peer.key"));
    args.insert(
        "peer-trusted-ca-file".into(),
        format!("{ETCD_PKI_PATH}/ca.crt"),
    );
    args.insert("client-cert-auth".into(), "true".into());
    args.insert("peer-client-cert-auth".into(), "true".into());

    for (key, value) in &cfg.cluster.etcd.extra_args {
        args.insert(key.clone(), value.clone());
    }

    Ok(args
        .into_iter()
        .map(|(k, v)| format!("--{k}={v}"))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_listens_on_any_v4() {
        let cfg = MachineConfig::default();
        let addrs = ["192.168.0.10".parse().unwrap()];

        let args = etcd_args(&cfg, "node-1", &addrs).unwrap();

        assert!(args.contains(&"--listen-client-urls=https://0.0.0.0:2379".to_string()));
        assert!(args.contains(&"--advertise-client-urls=https://192.168.0.10:2379".to_string()));
        assert!(args.contains(&"--name=node-1".to_string()));
    }

    #[test]
    fn any_ipv6_address_switches_to_v6_wildcard() {
        let cfg = MachineConfig::default();
        let addrs = [
            "192.168.0.10".parse().unwrap(),
            "2001:db8::1".parse().unwrap(),
        ];

        let args = etcd_args(&cfg, "node-1", &addrs).unwrap();

        assert!(args.contains(&"--listen-peer-urls=https://[::]:2380".to_string()));
    }

    #[test]
    fn denied_extra_args_are_rejected() {
        let mut cfg = MachineConfig::default();
        cfg.cluster
            .etcd
            .extra_args
            .insert("data-dir".into(), "/tmp/evil".into());

        let err = etcd_args(&cfg, "node-1", &[]).unwrap_err();
        assert!(err.to_string().contains("data-dir"));
    }

    #[test]
    fn extra_args_merge() {
        let mut cfg = MachineConfig::default();
        cfg.cluster
            .etcd
            .extra_args
            .insert("election-timeout".into(), "5000".into());

        let args = etcd_args(&cfg, "node-1", &[]).unwrap();
        assert!(args.contains(&"--election-timeout=5000".to_string()));
    }
}
