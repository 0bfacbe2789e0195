//! Network reconciliation end-to-end: config controllers deriving layered
//! desired state, appliers converging kernel state, layer precedence, and
//! two-phase destroy through finalizers.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use nodevisor::controllers::{
    AddressConfigController, AddressSpecController, Controller, ControllerRuntime, InMemoryNetlink,
    LinkConfigController, LinkSpecController, RouteConfigController, RouteSpecController,
};
use nodevisor::machine::{
    parse_cmdline_network, Cmdline, Device, DeviceRoute, Machine, MachineConfig, MachineNetwork,
    Vlan,
};
use nodevisor::policies::BackoffPolicy;
use nodevisor::resources::{
    AddressSpec, ConfigLayer, Payload, Resource, Scope, Store, CONFIG_NAMESPACE, MACHINE_CONFIG_ID,
    NETWORK_CONFIG_NAMESPACE, NETWORK_NAMESPACE,
};
use nodevisor::Bus;

use common::eventually;

const WAIT: Duration = Duration::from_secs(3);

struct Harness {
    store: Store,
    token: CancellationToken,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

fn start(controllers: Vec<Arc<dyn Controller>>) -> Harness {
    let store = Store::default();
    let bus = Bus::new(256);
    let mut crt = ControllerRuntime::new(store.clone(), bus, BackoffPolicy::controller());

    for controller in controllers {
        crt.register(controller).unwrap();
    }

    let token = CancellationToken::new();
    tokio::spawn(crt.run(token.clone()));

    Harness { store, token }
}

async fn address_ids(store: &Store) -> BTreeSet<String> {
    store
        .list(NETWORK_CONFIG_NAMESPACE, Resource::ADDRESS_SPEC, None)
        .await
        .into_iter()
        .map(|r| r.meta.id)
        .collect()
}

async fn publish_config(store: &Store, cfg: MachineConfig) {
    let payload = Payload::MachineConfig(Arc::new(cfg));

    match store
        .get(CONFIG_NAMESPACE, Resource::MACHINE_CONFIG, MACHINE_CONFIG_ID)
        .await
    {
        Ok(existing) => {
            store
                .update(
                    Resource::new(CONFIG_NAMESPACE, MACHINE_CONFIG_ID, payload),
                    existing.meta.version,
                )
                .await
                .unwrap();
        }
        Err(_) => {
            store
                .create(Resource::new(CONFIG_NAMESPACE, MACHINE_CONFIG_ID, payload))
                .await
                .unwrap();
        }
    }
}

fn cmdline_network(raw: &str) -> Option<nodevisor::machine::CmdlineNetwork> {
    parse_cmdline_network(&Cmdline::parse(raw)).unwrap()
}

// S1: an empty machine config and no cmdline produce the loopback defaults.
#[tokio::test]
async fn loopback_defaults() {
    let h = start(vec![Arc::new(AddressConfigController::new(None, vec![]))]);

    eventually("loopback defaults", WAIT, || async {
        let ids = address_ids(&h.store).await;
        ids.contains("default/lo/127.0.0.1/8") && ids.contains("default/lo/::1/128")
    })
    .await;

    for id in ["default/lo/127.0.0.1/8", "default/lo/::1/128"] {
        let res = h
            .store
            .get(NETWORK_CONFIG_NAMESPACE, Resource::ADDRESS_SPEC, id)
            .await
            .unwrap();
        let spec = res.as_address().unwrap();

        assert_eq!(spec.link_name, "lo");
        assert_eq!(spec.scope, Scope::Host);
        assert_eq!(spec.layer, ConfigLayer::Default);
    }
}

// S2: a full static `ip=` argument lands on the named interface.
#[tokio::test]
async fn cmdline_static_address() {
    let net = cmdline_network("ip=172.20.0.2::172.20.0.1:255.255.255.0::eth1:::::");
    let h = start(vec![Arc::new(AddressConfigController::new(net, vec![]))]);

    eventually("cmdline address", WAIT, || async {
        address_ids(&h.store).await.contains("cmdline/eth1/172.20.0.2/24")
    })
    .await;

    let res = h
        .store
        .get(
            NETWORK_CONFIG_NAMESPACE,
            Resource::ADDRESS_SPEC,
            "cmdline/eth1/172.20.0.2/24",
        )
        .await
        .unwrap();
    let spec = res.as_address().unwrap();

    assert_eq!(spec.link_name, "eth1");
    assert_eq!(spec.layer, ConfigLayer::Cmdline);
}

// S3: no netmask implies /32; no interface picks the lexicographically
// first non-loopback one.
#[tokio::test]
async fn cmdline_without_netmask() {
    let net = cmdline_network("ip=172.20.0.2::172.20.0.1");
    let interfaces = vec!["lo".to_string(), "eth1".to_string(), "eth0".to_string()];
    let h = start(vec![Arc::new(AddressConfigController::new(net, interfaces))]);

    eventually("cmdline host address", WAIT, || async {
        address_ids(&h.store).await.contains("cmdline/eth0/172.20.0.2/32")
    })
    .await;

    let res = h
        .store
        .get(
            NETWORK_CONFIG_NAMESPACE,
            Resource::ADDRESS_SPEC,
            "cmdline/eth0/172.20.0.2/32",
        )
        .await
        .unwrap();
    assert_eq!(res.as_address().unwrap().link_name, "eth0");
}

// S4: machine config with an ignored device and a VLAN subdevice.
#[tokio::test]
async fn machine_configuration_addresses() {
    let h = start(vec![Arc::new(AddressConfigController::new(None, vec![]))]);

    publish_config(
        &h.store,
        MachineConfig {
            version: "v1alpha1".into(),
            machine: Machine {
                network: MachineNetwork {
                    interfaces: vec![
                        Device {
                            interface: "eth3".into(),
                            cidr: "192.168.0.24/28".into(),
                            ..Default::default()
                        },
                        Device {
                            interface: "eth4".into(),
                            cidr: "192.168.0.24/28".into(),
                            ignore: true,
                            ..Default::default()
                        },
                        Device {
                            interface: "eth2".into(),
                            cidr: "2001:470:6d:30e::1/64".into(),
                            ..Default::default()
                        },
                        Device {
                            interface: "eth0".into(),
                            vlans: vec![Vlan {
                                id: 24,
                                cidr: "10.0.0.1/8".into(),
                                ..Default::default()
                            }],
                            ..Default::default()
                        },
                    ],
                    ..Default::default()
                },
                ..Default::default()
            },
            ..Default::default()
        },
    )
    .await;

    let expected: BTreeSet<String> = [
        "configuration/eth2/2001:470:6d:30e::1/64",
        "configuration/eth3/192.168.0.24/28",
        "configuration/eth0.24/10.0.0.1/8",
    ]
    .into_iter()
    .map(String::from)
    .collect();

    eventually("configuration addresses", WAIT, || {
        let expected = expected.clone();
        let store = h.store.clone();
        async move {
            let configured: BTreeSet<String> = address_ids(&store)
                .await
                .into_iter()
                .filter(|id| id.starts_with("configuration/"))
                .collect();

            configured == expected
        }
    })
    .await;

    // The ignored device contributes nothing at any layer.
    assert!(!address_ids(&h.store)
        .await
        .iter()
        .any(|id| id.contains("eth4")));
}

// Property 3: for a static input set the controllers reach a fixed point.
#[tokio::test]
async fn controllers_reach_a_fixed_point() {
    let net = cmdline_network("ip=172.20.0.2::172.20.0.1:255.255.255.0::eth1:::::");
    let h = start(vec![Arc::new(AddressConfigController::new(net, vec![]))]);

    eventually("initial convergence", WAIT, || async {
        address_ids(&h.store).await.len() == 3
    })
    .await;

    let versions = |store: Store| async move {
        store
            .list(NETWORK_CONFIG_NAMESPACE, Resource::ADDRESS_SPEC, None)
            .await
            .into_iter()
            .map(|r| (r.meta.id, r.meta.version))
            .collect::<Vec<_>>()
    };

    let before = versions(h.store.clone()).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    let after = versions(h.store.clone()).await;

    assert_eq!(before, after, "controller kept rewriting its outputs");
}

// Property 4: the highest layer wins for the same logical (link, address).
#[tokio::test]
async fn layer_precedence_in_the_effective_set() {
    let netlink = Arc::new(InMemoryNetlink::with_links(["eth0"]));

    let h = start(vec![
        Arc::new(AddressConfigController::new(None, vec![])),
        Arc::new(AddressSpecController::new(netlink.clone())),
    ]);

    // An operator-pushed spec for the same loopback address at a higher
    // layer: global scope instead of host.
    let mut operator = AddressSpec::new("127.0.0.1/8".parse().unwrap(), "lo", ConfigLayer::Operator);
    operator.scope = Scope::Global;

    let id = operator.id();
    h.store
        .create(Resource::new(
            NETWORK_CONFIG_NAMESPACE,
            id,
            Payload::Address(operator),
        ))
        .await
        .unwrap();

    eventually("operator layer wins", WAIT, || async {
        h.store
            .get(NETWORK_NAMESPACE, Resource::ADDRESS_STATUS, "lo/127.0.0.1/8")
            .await
            .map(|r| match &r.spec {
                Payload::AddressStatus(status) => status.layer == ConfigLayer::Operator,
                _ => false,
            })
            .unwrap_or(false)
    })
    .await;

    // The superseded default spec is retained, not destroyed.
    assert!(h
        .store
        .get(
            NETWORK_CONFIG_NAMESPACE,
            Resource::ADDRESS_SPEC,
            "default/lo/127.0.0.1/8"
        )
        .await
        .is_ok());
}

// Two-phase destroy: the applier undoes kernel state and drops its
// finalizer; the config controller then deletes the resource.
#[tokio::test]
async fn two_phase_destroy_through_finalizers() {
    let netlink = Arc::new(InMemoryNetlink::with_links(["eth3"]));

    let h = start(vec![
        Arc::new(AddressConfigController::new(None, vec![])),
        Arc::new(AddressSpecController::new(netlink.clone())),
    ]);

    let device_config = MachineConfig {
        version: "v1alpha1".into(),
        machine: Machine {
            network: MachineNetwork {
                interfaces: vec![Device {
                    interface: "eth3".into(),
                    cidr: "192.168.0.24/28".into(),
                    ..Default::default()
                }],
                ..Default::default()
            },
            ..Default::default()
        },
        ..Default::default()
    };

    publish_config(&h.store, device_config).await;

    let addr = "192.168.0.24/28".parse().unwrap();

    eventually("address applied", WAIT, || async {
        netlink.addresses("eth3").contains(&addr)
    })
    .await;

    // Remove the device from the configuration; the spec must drain out of
    // both the kernel and the store.
    publish_config(
        &h.store,
        MachineConfig {
            version: "v1alpha1".into(),
            ..Default::default()
        },
    )
    .await;

    eventually("address removed from kernel", WAIT, || async {
        !netlink.addresses("eth3").contains(&addr)
    })
    .await;

    eventually("spec destroyed", WAIT, || async {
        h.store
            .get(
                NETWORK_CONFIG_NAMESPACE,
                Resource::ADDRESS_SPEC,
                "configuration/eth3/192.168.0.24/28",
            )
            .await
            .is_err()
    })
    .await;
}

// Links: bonds, VLAN naming, and application through the netlink seam.
#[tokio::test]
async fn link_specs_converge_into_the_kernel_model() {
    let netlink = Arc::new(InMemoryNetlink::with_links(["eth0", "eth1", "eth2"]));

    let h = start(vec![
        Arc::new(LinkConfigController::new(None, vec![])),
        Arc::new(LinkSpecController::new(netlink.clone())),
    ]);

    publish_config(
        &h.store,
        MachineConfig {
            version: "v1alpha1".into(),
            machine: Machine {
                network: MachineNetwork {
                    interfaces: vec![
                        Device {
                            interface: "bond0".into(),
                            bond: Some(nodevisor::machine::Bond {
                                mode: "802.3ad".into(),
                                interfaces: vec!["eth1".into(), "eth2".into()],
                                ..Default::default()
                            }),
                            ..Default::default()
                        },
                        Device {
                            interface: "eth0".into(),
                            vlans: vec![Vlan {
                                id: 24,
                                cidr: "10.0.0.1/8".into(),
                                ..Default::default()
                            }],
                            ..Default::default()
                        },
                    ],
                    ..Default::default()
                },
                ..Default::default()
            },
            ..Default::default()
        },
    )
    .await;

    eventually("bond and vlan created", WAIT, || async {
        netlink.link("bond0").is_some() && netlink.link("eth0.24").is_some()
    })
    .await;

    // Slaves are enslaved and down; the loopback default is up.
    eventually("slaves enslaved", WAIT, || async {
        let eth1 = netlink.link("eth1");
        let lo = netlink.link("lo");

        matches!(eth1, Some(l) if l.master == "bond0" && !l.up)
            && matches!(lo, Some(l) if l.up)
    })
    .await;

    let specs: BTreeSet<String> = h
        .store
        .list(NETWORK_CONFIG_NAMESPACE, Resource::LINK_SPEC, None)
        .await
        .into_iter()
        .map(|r| r.meta.id)
        .collect();

    assert!(specs.contains("default/lo"));
    assert!(specs.contains("configuration/bond0"));
    assert!(specs.contains("configuration/eth0.24"));
}

// Routes: the cmdline gateway and machine-config routes land in the kernel
// model and drain out of it when the configuration drops them.
#[tokio::test]
async fn route_specs_converge_into_the_kernel_model() {
    let netlink = Arc::new(InMemoryNetlink::with_links(["eth0"]));

    let net = cmdline_network("ip=172.20.0.2::172.20.0.1:255.255.255.0::eth0:::::");
    let h = start(vec![
        Arc::new(RouteConfigController::new(net, vec![])),
        Arc::new(RouteSpecController::new(netlink.clone())),
    ]);

    // The cmdline gateway becomes a default route.
    eventually("cmdline default route installed", WAIT, || async {
        netlink.routes().iter().any(|r| {
            r.destination.is_none()
                && r.out_link == "eth0"
                && r.gateway.map(|g| g.to_string() == "172.20.0.1").unwrap_or(false)
        })
    })
    .await;

    // A machine-config route on the same link joins it.
    publish_config(
        &h.store,
        MachineConfig {
            version: "v1alpha1".into(),
            machine: Machine {
                network: MachineNetwork {
                    interfaces: vec![Device {
                        interface: "eth0".into(),
                        routes: vec![DeviceRoute {
                            network: "10.5.0.0/16".into(),
                            gateway: "172.20.0.254".into(),
                            metric: 0,
                        }],
                        ..Default::default()
                    }],
                    ..Default::default()
                },
                ..Default::default()
            },
            ..Default::default()
        },
    )
    .await;

    eventually("config route installed", WAIT, || async {
        netlink
            .routes()
            .iter()
            .any(|r| r.destination.map(|d| d.to_string() == "10.5.0.0/16").unwrap_or(false))
    })
    .await;

    // Dropping the device drains the config route (two-phase: the applier
    // undoes the kernel state and releases its finalizer first).
    publish_config(
        &h.store,
        MachineConfig {
            version: "v1alpha1".into(),
            ..Default::default()
        },
    )
    .await;

    eventually("config route removed", WAIT, || async {
        !netlink
            .routes()
            .iter()
            .any(|r| r.destination.map(|d| d.to_string() == "10.5.0.0/16").unwrap_or(false))
    })
    .await;

    // The cmdline route is untouched by the config change.
    assert!(netlink.routes().iter().any(|r| r.destination.is_none()));
}
