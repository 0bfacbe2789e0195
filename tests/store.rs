//! Resource store properties: strict versioning, ordered watch delivery,
//! finalizer-guarded destruction, CAS semantics.

use std::sync::Arc;

use nodevisor::machine::MachineConfig;
use nodevisor::resources::{
    AddressSpec, ConfigLayer, Payload, Phase, Resource, Store, StoreError, StoreEventKind,
    CONFIG_NAMESPACE, MACHINE_CONFIG_ID, NETWORK_CONFIG_NAMESPACE,
};

fn lo_address(id: &str) -> Resource {
    let spec = AddressSpec::new("127.0.0.1/8".parse().unwrap(), "lo", ConfigLayer::Default);
    Resource::new(NETWORK_CONFIG_NAMESPACE, id, Payload::Address(spec))
}

#[tokio::test]
async fn versions_are_strictly_monotonic() {
    let store = Store::default();
    let id = "default/lo/127.0.0.1/8";

    assert_eq!(store.create(lo_address(id)).await.unwrap(), 1);

    let mut last = 1;
    for _ in 0..10 {
        let v = store
            .modify(NETWORK_CONFIG_NAMESPACE, Resource::ADDRESS_SPEC, id, |_| {})
            .await
            .unwrap();
        assert_eq!(v, last + 1);
        last = v;
    }
}

#[tokio::test]
async fn watchers_observe_every_version_in_order() {
    let store = Store::default();
    let id = "default/lo/127.0.0.1/8";

    let mut watch = store.watch(
        NETWORK_CONFIG_NAMESPACE,
        Resource::ADDRESS_SPEC,
        Some(id.to_string()),
    );

    store.create(lo_address(id)).await.unwrap();

    let writer = {
        let store = store.clone();
        tokio::spawn(async move {
            for _ in 0..20 {
                store
                    .modify(NETWORK_CONFIG_NAMESPACE, Resource::ADDRESS_SPEC, id, |_| {})
                    .await
                    .unwrap();
            }
        })
    };

    let mut last = 0;
    for _ in 0..21 {
        let ev = watch.recv().await.unwrap();
        assert!(
            ev.resource.meta.version > last,
            "version {} did not advance past {}",
            ev.resource.meta.version,
            last
        );
        last = ev.resource.meta.version;
    }

    assert_eq!(last, 21);
    writer.await.unwrap();
}

#[tokio::test]
async fn destroy_is_blocked_by_finalizers() {
    let store = Store::default();
    let id = "default/lo/127.0.0.1/8";

    store.create(lo_address(id)).await.unwrap();
    store
        .add_finalizer(NETWORK_CONFIG_NAMESPACE, Resource::ADDRESS_SPEC, id, "applier")
        .await
        .unwrap();

    let version = store
        .get(NETWORK_CONFIG_NAMESPACE, Resource::ADDRESS_SPEC, id)
        .await
        .unwrap()
        .meta
        .version;

    // Blocked while the finalizer is registered; the resource survives.
    let err = store
        .destroy(NETWORK_CONFIG_NAMESPACE, Resource::ADDRESS_SPEC, id, version)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::HasFinalizers { .. }));
    assert!(store
        .get(NETWORK_CONFIG_NAMESPACE, Resource::ADDRESS_SPEC, id)
        .await
        .is_ok());

    // Teardown flips the phase and reports not-ready.
    let ready = store
        .teardown(NETWORK_CONFIG_NAMESPACE, Resource::ADDRESS_SPEC, id)
        .await
        .unwrap();
    assert!(!ready);
    assert_eq!(
        store
            .get(NETWORK_CONFIG_NAMESPACE, Resource::ADDRESS_SPEC, id)
            .await
            .unwrap()
            .meta
            .phase,
        Phase::TearingDown
    );

    // Dropping the finalizer unblocks destruction.
    store
        .remove_finalizer(NETWORK_CONFIG_NAMESPACE, Resource::ADDRESS_SPEC, id, "applier")
        .await
        .unwrap();

    let version = store
        .get(NETWORK_CONFIG_NAMESPACE, Resource::ADDRESS_SPEC, id)
        .await
        .unwrap()
        .meta
        .version;

    store
        .destroy(NETWORK_CONFIG_NAMESPACE, Resource::ADDRESS_SPEC, id, version)
        .await
        .unwrap();

    let err = store
        .get(NETWORK_CONFIG_NAMESPACE, Resource::ADDRESS_SPEC, id)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn update_conflicts_on_stale_version() {
    let store = Store::default();
    let id = "default/lo/127.0.0.1/8";

    store.create(lo_address(id)).await.unwrap();
    store.update(lo_address(id), 1).await.unwrap();

    let err = store.update(lo_address(id), 1).await.unwrap_err();
    assert!(err.is_conflict());
}

#[tokio::test]
async fn destroyed_events_carry_the_final_resource() {
    let store = Store::default();
    let id = "default/lo/127.0.0.1/8";

    let mut watch = store.watch(
        NETWORK_CONFIG_NAMESPACE,
        Resource::ADDRESS_SPEC,
        Some(id.to_string()),
    );

    store.create(lo_address(id)).await.unwrap();
    store
        .destroy(NETWORK_CONFIG_NAMESPACE, Resource::ADDRESS_SPEC, id, 1)
        .await
        .unwrap();

    let created = watch.recv().await.unwrap();
    assert_eq!(created.kind, StoreEventKind::Created);

    let destroyed = watch.recv().await.unwrap();
    assert_eq!(destroyed.kind, StoreEventKind::Destroyed);
    assert_eq!(destroyed.resource.meta.id, id);
}

#[tokio::test]
async fn machine_config_round_trips_through_the_store() {
    let store = Store::default();

    let cfg = MachineConfig::from_yaml(b"version: v1alpha1\n").unwrap();
    let res = Resource::new(
        CONFIG_NAMESPACE,
        MACHINE_CONFIG_ID,
        Payload::MachineConfig(Arc::new(cfg)),
    );

    store.create(res).await.unwrap();

    let stored = store
        .get(CONFIG_NAMESPACE, Resource::MACHINE_CONFIG, MACHINE_CONFIG_ID)
        .await
        .unwrap();

    assert_eq!(stored.as_machine_config().unwrap().version, "v1alpha1");
}
