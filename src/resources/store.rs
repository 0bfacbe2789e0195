//! # Versioned in-memory resource store.
//!
//! The store is the only shared mutable state in the runtime. It serializes
//! writes per resource key, allows concurrent reads, and broadcasts every
//! mutation on a feed that [`Watch`] filters per `(namespace, type, id)`.
//!
//! ## Rules
//! - `(namespace, type, id)` is unique; `version` starts at 1 and increments
//!   on every mutation.
//! - Events are published while the write lock is held, so the feed order
//!   matches the mutation order and a single resource's versions arrive
//!   strictly increasing.
//! - Destruction is blocked while finalizers are registered
//!   ([`StoreError::HasFinalizers`]); [`Store::teardown`] flips the phase to
//!   [`Phase::TearingDown`] so claimants can undo side effects and drop their
//!   finalizers first.
//! - `*_owned` variants enforce controller ownership: a writer that is not
//!   the registered owner is rejected with [`StoreError::OwnerMismatch`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::{broadcast, RwLock};

use super::error::StoreError;
use super::meta::Phase;
use super::resource::{Payload, Resource};

/// Kind of a store mutation event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEventKind {
    /// Resource was created.
    Created,
    /// Resource was updated (spec, phase, or finalizers).
    Updated,
    /// Resource was removed.
    Destroyed,
}

/// A store mutation event with a snapshot of the resource.
#[derive(Debug, Clone)]
pub struct StoreEvent {
    /// What happened.
    pub kind: StoreEventKind,
    /// The resource after the mutation (before removal, for `Destroyed`).
    pub resource: Resource,
}

type Key = (String, &'static str);

struct Inner {
    shards: RwLock<HashMap<Key, BTreeMap<String, Resource>>>,
    feed: broadcast::Sender<StoreEvent>,
}

/// Versioned resource store with watch support.
#[derive(Clone)]
pub struct Store {
    inner: Arc<Inner>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new(4096)
    }
}

impl Store {
    /// Creates a store whose watch feed buffers up to `feed_capacity` events.
    pub fn new(feed_capacity: usize) -> Self {
        let (feed, _rx) = broadcast::channel(feed_capacity.max(1));

        Self {
            inner: Arc::new(Inner {
                shards: RwLock::new(HashMap::new()),
                feed,
            }),
        }
    }

    /// Returns the resource at `(namespace, type, id)`.
    pub async fn get(
        &self,
        namespace: &str,
        ty: &'static str,
        id: &str,
    ) -> Result<Resource, StoreError> {
        let shards = self.inner.shards.read().await;

        shards
            .get(&(namespace.to_string(), ty))
            .and_then(|shard| shard.get(id))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                namespace: namespace.to_string(),
                ty,
                id: id.to_string(),
            })
    }

    /// Lists resources of `(namespace, type)`, optionally filtered by an id
    /// prefix, in id order.
    pub async fn list(
        &self,
        namespace: &str,
        ty: &'static str,
        id_prefix: Option<&str>,
    ) -> Vec<Resource> {
        let shards = self.inner.shards.read().await;

        match shards.get(&(namespace.to_string(), ty)) {
            Some(shard) => shard
                .values()
                .filter(|r| id_prefix.map_or(true, |p| r.meta.id.starts_with(p)))
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    /// Creates a resource; the stored version is 1.
    pub async fn create(&self, mut resource: Resource) -> Result<u64, StoreError> {
        let mut shards = self.inner.shards.write().await;
        let key = (resource.meta.namespace.clone(), resource.meta.ty);
        let shard = shards.entry(key).or_default();

        if shard.contains_key(&resource.meta.id) {
            return Err(StoreError::AlreadyExists {
                namespace: resource.meta.namespace.clone(),
                ty: resource.meta.ty,
                id: resource.meta.id.clone(),
            });
        }

        let now = SystemTime::now();
        resource.meta.version = 1;
        resource.meta.phase = Phase::Running;
        resource.meta.created = now;
        resource.meta.updated = now;

        shard.insert(resource.meta.id.clone(), resource.clone());
        self.publish(StoreEventKind::Created, resource);

        Ok(1)
    }

    /// Creates a resource owned by `owner`.
    pub async fn create_owned(
        &self,
        mut resource: Resource,
        owner: &str,
    ) -> Result<u64, StoreError> {
        resource.meta.owner = owner.to_string();
        self.create(resource).await
    }

    /// Replaces the spec of an existing resource, CAS-guarded by
    /// `expected_version`. Owner, phase, finalizers, and creation time are
    /// preserved; the version increments.
    pub async fn update(
        &self,
        resource: Resource,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        self.update_inner(resource, expected_version, None).await
    }

    /// Like [`Store::update`], rejecting writers that do not own the resource.
    pub async fn update_owned(
        &self,
        resource: Resource,
        expected_version: u64,
        writer: &str,
    ) -> Result<u64, StoreError> {
        self.update_inner(resource, expected_version, Some(writer))
            .await
    }

    async fn update_inner(
        &self,
        resource: Resource,
        expected_version: u64,
        writer: Option<&str>,
    ) -> Result<u64, StoreError> {
        let mut shards = self.inner.shards.write().await;
        let key = (resource.meta.namespace.clone(), resource.meta.ty);

        let stored = shards
            .get_mut(&key)
            .and_then(|shard| shard.get_mut(&resource.meta.id))
            .ok_or_else(|| StoreError::NotFound {
                namespace: resource.meta.namespace.clone(),
                ty: resource.meta.ty,
                id: resource.meta.id.clone(),
            })?;

        if let Some(writer) = writer {
            check_owner(stored, writer)?;
        }

        if stored.meta.version != expected_version {
            return Err(StoreError::Conflict {
                namespace: resource.meta.namespace.clone(),
                ty: resource.meta.ty,
                id: resource.meta.id.clone(),
                expected: expected_version,
                current: stored.meta.version,
            });
        }

        stored.spec = resource.spec;
        stored.meta.version += 1;
        stored.meta.updated = SystemTime::now();

        let snapshot = stored.clone();
        let version = snapshot.meta.version;
        self.publish(StoreEventKind::Updated, snapshot);

        Ok(version)
    }

    /// Mutates the payload of an existing resource in place; the version
    /// increments. The mutation runs under the write lock, so it is atomic
    /// with respect to concurrent writers.
    pub async fn modify<F>(
        &self,
        namespace: &str,
        ty: &'static str,
        id: &str,
        f: F,
    ) -> Result<u64, StoreError>
    where
        F: FnOnce(&mut Payload),
    {
        let mut shards = self.inner.shards.write().await;

        let stored = shards
            .get_mut(&(namespace.to_string(), ty))
            .and_then(|shard| shard.get_mut(id))
            .ok_or_else(|| StoreError::NotFound {
                namespace: namespace.to_string(),
                ty,
                id: id.to_string(),
            })?;

        f(&mut stored.spec);
        stored.meta.version += 1;
        stored.meta.updated = SystemTime::now();

        let snapshot = stored.clone();
        let version = snapshot.meta.version;
        self.publish(StoreEventKind::Updated, snapshot);

        Ok(version)
    }

    /// Creates the resource when absent, replaces its spec when the payload
    /// differs, and leaves it untouched (no version bump, no event) when the
    /// stored payload is already equal.
    ///
    /// Returns the stored version, or `None` when nothing changed. This is
    /// the primitive reconciliation passes use to reach a fixed point.
    pub async fn upsert_owned(
        &self,
        namespace: &str,
        id: &str,
        payload: Payload,
        owner: &str,
    ) -> Result<Option<u64>, StoreError> {
        let ty = payload.type_name();
        let mut shards = self.inner.shards.write().await;
        let shard = shards.entry((namespace.to_string(), ty)).or_default();

        match shard.get_mut(id) {
            None => {
                let mut resource = Resource::new(namespace, id, payload);
                resource.meta.owner = owner.to_string();
                resource.meta.version = 1;

                shard.insert(id.to_string(), resource.clone());
                self.publish(StoreEventKind::Created, resource);

                Ok(Some(1))
            }
            Some(stored) => {
                check_owner(stored, owner)?;

                if stored.spec == payload && stored.meta.phase == Phase::Running {
                    return Ok(None);
                }

                stored.spec = payload;
                stored.meta.phase = Phase::Running;
                stored.meta.version += 1;
                stored.meta.updated = SystemTime::now();

                let snapshot = stored.clone();
                let version = snapshot.meta.version;
                self.publish(StoreEventKind::Updated, snapshot);

                Ok(Some(version))
            }
        }
    }

    /// Removes a resource, CAS-guarded by `expected_version`.
    ///
    /// Fails with [`StoreError::HasFinalizers`] while finalizers are
    /// registered.
    pub async fn destroy(
        &self,
        namespace: &str,
        ty: &'static str,
        id: &str,
        expected_version: u64,
    ) -> Result<(), StoreError> {
        self.destroy_inner(namespace, ty, id, expected_version, None)
            .await
    }

    /// Like [`Store::destroy`], rejecting writers that do not own the
    /// resource.
    pub async fn destroy_owned(
        &self,
        namespace: &str,
        ty: &'static str,
        id: &str,
        expected_version: u64,
        writer: &str,
    ) -> Result<(), StoreError> {
        self.destroy_inner(namespace, ty, id, expected_version, Some(writer))
            .await
    }

    async fn destroy_inner(
        &self,
        namespace: &str,
        ty: &'static str,
        id: &str,
        expected_version: u64,
        writer: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut shards = self.inner.shards.write().await;

        let shard = shards
            .get_mut(&(namespace.to_string(), ty))
            .ok_or_else(|| StoreError::NotFound {
                namespace: namespace.to_string(),
                ty,
                id: id.to_string(),
            })?;

        let stored = shard.get(id).ok_or_else(|| StoreError::NotFound {
            namespace: namespace.to_string(),
            ty,
            id: id.to_string(),
        })?;

        if let Some(writer) = writer {
            check_owner(stored, writer)?;
        }

        if stored.meta.version != expected_version {
            return Err(StoreError::Conflict {
                namespace: namespace.to_string(),
                ty,
                id: id.to_string(),
                expected: expected_version,
                current: stored.meta.version,
            });
        }

        if !stored.meta.finalizers.is_empty() {
            return Err(StoreError::HasFinalizers {
                namespace: namespace.to_string(),
                ty,
                id: id.to_string(),
                finalizers: stored.meta.finalizers.clone(),
            });
        }

        let removed = shard.remove(id).expect("checked above");
        self.publish(StoreEventKind::Destroyed, removed);

        Ok(())
    }

    /// Marks a resource as tearing down so claimants drop their finalizers.
    ///
    /// Returns `true` when the finalizer set is already empty (the caller may
    /// destroy immediately). Idempotent: repeated teardown of an already
    /// tearing-down resource does not bump the version.
    pub async fn teardown(
        &self,
        namespace: &str,
        ty: &'static str,
        id: &str,
    ) -> Result<bool, StoreError> {
        let mut shards = self.inner.shards.write().await;

        let stored = shards
            .get_mut(&(namespace.to_string(), ty))
            .and_then(|shard| shard.get_mut(id))
            .ok_or_else(|| StoreError::NotFound {
                namespace: namespace.to_string(),
                ty,
                id: id.to_string(),
            })?;

        if stored.meta.phase != Phase::TearingDown {
            stored.meta.phase = Phase::TearingDown;
            stored.meta.version += 1;
            stored.meta.updated = SystemTime::now();

            let snapshot = stored.clone();
            self.publish(StoreEventKind::Updated, snapshot);
        }

        let ready = shards
            .get(&(namespace.to_string(), ty))
            .and_then(|shard| shard.get(id))
            .map(|r| r.meta.finalizers.is_empty())
            .unwrap_or(true);

        Ok(ready)
    }

    /// Registers a finalizer; a no-op (no version bump) when already present.
    pub async fn add_finalizer(
        &self,
        namespace: &str,
        ty: &'static str,
        id: &str,
        finalizer: &str,
    ) -> Result<(), StoreError> {
        self.mutate_finalizers(namespace, ty, id, |meta| meta.add_finalizer(finalizer))
            .await
    }

    /// Removes a finalizer; a no-op (no version bump) when absent.
    pub async fn remove_finalizer(
        &self,
        namespace: &str,
        ty: &'static str,
        id: &str,
        finalizer: &str,
    ) -> Result<(), StoreError> {
        self.mutate_finalizers(namespace, ty, id, |meta| meta.remove_finalizer(finalizer))
            .await
    }

    async fn mutate_finalizers<F>(
        &self,
        namespace: &str,
        ty: &'static str,
        id: &str,
        f: F,
    ) -> Result<(), StoreError>
    where
        F: FnOnce(&mut super::meta::Metadata) -> bool,
    {
        let mut shards = self.inner.shards.write().await;

        let stored = shards
            .get_mut(&(namespace.to_string(), ty))
            .and_then(|shard| shard.get_mut(id))
            .ok_or_else(|| StoreError::NotFound {
                namespace: namespace.to_string(),
                ty,
                id: id.to_string(),
            })?;

        if f(&mut stored.meta) {
            stored.meta.version += 1;
            stored.meta.updated = SystemTime::now();

            let snapshot = stored.clone();
            self.publish(StoreEventKind::Updated, snapshot);
        }

        Ok(())
    }

    /// Subscribes to mutations of `(namespace, type)`, optionally narrowed to
    /// a single id. Only events published after the subscription are seen.
    pub fn watch(
        &self,
        namespace: impl Into<String>,
        ty: &'static str,
        id: Option<String>,
    ) -> Watch {
        Watch {
            rx: self.inner.feed.subscribe(),
            namespace: namespace.into(),
            ty,
            id,
        }
    }

    /// Subscribes to the raw, unfiltered mutation feed.
    pub fn subscribe_all(&self) -> broadcast::Receiver<StoreEvent> {
        self.inner.feed.subscribe()
    }

    fn publish(&self, kind: StoreEventKind, resource: Resource) {
        let _ = self.inner.feed.send(StoreEvent { kind, resource });
    }
}

fn check_owner(stored: &Resource, writer: &str) -> Result<(), StoreError> {
    if !stored.meta.owner.is_empty() && stored.meta.owner != writer {
        return Err(StoreError::OwnerMismatch {
            namespace: stored.meta.namespace.clone(),
            ty: stored.meta.ty,
            id: stored.meta.id.clone(),
            owner: stored.meta.owner.clone(),
            writer: writer.to_string(),
        });
    }

    Ok(())
}

/// Filtered subscription to store events.
pub struct Watch {
    rx: broadcast::Receiver<StoreEvent>,
    namespace: String,
    ty: &'static str,
    id: Option<String>,
}

impl Watch {
    /// Receives the next matching event.
    ///
    /// Returns `None` when the store is dropped. A lagging watcher skips the
    /// overwritten events and keeps receiving from the oldest retained one.
    pub async fn recv(&mut self) -> Option<StoreEvent> {
        loop {
            match self.rx.recv().await {
                Ok(ev) => {
                    if ev.resource.meta.namespace == self.namespace
                        && ev.resource.meta.ty == self.ty
                        && self.id.as_deref().map_or(true, |id| ev.resource.meta.id == id)
                    {
                        return Some(ev);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "store watcher lagged");
                    continue;
                }
            }
        }
    }
}
