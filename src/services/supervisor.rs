//! # Supervisor: the process-wide service registry.
//!
//! Owns the set of supervised services and orchestrates their lifecycle.
//!
//! ## Architecture
//! ```text
//! load(svc)*  ──►  DashMap<id, ServiceRecord>
//!
//! start(ids)
//!   └─► per id: spawn actor (actor.rs)
//!         └──► Preparing → Waiting → Running → ... (events to Bus + ring)
//!
//! stop(ids) / shutdown()
//!   ├─► cancel service token (graceful)
//!   ├─► wait up to stop grace, then abort the actor
//!   └─► shutdown(): reverse dependency order, then grace accounting
//! ```
//!
//! ## Rules
//! - `load` is idempotent per id for the same service; a different service
//!   under an already-registered id is rejected. Records persist for the
//!   runtime lifetime.
//! - A service is never started while its previous actor is still live.
//! - Dependency edges are honored by the actors, not by `start` ordering:
//!   independent services start in parallel.
//! - Transitions append to the bounded ring and publish on the bus.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::RuntimeError;
use crate::events::{Bus, Event, EventKind};
use crate::runtime::Runtime;
use crate::services::actor;
use crate::services::state::{EventRing, Health, ServiceInfo, ServiceState, StateSnapshot};
use crate::services::Service;

struct ActorHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
}

/// One registered service: shared by the registry, its actor, and waiters.
pub(crate) struct ServiceRecord {
    pub(crate) id: String,
    pub(crate) service: Arc<dyn Service>,
    bus: Bus,
    state_tx: watch::Sender<StateSnapshot>,
    events: StdMutex<EventRing>,
    actor: Mutex<Option<ActorHandle>>,
}

impl ServiceRecord {
    fn new(service: Arc<dyn Service>, bus: Bus) -> Arc<Self> {
        let (state_tx, _) = watch::channel(StateSnapshot::default());

        Arc::new(Self {
            id: service.id().to_string(),
            service,
            bus,
            state_tx,
            events: StdMutex::new(EventRing::default()),
            actor: Mutex::new(None),
        })
    }

    /// Current state + health.
    pub(crate) fn snapshot(&self) -> StateSnapshot {
        *self.state_tx.borrow()
    }

    /// Subscribes to state + health changes.
    pub(crate) fn subscribe(&self) -> watch::Receiver<StateSnapshot> {
        self.state_tx.subscribe()
    }

    /// Moves the service to `state`, recording and publishing the transition.
    pub(crate) fn transition(&self, state: ServiceState, message: impl Into<String>) {
        let message = message.into();

        self.state_tx.send_modify(|snap| snap.state = state);
        self.events
            .lock()
            .expect("event ring poisoned")
            .push(state, message.clone());

        let mut ev = Event::now(EventKind::ServiceStateChanged)
            .with_subject(&self.id)
            .with_state(state.as_str());
        if matches!(state, ServiceState::Failed) && !message.is_empty() {
            ev = ev.with_error(message);
        }

        self.bus.publish(ev);
    }

    /// Updates health; publishes only on change.
    pub(crate) fn set_health(&self, health: Health, reason: Option<String>) {
        let mut changed = false;
        self.state_tx.send_modify(|snap| {
            changed = snap.health != health;
            snap.health = health;
        });

        if changed {
            let mut ev = Event::now(EventKind::ServiceHealthChanged)
                .with_subject(&self.id)
                .with_state(health.as_str());
            if let Some(reason) = reason {
                ev = ev.with_error(reason);
            }

            self.bus.publish(ev);
        }
    }

    pub(crate) fn publish_restart(&self, delay: Duration, error: &str) {
        self.bus.publish(
            Event::now(EventKind::ServiceRestartScheduled)
                .with_subject(&self.id)
                .with_delay(delay)
                .with_error(error),
        );
    }
}

/// The process-wide service registry and supervisor.
pub struct Supervisor {
    services: DashMap<String, Arc<ServiceRecord>>,
    load_order: StdMutex<Vec<String>>,
    bus: Bus,
    cfg: Config,
    root: CancellationToken,
}

impl Supervisor {
    /// Creates an empty registry.
    pub fn new(cfg: Config, bus: Bus, root: CancellationToken) -> Self {
        Self {
            services: DashMap::new(),
            load_order: StdMutex::new(Vec::new()),
            bus,
            cfg,
            root,
        }
    }

    /// Registers a service.
    ///
    /// Idempotent for the same service: re-loading it under its id is a
    /// no-op. Loading a *different* service under an already-registered id
    /// is rejected with [`RuntimeError::ServiceAlreadyExists`].
    pub fn load(&self, service: Arc<dyn Service>) -> Result<(), RuntimeError> {
        let id = service.id().to_string();

        if let Some(existing) = self.services.get(&id) {
            if Arc::ptr_eq(&existing.value().service, &service) {
                return Ok(());
            }

            return Err(RuntimeError::ServiceAlreadyExists { id });
        }

        let record = ServiceRecord::new(service, self.bus.clone());
        self.services.insert(id.clone(), record);
        self.load_order
            .lock()
            .expect("load order poisoned")
            .push(id.clone());

        self.bus
            .publish(Event::now(EventKind::ServiceLoaded).with_subject(id));

        Ok(())
    }

    /// Ids of all registered services, in load order.
    pub fn list(&self) -> Vec<String> {
        self.load_order.lock().expect("load order poisoned").clone()
    }

    /// Starts the listed services, honoring dependency gating inside each
    /// actor. Already-running services are left alone.
    pub async fn start(&self, rt: &Arc<Runtime>, ids: &[&str]) -> Result<(), RuntimeError> {
        for id in ids {
            let record = self.record(id)?;
            let mut slot = record.actor.lock().await;

            if let Some(handle) = slot.as_ref() {
                if !handle.join.is_finished() {
                    debug!(service = %id, "already supervised, skipping start");
                    continue;
                }
            }

            let token = self.root.child_token();
            let join = tokio::spawn(actor::supervise(
                Arc::clone(&record),
                Arc::clone(rt),
                self.cfg.clone(),
                token.clone(),
            ));

            *slot = Some(ActorHandle { token, join });
        }

        Ok(())
    }

    /// Starts every loaded service.
    pub async fn start_all(&self, rt: &Arc<Runtime>) -> Result<(), RuntimeError> {
        let ids = self.list();
        let refs: Vec<&str> = ids.iter().map(String::as_str).collect();

        self.start(rt, &refs).await
    }

    /// Stops the listed services: graceful cancellation, then a forced abort
    /// after the stop grace.
    pub async fn stop(&self, ids: &[&str]) -> Result<(), RuntimeError> {
        for id in ids {
            let record = self.record(id)?;
            self.stop_record(&record).await;
        }

        Ok(())
    }

    async fn stop_record(&self, record: &Arc<ServiceRecord>) {
        let handle = record.actor.lock().await.take();

        let Some(handle) = handle else { return };

        handle.token.cancel();
        let mut join = handle.join;

        match tokio::time::timeout(self.cfg.stop_grace, &mut join).await {
            Ok(_) => {}
            Err(_) => {
                warn!(service = %record.id, "stop grace exceeded, aborting");
                join.abort();
                let _ = join.await;
                record.transition(ServiceState::Finished, "force killed after stop grace");
            }
        }
    }

    /// Stops every service in reverse dependency order and reports services
    /// that were still alive when the shutdown grace ran out.
    pub async fn shutdown(&self, rt: &Arc<Runtime>) -> Result<(), RuntimeError> {
        let order = self.stop_order(rt);

        let all = async {
            for id in &order {
                if let Ok(record) = self.record(id) {
                    self.stop_record(&record).await;
                }
            }
        };

        match tokio::time::timeout(self.cfg.grace, all).await {
            Ok(()) => {
                self.bus.publish(Event::now(EventKind::AllStoppedWithin));
                Ok(())
            }
            Err(_) => {
                let stuck: Vec<String> = self
                    .services
                    .iter()
                    .filter(|r| !r.value().snapshot().state.is_terminal())
                    .map(|r| r.key().clone())
                    .collect();

                self.bus.publish(Event::now(EventKind::GraceExceeded));

                Err(RuntimeError::GraceExceeded {
                    grace: self.cfg.grace,
                    stuck,
                })
            }
        }
    }

    /// Computes the stop order: dependents before their dependencies.
    fn stop_order(&self, rt: &Arc<Runtime>) -> Vec<String> {
        let ids = self.list();
        let mut deps: HashMap<String, Vec<String>> = HashMap::new();

        for id in &ids {
            if let Some(record) = self.services.get(id) {
                deps.insert(id.clone(), record.service.depends_on(rt));
            }
        }

        // Topological order, dependencies first; reversed for stopping.
        let mut order = Vec::with_capacity(ids.len());
        let mut visited: HashMap<String, bool> = HashMap::new();

        fn visit(
            id: &str,
            deps: &HashMap<String, Vec<String>>,
            visited: &mut HashMap<String, bool>,
            order: &mut Vec<String>,
        ) {
            match visited.get(id) {
                Some(_) => return,
                None => {
                    visited.insert(id.to_string(), true);
                }
            }

            for dep in deps.get(id).map(Vec::as_slice).unwrap_or_default() {
                visit(dep, deps, visited, order);
            }

            order.push(id.to_string());
        }

        for id in &ids {
            visit(id, &deps, &mut visited, &mut order);
        }

        order.reverse();
        order
    }

    /// Returns state, health, and the last transitions of a service.
    pub fn info(&self, id: &str) -> Result<ServiceInfo, RuntimeError> {
        let record = self.record(id)?;
        let snap = record.snapshot();

        let info = ServiceInfo {
            id: record.id.clone(),
            state: snap.state,
            health: snap.health,
            events: record.events.lock().expect("event ring poisoned").last(32),
        };

        Ok(info)
    }

    /// Blocks until the service reaches one of `states`.
    pub async fn wait(
        &self,
        id: &str,
        states: &[ServiceState],
        timeout: Duration,
    ) -> Result<ServiceState, RuntimeError> {
        let record = self.record(id)?;
        let mut rx = record.subscribe();

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            let snap = *rx.borrow_and_update();
            if states.contains(&snap.state) {
                return Ok(snap.state);
            }

            tokio::select! {
                _ = &mut deadline => {
                    return Err(RuntimeError::WaitTimeout {
                        id: id.to_string(),
                        timeout,
                    });
                }
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(RuntimeError::ServiceNotFound { id: id.to_string() });
                    }
                }
            }
        }
    }

    /// Subscribes to a service's state channel.
    pub fn subscribe(&self, id: &str) -> Result<watch::Receiver<StateSnapshot>, RuntimeError> {
        Ok(self.record(id)?.subscribe())
    }

    pub(crate) fn record(&self, id: &str) -> Result<Arc<ServiceRecord>, RuntimeError> {
        self.services
            .get(id)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| RuntimeError::ServiceNotFound { id: id.to_string() })
    }
}
