//! Service supervision: long-lived processes under a health-checked restart
//! policy with dependency ordering.
//!
//! ## Files & responsibilities
//! - **state.rs**: the per-service state machine labels, health, and the
//!   bounded transition ring.
//! - **service.rs**: the [`Service`] trait and its collaborator seams
//!   ([`Runner`], [`Condition`], [`HealthCheck`]).
//! - **supervisor.rs**: [`Supervisor`]: the registry with `load`,
//!   `start`, `stop`, `info`, `wait`, and reverse-order shutdown.
//! - **actor.rs**: the per-service supervision loop (Preparing → Waiting →
//!   Running, restart with capped backoff).
//! - **health.rs**: the probe loop; failures only flip the health field.

mod actor;
pub mod etcd;
mod health;
mod service;
mod state;
mod supervisor;

pub use service::{
    Condition, ConditionOutcome, FileExists, HealthCheck, Runner, RunnerFn, RunnerRef, Service,
};
pub use state::{Health, ServiceEvent, ServiceInfo, ServiceState, StateSnapshot};
pub use supervisor::Supervisor;
