//! # nodevisor
//!
//! **Nodevisor** is the machine runtime engine of a minimal, API-driven
//! Kubernetes node OS: the state-driven composition of a service supervisor,
//! a lifecycle sequencer, and a reconciliation controller framework.
//!
//! ## Features
//!
//! | Area            | Description                                                         | Key types / traits                          |
//! |-----------------|---------------------------------------------------------------------|---------------------------------------------|
//! | **Services**    | Supervise long-lived services with health, deps, restart policies.  | [`Service`], [`Supervisor`], [`Runner`]     |
//! | **Sequencer**   | Run lifecycle events as ordered phases of concurrent tasks.         | [`Sequence`], [`Sequencer`], [`PhaseTask`]  |
//! | **Controllers** | Converge declarative resources into kernel state.                   | [`Controller`], [`ControllerRuntime`]       |
//! | **Resources**   | Versioned in-memory store with finalizers and watch.                | [`Resource`], [`Store`]                     |
//! | **Policies**    | Restart/backoff strategies shared by services and controllers.      | [`RestartPolicy`], [`BackoffPolicy`]        |
//! | **Errors**      | Typed errors; retryable vs fatal is a property of the kind.         | [`TaskError`], [`RuntimeError`]             |
//!
//! ## Overview
//!
//! ```text
//! operator input (config file, API call, kernel cmdline)
//!        │
//!        ▼
//!   Sequencer ──► tasks ──► resource Store ──► Controllers ──► kernel (netlink)
//!        │                                        ▲
//!        └──────► Supervisor (services) ──────────┘ (deps on kernel state)
//! ```
//!
//! The [`Runtime`] value owns all of it; build one with [`RuntimeBuilder`],
//! then run sequences:
//!
//! ```no_run
//! use nodevisor::{RuntimeBuilder, Sequence, Request};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let rt = RuntimeBuilder::new().build();
//!
//!     rt.run_sequence(Sequence::Boot, Request::default()).await?;
//!     Ok(())
//! }
//! ```

pub mod adv;
pub mod config;
pub mod controllers;
pub mod error;
pub mod events;
pub mod install;
pub mod kernel;
pub mod machine;
pub mod platform;
pub mod policies;
pub mod resources;
pub mod sequencer;
pub mod services;

mod runtime;

pub use config::{Config, HealthSettings};
pub use controllers::{Controller, ControllerRuntime};
pub use error::{retry_transient, RuntimeError, TaskError};
pub use events::{Bus, Event, EventKind};
pub use policies::{BackoffPolicy, JitterPolicy, RestartPolicy};
pub use resources::{Resource, Store};
pub use runtime::{Runtime, RuntimeBuilder};
pub use sequencer::{PhaseTask, Request, Sequence, Sequencer};
pub use services::{Runner, Service, ServiceState, Supervisor};
