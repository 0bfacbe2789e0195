//! # Service abstraction for supervised execution.
//!
//! A [`Service`] bundles everything the supervisor needs: identity, the
//! pre-start hook, the declared dependencies, the optional start condition,
//! the restart policy, the optional health check, and the [`Runner`] that is
//! the service's long-lived body.
//!
//! ## Rules
//! - `pre` failures are terminal (no retry); runner exits obey the restart
//!   policy.
//! - Runners receive a [`CancellationToken`] and **must** return promptly
//!   when it fires; the supervisor force-aborts after the stop grace.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::HealthSettings;
use crate::error::TaskError;
use crate::policies::RestartPolicy;
use crate::runtime::Runtime;

/// Boxed future returned by function-backed runners.
pub type BoxRunnerFuture = Pin<Box<dyn Future<Output = Result<(), TaskError>> + Send + 'static>>;

/// Shared handle to a runner.
pub type RunnerRef = Arc<dyn Runner>;

/// The long-lived body of a service.
#[async_trait]
pub trait Runner: Send + Sync + 'static {
    /// Runs until exit or cancellation. A cancellation-driven return should
    /// be `Err(TaskError::Canceled)` (or `Ok` for a clean finish).
    async fn run(&self, token: CancellationToken) -> Result<(), TaskError>;
}

/// Function-backed [`Runner`], for in-process services and tests.
pub struct RunnerFn {
    f: Box<dyn Fn(CancellationToken) -> BoxRunnerFuture + Send + Sync>,
}

impl RunnerFn {
    /// Wraps a closure as a shared runner.
    pub fn arc<F, Fut>(f: F) -> RunnerRef
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        Arc::new(Self {
            f: Box::new(move |token| Box::pin(f(token))),
        })
    }
}

#[async_trait]
impl Runner for RunnerFn {
    async fn run(&self, token: CancellationToken) -> Result<(), TaskError> {
        (self.f)(token).await
    }
}

/// Outcome of a start condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionOutcome {
    /// The gate opened.
    Ready,
    /// The gate will never open; the service is skipped.
    Never,
    /// Cancelled while waiting.
    Canceled,
}

/// A gate a service waits on before its dependencies.
#[async_trait]
pub trait Condition: Send + Sync + 'static {
    /// Describes the gate for events and logs.
    fn describe(&self) -> String;

    /// Blocks until the gate resolves.
    async fn wait(&self, token: &CancellationToken) -> ConditionOutcome;
}

/// Condition that waits for a file to exist.
pub struct FileExists {
    path: PathBuf,
    poll: Duration,
}

impl FileExists {
    /// Waits for `path`, polling once a second.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            poll: Duration::from_secs(1),
        }
    }
}

#[async_trait]
impl Condition for FileExists {
    fn describe(&self) -> String {
        format!("file {:?} to exist", self.path)
    }

    async fn wait(&self, token: &CancellationToken) -> ConditionOutcome {
        loop {
            if tokio::fs::metadata(&self.path).await.is_ok() {
                return ConditionOutcome::Ready;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll) => {}
                _ = token.cancelled() => return ConditionOutcome::Canceled,
            }
        }
    }
}

/// A liveness probe for a running service.
#[async_trait]
pub trait HealthCheck: Send + Sync + 'static {
    /// One probe; `Err` carries the failure reason.
    async fn probe(&self) -> Result<(), String>;
}

/// A supervised long-lived service.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Stable service id (`etcd`, `kubelet`, ...).
    fn id(&self) -> &str;

    /// Pre-start hook: PKI generation, image pull, argument assembly.
    /// A failure here is terminal.
    async fn pre(&self, rt: &Runtime) -> Result<(), TaskError> {
        let _ = rt;
        Ok(())
    }

    /// Optional gate to satisfy before dependency waiting.
    fn condition(&self, rt: &Runtime) -> Option<Arc<dyn Condition>> {
        let _ = rt;
        None
    }

    /// Ids of services that must be running and healthy first.
    fn depends_on(&self, rt: &Runtime) -> Vec<String> {
        let _ = rt;
        Vec::new()
    }

    /// Restart policy for runner exits.
    fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy::OnFailure
    }

    /// Optional health check polled while running.
    fn health_check(&self) -> Option<Arc<dyn HealthCheck>> {
        None
    }

    /// Probe cadence and thresholds.
    fn health_settings(&self) -> HealthSettings {
        HealthSettings::default()
    }

    /// Builds the runner for this service.
    async fn runner(&self, rt: &Runtime) -> Result<RunnerRef, TaskError>;
}
