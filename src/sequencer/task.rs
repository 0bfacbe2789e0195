//! # The task contract: `(setup, execute)` pairs grouped into phases.
//!
//! A task's `setup` runs synchronously when its phase starts; it may branch
//! on the sequence and request data and return `None` to skip the task
//! entirely. The returned [`PhaseTask`] carries the `execute` closure, which
//! must be idempotent and return promptly once its token fires.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::TaskError;
use crate::runtime::Runtime;
use crate::sequencer::{Request, Sequence};

/// Boxed future returned by a task execution.
pub type BoxTaskFuture = Pin<Box<dyn Future<Output = Result<(), TaskError>> + Send + 'static>>;

type TaskFunc = Arc<dyn Fn(CancellationToken, Arc<Runtime>) -> BoxTaskFuture + Send + Sync>;

/// A task selected for execution by its `setup`.
#[derive(Clone)]
pub struct PhaseTask {
    /// Task name, for events and error aggregation.
    pub name: &'static str,
    func: TaskFunc,
}

impl PhaseTask {
    /// Wraps an execute closure under a task name.
    pub fn new<F, Fut>(name: &'static str, f: F) -> Self
    where
        F: Fn(CancellationToken, Arc<Runtime>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        Self {
            name,
            func: Arc::new(move |token, rt| Box::pin(f(token, rt))),
        }
    }

    /// Builds the execution future.
    pub(crate) fn invoke(&self, token: CancellationToken, rt: Arc<Runtime>) -> BoxTaskFuture {
        (self.func)(token, rt)
    }
}

/// Task setup: branches on sequence and request data; `None` skips the task.
pub type TaskSetup = fn(Sequence, &Request) -> Option<PhaseTask>;

/// An ordered group of tasks executed concurrently.
pub struct Phase {
    /// Phase name, for progress events and failure reports.
    pub name: &'static str,
    /// Task setups evaluated when the phase starts.
    pub tasks: Vec<TaskSetup>,
}

impl Phase {
    /// Creates a phase.
    pub fn new(name: &'static str, tasks: Vec<TaskSetup>) -> Self {
        Self { name, tasks }
    }
}
