//! # Sequencer: single-flight execution of lifecycle sequences.
//!
//! ## Architecture
//! ```text
//! run(sequence, request)
//!   ├─► claim the active slot
//!   │     ├─ empty                → install execution record
//!   │     ├─ busy + preempting    → cancel active, wait for it, retry claim
//!   │     └─ busy + not preempting → Err(SequenceInProgress)
//!   │
//!   └─► per phase (strictly ordered):
//!         ├─► setup() every task (may skip)
//!         ├─► fan out into a JoinSet (concurrent)
//!         ├─► await ALL tasks, even after a failure (effects are reported)
//!         └─► failure → aggregate errors, skip later phases
//! ```
//!
//! ## Rules
//! - Only `Reboot`, `Shutdown`, and `Reset` preempt; anything else is
//!   rejected while a sequence runs.
//! - Task cancellation is cooperative: the phase token fires, tasks return
//!   at their next suspension point, the sequence reports `Canceled`.
//! - A panicking task is reported as a fatal task error, not a poisoned
//!   runtime.

use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{RuntimeError, TaskError};
use crate::events::{Bus, Event, EventKind};
use crate::runtime::Runtime;
use crate::sequencer::{plan, Request, Sequence};

struct ActiveSlot {
    sequence: Sequence,
    token: CancellationToken,
    done_rx: watch::Receiver<bool>,
}

/// The process-wide sequence executor.
pub struct Sequencer {
    active: Mutex<Option<ActiveSlot>>,
    bus: Bus,
}

impl Sequencer {
    /// Creates an idle sequencer.
    pub fn new(bus: Bus) -> Self {
        Self {
            active: Mutex::new(None),
            bus,
        }
    }

    /// The sequence currently holding the execution slot, if any.
    pub fn active(&self) -> Option<Sequence> {
        self.active
            .lock()
            .expect("sequencer slot poisoned")
            .as_ref()
            .map(|a| a.sequence)
    }

    /// Executes `sequence`, applying the preemption policy against any
    /// active execution.
    pub async fn run(
        &self,
        rt: &Arc<Runtime>,
        sequence: Sequence,
        request: Request,
    ) -> Result<(), RuntimeError> {
        let (token, done_tx) = loop {
            let waiter = {
                let mut slot = self.active.lock().expect("sequencer slot poisoned");

                match slot.as_ref() {
                    None => {
                        let token = rt.root_token().child_token();
                        let (done_tx, done_rx) = watch::channel(false);

                        *slot = Some(ActiveSlot {
                            sequence,
                            token: token.clone(),
                            done_rx,
                        });

                        break (token, done_tx);
                    }
                    Some(active) if sequence.preempts() => {
                        warn!(
                            running = %active.sequence,
                            requested = %sequence,
                            "preempting active sequence",
                        );
                        self.bus.publish(
                            Event::now(EventKind::SequencePreempted)
                                .with_sequence(active.sequence.as_str())
                                .with_error(format!("preempted by {sequence}")),
                        );

                        active.token.cancel();
                        active.done_rx.clone()
                    }
                    Some(active) => {
                        return Err(RuntimeError::SequenceInProgress {
                            running: active.sequence,
                            requested: sequence,
                        });
                    }
                }
            };

            let mut waiter = waiter;
            while !*waiter.borrow_and_update() {
                if waiter.changed().await.is_err() {
                    break;
                }
            }
        };

        let result = self.execute(rt, sequence, &request, &token).await;

        {
            let mut slot = self.active.lock().expect("sequencer slot poisoned");
            *slot = None;
        }
        let _ = done_tx.send(true);

        match &result {
            Ok(()) => {
                self.bus.publish(
                    Event::now(EventKind::SequenceFinished).with_sequence(sequence.as_str()),
                );
            }
            Err(e) => {
                self.bus.publish(
                    Event::now(EventKind::SequenceFailed)
                        .with_sequence(sequence.as_str())
                        .with_error(e.to_string()),
                );
            }
        }

        result
    }

    async fn execute(
        &self,
        rt: &Arc<Runtime>,
        sequence: Sequence,
        request: &Request,
        token: &CancellationToken,
    ) -> Result<(), RuntimeError> {
        info!(sequence = %sequence, "sequence starting");
        self.bus
            .publish(Event::now(EventKind::SequenceStarted).with_sequence(sequence.as_str()));

        for phase in plan::phases(sequence, request) {
            if token.is_cancelled() {
                return Err(RuntimeError::SequenceCanceled { sequence });
            }

            info!(sequence = %sequence, phase = phase.name, "phase starting");
            self.bus.publish(
                Event::now(EventKind::PhaseStarted)
                    .with_sequence(sequence.as_str())
                    .with_phase(phase.name),
            );

            let mut set: JoinSet<(&'static str, Result<(), TaskError>)> = JoinSet::new();

            for setup in &phase.tasks {
                let Some(task) = setup(sequence, request) else {
                    continue;
                };

                let name = task.name;
                let fut = task.invoke(token.child_token(), Arc::clone(rt));
                set.spawn(async move { (name, fut.await) });
            }

            // Await every task: a failed phase still reports all effects.
            let mut errors: Vec<(String, TaskError)> = Vec::new();

            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok((_, Ok(()))) => {}
                    Ok((_, Err(TaskError::Canceled))) => {}
                    Ok((name, Err(e))) => {
                        warn!(
                            sequence = %sequence,
                            phase = phase.name,
                            task = name,
                            error = %e,
                            "task failed",
                        );
                        self.bus.publish(
                            Event::now(EventKind::TaskFailed)
                                .with_sequence(sequence.as_str())
                                .with_phase(phase.name)
                                .with_subject(name)
                                .with_error(e.to_string()),
                        );
                        errors.push((name.to_string(), e));
                    }
                    Err(join_err) => {
                        errors.push((
                            "<panicked>".to_string(),
                            TaskError::fatal(join_err.to_string()),
                        ));
                    }
                }
            }

            if token.is_cancelled() {
                return Err(RuntimeError::SequenceCanceled { sequence });
            }

            if !errors.is_empty() {
                self.bus.publish(
                    Event::now(EventKind::PhaseFailed)
                        .with_sequence(sequence.as_str())
                        .with_phase(phase.name),
                );

                return Err(RuntimeError::PhaseFailed {
                    sequence,
                    phase: phase.name.to_string(),
                    errors,
                });
            }

            self.bus.publish(
                Event::now(EventKind::PhaseFinished)
                    .with_sequence(sequence.as_str())
                    .with_phase(phase.name),
            );
        }

        Ok(())
    }
}
