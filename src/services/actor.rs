//! # Per-service supervision loop.
//!
//! Drives one service through its state machine:
//!
//! ```text
//! loop {
//!   ├─► Preparing: pre-start hook (failure is terminal)
//!   ├─► Waiting:   condition gate, then each dependency Running+healthy
//!   ├─► Running:   runner started, health probe loop alongside
//!   └─► exit:
//!         Ok            → Finished; restart only under RestartPolicy::Always
//!         Err(Canceled) → Finished (cooperative stop)
//!         Err(_)        → Failed; restart under OnFailure/Always
//!                          after backoff (100 ms doubling to 60 s,
//!                          reset by a ≥ 60 s clean run)
//! }
//! ```
//!
//! ## Rules
//! - Pre-start failure is terminal and never retried.
//! - A health-probe failure never stops the service; it only flips health.
//! - Restarts pass through Preparing and Waiting again.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::TaskError;
use crate::runtime::Runtime;
use crate::services::health;
use crate::services::service::ConditionOutcome;
use crate::services::state::{Health, ServiceState};
use crate::services::supervisor::ServiceRecord;

/// Supervises one service until terminal state or cancellation.
pub(crate) async fn supervise(
    record: Arc<ServiceRecord>,
    rt: Arc<Runtime>,
    cfg: Config,
    token: CancellationToken,
) {
    let service = Arc::clone(&record.service);
    let mut prev_delay: Option<Duration> = None;

    loop {
        record.transition(ServiceState::Preparing, "running pre-start hook");

        if let Err(e) = service.pre(&rt).await {
            warn!(service = %record.id, error = %e, "pre-start hook failed");
            record.transition(ServiceState::Failed, format!("pre-start failed: {e}"));
            return;
        }

        record.transition(ServiceState::Waiting, "waiting on condition and dependencies");

        if let Some(condition) = service.condition(&rt) {
            match condition.wait(&token).await {
                ConditionOutcome::Ready => {}
                ConditionOutcome::Never => {
                    record.transition(
                        ServiceState::Skipped,
                        format!("condition will never be satisfied: {}", condition.describe()),
                    );
                    return;
                }
                ConditionOutcome::Canceled => {
                    record.transition(ServiceState::Finished, "canceled while waiting");
                    return;
                }
            }
        }

        for dep in service.depends_on(&rt) {
            if !wait_for_dependency(&record, &rt, &dep, &token).await {
                return;
            }
        }

        let runner = match service.runner(&rt).await {
            Ok(runner) => runner,
            Err(e) => {
                warn!(service = %record.id, error = %e, "runner construction failed");
                record.transition(ServiceState::Failed, format!("runner failed: {e}"));
                return;
            }
        };

        record.transition(ServiceState::Running, "runner started");

        let initial_health = if service.health_check().is_some() {
            Health::Unknown
        } else {
            Health::NotApplicable
        };
        record.set_health(initial_health, None);

        let probe_token = token.child_token();
        let probe = service.health_check().map(|check| {
            tokio::spawn(health::probe_loop(
                Arc::clone(&record),
                check,
                service.health_settings(),
                probe_token.clone(),
            ))
        });

        let started = Instant::now();
        let result = runner.run(token.child_token()).await;

        probe_token.cancel();
        if let Some(probe) = probe {
            let _ = probe.await;
        }
        record.set_health(Health::Unknown, None);

        let failed = match &result {
            Ok(()) => {
                info!(service = %record.id, "runner finished");
                false
            }
            Err(TaskError::Canceled) => {
                record.transition(ServiceState::Finished, "canceled");
                return;
            }
            Err(e) => {
                warn!(service = %record.id, error = %e, "runner failed");
                true
            }
        };

        let message = match &result {
            Ok(()) => "runner exited".to_string(),
            Err(e) => format!("runner failed: {e}"),
        };
        record.transition(
            if failed {
                ServiceState::Failed
            } else {
                ServiceState::Finished
            },
            message.clone(),
        );

        if token.is_cancelled() || !service.restart_policy().permits(failed) {
            return;
        }

        // A sufficiently long clean run resets the backoff progression.
        if started.elapsed() >= cfg.backoff_reset_after {
            prev_delay = None;
        }

        let delay = cfg.backoff.next(prev_delay);
        prev_delay = Some(delay);

        debug!(service = %record.id, ?delay, "restart scheduled");
        record.publish_restart(delay, &message);

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = token.cancelled() => return,
        }
    }
}

/// Waits for one dependency to be Running and healthy.
///
/// Returns `false` when supervision should end (cancellation or a vanished
/// dependency).
async fn wait_for_dependency(
    record: &ServiceRecord,
    rt: &Runtime,
    dep: &str,
    token: &CancellationToken,
) -> bool {
    let mut rx = match rt.services().subscribe(dep) {
        Ok(rx) => rx,
        Err(_) => {
            record.transition(
                ServiceState::Failed,
                format!("unknown dependency '{dep}'"),
            );
            return false;
        }
    };

    loop {
        let snap = *rx.borrow_and_update();
        if snap.state == ServiceState::Running && snap.health.satisfies_dependency() {
            return true;
        }

        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    record.transition(
                        ServiceState::Failed,
                        format!("dependency '{dep}' is gone"),
                    );
                    return false;
                }
            }
            _ = token.cancelled() => {
                record.transition(ServiceState::Finished, "canceled while waiting");
                return false;
            }
        }
    }
}
