//! # Health probe loop.
//!
//! Polls a service's [`HealthCheck`] at a fixed period with an independent
//! per-probe deadline. Crossing the consecutive-failure threshold flips
//! health to unhealthy; a single success flips it back. Probe failures never
//! stop the service.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::HealthSettings;
use crate::services::service::HealthCheck;
use crate::services::state::Health;
use crate::services::supervisor::ServiceRecord;

pub(crate) async fn probe_loop(
    record: Arc<ServiceRecord>,
    check: Arc<dyn HealthCheck>,
    settings: HealthSettings,
    token: CancellationToken,
) {
    tokio::select! {
        _ = tokio::time::sleep(settings.initial_delay) => {}
        _ = token.cancelled() => return,
    }

    let mut consecutive_failures: u32 = 0;

    loop {
        let outcome = tokio::select! {
            res = tokio::time::timeout(settings.timeout, check.probe()) => match res {
                Ok(Ok(())) => Ok(()),
                Ok(Err(reason)) => Err(reason),
                Err(_elapsed) => Err(format!("probe deadline {:?} exceeded", settings.timeout)),
            },
            _ = token.cancelled() => return,
        };

        match outcome {
            Ok(()) => {
                consecutive_failures = 0;
                record.set_health(Health::Healthy, None);
            }
            Err(reason) => {
                consecutive_failures += 1;
                debug!(
                    service = %record.id,
                    failures = consecutive_failures,
                    reason = %reason,
                    "health probe failed",
                );

                if consecutive_failures >= settings.failure_threshold {
                    record.set_health(Health::Unhealthy, Some(reason));
                }
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(settings.period) => {}
            _ = token.cancelled() => return,
        }
    }
}
