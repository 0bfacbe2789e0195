//! Service supervision: dependency gating, restart backoff, health
//! semantics, stop and wait.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use nodevisor::config::HealthSettings;
use nodevisor::error::{RuntimeError, TaskError};
use nodevisor::events::EventKind;
use nodevisor::policies::RestartPolicy;
use nodevisor::services::{
    Condition, ConditionOutcome, Health, HealthCheck, RunnerFn, RunnerRef, Service, ServiceState,
};
use nodevisor::{Runtime, RuntimeBuilder};

use common::eventually;

type Log = Arc<Mutex<Vec<String>>>;

fn log_push(log: &Log, entry: impl Into<String>) {
    log.lock().unwrap().push(entry.into());
}

fn fast_health() -> HealthSettings {
    HealthSettings {
        initial_delay: Duration::from_millis(1),
        period: Duration::from_millis(5),
        timeout: Duration::from_secs(1),
        failure_threshold: 3,
    }
}

/// Probe backed by a flag the runner flips; logs its first success.
struct FlagCheck {
    id: &'static str,
    flag: Arc<AtomicBool>,
    log: Log,
    reported: AtomicBool,
}

#[async_trait]
impl HealthCheck for FlagCheck {
    async fn probe(&self) -> Result<(), String> {
        if self.flag.load(Ordering::SeqCst) {
            if !self.reported.swap(true, Ordering::SeqCst) {
                log_push(&self.log, format!("{} healthy", self.id));
            }
            Ok(())
        } else {
            Err("not up yet".to_string())
        }
    }
}

struct TestService {
    id: &'static str,
    deps: Vec<String>,
    policy: RestartPolicy,
    checked: bool,
    healthy: Arc<AtomicBool>,
    log: Log,
    fail: bool,
}

impl TestService {
    fn new(id: &'static str, log: Log) -> Self {
        Self {
            id,
            deps: Vec::new(),
            policy: RestartPolicy::OnFailure,
            checked: false,
            healthy: Arc::new(AtomicBool::new(false)),
            log,
            fail: false,
        }
    }

    fn with_deps(mut self, deps: &[&str]) -> Self {
        self.deps = deps.iter().map(|s| s.to_string()).collect();
        self
    }

    fn with_health_check(mut self) -> Self {
        self.checked = true;
        self
    }

    fn failing(mut self) -> Self {
        self.fail = true;
        self
    }
}

#[async_trait]
impl Service for TestService {
    fn id(&self) -> &str {
        self.id
    }

    fn depends_on(&self, _rt: &Runtime) -> Vec<String> {
        self.deps.clone()
    }

    fn restart_policy(&self) -> RestartPolicy {
        self.policy
    }

    fn health_check(&self) -> Option<Arc<dyn HealthCheck>> {
        self.checked.then(|| {
            Arc::new(FlagCheck {
                id: self.id,
                flag: Arc::clone(&self.healthy),
                log: Arc::clone(&self.log),
                reported: AtomicBool::new(false),
            }) as Arc<dyn HealthCheck>
        })
    }

    fn health_settings(&self) -> HealthSettings {
        fast_health()
    }

    async fn runner(&self, _rt: &Runtime) -> Result<RunnerRef, TaskError> {
        let id = self.id;
        let fail = self.fail;
        let healthy = Arc::clone(&self.healthy);
        let log = Arc::clone(&self.log);

        Ok(RunnerFn::arc(move |token: CancellationToken| {
            let healthy = Arc::clone(&healthy);
            let log = Arc::clone(&log);

            async move {
                if fail {
                    return Err(TaskError::fatal("boom"));
                }

                log_push(&log, format!("{id} running"));
                tokio::time::sleep(Duration::from_millis(20)).await;
                healthy.store(true, Ordering::SeqCst);

                token.cancelled().await;
                Err(TaskError::Canceled)
            }
        }))
    }
}

// S5: etcd never reports Running before containerd and networkd are
// Running and healthy.
#[tokio::test(start_paused = true)]
async fn dependency_gating() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let rt = RuntimeBuilder::new().build();

    rt.services()
        .load(Arc::new(
            TestService::new("containerd", Arc::clone(&log)).with_health_check(),
        ))
        .unwrap();
    rt.services()
        .load(Arc::new(
            TestService::new("networkd", Arc::clone(&log)).with_health_check(),
        ))
        .unwrap();
    rt.services()
        .load(Arc::new(
            TestService::new("etcd", Arc::clone(&log)).with_deps(&["containerd", "networkd"]),
        ))
        .unwrap();

    rt.services().start_all(&rt).await.unwrap();

    rt.services()
        .wait("etcd", &[ServiceState::Running], Duration::from_secs(30))
        .await
        .unwrap();

    let entries = log.lock().unwrap().clone();
    let position = |needle: &str| {
        entries
            .iter()
            .position(|e| e == needle)
            .unwrap_or_else(|| panic!("missing log entry {needle:?} in {entries:?}"))
    };

    let etcd_running = position("etcd running");
    assert!(position("containerd healthy") < etcd_running);
    assert!(position("networkd healthy") < etcd_running);

    let info = rt.services().info("containerd").unwrap();
    assert_eq!(info.state, ServiceState::Running);
    assert_eq!(info.health, Health::Healthy);

    rt.stop();
}

// Property 7: consecutive crash delays form a non-decreasing sequence
// bounded by 60 s.
#[tokio::test(start_paused = true)]
async fn restart_backoff_is_monotonic_and_capped() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let rt = RuntimeBuilder::new().build();
    let mut events = rt.bus().subscribe();

    rt.services()
        .load(Arc::new(TestService::new("crashy", log).failing()))
        .unwrap();
    rt.services().start(&rt, &["crashy"]).await.unwrap();

    let mut delays = Vec::new();
    while delays.len() < 6 {
        let ev = events.recv().await.unwrap();
        if ev.kind == EventKind::ServiceRestartScheduled {
            delays.push(ev.delay.unwrap());
        }
    }

    assert_eq!(delays[0], Duration::from_millis(100));
    assert_eq!(delays[1], Duration::from_millis(200));

    for pair in delays.windows(2) {
        assert!(pair[0] <= pair[1], "delays must not decrease: {delays:?}");
    }
    assert!(delays.iter().all(|d| *d <= Duration::from_secs(60)));

    rt.stop();
}

/// Runner that stays up past the reset interval, then fails.
struct LongThenFail;

#[async_trait]
impl Service for LongThenFail {
    fn id(&self) -> &str {
        "long-then-fail"
    }

    async fn runner(&self, _rt: &Runtime) -> Result<RunnerRef, TaskError> {
        Ok(RunnerFn::arc(|_token| async {
            tokio::time::sleep(Duration::from_secs(61)).await;
            Err(TaskError::fatal("late crash"))
        }))
    }
}

// A clean run of at least 60 s resets the backoff to its initial delay.
#[tokio::test(start_paused = true)]
async fn long_clean_run_resets_backoff() {
    let rt = RuntimeBuilder::new().build();
    let mut events = rt.bus().subscribe();

    rt.services().load(Arc::new(LongThenFail)).unwrap();
    rt.services().start(&rt, &["long-then-fail"]).await.unwrap();

    let mut delays = Vec::new();
    while delays.len() < 3 {
        let ev = events.recv().await.unwrap();
        if ev.kind == EventKind::ServiceRestartScheduled {
            delays.push(ev.delay.unwrap());
        }
    }

    assert!(
        delays.iter().all(|d| *d == Duration::from_millis(100)),
        "each delay should reset to the initial one: {delays:?}"
    );

    rt.stop();
}

// Re-loading the same service is a no-op; a different service under an
// already-registered id is rejected.
#[tokio::test]
async fn reloading_a_different_service_is_rejected() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let rt = RuntimeBuilder::new().build();

    let first: Arc<dyn Service> = Arc::new(TestService::new("svc", Arc::clone(&log)));
    rt.services().load(Arc::clone(&first)).unwrap();

    // Same service, same id: idempotent.
    rt.services().load(first).unwrap();
    assert_eq!(rt.services().list(), vec!["svc".to_string()]);

    // Different service under the running id: rejected.
    let err = rt
        .services()
        .load(Arc::new(TestService::new("svc", log)))
        .unwrap_err();
    assert!(matches!(err, RuntimeError::ServiceAlreadyExists { id } if id == "svc"));

    rt.stop();
}

/// Condition that never opens.
struct NeverCondition;

#[async_trait]
impl Condition for NeverCondition {
    fn describe(&self) -> String {
        "a gate that never opens".to_string()
    }

    async fn wait(&self, _token: &CancellationToken) -> ConditionOutcome {
        ConditionOutcome::Never
    }
}

struct GatedService;

#[async_trait]
impl Service for GatedService {
    fn id(&self) -> &str {
        "gated"
    }

    fn condition(&self, _rt: &Runtime) -> Option<Arc<dyn Condition>> {
        Some(Arc::new(NeverCondition))
    }

    async fn runner(&self, _rt: &Runtime) -> Result<RunnerRef, TaskError> {
        Ok(RunnerFn::arc(|_token| async { Ok::<(), TaskError>(()) }))
    }
}

// A permanently-false condition parks the service in Skipped.
#[tokio::test(start_paused = true)]
async fn permanently_false_condition_skips() {
    let rt = RuntimeBuilder::new().build();

    rt.services().load(Arc::new(GatedService)).unwrap();
    rt.services().start(&rt, &["gated"]).await.unwrap();

    let state = rt
        .services()
        .wait("gated", &[ServiceState::Skipped], Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(state, ServiceState::Skipped);

    rt.stop();
}

/// Runner whose health collapses mid-run.
struct Degrading {
    healthy: Arc<AtomicBool>,
}

#[async_trait]
impl Service for Degrading {
    fn id(&self) -> &str {
        "degrading"
    }

    fn health_check(&self) -> Option<Arc<dyn HealthCheck>> {
        let flag = Arc::clone(&self.healthy);
        Some(Arc::new(BoolCheck { flag }))
    }

    fn health_settings(&self) -> HealthSettings {
        fast_health()
    }

    async fn runner(&self, _rt: &Runtime) -> Result<RunnerRef, TaskError> {
        Ok(RunnerFn::arc(|token: CancellationToken| async move {
            token.cancelled().await;
            Err(TaskError::Canceled)
        }))
    }
}

struct BoolCheck {
    flag: Arc<AtomicBool>,
}

#[async_trait]
impl HealthCheck for BoolCheck {
    async fn probe(&self) -> Result<(), String> {
        if self.flag.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err("degraded".to_string())
        }
    }
}

// Probe failures flip health to unhealthy without stopping the service.
#[tokio::test(start_paused = true)]
async fn unhealthy_service_keeps_running() {
    let healthy = Arc::new(AtomicBool::new(true));
    let rt = RuntimeBuilder::new().build();

    rt.services()
        .load(Arc::new(Degrading {
            healthy: Arc::clone(&healthy),
        }))
        .unwrap();
    rt.services().start(&rt, &["degrading"]).await.unwrap();

    {
        let rt = Arc::clone(&rt);
        eventually("service healthy", Duration::from_secs(10), move || {
            let rt = Arc::clone(&rt);
            async move {
                rt.services()
                    .info("degrading")
                    .map(|i| i.health == Health::Healthy)
                    .unwrap_or(false)
            }
        })
        .await;
    }

    healthy.store(false, Ordering::SeqCst);

    {
        let rt = Arc::clone(&rt);
        eventually("service unhealthy", Duration::from_secs(10), move || {
            let rt = Arc::clone(&rt);
            async move {
                rt.services()
                    .info("degrading")
                    .map(|i| i.health == Health::Unhealthy)
                    .unwrap_or(false)
            }
        })
        .await;
    }

    let info = rt.services().info("degrading").unwrap();
    assert_eq!(info.state, ServiceState::Running);

    rt.stop();
}

// Stop is graceful first; info reflects the final state and the ring
// keeps the transition history.
#[tokio::test(start_paused = true)]
async fn stop_and_info() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let rt = RuntimeBuilder::new().build();

    rt.services()
        .load(Arc::new(TestService::new("svc", log)))
        .unwrap();
    rt.services().start(&rt, &["svc"]).await.unwrap();

    rt.services()
        .wait("svc", &[ServiceState::Running], Duration::from_secs(5))
        .await
        .unwrap();

    rt.services().stop(&["svc"]).await.unwrap();

    let info = rt.services().info("svc").unwrap();
    assert_eq!(info.state, ServiceState::Finished);
    assert!(info
        .events
        .iter()
        .any(|e| e.state == ServiceState::Running));

    assert!(rt.services().stop(&["missing"]).await.is_err());

    rt.stop();
}
