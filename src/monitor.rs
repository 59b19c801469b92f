//! Periodic health polling across every registered adapter and the host.
//!
//! One cycle checks each adapter and the host concurrently, joins them with all-settled
//! semantics, derives the hybrid view from the adapter verdicts and publishes the whole cycle
//! as one [`HealthSnapshot`]. A check that errors, panics or hangs is recorded as `unhealthy`
//! and never affects the other checks.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::TimeDelta;
use futures_util::FutureExt;
use futures_util::future::join_all;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::alerts::{AlertManager, AlertType, Severity};
use crate::backend::{Backend, BackendHealth, BackendKind};
use crate::backend_registry::BackendRegistry;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::health::{
    HYBRID_SERVICE, HealthCheckResult, HealthSnapshot, HealthStatus, SYSTEM_SERVICE,
    SystemMetrics, aggregate_backends, evaluate_system, overall_status,
};
use crate::job_registry::JobRegistry;
use crate::system::SystemProbe;

/// Upper bound for any single check within a cycle.
pub const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

const MIN_INTERVAL: Duration = Duration::from_secs(1);

struct Running {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct HealthMonitor {
    backends: Arc<BackendRegistry>,
    alerts: Arc<AlertManager>,
    jobs: Arc<JobRegistry>,
    probe: Arc<dyn SystemProbe>,
    clock: Arc<dyn Clock>,

    interval: Duration,
    startup_delay: Duration,
    check_timeout: Duration,
    job_retention: TimeDelta,

    snapshot: RwLock<Arc<HealthSnapshot>>,
    cycles: AtomicU64,
    // Serializes cycles so a manual refresh and the timer never interleave.
    cycle_lock: tokio::sync::Mutex<()>,
    running: Mutex<Option<Running>>,
}

impl HealthMonitor {
    pub fn new(
        backends: Arc<BackendRegistry>,
        alerts: Arc<AlertManager>,
        jobs: Arc<JobRegistry>,
        probe: Arc<dyn SystemProbe>,
        config: &Config,
    ) -> Self {
        Self {
            backends,
            alerts,
            jobs,
            probe,
            clock: Arc::new(SystemClock),
            interval: config.health_check_interval.max(MIN_INTERVAL),
            startup_delay: config.startup_check_delay,
            check_timeout: DEFAULT_CHECK_TIMEOUT,
            job_retention: TimeDelta::from_std(config.job_retention)
                .unwrap_or(TimeDelta::hours(1)),
            snapshot: RwLock::new(Arc::new(HealthSnapshot::default())),
            cycles: AtomicU64::new(0),
            cycle_lock: tokio::sync::Mutex::new(()),
            running: Mutex::new(None),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_check_timeout(mut self, timeout: Duration) -> Self {
        self.check_timeout = timeout;
        self
    }

    /// The most recently completed cycle. Before the first cycle every status is `unknown`.
    pub fn snapshot(&self) -> Arc<HealthSnapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn backend_status(&self, kind: BackendKind) -> HealthStatus {
        self.snapshot().backend_status(kind)
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Spawn the polling loop: one check after the startup delay, then one per interval.
    ///
    /// Returns `false` if the loop is already running.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.is_some() {
            return false;
        }

        let token = CancellationToken::new();
        let monitor = Arc::clone(self);
        let child = token.child_token();
        let handle = tokio::spawn(async move { monitor.run(child).await });
        *running = Some(Running { token, handle });

        info!(
            interval_secs = self.interval.as_secs(),
            backends = ?self.backends.kinds(),
            "health monitor started"
        );
        true
    }

    /// Stop the polling loop and wait for an in-flight cycle to finish.
    pub async fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(running) = running else {
            return;
        };

        running.token.cancel();
        if let Err(err) = running.handle.await {
            warn!(error = %err, "health monitor task ended abnormally");
        }
        info!("health monitor stopped");
    }

    async fn run(&self, token: CancellationToken) {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(self.startup_delay) => {}
        }
        self.check_now().await;

        let start = tokio::time::Instant::now() + self.interval;
        let mut ticker = tokio::time::interval_at(start, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    self.check_now().await;
                }
            }
        }
    }

    /// Run one full cycle now and publish its snapshot.
    pub async fn check_now(&self) -> Arc<HealthSnapshot> {
        let _cycle = self.cycle_lock.lock().await;
        let started = Instant::now();

        let adapter_checks = self
            .backends
            .iter()
            .map(|(kind, backend)| self.check_backend(kind, backend.clone()));
        let (adapter_results, (system_result, metrics)) =
            tokio::join!(join_all(adapter_checks), self.check_system());

        let hybrid = self.hybrid_view(&adapter_results, started);
        let status = overall_status(hybrid.status, system_result.status);

        let mut services = std::collections::BTreeMap::new();
        for result in adapter_results {
            services.insert(result.service.clone(), result);
        }
        services.insert(HYBRID_SERVICE.to_owned(), hybrid);
        services.insert(SYSTEM_SERVICE.to_owned(), system_result);

        let cycle = self.cycles.fetch_add(1, Ordering::Relaxed) + 1;
        let snapshot = Arc::new(HealthSnapshot {
            cycle,
            checked_at: Some(self.clock.now()),
            status,
            services,
            system: metrics,
        });
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = snapshot.clone();

        let purged_alerts = self.alerts.purge_resolved();
        let pruned_jobs = self.jobs.prune_finished(self.job_retention);
        debug!(
            cycle,
            status = %status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            purged_alerts,
            pruned_jobs,
            "health cycle complete"
        );
        snapshot
    }

    async fn check_backend(&self, kind: BackendKind, backend: Arc<dyn Backend>) -> HealthCheckResult {
        let started = Instant::now();
        let outcome = self.guarded(async move { backend.health_status().await }).await;
        let response_time_ms = started.elapsed().as_millis() as u64;
        let service = kind.as_str();

        match outcome {
            Ok(health) => {
                let status = if health.status == HealthStatus::Healthy {
                    HealthStatus::Healthy
                } else {
                    self.alerts.create_alert(
                        AlertType::Warning,
                        service,
                        format!("Backend {kind} reported {}", health.status),
                        Severity::Medium,
                    );
                    HealthStatus::Unhealthy
                };
                self.result(service, status, response_time_ms, &health)
            }
            Err(reason) => {
                self.alerts.create_alert(
                    AlertType::Warning,
                    service,
                    format!("Health check failed for {kind}"),
                    Severity::Medium,
                );
                self.failed(service, response_time_ms, reason)
            }
        }
    }

    fn result(
        &self,
        service: &str,
        status: HealthStatus,
        response_time_ms: u64,
        health: &BackendHealth,
    ) -> HealthCheckResult {
        HealthCheckResult {
            service: service.to_owned(),
            status,
            uptime_seconds: health.uptime.map(|u| u.as_secs()),
            response_time_ms,
            last_check: self.clock.now(),
            details: json!({
                "reported": health.status,
                "available_models": health.available_models,
                "details": health.details,
            }),
        }
    }

    fn failed(&self, service: &str, response_time_ms: u64, reason: String) -> HealthCheckResult {
        HealthCheckResult {
            service: service.to_owned(),
            status: HealthStatus::Unhealthy,
            uptime_seconds: None,
            response_time_ms,
            last_check: self.clock.now(),
            details: json!({ "error": reason }),
        }
    }

    async fn check_system(&self) -> (HealthCheckResult, Option<SystemMetrics>) {
        let started = Instant::now();
        let probe = self.probe.clone();
        let outcome = self
            .guarded(async move { probe.sample().await })
            .await
            .and_then(|sample| sample.map_err(|err| format!("{err:#}")));
        let response_time_ms = started.elapsed().as_millis() as u64;

        let metrics = match outcome {
            Ok(metrics) => metrics,
            Err(reason) => {
                self.alerts.create_alert(
                    AlertType::Warning,
                    SYSTEM_SERVICE,
                    "System resource check failed",
                    Severity::Medium,
                );
                return (self.failed(SYSTEM_SERVICE, response_time_ms, reason), None);
            }
        };

        let verdict = evaluate_system(&metrics);
        for finding in &verdict.findings {
            self.alerts.create_alert(
                finding.alert_type,
                SYSTEM_SERVICE,
                finding.message.clone(),
                finding.severity,
            );
        }

        let result = HealthCheckResult {
            service: SYSTEM_SERVICE.to_owned(),
            status: verdict.status,
            uptime_seconds: Some(metrics.uptime_seconds),
            response_time_ms,
            last_check: self.clock.now(),
            details: json!({
                "cpu_usage_percent": metrics.cpu_usage_percent,
                "memory_usage_percent": metrics.memory.usage_percent,
                "load_average": metrics.load_average,
                "cores": metrics.cores,
                "findings": verdict.findings.iter().map(|f| f.message.as_str()).collect::<Vec<_>>(),
            }),
        };
        (result, Some(metrics))
    }

    fn hybrid_view(&self, adapters: &[HealthCheckResult], started: Instant) -> HealthCheckResult {
        let status = aggregate_backends(adapters.iter().map(|r| &r.status));
        let (available, unavailable): (Vec<&HealthCheckResult>, Vec<&HealthCheckResult>) =
            adapters.iter().partition(|r| r.status.is_available());

        if status == HealthStatus::Unhealthy {
            self.alerts.create_alert(
                AlertType::Error,
                HYBRID_SERVICE,
                "No transcription backend available",
                Severity::High,
            );
        }

        HealthCheckResult {
            service: HYBRID_SERVICE.to_owned(),
            status,
            uptime_seconds: None,
            response_time_ms: started.elapsed().as_millis() as u64,
            last_check: self.clock.now(),
            details: json!({
                "registered": adapters.len(),
                "available": available.iter().map(|r| r.service.as_str()).collect::<Vec<_>>(),
                "unavailable": unavailable.iter().map(|r| r.service.as_str()).collect::<Vec<_>>(),
            }),
        }
    }

    /// Run one check with a timeout and panic isolation.
    async fn guarded<T>(&self, check: impl Future<Output = T>) -> Result<T, String> {
        match tokio::time::timeout(self.check_timeout, AssertUnwindSafe(check).catch_unwind()).await
        {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(panic)) => Err(format!("health check panicked: {}", panic_message(&*panic))),
            Err(_) => Err("health check timed out".to_owned()),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_owned())
}
