mod common;

use std::time::Duration;

use common::{Outcome, calm_host, harness, harness_with};
use scribe_router::alerts::Severity;
use scribe_router::health::{HYBRID_SERVICE, HealthStatus, SYSTEM_SERVICE};
use scribe_router::job::JobState;
use scribe_router::{BackendKind, Config};

use BackendKind::{Cloud, Docker, Local};
use HealthStatus::{Degraded, Healthy, Unhealthy};

#[tokio::test]
async fn snapshot_starts_unknown_and_fills_in_after_a_cycle() {
    let h = harness(&[(Cloud, Healthy), (Local, Healthy)]);

    let before = h.monitor.snapshot();
    assert_eq!(before.cycle, 0);
    assert_eq!(before.backend_status(Cloud), HealthStatus::Unknown);

    let after = h.monitor.check_now().await;
    assert_eq!(after.cycle, 1);
    assert_eq!(after.status, Healthy);
    for service in ["cloud", "local", HYBRID_SERVICE, SYSTEM_SERVICE] {
        assert!(after.services.contains_key(service), "missing {service}");
    }
    assert!(after.system.is_some());
    assert_eq!(h.monitor.snapshot().cycle, 1);
}

#[tokio::test]
async fn aggregate_is_unhealthy_only_when_nothing_is_available() {
    let h = harness(&[(Cloud, Unhealthy), (Local, Degraded), (Docker, Unhealthy)]);

    let snapshot = h.monitor.check_now().await;
    assert_eq!(snapshot.status, Unhealthy);
    assert!(h.alerts.active_alerts().iter().any(|a| {
        a.service == HYBRID_SERVICE
            && a.severity == Severity::High
            && a.message == "No transcription backend available"
    }));

    h.mock(Local).set_health(Healthy);
    assert_eq!(h.monitor.check_now().await.status, Degraded);

    h.mock(Cloud).set_health(Healthy);
    h.mock(Docker).set_health(Healthy);
    assert_eq!(h.monitor.check_now().await.status, Healthy);
}

#[tokio::test]
async fn host_pressure_degrades_but_never_fails_the_aggregate() {
    let h = harness(&[(Cloud, Healthy)]);
    let mut hot = calm_host();
    hot.memory.usage_percent = 97.0;
    h.probe.set(hot);

    let snapshot = h.monitor.check_now().await;
    assert_eq!(snapshot.services[SYSTEM_SERVICE].status, Unhealthy);
    assert_eq!(snapshot.status, Degraded);

    let system_alerts: Vec<_> = h
        .alerts
        .active_alerts()
        .into_iter()
        .filter(|a| a.service == SYSTEM_SERVICE)
        .collect();
    assert_eq!(system_alerts.len(), 2);
    assert!(system_alerts.iter().any(|a| a.severity == Severity::Critical));
}

#[tokio::test]
async fn repeated_cycles_do_not_repeat_alerts() {
    let h = harness(&[(Cloud, Healthy), (Local, Unhealthy)]);
    let mut hot = calm_host();
    hot.cpu_usage_percent = 96.0;
    h.probe.set(hot);

    h.monitor.check_now().await;
    let first = h.alerts.get_alerts(None).len();
    h.monitor.check_now().await;
    h.monitor.check_now().await;

    assert_eq!(h.alerts.get_alerts(None).len(), first);
    assert!(
        h.alerts
            .active_alerts()
            .iter()
            .any(|a| a.service == "local" && a.message == "Backend local reported unhealthy")
    );
}

#[tokio::test]
async fn finished_jobs_are_pruned_after_retention() -> anyhow::Result<()> {
    let config = Config {
        job_retention: Duration::ZERO,
        ..Config::default()
    };
    let h = harness_with(&[(Docker, Healthy)], config);
    h.monitor.check_now().await;

    let result = h.router.transcribe(&h.request()).await?;
    assert_eq!(h.router.job(result.job_id)?.state, JobState::Completed);

    tokio::time::sleep(Duration::from_millis(5)).await;
    h.monitor.check_now().await;

    assert_eq!(h.router.job(result.job_id).unwrap_err().code(), "JOB_NOT_FOUND");
    assert!(h.jobs.is_empty());
    Ok(())
}

#[tokio::test]
async fn active_jobs_survive_pruning() -> anyhow::Result<()> {
    let config = Config {
        job_retention: Duration::ZERO,
        ..Config::default()
    };
    let h = harness_with(&[(Docker, Healthy)], config);
    h.monitor.check_now().await;
    h.mock(Docker).set_outcome(Outcome::Hang);

    let router = h.router.clone();
    let request = h.request();
    let pending = tokio::spawn(async move { router.transcribe(&request).await });

    let job_id = loop {
        if let Some(job) = h.router.active_jobs().first() {
            break job.id;
        }
        tokio::task::yield_now().await;
    };

    tokio::time::sleep(Duration::from_millis(5)).await;
    h.monitor.check_now().await;
    assert_eq!(h.router.job(job_id)?.state, JobState::Processing);

    h.router.cancel_job(job_id)?;
    assert!(pending.await?.is_err());
    Ok(())
}

#[tokio::test]
async fn background_loop_publishes_and_stops() {
    let config = Config {
        startup_check_delay: Duration::from_millis(10),
        health_check_interval: Duration::from_secs(1),
        ..Config::default()
    };
    let h = harness_with(&[(Cloud, Healthy)], config);

    assert!(h.monitor.start());
    assert!(!h.monitor.start());

    let mut waited = 0;
    while h.monitor.snapshot().cycle == 0 && waited < 200 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        waited += 1;
    }
    assert!(h.monitor.snapshot().cycle >= 1);

    h.monitor.stop().await;
    assert!(!h.monitor.is_running());
}
