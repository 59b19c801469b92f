#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::NamedTempFile;

use scribe_router::alerts::AlertManager;
use scribe_router::backend::{BackendHealth, Capabilities};
use scribe_router::health::{HealthStatus, MemoryStats, SystemMetrics};
use scribe_router::job::{Job, JobId};
use scribe_router::job_registry::JobRegistry;
use scribe_router::opts::TranscribeOpts;
use scribe_router::system::SystemProbe;
use scribe_router::{
    Backend, BackendKind, BackendRegistry, Config, Error, HealthMonitor, RequestRouter, Result,
    TranscriptionRequest, TranscriptionResult,
};

/// What a scripted backend does when asked to transcribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeed,
    Fail,
    /// Never finishes on its own; only cancellation or the caller giving up ends it.
    Hang,
}

pub struct MockBackend {
    kind: BackendKind,
    jobs: Arc<JobRegistry>,
    health: Mutex<HealthStatus>,
    outcome: Mutex<Outcome>,
    calls: AtomicUsize,
    last_job: Mutex<Option<JobId>>,
}

impl MockBackend {
    pub fn new(kind: BackendKind, jobs: Arc<JobRegistry>, health: HealthStatus) -> Self {
        Self {
            kind,
            jobs,
            health: Mutex::new(health),
            outcome: Mutex::new(Outcome::Succeed),
            calls: AtomicUsize::new(0),
            last_job: Mutex::new(None),
        }
    }

    pub fn set_outcome(&self, outcome: Outcome) {
        *self.outcome.lock().unwrap() = outcome;
    }

    pub fn set_health(&self, status: HealthStatus) {
        *self.health.lock().unwrap() = status;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_job(&self) -> Option<JobId> {
        *self.last_job.lock().unwrap()
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            cancellation: true,
            container_lifecycle: false,
            metered: self.kind == BackendKind::Cloud,
        }
    }

    async fn transcribe_file(
        &self,
        _path: &Path,
        opts: &TranscribeOpts,
    ) -> Result<TranscriptionResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let outcome = *self.outcome.lock().unwrap();
        let kind = self.kind;

        self.jobs
            .run(kind, opts.file_name.clone(), |handle| async move {
                *self.last_job.lock().unwrap() = Some(handle.id());
                self.jobs.mark_processing(handle.id());
                match outcome {
                    Outcome::Succeed => {
                        let mut result =
                            TranscriptionResult::new(kind, "mock", format!("hello from {kind}"));
                        result.duration_seconds = 60.0;
                        result.processing_time_ms = 100;
                        if kind == BackendKind::Cloud {
                            result.cost_estimate = 0.006;
                        }
                        Ok(result)
                    }
                    Outcome::Fail => Err(Error::execution(kind, "scripted failure")),
                    Outcome::Hang => {
                        handle.cancel_token().cancelled().await;
                        Err(Error::execution(kind, "interrupted"))
                    }
                }
            })
            .await
    }

    async fn health_status(&self) -> BackendHealth {
        let status = *self.health.lock().unwrap();
        BackendHealth {
            status,
            ..BackendHealth::healthy().with_models(vec![format!("{}-model", self.kind)])
        }
    }

    fn job_status(&self, id: JobId) -> Option<Job> {
        self.jobs.get_for(self.kind, id)
    }

    fn active_jobs(&self) -> Vec<Job> {
        self.jobs.active_jobs_for(self.kind)
    }

    fn cancel_job(&self, id: JobId) -> bool {
        self.jobs.cancel_for(self.kind, id)
    }
}

/// Host readings handed to the monitor verbatim.
pub struct FixedProbe {
    metrics: Mutex<SystemMetrics>,
}

impl FixedProbe {
    pub fn new(metrics: SystemMetrics) -> Self {
        Self {
            metrics: Mutex::new(metrics),
        }
    }

    pub fn set(&self, metrics: SystemMetrics) {
        *self.metrics.lock().unwrap() = metrics;
    }
}

#[async_trait]
impl SystemProbe for FixedProbe {
    async fn sample(&self) -> anyhow::Result<SystemMetrics> {
        Ok(self.metrics.lock().unwrap().clone())
    }
}

pub fn calm_host() -> SystemMetrics {
    SystemMetrics {
        cpu_usage_percent: 15.0,
        load_average: [0.4, 0.3, 0.2],
        cores: 4,
        memory: MemoryStats {
            total_bytes: 8 << 30,
            used_bytes: 2 << 30,
            free_bytes: 6 << 30,
            usage_percent: 25.0,
        },
        ..SystemMetrics::default()
    }
}

pub struct Harness {
    pub router: Arc<RequestRouter>,
    pub monitor: Arc<HealthMonitor>,
    pub alerts: Arc<AlertManager>,
    pub jobs: Arc<JobRegistry>,
    pub probe: Arc<FixedProbe>,
    pub mocks: BTreeMap<BackendKind, Arc<MockBackend>>,
    pub audio: NamedTempFile,
}

impl Harness {
    pub fn mock(&self, kind: BackendKind) -> &MockBackend {
        &self.mocks[&kind]
    }

    /// A request for the staged audio file with default routing.
    pub fn request(&self) -> TranscriptionRequest {
        TranscriptionRequest::new(self.audio.path())
    }

    pub fn total_calls(&self) -> usize {
        self.mocks.values().map(|m| m.calls()).sum()
    }
}

pub fn harness(backends: &[(BackendKind, HealthStatus)]) -> Harness {
    harness_with(backends, Config::default())
}

pub fn harness_with(backends: &[(BackendKind, HealthStatus)], config: Config) -> Harness {
    let jobs = Arc::new(JobRegistry::new());
    let mut registry = BackendRegistry::new();
    let mut mocks = BTreeMap::new();
    for (kind, status) in backends {
        let mock = Arc::new(MockBackend::new(*kind, jobs.clone(), *status));
        registry.register(mock.clone());
        mocks.insert(*kind, mock);
    }
    let registry = Arc::new(registry);

    let alerts = Arc::new(AlertManager::new());
    let probe = Arc::new(FixedProbe::new(calm_host()));
    let monitor = Arc::new(HealthMonitor::new(
        registry.clone(),
        alerts.clone(),
        jobs.clone(),
        probe.clone(),
        &config,
    ));
    let router = Arc::new(RequestRouter::new(
        registry,
        monitor.clone(),
        alerts.clone(),
        &config,
    ));

    let mut audio = NamedTempFile::new().expect("temp audio file");
    std::io::Write::write_all(&mut audio, b"RIFF....WAVE").expect("write temp audio");

    Harness {
        router,
        monitor,
        alerts,
        jobs,
        probe,
        mocks,
        audio,
    }
}
