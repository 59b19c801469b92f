//! Health-aware dispatch of transcription requests with ordered fallback.
//!
//! For one request, candidates are tried strictly one at a time in priority order and each
//! backend at most once. Only execution failures and timeouts advance to the next candidate;
//! an unregistered backend, a validation failure or a cancelled job end the request.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;
use tracing::{info, warn};

use crate::alerts::{AlertManager, AlertType, Severity};
use crate::backend::BackendKind;
use crate::backend_registry::BackendRegistry;
use crate::config::Config;
use crate::error::{ContainerAction, Error, Result};
use crate::health::{HealthSnapshot, HealthStatus};
use crate::job::{Job, JobId};
use crate::monitor::HealthMonitor;
use crate::opts::TranscribeOpts;
use crate::request::{Method, Priority, TranscriptionRequest};
use crate::transcript::{FailedAttempt, TranscriptionResult};

/// Counters for one backend since startup.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BackendPerformance {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub total_processing_ms: u64,
    pub average_processing_ms: f64,
    pub total_audio_seconds: f64,
    pub total_cost: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerformanceReport {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Successful requests that were not served by their first-choice backend.
    pub fallback_requests: u64,
    pub backends: BTreeMap<BackendKind, BackendPerformance>,
}

pub struct RequestRouter {
    backends: Arc<BackendRegistry>,
    monitor: Arc<HealthMonitor>,
    alerts: Arc<AlertManager>,
    default_priority: Priority,
    request_timeout: Duration,
    stats: Mutex<PerformanceReport>,
}

impl RequestRouter {
    pub fn new(
        backends: Arc<BackendRegistry>,
        monitor: Arc<HealthMonitor>,
        alerts: Arc<AlertManager>,
        config: &Config,
    ) -> Self {
        Self {
            backends,
            monitor,
            alerts,
            default_priority: config.default_priority,
            request_timeout: config.request_timeout,
            stats: Mutex::new(PerformanceReport::default()),
        }
    }

    pub fn backends(&self) -> &BackendRegistry {
        &self.backends
    }

    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    pub fn alerts(&self) -> &Arc<AlertManager> {
        &self.alerts
    }

    fn stats(&self) -> MutexGuard<'_, PerformanceReport> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The backends this request would be tried on, in order.
    ///
    /// For `auto`, registered backends follow the priority tier, reordered by the last health
    /// snapshot: healthy first, then degraded or not yet checked. Backends the monitor reports
    /// unhealthy are left out. An explicit method is the sole first candidate and is followed
    /// by the auto order only when fallback is enabled.
    pub fn candidate_order(&self, request: &TranscriptionRequest) -> Result<Vec<BackendKind>> {
        let priority = request.priority.unwrap_or(self.default_priority);
        let snapshot = self.monitor.snapshot();
        let auto = self.auto_order(priority, &snapshot);

        match request.method {
            Method::Backend(kind) => {
                if !self.backends.contains(kind) {
                    return Err(Error::BackendUnavailable { method: kind });
                }
                let mut order = vec![kind];
                if request.fallback_enabled {
                    order.extend(auto.into_iter().filter(|k| *k != kind));
                }
                Ok(order)
            }
            Method::Auto if auto.is_empty() => Err(Error::BackendUnavailable {
                method: self
                    .first_choice(request)
                    .unwrap_or(priority.preference_order()[0]),
            }),
            Method::Auto => Ok(auto),
        }
    }

    fn auto_order(&self, priority: Priority, snapshot: &HealthSnapshot) -> Vec<BackendKind> {
        let mut order: Vec<BackendKind> = priority
            .preference_order()
            .into_iter()
            .filter(|kind| self.backends.contains(*kind))
            .filter(|kind| snapshot.backend_status(*kind) != HealthStatus::Unhealthy)
            .collect();
        // stable: ties keep the tier order
        order.sort_by_key(|kind| match snapshot.backend_status(*kind) {
            HealthStatus::Healthy => 0,
            _ => 1,
        });
        order
    }

    /// The backend a request is meant to land on when nothing goes wrong.
    fn first_choice(&self, request: &TranscriptionRequest) -> Option<BackendKind> {
        match request.method {
            Method::Backend(kind) => Some(kind),
            Method::Auto => request
                .priority
                .unwrap_or(self.default_priority)
                .preference_order()
                .into_iter()
                .find(|kind| self.backends.contains(*kind)),
        }
    }

    /// Route one request and return the first successful result.
    pub async fn transcribe(&self, request: &TranscriptionRequest) -> Result<TranscriptionResult> {
        request.validate()?;
        let candidates = self.candidate_order(request)?;
        let first_choice = self.first_choice(request);
        let opts = TranscribeOpts::from(request);

        self.stats().total_requests += 1;

        let mut attempted = Vec::with_capacity(candidates.len());
        let mut failures: Vec<FailedAttempt> = Vec::new();
        let mut last_error = None;

        for kind in candidates {
            let Some(backend) = self.backends.get(kind) else {
                continue;
            };
            attempted.push(kind);
            info!(backend = %kind, file = %request.file.display(), "dispatching transcription");

            let outcome = match tokio::time::timeout(
                self.request_timeout,
                backend.transcribe_file(&request.file, &opts),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(Error::Timeout {
                    method: kind,
                    after: self.request_timeout,
                }),
            };

            match outcome {
                Ok(mut result) => {
                    result.method = kind;
                    result.fallback_used = !failures.is_empty() || first_choice != Some(kind);
                    result.attempts = failures;
                    result.metadata = request.metadata.clone();
                    self.record_success(&result);
                    info!(
                        backend = %kind,
                        job_id = %result.job_id,
                        fallback_used = result.fallback_used,
                        processing_time_ms = result.processing_time_ms,
                        "transcription succeeded"
                    );
                    return Ok(result);
                }
                Err(err) => {
                    self.record_failure(kind, &err);
                    warn!(backend = %kind, code = err.code(), error = %err, "transcription attempt failed");

                    if !err.is_fallback_eligible() || !request.fallback_enabled {
                        self.stats().failed_requests += 1;
                        return Err(err);
                    }

                    self.alerts.create_alert(
                        AlertType::Warning,
                        kind.as_str(),
                        format!("Transcription attempt on {kind} failed ({})", err.code()),
                        Severity::Medium,
                    );
                    failures.push(FailedAttempt {
                        method: kind,
                        code: err.code().to_owned(),
                        message: err.to_string(),
                    });
                    last_error = Some(err);
                }
            }
        }

        self.stats().failed_requests += 1;
        let Some(last) = last_error else {
            return Err(Error::BackendUnavailable {
                method: first_choice.unwrap_or(BackendKind::Cloud),
            });
        };
        if attempted.len() == 1 {
            return Err(last);
        }

        self.alerts.create_alert(
            AlertType::Error,
            "router",
            "Every backend failed for a transcription request",
            Severity::High,
        );
        Err(Error::AllBackendsFailed {
            attempted,
            last: Box::new(last),
        })
    }

    fn record_success(&self, result: &TranscriptionResult) {
        let mut stats = self.stats();
        stats.successful_requests += 1;
        if result.fallback_used {
            stats.fallback_requests += 1;
        }
        let entry = stats.backends.entry(result.method).or_default();
        entry.attempts += 1;
        entry.successes += 1;
        entry.total_processing_ms += result.processing_time_ms;
        entry.average_processing_ms = entry.total_processing_ms as f64 / entry.successes as f64;
        entry.total_audio_seconds += result.duration_seconds;
        entry.total_cost += result.cost_estimate;
    }

    fn record_failure(&self, kind: BackendKind, err: &Error) {
        let mut stats = self.stats();
        let entry = stats.backends.entry(kind).or_default();
        entry.attempts += 1;
        entry.failures += 1;
        if matches!(err, Error::Timeout { .. }) {
            entry.timeouts += 1;
        }
    }

    /// Counters since startup.
    pub fn performance(&self) -> PerformanceReport {
        self.stats().clone()
    }

    /// Models each registered backend reports, queried concurrently.
    pub async fn models(&self) -> BTreeMap<BackendKind, Vec<String>> {
        let checks = self.backends.iter().map(|(kind, backend)| async move {
            (kind, backend.health_status().await.available_models)
        });
        join_all(checks).await.into_iter().collect()
    }

    pub fn job(&self, id: JobId) -> Result<Job> {
        self.backends.find_job(id).ok_or_else(|| Error::JobNotFound {
            job_id: id.to_string(),
        })
    }

    pub fn active_jobs(&self) -> Vec<Job> {
        self.backends.active_jobs()
    }

    /// Ask the owning backend to cancel. `Ok(false)` means it declined (terminal job or no
    /// cancellation support).
    pub fn cancel_job(&self, id: JobId) -> Result<bool> {
        self.backends.cancel_job(id).ok_or_else(|| Error::JobNotFound {
            job_id: id.to_string(),
        })
    }

    pub async fn start_container(&self) -> Result<()> {
        self.container_action(ContainerAction::Start).await
    }

    pub async fn stop_container(&self) -> Result<()> {
        self.container_action(ContainerAction::Stop).await
    }

    async fn container_action(&self, action: ContainerAction) -> Result<()> {
        let kind = BackendKind::Docker;
        let control = self
            .backends
            .container(kind)
            .ok_or(Error::BackendUnavailable { method: kind })?;

        let outcome = match action {
            ContainerAction::Start => control.start_container().await,
            ContainerAction::Stop => control.stop_container().await,
        };
        if let Err(err) = &outcome {
            self.alerts.create_alert(
                AlertType::Error,
                kind.as_str(),
                format!("Container {action} failed"),
                Severity::High,
            );
            warn!(error = %err, %action, "container lifecycle failed");
        }
        outcome
    }
}
