use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::backend::{Backend, BackendHealth, BackendKind, Capabilities, ContainerControl};
use crate::backends::audio_part;
use crate::config::ContainerConfig;
use crate::error::{ContainerAction, Error, Result};
use crate::job::{Job, JobId};
use crate::job_registry::{JobHandle, JobRegistry};
use crate::opts::TranscribeOpts;
use crate::transcript::{Segment, TranscriptionResult, Word, join_segments};

const KIND: BackendKind = BackendKind::Docker;
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Adapter for a whisper ASR webservice running in a docker container.
///
/// The service handles one upload at a time, so jobs queue behind a single slot. Cancelling
/// a job drops its in-flight request. The container itself can be started and stopped via
/// [`ContainerControl`].
pub struct ContainerBackend {
    client: reqwest::Client,
    config: ContainerConfig,
    slot: Semaphore,
    jobs: Arc<JobRegistry>,
    started: Instant,
}

impl ContainerBackend {
    pub fn new(config: ContainerConfig, jobs: Arc<JobRegistry>) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            slot: Semaphore::new(1),
            jobs,
            started: Instant::now(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    pub(crate) fn asr_query(opts: &TranscribeOpts) -> Vec<(&'static str, String)> {
        let mut query = vec![
            ("task", opts.task.as_str().to_owned()),
            ("output", "json".to_owned()),
            ("encode", "true".to_owned()),
            ("word_timestamps", opts.word_timestamps.to_string()),
        ];
        if let Some(language) = &opts.language {
            query.push(("language", language.clone()));
        }
        query
    }

    async fn process(
        &self,
        handle: JobHandle,
        path: &Path,
        opts: &TranscribeOpts,
    ) -> Result<TranscriptionResult> {
        let model = opts
            .model
            .clone()
            .unwrap_or_else(|| self.config.default_model.clone());
        let token = handle.cancel_token().clone();

        let _permit = tokio::select! {
            permit = self.slot.acquire() => permit
                .map_err(|_| Error::execution(KIND, "container queue closed"))?,
            _ = token.cancelled() => {
                return Err(Error::JobCancelled { method: KIND, job_id: handle.id() });
            }
        };

        let form = reqwest::multipart::Form::new()
            .part("audio_file", audio_part(KIND, path, opts.file_name.as_deref()).await?);

        self.jobs.mark_processing(handle.id());
        let started = Instant::now();
        debug!(job_id = %handle.id(), %model, "uploading to container");

        let request = self
            .client
            .post(self.url("asr"))
            .query(&Self::asr_query(opts))
            .multipart(form)
            .send();

        // Dropping the request future aborts the upload.
        let response = tokio::select! {
            response = request => response
                .map_err(|err| Error::execution(KIND, format!("container unreachable: {err}")))?,
            _ = token.cancelled() => {
                warn!(job_id = %handle.id(), "container request dropped on cancellation");
                return Err(Error::JobCancelled { method: KIND, job_id: handle.id() });
            }
        };

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| Error::execution(KIND, format!("failed to read response: {err}")))?;
        if !status.is_success() {
            return Err(Error::execution(
                KIND,
                format!("container answered {status}: {}", body.trim()),
            ));
        }

        let mut result = parse_asr_json(&body, &model)?;
        result.processing_time_ms = started.elapsed().as_millis() as u64;
        info!(
            job_id = %handle.id(),
            processing_time_ms = result.processing_time_ms,
            "container transcription finished"
        );
        Ok(result)
    }

    async fn docker(&self, action: ContainerAction) -> Result<()> {
        let verb = match action {
            ContainerAction::Start => "start",
            ContainerAction::Stop => "stop",
        };
        let output = Command::new(&self.config.docker_binary)
            .arg(verb)
            .arg(&self.config.container_name)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|err| Error::ContainerLifecycle {
                action,
                message: format!(
                    "failed to run {}: {err}",
                    self.config.docker_binary.display()
                ),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::ContainerLifecycle {
                action,
                message: format!("docker {verb} exited with {}: {}", output.status, stderr.trim()),
            });
        }

        info!(container = %self.config.container_name, %action, "container lifecycle command succeeded");
        Ok(())
    }
}

#[async_trait]
impl Backend for ContainerBackend {
    fn kind(&self) -> BackendKind {
        KIND
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            cancellation: true,
            container_lifecycle: true,
            metered: false,
        }
    }

    async fn transcribe_file(
        &self,
        path: &Path,
        opts: &TranscribeOpts,
    ) -> Result<TranscriptionResult> {
        self.jobs
            .run(KIND, opts.file_name.clone(), |handle| {
                self.process(handle, path, opts)
            })
            .await
    }

    async fn health_status(&self) -> BackendHealth {
        let response = self
            .client
            .get(self.url("health"))
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(err) => return BackendHealth::unhealthy(format!("container unreachable: {err}")),
        };
        if !response.status().is_success() {
            return BackendHealth::unhealthy(format!("container answered {}", response.status()));
        }

        // A busy slot is normal load, not a health failure.
        let mut health = BackendHealth::healthy()
            .with_models(vec![self.config.default_model.clone()])
            .with_uptime(self.started.elapsed());
        if self.slot.available_permits() == 0 {
            health.details = Some("1 upload in flight".to_owned());
        }
        health
    }

    fn job_status(&self, id: JobId) -> Option<Job> {
        self.jobs.get_for(KIND, id)
    }

    fn active_jobs(&self) -> Vec<Job> {
        self.jobs.active_jobs_for(KIND)
    }

    fn cancel_job(&self, id: JobId) -> bool {
        self.jobs.cancel_for(KIND, id)
    }

    fn container(&self) -> Option<&dyn ContainerControl> {
        Some(self)
    }
}

#[async_trait]
impl ContainerControl for ContainerBackend {
    async fn start_container(&self) -> Result<()> {
        self.docker(ContainerAction::Start).await
    }

    async fn stop_container(&self) -> Result<()> {
        self.docker(ContainerAction::Stop).await
    }
}

#[derive(Debug, Deserialize)]
struct AsrJson {
    text: String,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    segments: Vec<AsrSegment>,
}

#[derive(Debug, Deserialize)]
struct AsrSegment {
    start: f64,
    end: f64,
    text: String,
    #[serde(default)]
    avg_logprob: Option<f64>,
    #[serde(default)]
    words: Vec<AsrWord>,
}

#[derive(Debug, Deserialize)]
struct AsrWord {
    word: String,
    start: f64,
    end: f64,
    #[serde(default)]
    probability: Option<f32>,
}

pub(crate) fn parse_asr_json(body: &str, model: &str) -> Result<TranscriptionResult> {
    let parsed: AsrJson = serde_json::from_str(body)
        .map_err(|err| Error::execution(KIND, format!("unexpected container response: {err}")))?;

    let segments: Vec<Segment> = parsed
        .segments
        .into_iter()
        .map(|s| Segment {
            start_seconds: s.start,
            end_seconds: s.end,
            text: s.text.trim().to_owned(),
            confidence: s.avg_logprob.map(|lp| lp.exp().clamp(0.0, 1.0) as f32),
            words: s
                .words
                .into_iter()
                .map(|w| Word {
                    start_seconds: w.start,
                    end_seconds: w.end,
                    text: w.word.trim().to_owned(),
                    probability: w.probability,
                })
                .collect(),
        })
        .collect();

    let text = if parsed.text.trim().is_empty() {
        join_segments(&segments)
    } else {
        parsed.text.trim().to_owned()
    };

    let mut result = TranscriptionResult::new(KIND, model, text);
    result.duration_seconds = segments.last().map(|s| s.end_seconds).unwrap_or(0.0);
    result.language = parsed.language;
    result.segments = segments;
    Ok(result)
}
