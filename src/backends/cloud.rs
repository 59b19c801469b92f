use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use crate::backend::{Backend, BackendHealth, BackendKind, Capabilities};
use crate::backends::audio_part;
use crate::config::CloudConfig;
use crate::error::{Error, Result};
use crate::job::{Job, JobId};
use crate::job_registry::{JobHandle, JobRegistry};
use crate::opts::TranscribeOpts;
use crate::request::Task;
use crate::transcript::{Segment, TranscriptionResult, Word};

const KIND: BackendKind = BackendKind::Cloud;
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Adapter for an OpenAI-compatible `/audio/transcriptions` API.
///
/// Requests are metered, so every result carries a cost estimate. The API offers no way to
/// abort an accepted upload: [`Backend::cancel_job`] always answers `false`.
pub struct CloudBackend {
    client: reqwest::Client,
    config: CloudConfig,
    api_key: String,
    jobs: Arc<JobRegistry>,
    started: Instant,
}

impl CloudBackend {
    pub fn new(config: CloudConfig, api_key: String, jobs: Arc<JobRegistry>) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            api_key,
            jobs,
            started: Instant::now(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
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

        let mut form = reqwest::multipart::Form::new()
            .part("file", audio_part(KIND, path, opts.file_name.as_deref()).await?)
            .text("model", model.clone())
            .text("response_format", "verbose_json");
        if let Some(language) = &opts.language {
            form = form.text("language", language.clone());
        }
        if opts.word_timestamps {
            form = form
                .text("timestamp_granularities[]", "word")
                .text("timestamp_granularities[]", "segment");
        }

        let endpoint = match opts.task {
            Task::Transcribe => "audio/transcriptions",
            Task::Translate => "audio/translations",
        };

        self.jobs.mark_processing(handle.id());
        let started = Instant::now();
        debug!(job_id = %handle.id(), %model, endpoint, "uploading to cloud API");

        let response = self
            .client
            .post(self.url(endpoint))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|err| Error::execution(KIND, format!("request failed: {err}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| Error::execution(KIND, format!("failed to read response: {err}")))?;
        if !status.is_success() {
            return Err(Error::execution(
                KIND,
                format!("API error {status}: {}", truncate(&body, 512)),
            ));
        }

        let mut result = parse_verbose_json(&body, &model)?;
        result.processing_time_ms = started.elapsed().as_millis() as u64;
        result.cost_estimate = result.duration_seconds / 60.0 * self.config.cost_per_minute;
        info!(
            job_id = %handle.id(),
            duration_seconds = result.duration_seconds,
            cost = result.cost_estimate,
            "cloud transcription finished"
        );
        Ok(result)
    }
}

#[async_trait]
impl Backend for CloudBackend {
    fn kind(&self) -> BackendKind {
        KIND
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            cancellation: false,
            container_lifecycle: false,
            metered: true,
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
            .get(self.url("models"))
            .bearer_auth(&self.api_key)
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(err) => return BackendHealth::unhealthy(format!("API unreachable: {err}")),
        };
        if !response.status().is_success() {
            return BackendHealth::unhealthy(format!("API answered {}", response.status()));
        }

        let models = match response.json::<ModelList>().await {
            Ok(list) => list
                .data
                .into_iter()
                .map(|m| m.id)
                .filter(|id| id.contains("whisper") || id.contains("transcribe"))
                .collect(),
            Err(_) => vec![self.config.default_model.clone()],
        };

        BackendHealth::healthy()
            .with_models(models)
            .with_uptime(self.started.elapsed())
    }

    fn job_status(&self, id: JobId) -> Option<Job> {
        self.jobs.get_for(KIND, id)
    }

    fn active_jobs(&self) -> Vec<Job> {
        self.jobs.active_jobs_for(KIND)
    }

    fn cancel_job(&self, _id: JobId) -> bool {
        false
    }
}

#[derive(Debug, Deserialize)]
struct ModelList {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

#[derive(Debug, Deserialize)]
struct VerboseJson {
    text: String,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    segments: Vec<VerboseSegment>,
    #[serde(default)]
    words: Vec<VerboseWord>,
}

#[derive(Debug, Deserialize)]
struct VerboseSegment {
    start: f64,
    end: f64,
    text: String,
    #[serde(default)]
    avg_logprob: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct VerboseWord {
    word: String,
    start: f64,
    end: f64,
}

/// Map an OpenAI `verbose_json` body into a result.
///
/// Words are reported at the top level by the API; we attach each one to the segment whose
/// time range contains its start.
pub(crate) fn parse_verbose_json(body: &str, model: &str) -> Result<TranscriptionResult> {
    let parsed: VerboseJson = serde_json::from_str(body)
        .map_err(|err| Error::execution(KIND, format!("unexpected API response: {err}")))?;

    let mut segments: Vec<Segment> = parsed
        .segments
        .into_iter()
        .map(|s| Segment {
            start_seconds: s.start,
            end_seconds: s.end,
            text: s.text.trim().to_owned(),
            confidence: s.avg_logprob.map(|lp| lp.exp().clamp(0.0, 1.0) as f32),
            words: Vec::new(),
        })
        .collect();

    for word in parsed.words {
        let owner = segments
            .iter_mut()
            .find(|s| word.start >= s.start_seconds && word.start < s.end_seconds);
        if let Some(segment) = owner {
            segment.words.push(Word {
                start_seconds: word.start,
                end_seconds: word.end,
                text: word.word,
                probability: None,
            });
        }
    }

    let duration = parsed
        .duration
        .or_else(|| segments.last().map(|s| s.end_seconds))
        .unwrap_or(0.0);

    let mut result = TranscriptionResult::new(KIND, model, parsed.text.trim());
    result.segments = segments;
    result.language = parsed.language;
    result.duration_seconds = duration;
    Ok(result)
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
