use std::collections::VecDeque;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, Command};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::backend::{Backend, BackendHealth, BackendKind, Capabilities};
use crate::backends::resolve_binary;
use crate::config::LocalConfig;
use crate::error::{Error, Result};
use crate::job::{Job, JobId};
use crate::job_registry::{JobHandle, JobRegistry};
use crate::opts::TranscribeOpts;
use crate::request::Task;
use crate::transcript::{Segment, TranscriptionResult, Word, join_segments};

const KIND: BackendKind = BackendKind::Local;
const STDERR_TAIL_LINES: usize = 20;

/// Adapter that spawns the whisper.cpp CLI per job.
///
/// At most `max_concurrent` processes run at once; further jobs wait in `queued`.
/// Cancelling a job kills its process.
pub struct LocalBackend {
    config: LocalConfig,
    binary: PathBuf,
    slots: Semaphore,
    jobs: Arc<JobRegistry>,
    started: Instant,
}

impl LocalBackend {
    /// Fails with [`Error::BackendUnavailable`] when the whisper binary can't be found.
    pub fn new(config: LocalConfig, jobs: Arc<JobRegistry>) -> Result<Self> {
        let binary = resolve_binary(&config.binary_path)
            .ok_or(Error::BackendUnavailable { method: KIND })?;
        let slots = Semaphore::new(config.max_concurrent.max(1));
        Ok(Self {
            config,
            binary,
            slots,
            jobs,
            started: Instant::now(),
        })
    }

    /// `ggml-<model>.bin` inside the model directory, or the name as-is if it already looks
    /// like a model file.
    pub(crate) fn model_path(&self, model: &str) -> PathBuf {
        if model.ends_with(".bin") {
            self.config.model_dir.join(model)
        } else {
            self.config.model_dir.join(format!("ggml-{model}.bin"))
        }
    }

    /// Models present in the model directory.
    pub async fn installed_models(&self) -> Vec<String> {
        let Ok(mut entries) = tokio::fs::read_dir(&self.config.model_dir).await else {
            return Vec::new();
        };
        let mut models = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(model) = name
                .strip_prefix("ggml-")
                .and_then(|rest| rest.strip_suffix(".bin"))
            {
                models.push(model.to_owned());
            }
        }
        models.sort();
        models
    }

    pub(crate) fn build_args(
        &self,
        audio: &Path,
        model: &Path,
        output_prefix: &Path,
        opts: &TranscribeOpts,
    ) -> Vec<OsString> {
        let threads = opts
            .threads
            .or(self.config.threads)
            .unwrap_or_else(num_cpus::get);

        let mut args: Vec<OsString> = vec![
            "-m".into(),
            model.into(),
            "-f".into(),
            audio.into(),
            "-of".into(),
            output_prefix.into(),
            "-t".into(),
            threads.to_string().into(),
            "-np".into(),
            "-pp".into(),
        ];
        // Full JSON carries per-token timings and probabilities.
        args.push(if opts.word_timestamps { "-ojf" } else { "-oj" }.into());
        args.push("-l".into());
        args.push(opts.language.as_deref().unwrap_or("auto").into());
        if opts.task == Task::Translate {
            args.push("-tr".into());
        }
        args
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
        let model_path = self.model_path(&model);
        if !model_path.is_file() {
            return Err(Error::execution(
                KIND,
                format!("model not found: {}", model_path.display()),
            ));
        }

        let token = handle.cancel_token().clone();
        let _permit = tokio::select! {
            permit = self.slots.acquire() => permit
                .map_err(|_| Error::execution(KIND, "worker pool closed"))?,
            _ = token.cancelled() => {
                return Err(Error::JobCancelled { method: KIND, job_id: handle.id() });
            }
        };

        let out_dir = tempfile::tempdir()
            .map_err(|err| Error::execution(KIND, format!("failed to create temp dir: {err}")))?;
        let output_prefix = out_dir.path().join("transcript");
        let args = self.build_args(path, &model_path, &output_prefix, opts);

        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| Error::execution(KIND, format!("failed to spawn whisper: {err}")))?;

        self.jobs.mark_processing(handle.id());
        let started = Instant::now();
        debug!(job_id = %handle.id(), binary = %self.binary.display(), %model, "whisper started");

        let stderr = child.stderr.take();
        let finished = async {
            tokio::join!(child.wait(), self.follow_stderr(handle.id(), stderr))
        };

        // Dropping the child on cancellation kills it (`kill_on_drop`).
        let (status, stderr_tail) = tokio::select! {
            (status, tail) = finished => (
                status.map_err(|err| {
                    Error::execution(KIND, format!("whisper did not finish: {err}"))
                })?,
                tail,
            ),
            _ = token.cancelled() => {
                warn!(job_id = %handle.id(), "whisper process killed on cancellation");
                return Err(Error::JobCancelled { method: KIND, job_id: handle.id() });
            }
        };

        if !status.success() {
            return Err(Error::execution(
                KIND,
                format!("whisper exited with {status}: {}", stderr_tail.trim()),
            ));
        }

        let json_path = output_prefix.with_extension("json");
        let body = tokio::fs::read_to_string(&json_path).await.map_err(|err| {
            Error::execution(KIND, format!("missing whisper output {}: {err}", json_path.display()))
        })?;

        let mut result = parse_whisper_json(&body, &model, opts.word_timestamps)?;
        result.processing_time_ms = started.elapsed().as_millis() as u64;
        info!(
            job_id = %handle.id(),
            processing_time_ms = result.processing_time_ms,
            "local transcription finished"
        );
        Ok(result)
    }

    /// Feed `-pp` progress lines into the job and keep the last other lines for error
    /// messages.
    async fn follow_stderr(&self, id: JobId, stderr: Option<ChildStderr>) -> String {
        let Some(stderr) = stderr else {
            return String::new();
        };
        let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(progress) = parse_progress(&line) {
                self.jobs.set_progress(id, progress);
                continue;
            }
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
        Vec::from(tail).join("\n")
    }
}

/// Parse whisper.cpp's `progress = 42%` line into a fraction.
pub(crate) fn parse_progress(line: &str) -> Option<f32> {
    let (_, rest) = line.split_once("progress =")?;
    let percent: f32 = rest.trim().strip_suffix('%')?.trim().parse().ok()?;
    Some((percent / 100.0).clamp(0.0, 1.0))
}

#[async_trait]
impl Backend for LocalBackend {
    fn kind(&self) -> BackendKind {
        KIND
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            cancellation: true,
            container_lifecycle: false,
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
        if !self.binary.is_file() {
            return BackendHealth::unhealthy(format!(
                "whisper binary missing: {}",
                self.binary.display()
            ));
        }

        let models = self.installed_models().await;
        if models.is_empty() {
            return BackendHealth::unhealthy(format!(
                "no ggml models in {}",
                self.config.model_dir.display()
            ));
        }

        let mut health = BackendHealth::healthy()
            .with_models(models)
            .with_uptime(self.started.elapsed());
        let capacity = self.config.max_concurrent.max(1);
        let busy = capacity.saturating_sub(self.slots.available_permits());
        if busy > 0 {
            health.details = Some(format!("{busy} of {capacity} worker slots busy"));
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
}

#[derive(Debug, Deserialize)]
struct WhisperJson {
    #[serde(default)]
    result: Option<WhisperMeta>,
    #[serde(default)]
    transcription: Vec<WhisperEntry>,
}

#[derive(Debug, Deserialize)]
struct WhisperMeta {
    language: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WhisperEntry {
    offsets: Offsets,
    text: String,
    #[serde(default)]
    tokens: Vec<WhisperToken>,
}

#[derive(Debug, Deserialize)]
struct Offsets {
    from: i64,
    to: i64,
}

#[derive(Debug, Deserialize)]
struct WhisperToken {
    text: String,
    offsets: Offsets,
    #[serde(default)]
    p: Option<f32>,
}

fn ms_to_seconds(ms: i64) -> f64 {
    if ms < 0 { 0.0 } else { ms as f64 / 1000.0 }
}

/// Map whisper.cpp `-oj` / `-ojf` output into a result.
///
/// Special tokens (`[_BEG_]`, `[_TT_42]`, ...) are skipped when building words and
/// confidence.
pub(crate) fn parse_whisper_json(
    body: &str,
    model: &str,
    word_timestamps: bool,
) -> Result<TranscriptionResult> {
    let parsed: WhisperJson = serde_json::from_str(body)
        .map_err(|err| Error::execution(KIND, format!("unreadable whisper output: {err}")))?;

    let segments: Vec<Segment> = parsed
        .transcription
        .into_iter()
        .map(|entry| {
            let tokens: Vec<&WhisperToken> = entry
                .tokens
                .iter()
                .filter(|t| !t.text.starts_with("[_"))
                .collect();

            let probs: Vec<f32> = tokens.iter().filter_map(|t| t.p).collect();
            let confidence = (!probs.is_empty())
                .then(|| probs.iter().sum::<f32>() / probs.len() as f32);

            let words = if word_timestamps {
                tokens
                    .iter()
                    .filter(|t| !t.text.trim().is_empty())
                    .map(|t| Word {
                        start_seconds: ms_to_seconds(t.offsets.from),
                        end_seconds: ms_to_seconds(t.offsets.to),
                        text: t.text.trim().to_owned(),
                        probability: t.p,
                    })
                    .collect()
            } else {
                Vec::new()
            };

            Segment {
                start_seconds: ms_to_seconds(entry.offsets.from),
                end_seconds: ms_to_seconds(entry.offsets.to),
                text: entry.text.trim().to_owned(),
                confidence,
                words,
            }
        })
        .collect();

    let mut result = TranscriptionResult::new(KIND, model, join_segments(&segments));
    result.duration_seconds = segments.last().map(|s| s.end_seconds).unwrap_or(0.0);
    result.language = parsed.result.and_then(|meta| meta.language);
    result.segments = segments;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthStatus;

    const WHISPER_JSON: &str = r#"{
        "result": {"language": "en"},
        "transcription": [
            {
                "timestamps": {"from": "00:00:00,000", "to": "00:00:01,500"},
                "offsets": {"from": 0, "to": 1500},
                "text": " Treat. Yo.",
                "tokens": [
                    {"text": "[_BEG_]", "offsets": {"from": 0, "to": 0}, "p": 0.2},
                    {"text": " Treat", "offsets": {"from": 0, "to": 700}, "p": 0.9},
                    {"text": ". Yo.", "offsets": {"from": 700, "to": 1500}, "p": 0.7}
                ]
            },
            {
                "timestamps": {"from": "00:00:01,500", "to": "00:00:02,250"},
                "offsets": {"from": 1500, "to": 2250},
                "text": " Self."
            }
        ]
    }"#;

    fn backend(model_dir: &Path) -> anyhow::Result<(LocalBackend, tempfile::NamedTempFile)> {
        let binary = tempfile::NamedTempFile::new()?;
        let config = LocalConfig {
            binary_path: binary.path().to_path_buf(),
            model_dir: model_dir.to_path_buf(),
            threads: Some(3),
            ..LocalConfig::default()
        };
        let backend = LocalBackend::new(config, Arc::new(JobRegistry::new()))?;
        Ok((backend, binary))
    }

    #[test]
    fn parses_full_json_with_words_and_confidence() -> anyhow::Result<()> {
        let result = parse_whisper_json(WHISPER_JSON, "base", true)?;
        assert_eq!(result.text, "Treat. Yo. Self.");
        assert_eq!(result.language.as_deref(), Some("en"));
        assert_eq!(result.duration_seconds, 2.25);
        assert_eq!(result.segments[0].words.len(), 2);
        assert_eq!(result.segments[0].words[0].text, "Treat");

        let confidence = result.segments[0].confidence.expect("confidence");
        assert!((confidence - 0.8).abs() < 1e-6);
        assert!(result.segments[1].confidence.is_none());
        Ok(())
    }

    #[test]
    fn words_are_omitted_unless_requested() -> anyhow::Result<()> {
        let result = parse_whisper_json(WHISPER_JSON, "base", false)?;
        assert!(result.segments.iter().all(|s| s.words.is_empty()));
        Ok(())
    }

    #[test]
    fn missing_binary_means_unavailable() {
        let config = LocalConfig {
            binary_path: PathBuf::from("/no/such/whisper-cli"),
            ..LocalConfig::default()
        };
        let err = match LocalBackend::new(config, Arc::new(JobRegistry::new())) {
            Ok(_) => panic!("expected unavailable backend"),
            Err(err) => err,
        };
        assert_eq!(err.code(), "SERVICE_UNAVAILABLE");
    }

    #[test]
    fn build_args_include_language_threads_and_translate() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let (backend, _binary) = backend(dir.path())?;
        let opts = TranscribeOpts {
            language: Some("es".into()),
            task: Task::Translate,
            ..TranscribeOpts::default()
        };

        let args: Vec<String> = backend
            .build_args(
                Path::new("in.wav"),
                Path::new("ggml-base.bin"),
                Path::new("out"),
                &opts,
            )
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        let joined = args.join(" ");
        assert!(joined.contains("-m ggml-base.bin -f in.wav -of out -t 3"));
        assert!(joined.contains("-l es"));
        assert!(args.contains(&"-tr".to_owned()));
        assert!(args.contains(&"-oj".to_owned()));
        Ok(())
    }

    #[tokio::test]
    async fn health_lists_installed_models() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("ggml-base.bin"), b"")?;
        std::fs::write(dir.path().join("ggml-small.en.bin"), b"")?;
        std::fs::write(dir.path().join("notes.txt"), b"")?;
        let (backend, _binary) = backend(dir.path())?;

        let health = backend.health_status().await;
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.available_models, vec!["base", "small.en"]);
        assert_eq!(backend.model_path("base"), dir.path().join("ggml-base.bin"));
        Ok(())
    }

    #[test]
    fn progress_lines_become_fractions() {
        let line = "whisper_print_progress_callback: progress =  45%";
        assert_eq!(parse_progress(line), Some(0.45));
        assert_eq!(parse_progress("progress = 100%"), Some(1.0));
        assert_eq!(parse_progress("whisper_init_from_file: loading model"), None);
        assert_eq!(parse_progress("progress = lots"), None);
    }

    /// A stand-in whisper binary: prints one progress line, writes `<-of>.json`, then exits
    /// with `code`.
    #[cfg(unix)]
    fn fake_whisper(dir: &Path, code: i32) -> anyhow::Result<PathBuf> {
        use std::os::unix::fs::PermissionsExt;

        let script = format!(
            r#"#!/bin/sh
while [ $# -gt 0 ]; do
  if [ "$1" = "-of" ]; then out="$2"; fi
  shift
done
echo "whisper_print_progress_callback: progress =  50%" >&2
echo "decoder warmed up" >&2
echo '{{"transcription":[{{"offsets":{{"from":0,"to":1000}},"text":" hi there"}}]}}' > "$out.json"
exit {code}
"#
        );
        let path = dir.join(format!("whisper-{code}.sh"));
        std::fs::write(&path, script)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
        Ok(path)
    }

    #[cfg(unix)]
    fn scripted_backend(dir: &Path, code: i32) -> anyhow::Result<LocalBackend> {
        std::fs::write(dir.join("ggml-base.bin"), b"")?;
        let config = LocalConfig {
            binary_path: fake_whisper(dir, code)?,
            model_dir: dir.to_path_buf(),
            threads: Some(1),
            ..LocalConfig::default()
        };
        Ok(LocalBackend::new(config, Arc::new(JobRegistry::new()))?)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_the_binary_and_reads_its_json() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let audio = tempfile::NamedTempFile::new()?;
        let backend = scripted_backend(dir.path(), 0)?;

        let result = backend
            .transcribe_file(audio.path(), &TranscribeOpts::default())
            .await?;
        assert_eq!(result.text, "hi there");
        assert_eq!(result.duration_seconds, 1.0);

        let job = backend.job_status(result.job_id).expect("job recorded");
        assert_eq!(job.progress, 1.0);
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn reported_progress_is_kept_when_whisper_fails() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let audio = tempfile::NamedTempFile::new()?;
        let backend = scripted_backend(dir.path(), 3)?;

        let handle = backend.jobs.submit(KIND, None);
        let id = handle.id();
        let err = backend
            .process(handle, audio.path(), &TranscribeOpts::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "TRANSCRIPTION_FAILED");
        assert!(err.to_string().contains("decoder warmed up"));
        assert!(!err.to_string().contains("progress ="));

        let job = backend.jobs.get(id).expect("job recorded");
        assert_eq!(job.progress, 0.5);
        Ok(())
    }

    #[tokio::test]
    async fn busy_workers_still_report_healthy() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("ggml-base.bin"), b"")?;
        let (backend, _binary) = backend(dir.path())?;

        let _running = backend.slots.acquire().await?;
        let health = backend.health_status().await;
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.details.as_deref(), Some("1 of 1 worker slots busy"));
        Ok(())
    }

    #[tokio::test]
    async fn health_is_unhealthy_without_models() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let (backend, _binary) = backend(dir.path())?;
        let health = backend.health_status().await;
        assert_eq!(health.status, HealthStatus::Unhealthy);
        Ok(())
    }

    #[tokio::test]
    async fn missing_model_fails_the_job() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let audio = tempfile::NamedTempFile::new()?;
        let (backend, _binary) = backend(dir.path())?;

        let err = backend
            .transcribe_file(audio.path(), &TranscribeOpts::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "TRANSCRIPTION_FAILED");
        assert!(err.to_string().contains("model not found"));
        assert!(backend.active_jobs().is_empty());
        Ok(())
    }
}
