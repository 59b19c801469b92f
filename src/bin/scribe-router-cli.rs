use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use scribe_router::alerts::AlertManager;
use scribe_router::cli::RouterArgs;
use scribe_router::job_registry::JobRegistry;
use scribe_router::request::RequestMetadata;
use scribe_router::system::SysinfoProbe;
use scribe_router::{
    BackendRegistry, HealthMonitor, Method, Priority, RequestRouter, Task, TranscriptionRequest,
};

#[tokio::main]
async fn main() -> Result<()> {
    scribe_router::init_logging();
    let params = Params::parse();
    let config = params.router.to_config();

    let jobs = Arc::new(JobRegistry::new());
    let backends = Arc::new(BackendRegistry::from_config(&config, jobs.clone()));
    let alerts = Arc::new(AlertManager::new());
    let monitor = Arc::new(HealthMonitor::new(
        backends.clone(),
        alerts.clone(),
        jobs,
        Arc::new(SysinfoProbe::new()),
        &config,
    ));

    // One cycle up front so routing sees real health instead of `unknown`.
    let snapshot = monitor.check_now().await;

    if params.health {
        let mut writer = BufWriter::new(io::stdout().lock());
        serde_json::to_writer_pretty(&mut writer, &*snapshot)?;
        writeln!(writer)?;
        writer.flush()?;
        return Ok(());
    }

    let Some(audio_path) = params.audio_path else {
        anyhow::bail!("an audio file is required unless --health is given");
    };

    let mut request = TranscriptionRequest::new(&audio_path)
        .with_method(params.method.parse::<Method>()?)
        .with_fallback(!params.no_fallback);
    request.model = params.model;
    request.language = params.language;
    request.task = params.task.parse::<Task>()?;
    request.priority = params.priority.as_deref().map(str::parse::<Priority>).transpose()?;
    request.word_timestamps = params.word_timestamps;
    request.metadata = RequestMetadata {
        original_filename: audio_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned()),
        ..RequestMetadata::default()
    };

    let router = RequestRouter::new(backends, monitor, alerts, &config);
    let result = router
        .transcribe(&request)
        .await
        .with_context(|| format!("failed to transcribe {}", audio_path.display()))?;

    let mut writer = BufWriter::new(io::stdout().lock());
    if params.text_only {
        writeln!(writer, "{}", result.text)?;
    } else {
        serde_json::to_writer_pretty(&mut writer, &result)?;
        writeln!(writer)?;
    }
    writer.flush()?;
    Ok(())
}

#[derive(Parser, Debug)]
#[command(name = "scribe-router")]
#[command(about = "Route one transcription across the configured backends")]
struct Params {
    /// Audio file to transcribe.
    #[arg(value_name = "AUDIO")]
    pub audio_path: Option<PathBuf>,

    /// `auto`, or a backend name: cloud, local, docker.
    #[arg(short = 'M', long = "method", default_value = "auto")]
    pub method: String,

    #[arg(short = 'm', long = "model")]
    pub model: Option<String>,

    #[arg(short = 'l', long = "language")]
    pub language: Option<String>,

    /// `transcribe` or `translate` (to English).
    #[arg(short = 't', long = "task", default_value = "transcribe")]
    pub task: String,

    /// Tier for this request; defaults to `--priority`.
    #[arg(long = "request-priority")]
    pub priority: Option<String>,

    #[arg(long = "word-timestamps", default_value_t = false)]
    pub word_timestamps: bool,

    /// Fail on the first backend error instead of trying the next backend.
    #[arg(long = "no-fallback", default_value_t = false)]
    pub no_fallback: bool,

    /// Print only the transcript text.
    #[arg(long = "text", default_value_t = false)]
    pub text_only: bool,

    /// Print one health snapshot and exit.
    #[arg(long = "health", default_value_t = false)]
    pub health: bool,

    #[command(flatten)]
    pub router: RouterArgs,
}
