use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::middleware::from_fn;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tower_http::trace::{DefaultMakeSpan, DefaultOnFailure, DefaultOnResponse, TraceLayer};
use tracing::{Level, error, info, warn};
use uuid::Uuid;

mod metrics;

use scribe_router::alerts::{Alert, AlertManager, WebhookSink};
use scribe_router::cli::RouterArgs;
use scribe_router::health::HealthSnapshot;
use scribe_router::job::{Job, JobId};
use scribe_router::job_registry::JobRegistry;
use scribe_router::request::RequestMetadata;
use scribe_router::router::PerformanceReport;
use scribe_router::system::SysinfoProbe;
use scribe_router::{
    BackendKind, BackendRegistry, Error, HealthMonitor, Method, RequestRouter,
    TranscriptionRequest, TranscriptionResult,
};

#[derive(Parser, Debug)]
#[command(name = "scribe-router-server")]
#[command(about = "HTTP server routing transcription jobs across cloud, local and container backends")]
struct Params {
    /// Host interface to bind to.
    #[arg(long = "host", env = "SCRIBE_ROUTER_HOST", default_value = "127.0.0.1")]
    host: String,

    /// TCP port to listen on.
    #[arg(long = "port", env = "SCRIBE_ROUTER_PORT", default_value_t = 8080)]
    port: u16,

    /// Maximum upload size (bytes).
    #[arg(long = "max-bytes", env = "SCRIBE_ROUTER_MAX_BYTES", default_value_t = 100 * 1024 * 1024)]
    max_bytes: usize,

    #[command(flatten)]
    router: RouterArgs,
}

#[derive(Clone)]
struct AppState {
    router: Arc<RequestRouter>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    method: Option<BackendKind>,
}

#[derive(Debug)]
struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
    method: Option<BackendKind>,
}

impl AppError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "VALIDATION_ERROR",
            message: message.into(),
            method: None,
        }
    }

    fn not_found(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code,
            message: message.into(),
            method: None,
        }
    }
}

fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::Validation { .. } => StatusCode::BAD_REQUEST,
        Error::JobNotFound { .. } => StatusCode::NOT_FOUND,
        Error::BackendUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        Error::BackendExecution { .. } | Error::AllBackendsFailed { .. } => StatusCode::BAD_GATEWAY,
        Error::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        Error::JobCancelled { .. } => StatusCode::CONFLICT,
        Error::ContainerLifecycle { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        Self {
            status: status_for(&err),
            code: err.code(),
            method: err.method(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
                method: self.method,
            },
        });
        (self.status, body).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, AppError>;

#[tokio::main]
async fn main() {
    scribe_router::init_logging();

    if let Err(err) = run().await {
        error!(error = ?err, "scribe-router-server failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let params = Params::parse();
    let config = params.router.to_config();

    if let Err(err) = metrics::init() {
        warn!(error = ?err, "metrics disabled (init failed)");
    }

    let addr: SocketAddr = format!("{}:{}", params.host, params.port)
        .parse()
        .context("invalid host/port bind address")?;

    let jobs = Arc::new(JobRegistry::new());
    let backends = Arc::new(BackendRegistry::from_config(&config, jobs.clone()));
    if backends.is_empty() {
        warn!("no transcription backend registered; every request will be rejected");
    }

    let mut alerts = AlertManager::new();
    if let Some(url) = &config.alert_webhook_url {
        info!(%url, "forwarding alerts to webhook");
        alerts = alerts.with_sink(Arc::new(WebhookSink::new(url.clone())));
    }
    let alerts = Arc::new(alerts);

    let monitor = Arc::new(HealthMonitor::new(
        backends.clone(),
        alerts.clone(),
        jobs,
        Arc::new(SysinfoProbe::new()),
        &config,
    ));
    monitor.start();

    let router = Arc::new(RequestRouter::new(
        backends,
        monitor.clone(),
        alerts,
        &config,
    ));

    let app = app(AppState { router })
        .layer(DefaultBodyLimit::max(params.max_bytes))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(
                    DefaultMakeSpan::new()
                        .level(Level::INFO)
                        .include_headers(false),
                )
                .on_response(DefaultOnResponse::new().level(Level::INFO))
                .on_failure(DefaultOnFailure::new().level(Level::ERROR)),
        );

    let listener = TcpListener::bind(addr).await.context("bind failed")?;
    info!(%addr, "listening");
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error");

    monitor.stop().await;
    served
}

fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/metrics", get(metrics::prometheus_metrics))
        .route("/models", get(models))
        .route("/performance", get(performance))
        .route("/transcribe", post(transcribe))
        .route("/transcribe/local", post(transcribe_local))
        .route("/transcribe/docker", post(transcribe_docker))
        .route("/jobs", get(active_jobs))
        .route("/jobs/{id}", get(job).delete(cancel_job))
        .route("/docker/start", post(start_container))
        .route("/docker/stop", post(stop_container))
        .route("/alerts", get(alerts))
        .route("/alerts/{id}/resolve", post(resolve_alert))
        .route_layer(from_fn(metrics::track_http_metrics))
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

async fn root() -> &'static str {
    "scribe-router-server: POST /transcribe (multipart field: file)"
}

#[derive(Debug, Deserialize)]
struct HealthQuery {
    #[serde(default)]
    refresh: bool,
}

async fn health(
    State(state): State<AppState>,
    Query(query): Query<HealthQuery>,
) -> Json<HealthSnapshot> {
    let monitor = state.router.monitor();
    let snapshot = if query.refresh {
        monitor.check_now().await
    } else {
        monitor.snapshot()
    };
    Json(HealthSnapshot::clone(&snapshot))
}

#[derive(Debug, Serialize)]
struct ModelsResponse {
    models: BTreeMap<BackendKind, Vec<String>>,
}

async fn models(State(state): State<AppState>) -> Json<ModelsResponse> {
    Json(ModelsResponse {
        models: state.router.models().await,
    })
}

async fn performance(State(state): State<AppState>) -> Json<PerformanceReport> {
    Json(state.router.performance())
}

async fn transcribe(
    State(state): State<AppState>,
    multipart: Multipart,
) -> ApiResult<Json<TranscriptionResult>> {
    route_upload(&state, multipart, None).await
}

async fn transcribe_local(
    State(state): State<AppState>,
    multipart: Multipart,
) -> ApiResult<Json<TranscriptionResult>> {
    route_upload(&state, multipart, Some(BackendKind::Local)).await
}

async fn transcribe_docker(
    State(state): State<AppState>,
    multipart: Multipart,
) -> ApiResult<Json<TranscriptionResult>> {
    route_upload(&state, multipart, Some(BackendKind::Docker)).await
}

async fn route_upload(
    state: &AppState,
    multipart: Multipart,
    forced: Option<BackendKind>,
) -> ApiResult<Json<TranscriptionResult>> {
    let upload = read_upload(multipart).await?;
    let Some(file) = &upload.file else {
        return Err(AppError::bad_request("missing multipart field 'file'"));
    };
    let request = build_request(&upload.fields, file.path(), &upload.metadata, forced)?;

    // The staged upload is removed when `upload` drops, after routing finishes.
    let outcome = state.router.transcribe(&request).await;
    match &outcome {
        Ok(result) => metrics::record_transcription(Some(result.method), "success"),
        Err(err) => metrics::record_transcription(err.method(), err.code()),
    }
    Ok(Json(outcome?))
}

struct Upload {
    file: Option<NamedTempFile>,
    metadata: RequestMetadata,
    fields: HashMap<String, String>,
}

/// Stream the `file` field to a temp file and collect every other field as text.
async fn read_upload(mut multipart: Multipart) -> ApiResult<Upload> {
    let mut upload = Upload {
        file: None,
        metadata: RequestMetadata::default(),
        fields: HashMap::new(),
    };

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::bad_request(err.to_string()))?
    {
        let name = field_key(field.name().unwrap_or_default());
        if name != "file" {
            let value = field
                .text()
                .await
                .map_err(|err| AppError::bad_request(err.to_string()))?;
            upload.fields.insert(name, value);
            continue;
        }

        let file_name = field.file_name().map(str::to_owned);
        let suffix = file_name
            .as_deref()
            .and_then(|name| std::path::Path::new(name).extension())
            .map(|ext| format!(".{}", ext.to_string_lossy()))
            .unwrap_or_default();
        upload.metadata.original_filename = file_name;
        upload.metadata.mime_type = field.content_type().map(str::to_owned);

        let staged = tempfile::Builder::new()
            .prefix("scribe-upload-")
            .suffix(&suffix)
            .tempfile()
            .map_err(|err| internal(format!("failed to stage upload: {err}")))?;
        let std_file = staged
            .reopen()
            .map_err(|err| internal(format!("failed to stage upload: {err}")))?;
        let mut out = tokio::fs::File::from_std(std_file);

        let mut written = 0usize;
        while let Some(chunk) = field
            .chunk()
            .await
            .map_err(|err| AppError::bad_request(err.to_string()))?
        {
            written += chunk.len();
            out.write_all(&chunk)
                .await
                .map_err(|err| internal(format!("failed to stage upload: {err}")))?;
        }
        out.flush()
            .await
            .map_err(|err| internal(format!("failed to stage upload: {err}")))?;

        if written == 0 {
            return Err(AppError::bad_request("uploaded file was empty"));
        }
        upload.file = Some(staged);
    }

    upload.metadata.uploader = upload.fields.get("uploader").cloned();
    Ok(upload)
}

fn internal(message: String) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "INTERNAL_ERROR",
        message,
        method: None,
    }
}

/// `wordTimestamps`, `word_timestamps` and `word-timestamps` all name the same field.
fn field_key(name: &str) -> String {
    name.chars()
        .filter(|c| *c != '_' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect()
}

fn parse_flag(fields: &HashMap<String, String>, key: &str, default: bool) -> ApiResult<bool> {
    let Some(raw) = fields.get(key) else {
        return Ok(default);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "" => Ok(default),
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => Err(AppError::bad_request(format!(
            "invalid boolean '{other}' for field '{key}'"
        ))),
    }
}

fn non_empty(fields: &HashMap<String, String>, key: &str) -> Option<String> {
    fields
        .get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
}

/// Map form fields into a request. Forced routes pin the backend and default to no fallback.
fn build_request(
    fields: &HashMap<String, String>,
    file: &std::path::Path,
    metadata: &RequestMetadata,
    forced: Option<BackendKind>,
) -> ApiResult<TranscriptionRequest> {
    let method = match forced {
        Some(kind) => Method::Backend(kind),
        None => fields
            .get("method")
            .map(|raw| raw.parse::<Method>())
            .transpose()?
            .unwrap_or_default(),
    };

    let mut request = TranscriptionRequest::new(file)
        .with_method(method)
        .with_fallback(parse_flag(fields, "fallbackenabled", forced.is_none())?);
    request.model = non_empty(fields, "model");
    request.language = non_empty(fields, "language").filter(|l| l != "auto");
    if let Some(task) = non_empty(fields, "task") {
        request.task = task.parse()?;
    }
    if let Some(priority) = non_empty(fields, "priority") {
        request.priority = Some(priority.parse()?);
    }
    request.word_timestamps = parse_flag(fields, "wordtimestamps", false)?;
    request.metadata = metadata.clone();
    Ok(request)
}

async fn active_jobs(State(state): State<AppState>) -> Json<Vec<Job>> {
    Json(state.router.active_jobs())
}

fn parse_job_id(raw: &str) -> ApiResult<JobId> {
    raw.parse()
        .map_err(|_| AppError::from(Error::JobNotFound { job_id: raw.to_owned() }))
}

async fn job(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Job>> {
    let id = parse_job_id(&id)?;
    Ok(Json(state.router.job(id)?))
}

#[derive(Debug, Serialize)]
struct CancelResponse {
    job_id: JobId,
    cancelled: bool,
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<CancelResponse>> {
    let job_id = parse_job_id(&id)?;
    let cancelled = state.router.cancel_job(job_id)?;
    Ok(Json(CancelResponse { job_id, cancelled }))
}

#[derive(Debug, Serialize)]
struct ContainerResponse {
    container: &'static str,
    action: &'static str,
}

async fn start_container(State(state): State<AppState>) -> ApiResult<Json<ContainerResponse>> {
    state.router.start_container().await?;
    Ok(Json(ContainerResponse {
        container: BackendKind::Docker.as_str(),
        action: "started",
    }))
}

async fn stop_container(State(state): State<AppState>) -> ApiResult<Json<ContainerResponse>> {
    state.router.stop_container().await?;
    Ok(Json(ContainerResponse {
        container: BackendKind::Docker.as_str(),
        action: "stopped",
    }))
}

#[derive(Debug, Deserialize)]
struct AlertsQuery {
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    active: bool,
}

async fn alerts(State(state): State<AppState>, Query(query): Query<AlertsQuery>) -> Json<Vec<Alert>> {
    let alerts = state.router.alerts();
    let list = if query.active {
        let mut active = alerts.active_alerts();
        if let Some(limit) = query.limit {
            active.truncate(limit);
        }
        active
    } else {
        alerts.get_alerts(query.limit)
    };
    Json(list)
}

async fn resolve_alert(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let not_found = || AppError::not_found("ALERT_NOT_FOUND", format!("alert '{id}' not found"));
    let alert_id: Uuid = id.parse().map_err(|_| not_found())?;
    if state.router.alerts().resolve_alert(alert_id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found())
    }
}
