use std::sync::OnceLock;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{MatchedPath, State};
use axum::http::Request;
use axum::http::{HeaderValue, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts as PromOpts,
    Registry, TextEncoder,
};

use scribe_router::BackendKind;
use scribe_router::health::HealthStatus;

use crate::AppState;

struct Metrics {
    registry: Registry,
    http_requests_total: IntCounterVec,
    http_request_duration_seconds: HistogramVec,
    http_in_flight_requests: IntGauge,
    transcriptions_total: IntCounterVec,
    backend_up: IntGaugeVec,
    active_jobs: IntGauge,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

fn build() -> prometheus::Result<Metrics> {
    let registry = Registry::new();

    let http_requests_total = IntCounterVec::new(
        PromOpts::new(
            "scribe_router_http_requests_total",
            "Total HTTP requests served by scribe-router-server.",
        ),
        &["status"],
    )?;

    let http_request_duration_seconds = HistogramVec::new(
        HistogramOpts::new(
            "scribe_router_http_request_duration_seconds",
            "HTTP request latency in seconds.",
        ),
        &["status"],
    )?;

    let http_in_flight_requests = IntGauge::new(
        "scribe_router_http_in_flight_requests",
        "Current number of in-flight HTTP requests.",
    )?;

    let transcriptions_total = IntCounterVec::new(
        PromOpts::new(
            "scribe_router_transcriptions_total",
            "Routed transcription requests by serving backend and outcome.",
        ),
        &["backend", "outcome"],
    )?;

    let backend_up = IntGaugeVec::new(
        PromOpts::new(
            "scribe_router_backend_up",
            "1 when the last health cycle found the backend healthy.",
        ),
        &["backend"],
    )?;

    let active_jobs = IntGauge::new(
        "scribe_router_active_jobs",
        "Jobs currently queued or processing.",
    )?;

    registry.register(Box::new(http_requests_total.clone()))?;
    registry.register(Box::new(http_request_duration_seconds.clone()))?;
    registry.register(Box::new(http_in_flight_requests.clone()))?;
    registry.register(Box::new(transcriptions_total.clone()))?;
    registry.register(Box::new(backend_up.clone()))?;
    registry.register(Box::new(active_jobs.clone()))?;

    Ok(Metrics {
        registry,
        http_requests_total,
        http_request_duration_seconds,
        http_in_flight_requests,
        transcriptions_total,
        backend_up,
        active_jobs,
    })
}

pub fn init() -> prometheus::Result<()> {
    if METRICS.get().is_none() {
        let _ = METRICS.set(build()?);
    }
    Ok(())
}

/// Count one routed request. `backend` is the serving backend, or the one the error names.
pub fn record_transcription(backend: Option<BackendKind>, outcome: &str) {
    let Some(metrics) = METRICS.get() else {
        return;
    };
    let backend = backend.map(|kind| kind.as_str()).unwrap_or("none");
    metrics
        .transcriptions_total
        .with_label_values(&[backend, outcome])
        .inc();
}

pub async fn prometheus_metrics(State(state): State<AppState>) -> Response {
    let Some(metrics) = METRICS.get() else {
        return (StatusCode::SERVICE_UNAVAILABLE, "metrics disabled").into_response();
    };

    let snapshot = state.router.monitor().snapshot();
    for kind in state.router.backends().kinds() {
        let up = snapshot.backend_status(kind) == HealthStatus::Healthy;
        metrics
            .backend_up
            .with_label_values(&[kind.as_str()])
            .set(i64::from(up));
    }
    metrics
        .active_jobs
        .set(state.router.active_jobs().len() as i64);

    let families = metrics.registry.gather();
    let mut buf = Vec::new();
    if TextEncoder::new().encode(&families, &mut buf).is_err() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "failed to encode metrics",
        )
            .into_response();
    }

    (
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
        )],
        buf,
    )
        .into_response()
}

pub async fn track_http_metrics(req: Request<Body>, next: Next) -> Response {
    let Some(metrics) = METRICS.get() else {
        return next.run(req).await;
    };

    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str())
        .unwrap_or_else(|| req.uri().path())
        .to_owned();

    if route == "/metrics" || route == "/health" {
        return next.run(req).await;
    }

    let start = Instant::now();

    metrics.http_in_flight_requests.inc();
    let response = next.run(req).await;
    metrics.http_in_flight_requests.dec();

    let status = response.status().as_u16().to_string();
    metrics
        .http_requests_total
        .with_label_values(&[&status])
        .inc();
    metrics
        .http_request_duration_seconds
        .with_label_values(&[&status])
        .observe(start.elapsed().as_secs_f64());

    response
}
