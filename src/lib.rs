//! Core library for Redprobe.  This module wires together the scan
//! controller, dataset registry and HTTP handlers.  The service surface is
//! thin: scans stream newline-delimited JSON progress events, everything
//! else is bookkeeping around them.

mod config;
pub mod datasets;
pub mod engine;
pub mod error;
pub mod failures;
pub mod httpspec;
pub mod policy;
pub mod refusal;
pub mod scan;
pub mod target;
pub mod util;

pub use config::{AppConfig, CiConfig};
pub use engine::{ModuleState, ProgressEvent, ScanSummary};
pub use error::ProbeError;
pub use scan::{run_ci, ScanController, ScanRequest, Thresholds};

use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::{routing::get, routing::post, Json, Router};
use serde::Serialize;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use crate::refusal::RefusalClassifier;

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error_code: i32,
    pub message: String,
    pub http_status: u16,
}

/// Internal application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<ScanController>,
    pub allowed_tokens: Option<HashSet<String>>, // strict auth allowlist
    // Metrics counters
    pub metric_scans_total: Arc<AtomicU64>,
    pub metric_stops_total: Arc<AtomicU64>,
    pub metric_verifies_total: Arc<AtomicU64>,
    // Process start time (epoch secs) and instant for uptime computation
    pub process_start_epoch: f64,
    pub process_start_instant: Instant,
}

/// Build state from environment variables.  Datasets are assembled once at
/// startup and are read-only for every scan served by this process.
pub async fn build_state_from_env() -> Result<AppState, Box<dyn std::error::Error>> {
    let config = AppConfig::from_env().map_err(|e| -> Box<dyn std::error::Error> { e.into() })?;
    Ok(build_state(&config))
}

pub fn build_state(config: &AppConfig) -> AppState {
    let assembled = datasets::assemble(&config.assembly);
    tracing::info!(datasets = assembled.len(), "dataset registry assembled");

    let failures = config.open_failure_sink();
    let controller = ScanController::new(
        assembled,
        RefusalClassifier::builtin(),
        failures,
        config.controller_config(),
    );

    let start_time = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();

    AppState {
        controller: Arc::new(controller),
        allowed_tokens: config.allowed_tokens.clone(),
        metric_scans_total: Arc::new(AtomicU64::new(0)),
        metric_stops_total: Arc::new(AtomicU64::new(0)),
        metric_verifies_total: Arc::new(AtomicU64::new(0)),
        process_start_epoch: start_time.as_secs_f64(),
        process_start_instant: Instant::now(),
    }
}

/// Build the Axum router and attach handlers.  The router holds a copy of
/// the `AppState` for each invocation.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/scan", post(scan_handler))
        .route("/verify", post(verify_handler))
        .route("/stop", post(stop_handler))
        .route("/datasets", get(datasets_handler))
        .route("/failures", get(failures_handler))
        .route("/healthz", get(healthz_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

fn respond_with_error(err: ErrorResponse) -> axum::response::Response {
    let status = StatusCode::from_u16(err.http_status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(err)).into_response()
}

fn authorization_error() -> ErrorResponse {
    ErrorResponse {
        error_code: 2001,
        message: "Unauthorized".into(),
        http_status: 401,
    }
}

fn extract_bearer_token(headers: &HeaderMap) -> Result<String, ErrorResponse> {
    let raw = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(authorization_error)?;

    if raw.len() < 7 || !raw[..6].eq_ignore_ascii_case("bearer") {
        return Err(authorization_error());
    }
    let token = raw[6..].trim();
    if token.is_empty() {
        return Err(authorization_error());
    }
    Ok(token.to_string())
}

fn ensure_authorized(
    headers: &HeaderMap,
    allowed_tokens: Option<&HashSet<String>>,
) -> Result<(), ErrorResponse> {
    let token = extract_bearer_token(headers)?;
    if let Some(tokens) = allowed_tokens {
        if !tokens.contains(&token) {
            return Err(authorization_error());
        }
    }
    Ok(())
}

fn spec_error(err: &ProbeError) -> ErrorResponse {
    ErrorResponse {
        error_code: 4100,
        message: err.to_string(),
        http_status: 400,
    }
}

/// Handler for `POST /scan`.  Starts a scan and streams progress events as
/// newline-delimited JSON until the scan terminates.
async fn scan_handler(
    state: State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<ScanRequest>, JsonRejection>,
) -> axum::response::Response {
    if let Err(err) = ensure_authorized(&headers, state.allowed_tokens.as_ref()) {
        return respond_with_error(err);
    }
    let request = match payload {
        Ok(Json(inner)) => inner,
        Err(rejection) => return rejection.into_response(),
    };

    let rx = match state.controller.start_scan(request) {
        Ok(rx) => rx,
        Err(err) => return respond_with_error(spec_error(&err)),
    };
    state.metric_scans_total.fetch_add(1, Ordering::Relaxed);

    let stream = ReceiverStream::new(rx).map(|event| {
        let mut line = serde_json::to_string(&event).unwrap_or_else(|_| String::from("{}"));
        line.push('\n');
        Ok::<String, Infallible>(line)
    });
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        axum::body::Body::from_stream(stream),
    )
        .into_response()
}

/// Handler for `POST /verify`.  Body is the raw blueprint text; the reply
/// carries the canary outcome.
async fn verify_handler(
    state: State<AppState>,
    headers: HeaderMap,
    blueprint: String,
) -> axum::response::Response {
    if let Err(err) = ensure_authorized(&headers, state.allowed_tokens.as_ref()) {
        return respond_with_error(err);
    }
    state.metric_verifies_total.fetch_add(1, Ordering::Relaxed);
    match state.controller.verify(&blueprint).await {
        Ok(outcome) => (StatusCode::OK, Json(outcome)).into_response(),
        Err(err @ ProbeError::Spec(_)) => respond_with_error(spec_error(&err)),
        Err(err) => {
            // The canary itself failed to travel; report it without a scan.
            let out = serde_json::json!({ "ok": false, "bodyPreview": err.to_string() });
            (StatusCode::OK, Json(out)).into_response()
        }
    }
}

async fn stop_handler(state: State<AppState>, headers: HeaderMap) -> axum::response::Response {
    if let Err(err) = ensure_authorized(&headers, state.allowed_tokens.as_ref()) {
        return respond_with_error(err);
    }
    state.controller.stop();
    state.metric_stops_total.fetch_add(1, Ordering::Relaxed);
    (StatusCode::OK, Json(serde_json::json!({ "stopped": true }))).into_response()
}

async fn datasets_handler(State(state): State<AppState>) -> axum::response::Response {
    let infos = datasets::infos(state.controller.datasets());
    (StatusCode::OK, Json(infos)).into_response()
}

/// Handler for `GET /failures`: the persisted compliance records as
/// newline-delimited JSON.
async fn failures_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> axum::response::Response {
    if let Err(err) = ensure_authorized(&headers, state.allowed_tokens.as_ref()) {
        return respond_with_error(err);
    }
    let records = match state.controller.failures() {
        Some(sink) => match sink.read_all() {
            Ok(records) => records,
            Err(err) => {
                return respond_with_error(ErrorResponse {
                    error_code: 5001,
                    message: format!("failures file unreadable: {err}"),
                    http_status: 500,
                })
            }
        },
        None => Vec::new(),
    };
    let mut body = String::new();
    for record in &records {
        if let Ok(line) = serde_json::to_string(record) {
            body.push_str(&line);
            body.push('\n');
        }
    }
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        body,
    )
        .into_response()
}

/// Simple health endpoint for container readiness / liveness checks.
async fn healthz_handler(State(state): State<AppState>) -> axum::response::Response {
    let json = serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "datasetCount": state.controller.datasets().len(),
    });
    (StatusCode::OK, Json(json)).into_response()
}

/// Prometheus-style metrics exposition.  Text format with simple counters.
async fn metrics_handler(State(state): State<AppState>) -> axum::response::Response {
    use std::fmt::Write as _;
    let mut buf = String::new();
    let scans = state.metric_scans_total.load(Ordering::Relaxed);
    let stops = state.metric_stops_total.load(Ordering::Relaxed);
    let verifies = state.metric_verifies_total.load(Ordering::Relaxed);
    let (failure_lines, failure_errors) = state
        .controller
        .failures()
        .map(|s| (s.lines_total(), s.write_errors_total()))
        .unwrap_or((0, 0));
    let uptime_secs = state.process_start_instant.elapsed().as_secs_f64();

    writeln!(&mut buf, "# HELP redprobe_scans_total Scans started").ok();
    writeln!(&mut buf, "# TYPE redprobe_scans_total counter").ok();
    writeln!(&mut buf, "redprobe_scans_total {}", scans).ok();
    writeln!(&mut buf, "# HELP redprobe_stop_requests_total Stop requests received").ok();
    writeln!(&mut buf, "# TYPE redprobe_stop_requests_total counter").ok();
    writeln!(&mut buf, "redprobe_stop_requests_total {}", stops).ok();
    writeln!(&mut buf, "# HELP redprobe_verifies_total Canary verifications issued").ok();
    writeln!(&mut buf, "# TYPE redprobe_verifies_total counter").ok();
    writeln!(&mut buf, "redprobe_verifies_total {}", verifies).ok();
    writeln!(
        &mut buf,
        "# HELP redprobe_failure_records_total Failure records appended to the sink"
    )
    .ok();
    writeln!(&mut buf, "# TYPE redprobe_failure_records_total counter").ok();
    writeln!(&mut buf, "redprobe_failure_records_total {}", failure_lines).ok();
    writeln!(
        &mut buf,
        "# HELP redprobe_failure_record_write_errors_total Failure sink write failures"
    )
    .ok();
    writeln!(
        &mut buf,
        "# TYPE redprobe_failure_record_write_errors_total counter"
    )
    .ok();
    writeln!(
        &mut buf,
        "redprobe_failure_record_write_errors_total {}",
        failure_errors
    )
    .ok();
    writeln!(
        &mut buf,
        "# HELP redprobe_build_info Build information\n# TYPE redprobe_build_info gauge"
    )
    .ok();
    writeln!(
        &mut buf,
        "redprobe_build_info{{version=\"{}\"}} 1",
        env!("CARGO_PKG_VERSION")
    )
    .ok();
    writeln!(
        &mut buf,
        "# HELP redprobe_process_start_time_seconds Process start time (Unix epoch seconds)\n# TYPE redprobe_process_start_time_seconds gauge"
    )
    .ok();
    writeln!(
        &mut buf,
        "redprobe_process_start_time_seconds {}",
        state.process_start_epoch
    )
    .ok();
    writeln!(
        &mut buf,
        "# HELP redprobe_process_uptime_seconds Process uptime seconds\n# TYPE redprobe_process_uptime_seconds gauge"
    )
    .ok();
    writeln!(&mut buf, "redprobe_process_uptime_seconds {}", uptime_secs).ok();

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        buf,
    )
        .into_response()
}
