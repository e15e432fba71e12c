use std::{sync::Arc, time::Duration};

use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    engine::Engine,
    error::EngineError,
    sink::{MemoryStore, ScanResultRecord, SessionId, SessionRecord},
    types::{JobId, JobStatus, TaskKind, ThresholdSet},
};

const REAP_EVERY: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct AppState {
    engine: Arc<Engine>,
    /// Read side for alert and session queries, when persistence is in-process.
    store: Option<Arc<MemoryStore>>,
}

impl AppState {
    pub fn new(engine: Arc<Engine>, store: Option<Arc<MemoryStore>>) -> Self {
        Self { engine, store }
    }
}

#[derive(Debug, Deserialize)]
pub struct ScanRequest {
    pub target: String,
    #[serde(default)]
    pub start_port: Option<u32>,
    #[serde(default)]
    pub end_port: Option<u32>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct MonitorRequest {
    pub kind: TaskKind,
    #[serde(default)]
    pub interval_ms: Option<u64>,
    #[serde(default)]
    pub thresholds: Option<ThresholdSet>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Started {
    pub job_id: JobId,
}

#[derive(Debug, Deserialize)]
pub struct AlertQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct SessionQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

/// One stored session with its scan results.
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionDetail {
    pub session: SessionRecord,
    pub results: Vec<ScanResultRecord>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// Engine errors mapped onto HTTP status codes.
struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        let status = match &e {
            EngineError::InvalidArgument(_) | EngineError::Config(_) => StatusCode::BAD_REQUEST,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::HostResolution { .. } | EngineError::Sink(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody { error: self.message })).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/scan", post(post_scan))
        .route("/monitor", post(post_monitor))
        .route("/jobs", get(list_jobs))
        .route("/jobs/{id}", get(get_job))
        .route("/jobs/{id}/cancel", post(cancel_job))
        .route("/alerts", get(get_alerts))
        .route("/stats", get(get_stats))
        .route("/sessions", get(list_sessions))
        .route("/sessions/{id}", get(get_session))
        .with_state(state);

    Router::new()
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
}

/// Serve the API on `bind` until `shutdown` resolves, purging expired jobs in the background.
pub async fn spawn_server(
    bind: &str,
    state: AppState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let engine = state.engine.clone();
    let reaper = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(REAP_EVERY);
        loop {
            ticker.tick().await;
            engine.purge_expired().await;
        }
    });

    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "serving API");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    reaper.abort();
    Ok(())
}

fn port_arg(name: &str, value: Option<u32>, default: u16) -> Result<u16, EngineError> {
    match value {
        None => Ok(default),
        Some(v) => u16::try_from(v)
            .map_err(|_| EngineError::InvalidArgument(format!("{name} out of range: {v}"))),
    }
}

async fn post_scan(
    State(app): State<AppState>,
    Json(req): Json<ScanRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let config = app.engine.config();
    let start = port_arg("start_port", req.start_port, config.default_start_port)?;
    let end = port_arg("end_port", req.end_port, config.default_end_port)?;
    let timeout = req
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| config.scan_timeout());

    let job_id = app
        .engine
        .start_port_scan(&req.target, start, end, timeout)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(Started { job_id })))
}

async fn post_monitor(
    State(app): State<AppState>,
    Json(req): Json<MonitorRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let config = app.engine.config();
    let default_interval = match req.kind {
        TaskKind::ProcessMonitor => config.process_interval(),
        _ => config.monitor_interval(),
    };
    let interval = req
        .interval_ms
        .map(Duration::from_millis)
        .unwrap_or(default_interval);
    let thresholds = req.thresholds.unwrap_or(config.thresholds);

    let job_id = app
        .engine
        .start_monitor(req.kind, interval, thresholds)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(Started { job_id })))
}

async fn list_jobs(State(app): State<AppState>) -> impl IntoResponse {
    let statuses: Vec<JobStatus> = app.engine.list().await.iter().map(JobStatus::from).collect();
    (StatusCode::OK, Json(statuses))
}

fn parse_job_id(raw: &str) -> Result<JobId, ApiError> {
    raw.parse::<JobId>().map_err(|_| ApiError {
        status: StatusCode::NOT_FOUND,
        message: format!("job not found: {raw}"),
    })
}

async fn get_job(
    State(app): State<AppState>,
    Path(raw): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_job_id(&raw)?;
    Ok(Json(app.engine.status(id).await?))
}

async fn cancel_job(
    State(app): State<AppState>,
    Path(raw): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_job_id(&raw)?;
    app.engine.cancel(id).await?;
    Ok(Json(app.engine.status(id).await?))
}

async fn get_alerts(State(app): State<AppState>, Query(q): Query<AlertQuery>) -> Response {
    match app.store.as_ref() {
        Some(store) => {
            let alerts = store.recent_alerts(q.limit.unwrap_or(200));
            (StatusCode::OK, Json(alerts)).into_response()
        }
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn get_stats(State(app): State<AppState>) -> Response {
    match app.store.as_ref() {
        Some(store) => (StatusCode::OK, Json(store.statistics())).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn list_sessions(State(app): State<AppState>, Query(q): Query<SessionQuery>) -> Response {
    match app.store.as_ref() {
        Some(store) => {
            let sessions = store.recent_sessions(q.limit.unwrap_or(50));
            (StatusCode::OK, Json(sessions)).into_response()
        }
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn get_session(State(app): State<AppState>, Path(raw): Path<String>) -> Response {
    let Some(store) = app.store.as_ref() else {
        return StatusCode::NO_CONTENT.into_response();
    };
    let not_found = || ApiError {
        status: StatusCode::NOT_FOUND,
        message: format!("session not found: {raw}"),
    };
    let Ok(id) = raw.parse::<SessionId>() else {
        return not_found().into_response();
    };
    match store.session(id) {
        Some(session) => Json(SessionDetail {
            session,
            results: store.session_results(id),
        })
        .into_response(),
        None => not_found().into_response(),
    }
}
