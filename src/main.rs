mod candidates;
mod compositor;
mod config;
mod evaluator;
mod google_auth;
mod http;
mod jobs;
mod metrics;
mod models;
mod monitor;
mod pipeline;
mod poller;
mod product_code;
mod publisher;
mod sheets;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use config::{AppConfig, Branding};
use eyre::WrapErr;
use google_auth::TokenProvider;
use models::{ApiError, ProcessRequest, ProcessingResult};
use monitor::{LogEntry, LogLevel, MonitorEvent, MonitorState};
use pipeline::Pipeline;
use poller::{OutputColumns, SheetPoller, SweepError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sheets::GoogleSheetsClient;
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::watch;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

const DEFAULT_LOG_LIMIT: usize = 100;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = Arc::new(AppConfig::from_env());
    let branding = Branding::load(config.branding_file.as_ref());
    let pipeline = Pipeline::new(config.pipeline.clone(), &branding)
        .wrap_err("invalid PRODUCT_CODE_PREFIXES")?;
    let monitor = Arc::new(MonitorState::new(config.log_max_lines));
    let (queue, _worker) = jobs::JobQueue::spawn(pipeline.clone(), config.queue_capacity);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poller = match config.sheet.clone() {
        Some(sheet) => {
            let columns = OutputColumns {
                image: sheet.image_column.clone(),
                vertical: sheet.vertical_column.clone(),
            };
            let http =
                http::build_client(config.pipeline.page_timeout, config.pipeline.connect_timeout);
            let auth = TokenProvider::from_settings(http.clone(), &sheet.auth)
                .wrap_err("invalid Google Sheets credentials")?;
            let client = GoogleSheetsClient::new(http, sheet, auth);
            Some(Arc::new(SheetPoller::new(
                pipeline.clone(),
                Arc::new(client),
                monitor.clone(),
                config.poll.clone(),
                columns,
            )))
        }
        None => None,
    };
    match &poller {
        Some(poller) => {
            tokio::spawn(poller.clone().run(shutdown_rx));
        }
        None => monitor.record(MonitorEvent::Note {
            level: LogLevel::Warn,
            message: "GOOGLE_SHEETS_SPREADSHEET_ID or Google credentials not set; sheet polling disabled"
                .to_string(),
        }),
    }

    let state = AppState {
        config: config.clone(),
        pipeline,
        queue,
        monitor,
        poller,
    };
    let app = build_router(state, config.request_max_bytes);

    let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
    info!(target = "sorteio.api", "listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .wrap_err("server error")?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    config: Arc<AppConfig>,
    pipeline: Pipeline,
    queue: jobs::JobQueue,
    monitor: Arc<MonitorState>,
    poller: Option<Arc<SheetPoller<GoogleSheetsClient>>>,
}

fn build_router(state: AppState, body_limit: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let api = Router::new()
        .route("/status", get(status))
        .route("/logs", get(logs))
        .route("/products/process", post(process_product))
        .nest(
            "/jobs",
            Router::new()
                .route("/products", post(enqueue_product_job))
                .route("/{id}", get(get_job_status)),
        )
        .route("/sheet/sweep", post(trigger_sweep));

    Router::new()
        .route("/health", get(health))
        .nest("/api", api)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit))
}

async fn shutdown_signal(tx: watch::Sender<bool>) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(target = "sorteio.api", error = %err, "ctrl-c handler unavailable");
        std::future::pending::<()>().await;
    }
    info!(target = "sorteio.api", "shutdown requested");
    let _ = tx.send(true);
}

/// Liveness check.
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "sorteio-artifacts",
    }))
}

/// Monitor counters plus the knobs an operator usually asks about.
///
/// - Method: `GET`
/// - Path: `/api/status`
async fn status(State(state): State<AppState>) -> Json<serde_json::Value> {
    crate::metrics::inc_requests("/api/status");
    let config = &state.config;
    Json(json!({
        "monitor": state.monitor.snapshot(),
        "config": {
            "poll_interval_secs": config.poll.interval.as_secs(),
            "item_delay_ms": config.poll.item_delay.as_millis() as u64,
            "vertical_enabled": state.pipeline.settings.vertical_enabled,
            "dry_run": state.pipeline.settings.dry_run,
            "sheet_configured": state.poller.is_some(),
        },
    }))
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    limit: Option<usize>,
}

async fn logs(
    State(state): State<AppState>,
    Query(query): Query<LogsQuery>,
) -> Json<Vec<LogEntry>> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LOG_LIMIT)
        .min(state.config.log_max_lines);
    Json(state.monitor.recent_logs(limit))
}

/// Run one product page through the artifact pipeline.
///
/// - Method: `POST`
/// - Path: `/api/products/process`
/// - Body: `ProcessRequest`
/// - Response: `ProcessingResult`; 200 for success or partial, 422 when failed
async fn process_product(
    State(state): State<AppState>,
    Json(payload): Json<ProcessRequest>,
) -> Result<(StatusCode, Json<ProcessingResult>), AppError> {
    crate::metrics::inc_requests("/api/products/process");
    validate_page_url(&payload.page_url)?;
    info!(target = "sorteio.api", page_url = %payload.page_url, "manual product run");
    let result = state.pipeline.process_product(payload).await;
    let status = if result.is_failed() {
        StatusCode::UNPROCESSABLE_ENTITY
    } else {
        StatusCode::OK
    };
    Ok((status, Json(result)))
}

#[derive(Debug, Serialize)]
struct EnqueueResponse {
    job_id: String,
}

async fn enqueue_product_job(
    State(state): State<AppState>,
    Json(payload): Json<ProcessRequest>,
) -> Result<(StatusCode, Json<EnqueueResponse>), AppError> {
    crate::metrics::inc_requests("/api/jobs/products");
    validate_page_url(&payload.page_url)?;
    let id = state
        .queue
        .enqueue_product(payload)
        .await
        .map_err(AppError::Api)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueueResponse {
            job_id: id.to_string(),
        }),
    ))
}

async fn get_job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<jobs::JobInfo>, AppError> {
    let Ok(uuid) = uuid::Uuid::parse_str(&id) else {
        return Err(AppError::BadRequest("invalid_job_id".into()));
    };
    state
        .queue
        .get(uuid)
        .await
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("job {uuid}")))
}

/// Start a sheet sweep in the background.
///
/// - Method: `POST`
/// - Path: `/api/sheet/sweep`
/// - Response: 202 when started, 409 when one is running, 503 without a sheet
async fn trigger_sweep(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    crate::metrics::inc_requests("/api/sheet/sweep");
    let Some(poller) = state.poller.clone() else {
        return Err(AppError::Unavailable("sheet not configured".into()));
    };
    if poller.is_running() {
        return Err(AppError::Conflict("sweep already running".into()));
    }
    tokio::spawn(async move {
        match poller.sweep().await {
            Ok(summary) => {
                info!(target = "sorteio.api", updated = summary.updated, failed = summary.failed, "manual sweep finished")
            }
            Err(SweepError::AlreadyRunning) => {}
            Err(err) => warn!(target = "sorteio.api", error = %err, "manual sweep failed"),
        }
    });
    Ok((StatusCode::ACCEPTED, Json(json!({ "status": "started" }))))
}

fn validate_page_url(raw: &str) -> Result<(), AppError> {
    let parsed = url::Url::parse(raw.trim())
        .map_err(|err| AppError::BadRequest(format!("invalid page_url: {err}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(AppError::BadRequest("page_url must be http(s)".into()));
    }
    Ok(())
}

#[derive(Debug)]
enum AppError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Unavailable(String),
    Api(ApiError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, payload) = match self {
            AppError::BadRequest(detail) => (StatusCode::BAD_REQUEST, api_error("bad_request", detail)),
            AppError::NotFound(detail) => (StatusCode::NOT_FOUND, api_error("not_found", detail)),
            AppError::Conflict(detail) => (StatusCode::CONFLICT, api_error("conflict", detail)),
            AppError::Unavailable(detail) => {
                (StatusCode::SERVICE_UNAVAILABLE, api_error("unavailable", detail))
            }
            AppError::Api(err) => (StatusCode::SERVICE_UNAVAILABLE, err),
        };
        (status, Json(payload)).into_response()
    }
}

fn api_error(error: &str, detail: String) -> ApiError {
    ApiError {
        error: error.to_string(),
        detail: Some(detail),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
