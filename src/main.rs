//! hinban-ocr — part-number OCR matching server.
//!
//! Thin HTTP dispatcher over the matching pipeline: uploads spawn one
//! background worker thread per task and return a task id immediately;
//! the remaining endpoints read task state.

mod config;
mod error;
mod exec;
mod extract;
mod matcher;
mod normalize;
mod ocr;
mod pipeline;
mod table;
mod task;
mod tokens;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::path::Path as FsPath;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::Config;
use error::PipelineError;
use matcher::DatabaseIndex;
use ocr::OcrBackend;
use pipeline::PdfEntry;
use task::{TaskRegistry, TaskStatus, Totals};

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    tasks: TaskRegistry,
    config: Arc<Config>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hinban_ocr=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    std::fs::create_dir_all(&config.storage_root)?;
    info!(
        "storage root {:?}, default backend {}",
        config.storage_root, config.default_backend
    );

    let state = AppState {
        tasks: TaskRegistry::new(),
        config: Arc::new(config),
    };

    let app = Router::new()
        .route("/health", get(health))
        .route("/upload", post(upload))
        .route("/status/{task_id}", get(status))
        .route("/results/{task_id}", get(results))
        .route("/failures/{task_id}", get(failures))
        .route("/retry", post(retry))
        .route("/download/{task_id}", get(download))
        .layer(DefaultBodyLimit::max(100 * 1024 * 1024)) // 100MB
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await?;
    info!("Server listening on http://0.0.0.0:3000");
    axum::serve(listener, app).await?;

    Ok(())
}

// ============================================================================
// Handlers
// ============================================================================

type ApiError = (StatusCode, String);

fn not_found(message: &str) -> ApiError {
    (StatusCode::NOT_FOUND, message.to_string())
}

fn bad_request(message: impl Into<String>) -> ApiError {
    (StatusCode::BAD_REQUEST, message.into())
}

/// Health check endpoint.
async fn health() -> &'static str {
    "ok"
}

#[derive(Serialize)]
struct UploadResponse {
    task_id: String,
}

/// Accept a reference table + PDFs, spawn the background task, return the
/// task id immediately.
async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let mut db_csv: Option<Vec<u8>> = None;
    let mut pdf_entries: Vec<PdfEntry> = Vec::new();
    let mut selector: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(format!("multipart error: {}", e)))?
    {
        let field_name = field.name().map(|n| n.to_string());
        match field_name.as_deref() {
            Some("db_csv") => {
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| bad_request(format!("failed to read reference table: {}", e)))?;
                db_csv = Some(data.to_vec());
            }
            Some("pdfs") => {
                let name = sanitize_filename(field.file_name());
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| bad_request(format!("failed to read PDF: {}", e)))?;
                pdf_entries.push(PdfEntry { name, data: data.to_vec() });
            }
            Some("ocr_backend") => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| bad_request(format!("failed to read backend selector: {}", e)))?;
                selector = Some(value);
            }
            _ => {}
        }
    }

    let db_bytes = db_csv.ok_or_else(|| bad_request("reference table file `db_csv` is required"))?;
    if pdf_entries.is_empty() {
        return Err(bad_request("at least one PDF file is required"));
    }

    let backend = match selector.map(|s| s.trim().to_lowercase()).filter(|s| !s.is_empty()) {
        Some(name) => OcrBackend::from_str(&name)
            .ok_or_else(|| bad_request(PipelineError::UnsupportedBackend(name).to_string()))?,
        None => state.config.default_backend,
    };

    let (task_id, task) = state.tasks.create();
    info!(
        "task {}: {} PDFs, backend {}",
        task_id,
        pdf_entries.len(),
        backend
    );

    let config = state.config.clone();
    let worker_id = task_id.clone();
    std::thread::spawn(move || {
        pipeline::run_task(task, &worker_id, &config, db_bytes, pdf_entries, backend);
    });

    Ok(Json(UploadResponse { task_id }))
}

#[derive(Serialize)]
struct StatusResponse {
    progress: u8,
    pages: usize,
    totals: Totals,
    backend_requested: Option<String>,
    backend_used: Option<String>,
}

/// Progress and running totals for a task.
async fn status(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    let task = state
        .tasks
        .get(&task_id)
        .ok_or_else(|| not_found("unknown task id"))?;
    let task = task.read().unwrap();
    if task.status == TaskStatus::Error {
        return Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            task.error.clone().unwrap_or_else(|| "task failed".to_string()),
        ));
    }
    Ok(Json(StatusResponse {
        progress: task.progress,
        pages: task.pages,
        totals: task.totals.clone(),
        backend_requested: task.backend_requested.map(|b| b.as_str().to_string()),
        backend_used: task.backend_used.clone(),
    }))
}

/// Matched rows for a completed task.
async fn results(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<Vec<table::ResultRow>>, ApiError> {
    let task = state
        .tasks
        .get(&task_id)
        .ok_or_else(|| not_found("unknown task id"))?;
    let task = task.read().unwrap();
    if task.status != TaskStatus::Completed {
        return Err(bad_request("task has not completed"));
    }
    Ok(Json(task.results.clone()))
}

/// Unmatched tokens for a completed task.
async fn failures(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<Vec<table::FailureRow>>, ApiError> {
    let task = state
        .tasks
        .get(&task_id)
        .ok_or_else(|| not_found("unknown task id"))?;
    let task = task.read().unwrap();
    if task.status != TaskStatus::Completed {
        return Err(bad_request("task has not completed"));
    }
    Ok(Json(task.failures.clone()))
}

#[derive(Deserialize)]
struct RetryRequest {
    task_id: String,
    token: String,
}

#[derive(Serialize)]
struct RetryResponse {
    candidates: Vec<String>,
}

/// Re-run the matcher for a single failed token against the task's stored
/// reference table.
async fn retry(
    State(state): State<AppState>,
    Json(request): Json<RetryRequest>,
) -> Result<Json<RetryResponse>, ApiError> {
    state
        .tasks
        .get(&request.task_id)
        .ok_or_else(|| not_found("unknown task id"))?;

    let db_path = task::task_dir(&state.config.storage_root, &request.task_id).join("database.csv");
    let db_bytes = tokio::fs::read(&db_path)
        .await
        .map_err(|_| not_found("stored reference table is no longer available"))?;

    let table = table::load_reference_table(&db_bytes)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    let index = DatabaseIndex::build(&table);

    let candidates = matcher::match_token(&request.token, &index)
        .into_iter()
        .map(|m| m.matched_identifier)
        .filter(|hinban| !hinban.is_empty())
        .collect();
    Ok(Json(RetryResponse { candidates }))
}

#[derive(Deserialize)]
struct DownloadQuery {
    #[serde(rename = "type")]
    kind: String,
}

/// Download a persisted results/failures table.
async fn download(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    Query(query): Query<DownloadQuery>,
) -> Result<Response, ApiError> {
    let task = state
        .tasks
        .get(&task_id)
        .ok_or_else(|| not_found("unknown task id"))?;

    let (path, filename) = {
        let task = task.read().unwrap();
        match query.kind.as_str() {
            "results" => (task.results_path.clone(), format!("{}_results.csv", task_id)),
            "failures" => (task.failures_path.clone(), format!("{}_failure.csv", task_id)),
            other => return Err(not_found(&format!("unrecognized download type: {}", other))),
        }
    };

    let path = path.ok_or_else(|| not_found("CSV has not been generated yet"))?;
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|_| not_found("CSV has not been generated yet"))?;

    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", filename),
            ),
        ],
        bytes,
    )
        .into_response())
}

// ============================================================================
// Helper functions
// ============================================================================

/// Reduce an uploaded filename to its final component so task storage
/// stays inside the task directory.
fn sanitize_filename(name: Option<&str>) -> String {
    name.and_then(|n| FsPath::new(n).file_name())
        .and_then(|n| n.to_str())
        .map(|n| n.to_string())
        .unwrap_or_else(|| "document.pdf".to_string())
}
