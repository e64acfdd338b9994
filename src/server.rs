//! HTTP endpoint for batch uploads.
//!
//! `POST /bulk-ocr` takes a multipart form with one or more files and the
//! batch options, runs the batch, and answers with the result as a download
//! (`ocr_results.csv` or `ocr_results.txt`). Errors come back as
//! `{"error": "..."}`: 422 for a bad request, 500 for a processing failure.

use crate::batch::BatchOrchestrator;
use crate::error::ScanError;
use crate::request::{BatchForm, UploadedFile, MAX_FILE_BYTES};
use axum::{
    extract::{
        multipart::{Field, MultipartError},
        DefaultBodyLimit, Multipart, State,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde_json::json;
use std::sync::Arc;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};

/// Maximum number of files per request.
pub const MAX_FILES: usize = 50;

/// Maximum request body: every file at its size limit.
pub const MAX_BODY_BYTES: usize = MAX_FILES * MAX_FILE_BYTES;

/// Multipart field names accepted for uploaded files.
const FILE_FIELDS: &[&str] = &["images[]", "images", "files[]", "files"];

#[derive(Clone)]
pub struct AppState {
    orchestrator: Arc<BatchOrchestrator>,
}

/// Build the application router.
pub fn router(orchestrator: BatchOrchestrator) -> Router {
    let state = AppState {
        orchestrator: Arc::new(orchestrator),
    };

    Router::new()
        .route("/bulk-ocr", post(bulk_ocr))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Error body returned by every failing request.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<ScanError> for ApiError {
    fn from(e: ScanError) -> Self {
        let status = if e.root_cause().is_validation() {
            StatusCode::UNPROCESSABLE_ENTITY
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl From<MultipartError> for ApiError {
    fn from(e: MultipartError) -> Self {
        let status = match e.status() {
            StatusCode::PAYLOAD_TOO_LARGE => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::UNPROCESSABLE_ENTITY,
        };
        Self {
            status,
            message: format!("Failed to read upload: {}", e.body_text()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!("Request failed: {}", self.message);
        } else {
            warn!("Request rejected: {}", self.message);
        }
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Upload files and download the combined result.
///
/// POST /bulk-ocr
async fn bulk_ocr(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let mut form = BatchForm::default();
    let mut files = Vec::new();

    while let Some(mut field) = multipart.next_field().await? {
        let name = field.name().unwrap_or("").to_string();

        if FILE_FIELDS.contains(&name.as_str()) {
            if files.len() >= MAX_FILES {
                return Err(ScanError::Validation(format!(
                    "too many files (maximum {MAX_FILES})"
                ))
                .into());
            }
            let file_name = field
                .file_name()
                .map(str::to_string)
                .unwrap_or_else(|| format!("file-{}", files.len() + 1));
            let content_type = field.content_type().map(str::to_string);
            let bytes = read_file_part(&mut field, &file_name).await?;
            debug!("Received '{}' ({} bytes)", file_name, bytes.len());
            files.push(UploadedFile::from_bytes(
                file_name,
                content_type.as_deref(),
                bytes,
            )?);
            continue;
        }

        let slot = match name.as_str() {
            "ocr_engine" => &mut form.ocr_engine,
            "output_format" => &mut form.output_format,
            "prompt_type" => &mut form.prompt_type,
            "custom_prompt" => &mut form.custom_prompt,
            "columns" => &mut form.columns,
            other => {
                debug!("Ignoring form field '{}'", other);
                continue;
            }
        };
        *slot = Some(field.text().await?);
    }

    let request = form.validate()?;
    if files.is_empty() {
        return Err(ScanError::Validation("no files uploaded".into()).into());
    }

    info!(
        "bulk-ocr: {} file(s), strategy={}, shape={}",
        files.len(),
        request.strategy,
        request.shape
    );
    let output = state.orchestrator.run(files, &request).await?;

    let disposition = format!("attachment; filename=\"{}\"", output.default_file_name());
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, output.content_type().to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        output.text,
    )
        .into_response())
}

/// Read one uploaded file, refusing it as soon as it passes [`MAX_FILE_BYTES`].
async fn read_file_part(field: &mut Field<'_>, file_name: &str) -> Result<Vec<u8>, ApiError> {
    let mut bytes = Vec::new();
    while let Some(chunk) = field.chunk().await? {
        if bytes.len() + chunk.len() > MAX_FILE_BYTES {
            return Err(ScanError::Validation(format!(
                "file '{file_name}' exceeds the {} MB limit",
                MAX_FILE_BYTES / (1024 * 1024)
            ))
            .into());
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(bytes)
}
