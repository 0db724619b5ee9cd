//! Upload intake (`POST /upload`) and preview (`GET /output/preview/{job_id}`).
//!
//! An upload becomes a job: the file is streamed to
//! `<temp_dir>/<job_id>/upload.<ext>` and a job record pointing at it is
//! written. Nothing is queued until `POST /generate` names the job.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::multipart::{Field, MultipartError};
use axum::extract::{DefaultBodyLimit, Multipart, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use lipsync_core::JobRecord;
use lipsync_core::services::check_extension;
use lipsync_core::storage::JobStore;
use tokio::io::AsyncWriteExt;
use tower::ServiceExt;
use tower_http::services::ServeFile;
use tracing::{debug, info, warn};
use utoipa::OpenApi;

use crate::error::ServerError;
use crate::routes::parse_id;
use crate::schemas::ErrorResponse;
use crate::schemas::job::{UploadForm, UploadResponse};
use crate::state::AppState;

/// Multipart framing overhead allowed on top of the file size limit.
const MULTIPART_SLACK_BYTES: usize = 64 * 1024;

#[derive(OpenApi)]
#[openapi(
    paths(upload, get_preview),
    components(schemas(UploadForm, UploadResponse, ErrorResponse))
)]
pub struct UploadApi;

pub fn router(state: &AppState) -> Router<Arc<AppState>> {
    let body_limit = state
        .config
        .max_upload_bytes()
        .saturating_add(MULTIPART_SLACK_BYTES);
    Router::new()
        .route(
            "/upload",
            post(upload).layer(DefaultBodyLimit::max(body_limit)),
        )
        .route("/output/preview/{job_id}", get(get_preview))
}

/// Upload a GIF or short video clip (`POST /upload`).
///
/// The file is validated by extension and size, stored, and registered as a
/// job. Returns the new `job_id` and a preview URL.
#[utoipa::path(
    post,
    path = "/upload",
    tag = "jobs",
    request_body(content = UploadForm, content_type = "multipart/form-data"),
    responses(
        (status = 200, description = "File stored and job created", body = UploadResponse),
        (status = 400, description = "Missing file or unsupported type", body = ErrorResponse),
        (status = 413, description = "File too large", body = ErrorResponse),
    )
)]
pub async fn upload(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ServerError> {
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() != Some("file") {
            debug!(field = ?field.name(), "ignoring multipart field");
            continue;
        }
        return store_upload(&state, field).await.map(Json);
    }
    Err(ServerError::BadRequest(
        "multipart field 'file' is required".into(),
    ))
}

async fn store_upload(state: &AppState, field: Field<'_>) -> Result<UploadResponse, ServerError> {
    let filename = field
        .file_name()
        .map(base_name)
        .unwrap_or_default();
    let extension = check_extension(Path::new(&filename))
        .map_err(|e| ServerError::BadRequest(e.to_string()))?;

    let mut job = JobRecord::new(PathBuf::new());
    let job_dir = state.config.temp_dir.join(job.job_id.to_string());
    job.input_path = job_dir.join(format!("upload.{extension}"));
    job.preview_path = Some(job.input_path.clone());

    tokio::fs::create_dir_all(&job_dir).await?;
    let size_bytes = match write_field(field, &job.input_path, state.config.max_upload_bytes()).await
    {
        Ok(size) => size,
        Err(e) => {
            discard(&job_dir).await;
            return Err(e);
        }
    };
    if size_bytes == 0 {
        discard(&job_dir).await;
        return Err(ServerError::BadRequest("uploaded file is empty".into()));
    }

    if let Err(e) = state.store().create_job(job.clone()).await {
        discard(&job_dir).await;
        return Err(e.into());
    }

    info!(
        job_id = %job.job_id,
        filename = %filename,
        size_bytes,
        "upload stored"
    );
    Ok(UploadResponse {
        job_id: job.job_id.to_string(),
        preview_url: format!("/output/preview/{}", job.job_id),
        filename,
        size_bytes,
    })
}

/// Stream `field` into `path`, enforcing `max_bytes`.
async fn write_field(mut field: Field<'_>, path: &Path, max_bytes: usize) -> Result<u64, ServerError> {
    let mut file = tokio::fs::File::create(path).await?;
    let mut written: usize = 0;
    while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
        written = written.saturating_add(chunk.len());
        if written > max_bytes {
            return Err(too_large(max_bytes));
        }
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    Ok(written as u64)
}

/// Fetch the uploaded file back (`GET /output/preview/{job_id}`).
#[utoipa::path(
    get,
    path = "/output/preview/{job_id}",
    tag = "jobs",
    params(("job_id" = String, Path, description = "Id returned by POST /upload")),
    responses(
        (status = 200, description = "The uploaded file"),
        (status = 404, description = "Unknown job or preview missing", body = ErrorResponse),
    )
)]
pub async fn get_preview(
    State(state): State<Arc<AppState>>,
    axum::extract::Path(job_id): axum::extract::Path<String>,
    request: Request,
) -> Result<Response, ServerError> {
    let job_id = parse_id(&job_id, "job not found")?;
    let job = state.dispatcher.job(job_id).await?;
    let path = job.preview_path.unwrap_or(job.input_path);

    match serve_file(&path, request).await? {
        Some(response) => Ok(response),
        None => {
            warn!(job_id = %job_id, path = %path.display(), "preview file missing");
            Err(ServerError::NotFound("preview not available".into()))
        }
    }
}

/// Stream the file at `path` with its guessed content type and length.
/// `None` when there is no such file.
pub(crate) async fn serve_file(path: &Path, request: Request) -> Result<Option<Response>, ServerError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => {}
        Ok(_) => return Ok(None),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let response = match ServeFile::new(path).oneshot(request).await {
        Ok(response) => response,
        Err(never) => match never {},
    };
    Ok(Some(response.into_response()))
}

/// Final path component of a client-supplied name; directories are dropped.
pub(crate) fn base_name(name: &str) -> String {
    name.rsplit(['/', '\\']).next().unwrap_or_default().to_owned()
}

fn multipart_error(e: MultipartError) -> ServerError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ServerError::PayloadTooLarge(e.body_text())
    } else {
        ServerError::BadRequest(format!("failed to read multipart body: {}", e.body_text()))
    }
}

fn too_large(max_bytes: usize) -> ServerError {
    ServerError::PayloadTooLarge(format!(
        "file too large: the limit is {} MB",
        max_bytes / (1024 * 1024)
    ))
}

async fn discard(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        warn!(dir = %dir.display(), error = %e, "failed to remove rejected upload");
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn base_name_strips_directories() {
        assert_eq!(base_name("../../etc/clip.gif"), "clip.gif");
        assert_eq!(base_name("C:\\Users\\me\\clip.mp4"), "clip.mp4");
        assert_eq!(base_name("clip.gif"), "clip.gif");
    }
}
