//! Task submission (`POST /generate`) and polling (`GET /status/{task_id}`).

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use lipsync_core::TaskRecord;
use tracing::info;
use utoipa::OpenApi;

use crate::error::ServerError;
use crate::routes::parse_id;
use crate::routes::upload::base_name;
use crate::schemas::ErrorResponse;
use crate::schemas::task::{GenerateRequest, GenerateResponse, TaskStatusResponse};
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    paths(generate, get_status),
    components(schemas(GenerateRequest, GenerateResponse, TaskStatusResponse, ErrorResponse))
)]
pub struct TasksApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/generate", post(generate))
        .route("/status/{task_id}", get(get_status))
}

/// Queue a lip-sync run for an uploaded job (`POST /generate`).
///
/// Returns as soon as the task is queued; poll `GET /status/{task_id}`.
#[utoipa::path(
    post,
    path = "/generate",
    tag = "tasks",
    request_body = GenerateRequest,
    responses(
        (status = 200, description = "Task queued", body = GenerateResponse),
        (status = 400, description = "Malformed body, empty or overlong text", body = ErrorResponse),
        (status = 404, description = "Unknown job", body = ErrorResponse),
        (status = 503, description = "Work queue full or server shutting down", body = ErrorResponse),
    )
)]
pub async fn generate(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<Json<GenerateResponse>, ServerError> {
    let Json(req) = payload.map_err(|e| ServerError::BadRequest(e.body_text()))?;
    let job_id = parse_id(&req.job_id, "job not found")?;
    let task_id = state.dispatcher.submit(job_id, &req.text).await?;
    info!(task_id = %task_id, job_id = %job_id, "generation requested");
    Ok(Json(GenerateResponse {
        task_id: task_id.to_string(),
        job_id: job_id.to_string(),
    }))
}

/// Current state of a task (`GET /status/{task_id}`).
#[utoipa::path(
    get,
    path = "/status/{task_id}",
    tag = "tasks",
    params(("task_id" = String, Path, description = "Id returned by POST /generate")),
    responses(
        (status = 200, description = "Task state", body = TaskStatusResponse),
        (status = 404, description = "Unknown task", body = ErrorResponse),
    )
)]
pub async fn get_status(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskStatusResponse>, ServerError> {
    let task_id = parse_id(&task_id, "task not found")?;
    let record = state.dispatcher.task(task_id).await?;
    Ok(Json(status_response(record)))
}

fn status_response(record: TaskRecord) -> TaskStatusResponse {
    let output_url = record
        .output_path
        .as_ref()
        .and_then(|p| p.to_str())
        .map(|p| format!("/output/{}", base_name(p)));
    TaskStatusResponse {
        task_id: record.task_id.to_string(),
        job_id: record.job_id.to_string(),
        status: record.status.to_string(),
        progress: record.progress,
        output_path: record
            .output_path
            .as_ref()
            .map(|p| p.display().to_string()),
        output_url,
        error_message: record.error_message,
    }
}

#[cfg(test)]
mod test {
    use chrono::Utc;
    use lipsync_core::{TaskStatus, TaskUpdate};
    use uuid::Uuid;

    use super::*;

    #[test]
    fn finished_task_links_its_gif() {
        let mut record = TaskRecord::queued(Uuid::new_v4(), "hello");
        for status in [
            TaskStatus::Preprocessing,
            TaskStatus::Tts,
            TaskStatus::Lipsync,
            TaskStatus::Postprocessing,
        ] {
            record
                .apply(&TaskUpdate::Advance { status, progress: 50 }, Utc::now())
                .unwrap();
        }
        let output = format!("./outputs/{}.gif", record.task_id);
        record
            .apply(
                &TaskUpdate::Complete {
                    output_path: output.clone().into(),
                },
                Utc::now(),
            )
            .unwrap();

        let body = status_response(record.clone());
        assert_eq!(body.status, "done");
        assert_eq!(body.progress, 100);
        assert_eq!(body.output_path.as_deref(), Some(output.as_str()));
        assert_eq!(
            body.output_url,
            Some(format!("/output/{}.gif", record.task_id))
        );
        assert!(body.error_message.is_none());
    }

    #[test]
    fn queued_task_has_no_output() {
        let body = status_response(TaskRecord::queued(Uuid::new_v4(), "hello"));
        assert_eq!(body.status, "queued");
        assert!(body.output_url.is_none());
    }
}
