//! Finished GIF download (`GET /output/{filename}`).

use std::sync::Arc;

use axum::extract::{Path, Request, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use tracing::debug;
use utoipa::OpenApi;

use crate::error::ServerError;
use crate::routes::upload::{base_name, serve_file};
use crate::schemas::ErrorResponse;
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(paths(get_output), components(schemas(ErrorResponse)))]
pub struct OutputApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/output/{filename}", get(get_output))
}

/// Download a finished GIF (`GET /output/{filename}`).
///
/// Only plain file names inside the output directory are served; any
/// directory part in `filename` is discarded.
#[utoipa::path(
    get,
    path = "/output/{filename}",
    tag = "output",
    params(("filename" = String, Path, description = "`<task_id>.gif` as linked from GET /status")),
    responses(
        (status = 200, description = "The GIF"),
        (status = 404, description = "No such output", body = ErrorResponse),
    )
)]
pub async fn get_output(
    State(state): State<Arc<AppState>>,
    Path(filename): Path<String>,
    request: Request,
) -> Result<Response, ServerError> {
    let name = base_name(&filename);
    if name.is_empty() || name == "." || name == ".." {
        return Err(ServerError::NotFound("output not found".into()));
    }
    let path = state.config.output_dir.join(&name);

    match serve_file(&path, request).await? {
        Some(response) => Ok(response),
        None => {
            debug!(requested = %filename, "output not found");
            Err(ServerError::NotFound("output not found".into()))
        }
    }
}
