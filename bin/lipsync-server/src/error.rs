//! Unified server error type.
//!
//! Every handler returns `Result<T, ServerError>`, which implements
//! [`axum::response::IntoResponse`] so errors are converted to a JSON body
//! `{"error": "..."}` with an appropriate status code.
//!
//! Store and I/O faults are logged with full detail, but only a generic
//! message is returned so file paths and SQL never leak to clients.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use lipsync_core::RuntimeError;
use lipsync_core::storage::StoreError;
use serde_json::json;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum ServerError {
    /// Propagated from the dispatcher.
    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    /// Propagated from the job/task store.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Filesystem failure while handling an upload or serving a file.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The caller referenced a resource that does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The caller sent an invalid or malformed request.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The upload exceeds the configured size limit.
    #[error("payload too large: {0}")]
    PayloadTooLarge(String),
}

impl ServerError {
    fn status_and_message(&self) -> (StatusCode, String) {
        match self {
            ServerError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
            ServerError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
            ServerError::PayloadTooLarge(m) => (StatusCode::PAYLOAD_TOO_LARGE, m.clone()),

            ServerError::Runtime(e) => match e {
                RuntimeError::Validation(v) => (StatusCode::BAD_REQUEST, v.to_string()),
                RuntimeError::JobNotFound { .. } => {
                    (StatusCode::NOT_FOUND, "job not found".to_owned())
                }
                RuntimeError::TaskNotFound { .. } => {
                    (StatusCode::NOT_FOUND, "task not found".to_owned())
                }
                RuntimeError::AlreadyRunning { .. }
                | RuntimeError::AlreadyTerminal { .. }
                | RuntimeError::NotRunnable { .. } => (StatusCode::CONFLICT, e.to_string()),
                RuntimeError::QueueFull { .. } => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "the server is busy; try again later".to_owned(),
                ),
                RuntimeError::Shutdown | RuntimeError::GateBusy | RuntimeError::GateTimeout => {
                    (StatusCode::SERVICE_UNAVAILABLE, e.to_string())
                }
                RuntimeError::InvalidPipeline(_)
                | RuntimeError::InvalidConfig(_)
                | RuntimeError::Store(_) => {
                    error!(error = %e, "dispatcher error");
                    internal()
                }
            },
            ServerError::Store(e) => {
                error!(error = %e, "store error");
                internal()
            }
            ServerError::Io(e) => {
                error!(error = %e, "filesystem error");
                internal()
            }
        }
    }
}

fn internal() -> (StatusCode, String) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal server error".to_owned(),
    )
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, client_message) = self.status_and_message();
        (status, Json(json!({ "error": client_message }))).into_response()
    }
}

#[cfg(test)]
mod test {
    use lipsync_core::ValidationError;
    use uuid::Uuid;

    use super::*;

    #[test]
    fn validation_errors_are_bad_requests() {
        let err = ServerError::from(RuntimeError::Validation(ValidationError::TextTooLong {
            len: 201,
            max: 200,
        }));
        let (status, message) = err.status_and_message();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(message.contains("200"));
    }

    #[test]
    fn missing_records_are_not_found() {
        let err = ServerError::from(RuntimeError::JobNotFound {
            job_id: Uuid::new_v4(),
        });
        assert_eq!(err.status_and_message().0, StatusCode::NOT_FOUND);
    }

    #[test]
    fn full_queue_is_service_unavailable() {
        let err = ServerError::from(RuntimeError::QueueFull { capacity: 4 });
        assert_eq!(err.status_and_message().0, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn store_faults_do_not_leak_detail() {
        let err = ServerError::from(StoreError::Corrupt {
            id: "abc".into(),
            message: "/var/lib/secret.db".into(),
        });
        let (status, message) = err.status_and_message();
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(message, "internal server error");
    }
}
