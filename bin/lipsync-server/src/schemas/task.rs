use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct GenerateRequest {
    pub job_id: String,
    /// Text to speak, at most 200 characters by default.
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct GenerateResponse {
    pub task_id: String,
    pub job_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TaskStatusResponse {
    pub task_id: String,
    pub job_id: String,
    /// One of `queued`, `preprocessing`, `tts`, `lipsync`, `postprocessing`,
    /// `done` or `error`.
    pub status: String,
    /// Advisory completion percentage.
    pub progress: u8,
    pub output_path: Option<String>,
    /// Download URL of the finished GIF, present once `status` is `done`.
    pub output_url: Option<String>,
    pub error_message: Option<String>,
}
