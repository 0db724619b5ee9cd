use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// `multipart/form-data` body of `POST /upload`.
#[derive(Debug, ToSchema)]
#[allow(dead_code)]
pub struct UploadForm {
    /// A GIF or short video clip with a visible, forward-facing face.
    #[schema(value_type = String, format = Binary)]
    pub file: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UploadResponse {
    pub job_id: String,
    /// Where the uploaded file can be fetched back for preview.
    pub preview_url: String,
    /// Original file name as sent by the client.
    pub filename: String,
    pub size_bytes: u64,
}
