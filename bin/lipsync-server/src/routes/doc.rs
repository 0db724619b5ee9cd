use utoipa::OpenApi;

use crate::routes::{health, output, tasks, upload};

#[derive(OpenApi)]
#[openapi(info(
    title = "lipsync-server",
    description = "Turns an uploaded clip and a line of text into a lip-synced GIF",
    version = "0.1.0"
))]
pub struct ApiDoc;

pub fn get_docs() -> utoipa::openapi::OpenApi {
    let mut root = ApiDoc::openapi();
    root.merge(health::HealthApi::openapi());
    root.merge(upload::UploadApi::openapi());
    root.merge(tasks::TasksApi::openapi());
    root.merge(output::OutputApi::openapi());
    root
}
