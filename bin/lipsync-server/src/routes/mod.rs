//! Axum router construction.
//!
//! [`build`] assembles the complete application router, including:
//! - Middleware layers (CORS, per-request trace-ID injection)
//! - Optional Swagger UI / OpenAPI document endpoint (disable with `LIPSYNC_ENABLE_SWAGGER=false`)
//! - Health / heartbeat route
//! - Upload, generate, status and output routes

pub mod doc;
mod health;
mod output;
mod tasks;
mod upload;

use std::sync::Arc;

use axum::{Router, middleware};
use tower::ServiceBuilder;
use utoipa_swagger_ui::SwaggerUi;
use uuid::Uuid;

use crate::error::ServerError;
use crate::middleware::{cors, trace};
use crate::state::AppState;

/// Build the complete Axum [`Router`] for the application.
pub fn build(state: Arc<AppState>) -> Router {
    let mut app = Router::new()
        .merge(health::router())
        .merge(upload::router(&state))
        .merge(tasks::router())
        .merge(output::router());

    if state.config.enable_swagger {
        app = app.merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", doc::get_docs()));
    }

    app
        // Outermost layers execute first on the way in.
        .layer(ServiceBuilder::new().layer(cors::cors_layer(state.clone())))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            trace::trace_middleware,
        ))
        .with_state(state)
}

/// Parse a path or body id. Ids that are not UUIDs cannot name a record, so
/// they are reported as missing.
pub(crate) fn parse_id(raw: &str, not_found: &str) -> Result<Uuid, ServerError> {
    Uuid::parse_str(raw.trim()).map_err(|_| ServerError::NotFound(not_found.to_owned()))
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod test {
    use std::path::PathBuf;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use http_body_util::BodyExt;
    use lipsync_core::storage::SqliteStore;
    use lipsync_core::{
        Artifact, AudioInfo, Dispatcher, FnStage, MediaInfo, Pipeline, StageFailure, StageKind,
    };
    use serde_json::{Value, json};
    use tower::ServiceExt;
    use tracing_test::traced_test;

    use super::*;
    use crate::config::Config;

    const BOUNDARY: &str = "lipsync-test-boundary";
    const GIF_BYTES: &[u8] = b"GIF89a\x01\x00\x01\x00\x00\x00\x00;";

    struct Harness {
        app: Router,
        state: Arc<AppState>,
    }

    async fn harness(max_upload_mb: usize) -> Harness {
        let root = std::env::temp_dir().join(format!("lipsync-server-test-{}", Uuid::new_v4()));
        let mut cfg = Config::from_lookup(|_| None);
        cfg.temp_dir = root.join("temp");
        cfg.output_dir = root.join("outputs");
        cfg.max_upload_mb = max_upload_mb;
        cfg.runtime.work_root = root.join("work");

        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let pipeline = fake_pipeline(&cfg);
        let dispatcher = Dispatcher::start(store, pipeline, cfg.runtime.clone()).unwrap();
        let state = Arc::new(AppState {
            config: Arc::new(cfg),
            dispatcher,
        });
        Harness {
            app: build(state.clone()),
            state,
        }
    }

    /// Every stage succeeds instantly; the last one writes a tiny GIF.
    fn fake_pipeline(cfg: &Config) -> Pipeline {
        let output_dir: PathBuf = cfg.output_dir.clone();
        Pipeline::builder(&cfg.runtime)
            .stage(FnStage::new(StageKind::Preprocess, |a| {
                Ok(Artifact::Normalized(MediaInfo {
                    path: a.input_path.clone(),
                    fps: 10.0,
                    duration_secs: 3.0,
                }))
            }))
            .stage(FnStage::new(StageKind::Tts, |a| {
                Ok(Artifact::Speech(AudioInfo {
                    path: a.work_dir.join("speech.wav"),
                    duration_secs: 2.0,
                }))
            }))
            .stage(FnStage::new(StageKind::Lipsync, |a| {
                Ok(Artifact::Synced(a.work_dir.join("synced.mp4")))
            }))
            .stage(FnStage::new(StageKind::Postprocess, move |a| {
                let path = output_dir.join(format!("{}.gif", a.task_id));
                std::fs::create_dir_all(&output_dir)
                    .and_then(|_| std::fs::write(&path, GIF_BYTES))
                    .map_err(|e| StageFailure::collaborator(e.to_string()))?;
                Ok(Artifact::Gif(path))
            }))
            .build()
            .unwrap()
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, header::HeaderMap, Vec<u8>) {
        let response = app.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, headers, body.to_vec())
    }

    async fn send_json(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let (status, _, body) = send(app, req).await;
        (status, serde_json::from_slice(&body).unwrap())
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn multipart(field: &str, filename: &str, content: &[u8]) -> Request<Body> {
        let mut body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; \
             filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(content);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
        Request::builder()
            .method("POST")
            .uri("/upload")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn upload_clip(app: &Router) -> String {
        let (status, body) = send_json(app, multipart("file", "clip.gif", GIF_BYTES)).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        body["job_id"].as_str().unwrap().to_owned()
    }

    async fn wait_for_status(app: &Router, task_id: &str, want: &str) -> Value {
        for _ in 0..250 {
            let (status, body) = send_json(app, get(&format!("/status/{task_id}"))).await;
            assert_eq!(status, StatusCode::OK);
            if body["status"] == want {
                return body;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("task {task_id} never reached {want}");
    }

    #[tokio::test]
    async fn health_reports_gate_occupancy() {
        let h = harness(50).await;
        let (status, body) = send_json(&h.app, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["slots"], 1);
        assert_eq!(body["running"], 0);
    }

    #[tokio::test]
    async fn upload_stores_file_and_serves_preview() {
        let h = harness(50).await;
        let (status, body) = send_json(&h.app, multipart("file", "../clip.gif", GIF_BYTES)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["filename"], "clip.gif");
        assert_eq!(body["size_bytes"], GIF_BYTES.len());

        let job_id = body["job_id"].as_str().unwrap();
        let stored = h.state.config.temp_dir.join(job_id).join("upload.gif");
        assert_eq!(std::fs::read(&stored).unwrap(), GIF_BYTES);

        let preview_url = body["preview_url"].as_str().unwrap();
        assert_eq!(preview_url, format!("/output/preview/{job_id}"));
        let (status, headers, bytes) = send(&h.app, get(preview_url)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[header::CONTENT_TYPE], "image/gif");
        assert_eq!(bytes, GIF_BYTES);
    }

    #[tokio::test]
    async fn upload_rejects_unsupported_type() {
        let h = harness(50).await;
        let (status, body) = send_json(&h.app, multipart("file", "notes.txt", b"hello")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains(".txt"));
    }

    #[tokio::test]
    async fn upload_rejects_oversized_file() {
        let h = harness(1).await;
        let big = vec![0u8; 1024 * 1024 + 1];
        let (status, body) = send_json(&h.app, multipart("file", "clip.mp4", &big)).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert!(body["error"].as_str().unwrap().contains("1 MB"));
        let leftovers = std::fs::read_dir(&h.state.config.temp_dir)
            .map(|entries| entries.count())
            .unwrap_or(0);
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn upload_requires_file_field() {
        let h = harness(50).await;
        let (status, body) = send_json(&h.app, multipart("video", "clip.gif", GIF_BYTES)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("'file'"));
    }

    #[tokio::test]
    async fn generate_runs_task_to_done_and_serves_gif() {
        let h = harness(50).await;
        let job_id = upload_clip(&h.app).await;

        let (status, body) = send_json(
            &h.app,
            post_json("/generate", json!({ "job_id": job_id, "text": "hello there" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["job_id"], job_id.as_str());
        let task_id = body["task_id"].as_str().unwrap().to_owned();

        let done = wait_for_status(&h.app, &task_id, "done").await;
        assert_eq!(done["progress"], 100);
        assert!(done["error_message"].is_null());
        let output_url = done["output_url"].as_str().unwrap().to_owned();
        assert_eq!(output_url, format!("/output/{task_id}.gif"));

        let (status, headers, bytes) = send(&h.app, get(&output_url)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[header::CONTENT_TYPE], "image/gif");
        assert_eq!(bytes, GIF_BYTES);
    }

    #[tokio::test]
    async fn generate_rejects_overlong_text() {
        let h = harness(50).await;
        let job_id = upload_clip(&h.app).await;
        let text = "a".repeat(201);
        let (status, body) = send_json(
            &h.app,
            post_json("/generate", json!({ "job_id": job_id, "text": text })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("200"));
    }

    #[tokio::test]
    async fn generate_rejects_blank_text() {
        let h = harness(50).await;
        let job_id = upload_clip(&h.app).await;
        let (status, _) = send_json(
            &h.app,
            post_json("/generate", json!({ "job_id": job_id, "text": "   " })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn malformed_generate_body_gets_json_error() {
        let h = harness(50).await;
        let req = Request::builder()
            .method("POST")
            .uri("/generate")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{\"job_id\": "))
            .unwrap();
        let (status, body) = send_json(&h.app, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());

        let (status, body) = send_json(&h.app, post_json("/generate", json!({ "text": "hi" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("job_id"));
    }

    #[tokio::test]
    async fn large_output_is_streamed_with_length_and_type() {
        let h = harness(50).await;
        let mut gif = GIF_BYTES.to_vec();
        gif.resize(3 * 1024 * 1024, 0x2a);
        std::fs::create_dir_all(&h.state.config.output_dir).unwrap();
        std::fs::write(h.state.config.output_dir.join("big.gif"), &gif).unwrap();

        let (status, headers, bytes) = send(&h.app, get("/output/big.gif")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[header::CONTENT_TYPE], "image/gif");
        assert_eq!(headers[header::CONTENT_LENGTH], gif.len().to_string().as_str());
        assert_eq!(bytes.len(), gif.len());
        assert!(bytes == gif);

        let (status, body) = send_json(&h.app, get("/output/missing.gif")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "output not found");
    }

    #[tokio::test]
    async fn generate_for_unknown_job_is_not_found() {
        let h = harness(50).await;
        for job_id in [Uuid::new_v4().to_string(), "not-a-uuid".to_owned()] {
            let (status, body) = send_json(
                &h.app,
                post_json("/generate", json!({ "job_id": job_id, "text": "hi" })),
            )
            .await;
            assert_eq!(status, StatusCode::NOT_FOUND);
            assert_eq!(body["error"], "job not found");
        }
    }

    #[tokio::test]
    async fn status_of_unknown_task_is_not_found() {
        let h = harness(50).await;
        let (status, body) = send_json(&h.app, get(&format!("/status/{}", Uuid::new_v4()))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "task not found");
    }

    #[tokio::test]
    async fn output_ignores_directory_components() {
        let h = harness(50).await;
        std::fs::create_dir_all(&h.state.config.temp_dir).unwrap();
        std::fs::write(h.state.config.temp_dir.join("secret.gif"), b"secret").unwrap();

        let (status, _) = send_json(&h.app, get("/output/..%2Ftemp%2Fsecret.gif")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn openapi_document_is_served() {
        let h = harness(50).await;
        let (status, body) = send_json(&h.app, get("/api-docs/openapi.json")).await;
        assert_eq!(status, StatusCode::OK);
        for path in ["/upload", "/generate", "/status/{task_id}", "/output/{filename}", "/health"] {
            assert!(body["paths"].get(path).is_some(), "missing {path}");
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn trace_id_is_echoed() {
        let h = harness(50).await;
        let trace_id = Uuid::new_v4().to_string();
        let req = Request::builder()
            .uri("/health")
            .header(trace::X_TRACE_ID, &trace_id)
            .body(Body::empty())
            .unwrap();
        let (status, headers, _) = send(&h.app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[trace::X_TRACE_ID], trace_id.as_str());
        assert!(logs_contain("response finished"));
    }
}
