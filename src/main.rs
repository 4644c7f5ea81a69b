mod analyze;
mod config;
mod state;
mod storage;

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::{DefaultBodyLimit, Multipart, State},
    http::{StatusCode, header},
    middleware,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use serde_json::{Value, json};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::analyze::GeminiAnalyzer;
use crate::config::{ALLOWED_EXTENSIONS, Config, MAX_CONTENT_LENGTH};
use crate::state::AppState;
use crate::storage::TempFileGuard;

const OVERSIZE_MESSAGE: &str = "File too large. Maximum size is 16MB";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let config = Config::from_env()?;
    init_logging(config.debug);

    info!("Starting Image Analyzer on port {}...", config.port);
    info!("Model: {}", config.model_name);
    info!("Upload directory: {}", config.upload_dir.display());
    info!("Debug mode: {}", config.debug);

    let analyzer = Arc::new(GeminiAnalyzer::new(&config));
    let state = Arc::new(AppState::new(config, analyzer));
    let port = state.config.port;

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!("Server running at http://localhost:{}", port);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/analyze", post(analyze))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(MAX_CONTENT_LENGTH))
        .layer(middleware::map_response(normalize_oversize_response))
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

async fn index() -> Html<&'static str> {
    Html(include_str!("index.html"))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}

/// The `image` multipart field as received from the client.
struct UploadPart {
    filename: String,
    data: Vec<u8>,
}

async fn analyze(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> (StatusCode, Json<Value>) {
    let mut image: Option<UploadPart> = None;
    let mut prompt = String::new();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => return multipart_error(err),
        };

        match field.name() {
            Some("image") => {
                let filename = field.file_name().unwrap_or_default().to_string();
                let data = match field.bytes().await {
                    Ok(bytes) => bytes.to_vec(),
                    Err(err) => return multipart_error(err),
                };
                image = Some(UploadPart { filename, data });
            }
            Some("prompt") => {
                prompt = match field.text().await {
                    Ok(text) => text,
                    Err(err) => return multipart_error(err),
                };
            }
            _ => {}
        }
    }

    run_analysis(&state, image, &prompt).await
}

fn multipart_error(err: axum::extract::multipart::MultipartError) -> (StatusCode, Json<Value>) {
    let status = err.status();
    if status == StatusCode::PAYLOAD_TOO_LARGE {
        return (status, Json(json!({ "error": OVERSIZE_MESSAGE })));
    }
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": "Invalid multipart form data" })),
    )
}

/// Validate, store, analyze, respond. The temp file is removed on every exit
/// path once it exists.
async fn run_analysis(
    state: &AppState,
    image: Option<UploadPart>,
    prompt: &str,
) -> (StatusCode, Json<Value>) {
    let Some(image) = image else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "No image uploaded" })),
        );
    };

    let prompt = prompt.trim();
    if prompt.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Prompt is required" })),
        );
    }

    if image.filename.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "No image selected" })),
        );
    }

    if !storage::is_allowed_extension(&image.filename, ALLOWED_EXTENSIONS) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": format!(
                    "File type not allowed. Allowed types: {}",
                    ALLOWED_EXTENSIONS.join(", ")
                )
            })),
        );
    }

    // Backstop for the body-limit layer.
    if image.data.len() > MAX_CONTENT_LENGTH {
        return (
            StatusCode::PAYLOAD_TOO_LARGE,
            Json(json!({ "error": OVERSIZE_MESSAGE })),
        );
    }

    let path = match storage::store_upload(
        &image.data,
        &image.filename,
        &state.config.upload_dir,
    )
    .await
    {
        Ok(path) => path,
        Err(err) => {
            error!("failed to store upload '{}': {}", image.filename, err);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "An error occurred while processing your request" })),
            );
        }
    };
    let guard = TempFileGuard::new(path);

    match state.analyzer.analyze(guard.path(), prompt).await {
        Ok(text) => (StatusCode::OK, Json(json!({ "result": text }))),
        Err(err) => {
            error!("error analyzing image '{}': {}", image.filename, err);
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "error": "Image analysis failed" })),
            )
        }
    }
}

/// Give every 413, including the ones produced by the body-limit layer, the
/// fixed JSON shape.
async fn normalize_oversize_response(response: Response) -> Response {
    if response.status() != StatusCode::PAYLOAD_TOO_LARGE {
        return response;
    }
    (
        StatusCode::PAYLOAD_TOO_LARGE,
        Json(json!({ "error": OVERSIZE_MESSAGE })),
    )
        .into_response()
}

fn handle_panic(err: Box<dyn std::any::Any + Send + 'static>) -> Response {
    let detail = if let Some(message) = err.downcast_ref::<String>() {
        message.clone()
    } else if let Some(message) = err.downcast_ref::<&str>() {
        message.to_string()
    } else {
        "unknown panic".to_string()
    };
    error!("handler panicked: {}", detail);

    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({ "error": "Internal server error" }).to_string(),
        ))
        .expect("static response")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyze::{AnalyzeError, ImageAnalyzer};
    use async_trait::async_trait;
    use std::path::Path;

    struct FakeAnalyzer {
        reply: Result<&'static str, ()>,
    }

    #[async_trait]
    impl ImageAnalyzer for FakeAnalyzer {
        async fn analyze(&self, image_path: &Path, _prompt: &str) -> Result<String, AnalyzeError> {
            assert!(image_path.exists(), "temp file should exist during analysis");
            match self.reply {
                Ok(text) => Ok(text.to_string()),
                Err(()) => Err(AnalyzeError::NoText),
            }
        }
    }

    fn test_state(dir: &Path, reply: Result<&'static str, ()>) -> AppState {
        let config = Config {
            api_key: "test-key".to_string(),
            model_name: "gemini-2.0-flash".to_string(),
            temperature: 1.0,
            top_p: 0.95,
            top_k: 64,
            max_output_tokens: 8192,
            upload_dir: dir.to_path_buf(),
            port: 5656,
            debug: false,
        };
        AppState::new(config, Arc::new(FakeAnalyzer { reply }))
    }

    fn upload(filename: &str) -> Option<UploadPart> {
        Some(UploadPart {
            filename: filename.to_string(),
            data: b"not really an image".to_vec(),
        })
    }

    fn dir_is_empty(dir: &Path) -> bool {
        std::fs::read_dir(dir).unwrap().next().is_none()
    }

    #[tokio::test]
    async fn missing_image_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), Ok("unused"));

        let (status, Json(body)) = run_analysis(&state, None, "what is this?").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "No image uploaded");
    }

    #[tokio::test]
    async fn blank_prompt_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), Ok("unused"));

        let (status, Json(body)) = run_analysis(&state, upload("cat.png"), "   \n\t").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Prompt is required");
    }

    #[tokio::test]
    async fn empty_filename_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), Ok("unused"));

        let (status, Json(body)) = run_analysis(&state, upload(""), "what is this?").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "No image selected");
    }

    #[tokio::test]
    async fn disallowed_extension_lists_allowed_types() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), Ok("unused"));

        let (status, Json(body)) = run_analysis(&state, upload("malware.exe"), "run it").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let message = body["error"].as_str().unwrap();
        for ext in ALLOWED_EXTENSIONS {
            assert!(message.contains(ext), "missing {ext} in: {message}");
        }
    }

    #[tokio::test]
    async fn oversized_payload_is_rejected_before_save() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), Ok("unused"));

        let image = Some(UploadPart {
            filename: "big.png".to_string(),
            data: vec![0u8; MAX_CONTENT_LENGTH + 1],
        });
        let (status, Json(body)) = run_analysis(&state, image, "describe").await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(body["error"], OVERSIZE_MESSAGE);
        assert!(dir_is_empty(dir.path()));
    }

    #[tokio::test]
    async fn successful_analysis_returns_result_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), Ok("A tabby cat on a mat."));

        let (status, Json(body)) =
            run_analysis(&state, upload("cat.png"), "what is in this picture?").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"], "A tabby cat on a mat.");
        assert!(dir_is_empty(dir.path()));
    }

    #[tokio::test]
    async fn failed_analysis_returns_generic_error_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), Err(()));

        let (status, Json(body)) =
            run_analysis(&state, upload("cat.png"), "what is in this picture?").await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["error"], "Image analysis failed");
        assert!(dir_is_empty(dir.path()));
    }

    #[tokio::test]
    async fn health_reports_healthy() {
        let Json(body) = health().await;
        assert_eq!(body, json!({ "status": "healthy" }));
    }
}
