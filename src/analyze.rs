//! Gemini image analysis client.
//!
//! Uploads the stored image through the Files API, then runs a single
//! `generateContent` turn seeded with the file and the user prompt.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::storage;

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const MAX_RETRIES: u32 = 3;
const FILE_ACTIVE_POLL_ATTEMPTS: u32 = 15;
const FILE_ACTIVE_POLL_DELAY: Duration = Duration::from_secs(2);

static HTTP_CLIENT: OnceLock<reqwest::Client> = OnceLock::new();

fn get_client() -> &'static reqwest::Client {
    HTTP_CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(2)
            .build()
            .expect("Failed to create HTTP client")
    })
}

#[derive(Debug, thiserror::Error)]
pub enum AnalyzeError {
    #[error("failed to read image file {}: {}", .path.display(), .source)]
    ReadImage {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("API returned status {status}: {detail}")]
    Api { status: StatusCode, detail: String },
    #[error("file upload did not return an upload URL")]
    MissingUploadUrl,
    #[error("file processing failed for {0}")]
    FileProcessing(String),
    #[error("timed out waiting for file processing of {0}")]
    FileProcessingTimeout(String),
    #[error("response contained no text")]
    NoText,
}

impl AnalyzeError {
    fn is_retryable(&self) -> bool {
        match self {
            AnalyzeError::Transport(err) => err.is_timeout() || err.is_connect(),
            AnalyzeError::Api { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            _ => false,
        }
    }
}

/// The analysis backend, injected into the app state so tests can swap in a
/// fake.
#[async_trait]
pub trait ImageAnalyzer: Send + Sync {
    async fn analyze(&self, image_path: &Path, prompt: &str) -> Result<String, AnalyzeError>;
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    temperature: f32,
    top_p: f32,
    top_k: i32,
    max_output_tokens: i32,
    response_mime_type: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest<'a> {
    contents: Vec<Content<'a>>,
    generation_config: &'a GenerationConfig,
}

#[derive(Serialize)]
struct Content<'a> {
    role: &'a str,
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
enum Part<'a> {
    #[serde(rename = "text")]
    Text(&'a str),
    #[serde(rename = "fileData")]
    FileData(FileData<'a>),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FileData<'a> {
    file_uri: &'a str,
    mime_type: &'a str,
}

#[derive(Deserialize)]
struct GenerateContentResponse {
    candidates: Option<Vec<Candidate>>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    parts: Option<Vec<ResponsePart>>,
}

#[derive(Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileInfo {
    name: String,
    uri: String,
    state: Option<String>,
}

#[derive(Deserialize)]
struct FileResponse {
    file: FileInfo,
}

pub struct GeminiAnalyzer {
    api_key: String,
    model: String,
    generation_config: GenerationConfig,
}

impl GeminiAnalyzer {
    pub fn new(config: &Config) -> Self {
        Self {
            api_key: config.api_key.clone(),
            model: config.model_name.clone(),
            generation_config: GenerationConfig {
                temperature: config.temperature,
                top_p: config.top_p,
                top_k: config.top_k,
                max_output_tokens: config.max_output_tokens,
                response_mime_type: "text/plain",
            },
        }
    }

    /// Two-step resumable upload: a start request yields the upload URL,
    /// then a single upload+finalize call carries the bytes.
    async fn upload_file(
        &self,
        display_name: &str,
        mime_type: &str,
        bytes: &[u8],
    ) -> Result<FileInfo, AnalyzeError> {
        let start_response = get_client()
            .post(format!("{}/upload/v1beta/files", GEMINI_BASE_URL))
            .header("x-goog-api-key", &self.api_key)
            .header("X-Goog-Upload-Protocol", "resumable")
            .header("X-Goog-Upload-Command", "start")
            .header("X-Goog-Upload-Header-Content-Length", bytes.len().to_string())
            .header("X-Goog-Upload-Header-Content-Type", mime_type)
            .json(&json!({ "file": { "display_name": display_name } }))
            .send()
            .await?;

        let start_response = check_status(start_response).await?;
        let upload_url = start_response
            .headers()
            .get("x-goog-upload-url")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or(AnalyzeError::MissingUploadUrl)?;

        let finalize_response = get_client()
            .post(upload_url)
            .header("X-Goog-Upload-Command", "upload, finalize")
            .header("X-Goog-Upload-Offset", "0")
            .body(bytes.to_vec())
            .send()
            .await?;

        let finalize_response = check_status(finalize_response).await?;
        Ok(finalize_response.json::<FileResponse>().await?.file)
    }

    async fn get_file_metadata(&self, name: &str) -> Result<FileInfo, AnalyzeError> {
        let name = name.trim().strip_prefix("files/").unwrap_or(name.trim());
        let response = get_client()
            .get(format!("{}/v1beta/files/{}", GEMINI_BASE_URL, name))
            .header("x-goog-api-key", &self.api_key)
            .send()
            .await?;

        let response = check_status(response).await?;
        Ok(response.json::<FileInfo>().await?)
    }

    /// Uploaded files start in PROCESSING; poll until ACTIVE before they can
    /// be referenced from a generation request.
    async fn wait_for_file_active(&self, file: FileInfo) -> Result<FileInfo, AnalyzeError> {
        let name = file.name.clone();
        let mut latest = file;

        for _ in 0..FILE_ACTIVE_POLL_ATTEMPTS {
            match latest.state.as_deref().unwrap_or("PROCESSING") {
                "ACTIVE" => return Ok(latest),
                "FAILED" => return Err(AnalyzeError::FileProcessing(latest.uri)),
                _ => {}
            }
            sleep(FILE_ACTIVE_POLL_DELAY).await;
            latest = self.get_file_metadata(&name).await?;
        }

        Err(AnalyzeError::FileProcessingTimeout(name))
    }

    async fn generate_content(
        &self,
        file_uri: &str,
        mime_type: &str,
        prompt: &str,
    ) -> Result<String, AnalyzeError> {
        let file_part = Part::FileData(FileData {
            file_uri,
            mime_type,
        });
        // Single-turn conversation seeded with the file and the prompt, then
        // the prompt sent again as the message.
        let request = GenerateContentRequest {
            contents: vec![
                Content {
                    role: "user",
                    parts: vec![file_part, Part::Text(prompt)],
                },
                Content {
                    role: "user",
                    parts: vec![Part::Text(prompt)],
                },
            ],
            generation_config: &self.generation_config,
        };

        let response = get_client()
            .post(format!(
                "{}/v1beta/models/{}:generateContent",
                GEMINI_BASE_URL, self.model
            ))
            .header("x-goog-api-key", &self.api_key)
            .timeout(Duration::from_secs(90))
            .json(&request)
            .send()
            .await?;

        let response = check_status(response).await?;
        extract_text(response.json::<GenerateContentResponse>().await?)
    }
}

#[async_trait]
impl ImageAnalyzer for GeminiAnalyzer {
    async fn analyze(&self, image_path: &Path, prompt: &str) -> Result<String, AnalyzeError> {
        let display_name = image_path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "upload".to_string());
        let mime_type = storage::infer_mime_type(&display_name);

        let bytes =
            tokio::fs::read(image_path)
                .await
                .map_err(|source| AnalyzeError::ReadImage {
                    path: image_path.to_path_buf(),
                    source,
                })?;

        let file = self
            .upload_file(&display_name, &mime_type, &bytes)
            .await?;
        let file = self.wait_for_file_active(file).await?;
        info!("uploaded file '{}' as {}", display_name, file.uri);

        with_retry(
            || self.generate_content(&file.uri, &mime_type, prompt),
            MAX_RETRIES,
        )
        .await
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, AnalyzeError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(AnalyzeError::Api {
        status,
        detail: summarize_error_body(&body),
    })
}

/// Pull the human-readable message out of a Gemini error payload, falling
/// back to a truncated raw body.
fn summarize_error_body(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(message) = value
            .get("error")
            .and_then(|error| error.get("message"))
            .and_then(|message| message.as_str())
        {
            return message.to_string();
        }
    }
    body.chars().take(500).collect()
}

fn extract_text(response: GenerateContentResponse) -> Result<String, AnalyzeError> {
    let mut text_parts = Vec::new();
    for candidate in response.candidates.unwrap_or_default() {
        let parts = candidate
            .content
            .and_then(|content| content.parts)
            .unwrap_or_default();
        for part in parts {
            if let Some(text) = part.text {
                if !text.trim().is_empty() {
                    text_parts.push(text);
                }
            }
        }
    }

    if text_parts.is_empty() {
        Err(AnalyzeError::NoText)
    } else {
        Ok(text_parts.join("\n"))
    }
}

async fn with_retry<F, Fut, T>(f: F, max_retries: u32) -> Result<T, AnalyzeError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, AnalyzeError>>,
{
    let base_delays = [1000u64, 2000, 4000];

    for attempt in 0..=max_retries {
        match f().await {
            Ok(result) => return Ok(result),
            Err(err) if err.is_retryable() && attempt < max_retries => {
                let base_delay = base_delays.get(attempt as usize).copied().unwrap_or(4000);
                let jitter = {
                    let mut rng = rand::rng();
                    let jitter_range = (base_delay as f64 * 0.1) as u64;
                    rng.random_range(0..=jitter_range * 2) as i64 - jitter_range as i64
                };
                let delay = (base_delay as i64 + jitter).max(100) as u64;

                debug!(
                    "retry {}/{} after error: {} (waiting {}ms)",
                    attempt + 1,
                    max_retries,
                    err,
                    delay
                );
                sleep(Duration::from_millis(delay)).await;
            }
            Err(err) => {
                warn!("analysis request failed: {}", err);
                return Err(err);
            }
        }
    }

    unreachable!()
}
