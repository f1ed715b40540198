//! HTTP client for the local inference runtime.
//!
//! This crate handles all communication with the Ollama-compatible backend:
//! model listing, residency queries, streaming generation, streaming pulls,
//! deletion, and optional tokenization. Streaming responses are
//! newline-delimited JSON read through a resumable [`LineBuffer`]; the
//! parser never assumes whole objects per network chunk.

use std::sync::OnceLock;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::StatusCode;

mod line;
mod wire;

pub use line::LineBuffer;
pub use wire::{
    GenerateChunk, GenerateOptions, GenerateRequest, PullProgress, ResidentModel, RuntimeModel,
};

use wire::{PsResponse, TagsResponse, TokenizeResponse};

/// Connection timeout for runtime requests.
const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Maximum bytes for error body reads (32 KiB). Prevents memory spikes from
/// large error responses.
const MAX_ERROR_BODY_BYTES: usize = 32 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("runtime request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("runtime returned {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("runtime stream ended before completion")]
    Disconnected,
    #[error("runtime stream exceeded the line buffer limit")]
    BufferOverflow,
}

/// Shared HTTP client for all runtime requests.
///
/// Configured with a connect timeout only: generate and pull streams can
/// run for many minutes, so no read/total timeout is set here. Callers that
/// need a bound wrap the request in `tokio::time::timeout`.
fn http_client() -> &'static reqwest::Client {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("build shared HTTP client")
    })
}

/// Read an HTTP error response body with size limits.
async fn read_capped_error_body(response: reqwest::Response) -> String {
    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let Ok(chunk) = chunk else { break };
        body.extend_from_slice(&chunk);
        if body.len() > MAX_ERROR_BODY_BYTES {
            body.truncate(MAX_ERROR_BODY_BYTES);
            let text = String::from_utf8_lossy(&body);
            return format!("{text}...(truncated)");
        }
    }
    String::from_utf8_lossy(&body).into_owned()
}

/// Estimated token count when the runtime has no tokenize endpoint:
/// `ceil(len / 4)`.
#[must_use]
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

/// Client for one inference runtime instance.
#[derive(Debug, Clone)]
pub struct RuntimeClient {
    base_url: String,
}

impl RuntimeClient {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self { base_url }
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, RuntimeError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = read_capped_error_body(response).await;
        Err(RuntimeError::Status { status, body })
    }

    /// `GET /api/tags`: every model the runtime has on disk.
    pub async fn list_models(&self) -> Result<Vec<RuntimeModel>, RuntimeError> {
        let response = http_client().get(self.url("/api/tags")).send().await?;
        let response = Self::check_status(response).await?;
        let tags: TagsResponse = response.json().await?;
        Ok(tags.models)
    }

    /// `GET /api/ps`: models currently loaded in device memory.
    pub async fn loaded_models(&self) -> Result<Vec<ResidentModel>, RuntimeError> {
        let response = http_client().get(self.url("/api/ps")).send().await?;
        let response = Self::check_status(response).await?;
        let ps: PsResponse = response.json().await?;
        Ok(ps.models)
    }

    /// `POST /api/generate` with `stream: true`.
    ///
    /// Invokes `on_chunk` for every complete JSON line and returns once the
    /// runtime sends its `done` marker. Malformed complete lines are skipped
    /// with a warning; a connection that closes before `done` is an error.
    pub async fn generate(
        &self,
        request: &GenerateRequest,
        mut on_chunk: impl FnMut(GenerateChunk),
    ) -> Result<(), RuntimeError> {
        let response = http_client()
            .post(self.url("/api/generate"))
            .json(request)
            .send()
            .await?;
        let response = Self::check_status(response).await?;

        let mut stream = response.bytes_stream();
        let mut buffer = LineBuffer::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if !buffer.push(&chunk) {
                return Err(RuntimeError::BufferOverflow);
            }

            while let Some(line) = buffer.drain_line() {
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_slice::<GenerateChunk>(&line) {
                    Ok(parsed) => {
                        let done = parsed.is_done();
                        on_chunk(parsed);
                        if done {
                            return Ok(());
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Skipping malformed generate line: {e}");
                    }
                }
            }
        }

        Err(RuntimeError::Disconnected)
    }

    /// `POST /api/pull` with `stream: true`.
    ///
    /// Invokes `on_progress` per status line and returns once a status
    /// containing `success` arrives.
    pub async fn pull(
        &self,
        name: &str,
        mut on_progress: impl FnMut(PullProgress),
    ) -> Result<(), RuntimeError> {
        let response = http_client()
            .post(self.url("/api/pull"))
            .json(&serde_json::json!({ "name": name, "stream": true }))
            .send()
            .await?;
        let response = Self::check_status(response).await?;

        let mut stream = response.bytes_stream();
        let mut buffer = LineBuffer::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if !buffer.push(&chunk) {
                return Err(RuntimeError::BufferOverflow);
            }

            while let Some(line) = buffer.drain_line() {
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_slice::<PullProgress>(&line) {
                    Ok(progress) => {
                        let success = progress.is_success();
                        on_progress(progress);
                        if success {
                            return Ok(());
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Skipping malformed pull line: {e}");
                    }
                }
            }
        }

        Err(RuntimeError::Disconnected)
    }

    /// `DELETE /api/delete`. A 404 (model already gone) is not an error.
    pub async fn delete_model(&self, name: &str) -> Result<(), RuntimeError> {
        let response = http_client()
            .delete(self.url("/api/delete"))
            .json(&serde_json::json!({ "name": name }))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            tracing::debug!(model = name, "Delete returned 404; treating as gone");
            return Ok(());
        }
        Self::check_status(response).await?;
        Ok(())
    }

    /// `POST /api/tokenize`: exact token count when the runtime supports it.
    ///
    /// Returns `None` on 404 so callers can fall back to [`estimate_tokens`].
    pub async fn tokenize(&self, model: &str, text: &str) -> Result<Option<usize>, RuntimeError> {
        let response = http_client()
            .post(self.url("/api/tokenize"))
            .json(&serde_json::json!({ "model": model, "prompt": text }))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::check_status(response).await?;
        let tokens: TokenizeResponse = response.json().await?;
        Ok(Some(tokens.tokens.len()))
    }
}
