//! Wire types for the inference runtime's HTTP API.

use serde::{Deserialize, Serialize};

/// One model known to the runtime (`GET /api/tags`).
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeModel {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub modified_at: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TagsResponse {
    #[serde(default)]
    pub models: Vec<RuntimeModel>,
}

/// One model currently loaded in device memory (`GET /api/ps`).
#[derive(Debug, Clone, Deserialize)]
pub struct ResidentModel {
    pub name: String,
    /// VRAM footprint when the model sits on an accelerator.
    #[serde(default)]
    pub size_vram: Option<u64>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub expires_at: Option<String>,
}

impl ResidentModel {
    /// Resident footprint in MiB, preferring the accelerator figure.
    #[must_use]
    pub fn ram_mb(&self) -> u64 {
        self.size_vram.or(self.size).unwrap_or(0) / (1024 * 1024)
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct PsResponse {
    #[serde(default)]
    pub models: Vec<ResidentModel>,
}

/// Sampling options forwarded to the runtime.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GenerateOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_predict: Option<u32>,
}

/// `POST /api/generate` request body.
#[derive(Debug, Clone, Serialize)]
pub struct GenerateRequest {
    pub model: String,
    pub prompt: String,
    pub stream: bool,
    /// Seconds the runtime keeps the model resident after this request.
    /// Zero requests an immediate unload.
    pub keep_alive: i64,
    pub options: GenerateOptions,
}

/// One newline-delimited object of the generate stream.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenerateChunk {
    #[serde(default)]
    pub response: Option<String>,
    #[serde(default)]
    pub done: Option<bool>,
    #[serde(default)]
    pub model: Option<String>,
}

impl GenerateChunk {
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done == Some(true)
    }
}

/// One progress object of the pull stream (`POST /api/pull`).
#[derive(Debug, Clone, Deserialize)]
pub struct PullProgress {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub completed: Option<u64>,
}

impl PullProgress {
    /// The terminal pull status line contains "success".
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.contains("success")
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct TokenizeResponse {
    #[serde(default)]
    pub tokens: Vec<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tags_response() {
        let raw = r#"{"models":[{"name":"qwen3:4b","size":2620000000,"modified_at":"2026-01-12T08:00:00Z"}]}"#;
        let tags: TagsResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(tags.models.len(), 1);
        assert_eq!(tags.models[0].name, "qwen3:4b");
    }

    #[test]
    fn parses_ps_with_vram_or_size() {
        let raw = r#"{"models":[{"name":"qwen3:4b","size_vram":3221225472,"expires_at":"2026-01-12T08:05:00Z"}]}"#;
        let ps: PsResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(ps.models[0].ram_mb(), 3072);

        let raw = r#"{"models":[{"name":"qwen3:4b","size":1073741824}]}"#;
        let ps: PsResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(ps.models[0].ram_mb(), 1024);
    }

    #[test]
    fn generate_request_serializes_snake_case() {
        let req = GenerateRequest {
            model: "qwen3:4b".to_string(),
            prompt: "hi".to_string(),
            stream: true,
            keep_alive: 300,
            options: GenerateOptions {
                temperature: Some(0.7),
                num_predict: Some(8),
            },
        };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["keep_alive"], 300);
        assert_eq!(value["options"]["num_predict"], 8);
        assert_eq!(value["options"]["temperature"], 0.7);
    }

    #[test]
    fn chunk_tolerates_unknown_fields() {
        let chunk: GenerateChunk = serde_json::from_str(
            r#"{"model":"qwen3:4b","response":"he","done":false,"created_at":"now"}"#,
        )
        .unwrap();
        assert_eq!(chunk.response.as_deref(), Some("he"));
        assert!(!chunk.is_done());
    }

    #[test]
    fn pull_success_detection() {
        let progress: PullProgress =
            serde_json::from_str(r#"{"status":"success"}"#).unwrap();
        assert!(progress.is_success());
        let progress: PullProgress =
            serde_json::from_str(r#"{"status":"pulling manifest"}"#).unwrap();
        assert!(!progress.is_success());
    }
}
