//! Job lifecycle types: kind, status, request payload, queue snapshots.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::{JobId, MessageId};

/// Parse error for the small string-backed enums persisted in the store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {kind} value '{raw}'")]
pub struct InvalidValue {
    kind: &'static str,
    raw: String,
}

impl InvalidValue {
    #[must_use]
    pub fn new(kind: &'static str, raw: impl Into<String>) -> Self {
        Self {
            kind,
            raw: raw.into(),
        }
    }

    #[must_use]
    pub fn raw(&self) -> &str {
        &self.raw
    }
}

/// What kind of inference request a job carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Chat,
    Rag,
}

impl JobKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            JobKind::Chat => "chat",
            JobKind::Rag => "rag",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, InvalidValue> {
        match raw {
            "chat" => Ok(JobKind::Chat),
            "rag" => Ok(JobKind::Rag),
            other => Err(InvalidValue::new("job kind", other)),
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job lifecycle status.
///
/// `Completed`, `Error` and `Cancelled` are terminal: a job never leaves a
/// terminal status, and its content is frozen on entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Streaming,
    Completed,
    Error,
    Cancelled,
}

impl JobStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Streaming => "streaming",
            JobStatus::Completed => "completed",
            JobStatus::Error => "error",
            JobStatus::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Error | JobStatus::Cancelled
        )
    }

    pub fn parse(raw: &str) -> Result<Self, InvalidValue> {
        match raw {
            "pending" => Ok(JobStatus::Pending),
            "streaming" => Ok(JobStatus::Streaming),
            "completed" => Ok(JobStatus::Completed),
            "error" => Ok(JobStatus::Error),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(InvalidValue::new("job status", other)),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    #[must_use]
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// The request body a producer hands to `enqueue`.
///
/// Opaque to the queue itself; the dispatcher interprets it when the job is
/// started. Field names follow the producer-facing JSON convention.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobPayload {
    /// Conversation transcript (chat jobs).
    pub messages: Vec<ChatMessage>,
    /// System prompt (rag jobs; optional for chat).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    /// Retrieved context block (rag jobs).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// The user query (rag jobs).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    /// Retrieval sources, forwarded once to subscribers before any response
    /// token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sources: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_predict: Option<u32>,
    /// When false, `<think>` blocks are stripped and `/no_think` is prefixed
    /// to the prompt.
    pub thinking_enabled: bool,
}

/// Per-enqueue options beyond the payload.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Explicit model (catalog id). `None` resolves to the default model.
    pub model: Option<String>,
    /// Higher runs earlier. Producers normally pass 0.
    pub priority: i64,
    /// Ordered alternates tried when the requested model fails to activate.
    pub model_sequence: Vec<String>,
    /// Queue-wait bound influencing smart batching. `None` takes the
    /// configured default.
    pub max_wait_secs: Option<u64>,
}

/// What `enqueue` returns to the producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueReceipt {
    pub job_id: JobId,
    /// Placeholder assistant message created alongside the job so UIs can
    /// render immediately.
    pub message_id: MessageId,
    pub queue_position: i64,
    pub resolved_model: String,
}

/// A fully hydrated job row.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub conversation_id: String,
    pub kind: JobKind,
    pub status: JobStatus,
    pub priority: i64,
    pub queue_position: i64,
    pub requested_model: String,
    pub model_sequence: Vec<String>,
    pub max_wait_secs: u64,
    pub payload: JobPayload,
    pub content: String,
    pub thinking: String,
    pub sources: Option<serde_json::Value>,
    /// Epoch milliseconds.
    pub queued_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub last_update_at: i64,
    pub error_message: Option<String>,
    pub message_id: MessageId,
}

impl Job {
    /// Milliseconds this job may sit pending before smart batching must
    /// promote it.
    #[must_use]
    pub fn max_wait_ms(&self) -> i64 {
        (self.max_wait_secs as i64).saturating_mul(1000)
    }
}

/// The currently streaming job, as reported by `queue_status`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingSnapshot {
    pub job_id: JobId,
    pub conversation_id: String,
    pub model: String,
    pub started_at: i64,
}

/// One pending queue entry, as reported by `queue_status`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingSnapshot {
    pub job_id: JobId,
    pub conversation_id: String,
    pub model: String,
    pub priority: i64,
    pub queue_position: i64,
    pub queued_at: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueSnapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing: Option<ProcessingSnapshot>,
    pub pending: Vec<PendingSnapshot>,
}
