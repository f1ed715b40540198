//! Subscriber event shapes.
//!
//! These are the exact JSON payloads pushed to per-job subscribers. The
//! terminal shapes intentionally differ from the `type`-tagged streaming
//! shapes (`{"done": true, ...}` with no `type` key for success and error),
//! so `Serialize` is written by hand instead of derived.

use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::ids::JobId;
use crate::job::JobStatus;

/// One event on a job's subscription topic.
///
/// Per-job delivery order is `Status`, then an optional `Sources`, then any
/// number of `Response`/`Thinking`/`ThinkingEnd`, then exactly one terminal
/// event (`Done`, `Failed` or `Cancelled`).
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Status {
        status: JobStatus,
        queue_position: i64,
        model: String,
    },
    Sources {
        sources: serde_json::Value,
    },
    Response {
        token: String,
    },
    Thinking {
        token: String,
    },
    ThinkingEnd,
    Done {
        model: String,
        job_id: JobId,
        /// Epoch milliseconds.
        timestamp: i64,
    },
    Failed {
        error: String,
    },
    Cancelled,
}

impl JobEvent {
    /// Terminal events end the subscription; the topic is dropped after
    /// delivering one.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobEvent::Done { .. } | JobEvent::Failed { .. } | JobEvent::Cancelled
        )
    }
}

impl Serialize for JobEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            JobEvent::Status {
                status,
                queue_position,
                model,
            } => {
                let mut map = serializer.serialize_map(Some(4))?;
                map.serialize_entry("type", "status")?;
                map.serialize_entry("status", status.as_str())?;
                map.serialize_entry("queuePosition", queue_position)?;
                map.serialize_entry("model", model)?;
                map.end()
            }
            JobEvent::Sources { sources } => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("type", "sources")?;
                map.serialize_entry("sources", sources)?;
                map.end()
            }
            JobEvent::Response { token } => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("type", "response")?;
                map.serialize_entry("token", token)?;
                map.end()
            }
            JobEvent::Thinking { token } => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("type", "thinking")?;
                map.serialize_entry("token", token)?;
                map.end()
            }
            JobEvent::ThinkingEnd => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("type", "thinking_end")?;
                map.end()
            }
            JobEvent::Done {
                model,
                job_id,
                timestamp,
            } => {
                let mut map = serializer.serialize_map(Some(4))?;
                map.serialize_entry("done", &true)?;
                map.serialize_entry("model", model)?;
                map.serialize_entry("jobId", job_id)?;
                map.serialize_entry("timestamp", timestamp)?;
                map.end()
            }
            JobEvent::Failed { error } => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("error", error)?;
                map.serialize_entry("done", &true)?;
                map.end()
            }
            JobEvent::Cancelled => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("type", "cancelled")?;
                map.serialize_entry("done", &true)?;
                map.end()
            }
        }
    }
}
