//! Batched persistence of streaming deltas.
//!
//! Tokens are not written to the store one by one. The batcher accumulates
//! content and thinking deltas and flushes when enough time has passed or
//! enough characters are buffered; state transitions force a flush. A failed
//! flush keeps the buffer so the next tick retries. Data is only dropped
//! once the job has left the `streaming` state and the store refuses it.

use std::time::{Duration, Instant};

use relay_store::Store;
use relay_types::JobId;

#[derive(Debug)]
pub struct DeltaBatcher {
    content: String,
    thinking: String,
    sources: Option<serde_json::Value>,
    last_flush: Instant,
    max_interval: Duration,
    max_chars: usize,
}

impl DeltaBatcher {
    #[must_use]
    pub fn new(max_interval: Duration, max_chars: usize) -> Self {
        Self {
            content: String::new(),
            thinking: String::new(),
            sources: None,
            last_flush: Instant::now(),
            max_interval,
            max_chars,
        }
    }

    pub fn push_content(&mut self, delta: &str) {
        self.content.push_str(delta);
    }

    pub fn push_thinking(&mut self, delta: &str) {
        self.thinking.push_str(delta);
    }

    /// Stage sources for the next flush. First value wins; the store also
    /// enforces set-once.
    pub fn set_sources(&mut self, sources: serde_json::Value) {
        if self.sources.is_none() {
            self.sources = Some(sources);
        }
    }

    fn buffered_chars(&self) -> usize {
        self.content.len() + self.thinking.len()
    }

    fn is_empty(&self) -> bool {
        self.content.is_empty() && self.thinking.is_empty() && self.sources.is_none()
    }

    /// Whether a size- or time-based flush is due.
    #[must_use]
    pub fn should_flush(&self) -> bool {
        !self.is_empty()
            && (self.buffered_chars() >= self.max_chars
                || self.last_flush.elapsed() >= self.max_interval)
    }

    /// Write buffered deltas to the store.
    ///
    /// On success the buffer clears. On a store error the buffer is kept for
    /// the next tick and `false` is returned. An append refused because the
    /// job already reached a terminal state clears the buffer too; the
    /// store is the authority on frozen content.
    pub fn flush(&mut self, store: &Store, job_id: JobId) -> bool {
        self.last_flush = Instant::now();
        if self.is_empty() {
            return true;
        }
        match store.append_content(
            job_id,
            &self.content,
            &self.thinking,
            self.sources.as_ref(),
        ) {
            Ok(applied) => {
                if !applied {
                    tracing::debug!(job = %job_id, "Dropping late flush for finished job");
                }
                self.content.clear();
                self.thinking.clear();
                self.sources = None;
                true
            }
            Err(e) => {
                tracing::warn!(job = %job_id, "Flush failed, keeping buffer: {e}");
                false
            }
        }
    }
}
