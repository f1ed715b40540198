//! Per-job subscription bus.
//!
//! Each live job owns a topic holding its subscribers and a running
//! accumulator of everything published so far. The accumulator is what makes
//! late joins exact: persistence lags the live stream by up to one flush
//! interval, so a subscriber that attaches mid-stream gets its pre-roll from
//! here, under the same lock that orders it against the live tail.
//!
//! Callbacks run inline on the publisher's execution context and must not
//! block; a panicking subscriber is dropped without disturbing the others.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use relay_types::{JobEvent, JobId, JobStatus};

type Callback = Box<dyn Fn(&JobEvent) + Send + Sync + 'static>;

struct Subscriber {
    id: u64,
    callback: Callback,
}

#[derive(Default)]
struct Accumulator {
    streaming: bool,
    model: String,
    content: String,
    thinking: String,
    thinking_open: bool,
    sources: Option<serde_json::Value>,
}

impl Accumulator {
    fn apply(&mut self, event: &JobEvent) {
        match event {
            JobEvent::Status { status, model, .. } => {
                self.streaming = *status == JobStatus::Streaming;
                self.model = model.clone();
            }
            JobEvent::Sources { sources } => self.sources = Some(sources.clone()),
            JobEvent::Response { token } => self.content.push_str(token),
            JobEvent::Thinking { token } => {
                self.thinking.push_str(token);
                self.thinking_open = true;
            }
            JobEvent::ThinkingEnd => self.thinking_open = false,
            JobEvent::Done { .. } | JobEvent::Failed { .. } | JobEvent::Cancelled => {}
        }
    }

    /// Replay accumulated state to one callback as synthetic events.
    fn preroll(&self, callback: &Callback) {
        if self.streaming {
            deliver(
                callback,
                &JobEvent::Status {
                    status: JobStatus::Streaming,
                    queue_position: 0,
                    model: self.model.clone(),
                },
            );
        }
        if let Some(sources) = &self.sources {
            deliver(
                callback,
                &JobEvent::Sources {
                    sources: sources.clone(),
                },
            );
        }
        if !self.thinking.is_empty() {
            deliver(
                callback,
                &JobEvent::Thinking {
                    token: self.thinking.clone(),
                },
            );
            if !self.thinking_open {
                deliver(callback, &JobEvent::ThinkingEnd);
            }
        }
        if !self.content.is_empty() {
            deliver(
                callback,
                &JobEvent::Response {
                    token: self.content.clone(),
                },
            );
        }
    }
}

fn deliver(callback: &Callback, event: &JobEvent) -> bool {
    catch_unwind(AssertUnwindSafe(|| callback(event))).is_ok()
}

struct Topic {
    accumulator: Accumulator,
    subscribers: Vec<Subscriber>,
}

struct BusInner {
    topics: Mutex<HashMap<JobId, Topic>>,
    next_subscriber: AtomicU64,
}

impl BusInner {
    fn topics(&self) -> MutexGuard<'_, HashMap<JobId, Topic>> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Fan-out hub, one topic per live job.
#[derive(Clone)]
pub struct SubscriptionBus {
    inner: Arc<BusInner>,
}

impl Default for SubscriptionBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionBus {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                topics: Mutex::new(HashMap::new()),
                next_subscriber: AtomicU64::new(1),
            }),
        }
    }

    /// Create the topic for a freshly enqueued job. Idempotent.
    pub fn open_topic(&self, job_id: JobId, model: &str) {
        let mut topics = self.inner.topics();
        topics.entry(job_id).or_insert_with(|| Topic {
            accumulator: Accumulator {
                model: model.to_string(),
                ..Accumulator::default()
            },
            subscribers: Vec::new(),
        });
    }

    /// Attach a subscriber, replaying accumulated state first.
    ///
    /// Returns `None` when no topic exists (job unknown or already
    /// terminal); the caller decides whether to replay from the store.
    pub fn subscribe(
        &self,
        job_id: JobId,
        callback: impl Fn(&JobEvent) + Send + Sync + 'static,
    ) -> Option<Subscription> {
        let callback: Callback = Box::new(callback);
        let mut topics = self.inner.topics();
        let topic = topics.get_mut(&job_id)?;

        // Pre-roll and registration happen under one lock so no live event
        // can slip between them.
        topic.accumulator.preroll(&callback);

        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        topic.subscribers.push(Subscriber { id, callback });
        Some(Subscription {
            bus: Some(Arc::clone(&self.inner)),
            job_id,
            subscriber_id: id,
        })
    }

    /// Publish one event to a job's subscribers, in subscribe order.
    ///
    /// A terminal event tears the topic down after delivery; subscribers
    /// that panic are dropped.
    pub fn publish(&self, job_id: JobId, event: &JobEvent) {
        let mut topics = self.inner.topics();
        let Some(topic) = topics.get_mut(&job_id) else {
            return;
        };

        topic.accumulator.apply(event);
        topic.subscribers.retain(|subscriber| {
            let ok = deliver(&subscriber.callback, event);
            if !ok {
                tracing::warn!(job = %job_id, "Dropping panicked subscriber");
            }
            ok
        });

        if event.is_terminal() {
            topics.remove(&job_id);
        }
    }

    /// Drop a topic without a terminal event (cleanup paths only).
    pub fn close_topic(&self, job_id: JobId) {
        self.inner.topics().remove(&job_id);
    }

    /// Number of live subscribers across all topics (for status surfaces).
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .topics()
            .values()
            .map(|topic| topic.subscribers.len())
            .sum()
    }
}

/// Handle to one subscription. Dropping it (or calling
/// [`Subscription::unsubscribe`]) detaches the callback.
pub struct Subscription {
    bus: Option<Arc<BusInner>>,
    job_id: JobId,
    subscriber_id: u64,
}

impl Subscription {
    /// A subscription with no live topic behind it (terminal-job replay).
    #[must_use]
    pub(crate) fn detached(job_id: JobId) -> Self {
        Self {
            bus: None,
            job_id,
            subscriber_id: 0,
        }
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.take()
            && let Some(topic) = bus.topics().get_mut(&self.job_id)
        {
            topic
                .subscribers
                .retain(|subscriber| subscriber.id != self.subscriber_id);
        }
    }
}
