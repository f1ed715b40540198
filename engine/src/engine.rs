//! The top-level runtime object.
//!
//! [`Engine`] owns every long-lived component (store handle, runtime
//! client, subscription bus, residency manager) and exposes the producer
//! API: enqueue, subscribe, cancel, prioritize, queue status, and the
//! catalog operations in `catalog.rs`. Background loops (dispatch,
//! supervisor, reaper) are spawned by [`Engine::start`] and stopped through
//! a shutdown signal; nothing lives in ambient globals.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::AbortHandle;
use tokio::sync::{Notify, watch};

use relay_config::RelayConfig;
use relay_runtime::{RuntimeClient, RuntimeError};
use relay_store::{Store, StoreError, now_ms};
use relay_types::{
    EnqueueOptions, EnqueueReceipt, Job, JobEvent, JobId, JobKind, JobPayload, JobStatus,
    LoadedModel, QueueSnapshot,
};

use crate::bus::{Subscription, SubscriptionBus};
use crate::residency::{ResidencyManager, ResidencySettings};
use crate::{dispatch, reaper, supervisor};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error("model '{0}' is not in the catalog")]
    UnknownModel(String),
    #[error("download of '{0}' timed out")]
    DownloadTimeout(String),
    #[error("job {0} not found")]
    UnknownJob(JobId),
}

/// Errors a producer can get back synchronously from `enqueue`.
#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("no default model is configured or installed")]
    NoDefaultModel,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Aggregate health snapshot for external status surfaces.
#[derive(Debug)]
pub struct EngineStatus {
    pub runtime_ready: bool,
    pub resident_model: Option<LoadedModel>,
    pub processing: bool,
    pub pending: usize,
    pub subscribers: usize,
}

/// The in-flight stream, if any. Cancellation flips the flag and aborts the
/// upstream task; the dispatcher observes the closed channel and settles.
pub(crate) struct ActiveStream {
    pub(crate) job_id: JobId,
    pub(crate) abort: AbortHandle,
    pub(crate) cancelled: Arc<std::sync::atomic::AtomicBool>,
}

pub(crate) struct Inner {
    pub(crate) config: RelayConfig,
    pub(crate) store: Arc<Store>,
    pub(crate) client: RuntimeClient,
    pub(crate) bus: SubscriptionBus,
    pub(crate) residency: ResidencyManager,
    /// Re-arms the dispatch loop: enqueue, terminal transitions, readiness.
    pub(crate) wake: Notify,
    pub(crate) active: Mutex<Option<ActiveStream>>,
    pub(crate) ready: watch::Sender<bool>,
    pub(crate) shutdown: watch::Sender<bool>,
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to the running control plane. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    pub(crate) inner: Arc<Inner>,
}

impl Engine {
    /// Build the component graph and spawn the background loops.
    ///
    /// Must run inside a tokio runtime. Jobs left `streaming` by a previous
    /// process are failed before anything else happens.
    pub fn start(config: RelayConfig, store: Arc<Store>) -> Self {
        let client = RuntimeClient::new(config.runtime_url.clone());
        let residency = ResidencyManager::new(
            Arc::clone(&store),
            client.clone(),
            ResidencySettings {
                cooldown: config.switch_cooldown(),
                keep_alive_secs: config.default_keep_alive_secs as i64,
                activation_timeout: config.activation_timeout(),
                unload_timeout: config.unload_timeout(),
            },
        );
        let (ready, _) = watch::channel(false);
        let (shutdown, _) = watch::channel(false);

        match store.reset_orphaned_streaming(reaper::STREAM_TIMEOUT_MESSAGE) {
            Ok(orphans) if !orphans.is_empty() => {
                tracing::warn!(count = orphans.len(), "Failed orphaned streaming jobs at boot");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Orphan reset failed: {e}"),
        }

        let inner = Arc::new(Inner {
            config,
            store,
            client,
            bus: SubscriptionBus::new(),
            residency,
            wake: Notify::new(),
            active: Mutex::new(None),
            ready,
            shutdown,
        });

        // Pending jobs that survived a restart need their topics back so
        // every non-terminal job always has one.
        match inner.store.active_jobs() {
            Ok(jobs) => {
                for job in jobs {
                    inner.bus.open_topic(job.id, &job.requested_model);
                }
            }
            Err(e) => tracing::warn!("Failed to restore job topics: {e}"),
        }

        tokio::spawn(supervisor::run(Arc::clone(&inner)));
        tokio::spawn(reaper::run(Arc::clone(&inner)));
        tokio::spawn(dispatch::run(Arc::clone(&inner)));

        Self { inner }
    }

    /// Queue a new inference request.
    ///
    /// Resolves the model (explicit wins, otherwise the default chain),
    /// persists the job with its placeholder message, opens its event topic
    /// and wakes the dispatcher.
    pub fn enqueue(
        &self,
        conversation_id: &str,
        kind: JobKind,
        payload: JobPayload,
        opts: EnqueueOptions,
    ) -> Result<EnqueueReceipt, EnqueueError> {
        let resolved = match opts.model.clone() {
            Some(model) => model,
            None => self
                .default_model()?
                .ok_or(EnqueueError::NoDefaultModel)?,
        };

        let receipt = self.inner.store.enqueue(
            conversation_id,
            kind,
            &payload,
            &resolved,
            &opts,
            self.inner.config.default_max_wait_secs,
        )?;

        self.inner.bus.open_topic(receipt.job_id, &resolved);
        self.inner.wake.notify_one();
        tracing::info!(
            job = %receipt.job_id,
            conversation = conversation_id,
            model = %resolved,
            position = receipt.queue_position,
            "Job enqueued"
        );
        Ok(receipt)
    }

    /// Attach a subscriber to a job's event stream.
    ///
    /// Live jobs replay accumulated content first (tab-switch resilience);
    /// already-terminal jobs replay from the store and deliver their
    /// terminal event immediately.
    pub fn subscribe(
        &self,
        job_id: JobId,
        callback: impl Fn(&JobEvent) + Send + Sync + 'static,
    ) -> Result<Subscription, EngineError> {
        let Some(job) = self.inner.store.job(job_id)? else {
            return Err(EngineError::UnknownJob(job_id));
        };

        if job.status.is_terminal() {
            replay_terminal(&job, &callback);
            return Ok(Subscription::detached(job_id));
        }

        // Every non-terminal job has a topic (opened at enqueue, restored at
        // boot). A miss here means the job reached a terminal state between
        // the status read and now; replay the final picture instead.
        let callback = Arc::new(callback);
        let live = {
            let callback = Arc::clone(&callback);
            self.inner
                .bus
                .subscribe(job_id, move |event| callback(event))
        };
        if let Some(subscription) = live {
            return Ok(subscription);
        }

        let Some(job) = self.inner.store.job(job_id)? else {
            return Err(EngineError::UnknownJob(job_id));
        };
        replay_terminal(&job, callback.as_ref());
        Ok(Subscription::detached(job_id))
    }

    /// Cancel a job. Idempotent; returns whether anything was cancelled.
    pub fn cancel(&self, job_id: JobId) -> Result<bool, EngineError> {
        {
            let active = lock(&self.inner.active);
            if let Some(active) = active.as_ref()
                && active.job_id == job_id
            {
                active.cancelled.store(true, Ordering::SeqCst);
                active.abort.abort();
                tracing::info!(job = %job_id, "Cancelling streaming job");
                return Ok(true);
            }
        }

        match self.inner.store.cancel(job_id)? {
            Some(_) => {
                tracing::info!(job = %job_id, "Cancelled pending job");
                self.inner.bus.publish(job_id, &JobEvent::Cancelled);
                self.inner.wake.notify_one();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Bump a pending job to priority 1; returns its new queue position.
    pub fn prioritize(&self, job_id: JobId) -> Result<Option<i64>, EngineError> {
        let position = self.inner.store.prioritize(job_id)?;
        if position.is_some() {
            self.inner.wake.notify_one();
        }
        Ok(position)
    }

    pub fn queue_status(&self) -> Result<QueueSnapshot, EngineError> {
        Ok(self.inner.store.queue_snapshot()?)
    }

    pub fn job(&self, job_id: JobId) -> Result<Option<Job>, EngineError> {
        Ok(self.inner.store.job(job_id)?)
    }

    pub fn active_jobs_for_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<Job>, EngineError> {
        Ok(self
            .inner
            .store
            .active_jobs_for_conversation(conversation_id)?)
    }

    /// Aggregate health for external status endpoints.
    pub async fn status(&self) -> EngineStatus {
        let resident_model = self.inner.residency.loaded_model().await.ok().flatten();
        let snapshot = self.inner.store.queue_snapshot().unwrap_or_default();
        EngineStatus {
            runtime_ready: *self.inner.ready.borrow(),
            resident_model,
            processing: snapshot.processing.is_some(),
            pending: snapshot.pending.len(),
            subscribers: self.inner.bus.subscriber_count(),
        }
    }

    /// Stop intake and loops; an in-flight stream is cancelled.
    pub fn shutdown(&self) {
        tracing::info!("Engine shutting down");
        let _ = self.inner.shutdown.send(true);
        if let Some(active) = lock(&self.inner.active).as_ref() {
            active.cancelled.store(true, Ordering::SeqCst);
            active.abort.abort();
        }
        self.inner.wake.notify_one();
    }
}

/// Replay a terminal job's final state to a fresh subscriber.
fn replay_terminal(job: &Job, callback: &impl Fn(&JobEvent)) {
    if let Some(sources) = &job.sources {
        callback(&JobEvent::Sources {
            sources: sources.clone(),
        });
    }
    if !job.thinking.is_empty() {
        callback(&JobEvent::Thinking {
            token: job.thinking.clone(),
        });
        callback(&JobEvent::ThinkingEnd);
    }
    if !job.content.is_empty() {
        callback(&JobEvent::Response {
            token: job.content.clone(),
        });
    }
    let terminal = match job.status {
        JobStatus::Completed => JobEvent::Done {
            model: job.requested_model.clone(),
            job_id: job.id,
            timestamp: job.completed_at.unwrap_or_else(now_ms),
        },
        JobStatus::Cancelled => JobEvent::Cancelled,
        _ => JobEvent::Failed {
            error: job
                .error_message
                .clone()
                .unwrap_or_else(|| "Job failed".to_string()),
        },
    };
    callback(&terminal);
}
