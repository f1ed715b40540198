//! Single-slot model residency.
//!
//! Exactly one model may be resident in device memory. Activations are
//! serialised behind an async mutex and separated by a cooldown; duplicate
//! requests for the already-resident model are a no-op. The manager also
//! owns the smart-batching pick policy, because "which job runs next" is a
//! residency question: switching models on constrained hardware costs tens
//! of seconds.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::time::timeout;

use relay_runtime::{GenerateOptions, GenerateRequest, RuntimeClient, RuntimeError};
use relay_store::{Store, StoreError, now_ms};
use relay_types::{Job, JobId, LoadedModel, SwitchReason};

#[derive(Debug, thiserror::Error)]
pub enum ResidencyError {
    #[error("model '{model}' is not available on the runtime")]
    NotInstalled { model: String },
    #[error("activation of '{model}' timed out after {secs}s")]
    Timeout { model: String, secs: u64 },
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// How an activation request resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    AlreadyLoaded,
    Switched { duration_ms: u64 },
}

/// The job the dispatcher should run next, per the batching policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPick {
    pub job_id: JobId,
    /// Catalog id of the model the job needs.
    pub model: String,
    pub should_switch: bool,
    pub reason: Option<SwitchReason>,
}

#[derive(Debug, Clone)]
struct ResidentSlot {
    external_name: String,
    loaded_at: Instant,
}

#[derive(Debug, Default)]
struct UsageEntry {
    last_used: Option<Instant>,
    active_requests: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct ResidencySettings {
    pub cooldown: Duration,
    pub keep_alive_secs: i64,
    pub activation_timeout: Duration,
    pub unload_timeout: Duration,
}

pub struct ResidencyManager {
    store: Arc<Store>,
    client: RuntimeClient,
    settings: ResidencySettings,
    /// Held for the whole of an activation; waiting here is how concurrent
    /// activations serialise.
    switching: tokio::sync::Mutex<()>,
    slot: Mutex<Option<ResidentSlot>>,
    last_switch: Mutex<Option<Instant>>,
    usage: Mutex<HashMap<String, UsageEntry>>,
    active: Mutex<HashMap<JobId, ActiveRequest>>,
}

#[derive(Debug, Clone)]
struct ActiveRequest {
    model: String,
    started: Instant,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ResidencyManager {
    pub fn new(store: Arc<Store>, client: RuntimeClient, settings: ResidencySettings) -> Self {
        Self {
            store,
            client,
            settings,
            switching: tokio::sync::Mutex::new(()),
            slot: Mutex::new(None),
            last_switch: Mutex::new(None),
            usage: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Make `model_id` the resident model.
    ///
    /// Serialises against other activations, waits out the cooldown,
    /// validates presence upstream, unloads the current resident
    /// (best-effort), then issues a minimal generate to force the load.
    /// `triggered_by` and `reason` go to the switch audit trail.
    pub async fn activate(
        &self,
        model_id: &str,
        triggered_by: &str,
        reason: &str,
    ) -> Result<Activation, ResidencyError> {
        let _guard = self.switching.lock().await;

        // Cooldown floor between switches.
        let last_switch = *lock(&self.last_switch);
        let wait = last_switch
            .map(|at| self.settings.cooldown.saturating_sub(at.elapsed()))
            .unwrap_or(Duration::ZERO);
        if !wait.is_zero() {
            tracing::debug!(model = model_id, ?wait, "Waiting out switch cooldown");
            tokio::time::sleep(wait).await;
        }

        let external = self.store.external_name(model_id)?;

        // Validate presence upstream before touching the resident slot.
        let known = self.client.list_models().await?;
        if !known.iter().any(|m| m.name == external) {
            let message = format!("Model '{external}' is not available on the runtime");
            if let Err(e) = self.store.mark_install_error(model_id, &message) {
                tracing::warn!(model = model_id, "Failed to record install error: {e}");
            }
            return Err(ResidencyError::NotInstalled {
                model: model_id.to_string(),
            });
        }

        // The slot state is the residency authority; the runtime is only
        // re-queried by loaded_model() and the supervisor's sync.
        if self.resident_external().as_deref() == Some(external.as_str()) {
            self.note_usage(model_id);
            tracing::debug!(model = model_id, "Already resident");
            return Ok(Activation::AlreadyLoaded);
        }

        // Evict the current resident. Failure is logged, not fatal: the
        // runtime will evict on its own once the new load needs the memory.
        let from_name = self.resident_external();
        if let Some(name) = &from_name {
            self.unload_external(name).await;
        }

        let start = Instant::now();
        let request = Self::minimal_generate(&external, self.settings.keep_alive_secs);
        match timeout(
            self.settings.activation_timeout,
            self.client.generate(&request, |_| {}),
        )
        .await
        {
            Err(_) => Err(ResidencyError::Timeout {
                model: model_id.to_string(),
                secs: self.settings.activation_timeout.as_secs(),
            }),
            Ok(Err(e)) => Err(ResidencyError::Runtime(e)),
            Ok(Ok(())) => {
                let duration_ms = start.elapsed().as_millis() as u64;
                if let Err(e) = self.store.record_model_switch(
                    from_name.as_deref(),
                    model_id,
                    duration_ms,
                    triggered_by,
                    reason,
                ) {
                    tracing::warn!("Failed to record model switch: {e}");
                }
                *lock(&self.last_switch) = Some(Instant::now());
                self.note_resident(Some(external));
                self.note_usage(model_id);
                tracing::info!(
                    model = model_id,
                    duration_ms,
                    triggered_by,
                    reason,
                    "Model activated"
                );
                Ok(Activation::Switched { duration_ms })
            }
        }
    }

    /// No-op when `model_id` is already resident, otherwise activate it.
    pub async fn ensure_loaded(
        &self,
        model_id: &str,
        triggered_by: &str,
        reason: &str,
    ) -> Result<Activation, ResidencyError> {
        let external = self.store.external_name(model_id)?;
        if self.resident_external().as_deref() == Some(external.as_str()) {
            return Ok(Activation::AlreadyLoaded);
        }
        self.activate(model_id, triggered_by, reason).await
    }

    /// Ask the runtime to drop a model (`keep_alive: 0`). Best-effort: every
    /// failure is logged and swallowed.
    pub async fn unload_external(&self, external_name: &str) {
        let request = Self::minimal_generate(external_name, 0);
        match timeout(
            self.settings.unload_timeout,
            self.client.generate(&request, |_| {}),
        )
        .await
        {
            Err(_) => tracing::warn!(model = external_name, "Unload call timed out"),
            Ok(Err(e)) => tracing::warn!(model = external_name, "Unload call failed: {e}"),
            Ok(Ok(())) => tracing::info!(model = external_name, "Model unloaded"),
        }
        let mut slot = lock(&self.slot);
        if slot.as_ref().is_some_and(|s| s.external_name == external_name) {
            *slot = None;
        }
    }

    /// Unload a model by catalog id.
    pub async fn unload(&self, model_id: &str) -> Result<(), ResidencyError> {
        let external = self.store.external_name(model_id)?;
        self.unload_external(&external).await;
        Ok(())
    }

    /// What the runtime reports as resident right now.
    pub async fn loaded_model(&self) -> Result<Option<LoadedModel>, ResidencyError> {
        let resident = self.client.loaded_models().await?;
        let loaded = resident.into_iter().next().map(|m| LoadedModel {
            ram_mb: m.ram_mb(),
            expires_at: m.expires_at.clone(),
            external_name: m.name,
        });
        self.note_resident(loaded.as_ref().map(|m| m.external_name.clone()));
        Ok(loaded)
    }

    /// Check a model exists upstream, by external name.
    pub async fn validate_availability(&self, model_id: &str) -> Result<bool, ResidencyError> {
        let external = self.store.external_name(model_id)?;
        let known = self.client.list_models().await?;
        Ok(known.iter().any(|m| m.name == external))
    }

    fn minimal_generate(external_name: &str, keep_alive: i64) -> GenerateRequest {
        GenerateRequest {
            model: external_name.to_string(),
            prompt: String::new(),
            stream: true,
            keep_alive,
            options: GenerateOptions {
                temperature: None,
                num_predict: Some(1),
            },
        }
    }

    // ------------------------------------------------------------------
    // Batching policy
    // ------------------------------------------------------------------

    /// Choose the next pending job.
    ///
    /// Order of rules:
    /// 1. A job past its `max_wait` bound is promoted unconditionally.
    /// 2. With batching enabled, a pending job matching the resident model
    ///    runs without a switch, unless a strictly higher-priority job
    ///    wants a different model, which overrides batching.
    /// 3. Otherwise the head of the base `(priority DESC, queued_at ASC)`
    ///    order runs, switching models as needed.
    pub fn pick_next_batched(
        &self,
        batching_enabled: bool,
    ) -> Result<Option<BatchPick>, ResidencyError> {
        let pending = self.store.pending_jobs()?;
        let Some(top) = pending.first() else {
            return Ok(None);
        };
        let current = self.resident_external();

        let now = now_ms();
        if let Some(expired) = pending.iter().find(|job| now - job.queued_at >= job.max_wait_ms())
        {
            let should_switch = !self.job_matches_resident(expired, current.as_deref())?;
            return Ok(Some(BatchPick {
                job_id: expired.id,
                model: expired.requested_model.clone(),
                should_switch,
                reason: should_switch.then_some(SwitchReason::MaxWaitExceeded),
            }));
        }

        let same_model = match current.as_deref() {
            Some(resident) => {
                let mut found = None;
                for job in &pending {
                    if self.store.external_name(&job.requested_model)? == resident {
                        found = Some(job);
                        break;
                    }
                }
                found
            }
            None => None,
        };

        if batching_enabled
            && let Some(candidate) = same_model
            && top.priority <= candidate.priority
        {
            return Ok(Some(BatchPick {
                job_id: candidate.id,
                model: candidate.requested_model.clone(),
                should_switch: false,
                reason: None,
            }));
        }

        // Head of the base order runs.
        let should_switch = !self.job_matches_resident(top, current.as_deref())?;
        let reason = if !should_switch {
            None
        } else if current.is_none() {
            Some(SwitchReason::NoCurrent)
        } else if same_model.is_some() {
            // A job for the resident model is waiting, but priority order
            // (or disabled batching) sends a different model first.
            Some(SwitchReason::PriorityOverride)
        } else {
            Some(SwitchReason::QueueEmptyForCurrent)
        };

        Ok(Some(BatchPick {
            job_id: top.id,
            model: top.requested_model.clone(),
            should_switch,
            reason,
        }))
    }

    fn job_matches_resident(
        &self,
        job: &Job,
        current: Option<&str>,
    ) -> Result<bool, ResidencyError> {
        let Some(current) = current else {
            return Ok(false);
        };
        Ok(self.store.external_name(&job.requested_model)? == current)
    }

    // ------------------------------------------------------------------
    // Usage tracking
    // ------------------------------------------------------------------

    pub fn track_request_start(&self, job_id: JobId, model_id: &str) {
        lock(&self.active).insert(
            job_id,
            ActiveRequest {
                model: model_id.to_string(),
                started: Instant::now(),
            },
        );
        self.note_usage(model_id);
        {
            let mut usage = lock(&self.usage);
            usage.entry(model_id.to_string()).or_default().active_requests += 1;
        }
        if let Err(e) = self.store.touch_usage(model_id) {
            tracing::warn!(model = model_id, "Failed to bump usage counters: {e}");
        }
    }

    pub fn track_request_end(&self, job_id: JobId) {
        let Some(request) = lock(&self.active).remove(&job_id) else {
            return;
        };
        let mut usage = lock(&self.usage);
        let entry = usage.entry(request.model).or_default();
        entry.active_requests = entry.active_requests.saturating_sub(1);
        entry.last_used = Some(Instant::now());
    }

    /// `(idle duration, active request count)` for a model, if it was ever
    /// used. A freshly loaded model counts as used at load time.
    #[must_use]
    pub fn usage_of(&self, model_id: &str) -> Option<(Duration, u32)> {
        let usage = lock(&self.usage);
        let entry = usage.get(model_id)?;
        let last = entry.last_used?;
        Some((last.elapsed(), entry.active_requests))
    }

    /// Whether any in-flight request has been running longer than
    /// `threshold`.
    #[must_use]
    pub fn has_long_running_request(&self, threshold: Duration) -> bool {
        lock(&self.active)
            .values()
            .any(|request| request.started.elapsed() >= threshold)
    }

    #[must_use]
    pub fn active_request_count(&self) -> usize {
        lock(&self.active).len()
    }

    /// External name of the cached resident model, if any.
    #[must_use]
    pub fn resident_external(&self) -> Option<String> {
        lock(&self.slot).as_ref().map(|s| s.external_name.clone())
    }

    /// How long the resident slot has held its current occupant.
    #[must_use]
    pub fn resident_age(&self) -> Option<Duration> {
        lock(&self.slot).as_ref().map(|s| s.loaded_at.elapsed())
    }

    pub(crate) fn note_resident(&self, external: Option<String>) {
        let mut slot = lock(&self.slot);
        match external {
            Some(external) => {
                let unchanged = slot.as_ref().is_some_and(|s| s.external_name == external);
                if !unchanged {
                    *slot = Some(ResidentSlot {
                        external_name: external,
                        loaded_at: Instant::now(),
                    });
                }
            }
            None => *slot = None,
        }
    }

    fn note_usage(&self, model_id: &str) {
        let mut usage = lock(&self.usage);
        usage.entry(model_id.to_string()).or_default().last_used = Some(Instant::now());
    }
}
