//! Readiness and auto-unload supervision.
//!
//! At boot the supervisor polls the runtime until it answers, then flips the
//! readiness signal that gates dispatch. From then on it keeps the catalog
//! in sync with what the runtime actually has, and reclaims memory by
//! unloading the resident model after sustained inactivity. Memory pressure
//! during a long request only warns; an in-flight stream is never killed
//! for RAM.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::MissedTickBehavior;

use crate::engine::Inner;

/// Install-row message when the runtime stops listing a model.
const MODEL_MISSING_MESSAGE: &str = "Model no longer present on the runtime";

/// Install-row message for downloads that never finished.
const DOWNLOAD_ABORTED_MESSAGE: &str = "Download aborted — please retry";

pub(crate) async fn run(inner: Arc<Inner>) {
    wait_for_runtime(&inner).await;

    let mut sync = tokio::time::interval(Duration::from_secs(inner.config.sync_interval_secs));
    sync.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut unload = tokio::time::interval(Duration::from_secs(inner.config.unload_check_secs));
    unload.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut shutdown = inner.shutdown.subscribe();

    loop {
        tokio::select! {
            _ = sync.tick() => sync_catalog(&inner).await,
            _ = unload.tick() => check_unload(&inner).await,
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

/// Poll `/api/tags` with growing, down-jittered delays until the runtime
/// answers or the budget runs out. Returns whether it became ready here;
/// the periodic catalog sync keeps trying either way.
pub(crate) async fn wait_for_runtime(inner: &Arc<Inner>) -> bool {
    let config = &inner.config;
    let budget = Duration::from_secs(config.readiness_budget_secs);
    let cap = Duration::from_secs(config.readiness_interval_cap_secs);
    let mut delay = Duration::from_secs(config.readiness_interval_secs);
    let started = Instant::now();

    loop {
        match inner.client.list_models().await {
            Ok(models) => {
                tracing::info!(models = models.len(), "Inference runtime is ready");
                mark_ready(inner);
                return true;
            }
            Err(e) => tracing::debug!("Runtime not ready yet: {e}"),
        }
        if started.elapsed() >= budget {
            tracing::warn!(
                budget_secs = config.readiness_budget_secs,
                "Runtime did not become ready within the startup budget"
            );
            return false;
        }
        tokio::time::sleep(jittered(delay)).await;
        delay = delay
            .mul_f64(config.readiness_backoff_factor)
            .min(cap);
    }
}

fn mark_ready(inner: &Arc<Inner>) {
    if !*inner.ready.borrow() {
        let _ = inner.ready.send(true);
        inner.wake.notify_one();
    }
}

/// Down-jitter up to 25% so a fleet of appliances does not poll in lockstep.
fn jittered(delay: Duration) -> Duration {
    delay.mul_f64(1.0 - rand::random::<f64>() * 0.25)
}

/// Reconcile install state with what the runtime reports.
pub(crate) async fn sync_catalog(inner: &Arc<Inner>) {
    let models = match inner.client.list_models().await {
        Ok(models) => models,
        Err(e) => {
            tracing::warn!("Catalog sync failed: {e}");
            return;
        }
    };
    // The runtime answered; recover readiness if boot-time polling gave up.
    mark_ready(inner);

    let mut present = Vec::new();
    for model in &models {
        match inner.store.catalog_id_for_external(&model.name) {
            Ok(Some(id)) => match inner.store.mark_available(&id) {
                Ok(()) => present.push(id),
                Err(e) => tracing::warn!(model = %id, "Failed to mark available: {e}"),
            },
            Ok(None) => {
                tracing::debug!(model = %model.name, "Runtime model not in catalog; skipping");
            }
            Err(e) => tracing::warn!(model = %model.name, "Catalog lookup failed: {e}"),
        }
    }

    match inner
        .store
        .mark_missing_unavailable(&present, MODEL_MISSING_MESSAGE)
    {
        Ok(flipped) => {
            for id in flipped {
                tracing::warn!(model = %id, "Installed model disappeared from the runtime");
            }
        }
        Err(e) => tracing::warn!("Failed to reconcile missing models: {e}"),
    }

    let max_age_ms = (inner.config.download_timeout_secs as i64).saturating_mul(1000);
    match inner.store.stale_downloads(max_age_ms) {
        Ok(stuck) => {
            for id in stuck {
                tracing::warn!(model = %id, "Abandoned download detected");
                if let Err(e) = inner.store.mark_install_error(&id, DOWNLOAD_ABORTED_MESSAGE) {
                    tracing::warn!(model = %id, "Failed to flag abandoned download: {e}");
                }
            }
        }
        Err(e) => tracing::warn!("Stale download scan failed: {e}"),
    }
}

/// Inactivity-based unload plus the memory-pressure warning.
pub(crate) async fn check_unload(inner: &Arc<Inner>) {
    let resident = match inner.residency.loaded_model().await {
        Ok(resident) => resident,
        Err(e) => {
            tracing::debug!("Unload check skipped, runtime unreachable: {e}");
            return;
        }
    };

    if let Some(loaded) = resident {
        let model_id = inner
            .store
            .catalog_id_for_external(&loaded.external_name)
            .ok()
            .flatten()
            .unwrap_or_else(|| loaded.external_name.clone());

        // A model that was never used since load counts idle from load time.
        let usage = inner
            .residency
            .usage_of(&model_id)
            .or_else(|| inner.residency.resident_age().map(|age| (age, 0)));

        if let Some((idle, active)) = usage
            && active == 0
            && idle >= inner.config.inactivity_threshold()
        {
            tracing::info!(
                model = %model_id,
                idle_secs = idle.as_secs(),
                reason = "inactivity",
                "Unloading idle model"
            );
            inner.residency.unload_external(&loaded.external_name).await;
            return;
        }
    }

    if let Some(percent) = memory_used_percent()
        && percent >= f64::from(inner.config.ram_critical_percent)
        && inner
            .residency
            .has_long_running_request(inner.config.long_request())
    {
        // Never unload under an in-flight request; inactivity rule 1 will
        // reclaim after completion.
        tracing::warn!(
            ram_used_percent = percent,
            "Memory critical with a long-running request; deferring unload"
        );
    }
}

fn memory_used_percent() -> Option<f64> {
    let raw = std::fs::read_to_string("/proc/meminfo").ok()?;
    parse_meminfo(&raw)
}

fn parse_meminfo(raw: &str) -> Option<f64> {
    let mut total = None;
    let mut available = None;
    for line in raw.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total = first_number(rest);
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available = first_number(rest);
        }
    }
    let (total, available) = (total?, available?);
    if total <= 0.0 {
        return None;
    }
    Some((total - available) / total * 100.0)
}

fn first_number(text: &str) -> Option<f64> {
    text.split_whitespace().next()?.parse().ok()
}
