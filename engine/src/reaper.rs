//! Stale-job reaper and terminal-job GC.
//!
//! Two independent scans fail abandoned work: pending jobs that sat in the
//! queue past the wait bound, and streaming jobs whose deltas stopped
//! (upstream hang, lost connection). A third, slower loop purges terminal
//! jobs once their retention window passes.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;

use relay_types::JobEvent;

use crate::engine::{Inner, lock};

pub(crate) const STREAM_TIMEOUT_MESSAGE: &str =
    "Job timed out (backend restart or connection lost)";

pub(crate) fn queue_timeout_message(timeout: Duration) -> String {
    format!("Job timed out in queue ({} minutes)", timeout.as_secs() / 60)
}

pub(crate) async fn run(inner: Arc<Inner>) {
    let mut reap = tokio::time::interval(Duration::from_secs(inner.config.reaper_secs));
    reap.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut gc = tokio::time::interval(Duration::from_secs(inner.config.gc_interval_secs));
    gc.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut shutdown = inner.shutdown.subscribe();

    loop {
        tokio::select! {
            _ = reap.tick() => reap_stale(&inner),
            _ = gc.tick() => purge_terminal(&inner),
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

pub(crate) fn reap_stale(inner: &Arc<Inner>) {
    let stale = match inner
        .store
        .stale_jobs(inner.config.queue_timeout(), inner.config.stream_idle())
    {
        Ok(stale) => stale,
        Err(e) => {
            tracing::warn!("Stale-job scan failed: {e}");
            return;
        }
    };

    let mut reaped = false;
    let queue_message = queue_timeout_message(inner.config.queue_timeout());
    for job_id in stale.timed_out_pending {
        match inner.store.fail(job_id, &queue_message) {
            Ok(Some(_)) => {
                tracing::warn!(job = %job_id, "Reaped job stuck in queue");
                inner.bus.publish(
                    job_id,
                    &JobEvent::Failed {
                        error: queue_message.clone(),
                    },
                );
                reaped = true;
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(job = %job_id, "Failed to reap queued job: {e}"),
        }
    }

    for job_id in stale.stalled_streaming {
        match inner.store.fail(job_id, STREAM_TIMEOUT_MESSAGE) {
            Ok(Some(_)) => {
                tracing::warn!(job = %job_id, "Reaped stalled stream");
                inner.bus.publish(
                    job_id,
                    &JobEvent::Failed {
                        error: STREAM_TIMEOUT_MESSAGE.to_string(),
                    },
                );
                // Tear down the live upstream request if it is this job's.
                if let Some(active) = lock(&inner.active).as_ref()
                    && active.job_id == job_id
                {
                    active.abort.abort();
                }
                reaped = true;
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(job = %job_id, "Failed to reap stalled stream: {e}"),
        }
    }

    if reaped {
        inner.wake.notify_one();
    }
}

fn purge_terminal(inner: &Arc<Inner>) {
    match inner.store.purge_terminal(inner.config.terminal_retention()) {
        Ok(0) => {}
        Ok(count) => tracing::info!(count, "Purged terminal jobs past retention"),
        Err(e) => tracing::warn!("Terminal-job purge failed: {e}"),
    }
}
