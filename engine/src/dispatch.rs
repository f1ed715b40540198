//! The streaming dispatcher.
//!
//! One loop runs jobs strictly one at a time: pick via the batching policy,
//! claim in the store, make the model resident, stream the upstream
//! response through the think-block parser into the batcher and the
//! subscription bus, then finish with a forced flush and a terminal event.
//!
//! The upstream request runs in its own task wrapped in an [`Abortable`];
//! cancellation aborts that task, which closes the channel the dispatch
//! loop reads from. Whoever wins the store's terminal transition publishes
//! the terminal event, never both.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::future::{AbortHandle, Abortable};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use relay_runtime::{GenerateChunk, GenerateOptions, GenerateRequest, RuntimeError};
use relay_store::now_ms;
use relay_types::{ChatRole, Job, JobEvent, JobId, JobKind, JobStatus, SwitchReason};

use crate::batch::DeltaBatcher;
use crate::engine::{ActiveStream, Inner, lock};
use crate::residency::BatchPick;
use crate::think::{Segment, ThinkParser};

enum StreamMessage {
    Chunk(GenerateChunk),
    End(Result<(), RuntimeError>),
}

enum Outcome {
    Completed,
    Failed(String),
    Aborted,
}

/// Dispatch loop: wakes on enqueue/terminal/readiness changes plus a safety
/// tick, and drains the queue while jobs are runnable.
pub(crate) async fn run(inner: Arc<Inner>) {
    let mut shutdown = inner.shutdown.subscribe();
    let ready = inner.ready.subscribe();
    loop {
        tokio::select! {
            () = inner.wake.notified() => {}
            () = tokio::time::sleep(Duration::from_secs(1)) => {}
            _ = shutdown.changed() => {}
        }
        if *shutdown.borrow() {
            break;
        }
        if !*ready.borrow() {
            continue;
        }

        loop {
            if *shutdown.borrow() {
                return;
            }
            match inner.residency.pick_next_batched(inner.config.batching_enabled) {
                Ok(Some(pick)) => run_job(&inner, pick).await,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Queue pick failed: {e}");
                    break;
                }
            }
        }
    }
}

async fn run_job(inner: &Arc<Inner>, pick: BatchPick) {
    let job = match inner.store.claim(pick.job_id) {
        Ok(Some(job)) => job,
        // Cancelled or reaped since the pick; nothing to do.
        Ok(None) => return,
        Err(e) => {
            tracing::warn!(job = %pick.job_id, "Claim failed: {e}");
            return;
        }
    };
    let job_id = job.id;
    tracing::info!(job = %job_id, model = %job.requested_model, kind = %job.kind, "Job starting");

    let mut batcher = DeltaBatcher::new(
        inner.config.batch_flush_interval(),
        inner.config.batch_flush_chars,
    );

    inner.bus.publish(
        job_id,
        &JobEvent::Status {
            status: JobStatus::Streaming,
            queue_position: 0,
            model: job.requested_model.clone(),
        },
    );

    let model_id = match ensure_model(inner, &job, &pick).await {
        Ok(model_id) => model_id,
        Err(message) => {
            finalize_failure(inner, job_id, &mut batcher, &message);
            inner.wake.notify_one();
            return;
        }
    };

    let external = match inner.store.external_name(&model_id) {
        Ok(external) => external,
        Err(e) => {
            finalize_failure(inner, job_id, &mut batcher, &e.to_string());
            inner.wake.notify_one();
            return;
        }
    };

    inner.residency.track_request_start(job_id, &model_id);

    // RAG sources go out once, ahead of any response token.
    if let Some(sources) = &job.payload.sources {
        batcher.set_sources(sources.clone());
        inner.bus.publish(
            job_id,
            &JobEvent::Sources {
                sources: sources.clone(),
            },
        );
    }

    let prompt = build_prompt(&job);
    log_prompt_size(inner, &external, &prompt).await;
    let request = GenerateRequest {
        model: external,
        prompt,
        stream: true,
        keep_alive: inner.config.default_keep_alive_secs as i64,
        options: GenerateOptions {
            temperature: job.payload.temperature,
            num_predict: job.payload.num_predict,
        },
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    let (abort, registration) = AbortHandle::new_pair();
    let cancelled = Arc::new(AtomicBool::new(false));
    *lock(&inner.active) = Some(ActiveStream {
        job_id,
        abort,
        cancelled: Arc::clone(&cancelled),
    });

    let client = inner.client.clone();
    let stream_task = async move {
        let chunk_tx = tx.clone();
        let result = client
            .generate(&request, move |chunk| {
                let _ = chunk_tx.send(StreamMessage::Chunk(chunk));
            })
            .await;
        let _ = tx.send(StreamMessage::End(result));
    };
    tokio::spawn(Abortable::new(stream_task, registration));

    let mut parser = ThinkParser::new();
    let thinking_enabled = job.payload.thinking_enabled;
    let mut reported_model: Option<String> = None;

    let mut flush_timer = tokio::time::interval(inner.config.batch_flush_interval());
    flush_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let outcome = loop {
        tokio::select! {
            message = rx.recv() => match message {
                Some(StreamMessage::Chunk(chunk)) => {
                    let GenerateChunk { response, model, .. } = chunk;
                    if let Some(model) = model {
                        reported_model = Some(model);
                    }
                    if let Some(token) = response {
                        for segment in parser.feed(&token) {
                            emit_segment(inner, job_id, segment, &mut batcher, thinking_enabled);
                        }
                        if batcher.should_flush() {
                            batcher.flush(&inner.store, job_id);
                        }
                    }
                }
                Some(StreamMessage::End(Ok(()))) => break Outcome::Completed,
                Some(StreamMessage::End(Err(e))) => break Outcome::Failed(e.to_string()),
                // The abortable task was dropped: cancellation (or shutdown).
                None => break Outcome::Aborted,
            },
            _ = flush_timer.tick() => {
                if batcher.should_flush() {
                    batcher.flush(&inner.store, job_id);
                }
            }
        }
    };

    *lock(&inner.active) = None;

    match outcome {
        Outcome::Completed => {
            for segment in parser.finish() {
                emit_segment(inner, job_id, segment, &mut batcher, thinking_enabled);
            }
            batcher.flush(&inner.store, job_id);
            match inner.store.complete(job_id) {
                Ok(Some(done)) => {
                    let model = reported_model.unwrap_or_else(|| done.requested_model.clone());
                    tracing::info!(job = %job_id, chars = done.content.len(), "Job completed");
                    inner.bus.publish(
                        job_id,
                        &JobEvent::Done {
                            model,
                            job_id,
                            timestamp: now_ms(),
                        },
                    );
                }
                // Lost the terminal race (cancel/reaper); they published.
                Ok(None) => {}
                Err(e) => tracing::warn!(job = %job_id, "Completion write failed: {e}"),
            }
        }
        Outcome::Failed(message) => {
            for segment in parser.finish() {
                emit_segment(inner, job_id, segment, &mut batcher, thinking_enabled);
            }
            finalize_failure(inner, job_id, &mut batcher, &message);
        }
        Outcome::Aborted => {
            // No further response events after an abort: flush what was
            // already emitted, then settle the terminal state.
            batcher.flush(&inner.store, job_id);
            if cancelled.load(Ordering::SeqCst) {
                match inner.store.cancel(job_id) {
                    Ok(Some(_)) => {
                        tracing::info!(job = %job_id, "Job cancelled mid-stream");
                        inner.bus.publish(job_id, &JobEvent::Cancelled);
                    }
                    Ok(None) => {}
                    Err(e) => tracing::warn!(job = %job_id, "Cancel write failed: {e}"),
                }
            } else if let Ok(Some(_)) = inner
                .store
                .fail(job_id, "Streaming task ended unexpectedly")
            {
                inner.bus.publish(
                    job_id,
                    &JobEvent::Failed {
                        error: "Streaming task ended unexpectedly".to_string(),
                    },
                );
            }
        }
    }

    inner.residency.track_request_end(job_id);
    inner.wake.notify_one();
}

/// Make the job's model resident, walking its alternates on failure.
/// Returns the catalog id that is actually loaded.
async fn ensure_model(inner: &Arc<Inner>, job: &Job, pick: &BatchPick) -> Result<String, String> {
    let reason = pick
        .reason
        .map_or("auto_reload", SwitchReason::as_str);
    let mut candidates = Vec::with_capacity(1 + job.model_sequence.len());
    candidates.push(job.requested_model.clone());
    candidates.extend(job.model_sequence.iter().cloned());

    let mut last_error = String::from("no model candidates");
    for (index, candidate) in candidates.into_iter().enumerate() {
        let result = if index == 0 && !pick.should_switch {
            inner
                .residency
                .ensure_loaded(&candidate, "job_dispatch", "auto_reload")
                .await
        } else {
            inner
                .residency
                .activate(&candidate, "job_dispatch", reason)
                .await
        };
        match result {
            Ok(_) => return Ok(candidate),
            Err(e) => {
                tracing::warn!(job = %job.id, model = %candidate, "Activation failed: {e}");
                last_error = e.to_string();
            }
        }
    }
    Err(last_error)
}

fn emit_segment(
    inner: &Arc<Inner>,
    job_id: JobId,
    segment: Segment,
    batcher: &mut DeltaBatcher,
    thinking_enabled: bool,
) {
    match segment {
        Segment::Content(text) => {
            batcher.push_content(&text);
            inner.bus.publish(job_id, &JobEvent::Response { token: text });
        }
        Segment::Thinking(text) => {
            if thinking_enabled {
                batcher.push_thinking(&text);
                inner
                    .bus
                    .publish(job_id, &JobEvent::Thinking { token: text });
            }
            // Thinking disabled: the block is dropped entirely.
        }
        Segment::ThinkingEnd => {
            if thinking_enabled {
                inner.bus.publish(job_id, &JobEvent::ThinkingEnd);
            }
        }
    }
}

/// Force-flush, fail the job and notify subscribers, unless somebody else
/// already settled it.
fn finalize_failure(inner: &Arc<Inner>, job_id: JobId, batcher: &mut DeltaBatcher, message: &str) {
    batcher.flush(&inner.store, job_id);
    match inner.store.fail(job_id, message) {
        Ok(Some(_)) => {
            tracing::warn!(job = %job_id, "Job failed: {message}");
            inner.bus.publish(
                job_id,
                &JobEvent::Failed {
                    error: message.to_string(),
                },
            );
        }
        Ok(None) => {}
        Err(e) => tracing::warn!(job = %job_id, "Failure write failed: {e}"),
    }
}

/// Best-effort prompt accounting; the runtime's tokenizer when present,
/// the 4-chars-per-token heuristic otherwise.
async fn log_prompt_size(inner: &Arc<Inner>, external: &str, prompt: &str) {
    let tokens = match inner.client.tokenize(external, prompt).await {
        Ok(Some(count)) => count,
        Ok(None) => relay_runtime::estimate_tokens(prompt),
        Err(e) => {
            tracing::debug!("Tokenize probe failed: {e}");
            relay_runtime::estimate_tokens(prompt)
        }
    };
    tracing::debug!(tokens, chars = prompt.len(), "Prompt built");
}

/// Render the request payload into a single prompt string.
///
/// Chat jobs replay the transcript with role labels; rag jobs compose
/// system + context + question. Thinking disabled prepends `/no_think`.
fn build_prompt(job: &Job) -> String {
    let mut prompt = String::new();
    if !job.payload.thinking_enabled {
        prompt.push_str("/no_think\n");
    }
    match job.kind {
        JobKind::Chat => {
            for message in &job.payload.messages {
                match message.role {
                    ChatRole::System => {
                        prompt.push_str(&message.content);
                        prompt.push_str("\n\n");
                    }
                    ChatRole::User => {
                        prompt.push_str("User: ");
                        prompt.push_str(&message.content);
                        prompt.push('\n');
                    }
                    ChatRole::Assistant => {
                        prompt.push_str("Assistant: ");
                        prompt.push_str(&message.content);
                        prompt.push('\n');
                    }
                }
            }
            prompt.push_str("Assistant:");
        }
        JobKind::Rag => {
            if let Some(system) = &job.payload.system {
                prompt.push_str(system);
                prompt.push_str("\n\n");
            }
            if let Some(context) = &job.payload.context {
                prompt.push_str("Context:\n");
                prompt.push_str(context);
                prompt.push_str("\n\n");
            }
            if let Some(query) = &job.payload.query {
                prompt.push_str("Question: ");
                prompt.push_str(query);
                prompt.push('\n');
            }
            prompt.push_str("Answer:");
        }
    }
    prompt
}
