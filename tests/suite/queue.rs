//! Queue semantics end to end: ordering, positions, defaults, snapshots.

use std::time::Duration;

use relay_engine::{ChatMessage, ChatRole, EnqueueOptions, EnqueueError, JobKind, JobPayload, JobStatus};

use crate::common::{self, EventLog, harness, mount_generate, mount_ps, mount_tags};

fn chat_payload(text: &str) -> JobPayload {
    JobPayload {
        messages: vec![ChatMessage::new(ChatRole::User, text)],
        thinking_enabled: false,
        ..JobPayload::default()
    }
}

fn with_model(model: &str) -> EnqueueOptions {
    EnqueueOptions {
        model: Some(model.to_string()),
        ..EnqueueOptions::default()
    }
}

#[tokio::test]
async fn two_chats_same_model_run_in_order() {
    let h = harness(|_| {}).await;
    mount_tags(&h.server, &["qwen3:4b"]).await;
    mount_ps(&h.server, &[]).await;
    mount_generate(&h.server, &["ok"], "qwen3:4b", Duration::from_millis(25)).await;

    let a = h
        .engine
        .enqueue("conv", JobKind::Chat, chat_payload("first"), with_model("qwen3-4b"))
        .unwrap();
    let b = h
        .engine
        .enqueue("conv", JobKind::Chat, chat_payload("second"), with_model("qwen3-4b"))
        .unwrap();

    assert_eq!(a.queue_position, 1);
    // B sits behind A (or behind nothing if A already started).
    assert!(b.queue_position >= 1);

    assert_eq!(
        common::wait_job_terminal(&h.store, a.job_id, Duration::from_secs(10)).await,
        JobStatus::Completed
    );
    assert_eq!(
        common::wait_job_terminal(&h.store, b.job_id, Duration::from_secs(10)).await,
        JobStatus::Completed
    );

    let first = h.store.job(a.job_id).unwrap().unwrap();
    let second = h.store.job(b.job_id).unwrap().unwrap();
    // A finished before B began: no interleaving, ever.
    assert!(first.completed_at.unwrap() <= second.started_at.unwrap());
    assert_eq!(first.content, "ok");
    assert_eq!(second.content, "ok");
}

#[tokio::test]
async fn snapshot_shows_processing_and_pending() {
    let h = harness(|_| {}).await;
    mount_tags(&h.server, &["qwen3:4b"]).await;
    mount_ps(&h.server, &[]).await;
    // Slow stream keeps the first job processing while we look.
    mount_generate(&h.server, &["slow"], "qwen3:4b", Duration::from_millis(600)).await;

    let a = h
        .engine
        .enqueue("c1", JobKind::Chat, chat_payload("one"), with_model("qwen3-4b"))
        .unwrap();
    let b = h
        .engine
        .enqueue("c2", JobKind::Chat, chat_payload("two"), with_model("qwen3-4b"))
        .unwrap();

    // Wait until A is claimed.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let snapshot = h.engine.queue_status().unwrap();
        if let Some(processing) = &snapshot.processing {
            assert_eq!(processing.job_id, a.job_id);
            assert_eq!(snapshot.pending.len(), 1);
            assert_eq!(snapshot.pending[0].job_id, b.job_id);
            assert_eq!(snapshot.pending[0].queue_position, 1);
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "A never started");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    common::wait_job_terminal(&h.store, b.job_id, Duration::from_secs(10)).await;
}

#[tokio::test]
async fn enqueue_without_model_uses_configured_fallback() {
    let h = harness(|config| {
        config.default_model = Some("qwen3-4b".to_string());
    })
    .await;
    mount_tags(&h.server, &["qwen3:4b"]).await;
    mount_ps(&h.server, &[]).await;
    mount_generate(&h.server, &["hi"], "qwen3:4b", Duration::ZERO).await;

    let receipt = h
        .engine
        .enqueue("c", JobKind::Chat, chat_payload("x"), EnqueueOptions::default())
        .unwrap();
    assert_eq!(receipt.resolved_model, "qwen3-4b");
    common::wait_job_terminal(&h.store, receipt.job_id, Duration::from_secs(10)).await;
}

#[tokio::test]
async fn enqueue_without_any_default_is_a_producer_error() {
    let h = harness(|_| {}).await;
    mount_tags(&h.server, &[]).await;

    let result = h
        .engine
        .enqueue("c", JobKind::Chat, chat_payload("x"), EnqueueOptions::default());
    assert!(matches!(result, Err(EnqueueError::NoDefaultModel)));
}

#[tokio::test]
async fn cancelling_a_pending_job_removes_it_before_dispatch() {
    let h = harness(|_| {}).await;
    // Runtime never becomes ready, so the job stays pending.
    let receipt = h
        .engine
        .enqueue("c", JobKind::Chat, chat_payload("x"), with_model("qwen3-4b"))
        .unwrap();

    let log = EventLog::new();
    let _sub = h.engine.subscribe(receipt.job_id, log.callback()).unwrap();

    assert!(h.engine.cancel(receipt.job_id).unwrap());
    // Second cancel is an idempotent no-op.
    assert!(!h.engine.cancel(receipt.job_id).unwrap());

    let job = h.store.job(receipt.job_id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.error_message.as_deref(), Some("Job was cancelled"));

    let events = log.snapshot();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["type"], "cancelled");
    assert_eq!(events[0]["done"], true);
}

#[tokio::test]
async fn prioritized_job_jumps_the_pending_queue() {
    let h = harness(|_| {}).await;
    // No runtime mocks: everything stays pending.
    let _a = h
        .engine
        .enqueue("c", JobKind::Chat, chat_payload("a"), with_model("qwen3-4b"))
        .unwrap();
    let b = h
        .engine
        .enqueue("c", JobKind::Chat, chat_payload("b"), with_model("qwen3-4b"))
        .unwrap();
    assert_eq!(b.queue_position, 2);

    let position = h.engine.prioritize(b.job_id).unwrap().unwrap();
    assert_eq!(position, 1);

    let job = h.store.job(b.job_id).unwrap().unwrap();
    assert_eq!(job.priority, 1);
    assert_eq!(job.queue_position, 1);
}
