//! Residency behavior end to end: smart batching, starvation bounds,
//! idle unload, downloads, deletion.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, ResponseTemplate};

use relay_engine::{ChatMessage, ChatRole, EnqueueOptions, JobKind, JobPayload};

use crate::common::{self, harness, mount_generate_for, mount_ps, mount_tags};

fn chat() -> JobPayload {
    JobPayload {
        messages: vec![ChatMessage::new(ChatRole::User, "go")],
        thinking_enabled: false,
        ..JobPayload::default()
    }
}

fn opts(model: &str, max_wait: Option<u64>) -> EnqueueOptions {
    EnqueueOptions {
        model: Some(model.to_string()),
        max_wait_secs: max_wait,
        ..EnqueueOptions::default()
    }
}

#[tokio::test]
async fn batching_groups_jobs_by_model() {
    // A(modelA), B(modelB), C(modelA): expected run order A, C, B with a
    // single switch to modelB at the end.
    let h = harness(|_| {}).await;
    mount_tags(&h.server, &["qwen3:4b", "qwen3:8b"]).await;
    mount_ps(&h.server, &[]).await;
    mount_generate_for(&h.server, "qwen3:4b", &["a"], Duration::from_millis(30)).await;
    mount_generate_for(&h.server, "qwen3:8b", &["b"], Duration::from_millis(30)).await;

    // All three land in the queue before the dispatcher gets a turn, so the
    // batching policy sees the whole picture.
    let a = h.engine.enqueue("c", JobKind::Chat, chat(), opts("qwen3-4b", None)).unwrap();
    let b = h.engine.enqueue("c", JobKind::Chat, chat(), opts("qwen3-8b", None)).unwrap();
    let c = h.engine.enqueue("c", JobKind::Chat, chat(), opts("qwen3-4b", None)).unwrap();

    for receipt in [&a, &b, &c] {
        common::wait_job_terminal(&h.store, receipt.job_id, Duration::from_secs(15)).await;
    }

    let job_a = h.store.job(a.job_id).unwrap().unwrap();
    let job_b = h.store.job(b.job_id).unwrap().unwrap();
    let job_c = h.store.job(c.job_id).unwrap().unwrap();
    // A before C (same model, FIFO), B last despite being enqueued second.
    assert!(job_a.started_at.unwrap() <= job_c.started_at.unwrap());
    assert!(job_c.completed_at.unwrap() <= job_b.started_at.unwrap());

    // One switch onto qwen3-4b at the start, one onto qwen3-8b for B,
    // nothing between A and C.
    let switches = h.store.model_switches().unwrap();
    assert_eq!(switches.len(), 2);
    assert_eq!(switches[0].to_model, "qwen3-4b");
    assert_eq!(switches[0].reason, "no_current");
    assert_eq!(switches[1].to_model, "qwen3-8b");
    assert_eq!(switches[1].reason, "queue_empty_for_current");
}

#[tokio::test]
async fn max_wait_bounds_starvation() {
    // Same setup, but B's wait bound is one second and every stream is slow
    // enough that the bound expires while A runs. B must jump ahead of C.
    let h = harness(|_| {}).await;
    mount_tags(&h.server, &["qwen3:4b", "qwen3:8b"]).await;
    mount_ps(&h.server, &[]).await;
    mount_generate_for(&h.server, "qwen3:4b", &["a"], Duration::from_millis(700)).await;
    mount_generate_for(&h.server, "qwen3:8b", &["b"], Duration::from_millis(100)).await;

    let a = h.engine.enqueue("c", JobKind::Chat, chat(), opts("qwen3-4b", None)).unwrap();
    let b = h.engine.enqueue("c", JobKind::Chat, chat(), opts("qwen3-8b", Some(1))).unwrap();
    let c = h.engine.enqueue("c", JobKind::Chat, chat(), opts("qwen3-4b", None)).unwrap();

    for receipt in [&a, &b, &c] {
        common::wait_job_terminal(&h.store, receipt.job_id, Duration::from_secs(15)).await;
    }

    let job_b = h.store.job(b.job_id).unwrap().unwrap();
    let job_c = h.store.job(c.job_id).unwrap().unwrap();
    assert!(
        job_b.started_at.unwrap() <= job_c.started_at.unwrap(),
        "expired wait bound did not promote B ahead of C"
    );

    let reasons: Vec<_> = h
        .store
        .model_switches()
        .unwrap()
        .into_iter()
        .map(|s| s.reason)
        .collect();
    assert!(
        reasons.iter().any(|reason| reason == "maxwait_exceeded"),
        "no maxwait_exceeded switch recorded: {reasons:?}"
    );
}

#[tokio::test]
async fn idle_model_is_unloaded_after_inactivity() {
    let h = harness(|config| {
        config.inactivity_threshold_secs = 1;
        config.unload_check_secs = 1;
    })
    .await;
    mount_tags(&h.server, &["qwen3:4b"]).await;
    mount_ps(&h.server, &[]).await;
    mount_generate_for(&h.server, "qwen3:4b", &["done"], Duration::ZERO).await;

    let receipt = h.engine.enqueue("c", JobKind::Chat, chat(), opts("qwen3-4b", None)).unwrap();
    common::wait_job_terminal(&h.store, receipt.job_id, Duration::from_secs(10)).await;

    // From here the runtime reports the model resident and idle.
    h.server.reset().await;
    mount_tags(&h.server, &["qwen3:4b"]).await;
    mount_ps(&h.server, &["qwen3:4b"]).await;
    mount_generate_for(&h.server, "qwen3:4b", &[], Duration::ZERO).await;

    // Wait past the inactivity threshold plus a couple of check ticks.
    tokio::time::sleep(Duration::from_millis(3500)).await;

    // The supervisor must have issued a keep_alive:0 generate (the unload).
    let requests = h.server.received_requests().await.unwrap();
    let saw_unload = requests.iter().any(|request| {
        request.url.path() == "/api/generate"
            && serde_json::from_slice::<serde_json::Value>(&request.body)
                .is_ok_and(|body| body["keep_alive"] == 0)
    });
    assert!(saw_unload, "no unload request observed");
}

#[tokio::test]
async fn download_maps_progress_and_sets_first_default() {
    let h = harness(|_| {}).await;
    mount_tags(&h.server, &[]).await;
    mount_ps(&h.server, &[]).await;

    let body = concat!(
        r#"{"status":"pulling manifest"}"#,
        "\n",
        r#"{"status":"pulling sha256:abc","total":1000,"completed":250}"#,
        "\n",
        r#"{"status":"pulling sha256:abc","total":1000,"completed":1000}"#,
        "\n",
        r#"{"status":"verifying sha256 digest"}"#,
        "\n",
        r#"{"status":"writing manifest"}"#,
        "\n",
        r#"{"status":"success"}"#,
        "\n",
    );
    Mock::given(method("POST"))
        .and(path("/api/pull"))
        .and(body_partial_json(serde_json::json!({ "name": "qwen3:4b" })))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/x-ndjson"))
        .mount(&h.server)
        .await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    h.engine
        .download("qwen3-4b", move |percent| sink.lock().unwrap().push(percent))
        .await
        .unwrap();

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.first(), Some(&1));
    assert!(seen.contains(&96));
    assert!(seen.contains(&98));
    assert_eq!(seen.last(), Some(&100));
    // Monotone progress, byte phase confined to 2..=95.
    assert!(seen.windows(2).all(|pair| pair[0] <= pair[1]));

    let installed = h.store.installed("qwen3-4b").unwrap().unwrap();
    assert_eq!(installed.status, relay_types::InstallStatus::Available);
    assert_eq!(installed.download_progress, 100);
    // First install becomes the default.
    assert!(installed.is_default);
}

#[tokio::test]
async fn download_of_unknown_model_is_rejected() {
    let h = harness(|_| {}).await;
    let result = h.engine.download("not-a-model", |_| {}).await;
    assert!(matches!(
        result,
        Err(relay_engine::EngineError::UnknownModel(_))
    ));
}

#[tokio::test]
async fn delete_removes_install_row_and_tolerates_missing_upstream() {
    let h = harness(|_| {}).await;
    mount_tags(&h.server, &[]).await;
    mount_ps(&h.server, &[]).await;
    Mock::given(method("DELETE"))
        .and(path("/api/delete"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&h.server)
        .await;

    h.store.mark_available("qwen3-4b").unwrap();
    h.engine.delete_model("qwen3-4b").await.unwrap();
    assert!(h.store.installed("qwen3-4b").unwrap().is_none());
}
