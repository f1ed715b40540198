//! Streaming behavior: event sequences, think blocks, sources,
//! cancellation, terminal replay, upstream failures.

use std::time::Duration;

use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use relay_engine::{ChatMessage, ChatRole, EnqueueOptions, JobKind, JobPayload, JobStatus};

use crate::common::{
    self, EventLog, harness, mount_generate, mount_ps, mount_tags, ndjson,
};

fn chat(text: &str, thinking: bool) -> JobPayload {
    JobPayload {
        messages: vec![ChatMessage::new(ChatRole::User, text)],
        temperature: Some(0.7),
        num_predict: Some(8),
        thinking_enabled: thinking,
        ..JobPayload::default()
    }
}

fn model_opts() -> EnqueueOptions {
    EnqueueOptions {
        model: Some("qwen3-4b".to_string()),
        ..EnqueueOptions::default()
    }
}

#[tokio::test]
async fn single_chat_streams_tokens_then_done() {
    let h = harness(|_| {}).await;
    mount_tags(&h.server, &["qwen3:4b"]).await;
    mount_ps(&h.server, &[]).await;
    mount_generate(&h.server, &["he", "llo"], "qwen3:4b", Duration::ZERO).await;

    let receipt = h
        .engine
        .enqueue("conv", JobKind::Chat, chat("hi", false), model_opts())
        .unwrap();
    let log = EventLog::new();
    let _sub = h.engine.subscribe(receipt.job_id, log.callback()).unwrap();

    log.wait_terminal(Duration::from_secs(10)).await;

    let events = log.snapshot();
    assert_eq!(events[0]["type"], "status");
    assert_eq!(events[0]["status"], "streaming");
    assert_eq!(events[0]["queuePosition"], 0);
    assert_eq!(events[1]["token"], "he");
    assert_eq!(events[2]["token"], "llo");
    let done = events.last().unwrap();
    assert_eq!(done["done"], true);
    assert_eq!(done["jobId"], receipt.job_id.value());
    assert_eq!(done["model"], "qwen3:4b");

    let job = h.store.job(receipt.job_id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.content, "hello");
}

#[tokio::test]
async fn think_blocks_route_to_the_thinking_channel() {
    let h = harness(|_| {}).await;
    mount_tags(&h.server, &["qwen3:4b"]).await;
    mount_ps(&h.server, &[]).await;
    // The close marker arrives split across tokens.
    mount_generate(
        &h.server,
        &["<think>mulling", " it over</th", "ink>he", "llo"],
        "qwen3:4b",
        Duration::ZERO,
    )
    .await;

    let receipt = h
        .engine
        .enqueue("conv", JobKind::Chat, chat("hi", true), model_opts())
        .unwrap();
    let log = EventLog::new();
    let _sub = h.engine.subscribe(receipt.job_id, log.callback()).unwrap();
    log.wait_terminal(Duration::from_secs(10)).await;

    let events = log.snapshot();
    let thinking: String = events
        .iter()
        .filter(|event| event["type"] == "thinking")
        .map(|event| event["token"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(thinking, "mulling it over");
    assert!(events.iter().any(|event| event["type"] == "thinking_end"));
    assert_eq!(log.content(), "hello");

    let job = h.store.job(receipt.job_id).unwrap().unwrap();
    assert_eq!(job.content, "hello");
    assert_eq!(job.thinking, "mulling it over");
}

#[tokio::test]
async fn disabled_thinking_drops_blocks_and_prefixes_no_think() {
    let h = harness(|_| {}).await;
    mount_tags(&h.server, &["qwen3:4b"]).await;
    mount_ps(&h.server, &[]).await;
    mount_generate(
        &h.server,
        &["<think>hidden</think>", "visible"],
        "qwen3:4b",
        Duration::ZERO,
    )
    .await;

    let receipt = h
        .engine
        .enqueue("conv", JobKind::Chat, chat("hi", false), model_opts())
        .unwrap();
    let log = EventLog::new();
    let _sub = h.engine.subscribe(receipt.job_id, log.callback()).unwrap();
    log.wait_terminal(Duration::from_secs(10)).await;

    let events = log.snapshot();
    assert!(events.iter().all(|event| event["type"] != "thinking"));
    assert!(events.iter().all(|event| event["type"] != "thinking_end"));
    assert_eq!(log.content(), "visible");

    let job = h.store.job(receipt.job_id).unwrap().unwrap();
    assert_eq!(job.content, "visible");
    assert_eq!(job.thinking, "");

    // The job's generate request carried the /no_think prefix.
    let requests = h.server.received_requests().await.unwrap();
    let saw_no_think = requests.iter().any(|request| {
        request.url.path() == "/api/generate"
            && serde_json::from_slice::<serde_json::Value>(&request.body)
                .ok()
                .and_then(|body| body["prompt"].as_str().map(String::from))
                .is_some_and(|prompt| prompt.starts_with("/no_think\n"))
    });
    assert!(saw_no_think);
}

#[tokio::test]
async fn rag_jobs_emit_sources_before_any_response() {
    let h = harness(|_| {}).await;
    mount_tags(&h.server, &["qwen3:4b"]).await;
    mount_ps(&h.server, &[]).await;
    mount_generate(&h.server, &["8 GB"], "qwen3:4b", Duration::ZERO).await;

    let sources = serde_json::json!([{ "doc": "specs.pdf", "page": 3 }]);
    let payload = JobPayload {
        system: Some("Answer from the context.".to_string()),
        context: Some("Relay units ship with 8 GB RAM.".to_string()),
        query: Some("How much RAM?".to_string()),
        sources: Some(sources.clone()),
        thinking_enabled: false,
        ..JobPayload::default()
    };

    let receipt = h
        .engine
        .enqueue("conv", JobKind::Rag, payload, model_opts())
        .unwrap();
    let log = EventLog::new();
    let _sub = h.engine.subscribe(receipt.job_id, log.callback()).unwrap();
    log.wait_terminal(Duration::from_secs(10)).await;

    let events = log.snapshot();
    let sources_at = events
        .iter()
        .position(|event| event["type"] == "sources")
        .expect("sources event");
    let first_response = events
        .iter()
        .position(|event| event["type"] == "response")
        .expect("response event");
    assert!(sources_at < first_response);
    assert_eq!(events[sources_at]["sources"], sources);

    let job = h.store.job(receipt.job_id).unwrap().unwrap();
    assert_eq!(job.sources.unwrap(), sources);
}

#[tokio::test]
async fn cancel_mid_stream_stops_events_and_freezes_content() {
    let h = harness(|_| {}).await;
    mount_tags(&h.server, &["qwen3:4b"]).await;
    mount_ps(&h.server, &[]).await;
    // Activation resolves fast; the job's own stream is held back so the
    // cancel lands while it is in flight.
    mount_generate(&h.server, &["never"], "qwen3:4b", Duration::from_millis(900)).await;

    let receipt = h
        .engine
        .enqueue("conv", JobKind::Chat, chat("hi", false), model_opts())
        .unwrap();
    let log = EventLog::new();
    let _sub = h.engine.subscribe(receipt.job_id, log.callback()).unwrap();

    // Let activation finish (one delayed generate) and the job stream begin.
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert!(h.engine.cancel(receipt.job_id).unwrap());

    log.wait_terminal(Duration::from_millis(500)).await;

    let events = log.snapshot();
    let terminal = events.last().unwrap();
    assert_eq!(terminal["type"], "cancelled");
    assert_eq!(terminal["done"], true);
    // Nothing after the terminal, and no response tokens snuck in post-cancel.
    assert!(
        events
            .iter()
            .filter(|event| event["type"] == "response")
            .count()
            <= 1
    );

    let job = h.store.job(receipt.job_id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.content, log.content());
}

#[tokio::test]
async fn late_subscriber_to_finished_job_gets_replay() {
    let h = harness(|_| {}).await;
    mount_tags(&h.server, &["qwen3:4b"]).await;
    mount_ps(&h.server, &[]).await;
    mount_generate(&h.server, &["he", "llo"], "qwen3:4b", Duration::ZERO).await;

    let receipt = h
        .engine
        .enqueue("conv", JobKind::Chat, chat("hi", false), model_opts())
        .unwrap();
    common::wait_job_terminal(&h.store, receipt.job_id, Duration::from_secs(10)).await;

    // Subscribe only now: the content arrives as one synthetic pre-roll
    // followed by the terminal event.
    let log = EventLog::new();
    let _sub = h.engine.subscribe(receipt.job_id, log.callback()).unwrap();

    let events = log.snapshot();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0]["type"], "response");
    assert_eq!(events[0]["token"], "hello");
    assert_eq!(events[1]["done"], true);
}

#[tokio::test]
async fn upstream_error_fails_the_job_and_queue_advances() {
    let h = harness(|_| {}).await;
    mount_tags(&h.server, &["qwen3:4b", "qwen3:8b"]).await;
    mount_ps(&h.server, &[]).await;

    // qwen3:8b explodes; qwen3:4b works.
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .and(wiremock::matchers::body_partial_json(
            serde_json::json!({ "model": "qwen3:8b" }),
        ))
        .respond_with(ResponseTemplate::new(500).set_body_raw("model exploded", "text/plain"))
        .mount(&h.server)
        .await;
    mount_generate_for_ok(&h.server, "qwen3:4b", &["fine"]).await;

    let broken = h
        .engine
        .enqueue(
            "conv",
            JobKind::Chat,
            chat("hi", false),
            EnqueueOptions {
                model: Some("qwen3-8b".to_string()),
                ..EnqueueOptions::default()
            },
        )
        .unwrap();
    let healthy = h
        .engine
        .enqueue("conv", JobKind::Chat, chat("hi", false), model_opts())
        .unwrap();

    let log = EventLog::new();
    let _sub = h.engine.subscribe(broken.job_id, log.callback()).unwrap();

    assert_eq!(
        common::wait_job_terminal(&h.store, broken.job_id, Duration::from_secs(10)).await,
        JobStatus::Error
    );
    assert_eq!(
        common::wait_job_terminal(&h.store, healthy.job_id, Duration::from_secs(10)).await,
        JobStatus::Completed
    );

    log.wait_terminal(Duration::from_secs(2)).await;
    let terminal = log.snapshot().into_iter().next_back().unwrap();
    assert_eq!(terminal["done"], true);
    assert!(terminal["error"].as_str().unwrap().contains("500"));

    let job = h.store.job(broken.job_id).unwrap().unwrap();
    assert!(job.error_message.is_some());
}

async fn mount_generate_for_ok(server: &MockServer, external: &str, tokens: &[&str]) {
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .and(wiremock::matchers::body_partial_json(
            serde_json::json!({ "model": external }),
        ))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(ndjson(tokens, external), "application/x-ndjson"),
        )
        .mount(server)
        .await;
}
