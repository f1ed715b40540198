//! Shared harness for the integration suite: an engine wired to a wiremock
//! runtime, plus event collection and polling helpers.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use relay_config::RelayConfig;
use relay_engine::{Engine, JobEvent, JobId, JobStatus};
use relay_store::Store;

pub struct Harness {
    pub server: MockServer,
    pub engine: Engine,
    pub store: Arc<Store>,
}

/// Start an engine against a fresh mock runtime. No mocks are mounted; each
/// test declares the runtime surface it needs.
pub async fn harness(tweak: impl FnOnce(&mut RelayConfig)) -> Harness {
    let server = MockServer::start().await;

    let mut config = RelayConfig::default();
    config.runtime_url = server.uri();
    config.switch_cooldown_secs = 0;
    config.batch_flush_ms = 20;
    config.readiness_interval_secs = 1;
    config.readiness_interval_cap_secs = 1;
    config.unload_check_secs = 3600;
    config.sync_interval_secs = 3600;
    tweak(&mut config);

    let store = Arc::new(Store::open_in_memory().unwrap());
    let engine = Engine::start(config, Arc::clone(&store));
    Harness {
        server,
        engine,
        store,
    }
}

/// NDJSON generate body: one line per token, then the done marker.
pub fn ndjson(tokens: &[&str], model: &str) -> String {
    let mut body = String::new();
    for token in tokens {
        body.push_str(&serde_json::json!({ "response": token, "done": false }).to_string());
        body.push('\n');
    }
    body.push_str(&serde_json::json!({ "done": true, "model": model }).to_string());
    body.push('\n');
    body
}

pub async fn mount_tags(server: &MockServer, names: &[&str]) {
    let models: Vec<_> = names
        .iter()
        .map(|name| serde_json::json!({ "name": name, "size": 1 }))
        .collect();
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({ "models": models })),
        )
        .mount(server)
        .await;
}

pub async fn mount_ps(server: &MockServer, names: &[&str]) {
    let models: Vec<_> = names
        .iter()
        .map(|name| serde_json::json!({ "name": name, "size_vram": 1_048_576 }))
        .collect();
    Mock::given(method("GET"))
        .and(path("/api/ps"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({ "models": models })),
        )
        .mount(server)
        .await;
}

/// Generate mock answering every model with the same token stream.
pub async fn mount_generate(server: &MockServer, tokens: &[&str], model: &str, delay: Duration) {
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(delay)
                .set_body_raw(ndjson(tokens, model), "application/x-ndjson"),
        )
        .mount(server)
        .await;
}

/// Generate mock for one specific external model name.
pub async fn mount_generate_for(
    server: &MockServer,
    external: &str,
    tokens: &[&str],
    delay: Duration,
) {
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .and(body_partial_json(serde_json::json!({ "model": external })))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(delay)
                .set_body_raw(ndjson(tokens, external), "application/x-ndjson"),
        )
        .mount(server)
        .await;
}

/// Collects every event a subscriber sees, as wire-shape JSON.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<serde_json::Value>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callback(&self) -> impl Fn(&JobEvent) + Send + Sync + 'static {
        let events = Arc::clone(&self.events);
        move |event: &JobEvent| {
            events
                .lock()
                .unwrap()
                .push(serde_json::to_value(event).unwrap());
        }
    }

    pub fn snapshot(&self) -> Vec<serde_json::Value> {
        self.events.lock().unwrap().clone()
    }

    pub fn saw_terminal(&self) -> bool {
        self.snapshot()
            .iter()
            .any(|event| event["done"] == serde_json::Value::Bool(true))
    }

    /// Wait until a terminal event arrives.
    pub async fn wait_terminal(&self, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        while !self.saw_terminal() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "no terminal event within {timeout:?}; saw {:?}",
                self.snapshot()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Response tokens concatenated in order.
    pub fn content(&self) -> String {
        self.snapshot()
            .iter()
            .filter(|event| event["type"] == "response")
            .map(|event| event["token"].as_str().unwrap().to_string())
            .collect()
    }
}

/// Poll the store until a job reaches a terminal status.
pub async fn wait_job_terminal(store: &Store, job_id: JobId, timeout: Duration) -> JobStatus {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let job = store.job(job_id).unwrap().expect("job exists");
        if job.status.is_terminal() {
            return job.status;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {job_id} still {:?} after {timeout:?}",
            job.status
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
