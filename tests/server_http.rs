use std::sync::Arc;

use residue_events::{server, App, InspirationMode, ResidueConfig, SqliteStore};
use serde_json::{json, Value};
use tokio::sync::oneshot;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// Answers every stage with output good enough to pass the gate.
struct AnyStage;

impl Respond for AnyStage {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: Value = serde_json::from_slice(&request.body).unwrap();
        let system = body["messages"][0]["content"].as_str().unwrap_or_default();
        let content = if system.contains("event writer") {
            json!({
                "text": "Ash falls upward in the crypt.",
                "choices": [
                    { "label": "Follow the ash", "tags": ["curious"],
                      "effect": { "kind": "gold", "magnitude": 8 }, "result_text": "A coin glints." },
                    { "label": "Seal the crypt", "tags": ["cautious"],
                      "effect": { "kind": "heal", "magnitude": 6 }, "result_text": "Silence." }
                ]
            })
            .to_string()
        } else if system.contains("quality reviewer") {
            json!({ "quality_score": 0.8 }).to_string()
        } else {
            "The crypt breathes out as you enter.".to_string()
        };
        ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "content": content }, "finish_reason": "stop" }]
        }))
    }
}

struct Running {
    base: String,
    stop: oneshot::Sender<()>,
    handle: tokio::task::JoinHandle<std::io::Result<()>>,
    _model: MockServer,
    _dir: tempfile::TempDir,
}

async fn start() -> Running {
    let model = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(AnyStage)
        .mount(&model)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let config = ResidueConfig {
        api_key: Some("sk-test".into()),
        model_endpoint: model.uri(),
        store_path: dir.path().join("events.sqlite"),
        inspiration_mode: InspirationMode::Off,
        ..ResidueConfig::default()
    };
    let store = Arc::new(SqliteStore::new(&config.store_path).unwrap());
    let app = App::with_store(config, store).unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let (stop, stopped) = oneshot::channel::<()>();
    let handle = tokio::spawn(server::serve(listener, app.resolver, app.tasks, async move {
        let _ = stopped.await;
    }));

    Running {
        base,
        stop,
        handle,
        _model: model,
        _dir: dir,
    }
}

#[tokio::test]
async fn health_reports_ok() {
    let running = start().await;

    let resp = reqwest::get(format!("{}/api/health", running.base))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert!(body["timestamp"].as_str().is_some());

    running.stop.send(()).unwrap();
    running.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn resolve_requires_world_and_node() {
    let running = start().await;

    let resp = reqwest::get(format!(
        "{}/api/v1/events/resolve?world_id=medieval",
        running.base
    ))
    .await
    .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "world_id and node_id required");

    let resp = reqwest::get(format!(
        "{}/api/v1/events/resolve?world_id=medieval&node_id=crypt_02&truth_stage=deep",
        running.base
    ))
    .await
    .unwrap();
    assert_eq!(resp.status(), 400);

    running.stop.send(()).unwrap();
    running.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn resolve_generates_then_serves_from_cache() {
    let running = start().await;
    let url = format!(
        "{}/api/v1/events/resolve?world_id=medieval&node_id=crypt_02&player_id=p9\
         &truth_stage=2&traits=curious,bold&flags=lit_torch,,met_priest",
        running.base
    );

    let first: Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
    assert_eq!(first["cached"], false);
    assert!(first["gen_event_id"].as_str().unwrap().starts_with("ge_"));
    assert_eq!(first["choices"].as_array().unwrap().len(), 2);
    assert_eq!(first["choices"][0]["effect"]["kind"], "gold");
    assert_eq!(first["generated_by"], "google/gemini-2.5-flash");

    let second: Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
    assert_eq!(second["cached"], true);
    assert_eq!(second["gen_event_id"], first["gen_event_id"]);

    running.stop.send(()).unwrap();
    running.handle.await.unwrap().unwrap();
}
