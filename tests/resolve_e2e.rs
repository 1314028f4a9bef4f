use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use residue_events::gateway::{ChatRequest, ChatResponse, ProviderError};
use residue_events::model::{GeneratedArtifact, NodeInfo, PlayerProfile, MAX_CHOICES, MIN_CHOICES};
use residue_events::orchestrator::GenerationError;
use residue_events::store::GenerationTrace;
use residue_events::{
    App, ArtifactStore, ChatGateway, ConditionKey, GeneratorConfig, InspirationMode,
    InspirationStore, Orchestrator, ResidueConfig, ResolveError, ResolveRequest, Resolver,
    SqliteStore, StoreError,
};
use serde_json::{json, Value};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

const RESEARCH: &str = "research";
const PLOT: &str = "plot";
const WRITER: &str = "writer";
const REVIEW: &str = "review";

fn completion(content: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "choices": [{ "message": { "content": content }, "finish_reason": "stop" }],
        "usage": { "prompt_tokens": 100, "completion_tokens": 50 }
    }))
}

fn server_error() -> ResponseTemplate {
    ResponseTemplate::new(500).set_body_json(json!({
        "error": { "message": "upstream exploded", "code": "internal" }
    }))
}

fn research_output() -> String {
    json!([
        {
            "title": "The Bell of Awakening",
            "summary": "A bell that wakes the dead each time it rings.",
            "usable_elements": ["bell", "waking dead"]
        },
        {
            "title": "Drowned Chapel",
            "summary": "A chapel that floods a little more each cycle.",
            "usable_elements": ["rising water"]
        }
    ])
    .to_string()
}

fn writer_output() -> String {
    writer_output_with_text("A cracked bell hangs above the altar. It is still swinging.")
}

fn writer_output_with_text(text: &str) -> String {
    json!({
        "text": text,
        "choices": [
            {
                "label": "Ring the bell",
                "tags": ["bold", "curious", "bold", "not_a_tag"],
                "effect": { "kind": "damage", "magnitude": 40 },
                "result_text": "Something under the floor answers.",
                "sets_flag": "Rang The Bell"
            },
            {
                "label": "Steady the bell and pray",
                "tags": ["pious"],
                "effect": { "type": "heal", "value": 3 },
                "result_text": "The swinging stops. You feel lighter."
            }
        ]
    })
    .to_string()
}

fn review_output(score: f64) -> String {
    json!({ "quality_score": score, "feedback": "fine" }).to_string()
}

/// Routes each call by the role named in its system message and replays the
/// configured outputs for that stage (the last one repeats).
#[derive(Clone, Default)]
struct StageResponder {
    research: Option<String>,
    plot: Vec<String>,
    writer: Vec<String>,
    review: Vec<String>,
    calls: Arc<Mutex<HashMap<&'static str, usize>>>,
    user_prompts: Arc<Mutex<Vec<(&'static str, String)>>>,
}

impl StageResponder {
    fn happy() -> Self {
        Self {
            research: Some(research_output()),
            plot: vec!["A bell tolls from a shrine no one tends.".to_string()],
            writer: vec![writer_output()],
            review: vec![review_output(0.85)],
            ..Default::default()
        }
    }

    fn count(&self, stage: &str) -> usize {
        self.calls.lock().unwrap().get(stage).copied().unwrap_or(0)
    }

    fn prompts(&self, stage: &str) -> Vec<String> {
        self.user_prompts
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| *s == stage)
            .map(|(_, p)| p.clone())
            .collect()
    }

    fn stage_of(system: &str) -> &'static str {
        if system.contains("quality reviewer") {
            REVIEW
        } else if system.contains("event writer") {
            WRITER
        } else if system.contains("story director") {
            PLOT
        } else {
            RESEARCH
        }
    }

    fn replay(outputs: &[String], n: usize) -> ResponseTemplate {
        match outputs.get(n).or(outputs.last()) {
            Some(content) => completion(content),
            None => server_error(),
        }
    }
}

impl Respond for StageResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: Value = serde_json::from_slice(&request.body).unwrap();
        let system = body["messages"][0]["content"].as_str().unwrap_or_default();
        let user = body["messages"][1]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let stage = Self::stage_of(system);

        let n = {
            let mut calls = self.calls.lock().unwrap();
            let entry = calls.entry(stage).or_insert(0);
            *entry += 1;
            *entry - 1
        };
        self.user_prompts.lock().unwrap().push((stage, user));

        match stage {
            RESEARCH => match &self.research {
                Some(content) => completion(content),
                None => server_error(),
            },
            PLOT => Self::replay(&self.plot, n),
            WRITER => Self::replay(&self.writer, n),
            _ => Self::replay(&self.review, n),
        }
    }
}

struct Harness {
    server: MockServer,
    app: App,
    _dir: TempDir,
}

impl Harness {
    async fn start(responder: StageResponder, tweak: impl FnOnce(&mut ResidueConfig)) -> Self {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(responder)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let mut config = ResidueConfig {
            api_key: Some("sk-test".into()),
            model_endpoint: server.uri(),
            store_path: dir.path().join("events.sqlite"),
            inspiration_mode: InspirationMode::Off,
            ..ResidueConfig::default()
        };
        tweak(&mut config);

        let store = Arc::new(SqliteStore::new(&config.store_path).unwrap());
        let app = App::with_store(config, store).unwrap();
        Self {
            server,
            app,
            _dir: dir,
        }
    }

    async fn requests(&self) -> usize {
        self.server.received_requests().await.unwrap().len()
    }
}

fn shrine_request() -> ResolveRequest {
    ResolveRequest::new("medieval", "shrine_01")
        .player("p1")
        .truth_stage(0)
        .traits(&["cautious", "pious"])
}

#[tokio::test]
async fn cold_then_warm_resolve_serves_the_same_event() {
    let responder = StageResponder::happy();
    let h = Harness::start(responder.clone(), |c| {
        c.inspiration_mode = InspirationMode::Inline;
    })
    .await;

    h.app
        .store
        .upsert_node(&NodeInfo {
            world_id: "medieval".into(),
            node_id: "shrine_01".into(),
            name: "Forgotten Shrine".into(),
            description: "A roadside shrine whose bell rings on its own.".into(),
        })
        .await
        .unwrap();
    h.app
        .store
        .upsert_profile(&PlayerProfile {
            player_id: "p1".into(),
            play_style: Some("explorer".into()),
            total_runs: 7,
        })
        .await
        .unwrap();

    let req = shrine_request();
    let first = h.app.resolver.resolve(&req, None).await.unwrap();
    assert!(!first.cached);
    assert!(first.gen_event_id.starts_with("ge_"));
    assert_eq!(first.gen_event_id.len(), 3 + 16);
    assert_eq!(first.generated_by, "google/gemini-2.5-flash");
    assert_eq!(first.locale, "en");
    assert!((first.quality_score - 0.85).abs() < 1e-9);

    assert!((MIN_CHOICES..=MAX_CHOICES).contains(&first.choices.len()));
    for choice in &first.choices {
        assert!((5..=20).contains(&choice.effect.magnitude));
    }
    let ring = &first.choices[0];
    assert_eq!(ring.effect.magnitude, 20);
    assert_eq!(ring.tags.len(), 2);
    assert_eq!(ring.sets_flag.as_deref(), Some("rang_the_bell"));
    assert_eq!(first.choices[1].effect.magnitude, 5);

    let plot_prompt = responder.prompts(PLOT).remove(0);
    assert!(plot_prompt.contains("Forgotten Shrine"));
    assert!(plot_prompt.contains("The Bell of Awakening"));
    assert!(plot_prompt.contains("explorer"));
    assert!(plot_prompt.contains("late"));

    let second = h.app.resolver.resolve(&req, None).await.unwrap();
    assert!(second.cached);
    assert_eq!(second.gen_event_id, first.gen_event_id);
    assert_eq!(second.text, first.text);

    let stored = h.app.store.get_artifact(&first.gen_event_id).await.unwrap();
    assert_eq!(stored.usage_count, 1);
    assert_eq!(stored.layer, "L2_detail");
    assert_eq!(
        stored.condition_key.as_str(),
        "medieval:shrine_01:ts0:t_cautious:f_"
    );

    assert_eq!(responder.count(RESEARCH), 1);
    assert_eq!(responder.count(PLOT), 1);
    assert_eq!(responder.count(WRITER), 1);
    assert_eq!(responder.count(REVIEW), 1);
    assert_eq!(h.requests().await, 4);

    // Every model call lands in the usage ledger.
    assert!(h.app.store.artifact_stats().await.unwrap().spend_today_usd > 0.0);
}

#[tokio::test]
async fn flag_order_does_not_split_the_cache() {
    let responder = StageResponder::happy();
    let h = Harness::start(responder.clone(), |_| {}).await;

    let a = ResolveRequest::new("future", "lab_03").flags(&["met_clone", "ate_ration"]);
    let b = ResolveRequest::new("future", "lab_03").flags(&["ate_ration", "met_clone"]);

    let first = h.app.resolver.resolve(&a, None).await.unwrap();
    let second = h.app.resolver.resolve(&b, None).await.unwrap();
    assert!(!first.cached);
    assert!(second.cached);
    assert_eq!(first.gen_event_id, second.gen_event_id);
    assert_eq!(responder.count(WRITER), 1);
}

#[tokio::test]
async fn unparseable_writer_output_exhausts_three_attempts() {
    let responder = StageResponder {
        writer: vec!["The bell rings. (no JSON here)".to_string()],
        ..StageResponder::happy()
    };
    let h = Harness::start(responder.clone(), |_| {}).await;

    let req = shrine_request();
    let err = h.app.resolver.resolve(&req, None).await.unwrap_err();
    assert_eq!(err.status_code(), 500);
    match err {
        ResolveError::Generation(GenerationError::Exhausted { attempts, .. }) => {
            assert_eq!(attempts, 3)
        }
        other => panic!("expected exhausted generation, got {other:?}"),
    }

    assert_eq!(responder.count(PLOT), 3);
    assert_eq!(responder.count(WRITER), 3);
    assert_eq!(responder.count(REVIEW), 0);
    assert_eq!(h.app.store.artifact_stats().await.unwrap().total, 0);

    let traces = h.app.store.traces_for(&req.condition_key()).await.unwrap();
    assert_eq!(traces.len(), 6);
    assert!(traces.iter().all(|t| t.attempt >= 1 && t.attempt <= 3));
}

#[tokio::test]
async fn low_scores_still_persist_the_final_attempt() {
    let responder = StageResponder {
        review: vec![review_output(0.5)],
        ..StageResponder::happy()
    };
    let responder = StageResponder {
        writer: vec![
            writer_output_with_text("The bell is silent."),
            writer_output_with_text("The bell hums once."),
            writer_output_with_text("The bell rings for the third time."),
        ],
        ..responder
    };
    let h = Harness::start(responder.clone(), |_| {}).await;

    let req = shrine_request();
    let event = h.app.resolver.resolve(&req, None).await.unwrap();
    assert!(!event.cached);
    assert!((event.quality_score - 0.5).abs() < 1e-9);
    assert_eq!(event.text, "The bell rings for the third time.");
    assert_eq!(responder.count(REVIEW), 3);
    assert_eq!(h.app.store.artifact_stats().await.unwrap().total, 1);

    let stored = h.app.store.find_best(&req.condition_key()).await.unwrap().unwrap();
    assert_eq!(stored.id, event.gen_event_id);
    assert_eq!(stored.text, "The bell rings for the third time.");
}

/// Serves reads from SQLite but cannot count hits.
struct HitlessStore(Arc<SqliteStore>);

#[async_trait]
impl ArtifactStore for HitlessStore {
    async fn find_best(&self, key: &ConditionKey) -> Result<Option<GeneratedArtifact>, StoreError> {
        self.0.find_best(key).await
    }

    async fn record_hit(&self, _artifact_id: &str) -> Result<(), StoreError> {
        Err(StoreError::Closed)
    }

    async fn insert(&self, artifact: &GeneratedArtifact) -> Result<(), StoreError> {
        self.0.insert(artifact).await
    }

    async fn record_trace(&self, trace: GenerationTrace) -> Result<(), StoreError> {
        self.0.record_trace(trace).await
    }
}

/// Fails every call; a cache hit must never reach the model.
struct OfflineGateway;

#[async_trait]
impl ChatGateway for OfflineGateway {
    async fn chat(&self, _req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        Err(ProviderError::Provider {
            provider: "offline",
            message: "no model in this test".into(),
            retryable: false,
            context: None,
        })
    }
}

#[tokio::test]
async fn failed_hit_accounting_still_serves_the_cached_event() {
    let responder = StageResponder::happy();
    let h = Harness::start(responder.clone(), |_| {}).await;
    let req = shrine_request();
    let first = h.app.resolver.resolve(&req, None).await.unwrap();

    let artifacts: Arc<dyn ArtifactStore> = Arc::new(HitlessStore(h.app.store.clone()));
    let orchestrator = Orchestrator::new(
        Arc::new(OfflineGateway),
        artifacts.clone(),
        GeneratorConfig::default(),
    );
    let resolver = Resolver::new(artifacts, h.app.store.clone(), Arc::new(orchestrator));

    let second = resolver.resolve(&req, None).await.unwrap();
    assert!(second.cached);
    assert_eq!(second.gen_event_id, first.gen_event_id);
    assert_eq!(second.text, first.text);

    let stored = h.app.store.find_best(&req.condition_key()).await.unwrap().unwrap();
    assert_eq!(stored.usage_count, 0);
}

#[tokio::test]
async fn retry_stops_at_first_passing_score() {
    let responder = StageResponder {
        review: vec![review_output(0.4), review_output(0.9)],
        ..StageResponder::happy()
    };
    let h = Harness::start(responder.clone(), |_| {}).await;

    let event = h.app.resolver.resolve(&shrine_request(), None).await.unwrap();
    assert!((event.quality_score - 0.9).abs() < 1e-9);
    assert_eq!(responder.count(WRITER), 2);
    assert_eq!(responder.count(REVIEW), 2);
}

#[tokio::test]
async fn unparseable_review_counts_as_passing_default() {
    let responder = StageResponder {
        review: vec!["looks good to me".to_string()],
        ..StageResponder::happy()
    };
    let h = Harness::start(responder.clone(), |_| {}).await;

    let event = h.app.resolver.resolve(&shrine_request(), None).await.unwrap();
    assert!((event.quality_score - 0.7).abs() < 1e-9);
    assert_eq!(responder.count(REVIEW), 1);
}

#[tokio::test]
async fn broken_last_attempt_falls_back_to_best_earlier_draft() {
    let responder = StageResponder {
        writer: vec![writer_output(), writer_output(), "{}".to_string()],
        review: vec![review_output(0.3), review_output(0.5)],
        ..StageResponder::happy()
    };
    let h = Harness::start(responder.clone(), |_| {}).await;

    let event = h.app.resolver.resolve(&shrine_request(), None).await.unwrap();
    assert!((event.quality_score - 0.5).abs() < 1e-9);
    assert_eq!(responder.count(WRITER), 3);
    assert_eq!(h.app.store.artifact_stats().await.unwrap().total, 1);
}

#[tokio::test]
async fn inspiration_failure_is_not_fatal() {
    let responder = StageResponder {
        research: None,
        ..StageResponder::happy()
    };
    let h = Harness::start(responder.clone(), |c| {
        c.inspiration_mode = InspirationMode::Inline;
    })
    .await;

    let req = shrine_request();
    let event = h.app.resolver.resolve(&req, None).await.unwrap();
    assert!(!event.cached);
    assert_eq!(responder.count(RESEARCH), 1);
    assert!(h
        .app
        .store
        .find_inspiration(&req.condition_key())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn detached_inspiration_lands_after_the_response() {
    let responder = StageResponder::happy();
    let h = Harness::start(responder.clone(), |c| {
        c.inspiration_mode = InspirationMode::Detached;
    })
    .await;

    let req = shrine_request();
    h.app.resolver.resolve(&req, None).await.unwrap();
    h.app.tasks.drain().await;

    let doc = h
        .app
        .store
        .find_inspiration(&req.condition_key())
        .await
        .unwrap()
        .expect("inspiration stored after drain");
    assert!(doc.doc_id.starts_with("insp_"));
    assert_eq!(doc.sources().len(), 2);
    assert_eq!(responder.count(RESEARCH), 1);

    // The triggering request went without.
    let plot_prompt = responder.prompts(PLOT).remove(0);
    assert!(!plot_prompt.contains("The Bell of Awakening"));
}

#[tokio::test]
async fn exhausted_budget_aborts_without_calling_the_model() {
    let h = Harness::start(StageResponder::happy(), |c| {
        c.daily_budget_usd = Some(0.0);
    })
    .await;

    let err = h
        .app
        .resolver
        .resolve(&shrine_request(), None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ResolveError::Generation(GenerationError::Provider(_))
    ));
    assert_eq!(h.requests().await, 0);
}

#[tokio::test]
async fn unknown_node_is_rejected_when_required() {
    let h = Harness::start(StageResponder::happy(), |c| {
        c.require_known_node = true;
    })
    .await;

    let err = h
        .app
        .resolver
        .resolve(&ResolveRequest::new("medieval", "nowhere"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ResolveError::UnknownNode { .. }));
    assert_eq!(err.status_code(), 404);
    assert_eq!(h.requests().await, 0);
}

#[tokio::test]
async fn cancelled_request_makes_no_calls() {
    let h = Harness::start(StageResponder::happy(), |_| {}).await;
    let cancel = AtomicBool::new(true);

    let err = h
        .app
        .resolver
        .resolve(&shrine_request(), Some(&cancel))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ResolveError::Generation(GenerationError::Cancelled)
    ));
    assert_eq!(h.requests().await, 0);
}

#[test]
fn condition_key_matches_request() {
    let req = shrine_request().flags(&["b", "a", "d", "c"]);
    assert_eq!(
        req.condition_key(),
        ConditionKey::build("medieval", "shrine_01", 0, "cautious", &["b", "a", "d"])
    );
}
