//! End-to-end tests against a real server on an ephemeral port, with
//! in-process fakes standing in for the embedding and LLM providers.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

use skillbot::cache::{keys, KeyValueCache, MemoryCache};
use skillbot::config::Config;
use skillbot::embedding::Embedder;
use skillbot::error::{EmbeddingError, InferenceError};
use skillbot::indexer::IndexingOrchestrator;
use skillbot::llm::{InferenceRequest, LanguageModel};
use skillbot::models::{SkillRecord, VectorRecord, SKILL_ITEM_TYPE};
use skillbot::query::QueryOrchestrator;
use skillbot::server::{build_router, AppState};
use skillbot::session::{SessionIssuer, StaticVerifier};
use skillbot::skills::SkillStore;
use skillbot::vector_index::{SqliteVectorIndex, VectorIndex};
use skillbot::{db, migrate};

struct KeywordEmbedder {
    calls: AtomicUsize,
}

#[async_trait]
impl Embedder for KeywordEmbedder {
    fn model_name(&self) -> &str {
        "keyword"
    }
    fn dims(&self) -> usize {
        3
    }
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let t = text.to_lowercase();
        Ok(if t.contains("typescript") {
            vec![1.0, 0.1, 0.0]
        } else if t.contains("rust") {
            vec![0.0, 1.0, 0.1]
        } else if t.contains("kubernetes") {
            vec![0.1, 0.0, 1.0]
        } else {
            vec![-1.0, -1.0, -1.0]
        })
    }
}

struct EchoModel {
    calls: AtomicUsize,
}

#[async_trait]
impl LanguageModel for EchoModel {
    fn model_name(&self) -> &str {
        "echo"
    }
    async fn complete(&self, request: &InferenceRequest) -> Result<String, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let first = request
            .user
            .lines()
            .nth(1)
            .unwrap_or_default()
            .to_string();
        Ok(format!("Top match: {}", first))
    }
}

struct TestServer {
    _tmp: TempDir,
    base: String,
    client: reqwest::Client,
    skills: SkillStore,
    cache: Arc<MemoryCache>,
    index: Arc<SqliteVectorIndex>,
    embedder: Arc<KeywordEmbedder>,
    llm: Arc<EchoModel>,
}

fn skill(skill_id: &str, name: &str, years: f64) -> SkillRecord {
    SkillRecord {
        id: 0,
        skill_id: skill_id.to_string(),
        name: name.to_string(),
        years: Some(years),
        level: Some("Expert".to_string()),
        category: Some("Engineering".to_string()),
        summary: format!("Shipped {} systems", name),
        action: None,
        effect: None,
        outcome: None,
        related_project: None,
    }
}

async fn start(customize: impl FnOnce(&mut Config)) -> TestServer {
    let tmp = TempDir::new().unwrap();
    let mut config = Config::with_db_path(tmp.path().join("data/skillbot.sqlite"));
    config.session.static_challenge = Some("let-me-in".to_string());
    customize(&mut config);
    let config = Arc::new(config);

    let pool = db::connect(&config).await.unwrap();
    migrate::migrate_pool(&pool).await.unwrap();
    let skills = SkillStore::new(pool.clone());
    for s in [
        skill("typescript", "TypeScript", 6.0),
        skill("rust", "Rust", 4.0),
        skill("kubernetes", "Kubernetes", 3.0),
    ] {
        skills.upsert_skill(&s).await.unwrap();
    }

    let cache = Arc::new(MemoryCache::new());
    let index = Arc::new(SqliteVectorIndex::new(pool));
    let embedder = Arc::new(KeywordEmbedder {
        calls: AtomicUsize::new(0),
    });
    let llm = Arc::new(EchoModel {
        calls: AtomicUsize::new(0),
    });

    let queries = QueryOrchestrator::new(
        config.clone(),
        skills.clone(),
        cache.clone(),
        embedder.clone(),
        index.clone(),
        llm.clone(),
    )
    .unwrap();
    let indexer = IndexingOrchestrator::new(
        config.clone(),
        skills.clone(),
        cache.clone(),
        embedder.clone(),
        index.clone(),
    );
    let sessions = SessionIssuer::new(
        "test-secret",
        config.session.ttl_secs,
        cache.clone(),
        Box::new(StaticVerifier::new(config.session.static_challenge.clone())),
    );

    let state = AppState {
        config: config.clone(),
        skills: skills.clone(),
        queries: Arc::new(queries),
        indexer: Arc::new(indexer),
        sessions: Arc::new(sessions),
        admin_token: None,
    };

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, build_router(state)).await.unwrap();
    });

    TestServer {
        _tmp: tmp,
        base: format!("http://{}", addr),
        client: reqwest::Client::new(),
        skills,
        cache,
        index,
        embedder,
        llm,
    }
}

impl TestServer {
    async fn index(&self) -> (u16, Value) {
        let resp = self
            .client
            .post(format!("{}/index", self.base))
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap())
    }

    async fn query(&self, q: &str) -> (u16, Value) {
        let resp = self
            .client
            .get(format!("{}/query", self.base))
            .query(&[("q", q)])
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap())
    }
}

#[tokio::test]
async fn test_typescript_question_ranks_typescript_first() {
    let srv = start(|_| {}).await;
    let (status, body) = srv.index().await;
    assert_eq!(status, 200);
    assert_eq!(body["success"], true);
    assert_eq!(body["version"], 1);
    assert_eq!(body["total"], 3);

    let (status, body) = srv.query("What is your experience with TypeScript?").await;
    assert_eq!(status, 200, "{}", body);
    assert_eq!(body["results"][0]["name"], "TypeScript");
    assert_eq!(body["results"][0]["years"], 6.0);
    assert_eq!(body["source"], "vector-index");
    assert_eq!(body["query"], "What is your experience with TypeScript?");
    assert!(body["assistantReply"].as_str().unwrap().contains("TypeScript"));
    assert!(body["timestamp"].as_str().unwrap().ends_with('Z'));
}

#[tokio::test]
async fn test_empty_query_is_rejected_without_external_calls() {
    let srv = start(|_| {}).await;
    let (status, body) = srv.query("").await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "bad_request");
    assert_eq!(body["error"]["message"], "query must not be empty");
    assert_eq!(srv.embedder.calls.load(Ordering::SeqCst), 0);
    assert_eq!(srv.llm.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_stored_vector_matches_its_own_record() {
    let srv = start(|_| {}).await;
    srv.index().await;

    // Record 2 (Rust): its stored vector, queried directly and through the API.
    let raw = srv.cache.get(&keys::vector(1, 2)).await.unwrap().unwrap();
    let stored: VectorRecord = serde_json::from_str(&raw).unwrap();
    let hits = srv.index.query(&stored.values, 3, Some(1)).await.unwrap();
    assert_eq!(hits[0].metadata.skill_id, 2);
    assert!((hits[0].score - 1.0).abs() < 1e-5);

    let (status, body) = srv.query("rust please").await;
    assert_eq!(status, 200);
    assert_eq!(body["results"][0]["id"], "rust");
    let sim = body["results"][0]["similarity"].as_f64().unwrap();
    assert!((sim - 1.0).abs() < 1e-5, "similarity {}", sim);
}

#[tokio::test]
async fn test_index_while_locked_is_conflict() {
    let srv = start(|_| {}).await;
    srv.cache
        .put(&keys::index_lock(SKILL_ITEM_TYPE), "another-run", 600)
        .await
        .unwrap();

    let (status, body) = srv.index().await;
    assert_eq!(status, 409);
    assert_eq!(body["error"]["code"], "lock_held");
    assert!(srv.skills.latest_index(SKILL_ITEM_TYPE).await.unwrap().is_none());
    assert_eq!(srv.embedder.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_post_query_with_json_body_and_cache_hit() {
    let srv = start(|_| {}).await;
    srv.index().await;

    let post = |q: &'static str| {
        srv.client
            .post(format!("{}/query", srv.base))
            .json(&serde_json::json!({ "query": q }))
            .send()
    };
    let first: Value = post("kubernetes rollouts").await.unwrap().json().await.unwrap();
    assert_eq!(first["source"], "vector-index");

    // The cache write is fire-and-forget; wait for it.
    let key = keys::query("kubernetes rollouts");
    for _ in 0..50 {
        if srv.cache.get(&key).await.unwrap().is_some() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    let second: Value = post("Kubernetes Rollouts").await.unwrap().json().await.unwrap();
    assert_eq!(second["source"], "cache");
    assert_eq!(second["results"], first["results"]);
    assert_eq!(srv.llm.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_outside_active_hours() {
    let srv = start(|c| {
        c.schedule.enabled = true;
        // A window that is never open.
        c.schedule.weekdays = vec![];
    })
    .await;
    let (status, body) = srv.query("rust experience").await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "outside_active_hours");
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("09:00-17:00"));
}

#[tokio::test]
async fn test_health_reports_last_index() {
    let srv = start(|_| {}).await;
    let body: Value = srv
        .client
        .get(format!("{}/health", srv.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["db"], "connected");
    assert_eq!(body["skills"], 3);
    assert!(body["last_index"].is_null());

    srv.index().await;
    let body: Value = srv
        .client
        .get(format!("{}/health", srv.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["last_index"]["version"], 1);
    assert_eq!(body["last_index"]["status"], "completed");
}

#[tokio::test]
async fn test_session_required_for_query() {
    let srv = start(|c| c.session.required = true).await;
    srv.index().await;

    let (status, body) = srv.query("rust experience").await;
    assert_eq!(status, 401);
    assert_eq!(body["error"]["code"], "unauthorized");

    let bad = srv
        .client
        .post(format!("{}/session", srv.base))
        .json(&serde_json::json!({ "challenge": "wrong" }))
        .send()
        .await
        .unwrap();
    assert_eq!(bad.status().as_u16(), 401);

    let session: Value = srv
        .client
        .post(format!("{}/session", srv.base))
        .json(&serde_json::json!({ "challenge": "let-me-in" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let token = session["token"].as_str().unwrap();
    assert!(session["expiresAt"].as_str().is_some());

    let resp = srv
        .client
        .get(format!("{}/query", srv.base))
        .query(&[("q", "rust experience")])
        .bearer_auth(token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
}
