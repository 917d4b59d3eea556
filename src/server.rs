//! HTTP server.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`/`POST` | `/query?q=...` | Run the query pipeline (`POST` also accepts `{"query": ...}`) |
//! | `POST` | `/index` | Rebuild the vector index |
//! | `GET`  | `/health` | Database status and the latest index run |
//! | `POST` | `/session` | Exchange a challenge for a session token |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `outside_active_hours` (400),
//! `unauthorized` (401), `lock_held` (409), `quota_exhausted` (429),
//! `internal` (500).
//!
//! Only validation, schedule and quota errors carry a specific message.
//! Anything else is logged and answered with a generic one.
//!
//! # Headers
//!
//! - `Authorization: Bearer <token>`: session token on `/query` when
//!   `session.required`; admin token on `/index` when `server.admin_token_env` is set.
//! - `x-bypass-token`: operator override for the schedule gate.

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::error::{IndexError, QueryError, SessionError};
use crate::indexer::IndexingOrchestrator;
use crate::models::{format_ts_iso, IndexMetadata, QueryResponse, SKILL_ITEM_TYPE};
use crate::query::{QueryOrchestrator, RequestContext};
use crate::services::Services;
use crate::session::SessionIssuer;
use crate::skills::SkillStore;

const BYPASS_HEADER: &str = "x-bypass-token";
const GENERIC_FAILURE: &str = "Something went wrong on our side. Please try again later.";

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub skills: SkillStore,
    pub queries: Arc<QueryOrchestrator>,
    pub indexer: Arc<IndexingOrchestrator>,
    pub sessions: Arc<SessionIssuer>,
    /// Bearer token required by `POST /index`, when configured.
    pub admin_token: Option<String>,
}

impl AppState {
    pub fn from_services(services: &Services) -> Self {
        let admin_token = services
            .config
            .server
            .admin_token_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|t| !t.is_empty());
        Self {
            config: services.config.clone(),
            skills: services.skills.clone(),
            queries: services.queries.clone(),
            indexer: services.indexer.clone(),
            sessions: services.sessions.clone(),
            admin_token,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/query", get(handle_query_get).post(handle_query_post))
        .route("/index", post(handle_index))
        .route("/health", get(handle_health))
        .route("/session", post(handle_session))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Binds `[server].bind` and serves until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let services = Services::build(config).await?;

    // Reads already skip expired cache rows; this only reclaims space.
    let cache = services.cache.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(3600));
        loop {
            tick.tick().await;
            match cache.purge_expired().await {
                Ok(n) if n > 0 => tracing::debug!(purged = n, "expired cache entries removed"),
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "cache purge failed"),
            }
        }
    });

    let app = build_router(AppState::from_services(&services));
    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!(addr = %config.server.bind, "skillbot listening");
    axum::serve(listener, app).await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Error type that converts into an Axum HTTP response.
#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    /// Logs `detail` and returns the opaque 500.
    fn internal(detail: impl std::fmt::Display) -> Self {
        tracing::error!(error = %detail, "request failed");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", GENERIC_FAILURE)
    }

    fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", message)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<QueryError> for AppError {
    fn from(err: QueryError) -> Self {
        if !err.is_user_facing() {
            return Self::internal(err);
        }
        let (status, code) = match err {
            QueryError::Schedule(_) => (StatusCode::BAD_REQUEST, "outside_active_hours"),
            QueryError::QuotaExhausted { .. } => (StatusCode::TOO_MANY_REQUESTS, "quota_exhausted"),
            _ => (StatusCode::BAD_REQUEST, "bad_request"),
        };
        Self::new(status, code, err.to_string())
    }
}

impl From<IndexError> for AppError {
    fn from(err: IndexError) -> Self {
        match err {
            IndexError::LockHeld(e) => Self::new(StatusCode::CONFLICT, "lock_held", e.to_string()),
            other => Self::internal(other),
        }
    }
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

// ============ /query ============

#[derive(Deserialize, Default)]
pub struct QueryParams {
    #[serde(default)]
    pub q: Option<String>,
}

#[derive(Deserialize, Default)]
struct QueryBody {
    #[serde(default)]
    query: Option<String>,
}

async fn handle_query_get(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<QueryParams>,
) -> Result<Json<QueryResponse>, AppError> {
    run_query(&state, &headers, params.q.unwrap_or_default()).await
}

async fn handle_query_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<QueryParams>,
    body: Bytes,
) -> Result<Json<QueryResponse>, AppError> {
    let text = if body.is_empty() {
        params.q.unwrap_or_default()
    } else {
        let parsed: QueryBody = serde_json::from_slice(&body).map_err(|e| {
            AppError::new(
                StatusCode::BAD_REQUEST,
                "bad_request",
                format!("invalid JSON body: {}", e),
            )
        })?;
        parsed.query.or(params.q).unwrap_or_default()
    };
    run_query(&state, &headers, text).await
}

async fn run_query(
    state: &AppState,
    headers: &HeaderMap,
    text: String,
) -> Result<Json<QueryResponse>, AppError> {
    let now = chrono::Utc::now();
    if state.config.session.required {
        let valid = bearer(headers)
            .map(|t| state.sessions.verify(t, now))
            .unwrap_or(false);
        if !valid {
            return Err(AppError::unauthorized("a valid session token is required"));
        }
    }

    let bypass = headers.get(BYPASS_HEADER).and_then(|v| v.to_str().ok());
    let response = state
        .queries
        .answer(&text, RequestContext { now, bypass })
        .await?;
    Ok(Json(response))
}

// ============ /index ============

#[derive(Serialize, Deserialize, Debug)]
pub struct IndexResponse {
    pub success: bool,
    pub version: i64,
    pub total: i64,
}

async fn handle_index(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<IndexResponse>, AppError> {
    if let Some(ref expected) = state.admin_token {
        if bearer(&headers) != Some(expected.as_str()) {
            return Err(AppError::unauthorized("admin token required"));
        }
    }
    let report = state.indexer.run().await?;
    Ok(Json(IndexResponse {
        success: true,
        version: report.version,
        total: report.total,
    }))
}

// ============ /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    db: &'static str,
    skills: i64,
    last_index: Option<IndexMetadata>,
}

async fn handle_health(State(state): State<AppState>) -> Result<Json<HealthResponse>, AppError> {
    state.skills.ping().await.map_err(AppError::internal)?;
    let skills = state.skills.count_skills().await.map_err(AppError::internal)?;
    let last_index = state
        .skills
        .latest_index(SKILL_ITEM_TYPE)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        db: "connected",
        skills,
        last_index,
    }))
}

// ============ /session ============

#[derive(Deserialize)]
struct SessionRequest {
    #[serde(default)]
    challenge: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionResponse {
    token: String,
    expires_at: String,
}

async fn handle_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SessionRequest>,
) -> Result<Json<SessionResponse>, AppError> {
    let remote_ip = headers
        .get("cf-connecting-ip")
        .or_else(|| headers.get("x-forwarded-for"))
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim);

    match state
        .sessions
        .exchange(&req.challenge, remote_ip, chrono::Utc::now())
        .await
    {
        Ok(t) => Ok(Json(SessionResponse {
            token: t.token,
            expires_at: format_ts_iso(t.expires_at),
        })),
        Err(SessionError::Rejected) | Err(SessionError::Replayed) => {
            Err(AppError::unauthorized("challenge verification failed"))
        }
        Err(SessionError::Internal(e)) => Err(AppError::internal(e)),
    }
}
