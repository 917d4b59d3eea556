//! Query pipeline.
//!
//! ```text
//! validate ─▶ schedule gate ─▶ cache lookup ──hit──▶ respond
//!                                   │ miss
//!                                   ▼
//!        quota ─▶ embed ─▶ vector search ──error──▶ fallback scan
//!                                   │                    │
//!                                   ▼                    ▼
//!              hydrate ─▶ project filter ─▶ prompt ─▶ infer ─▶ clean
//!                                                              │
//!                                              cache store ◀───┴──▶ respond
//! ```
//!
//! Every collaborator is injected, so the orchestrator can run against fakes.
//! Each external call is bounded by `retrieval.timeout_ms`. Cache reads and
//! the quota counter fail open on timeout; store reads fail the request.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use crate::cache::{keys, KeyValueCache};
use crate::config::Config;
use crate::embedding::Embedder;
use crate::error::{EmbeddingError, QueryError};
use crate::fallback::FallbackSearch;
use crate::llm::{InferenceRequest, LanguageModel};
use crate::models::{
    format_ts_iso, QueryResponse, ResponseSource, SkillMatch, SkillRecord, VectorMatch,
    SKILL_ITEM_TYPE,
};
use crate::projects::ProjectMatcher;
use crate::prompt::{build_prompt, clean_reply};
use crate::quota::{QuotaCounter, QuotaDecision};
use crate::schedule::ScheduleGate;
use crate::skills::SkillStore;
use crate::validate::validate_query;
use crate::vector_index::{rank_matches, VectorIndex};

/// Per-request inputs that are not part of the query text.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext<'a> {
    pub now: DateTime<Utc>,
    /// Value of the operator bypass header, if sent.
    pub bypass: Option<&'a str>,
}

impl RequestContext<'_> {
    pub fn now() -> Self {
        Self {
            now: Utc::now(),
            bypass: None,
        }
    }
}

pub struct QueryOrchestrator {
    config: Arc<Config>,
    skills: SkillStore,
    cache: Arc<dyn KeyValueCache>,
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    llm: Arc<dyn LanguageModel>,
    gate: ScheduleGate,
    quota: QuotaCounter,
    projects: ProjectMatcher,
    fallback: FallbackSearch,
}

impl QueryOrchestrator {
    pub fn new(
        config: Arc<Config>,
        skills: SkillStore,
        cache: Arc<dyn KeyValueCache>,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        llm: Arc<dyn LanguageModel>,
    ) -> anyhow::Result<Self> {
        let gate = ScheduleGate::from_config(&config.schedule)?;
        let quota = QuotaCounter::new(cache.clone(), config.quota.daily_limit, gate.offset());
        let projects = ProjectMatcher::new(&config.projects);
        let fallback = FallbackSearch::new(
            cache.clone(),
            skills.clone(),
            config.retrieval.fallback_candidates,
            Duration::from_millis(config.retrieval.timeout_ms),
        );
        Ok(Self {
            config,
            skills,
            cache,
            embedder,
            index,
            llm,
            gate,
            quota,
            projects,
            fallback,
        })
    }

    /// Replaces the schedule gate built from config.
    pub fn with_gate(mut self, gate: ScheduleGate) -> Self {
        self.gate = gate;
        self
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.retrieval.timeout_ms)
    }

    /// Runs the pipeline. The cache write of a fresh answer continues in the
    /// background after this returns.
    pub async fn answer(
        &self,
        raw: &str,
        ctx: RequestContext<'_>,
    ) -> Result<QueryResponse, QueryError> {
        self.run(raw, ctx).await.map(|(response, _)| response)
    }

    /// Like [`answer`](Self::answer), but waits for the cache write. For
    /// one-shot callers such as the CLI that exit right after answering.
    pub async fn answer_and_flush(
        &self,
        raw: &str,
        ctx: RequestContext<'_>,
    ) -> Result<QueryResponse, QueryError> {
        let (response, store) = self.run(raw, ctx).await?;
        if let Some(handle) = store {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "query cache write task failed");
            }
        }
        Ok(response)
    }

    async fn run(
        &self,
        raw: &str,
        ctx: RequestContext<'_>,
    ) -> Result<(QueryResponse, Option<JoinHandle<()>>), QueryError> {
        let started = Instant::now();
        let query = validate_query(raw, &self.config.validation)?;
        self.gate.check(ctx.now, ctx.bypass)?;

        let cache_key = keys::query(&query);
        if let Some(mut cached) = self.cached_response(&cache_key).await {
            cached.query = query;
            cached.source = ResponseSource::Cache;
            cached.timestamp = format_ts_iso(ctx.now.timestamp());
            tracing::info!(
                source = "cache",
                elapsed_ms = started.elapsed().as_millis() as u64,
                "query answered"
            );
            return Ok((cached, None));
        }

        if let QuotaDecision::Exhausted { limit } = self.consume_quota(ctx.now).await {
            return Err(QueryError::QuotaExhausted { limit });
        }

        let query_vec = self.embed_with_retry(&query).await?;
        let version = self
            .store_read("current index version", self.skills.current_version(SKILL_ITEM_TYPE))
            .await?;
        let (matches, source) = self.search(&query_vec, version).await?;

        let min = self.config.retrieval.min_similarity;
        let matches: Vec<VectorMatch> = matches
            .into_iter()
            .filter(|m| m.score >= min)
            .filter(|m| version.map_or(true, |v| m.metadata.version == v))
            .collect();
        let matches = rank_matches(matches, self.config.retrieval.top_k);

        let mut records = self.hydrate(&matches).await?;
        let project = self.projects.detect(&query);
        if let Some(p) = project {
            let before = records.len();
            let (scored, plain): (Vec<_>, Vec<_>) =
                records.into_iter().map(|(r, s)| ((r.id, s), r)).unzip();
            let scores: HashMap<i64, f32> = scored.into_iter().collect();
            records = self
                .projects
                .filter(p, plain)
                .into_iter()
                .map(|r| {
                    let s = scores.get(&r.id).copied().unwrap_or_default();
                    (r, s)
                })
                .collect();
            tracing::debug!(project = p, before, after = records.len(), "project filter");
        }

        if records.is_empty() {
            tracing::info!(source = source.as_str(), ?version, "no match above threshold");
            let response = QueryResponse {
                query,
                results: Vec::new(),
                assistant_reply: Some(self.config.reply.no_match_reply.clone()),
                source,
                degraded: false,
                timestamp: format_ts_iso(ctx.now.timestamp()),
            };
            return Ok((response, None));
        }

        let skill_records: Vec<SkillRecord> = records.iter().map(|(r, _)| r.clone()).collect();
        let (assistant_reply, degraded) = self.infer(&query, &skill_records, project).await;

        let response = QueryResponse {
            query,
            results: records
                .into_iter()
                .map(|(r, similarity)| SkillMatch {
                    id: r.skill_id,
                    name: r.name,
                    similarity,
                    years: r.years,
                    level: r.level,
                    category: r.category,
                })
                .collect(),
            assistant_reply,
            source,
            degraded,
            timestamp: format_ts_iso(ctx.now.timestamp()),
        };

        let store = if degraded {
            None
        } else {
            self.store_in_background(cache_key, &response)
        };

        tracing::info!(
            source = source.as_str(),
            ?version,
            results = response.results.len(),
            degraded,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "query answered"
        );
        Ok((response, store))
    }

    async fn cached_response(&self, key: &str) -> Option<QueryResponse> {
        let raw = match self.bounded(self.cache.get(key)).await {
            Some(Ok(Some(raw))) => raw,
            Some(Ok(None)) => return None,
            Some(Err(e)) => {
                tracing::warn!(error = %e, "query cache read failed; treating as miss");
                return None;
            }
            None => {
                tracing::warn!("query cache read timed out; treating as miss");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(resp) => Some(resp),
            Err(e) => {
                tracing::warn!(error = %e, "discarding unreadable cached response");
                None
            }
        }
    }

    /// Fails open: a counter that errors or stalls lets the request through.
    async fn consume_quota(&self, now: DateTime<Utc>) -> QuotaDecision {
        match self.bounded(self.quota.try_consume(now)).await {
            Some(Ok(decision)) => decision,
            Some(Err(e)) => {
                tracing::warn!(error = %e, "quota counter failed; allowing request");
                QuotaDecision::Allowed { used: 0 }
            }
            None => {
                tracing::warn!("quota counter timed out; allowing request");
                QuotaDecision::Allowed { used: 0 }
            }
        }
    }

    /// A relational read under the retrieval deadline.
    async fn store_read<T>(
        &self,
        what: &str,
        fut: impl Future<Output = anyhow::Result<T>>,
    ) -> Result<T, QueryError> {
        match self.bounded(fut).await {
            Some(result) => Ok(result?),
            None => Err(QueryError::Internal(anyhow::anyhow!("{} timed out", what))),
        }
    }

    async fn embed_with_retry(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut attempt = 1;
        loop {
            let result = self
                .bounded(self.embedder.embed(text))
                .await
                .unwrap_or(Err(EmbeddingError::Timeout));
            match result {
                Ok(v) => return Ok(v),
                Err(e @ (EmbeddingError::Disabled | EmbeddingError::Dimension { .. })) => {
                    return Err(e)
                }
                Err(e) if attempt < 2 => {
                    tracing::warn!(error = %e, "embedding failed; retrying once");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Primary index first; the cache-backed scan when it errors or times out.
    async fn search(
        &self,
        query_vec: &[f32],
        version: Option<i64>,
    ) -> Result<(Vec<VectorMatch>, ResponseSource), QueryError> {
        let top_k = self.config.retrieval.top_k;
        let reason = match self.bounded(self.index.query(query_vec, top_k, version)).await {
            Some(Ok(matches)) => return Ok((matches, ResponseSource::VectorIndex)),
            Some(Err(e)) => e.to_string(),
            None => "vector index query timed out".to_string(),
        };
        tracing::warn!(reason = %reason, "vector index unavailable; using fallback");

        let matches = match version {
            Some(v) => self.fallback.search(query_vec, v, top_k).await,
            None => Vec::new(),
        };
        if matches.is_empty() {
            return Err(QueryError::Retrieval(reason));
        }
        Ok((matches, ResponseSource::Fallback))
    }

    /// Loads records for `matches`, keeping their order. Matches whose record
    /// no longer exists are dropped.
    async fn hydrate(
        &self,
        matches: &[VectorMatch],
    ) -> Result<Vec<(SkillRecord, f32)>, QueryError> {
        let ids: Vec<i64> = matches.iter().map(|m| m.metadata.skill_id).collect();
        let records = self.store_read("skill hydration", self.skills.get_skills(&ids)).await?;
        let mut by_id: HashMap<i64, SkillRecord> =
            records.into_iter().map(|r| (r.id, r)).collect();
        Ok(matches
            .iter()
            .filter_map(|m| by_id.remove(&m.metadata.skill_id).map(|r| (r, m.score)))
            .collect())
    }

    /// Returns `(reply, degraded)`. Inference failure never fails the request.
    async fn infer(
        &self,
        query: &str,
        records: &[SkillRecord],
        project: Option<&str>,
    ) -> (Option<String>, bool) {
        let request =
            InferenceRequest::from_prompt(build_prompt(query, records, project), &self.config.llm);
        let outcome = match self.bounded(self.llm.complete(&request)).await {
            Some(r) => r.map_err(|e| e.to_string()),
            None => Err("llm timed out".to_string()),
        };
        match outcome {
            Ok(text) => {
                let reply = clean_reply(&text, &self.config.reply.filler_phrases)
                    .unwrap_or_else(|| self.config.reply.fallback_reply.clone());
                (Some(reply), false)
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    model = self.llm.model_name(),
                    "inference failed; responding degraded"
                );
                (None, true)
            }
        }
    }

    /// Spawned so a dropped request does not cancel the write.
    fn store_in_background(&self, key: String, response: &QueryResponse) -> Option<JoinHandle<()>> {
        let payload = match serde_json::to_string(response) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "could not serialize response for caching");
                return None;
            }
        };
        let cache = self.cache.clone();
        let ttl = self.config.cache.query_ttl_secs;
        let timeout = self.timeout();
        Some(tokio::spawn(async move {
            match tokio::time::timeout(timeout, cache.put(&key, &payload, ttl)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "query cache write failed"),
                Err(_) => tracing::warn!("query cache write timed out"),
            }
        }))
    }

    /// `None` when the call outlives `retrieval.timeout_ms`.
    async fn bounded<F: Future>(&self, fut: F) -> Option<F::Output> {
        tokio::time::timeout(self.timeout(), fut).await.ok()
    }
}
