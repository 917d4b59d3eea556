//! Vector index clients.
//!
//! The [`VectorIndex`] trait is the seam between the query pipeline and
//! whatever answers top-K similarity queries:
//!
//! - **[`SqliteVectorIndex`]**: vectors stored as BLOBs in `vector_records`,
//!   scored by brute-force cosine similarity. Fine for a corpus of tens of skills.
//! - **[`VectorizeIndex`]**: a hosted index with a Cloudflare Vectorize-style
//!   REST API (`/query`, `/upsert`, index info at the base URL).
//!
//! Any backend failure or timeout is reported as
//! [`VectorIndexError::Unavailable`], which the query pipeline answers by
//! switching to the cache-backed fallback.

use anyhow::{bail, Result};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use std::time::Duration;

use crate::config::VectorIndexConfig;
use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::VectorIndexError;
use crate::models::{VectorMatch, VectorMetadata, VectorRecord};

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Top-K matches ordered by descending similarity. When `version` is set,
    /// only records produced by that index version are considered.
    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        version: Option<i64>,
    ) -> Result<Vec<VectorMatch>, VectorIndexError>;

    /// Inserts or replaces records by id.
    async fn upsert(&self, records: &[VectorRecord]) -> Result<(), VectorIndexError>;

    /// Cheap liveness probe.
    async fn health(&self) -> bool;

    /// Removes records from index versions older than `keep_from` and returns
    /// how many went. Indexes that cannot enumerate by version keep everything.
    async fn prune_before(&self, keep_from: i64) -> Result<u64, VectorIndexError> {
        let _ = keep_from;
        Ok(0)
    }
}

/// Sorts by score descending, then id ascending, and keeps the first `top_k`.
pub fn rank_matches(mut matches: Vec<VectorMatch>, top_k: usize) -> Vec<VectorMatch> {
    matches.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.metadata.skill_id.cmp(&b.metadata.skill_id))
            .then(a.id.cmp(&b.id))
    });
    matches.truncate(top_k);
    matches
}

// ============ SQLite ============

pub struct SqliteVectorIndex {
    pool: SqlitePool,
}

impl SqliteVectorIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn unavailable(e: impl std::fmt::Display) -> VectorIndexError {
    VectorIndexError::Unavailable(e.to_string())
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        version: Option<i64>,
    ) -> Result<Vec<VectorMatch>, VectorIndexError> {
        let rows = match version {
            Some(v) => {
                sqlx::query(
                    "SELECT id, skill_id, version, name, embedding FROM vector_records WHERE version = ?",
                )
                .bind(v)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query("SELECT id, skill_id, version, name, embedding FROM vector_records")
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(unavailable)?;

        let matches: Vec<VectorMatch> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                VectorMatch {
                    id: row.get("id"),
                    score: cosine_similarity(vector, &blob_to_vec(&blob)),
                    metadata: VectorMetadata {
                        skill_id: row.get("skill_id"),
                        version: row.get("version"),
                        name: row.get("name"),
                    },
                }
            })
            .collect();

        Ok(rank_matches(matches, top_k))
    }

    async fn upsert(&self, records: &[VectorRecord]) -> Result<(), VectorIndexError> {
        let mut tx = self.pool.begin().await.map_err(unavailable)?;
        for record in records {
            sqlx::query(
                r#"
                INSERT INTO vector_records (id, skill_id, version, name, embedding)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    skill_id = excluded.skill_id,
                    version = excluded.version,
                    name = excluded.name,
                    embedding = excluded.embedding
                "#,
            )
            .bind(&record.id)
            .bind(record.metadata.skill_id)
            .bind(record.metadata.version)
            .bind(&record.metadata.name)
            .bind(vec_to_blob(&record.values))
            .execute(&mut *tx)
            .await
            .map_err(unavailable)?;
        }
        tx.commit().await.map_err(unavailable)?;
        Ok(())
    }

    async fn health(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    async fn prune_before(&self, keep_from: i64) -> Result<u64, VectorIndexError> {
        let result = sqlx::query("DELETE FROM vector_records WHERE version < ?")
            .bind(keep_from)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(result.rows_affected())
    }
}

// ============ Hosted (Vectorize) ============

/// Client for a hosted index exposing Vectorize-style endpoints.
///
/// - `POST {url}/query` with `{vector, topK, returnMetadata, filter}`
/// - `POST {url}/upsert` with an NDJSON body of `{id, values, metadata}`
/// - `GET {url}` for index info (used as the health probe)
pub struct VectorizeIndex {
    client: reqwest::Client,
    url: String,
    token: String,
}

impl VectorizeIndex {
    pub fn new(config: &VectorIndexConfig) -> Result<Self> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| anyhow::anyhow!("vector_index.url required for vectorize backend"))?;
        let token = std::env::var(&config.token_env).map_err(|_| {
            anyhow::anyhow!("{} environment variable not set", config.token_env)
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            url: url.trim_end_matches('/').to_string(),
            token,
        })
    }
}

#[async_trait]
impl VectorIndex for VectorizeIndex {
    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        version: Option<i64>,
    ) -> Result<Vec<VectorMatch>, VectorIndexError> {
        let mut body = serde_json::json!({
            "vector": vector,
            "topK": top_k,
            "returnMetadata": "all",
        });
        if let Some(v) = version {
            body["filter"] = serde_json::json!({ "version": { "$eq": v } });
        }

        let response = self
            .client
            .post(format!("{}/query", self.url))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(unavailable)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(unavailable(format!("query returned {}: {}", status, text)));
        }

        let json: serde_json::Value = response.json().await.map_err(unavailable)?;
        let matches = parse_query_response(&json).map_err(unavailable)?;
        Ok(rank_matches(matches, top_k))
    }

    async fn upsert(&self, records: &[VectorRecord]) -> Result<(), VectorIndexError> {
        if records.is_empty() {
            return Ok(());
        }
        let mut ndjson = String::new();
        for record in records {
            let line = serde_json::to_string(record).map_err(unavailable)?;
            ndjson.push_str(&line);
            ndjson.push('\n');
        }

        let response = self
            .client
            .post(format!("{}/upsert", self.url))
            .bearer_auth(&self.token)
            .header("Content-Type", "application/x-ndjson")
            .body(ndjson)
            .send()
            .await
            .map_err(unavailable)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(unavailable(format!("upsert returned {}: {}", status, text)));
        }
        Ok(())
    }

    async fn health(&self) -> bool {
        match self
            .client
            .get(&self.url)
            .bearer_auth(&self.token)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}

/// Parses `{"result": {"matches": [{id, score, metadata}]}}`.
fn parse_query_response(json: &serde_json::Value) -> Result<Vec<VectorMatch>> {
    let matches = json
        .pointer("/result/matches")
        .and_then(|m| m.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid query response: missing result.matches"))?;

    let mut out = Vec::with_capacity(matches.len());
    for m in matches {
        let parsed: VectorMatch = serde_json::from_value(m.clone())?;
        out.push(parsed);
    }
    Ok(out)
}

/// Create the configured [`VectorIndex`].
pub fn create_vector_index(
    config: &VectorIndexConfig,
    pool: SqlitePool,
) -> Result<Box<dyn VectorIndex>> {
    match config.backend.as_str() {
        "sqlite" => Ok(Box::new(SqliteVectorIndex::new(pool))),
        "vectorize" => Ok(Box::new(VectorizeIndex::new(config)?)),
        other => bail!("Unknown vector_index backend: {}", other),
    }
}
