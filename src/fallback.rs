//! Cache-backed similarity search used when the vector index is unavailable.
//!
//! Scans at most `candidate_cap` skills. For each, the fallback copy of its
//! vector is read from the cache under the current index version; skills
//! with no cached vector are skipped. Results are cosine-ranked and ties are
//! broken by ascending skill id, so repeated calls return the same order.
//!
//! The candidate cap trades recall for latency: with more skills than the cap,
//! results can differ from the primary index. Responses built from this path
//! are tagged `fallback`.
//!
//! Every store and cache read is bounded by the same deadline. A read that
//! times out is treated like a miss.

use std::sync::Arc;
use std::time::Duration;

use crate::cache::{keys, KeyValueCache};
use crate::embedding::cosine_similarity;
use crate::models::{VectorMatch, VectorRecord};
use crate::skills::SkillStore;
use crate::vector_index::rank_matches;

pub struct FallbackSearch {
    cache: Arc<dyn KeyValueCache>,
    skills: SkillStore,
    candidate_cap: usize,
    timeout: Duration,
}

impl FallbackSearch {
    pub fn new(
        cache: Arc<dyn KeyValueCache>,
        skills: SkillStore,
        candidate_cap: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            cache,
            skills,
            candidate_cap,
            timeout,
        }
    }

    /// Approximate top-K over cached vectors. Never fails: store or cache
    /// errors shrink the candidate set instead.
    pub async fn search(&self, query_vec: &[f32], version: i64, top_k: usize) -> Vec<VectorMatch> {
        let listed = tokio::time::timeout(
            self.timeout,
            self.skills.list_skill_ids(self.candidate_cap as i64),
        )
        .await;
        let ids = match listed {
            Ok(Ok(ids)) => ids,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "fallback: could not list candidate ids");
                return Vec::new();
            }
            Err(_) => {
                tracing::warn!("fallback: listing candidate ids timed out");
                return Vec::new();
            }
        };

        let mut matches = Vec::with_capacity(ids.len());
        for id in ids {
            let key = keys::vector(version, id);
            let raw = match tokio::time::timeout(self.timeout, self.cache.get(&key)).await {
                Ok(Ok(Some(raw))) => raw,
                Ok(Ok(None)) => continue,
                Ok(Err(e)) => {
                    tracing::debug!(skill_id = id, error = %e, "fallback: cache read failed");
                    continue;
                }
                Err(_) => {
                    tracing::debug!(skill_id = id, "fallback: cache read timed out");
                    continue;
                }
            };
            let record: VectorRecord = match serde_json::from_str(&raw) {
                Ok(r) => r,
                Err(e) => {
                    tracing::debug!(skill_id = id, error = %e, "fallback: bad cached vector");
                    continue;
                }
            };
            matches.push(VectorMatch {
                score: cosine_similarity(query_vec, &record.values),
                id: record.id,
                metadata: record.metadata,
            });
        }

        rank_matches(matches, top_k)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::config::Config;
    use crate::models::SkillRecord;
    use crate::{db, migrate};
    use anyhow::Result;
    use async_trait::async_trait;
    use tempfile::TempDir;

    const TIMEOUT: Duration = Duration::from_millis(500);

    async fn setup(tmp: &TempDir, n: usize) -> (Arc<MemoryCache>, SkillStore) {
        let config = Config::with_db_path(tmp.path().join("fb.sqlite"));
        let pool = db::connect(&config).await.unwrap();
        migrate::migrate_pool(&pool).await.unwrap();
        let store = SkillStore::new(pool);
        for i in 0..n {
            store
                .upsert_skill(&SkillRecord {
                    id: 0,
                    skill_id: format!("s{}", i),
                    name: format!("Skill {}", i),
                    years: None,
                    level: None,
                    category: None,
                    summary: String::new(),
                    action: None,
                    effect: None,
                    outcome: None,
                    related_project: None,
                })
                .await
                .unwrap();
        }
        (Arc::new(MemoryCache::new()), store)
    }

    async fn cache_vector(cache: &MemoryCache, version: i64, skill_id: i64, values: Vec<f32>) {
        let skill = SkillRecord {
            id: skill_id,
            skill_id: format!("s{}", skill_id),
            name: format!("Skill {}", skill_id),
            years: None,
            level: None,
            category: None,
            summary: String::new(),
            action: None,
            effect: None,
            outcome: None,
            related_project: None,
        };
        let record = VectorRecord::for_skill(&skill, version, values);
        cache
            .put(
                &keys::vector(version, skill_id),
                &serde_json::to_string(&record).unwrap(),
                60,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_ranks_cached_vectors_and_skips_misses() {
        let tmp = TempDir::new().unwrap();
        let (cache, store) = setup(&tmp, 4).await;
        cache_vector(&cache, 1, 1, vec![0.0, 1.0]).await;
        cache_vector(&cache, 1, 2, vec![1.0, 0.0]).await;
        // skill 3 has no cached vector; skill 4 only under another version
        cache_vector(&cache, 2, 4, vec![1.0, 0.0]).await;

        let engine = FallbackSearch::new(cache.clone(), store, 20, TIMEOUT);
        let hits = engine.search(&[1.0, 0.0], 1, 5).await;
        let ids: Vec<i64> = hits.iter().map(|m| m.metadata.skill_id).collect();
        assert_eq!(ids, vec![2, 1]);
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_candidate_cap_bounds_the_scan() {
        let tmp = TempDir::new().unwrap();
        let (cache, store) = setup(&tmp, 3).await;
        cache_vector(&cache, 1, 1, vec![0.0, 1.0]).await;
        cache_vector(&cache, 1, 2, vec![0.0, 1.0]).await;
        cache_vector(&cache, 1, 3, vec![1.0, 0.0]).await;

        let engine = FallbackSearch::new(cache.clone(), store, 2, TIMEOUT);
        let hits = engine.search(&[1.0, 0.0], 1, 5).await;
        // skill 3 is the best match but lies beyond the cap
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|m| m.metadata.skill_id != 3));
    }

    #[tokio::test]
    async fn test_deterministic_tie_order() {
        let tmp = TempDir::new().unwrap();
        let (cache, store) = setup(&tmp, 3).await;
        for id in [3, 1, 2] {
            cache_vector(&cache, 1, id, vec![1.0, 1.0]).await;
        }
        let engine = FallbackSearch::new(cache.clone(), store, 20, TIMEOUT);
        for _ in 0..3 {
            let ids: Vec<i64> = engine
                .search(&[1.0, 1.0], 1, 3)
                .await
                .iter()
                .map(|m| m.metadata.skill_id)
                .collect();
            assert_eq!(ids, vec![1, 2, 3]);
        }
    }

    #[tokio::test]
    async fn test_empty_inputs_yield_empty_list() {
        let tmp = TempDir::new().unwrap();
        let (cache, store) = setup(&tmp, 0).await;
        let engine = FallbackSearch::new(cache, store, 20, TIMEOUT);
        assert!(engine.search(&[], 1, 5).await.is_empty());
    }

    /// Serves from `inner` but never answers reads for one key.
    struct StallingCache {
        inner: MemoryCache,
        stalled_key: String,
    }

    #[async_trait]
    impl KeyValueCache for StallingCache {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            if key == self.stalled_key {
                std::future::pending::<()>().await;
            }
            self.inner.get(key).await
        }
        async fn put(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
            self.inner.put(key, value, ttl_secs).await
        }
        async fn delete(&self, key: &str) -> Result<()> {
            self.inner.delete(key).await
        }
        async fn put_if_absent(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool> {
            self.inner.put_if_absent(key, value, ttl_secs).await
        }
        async fn increment(&self, key: &str, delta: i64, ttl_secs: u64) -> Result<i64> {
            self.inner.increment(key, delta, ttl_secs).await
        }
    }

    #[tokio::test]
    async fn test_stalled_cache_read_skips_that_candidate() {
        let tmp = TempDir::new().unwrap();
        let (_, store) = setup(&tmp, 2).await;
        let cache = StallingCache {
            inner: MemoryCache::new(),
            stalled_key: keys::vector(1, 1),
        };
        cache_vector(&cache.inner, 1, 1, vec![1.0, 0.0]).await;
        cache_vector(&cache.inner, 1, 2, vec![0.0, 1.0]).await;

        let engine = FallbackSearch::new(Arc::new(cache), store, 20, Duration::from_millis(50));
        let hits = tokio::time::timeout(Duration::from_secs(2), engine.search(&[1.0, 0.0], 1, 5))
            .await
            .expect("search must finish despite the stalled read");
        let ids: Vec<i64> = hits.iter().map(|m| m.metadata.skill_id).collect();
        assert_eq!(ids, vec![2]);
    }
}
