//! Batch indexing.
//!
//! One run embeds every skill record and writes the vectors under a fresh
//! index version, both to the vector index and, as fallback copies, to the
//! cache. Queries keep reading the previous completed version until the run
//! marks its own version completed.
//!
//! Runs are serialized by a lock entry in the cache. The lock carries a TTL,
//! so a crashed run cannot block indexing forever.
//!
//! After a run completes, vectors older than the previous completed version
//! are pruned from the index. The previous version stays for queries that
//! started before the switch.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cache::{keys, KeyValueCache};
use crate::config::Config;
use crate::embedding::Embedder;
use crate::error::{EmbeddingError, IndexError, LockHeldError, VectorIndexError};
use crate::models::{VectorRecord, SKILL_ITEM_TYPE};
use crate::skills::SkillStore;
use crate::vector_index::VectorIndex;

/// Summary of a completed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexReport {
    pub version: i64,
    pub total: i64,
}

pub struct IndexingOrchestrator {
    config: Arc<Config>,
    skills: SkillStore,
    cache: Arc<dyn KeyValueCache>,
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
}

impl IndexingOrchestrator {
    pub fn new(
        config: Arc<Config>,
        skills: SkillStore,
        cache: Arc<dyn KeyValueCache>,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
    ) -> Self {
        Self {
            config,
            skills,
            cache,
            embedder,
            index,
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.retrieval.timeout_ms)
    }

    /// Runs a store or cache call under the deadline; a timeout is an error.
    async fn bounded<T>(
        &self,
        what: &str,
        fut: impl Future<Output = anyhow::Result<T>>,
    ) -> Result<T, IndexError> {
        match tokio::time::timeout(self.timeout(), fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(anyhow::anyhow!("{} timed out", what).into()),
        }
    }

    /// Runs one full indexing pass. Fails fast with [`IndexError::LockHeld`]
    /// when another run owns the lock.
    pub async fn run(&self) -> Result<IndexReport, IndexError> {
        let healthy = tokio::time::timeout(self.timeout(), self.index.health())
            .await
            .unwrap_or(false);
        if !healthy {
            return Err(IndexError::Unhealthy);
        }

        let lock_key = keys::index_lock(SKILL_ITEM_TYPE);
        let owner = uuid::Uuid::new_v4().to_string();
        let acquired = self
            .bounded(
                "lock acquire",
                self.cache.put_if_absent(&lock_key, &owner, self.config.cache.lock_ttl_secs),
            )
            .await?;
        if !acquired {
            tracing::info!("indexing lock held; not starting a second run");
            return Err(LockHeldError.into());
        }

        let result = self.run_locked().await;
        self.release_lock(&lock_key, &owner).await;
        result
    }

    async fn run_locked(&self) -> Result<IndexReport, IndexError> {
        let started = Instant::now();
        let previous = self.skills.current_version(SKILL_ITEM_TYPE).await?;
        let version = self.skills.begin_index_version(SKILL_ITEM_TYPE).await?;
        tracing::info!(version, ?previous, "indexing started");

        let mut done = 0i64;
        match self.index_all(version, &mut done).await {
            Ok(()) => {
                self.skills.complete_index_version(version, done).await?;
                self.prune(previous.unwrap_or(version)).await;
                tracing::info!(
                    version,
                    total = done,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "indexing completed"
                );
                Ok(IndexReport {
                    version,
                    total: done,
                })
            }
            Err(e) => {
                tracing::error!(version, indexed = done, error = %e, "indexing failed");
                if let Err(mark) = self.skills.fail_index_version(version, done).await {
                    tracing::error!(version, error = %mark, "could not mark version failed");
                }
                Err(e)
            }
        }
    }

    async fn index_all(&self, version: i64, done: &mut i64) -> Result<(), IndexError> {
        let batch_size = self.config.indexing.batch_size as i64;
        let mut offset = 0i64;

        loop {
            let page = self
                .bounded("skill page read", self.skills.list_skills_page(offset, batch_size))
                .await?;
            if page.is_empty() {
                break;
            }

            let mut records = Vec::with_capacity(page.len());
            for skill in &page {
                let values = tokio::time::timeout(
                    self.timeout(),
                    self.embedder.embed(&skill.embedding_text()),
                )
                .await
                .unwrap_or(Err(EmbeddingError::Timeout))?;
                records.push(VectorRecord::for_skill(skill, version, values));
            }

            let upsert = async {
                match tokio::time::timeout(self.timeout(), self.index.upsert(&records)).await {
                    Ok(r) => r.map_err(IndexError::from),
                    Err(_) => Err(VectorIndexError::Unavailable("upsert timed out".into()).into()),
                }
            };
            let fallback_copies = async {
                for record in &records {
                    let payload = serde_json::to_string(record).map_err(anyhow::Error::from)?;
                    let key = keys::vector(version, record.metadata.skill_id);
                    self.bounded(
                        "fallback copy write",
                        self.cache.put(&key, &payload, self.config.cache.vector_ttl_secs),
                    )
                    .await?;
                }
                Ok::<(), IndexError>(())
            };
            tokio::try_join!(upsert, fallback_copies)?;

            *done += records.len() as i64;
            offset += page.len() as i64;
            tracing::debug!(version, indexed = *done, "batch written");
        }
        Ok(())
    }

    /// Drops index records from versions before `keep_from`. Failure only
    /// leaves extra rows behind.
    async fn prune(&self, keep_from: i64) {
        match tokio::time::timeout(self.timeout(), self.index.prune_before(keep_from)).await {
            Ok(Ok(removed)) => tracing::debug!(keep_from, removed, "pruned old vectors"),
            Ok(Err(e)) => tracing::warn!(keep_from, error = %e, "could not prune old vectors"),
            Err(_) => tracing::warn!(keep_from, "pruning old vectors timed out"),
        }
    }

    /// Deletes the lock if this run still owns it.
    async fn release_lock(&self, key: &str, owner: &str) {
        match self.bounded("lock read", self.cache.get(key)).await {
            Ok(Some(current)) if current == owner => {
                if let Err(e) = self.bounded("lock release", self.cache.delete(key)).await {
                    tracing::warn!(error = %e, "could not release indexing lock; it will expire");
                }
            }
            Ok(_) => tracing::warn!("indexing lock expired before the run finished"),
            Err(e) => tracing::warn!(error = %e, "could not read indexing lock"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::embedding::cosine_similarity;
    use crate::models::{IndexStatus, SkillRecord};
    use crate::vector_index::SqliteVectorIndex;
    use crate::{db, migrate};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    /// Deterministic letter-frequency vectors.
    struct LetterEmbedder {
        broken: AtomicBool,
    }

    impl LetterEmbedder {
        fn new() -> Self {
            Self {
                broken: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl Embedder for LetterEmbedder {
        fn model_name(&self) -> &str {
            "letters"
        }
        fn dims(&self) -> usize {
            4
        }
        async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(EmbeddingError::Request("down".into()));
            }
            let count =
                |c: char| text.chars().filter(|x| x.eq_ignore_ascii_case(&c)).count() as f32;
            Ok(vec![count('a'), count('e'), count('r'), count('t') + 1.0])
        }
    }

    struct Fixture {
        _tmp: TempDir,
        config: Arc<Config>,
        skills: SkillStore,
        cache: Arc<MemoryCache>,
        index: Arc<SqliteVectorIndex>,
    }

    async fn fixture(n: usize) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::with_db_path(tmp.path().join("idx.sqlite"));
        config.indexing.batch_size = 2;
        let pool = db::connect(&config).await.unwrap();
        migrate::migrate_pool(&pool).await.unwrap();
        let skills = SkillStore::new(pool.clone());
        let names = ["Rust", "TypeScript", "Terraform", "Kubernetes", "PostgreSQL"];
        for name in names.iter().take(n) {
            skills
                .upsert_skill(&SkillRecord {
                    id: 0,
                    skill_id: name.to_lowercase(),
                    name: name.to_string(),
                    years: Some(3.0),
                    level: None,
                    category: None,
                    summary: format!("{} work", name),
                    action: None,
                    effect: None,
                    outcome: None,
                    related_project: None,
                })
                .await
                .unwrap();
        }
        Fixture {
            _tmp: tmp,
            config: Arc::new(config),
            skills,
            cache: Arc::new(MemoryCache::new()),
            index: Arc::new(SqliteVectorIndex::new(pool)),
        }
    }

    fn indexer(f: &Fixture, embedder: Arc<LetterEmbedder>) -> IndexingOrchestrator {
        IndexingOrchestrator::new(
            f.config.clone(),
            f.skills.clone(),
            f.cache.clone(),
            embedder,
            f.index.clone(),
        )
    }

    #[tokio::test]
    async fn test_run_writes_index_and_fallback_copies() {
        let f = fixture(5).await;
        let report = indexer(&f, Arc::new(LetterEmbedder::new())).run().await.unwrap();
        assert_eq!(
            report,
            IndexReport {
                version: 1,
                total: 5
            }
        );

        let meta = f.skills.latest_index(SKILL_ITEM_TYPE).await.unwrap().unwrap();
        assert_eq!(meta.status, IndexStatus::Completed);
        assert_eq!(meta.total_items, 5);
        assert_eq!(f.skills.current_version(SKILL_ITEM_TYPE).await.unwrap(), Some(1));

        for id in 1..=5 {
            assert!(f.cache.get(&keys::vector(1, id)).await.unwrap().is_some());
        }
        // Lock released.
        assert!(f.cache.get(&keys::index_lock(SKILL_ITEM_TYPE)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_querying_with_a_stored_vector_returns_its_record() {
        let f = fixture(3).await;
        indexer(&f, Arc::new(LetterEmbedder::new())).run().await.unwrap();

        let raw = f.cache.get(&keys::vector(1, 2)).await.unwrap().unwrap();
        let stored: VectorRecord = serde_json::from_str(&raw).unwrap();
        let hits = f.index.query(&stored.values, 3, Some(1)).await.unwrap();
        assert_eq!(hits[0].metadata.skill_id, 2);
        assert!((hits[0].score - 1.0).abs() < 1e-5);
        assert!((cosine_similarity(&stored.values, &stored.values) - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_held_lock_refuses_second_run() {
        let f = fixture(2).await;
        f.cache
            .put(&keys::index_lock(SKILL_ITEM_TYPE), "someone-else", 600)
            .await
            .unwrap();

        let err = indexer(&f, Arc::new(LetterEmbedder::new())).run().await.unwrap_err();
        assert!(matches!(err, IndexError::LockHeld(_)));
        assert!(f.skills.latest_index(SKILL_ITEM_TYPE).await.unwrap().is_none());
        // The other holder's lock is untouched.
        assert_eq!(
            f.cache.get(&keys::index_lock(SKILL_ITEM_TYPE)).await.unwrap().as_deref(),
            Some("someone-else")
        );
    }

    #[tokio::test]
    async fn test_failed_run_marks_version_and_releases_lock() {
        let f = fixture(3).await;
        let embedder = Arc::new(LetterEmbedder::new());
        embedder.broken.store(true, Ordering::SeqCst);

        let err = indexer(&f, embedder.clone()).run().await.unwrap_err();
        assert!(matches!(err, IndexError::Embedding(_)));
        let meta = f.skills.latest_index(SKILL_ITEM_TYPE).await.unwrap().unwrap();
        assert_eq!(meta.status, IndexStatus::Failed);
        assert_eq!(f.skills.current_version(SKILL_ITEM_TYPE).await.unwrap(), None);

        embedder.broken.store(false, Ordering::SeqCst);
        let report = indexer(&f, embedder).run().await.unwrap();
        assert_eq!(report.version, 2);
        assert_eq!(f.skills.current_version(SKILL_ITEM_TYPE).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_reindex_prunes_versions_before_the_previous_one() {
        let f = fixture(3).await;
        let embedder = Arc::new(LetterEmbedder::new());
        for _ in 0..3 {
            indexer(&f, embedder.clone()).run().await.unwrap();
        }
        let any = [1.0, 1.0, 1.0, 1.0];
        assert!(f.index.query(&any, 10, Some(1)).await.unwrap().is_empty());
        assert_eq!(f.index.query(&any, 10, Some(2)).await.unwrap().len(), 3);
        assert_eq!(f.index.query(&any, 10, Some(3)).await.unwrap().len(), 3);
        assert_eq!(f.index.query(&any, 10, None).await.unwrap().len(), 6);
    }

    #[tokio::test]
    async fn test_expired_lock_is_taken_over() {
        let f = fixture(1).await;
        let key = keys::index_lock(SKILL_ITEM_TYPE);
        f.cache.put(&key, "crashed-run", 600).await.unwrap();
        f.cache.expire_now(&key);
        assert!(indexer(&f, Arc::new(LetterEmbedder::new())).run().await.is_ok());
    }
}
