//! Wiring of concrete backends into the orchestrators.
//!
//! The CLI commands and the HTTP server all start from [`Services::build`],
//! which picks each backend by its config string.

use anyhow::Result;
use std::sync::Arc;

use crate::cache::{KeyValueCache, SqliteCache};
use crate::config::Config;
use crate::db;
use crate::embedding::{create_embedder, Embedder};
use crate::indexer::IndexingOrchestrator;
use crate::llm::{create_language_model, LanguageModel};
use crate::migrate::migrate_pool;
use crate::query::QueryOrchestrator;
use crate::session::SessionIssuer;
use crate::skills::SkillStore;
use crate::vector_index::{create_vector_index, VectorIndex};

#[derive(Clone)]
pub struct Services {
    pub config: Arc<Config>,
    pub skills: SkillStore,
    pub cache: Arc<SqliteCache>,
    pub queries: Arc<QueryOrchestrator>,
    pub indexer: Arc<IndexingOrchestrator>,
    pub sessions: Arc<SessionIssuer>,
}

impl Services {
    /// Connects to the database (creating the schema if needed) and builds
    /// every configured backend.
    pub async fn build(config: &Config) -> Result<Self> {
        let config = Arc::new(config.clone());
        let pool = db::connect(&config).await?;
        migrate_pool(&pool).await?;

        let skills = SkillStore::new(pool.clone());
        let cache = Arc::new(SqliteCache::new(pool.clone()));
        let kv: Arc<dyn KeyValueCache> = cache.clone();
        let embedder: Arc<dyn Embedder> = Arc::from(create_embedder(&config.embedding)?);
        let index: Arc<dyn VectorIndex> =
            Arc::from(create_vector_index(&config.vector_index, pool)?);
        let llm: Arc<dyn LanguageModel> = Arc::from(create_language_model(&config.llm)?);

        let queries = QueryOrchestrator::new(
            config.clone(),
            skills.clone(),
            kv.clone(),
            Arc::clone(&embedder),
            Arc::clone(&index),
            llm,
        )?;
        let indexer =
            IndexingOrchestrator::new(config.clone(), skills.clone(), kv.clone(), embedder, index);
        let sessions = SessionIssuer::from_config(&config.session, kv)?;

        tracing::debug!(
            embedding = %config.embedding.provider,
            llm = %config.llm.provider,
            vector_index = %config.vector_index.backend,
            "services built"
        );

        Ok(Self {
            config,
            skills,
            cache,
            queries: Arc::new(queries),
            indexer: Arc::new(indexer),
            sessions: Arc::new(sessions),
        })
    }
}
