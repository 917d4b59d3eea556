//! Relational store for skill records and index metadata.
//!
//! The skills table is the source of truth the vector index and the cache are
//! derived from. Query and indexing paths only read skills; writes happen
//! through [`SkillStore::upsert_skill`], used by `skillbot seed`.

use anyhow::{Context, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::path::Path;

use crate::models::{format_ts_iso, IndexMetadata, IndexStatus, SkillRecord};

const SKILL_COLUMNS: &str = "id, skill_id, name, years, level, category, summary, action, effect, outcome, related_project";

#[derive(Clone)]
pub struct SkillStore {
    pool: SqlitePool,
}

fn row_to_skill(row: &SqliteRow) -> SkillRecord {
    SkillRecord {
        id: row.get("id"),
        skill_id: row.get("skill_id"),
        name: row.get("name"),
        years: row.get("years"),
        level: row.get("level"),
        category: row.get("category"),
        summary: row.get("summary"),
        action: row.get("action"),
        effect: row.get("effect"),
        outcome: row.get("outcome"),
        related_project: row.get("related_project"),
    }
}

fn row_to_metadata(row: &SqliteRow) -> IndexMetadata {
    let status: String = row.get("status");
    let created_at: i64 = row.get("created_at");
    let completed_at: Option<i64> = row.get("completed_at");
    IndexMetadata {
        version: row.get("version"),
        item_type: row.get("item_type"),
        status: IndexStatus::parse(&status).unwrap_or(IndexStatus::Failed),
        created_at: format_ts_iso(created_at),
        completed_at: completed_at.map(format_ts_iso),
        total_items: row.get("total_items"),
    }
}

impl SkillStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connectivity probe used by `/health`.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Inserts or updates a skill by `skill_id`, returning its numeric id.
    pub async fn upsert_skill(&self, skill: &SkillRecord) -> Result<i64> {
        let now = chrono::Utc::now().timestamp();
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO skills (skill_id, name, years, level, category, summary,
                                action, effect, outcome, related_project, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(skill_id) DO UPDATE SET
                name = excluded.name,
                years = excluded.years,
                level = excluded.level,
                category = excluded.category,
                summary = excluded.summary,
                action = excluded.action,
                effect = excluded.effect,
                outcome = excluded.outcome,
                related_project = excluded.related_project,
                updated_at = excluded.updated_at
            RETURNING id
            "#,
        )
        .bind(&skill.skill_id)
        .bind(&skill.name)
        .bind(skill.years)
        .bind(&skill.level)
        .bind(&skill.category)
        .bind(&skill.summary)
        .bind(&skill.action)
        .bind(&skill.effect)
        .bind(&skill.outcome)
        .bind(&skill.related_project)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    /// Loads a JSON array of skills from disk and upserts each one.
    pub async fn seed_from_file(&self, path: &Path) -> Result<usize> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read seed file: {}", path.display()))?;
        let skills: Vec<SkillRecord> =
            serde_json::from_str(&content).with_context(|| "Failed to parse seed file")?;
        for skill in &skills {
            self.upsert_skill(skill).await?;
        }
        Ok(skills.len())
    }

    pub async fn count_skills(&self) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM skills")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    /// One page of skills in primary-key order.
    pub async fn list_skills_page(&self, offset: i64, limit: i64) -> Result<Vec<SkillRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM skills ORDER BY id ASC LIMIT ? OFFSET ?",
            SKILL_COLUMNS
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_skill).collect())
    }

    /// Up to `limit` skill ids in ascending order. Feeds the fallback search.
    pub async fn list_skill_ids(&self, limit: i64) -> Result<Vec<i64>> {
        let ids: Vec<i64> = sqlx::query_scalar("SELECT id FROM skills ORDER BY id ASC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    pub async fn get_skill(&self, id: i64) -> Result<Option<SkillRecord>> {
        let row = sqlx::query(&format!("SELECT {} FROM skills WHERE id = ?", SKILL_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_skill))
    }

    /// Fetches records for `ids`, preserving the input order. Unknown ids are dropped.
    pub async fn get_skills(&self, ids: &[i64]) -> Result<Vec<SkillRecord>> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(skill) = self.get_skill(*id).await? {
                out.push(skill);
            }
        }
        Ok(out)
    }

    // ============ Index metadata ============

    /// Opens a new `in-progress` version for `item_type`.
    ///
    /// Earlier `in-progress` rows for the same item type belong to runs that
    /// were interrupted; they are marked `failed` so at most one version is in
    /// progress at a time.
    pub async fn begin_index_version(&self, item_type: &str) -> Result<i64> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE index_metadata SET status = ? WHERE item_type = ? AND status = ?")
            .bind(IndexStatus::Failed.as_str())
            .bind(item_type)
            .bind(IndexStatus::InProgress.as_str())
            .execute(&mut *tx)
            .await?;

        let version: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO index_metadata (version, item_type, status, created_at, total_items)
            VALUES ((SELECT COALESCE(MAX(version), 0) + 1 FROM index_metadata), ?, ?, ?, 0)
            RETURNING version
            "#,
        )
        .bind(item_type)
        .bind(IndexStatus::InProgress.as_str())
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(version)
    }

    pub async fn complete_index_version(&self, version: i64, total_items: i64) -> Result<()> {
        sqlx::query(
            "UPDATE index_metadata SET status = ?, completed_at = ?, total_items = ? WHERE version = ?",
        )
        .bind(IndexStatus::Completed.as_str())
        .bind(chrono::Utc::now().timestamp())
        .bind(total_items)
        .bind(version)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn fail_index_version(&self, version: i64, total_items: i64) -> Result<()> {
        sqlx::query("UPDATE index_metadata SET status = ?, total_items = ? WHERE version = ?")
            .bind(IndexStatus::Failed.as_str())
            .bind(total_items)
            .bind(version)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// The most recent run of any status.
    pub async fn latest_index(&self, item_type: &str) -> Result<Option<IndexMetadata>> {
        let row = sqlx::query(
            "SELECT * FROM index_metadata WHERE item_type = ? ORDER BY version DESC LIMIT 1",
        )
        .bind(item_type)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(row_to_metadata))
    }

    /// The version queries should read from.
    pub async fn current_version(&self, item_type: &str) -> Result<Option<i64>> {
        let version: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(version) FROM index_metadata WHERE item_type = ? AND status = ?",
        )
        .bind(item_type)
        .bind(IndexStatus::Completed.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::models::SKILL_ITEM_TYPE;
    use crate::{db, migrate};
    use tempfile::TempDir;

    async fn store(tmp: &TempDir) -> SkillStore {
        let config = Config::with_db_path(tmp.path().join("skills.sqlite"));
        let pool = db::connect(&config).await.unwrap();
        migrate::migrate_pool(&pool).await.unwrap();
        SkillStore::new(pool)
    }

    fn skill(skill_id: &str, name: &str) -> SkillRecord {
        SkillRecord {
            id: 0,
            skill_id: skill_id.to_string(),
            name: name.to_string(),
            years: Some(3.0),
            level: Some("Advanced".to_string()),
            category: None,
            summary: String::new(),
            action: None,
            effect: None,
            outcome: None,
            related_project: None,
        }
    }

    #[tokio::test]
    async fn test_upsert_is_keyed_by_skill_id() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp).await;
        let id1 = store.upsert_skill(&skill("rust", "Rust")).await.unwrap();
        let id2 = store.upsert_skill(&skill("rust", "Rust (systems)")).await.unwrap();
        assert_eq!(id1, id2);
        assert_eq!(store.count_skills().await.unwrap(), 1);
        let loaded = store.get_skill(id1).await.unwrap().unwrap();
        assert_eq!(loaded.name, "Rust (systems)");
    }

    #[tokio::test]
    async fn test_get_skills_drops_unknown_ids() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp).await;
        let a = store.upsert_skill(&skill("a", "A")).await.unwrap();
        let b = store.upsert_skill(&skill("b", "B")).await.unwrap();
        let found = store.get_skills(&[b, 999, a]).await.unwrap();
        let names: Vec<&str> = found.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["B", "A"]);
    }

    #[tokio::test]
    async fn test_pagination_and_ids() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp).await;
        for i in 0..5 {
            store
                .upsert_skill(&skill(&format!("s{}", i), &format!("S{}", i)))
                .await
                .unwrap();
        }
        assert_eq!(store.list_skills_page(0, 2).await.unwrap().len(), 2);
        assert_eq!(store.list_skills_page(4, 2).await.unwrap().len(), 1);
        assert_eq!(store.list_skill_ids(3).await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_index_version_lifecycle() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp).await;
        assert_eq!(store.current_version(SKILL_ITEM_TYPE).await.unwrap(), None);

        let v1 = store.begin_index_version(SKILL_ITEM_TYPE).await.unwrap();
        assert_eq!(v1, 1);
        assert_eq!(store.current_version(SKILL_ITEM_TYPE).await.unwrap(), None);
        store.complete_index_version(v1, 4).await.unwrap();
        assert_eq!(store.current_version(SKILL_ITEM_TYPE).await.unwrap(), Some(1));

        // An interrupted run leaves an in-progress row; the next run supersedes it.
        let v2 = store.begin_index_version(SKILL_ITEM_TYPE).await.unwrap();
        let v3 = store.begin_index_version(SKILL_ITEM_TYPE).await.unwrap();
        assert_eq!((v2, v3), (2, 3));
        let in_progress: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM index_metadata WHERE status = 'in-progress'",
        )
        .fetch_one(&store.pool)
        .await
        .unwrap();
        assert_eq!(in_progress, 1);

        let latest = store.latest_index(SKILL_ITEM_TYPE).await.unwrap().unwrap();
        assert_eq!(latest.version, 3);
        assert_eq!(latest.status, IndexStatus::InProgress);
        assert_eq!(store.current_version(SKILL_ITEM_TYPE).await.unwrap(), Some(1));
    }
}
