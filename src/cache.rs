//! Key-value cache with per-entry TTL.
//!
//! One store, several logically separate namespaces (see [`keys`]):
//! query responses, fallback vector copies, the indexing lock, quota
//! counters, and spent session challenges.
//!
//! Guarantees are per-key last-write-wins. [`KeyValueCache::put_if_absent`]
//! and [`KeyValueCache::increment`] are atomic for a single key, which is all
//! the lock and the quota counter need. Expired entries read as absent.

use anyhow::Result;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::Mutex;

#[async_trait]
pub trait KeyValueCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn put(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Stores `value` only if no live entry exists. Returns whether it was stored.
    async fn put_if_absent(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool>;

    /// Adds `delta` to the integer at `key` (absent counts as zero) and returns
    /// the new value. The TTL is set when the entry is created and kept on
    /// later increments.
    async fn increment(&self, key: &str, delta: i64, ttl_secs: u64) -> Result<i64>;
}

/// Key builders for each namespace.
pub mod keys {
    use super::*;

    /// Cached query response, keyed by a hash of the normalized query.
    pub fn query(normalized_query: &str) -> String {
        format!("query:{}", hash_query(normalized_query))
    }

    /// Fallback copy of a skill's vector for one index version.
    pub fn vector(version: i64, skill_id: i64) -> String {
        format!("vec:v{}:{}", version, skill_id)
    }

    pub fn index_lock(item_type: &str) -> String {
        format!("lock:index:{}", item_type)
    }

    pub fn quota(day: &str) -> String {
        format!("quota:{}", day)
    }

    pub fn spent_challenge(challenge: &str) -> String {
        format!("challenge:{}", hash_text(challenge))
    }
}

/// Deterministic hash of a query. Case is folded so "Rust?" and "rust?" share an entry.
pub fn hash_query(normalized_query: &str) -> String {
    hash_text(&normalized_query.to_lowercase())
}

fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

fn expiry(ttl_secs: u64) -> i64 {
    now_ts().saturating_add(ttl_secs.min(i64::MAX as u64) as i64)
}

// ============ SQLite ============

/// Cache stored in the `kv_cache` table.
pub struct SqliteCache {
    pool: SqlitePool,
}

impl SqliteCache {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Deletes expired rows. Reads already ignore them; this only reclaims space.
    pub async fn purge_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM kv_cache WHERE expires_at <= ?")
            .bind(now_ts())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl KeyValueCache for SqliteCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM kv_cache WHERE key = ? AND expires_at > ?")
                .bind(key)
                .bind(now_ts())
                .fetch_optional(&self.pool)
                .await?;
        Ok(value)
    }

    async fn put(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO kv_cache (key, value, expires_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(expiry(ttl_secs))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM kv_cache WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool> {
        // Takes over the row only when the existing entry has expired.
        let result = sqlx::query(
            r#"
            INSERT INTO kv_cache (key, value, expires_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                expires_at = excluded.expires_at
            WHERE kv_cache.expires_at <= ?
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(expiry(ttl_secs))
        .bind(now_ts())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn increment(&self, key: &str, delta: i64, ttl_secs: u64) -> Result<i64> {
        let now = now_ts();
        let row = sqlx::query(
            r#"
            INSERT INTO kv_cache (key, value, expires_at)
            VALUES (?, CAST(? AS TEXT), ?)
            ON CONFLICT(key) DO UPDATE SET
                value = CASE WHEN kv_cache.expires_at <= ?
                             THEN excluded.value
                             ELSE CAST(CAST(kv_cache.value AS INTEGER) + ? AS TEXT) END,
                expires_at = CASE WHEN kv_cache.expires_at <= ?
                                  THEN excluded.expires_at
                                  ELSE kv_cache.expires_at END
            RETURNING value
            "#,
        )
        .bind(key)
        .bind(delta)
        .bind(expiry(ttl_secs))
        .bind(now)
        .bind(delta)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        let value: String = row.get("value");
        Ok(value.parse::<i64>()?)
    }
}

// ============ In-memory ============

/// Process-local cache. Used by tests and single-process deployments.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (String, i64)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forces an entry to expire, for exercising TTL behavior in tests.
    pub fn expire_now(&self, key: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = entries.get_mut(key) {
            entry.1 = now_ts() - 1;
        }
    }
}

#[async_trait]
impl KeyValueCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries
            .get(key)
            .filter(|(_, exp)| *exp > now_ts())
            .map(|(v, _)| v.clone()))
    }

    async fn put(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(key.to_string(), (value.to_string(), expiry(ttl_secs)));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(key);
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((_, exp)) = entries.get(key) {
            if *exp > now_ts() {
                return Ok(false);
            }
        }
        entries.insert(key.to_string(), (value.to_string(), expiry(ttl_secs)));
        Ok(true)
    }

    async fn increment(&self, key: &str, delta: i64, ttl_secs: u64) -> Result<i64> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let now = now_ts();
        let (current, exp) = match entries.get(key) {
            Some((v, exp)) if *exp > now => (v.parse::<i64>()?, *exp),
            _ => (0, expiry(ttl_secs)),
        };
        let next = current + delta;
        entries.insert(key.to_string(), (next.to_string(), exp));
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::{db, migrate};
    use tempfile::TempDir;

    async fn sqlite_cache(tmp: &TempDir) -> SqliteCache {
        let config = Config::with_db_path(tmp.path().join("cache.sqlite"));
        let pool = db::connect(&config).await.unwrap();
        migrate::migrate_pool(&pool).await.unwrap();
        SqliteCache::new(pool)
    }

    async fn exercise(cache: &dyn KeyValueCache) {
        assert_eq!(cache.get("a").await.unwrap(), None);

        cache.put("a", "1", 60).await.unwrap();
        assert_eq!(cache.get("a").await.unwrap().as_deref(), Some("1"));

        cache.put("a", "2", 60).await.unwrap();
        assert_eq!(cache.get("a").await.unwrap().as_deref(), Some("2"));

        cache.delete("a").await.unwrap();
        assert_eq!(cache.get("a").await.unwrap(), None);

        assert!(cache.put_if_absent("lock", "owner-1", 60).await.unwrap());
        assert!(!cache.put_if_absent("lock", "owner-2", 60).await.unwrap());
        assert_eq!(cache.get("lock").await.unwrap().as_deref(), Some("owner-1"));

        assert_eq!(cache.increment("n", 1, 60).await.unwrap(), 1);
        assert_eq!(cache.increment("n", 1, 60).await.unwrap(), 2);
        assert_eq!(cache.increment("n", 5, 60).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_memory_cache_contract() {
        exercise(&MemoryCache::new()).await;
    }

    #[tokio::test]
    async fn test_sqlite_cache_contract() {
        let tmp = TempDir::new().unwrap();
        exercise(&sqlite_cache(&tmp).await).await;
    }

    #[tokio::test]
    async fn test_zero_ttl_expires_immediately() {
        let tmp = TempDir::new().unwrap();
        let cache = sqlite_cache(&tmp).await;
        cache.put("q", "payload", 0).await.unwrap();
        assert_eq!(cache.get("q").await.unwrap(), None);

        // An expired lock can be taken over.
        cache.put("lock", "stale", 0).await.unwrap();
        assert!(cache.put_if_absent("lock", "fresh", 60).await.unwrap());
        assert_eq!(cache.get("lock").await.unwrap().as_deref(), Some("fresh"));

        // Only the expired "q" row is reclaimed.
        assert_eq!(cache.purge_expired().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_memory_expiry() {
        let cache = MemoryCache::new();
        cache.put("q", "payload", 60).await.unwrap();
        cache.expire_now("q");
        assert_eq!(cache.get("q").await.unwrap(), None);
        assert_eq!(cache.increment("q", 3, 60).await.unwrap(), 3);
    }

    #[test]
    fn test_query_key_is_case_insensitive_and_namespaced() {
        assert_eq!(keys::query("Rust?"), keys::query("rust?"));
        assert_ne!(keys::query("rust"), keys::query("go"));
        assert!(keys::query("rust").starts_with("query:"));
        assert_eq!(keys::vector(3, 12), "vec:v3:12");
    }
}
