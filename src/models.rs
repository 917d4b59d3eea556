//! Core data models.
//!
//! Skill records are canonical and live in SQLite. Vector records are derived
//! from them by the indexer and stored twice: in the vector index and, as a
//! fallback copy, in the key-value cache. Query responses are what the HTTP
//! layer returns and what the query cache stores.

use serde::{Deserialize, Serialize};

/// Item type recorded in `index_metadata` for skill indexing runs.
pub const SKILL_ITEM_TYPE: &str = "skills";

/// A skill as stored in the relational store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillRecord {
    /// Numeric primary key. Assigned by the store; ignored on seed input.
    #[serde(default)]
    pub id: i64,
    /// Stable opaque identifier (e.g. `"typescript"`).
    pub skill_id: String,
    pub name: String,
    #[serde(default)]
    pub years: Option<f64>,
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub summary: String,
    /// What was done.
    #[serde(default)]
    pub action: Option<String>,
    /// Technical effect of the action.
    #[serde(default)]
    pub effect: Option<String>,
    /// Business outcome.
    #[serde(default)]
    pub outcome: Option<String>,
    /// Project or employer this record is scoped to.
    #[serde(default)]
    pub related_project: Option<String>,
}

impl SkillRecord {
    /// Descriptive text fed to the embedding model.
    pub fn embedding_text(&self) -> String {
        let mut parts = vec![self.name.clone()];
        if let Some(ref category) = self.category {
            parts.push(category.clone());
        }
        if let Some(ref level) = self.level {
            parts.push(format!("{} level", level));
        }
        if let Some(years) = self.years {
            parts.push(format!("{} years of experience", years));
        }
        if !self.summary.is_empty() {
            parts.push(self.summary.clone());
        }
        parts.join(". ")
    }
}

/// Metadata attached to every vector record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorMetadata {
    /// Numeric primary key of the referenced [`SkillRecord`].
    pub skill_id: i64,
    /// Index version that produced the vector.
    pub version: i64,
    pub name: String,
}

/// A vector derived from one skill at one index version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: String,
    pub values: Vec<f32>,
    pub metadata: VectorMetadata,
}

impl VectorRecord {
    pub fn for_skill(skill: &SkillRecord, version: i64, values: Vec<f32>) -> Self {
        Self {
            id: vector_id(skill.id, version),
            values,
            metadata: VectorMetadata {
                skill_id: skill.id,
                version,
                name: skill.name.clone(),
            },
        }
    }
}

/// Vector ids are version-scoped so a reindex never overwrites the live set.
pub fn vector_id(skill_id: i64, version: i64) -> String {
    format!("{}:v{}", skill_id, version)
}

/// One hit from a similarity search, ordered by `score` descending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorMatch {
    pub id: String,
    pub score: f32,
    pub metadata: VectorMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IndexStatus {
    InProgress,
    Completed,
    Failed,
}

impl IndexStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexStatus::InProgress => "in-progress",
            IndexStatus::Completed => "completed",
            IndexStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "in-progress" => Some(IndexStatus::InProgress),
            "completed" => Some(IndexStatus::Completed),
            "failed" => Some(IndexStatus::Failed),
            _ => None,
        }
    }
}

/// One indexing run as recorded in the relational store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexMetadata {
    pub version: i64,
    pub item_type: String,
    pub status: IndexStatus,
    /// ISO 8601.
    pub created_at: String,
    pub completed_at: Option<String>,
    pub total_items: i64,
}

/// Which path produced a query response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResponseSource {
    Cache,
    VectorIndex,
    Fallback,
}

impl ResponseSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseSource::Cache => "cache",
            ResponseSource::VectorIndex => "vector-index",
            ResponseSource::Fallback => "fallback",
        }
    }
}

/// A hydrated search hit as returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillMatch {
    pub id: String,
    pub name: String,
    pub similarity: f32,
    pub years: Option<f64>,
    pub level: Option<String>,
    pub category: Option<String>,
}

/// The `/query` response body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    pub query: String,
    pub results: Vec<SkillMatch>,
    pub assistant_reply: Option<String>,
    pub source: ResponseSource,
    /// True when retrieval succeeded but the LLM call did not.
    #[serde(default)]
    pub degraded: bool,
    /// ISO 8601.
    pub timestamp: String,
}

pub fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_source_wire_names() {
        assert_eq!(
            serde_json::to_value(ResponseSource::VectorIndex).unwrap(),
            serde_json::json!("vector-index")
        );
        assert_eq!(ResponseSource::Fallback.as_str(), "fallback");
    }

    #[test]
    fn test_query_response_field_names() {
        let resp = QueryResponse {
            query: "rust".to_string(),
            results: vec![],
            assistant_reply: None,
            source: ResponseSource::Cache,
            degraded: false,
            timestamp: format_ts_iso(0),
        };
        let json = serde_json::to_value(&resp).unwrap();
        assert!(json.get("assistantReply").is_some());
        assert_eq!(json["source"], "cache");
        assert_eq!(json["timestamp"], "1970-01-01T00:00:00Z");
    }

    #[test]
    fn test_vector_id_is_version_scoped() {
        assert_eq!(vector_id(7, 3), "7:v3");
        assert_ne!(vector_id(7, 3), vector_id(7, 4));
    }

    #[test]
    fn test_embedding_text_skips_missing_fields() {
        let skill = SkillRecord {
            id: 1,
            skill_id: "ts".to_string(),
            name: "TypeScript".to_string(),
            years: Some(6.0),
            level: None,
            category: Some("Languages".to_string()),
            summary: "Typed JavaScript".to_string(),
            action: None,
            effect: None,
            outcome: None,
            related_project: None,
        };
        assert_eq!(
            skill.embedding_text(),
            "TypeScript. Languages. 6 years of experience. Typed JavaScript"
        );
    }

    #[test]
    fn test_index_status_roundtrip() {
        for status in [
            IndexStatus::InProgress,
            IndexStatus::Completed,
            IndexStatus::Failed,
        ] {
            assert_eq!(IndexStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(IndexStatus::parse("bogus"), None);
    }
}
