//! Error taxonomy for the query and indexing pipelines.
//!
//! Validation and schedule errors carry a user-facing message that explains
//! the violated constraint. Everything else is logged in full and surfaced to
//! HTTP callers as an opaque "try again later".

use thiserror::Error;

/// Malformed or abusive query input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("query must not be empty")]
    Empty,

    #[error("query must be at least {min} characters")]
    TooShort { min: usize },

    #[error("query must be at most {max} characters")]
    TooLong { max: usize },

    #[error("query repeats a single character more than {max} times in a row")]
    RepeatedCharacters { max: usize },

    #[error("query is mostly punctuation")]
    ExcessivePunctuation,
}

/// Request arrived outside the active window.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("outside active hours: available {window}")]
pub struct ScheduleError {
    /// Human-readable description of the active window.
    pub window: String,
}

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding provider is disabled")]
    Disabled,

    #[error("embedding request failed: {0}")]
    Request(String),

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    Dimension { expected: usize, actual: usize },

    #[error("embedding timed out")]
    Timeout,
}

/// The primary vector index could not answer. Triggers the fallback path.
#[derive(Debug, Error)]
pub enum VectorIndexError {
    #[error("vector index unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("llm provider is disabled")]
    Disabled,

    #[error("llm request failed: {0}")]
    Request(String),

    #[error("llm timed out")]
    Timeout,
}

/// Another indexing run holds the lock.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("indexing already in progress")]
pub struct LockHeldError;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("challenge rejected")]
    Rejected,

    #[error("challenge already used")]
    Replayed,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Terminal outcomes of the query pipeline.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error("daily answer quota of {limit} reached")]
    QuotaExhausted { limit: u64 },

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error("vector search failed and the fallback returned nothing: {0}")]
    Retrieval(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl QueryError {
    /// Whether the message is safe and useful to show to the caller.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            QueryError::Validation(_) | QueryError::Schedule(_) | QueryError::QuotaExhausted { .. }
        )
    }
}

/// Terminal outcomes of an indexing run.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error(transparent)]
    LockHeld(#[from] LockHeldError),

    #[error("vector index failed its health check")]
    Unhealthy,

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    VectorIndex(#[from] VectorIndexError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}
