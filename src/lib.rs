//! # skillbot
//!
//! A question-answering service over one person's skill records. A query is
//! validated and admitted, embedded, matched against skill vectors, and
//! answered by an LLM grounded in the matched records.
//!
//! ## Architecture
//!
//! ```text
//!              ┌───────────────┐
//!  HTTP / CLI ─▶│ QueryOrchestr.│──▶ Embedder ──▶ VectorIndex ─┐
//!              └──────┬────────┘                  (error)     │
//!                     │                              ▼        │
//!                     │                       FallbackSearch  │
//!                     ▼                              │        ▼
//!             KeyValueCache ◀────────────────────────┴── SkillStore ──▶ LanguageModel
//!                     ▲
//!              ┌──────┴────────┐
//!  HTTP / CLI ─▶│ IndexingOrch. │──▶ Embedder ──▶ VectorIndex + cached copies
//!              └───────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`models`] | Core data types |
//! | [`error`] | Error taxonomy |
//! | [`skills`] | Skill records and index metadata |
//! | [`cache`] | Key-value cache with TTL |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`vector_index`] | Vector index backends |
//! | [`fallback`] | Cache-backed similarity search |
//! | [`validate`] | Query validation |
//! | [`schedule`] | Active-hours gate |
//! | [`quota`] | Daily answer quota |
//! | [`projects`] | Project/employer detection |
//! | [`prompt`] | Prompt building and reply cleanup |
//! | [`llm`] | Language model providers |
//! | [`session`] | Challenge-gated session tokens |
//! | [`query`] | Query pipeline |
//! | [`indexer`] | Indexing pipeline |
//! | [`services`] | Backend wiring |
//! | [`server`] | HTTP server |

pub mod cache;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod fallback;
pub mod indexer;
pub mod llm;
pub mod migrate;
pub mod models;
pub mod projects;
pub mod prompt;
pub mod query;
pub mod quota;
pub mod schedule;
pub mod server;
pub mod services;
pub mod session;
pub mod skills;
pub mod validate;
pub mod vector_index;
