//! TOML configuration.
//!
//! Every section carries serde defaults, so the smallest valid file is:
//!
//! ```toml
//! [db]
//! path = "./data/skillbot.sqlite"
//! ```
//!
//! Secrets never live in the file. Sections that need one name the
//! environment variable to read it from (`token_env`, `secret_env`, ...).

use anyhow::{bail, Context, Result};
use chrono::Weekday;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub vector_index: VectorIndexConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub reply: ReplyConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub projects: Vec<ProjectConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Env var holding the bearer token required by `POST /index`.
    /// Unset means the endpoint is open.
    #[serde(default)]
    pub admin_token_env: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            admin_token_env: None,
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8787".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Override for the provider's API base URL.
    #[serde(default)]
    pub base_url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            dims: None,
            timeout_secs: default_timeout_secs(),
            base_url: None,
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Hard cap on generated tokens. Truncated replies are accepted as-is.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Stop sequences that cut off run-on continuations.
    #[serde(default = "default_stop")]
    pub stop: Vec<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub base_url: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            max_tokens: default_max_tokens(),
            stop: default_stop(),
            temperature: default_temperature(),
            timeout_secs: default_timeout_secs(),
            base_url: None,
        }
    }
}

fn default_max_tokens() -> u32 {
    120
}
fn default_stop() -> Vec<String> {
    vec![
        "\n\nAdditionally".to_string(),
        "\n\nFurthermore".to_string(),
        "\n\nIn summary".to_string(),
    ]
}
fn default_temperature() -> f32 {
    0.2
}

#[derive(Debug, Deserialize, Clone)]
pub struct VectorIndexConfig {
    /// `"sqlite"` (local brute-force index) or `"vectorize"` (hosted REST index).
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_vector_token_env")]
    pub token_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for VectorIndexConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            url: None,
            token_env: default_vector_token_env(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_backend() -> String {
    "sqlite".to_string()
}
fn default_vector_token_env() -> String {
    "CLOUDFLARE_API_TOKEN".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_query_ttl")]
    pub query_ttl_secs: u64,
    #[serde(default = "default_vector_ttl")]
    pub vector_ttl_secs: u64,
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            query_ttl_secs: default_query_ttl(),
            vector_ttl_secs: default_vector_ttl(),
            lock_ttl_secs: default_lock_ttl(),
        }
    }
}

fn default_query_ttl() -> u64 {
    3600
}
fn default_vector_ttl() -> u64 {
    30 * 24 * 3600
}
fn default_lock_ttl() -> u64 {
    600
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f32,
    /// Cap on how many cached vectors the fallback path scans.
    #[serde(default = "default_fallback_candidates")]
    pub fallback_candidates: usize,
    /// Timeout applied to every external call made while answering a query.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            min_similarity: default_min_similarity(),
            fallback_candidates: default_fallback_candidates(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

fn default_top_k() -> usize {
    5
}
fn default_min_similarity() -> f32 {
    0.3
}
fn default_fallback_candidates() -> usize {
    20
}
fn default_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ValidationConfig {
    #[serde(default = "default_min_len")]
    pub min_len: usize,
    #[serde(default = "default_max_len")]
    pub max_len: usize,
    /// Longest allowed run of one repeated character.
    #[serde(default = "default_max_char_run")]
    pub max_char_run: usize,
    /// Largest allowed share of punctuation among non-whitespace characters.
    #[serde(default = "default_max_punctuation_ratio")]
    pub max_punctuation_ratio: f32,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            min_len: default_min_len(),
            max_len: default_max_len(),
            max_char_run: default_max_char_run(),
            max_punctuation_ratio: default_max_punctuation_ratio(),
        }
    }
}

fn default_min_len() -> usize {
    3
}
fn default_max_len() -> usize {
    500
}
fn default_max_char_run() -> usize {
    8
}
fn default_max_punctuation_ratio() -> f32 {
    0.5
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScheduleConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_start_hour")]
    pub start_hour: u32,
    /// Exclusive.
    #[serde(default = "default_end_hour")]
    pub end_hour: u32,
    #[serde(default = "default_weekdays")]
    pub weekdays: Vec<String>,
    #[serde(default)]
    pub utc_offset_minutes: i32,
    /// Env var holding the operator bypass token (`x-bypass-token` header).
    #[serde(default)]
    pub bypass_token_env: Option<String>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            start_hour: default_start_hour(),
            end_hour: default_end_hour(),
            weekdays: default_weekdays(),
            utc_offset_minutes: 0,
            bypass_token_env: None,
        }
    }
}

impl ScheduleConfig {
    pub fn parsed_weekdays(&self) -> Result<Vec<Weekday>> {
        self.weekdays
            .iter()
            .map(|d| {
                d.parse::<Weekday>()
                    .map_err(|_| anyhow::anyhow!("schedule.weekdays: unknown day '{}'", d))
            })
            .collect()
    }
}

fn default_start_hour() -> u32 {
    9
}
fn default_end_hour() -> u32 {
    17
}
fn default_weekdays() -> Vec<String> {
    ["mon", "tue", "wed", "thu", "fri"]
        .iter()
        .map(|d| d.to_string())
        .collect()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct QuotaConfig {
    /// Generated answers allowed per day. `0` disables the quota.
    #[serde(default)]
    pub daily_limit: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    #[serde(default)]
    pub required: bool,
    #[serde(default = "default_session_ttl")]
    pub ttl_secs: u64,
    #[serde(default = "default_session_secret_env")]
    pub secret_env: String,
    /// `"turnstile"` or `"static"`.
    #[serde(default = "default_verifier")]
    pub verifier: String,
    #[serde(default = "default_turnstile_secret_env")]
    pub turnstile_secret_env: String,
    /// Challenge accepted by the `static` verifier.
    #[serde(default)]
    pub static_challenge: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            required: false,
            ttl_secs: default_session_ttl(),
            secret_env: default_session_secret_env(),
            verifier: default_verifier(),
            turnstile_secret_env: default_turnstile_secret_env(),
            static_challenge: None,
        }
    }
}

fn default_session_ttl() -> u64 {
    1800
}
fn default_session_secret_env() -> String {
    "SKILLBOT_SESSION_SECRET".to_string()
}
fn default_verifier() -> String {
    "static".to_string()
}
fn default_turnstile_secret_env() -> String {
    "TURNSTILE_SECRET_KEY".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReplyConfig {
    /// Phrases stripped from generated replies (case-insensitive).
    #[serde(default = "default_filler_phrases")]
    pub filler_phrases: Vec<String>,
    /// Used when the cleaned reply comes back empty.
    #[serde(default = "default_fallback_reply")]
    pub fallback_reply: String,
    /// Used when retrieval finds nothing above the similarity threshold.
    #[serde(default = "default_no_match_reply")]
    pub no_match_reply: String,
}

impl Default for ReplyConfig {
    fn default() -> Self {
        Self {
            filler_phrases: default_filler_phrases(),
            fallback_reply: default_fallback_reply(),
            no_match_reply: default_no_match_reply(),
        }
    }
}

fn default_filler_phrases() -> Vec<String> {
    [
        "As an AI language model,",
        "Based on the provided context,",
        "I hope this helps!",
        "Let me know if you have any other questions.",
        "Feel free to ask more questions.",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_fallback_reply() -> String {
    "The matching skills are listed below; ask about one of them for details.".to_string()
}
fn default_no_match_reply() -> String {
    "No matching skills found for that question. Try naming a technology or role.".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexingConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
        }
    }
}

fn default_batch_size() -> usize {
    16
}

/// One entry of the project/employer lookup table.
#[derive(Debug, Deserialize, Clone)]
pub struct ProjectConfig {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

fn default_disabled() -> String {
    "disabled".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}

impl Config {
    /// Builds a config with every section at its default, for a given database path.
    pub fn with_db_path(path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig { path: path.into() },
            server: ServerConfig::default(),
            embedding: EmbeddingConfig::default(),
            llm: LlmConfig::default(),
            vector_index: VectorIndexConfig::default(),
            cache: CacheConfig::default(),
            retrieval: RetrievalConfig::default(),
            validation: ValidationConfig::default(),
            schedule: ScheduleConfig::default(),
            quota: QuotaConfig::default(),
            session: SessionConfig::default(),
            reply: ReplyConfig::default(),
            indexing: IndexingConfig::default(),
            projects: Vec::new(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate_config(&config)?;
    Ok(config)
}

pub fn validate_config(config: &Config) -> Result<()> {
    // Retrieval
    if config.retrieval.top_k == 0 {
        bail!("retrieval.top_k must be >= 1");
    }
    if !(-1.0..=1.0).contains(&config.retrieval.min_similarity) {
        bail!("retrieval.min_similarity must be in [-1.0, 1.0]");
    }
    if config.retrieval.fallback_candidates == 0 {
        bail!("retrieval.fallback_candidates must be >= 1");
    }
    if config.retrieval.timeout_ms == 0 {
        bail!("retrieval.timeout_ms must be > 0");
    }

    // Validation bounds
    if config.validation.min_len > config.validation.max_len {
        bail!("validation.min_len must be <= validation.max_len");
    }
    if config.validation.max_char_run < 2 {
        bail!("validation.max_char_run must be >= 2");
    }

    // Schedule window
    let s = &config.schedule;
    if s.start_hour >= s.end_hour || s.end_hour > 24 {
        bail!("schedule requires start_hour < end_hour <= 24");
    }
    if s.utc_offset_minutes.abs() >= 24 * 60 {
        bail!("schedule.utc_offset_minutes must be within one day");
    }
    s.parsed_weekdays()?;

    if config.indexing.batch_size == 0 {
        bail!("indexing.batch_size must be >= 1");
    }

    // Embedding
    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }
    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "cloudflare" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or cloudflare.",
            other
        ),
    }

    // LLM
    match config.llm.provider.as_str() {
        "disabled" => {}
        "openai" | "cloudflare" => {
            if config.llm.model.is_none() {
                bail!(
                    "llm.model must be specified when provider is '{}'",
                    config.llm.provider
                );
            }
        }
        other => bail!(
            "Unknown llm provider: '{}'. Must be disabled, openai, or cloudflare.",
            other
        ),
    }
    if config.llm.stop.len() > 4 {
        bail!("llm.stop accepts at most 4 sequences");
    }
    if config.llm.max_tokens == 0 {
        bail!("llm.max_tokens must be > 0");
    }

    // Vector index
    match config.vector_index.backend.as_str() {
        "sqlite" => {}
        "vectorize" => {
            if config.vector_index.url.is_none() {
                bail!("vector_index.url must be set for the vectorize backend");
            }
        }
        other => bail!(
            "Unknown vector_index backend: '{}'. Must be sqlite or vectorize.",
            other
        ),
    }

    match config.session.verifier.as_str() {
        "static" | "turnstile" => {}
        other => bail!(
            "Unknown session verifier: '{}'. Must be static or turnstile.",
            other
        ),
    }

    Ok(())
}
