//! Language-model inference.
//!
//! Same provider shape as [`crate::embedding`]: a trait, a disabled stub, and
//! one implementation per hosted API, chosen by `llm.provider`.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::time::Duration;

use crate::config::LlmConfig;
use crate::embedding::workers_ai_base_url;
use crate::error::InferenceError;
use crate::prompt::Prompt;

/// A fully specified generation request.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceRequest {
    pub system: String,
    pub user: String,
    pub max_tokens: u32,
    pub stop: Vec<String>,
    pub temperature: f32,
}

impl InferenceRequest {
    pub fn from_prompt(prompt: Prompt, config: &LlmConfig) -> Self {
        Self {
            system: prompt.system,
            user: prompt.user,
            max_tokens: config.max_tokens,
            stop: config.stop.clone(),
            temperature: config.temperature,
        }
    }
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn model_name(&self) -> &str;

    /// Returns the raw generated text. Truncation at `max_tokens` is not an error.
    async fn complete(&self, request: &InferenceRequest) -> Result<String, InferenceError>;
}

pub struct DisabledModel;

#[async_trait]
impl LanguageModel for DisabledModel {
    fn model_name(&self) -> &str {
        "disabled"
    }
    async fn complete(&self, _request: &InferenceRequest) -> Result<String, InferenceError> {
        Err(InferenceError::Disabled)
    }
}

// ============ OpenAI ============

/// Chat completions (`POST /v1/chat/completions`). Requires `OPENAI_API_KEY`.
pub struct OpenAIModel {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAIModel {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("llm.model required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            api_key,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            model,
        })
    }
}

#[async_trait]
impl LanguageModel for OpenAIModel {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &InferenceRequest) -> Result<String, InferenceError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": chat_messages(request),
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "stop": request.stop,
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(InferenceError::Request(format!(
                "OpenAI API error {}: {}",
                status, body_text
            )));
        }

        let json: serde_json::Value = response.json().await.map_err(request_error)?;
        text_at(&json, "/choices/0/message/content")
    }
}

// ============ Cloudflare Workers AI ============

/// Workers AI text generation (e.g. `@cf/meta/llama-3.1-8b-instruct`).
pub struct CloudflareModel {
    client: reqwest::Client,
    api_token: String,
    url: String,
    model: String,
}

impl CloudflareModel {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("llm.model required for Cloudflare provider"))?;
        let api_token = std::env::var("CLOUDFLARE_API_TOKEN")
            .map_err(|_| anyhow::anyhow!("CLOUDFLARE_API_TOKEN environment variable not set"))?;
        let base_url = match config.base_url.clone() {
            Some(url) => url,
            None => workers_ai_base_url()?,
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            api_token,
            url: format!("{}/{}", base_url, model),
            model,
        })
    }
}

#[async_trait]
impl LanguageModel for CloudflareModel {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &InferenceRequest) -> Result<String, InferenceError> {
        // Workers AI has no stop-sequence parameter; the token cap does the work.
        let body = serde_json::json!({
            "messages": chat_messages(request),
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        });

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_token)
            .json(&body)
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(InferenceError::Request(format!(
                "Workers AI error {}: {}",
                status, body_text
            )));
        }

        let json: serde_json::Value = response.json().await.map_err(request_error)?;
        let text = text_at(&json, "/result/response")?;
        Ok(cut_at_stop(&text, &request.stop))
    }
}

fn chat_messages(request: &InferenceRequest) -> serde_json::Value {
    serde_json::json!([
        { "role": "system", "content": request.system },
        { "role": "user", "content": request.user },
    ])
}

fn text_at(json: &serde_json::Value, pointer: &str) -> Result<String, InferenceError> {
    json.pointer(pointer)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| InferenceError::Request(format!("response is missing {}", pointer)))
}

/// Truncates `text` at the earliest stop sequence, for providers that ignore them.
pub fn cut_at_stop(text: &str, stop: &[String]) -> String {
    let cut = stop
        .iter()
        .filter(|s| !s.is_empty())
        .filter_map(|s| text.find(s.as_str()))
        .min()
        .unwrap_or(text.len());
    text[..cut].to_string()
}

fn request_error(e: reqwest::Error) -> InferenceError {
    if e.is_timeout() {
        InferenceError::Timeout
    } else {
        InferenceError::Request(e.to_string())
    }
}

/// Create the configured [`LanguageModel`].
pub fn create_language_model(config: &LlmConfig) -> Result<Box<dyn LanguageModel>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledModel)),
        "openai" => Ok(Box::new(OpenAIModel::new(config)?)),
        "cloudflare" => Ok(Box::new(CloudflareModel::new(config)?)),
        other => bail!("Unknown llm provider: {}", other),
    }
}
