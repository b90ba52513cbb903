//! Anthropic completion gateway
//!
//! Sends pipeline requests to the Anthropic Messages API and extracts the
//! JSON payload from the first text block of the reply.

use crate::config::ProviderSettings;
use crate::error::{AnnotextError, Result};
use crate::services::gateway::{extract_json_payload, CompletionGateway, CompletionRequest};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";

/// Transport-level ceiling; per-call timeouts are enforced by the retry layer
const CLIENT_TIMEOUT_SECS: u64 = 300;

/// Configuration for the Anthropic gateway
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Anthropic API key
    pub api_key: String,

    /// Model to use (default: claude-3-5-haiku-20241022)
    pub model: String,

    /// Ceiling on response tokens; requests may ask for less
    pub max_tokens: usize,

    /// Temperature for sampling
    pub temperature: f32,

    pub base_url: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: env::var("ANTHROPIC_API_KEY").unwrap_or_default(),
            model: "claude-3-5-haiku-20241022".to_string(),
            max_tokens: 2048,
            temperature: 0.2,
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }
}

impl LlmConfig {
    /// Build from a `[[providers]]` entry, reading the key from its env var
    pub fn from_settings(settings: &ProviderSettings) -> Result<Self> {
        Ok(Self {
            api_key: settings.api_key()?,
            model: settings.model.clone(),
            max_tokens: settings.max_tokens,
            temperature: settings.temperature,
            base_url: settings
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        })
    }
}

/// Completion gateway backed by the Anthropic Messages API
pub struct AnthropicGateway {
    config: LlmConfig,
    client: reqwest::Client,
}

/// Anthropic API message format
#[derive(Debug, Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: usize,
    temperature: f32,
    system: &'a str,
    messages: Vec<Message<'a>>,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

/// Anthropic API response format
#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    text: Option<String>,
}

impl AnthropicGateway {
    /// Create a new gateway with custom config
    pub fn new(config: LlmConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(AnnotextError::Config("ANTHROPIC_API_KEY not set".to_string()));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(CLIENT_TIMEOUT_SECS))
            .build()?;

        Ok(Self { config, client })
    }

    /// Create with default config
    pub fn with_default() -> Result<Self> {
        Self::new(LlmConfig::default())
    }

    /// Make an API call and return the raw reply text
    async fn call_api(&self, request: &CompletionRequest) -> Result<String> {
        debug!(
            "Calling Anthropic API ({:?}, model {})",
            request.purpose, self.config.model
        );

        let body = AnthropicRequest {
            model: &self.config.model,
            max_tokens: request.max_tokens.min(self.config.max_tokens),
            temperature: self.config.temperature,
            system: &request.system,
            messages: vec![Message {
                role: "user",
                content: &request.prompt,
            }],
        };

        let response = self
            .client
            .post(format!("{}/messages", self.config.base_url))
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let error_text = response.text().await.unwrap_or_default();
            return Err(AnnotextError::RateLimited(error_text));
        }
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(AnnotextError::LlmApi(format!(
                "API request failed with status {}: {}",
                status.as_u16(),
                error_text
            )));
        }

        let api_response: AnthropicResponse = response.json().await.map_err(|e| {
            AnnotextError::MalformedResponse(format!("Failed to parse response: {}", e))
        })?;

        api_response
            .content
            .into_iter()
            .find_map(|c| c.text)
            .ok_or_else(|| AnnotextError::MalformedResponse("Empty response from API".to_string()))
    }
}

#[async_trait]
impl CompletionGateway for AnthropicGateway {
    async fn complete(&self, request: &CompletionRequest) -> Result<serde_json::Value> {
        let text = self.call_api(request).await?;
        extract_json_payload(&text)
    }

    fn name(&self) -> &str {
        "anthropic"
    }
}
