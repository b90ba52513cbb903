//! OpenAI-compatible chat completions gateway
//!
//! Second provider for fallback chains. Works with any endpoint speaking the
//! `/chat/completions` dialect, and asks for a JSON object response format.

use crate::config::ProviderSettings;
use crate::error::{AnnotextError, Result};
use crate::services::gateway::{extract_json_payload, CompletionGateway, CompletionRequest};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const CLIENT_TIMEOUT_SECS: u64 = 300;

/// Completion gateway backed by an OpenAI-compatible API
pub struct OpenAiGateway {
    api_key: String,
    model: String,
    base_url: String,
    max_tokens: usize,
    temperature: f32,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiGateway {
    pub fn from_settings(settings: &ProviderSettings) -> Result<Self> {
        let api_key = settings.api_key()?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(CLIENT_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            api_key,
            model: settings.model.clone(),
            base_url: settings
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            max_tokens: settings.max_tokens,
            temperature: settings.temperature,
            client,
        })
    }

    async fn call_api(&self, request: &CompletionRequest) -> Result<String> {
        debug!(
            "Calling OpenAI-compatible API ({:?}, model {})",
            request.purpose, self.model
        );

        let messages = [
            ChatMessage {
                role: "system",
                content: &request.system,
            },
            ChatMessage {
                role: "user",
                content: &request.prompt,
            },
        ];
        let body = json!({
            "model": self.model,
            "max_tokens": request.max_tokens.min(self.max_tokens),
            "temperature": self.temperature,
            "response_format": { "type": "json_object" },
            "messages": messages,
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
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

        let chat: ChatResponse = response.json().await.map_err(|e| {
            AnnotextError::MalformedResponse(format!("Failed to parse response: {}", e))
        })?;

        chat.choices
            .into_iter()
            .find_map(|c| c.message.content)
            .ok_or_else(|| AnnotextError::MalformedResponse("Empty response from API".to_string()))
    }
}

#[async_trait]
impl CompletionGateway for OpenAiGateway {
    async fn complete(&self, request: &CompletionRequest) -> Result<serde_json::Value> {
        let text = self.call_api(request).await?;
        extract_json_payload(&text)
    }

    fn name(&self) -> &str {
        "openai"
    }
}
