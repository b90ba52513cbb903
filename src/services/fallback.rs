//! Ranked provider fallback
//!
//! Several providers sit behind one [`CompletionGateway`]. Each request tries
//! them in rank order and returns the first success, so nothing downstream
//! branches on provider identity.

use crate::config::{ProviderKind, ProviderSettings};
use crate::error::{AnnotextError, Result};
use crate::services::gateway::{CompletionGateway, CompletionRequest};
use crate::services::llm::{AnthropicGateway, LlmConfig};
use crate::services::openai::OpenAiGateway;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

/// Gateway that walks a ranked provider list
pub struct FallbackGateway {
    providers: Vec<Arc<dyn CompletionGateway>>,
}

impl FallbackGateway {
    pub fn new(providers: Vec<Arc<dyn CompletionGateway>>) -> Result<Self> {
        if providers.is_empty() {
            return Err(AnnotextError::Config(
                "fallback gateway needs at least one provider".to_string(),
            ));
        }
        Ok(Self { providers })
    }

    /// Build every configured provider whose API key is available
    ///
    /// Providers missing a key are skipped with a warning; it is an error only
    /// if none can be built.
    pub fn from_settings(settings: &[ProviderSettings]) -> Result<Self> {
        let mut providers: Vec<Arc<dyn CompletionGateway>> = Vec::new();
        for entry in settings {
            let built: Result<Arc<dyn CompletionGateway>> = match entry.kind {
                ProviderKind::Anthropic => LlmConfig::from_settings(entry)
                    .and_then(AnthropicGateway::new)
                    .map(|g| Arc::new(g) as Arc<dyn CompletionGateway>),
                ProviderKind::OpenAi => OpenAiGateway::from_settings(entry)
                    .map(|g| Arc::new(g) as Arc<dyn CompletionGateway>),
            };
            match built {
                Ok(gateway) => providers.push(gateway),
                Err(e) => warn!("Skipping {:?} provider {}: {}", entry.kind, entry.model, e),
            }
        }
        Self::new(providers)
    }

    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }
}

#[async_trait]
impl CompletionGateway for FallbackGateway {
    async fn complete(&self, request: &CompletionRequest) -> Result<serde_json::Value> {
        let mut errors = Vec::new();

        for (rank, provider) in self.providers.iter().enumerate() {
            match provider.complete(request).await {
                Ok(value) => {
                    if rank > 0 {
                        debug!("Provider {} answered after {} fallback(s)", provider.name(), rank);
                    }
                    return Ok(value);
                }
                Err(AnnotextError::Cancelled) => return Err(AnnotextError::Cancelled),
                Err(e) => {
                    warn!("Provider {} failed: {}", provider.name(), e);
                    let marker = if e.is_retryable() { " [retryable]" } else { "" };
                    errors.push(format!("{}: {}{}", provider.name(), e, marker));
                }
            }
        }

        Err(AnnotextError::AllProvidersFailed(errors))
    }

    fn name(&self) -> &str {
        "fallback"
    }
}
