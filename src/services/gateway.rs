//! Completion gateway abstraction
//!
//! The pipeline never talks to a provider directly. Every pass builds a
//! [`CompletionRequest`] and hands it to a [`CompletionGateway`], which returns
//! the structured JSON payload the model produced.

use crate::error::{AnnotextError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Which pipeline pass issued a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionPurpose {
    Generate,
    HardVerify,
    SoftVerify,
}

/// Provider-agnostic prompt payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub purpose: CompletionPurpose,
    pub system: String,
    pub prompt: String,
    pub max_tokens: usize,
}

/// Text-completion service returning structured output
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CompletionGateway: Send + Sync {
    /// Send one request and return the parsed JSON payload
    async fn complete(&self, request: &CompletionRequest) -> Result<serde_json::Value>;

    /// Provider name for logs and diagnostics
    fn name(&self) -> &str;
}

/// Pull the JSON payload out of free-form model text
///
/// Accepts a bare JSON document, a fenced ```json block, or the first
/// balanced object/array embedded in surrounding prose.
pub fn extract_json_payload(text: &str) -> Result<serde_json::Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Ok(value);
    }

    if let Some(fenced) = fenced_block(trimmed) {
        if let Ok(value) = serde_json::from_str(fenced) {
            return Ok(value);
        }
    }

    if let Some(span) = balanced_span(trimmed) {
        if let Ok(value) = serde_json::from_str(span) {
            return Ok(value);
        }
    }

    let preview: String = trimmed.chars().take(120).collect();
    Err(AnnotextError::MalformedResponse(format!(
        "no JSON payload in model output: {}",
        preview
    )))
}

fn fenced_block(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after = &text[start + 3..];
    // Skip the language tag line
    let body_start = after.find('\n')? + 1;
    let body = &after[body_start..];
    let end = body.find("```")?;
    Some(body[..end].trim())
}

/// First `{...}` or `[...]` span with balanced brackets, ignoring brackets in strings
fn balanced_span(text: &str) -> Option<&str> {
    let start = text.find(['{', '['])?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(&text[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}
