//! Candidate generation
//!
//! One gateway call per chunk. Output is parsed candidate by candidate: a
//! malformed entry (missing or empty quote, unknown or non-generatable
//! category) is dropped on its own without failing the chunk. A payload with
//! no candidate list is retried like a failed call; only a call that
//! exhausts its retries fails the chunk.

use super::prompts::generation_request;
use super::PassContext;
use crate::config::MAX_CANDIDATES_PER_CHUNK;
use crate::error::{AnnotextError, Result};
use crate::services::complete_and_parse;
use crate::types::{AnnotationCategory, CandidateAnnotation, PromptTag, TextChunk};
use serde_json::Value;
use tracing::debug;

/// Parsed generator output for one chunk
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeneratedCandidates {
    pub candidates: Vec<CandidateAnnotation>,
    /// Entries dropped as malformed
    pub malformed: usize,
}

/// Request up to `max_candidates` candidates for one chunk
pub async fn generate_candidates(
    ctx: PassContext<'_>,
    chunk: &TextChunk,
    tag: Option<&PromptTag>,
    max_candidates: usize,
) -> Result<GeneratedCandidates> {
    let cap = max_candidates.clamp(1, MAX_CANDIDATES_PER_CHUNK);
    let request = generation_request(chunk, ctx.intent, cap);
    let generated = complete_and_parse(ctx.gateway, &request, ctx.policy, ctx.cancel, |value| {
        parse_candidates(value, chunk, tag, cap)
    })
    .await?;
    debug!(
        "Generated {} candidates for {} ({} malformed)",
        generated.candidates.len(),
        chunk.id,
        generated.malformed
    );
    Ok(generated)
}

/// Parse generator output
///
/// Accepts `{"candidates": [...]}` or a bare array. A payload with no
/// candidate list at all is malformed as a whole.
pub fn parse_candidates(
    value: &Value,
    chunk: &TextChunk,
    tag: Option<&PromptTag>,
    cap: usize,
) -> Result<GeneratedCandidates> {
    let entries = match value {
        Value::Array(items) => items,
        Value::Object(map) => match map
            .get("candidates")
            .or_else(|| map.get("annotations"))
            .or_else(|| map.get("highlights"))
        {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(AnnotextError::MalformedResponse(
                    "generator output has no candidate list".to_string(),
                ))
            }
        },
        _ => {
            return Err(AnnotextError::MalformedResponse(
                "generator output is not an object or array".to_string(),
            ))
        }
    };

    let mut generated = GeneratedCandidates::default();
    for entry in entries {
        match parse_entry(entry) {
            Some((quoted_text, category, note)) => {
                if generated.candidates.len() == cap {
                    debug!("Dropping candidates beyond cap of {} for {}", cap, chunk.id);
                    break;
                }
                generated.candidates.push(CandidateAnnotation {
                    chunk_id: chunk.id.clone(),
                    quoted_text,
                    category,
                    note,
                    prompt_index: tag.map(|t| t.index),
                    prompt_color: tag.map(|t| t.color.clone()),
                });
            }
            None => generated.malformed += 1,
        }
    }
    Ok(generated)
}

fn parse_entry(entry: &Value) -> Option<(String, AnnotationCategory, String)> {
    let obj = entry.as_object()?;

    let quote = ["quotedText", "quoted_text", "quote", "text"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_str))?;
    if quote.trim().is_empty() {
        return None;
    }

    let category = AnnotationCategory::parse_generated(obj.get("category")?.as_str()?)?;

    let note = obj
        .get("note")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string();

    Some((quote.to_string(), category, note))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::gateway::MockCompletionGateway;
    use crate::services::RetryPolicy;
    use serde_json::json;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn chunk() -> TextChunk {
        TextChunk {
            id: "chunk-0000".to_string(),
            index: 0,
            document_id: "doc".to_string(),
            text: "The survey covered 400 parishes. Results varied by region.".to_string(),
            start_offset: 0,
            end_offset: 58,
            section_title: None,
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 1,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_malformed_entries_dropped_individually() {
        let value = json!({"candidates": [
            {"quotedText": "The survey covered 400 parishes.", "category": "methodology", "note": "scope"},
            {"quotedText": "", "category": "evidence", "note": "empty"},
            {"quotedText": "Results varied by region.", "category": "summary"},
            {"quotedText": "Results varied by region.", "category": "user_note"},
            {"category": "argument"},
            "not an object",
            {"quotedText": "Results varied by region.", "category": "Evidence"}
        ]});
        let parsed = parse_candidates(&value, &chunk(), None, 5).unwrap();

        assert_eq!(parsed.candidates.len(), 2);
        assert_eq!(parsed.malformed, 5);
        assert_eq!(parsed.candidates[0].category, AnnotationCategory::Methodology);
        assert_eq!(parsed.candidates[1].category, AnnotationCategory::Evidence);
        assert_eq!(parsed.candidates[1].note, "");
    }

    #[test]
    fn test_cap_and_prompt_tag() {
        let entries: Vec<Value> = (0..8)
            .map(|_| json!({"quotedText": "Results varied by region.", "category": "evidence", "note": "n"}))
            .collect();
        let tag = PromptTag {
            index: 1,
            color: "#34d399".to_string(),
        };
        let parsed = parse_candidates(&Value::Array(entries), &chunk(), Some(&tag), 5).unwrap();

        assert_eq!(parsed.candidates.len(), 5);
        assert!(parsed
            .candidates
            .iter()
            .all(|c| c.prompt_index == Some(1) && c.prompt_color.as_deref() == Some("#34d399")));
    }

    #[test]
    fn test_missing_candidate_list_is_malformed() {
        let err = parse_candidates(&json!({"answer": "none"}), &chunk(), None, 5).unwrap_err();
        assert!(matches!(err, AnnotextError::MalformedResponse(_)));
        assert!(parse_candidates(&json!("text"), &chunk(), None, 5).is_err());
    }

    #[tokio::test]
    async fn test_generate_candidates_through_gateway() {
        let mut mock = MockCompletionGateway::new();
        mock.expect_complete()
            .withf(|req| req.prompt.contains("400 parishes") && req.prompt.contains("rural reform"))
            .times(1)
            .returning(|_| {
                Ok(json!({"candidates": [
                    {"quotedText": "The survey covered 400 parishes.", "category": "key_passage", "note": "scope"}
                ]}))
            });

        let cancel = CancellationToken::new();
        let policy = policy();
        let ctx = PassContext {
            gateway: &mock,
            policy: &policy,
            cancel: &cancel,
            intent: "rural reform",
        };
        let generated = generate_candidates(ctx, &chunk(), None, 5).await.unwrap();
        assert_eq!(generated.candidates.len(), 1);
        assert_eq!(generated.candidates[0].chunk_id, "chunk-0000");
    }

    #[tokio::test]
    async fn test_payload_without_candidate_list_is_retried() {
        let mut mock = MockCompletionGateway::new();
        mock.expect_complete()
            .times(2)
            .returning(|_| Ok(json!({"result": "sorry"})));

        let cancel = CancellationToken::new();
        let policy = policy();
        let ctx = PassContext {
            gateway: &mock,
            policy: &policy,
            cancel: &cancel,
            intent: "rural reform",
        };
        let err = generate_candidates(ctx, &chunk(), None, 5).await.unwrap_err();
        assert!(matches!(err, AnnotextError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn test_generation_failure_after_retries() {
        let mut mock = MockCompletionGateway::new();
        mock.expect_complete()
            .times(2)
            .returning(|_| Err(AnnotextError::Timeout(1)));

        let cancel = CancellationToken::new();
        let policy = policy();
        let ctx = PassContext {
            gateway: &mock,
            policy: &policy,
            cancel: &cancel,
            intent: "rural reform",
        };
        let err = generate_candidates(ctx, &chunk(), None, 5).await.unwrap_err();
        assert!(matches!(err, AnnotextError::Timeout(_)));
    }
}
