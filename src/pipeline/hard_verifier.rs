//! Hard verification
//!
//! Reviews every resolved candidate of a chunk in one gateway call. Each
//! candidate is approved, rejected or reclassified; reclassification changes
//! only the category. Candidates the reviewer skips are rejected and counted
//! as unreviewed. Rejection is terminal.

use super::budget::{allocate, context_window};
use super::prompts::{hard_verification_request, ReviewItem};
use super::PassContext;
use crate::config::VerificationSettings;
use crate::error::{AnnotextError, Result};
use crate::services::complete_and_parse;
use crate::types::{
    AnnotationCategory, ResolvedCandidate, RunDiagnostics, TextChunk, VerifiedCandidate,
    VerifierDecision,
};
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

/// Review a chunk's resolved candidates
///
/// Returns one [`VerifiedCandidate`] per input, rejected ones included.
pub async fn verify_candidates(
    ctx: PassContext<'_>,
    chunk: &TextChunk,
    resolved: Vec<ResolvedCandidate>,
    settings: &VerificationSettings,
    diagnostics: &mut RunDiagnostics,
) -> Result<Vec<VerifiedCandidate>> {
    if resolved.is_empty() {
        return Ok(Vec::new());
    }

    let per_item = allocate(
        settings.context_budget_chars,
        resolved.len(),
        settings.min_context_chars,
        settings.max_context_chars,
    );
    let items: Vec<ReviewItem<'_>> = resolved
        .iter()
        .map(|r| {
            let local_start = r.start_offset - chunk.start_offset;
            let local_end = r.end_offset - chunk.start_offset;
            ReviewItem {
                category: r.candidate.category,
                quote: &r.highlighted_text,
                note: &r.candidate.note,
                context: context_window(&chunk.text, local_start, local_end, per_item),
            }
        })
        .collect();

    let request = hard_verification_request(ctx.intent, &items);
    let decisions =
        complete_and_parse(ctx.gateway, &request, ctx.policy, ctx.cancel, parse_decisions).await?;

    let verified = apply_decisions(resolved, &decisions, diagnostics);
    debug!(
        "Hard verification of {}: {} of {} accepted",
        chunk.id,
        verified.iter().filter(|v| v.is_accepted()).count(),
        verified.len()
    );
    Ok(verified)
}

/// A reviewer decision as parsed from model output
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedDecision {
    pub decision: VerifierDecision,
    pub category: Option<AnnotationCategory>,
    pub reason: Option<String>,
}

/// Parse `{"decisions": [{"index", "decision", "category", "reason"}]}` keyed by index
///
/// Entries with a missing index or unknown decision are skipped, which leaves
/// that candidate unreviewed.
pub fn parse_decisions(value: &Value) -> Result<HashMap<usize, ParsedDecision>> {
    let entries = match value {
        Value::Array(items) => items,
        Value::Object(map) => match map.get("decisions").or_else(|| map.get("reviews")) {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(AnnotextError::MalformedResponse(
                    "verifier output has no decision list".to_string(),
                ))
            }
        },
        _ => {
            return Err(AnnotextError::MalformedResponse(
                "verifier output is not an object or array".to_string(),
            ))
        }
    };

    let mut decisions = HashMap::new();
    for entry in entries {
        let Some(obj) = entry.as_object() else {
            continue;
        };
        let Some(index) = obj.get("index").and_then(Value::as_u64) else {
            continue;
        };
        let Some(decision) = obj
            .get("decision")
            .and_then(Value::as_str)
            .and_then(parse_decision)
        else {
            continue;
        };

        decisions.insert(
            index as usize,
            ParsedDecision {
                decision,
                category: obj
                    .get("category")
                    .and_then(Value::as_str)
                    .and_then(AnnotationCategory::parse_generated),
                reason: obj
                    .get("reason")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            },
        );
    }
    Ok(decisions)
}

fn parse_decision(raw: &str) -> Option<VerifierDecision> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "approve" | "approved" | "accept" | "accepted" | "keep" => Some(VerifierDecision::Approved),
        "reject" | "rejected" | "drop" => Some(VerifierDecision::Rejected),
        "reclassify" | "reclassified" | "recategorize" => Some(VerifierDecision::Reclassified),
        _ => None,
    }
}

/// Pair candidates with decisions by position
pub fn apply_decisions(
    resolved: Vec<ResolvedCandidate>,
    decisions: &HashMap<usize, ParsedDecision>,
    diagnostics: &mut RunDiagnostics,
) -> Vec<VerifiedCandidate> {
    resolved
        .into_iter()
        .enumerate()
        .map(|(i, resolved)| {
            let Some(parsed) = decisions.get(&i) else {
                diagnostics.unreviewed += 1;
                diagnostics.rejected += 1;
                return VerifiedCandidate {
                    resolved,
                    decision: VerifierDecision::Rejected,
                    revised_category: None,
                    reason: Some("not reviewed".to_string()),
                };
            };

            let (decision, revised_category) = match parsed.decision {
                VerifierDecision::Reclassified => match parsed.category {
                    Some(category) if category != resolved.candidate.category => {
                        (VerifierDecision::Reclassified, Some(category))
                    }
                    // Reclassified to nothing new: relevant as it stands
                    _ => (VerifierDecision::Approved, None),
                },
                other => (other, None),
            };

            match decision {
                VerifierDecision::Approved => diagnostics.approved += 1,
                VerifierDecision::Rejected => diagnostics.rejected += 1,
                VerifierDecision::Reclassified => diagnostics.reclassified += 1,
            }

            VerifiedCandidate {
                resolved,
                decision,
                revised_category,
                reason: parsed.reason.clone(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::gateway::MockCompletionGateway;
    use crate::services::RetryPolicy;
    use crate::types::{CandidateAnnotation, MatchKind};
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    fn chunk() -> TextChunk {
        let text = "One. Two. Three. Four. Five. Six.";
        TextChunk {
            id: "chunk-0000".to_string(),
            index: 0,
            document_id: "doc".to_string(),
            text: text.to_string(),
            start_offset: 0,
            end_offset: text.chars().count(),
            section_title: None,
        }
    }

    fn resolved(quote: &str, start: usize) -> ResolvedCandidate {
        ResolvedCandidate {
            candidate: CandidateAnnotation {
                chunk_id: "chunk-0000".to_string(),
                quoted_text: quote.to_string(),
                category: AnnotationCategory::Evidence,
                note: String::new(),
                prompt_index: None,
                prompt_color: None,
            },
            start_offset: start,
            end_offset: start + quote.chars().count(),
            highlighted_text: quote.to_string(),
            match_kind: MatchKind::Exact,
        }
    }

    fn five() -> Vec<ResolvedCandidate> {
        vec![
            resolved("One.", 0),
            resolved("Two.", 5),
            resolved("Three.", 10),
            resolved("Four.", 17),
            resolved("Five.", 23),
        ]
    }

    #[tokio::test]
    async fn test_two_of_five_rejected() {
        let mut mock = MockCompletionGateway::new();
        mock.expect_complete().times(1).returning(|_| {
            Ok(json!({"decisions": [
                {"index": 0, "decision": "approve", "reason": "on topic"},
                {"index": 1, "decision": "reject", "reason": "trivial"},
                {"index": 2, "decision": "approve"},
                {"index": 3, "decision": "reject"},
                {"index": 4, "decision": "reclassify", "category": "argument"}
            ]}))
        });

        let cancel = CancellationToken::new();
        let policy = RetryPolicy::default();
        let ctx = PassContext {
            gateway: &mock,
            policy: &policy,
            cancel: &cancel,
            intent: "counting",
        };
        let mut diag = RunDiagnostics::default();
        let verified = verify_candidates(
            ctx,
            &chunk(),
            five(),
            &VerificationSettings::default(),
            &mut diag,
        )
        .await
        .unwrap();

        assert_eq!(verified.len(), 5);
        assert_eq!(verified.iter().filter(|v| v.is_accepted()).count(), 3);
        assert_eq!(diag.approved, 2);
        assert_eq!(diag.rejected, 2);
        assert_eq!(diag.reclassified, 1);

        let reclassified = &verified[4];
        assert_eq!(reclassified.effective_category(), AnnotationCategory::Argument);
        assert_eq!(reclassified.resolved.start_offset, 23);
        assert_eq!(reclassified.resolved.end_offset, 28);
    }

    #[test]
    fn test_omitted_decisions_are_rejected_as_unreviewed() {
        let decisions = parse_decisions(&json!({"decisions": [
            {"index": 1, "decision": "approved"},
            {"index": 2, "decision": "maybe"},
            {"decision": "approve"}
        ]}))
        .unwrap();
        let mut diag = RunDiagnostics::default();
        let verified = apply_decisions(five(), &decisions, &mut diag);

        assert_eq!(diag.approved, 1);
        assert_eq!(diag.unreviewed, 4);
        assert_eq!(diag.rejected, 4);
        assert!(verified[1].is_accepted());
        assert!(!verified[0].is_accepted());
    }

    #[test]
    fn test_reclassify_without_new_category_keeps_original() {
        let decisions = parse_decisions(&json!([
            {"index": 0, "decision": "reclassify", "category": "evidence"},
            {"index": 1, "decision": "reclassify", "category": "user_note"}
        ]))
        .unwrap();
        let mut diag = RunDiagnostics::default();
        let verified = apply_decisions(five()[..2].to_vec(), &decisions, &mut diag);

        assert!(verified
            .iter()
            .all(|v| v.decision == VerifierDecision::Approved && v.revised_category.is_none()));
        assert_eq!(diag.reclassified, 0);
    }

    #[test]
    fn test_missing_decision_list_is_malformed() {
        assert!(matches!(
            parse_decisions(&json!({"ok": true})),
            Err(AnnotextError::MalformedResponse(_))
        ));
    }
}
