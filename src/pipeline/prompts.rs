//! Prompt templates for the three gateway passes
//!
//! Each builder returns a ready [`CompletionRequest`]. Output contracts are
//! spelled out as JSON so every provider can be parsed the same way.

use crate::services::gateway::{CompletionPurpose, CompletionRequest};
use crate::types::{AnnotationCategory, TextChunk};

const GENERATOR_SYSTEM: &str = "You are a careful research assistant who highlights passages in \
scholarly and archival documents. You only quote text that appears verbatim in the excerpt you \
are given. You answer with JSON only.";

const HARD_VERIFIER_SYSTEM: &str = "You are a strict reviewer checking proposed highlights \
against a research intent. Reject anything off-topic, trivial, or misclassified beyond repair. \
You answer with JSON only.";

const SOFT_VERIFIER_SYSTEM: &str = "You score how well approved highlights serve a research \
intent and flag quotes that stop mid-sentence. You answer with JSON only.";

const GENERATOR_TOKENS: usize = 1500;
const HARD_VERIFIER_TOKENS: usize = 1000;
const SOFT_VERIFIER_TOKENS: usize = 800;

fn category_list() -> String {
    AnnotationCategory::GENERATED
        .iter()
        .map(|c| c.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Candidate generation request for one chunk
pub fn generation_request(chunk: &TextChunk, intent: &str, max_candidates: usize) -> CompletionRequest {
    let section = chunk
        .section_title
        .as_deref()
        .map(|t| format!("Section: {}\n", t))
        .unwrap_or_default();

    let prompt = format!(
        r#"Research intent:
{intent}

{section}Excerpt:
"""
{text}
"""

Highlight at most {max} passages from the excerpt that matter for the research intent.
Rules:
- quotedText must be copied verbatim from the excerpt (a sentence or a few sentences).
- category must be one of: {categories}
- note explains in one sentence why the passage matters for the intent.
- Return an empty list if nothing in the excerpt is relevant.

Respond with JSON exactly in this shape:
{{"candidates": [{{"quotedText": "...", "category": "...", "note": "..."}}]}}"#,
        intent = intent,
        section = section,
        text = chunk.text,
        max = max_candidates,
        categories = category_list(),
    );

    CompletionRequest {
        purpose: CompletionPurpose::Generate,
        system: GENERATOR_SYSTEM.to_string(),
        prompt,
        max_tokens: GENERATOR_TOKENS,
    }
}

/// One candidate as shown to a verifier
pub struct ReviewItem<'a> {
    pub category: AnnotationCategory,
    pub quote: &'a str,
    pub note: &'a str,
    pub context: String,
}

/// Hard verification request for a batch of resolved candidates
pub fn hard_verification_request(intent: &str, items: &[ReviewItem<'_>]) -> CompletionRequest {
    let listing = items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            format!(
                "[{}] category: {}\nquote: \"{}\"\nnote: {}\ncontext: \"{}\"",
                i, item.category, item.quote, item.note, item.context
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    let prompt = format!(
        r#"Research intent:
{intent}

Proposed highlights:
{listing}

For every highlight decide:
- "approve": relevant to the intent and correctly categorized
- "reject": irrelevant, trivial, or unsupported by the context
- "reclassify": relevant but the category is wrong; give the right one ({categories})

Respond with JSON exactly in this shape, one entry per highlight index:
{{"decisions": [{{"index": 0, "decision": "approve", "category": null, "reason": "..."}}]}}"#,
        intent = intent,
        listing = listing,
        categories = category_list(),
    );

    CompletionRequest {
        purpose: CompletionPurpose::HardVerify,
        system: HARD_VERIFIER_SYSTEM.to_string(),
        prompt,
        max_tokens: HARD_VERIFIER_TOKENS,
    }
}

/// Soft verification (scoring) request for approved candidates
pub fn soft_verification_request(intent: &str, items: &[ReviewItem<'_>]) -> CompletionRequest {
    let listing = items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            format!(
                "[{}] category: {}\nquote: \"{}\"\nnote: {}",
                i, item.category, item.quote, item.note
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    let prompt = format!(
        r#"Research intent:
{intent}

Approved highlights:
{listing}

For every highlight give a confidence between 0.0 and 1.0 for how strongly it serves the
intent, and set "truncated" to true if the quote starts or stops mid-sentence.

Respond with JSON exactly in this shape, one entry per highlight index:
{{"scores": [{{"index": 0, "confidence": 0.8, "truncated": false}}]}}"#,
        intent = intent,
        listing = listing,
    );

    CompletionRequest {
        purpose: CompletionPurpose::SoftVerify,
        system: SOFT_VERIFIER_SYSTEM.to_string(),
        prompt,
        max_tokens: SOFT_VERIFIER_TOKENS,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk() -> TextChunk {
        TextChunk {
            id: "chunk-0001".to_string(),
            index: 1,
            document_id: "d".to_string(),
            text: "The treaty was signed in 1648.".to_string(),
            start_offset: 10,
            end_offset: 40,
            section_title: Some("Background".to_string()),
        }
    }

    #[test]
    fn test_generation_request_contents() {
        let request = generation_request(&chunk(), "origins of sovereignty", 5);
        assert_eq!(request.purpose, CompletionPurpose::Generate);
        assert!(request.prompt.contains("origins of sovereignty"));
        assert!(request.prompt.contains("The treaty was signed in 1648."));
        assert!(request.prompt.contains("Section: Background"));
        assert!(request.prompt.contains("at most 5 passages"));
        assert!(request.prompt.contains("key_passage, argument, evidence, methodology"));
        assert!(!request.prompt.contains("user_note"));
    }

    #[test]
    fn test_verification_requests_enumerate_items() {
        let items = vec![
            ReviewItem {
                category: AnnotationCategory::Evidence,
                quote: "signed in 1648",
                note: "date",
                context: "The treaty was signed in 1648.".to_string(),
            },
            ReviewItem {
                category: AnnotationCategory::Argument,
                quote: "The treaty",
                note: "subject",
                context: String::new(),
            },
        ];
        let hard = hard_verification_request("intent", &items);
        assert_eq!(hard.purpose, CompletionPurpose::HardVerify);
        assert!(hard.prompt.contains("[0] category: evidence"));
        assert!(hard.prompt.contains("[1] category: argument"));

        let soft = soft_verification_request("intent", &items);
        assert_eq!(soft.purpose, CompletionPurpose::SoftVerify);
        assert!(soft.prompt.contains("\"truncated\""));
    }
}
