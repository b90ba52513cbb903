//! Common test utilities and helpers
//!
//! Integration tests drive the real pipeline against [`ScriptedGateway`], an
//! in-process completion gateway whose answers are computed from the request
//! prompt. Nothing here talks to a network provider.

#![allow(dead_code)]

use annotext_core::config::PipelineConfig;
use annotext_core::error::{AnnotextError, Result};
use annotext_core::services::gateway::{CompletionPurpose, CompletionRequest};
use annotext_core::{CompletionGateway, FinalAnnotation, MemoryStore, SourceDocument};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

type Responder = dyn Fn(&CompletionRequest) -> Result<Value> + Send + Sync;

/// Gateway answering from a closure, with per-pass call counters
pub struct ScriptedGateway {
    name: String,
    responder: Box<Responder>,
    slow: Option<(String, Duration)>,
    generate_calls: AtomicUsize,
    hard_calls: AtomicUsize,
    soft_calls: AtomicUsize,
}

impl ScriptedGateway {
    pub fn new<F>(name: &str, responder: F) -> Self
    where
        F: Fn(&CompletionRequest) -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            responder: Box::new(responder),
            slow: None,
            generate_calls: AtomicUsize::new(0),
            hard_calls: AtomicUsize::new(0),
            soft_calls: AtomicUsize::new(0),
        }
    }

    /// Quotes whole sentences, approves everything, scores 0.8
    pub fn echo() -> Self {
        Self::new("echo", echo_response)
    }

    /// Always fails with the given error factory
    pub fn failing<F>(name: &str, error: F) -> Self
    where
        F: Fn() -> AnnotextError + Send + Sync + 'static,
    {
        Self::new(name, move |_| Err(error()))
    }

    /// Hold every request whose prompt contains `marker` for `delay`
    pub fn with_slow_marker(mut self, marker: &str, delay: Duration) -> Self {
        self.slow = Some((marker.to_string(), delay));
        self
    }

    pub fn calls(&self, purpose: CompletionPurpose) -> usize {
        self.counter(purpose).load(Ordering::SeqCst)
    }

    pub fn total_calls(&self) -> usize {
        self.calls(CompletionPurpose::Generate)
            + self.calls(CompletionPurpose::HardVerify)
            + self.calls(CompletionPurpose::SoftVerify)
    }

    fn counter(&self, purpose: CompletionPurpose) -> &AtomicUsize {
        match purpose {
            CompletionPurpose::Generate => &self.generate_calls,
            CompletionPurpose::HardVerify => &self.hard_calls,
            CompletionPurpose::SoftVerify => &self.soft_calls,
        }
    }
}

#[async_trait]
impl CompletionGateway for ScriptedGateway {
    async fn complete(&self, request: &CompletionRequest) -> Result<Value> {
        if let Some((marker, delay)) = &self.slow {
            if request.prompt.contains(marker.as_str()) {
                tokio::time::sleep(*delay).await;
            }
        }
        let result = (self.responder)(request);
        self.counter(request.purpose).fetch_add(1, Ordering::SeqCst);
        result
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Default answers for all three passes
pub fn echo_response(request: &CompletionRequest) -> Result<Value> {
    match request.purpose {
        CompletionPurpose::Generate => {
            let quotes: Vec<String> = sentences(excerpt(&request.prompt))
                .into_iter()
                .take(2)
                .collect();
            Ok(candidates_json(&quotes, "evidence"))
        }
        CompletionPurpose::HardVerify => Ok(approve_all(review_count(&request.prompt))),
        CompletionPurpose::SoftVerify => Ok(score_all(review_count(&request.prompt), 0.8)),
    }
}

/// The chunk text embedded in a generation prompt
pub fn excerpt(prompt: &str) -> &str {
    let open = "Excerpt:\n\"\"\"\n";
    let Some(start) = prompt.find(open).map(|i| i + open.len()) else {
        return "";
    };
    let rest = &prompt[start..];
    match rest.find("\n\"\"\"") {
        Some(end) => &rest[..end],
        None => rest,
    }
}

/// Sentence-like segments of at least 20 chars, trimmed
pub fn sentences(text: &str) -> Vec<String> {
    text.split_inclusive(". ")
        .map(str::trim)
        .filter(|s| s.ends_with('.') && s.len() >= 20)
        .map(str::to_string)
        .collect()
}

/// Number of highlights listed in a verifier prompt
pub fn review_count(prompt: &str) -> usize {
    prompt
        .lines()
        .filter(|line| line.starts_with('[') && line.contains("] category:"))
        .count()
}

/// Quotes listed in a verifier prompt, in index order
pub fn review_quotes(prompt: &str) -> Vec<String> {
    prompt
        .lines()
        .filter_map(|line| line.strip_prefix("quote: \""))
        .map(|rest| rest.strip_suffix('"').unwrap_or(rest).to_string())
        .collect()
}

pub fn candidates_json(quotes: &[String], category: &str) -> Value {
    let entries: Vec<Value> = quotes
        .iter()
        .map(|q| json!({"quotedText": q, "category": category, "note": "relevant"}))
        .collect();
    json!({ "candidates": entries })
}

pub fn approve_all(count: usize) -> Value {
    let decisions: Vec<Value> = (0..count)
        .map(|i| json!({"index": i, "decision": "approve", "category": null, "reason": "fits"}))
        .collect();
    json!({ "decisions": decisions })
}

pub fn score_all(count: usize, confidence: f32) -> Value {
    let scores: Vec<Value> = (0..count)
        .map(|i| json!({"index": i, "confidence": confidence, "truncated": false}))
        .collect();
    json!({ "scores": scores })
}

/// Distinct sentences, each about 70 chars, joined with single spaces
pub fn sentence_document(count: usize) -> String {
    (0..count)
        .map(|i| {
            format!(
                "Entry {:03} records that the parish council approved the harbour levy.",
                i
            )
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Configuration with fast retries and one worker per chunk
pub fn test_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.retry.max_retries = 2;
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 2;
    config.retry.timeout_secs = 120;
    config.concurrency.chunk_workers = 8;
    config
}

pub async fn create_test_store(documents: &[(&str, &str)]) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    for (id, text) in documents {
        store.insert_document(*id, text).await;
    }
    store
}

/// Check the offset and confidence invariants of a finished annotation
pub fn assert_annotation_invariants(doc: &SourceDocument, annotation: &FinalAnnotation) {
    assert!(annotation.final_start < annotation.final_end);
    assert!(annotation.final_end <= doc.len());
    assert_eq!(
        doc.slice(annotation.final_start, annotation.final_end)
            .as_deref(),
        Some(annotation.highlighted_text.as_str())
    );
    assert!((0.0..=1.0).contains(&annotation.confidence_score));
}
