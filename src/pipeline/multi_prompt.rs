//! Multi-prompt analysis
//!
//! Runs one independent pipeline per prompt against the same document and
//! thoroughness, concurrently, and tags every annotation with the prompt's
//! index and color. Overlapping highlights from different prompts are kept
//! side by side; nothing is deduplicated across prompts.

use super::orchestrator::RunOrchestrator;
use crate::error::{AnnotextError, Result};
use crate::types::{AnalysisRun, FinalAnnotation, PromptTag, RunReport, SourceDocument, Thoroughness};
use futures::stream::{self, StreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Most prompts one analysis accepts
pub const MAX_PROMPTS: usize = 8;

/// Display colors handed to prompts without one, in order
pub const DEFAULT_PALETTE: [&str; MAX_PROMPTS] = [
    "#60a5fa", "#34d399", "#f59e0b", "#f472b6", "#a78bfa", "#f87171", "#fb923c", "#2dd4bf",
];

static HEX_COLOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^#(?:[0-9a-fA-F]{3}|[0-9a-fA-F]{6})$").unwrap());

/// A prompt as supplied by the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptSpec {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

impl PromptSpec {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            color: None,
        }
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = Some(color.into());
        self
    }
}

/// `text` or `text@#rrggbb`
impl FromStr for PromptSpec {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.rsplit_once('@') {
            Some((text, color)) if HEX_COLOR.is_match(color.trim()) => {
                Ok(PromptSpec::new(text.trim()).with_color(color.trim()))
            }
            _ => Ok(PromptSpec::new(s.trim())),
        }
    }
}

/// Validated prompts with assigned indices and colors
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptSet {
    prompts: Vec<(PromptTag, String)>,
}

impl PromptSet {
    /// Validate prompts and assign colors
    ///
    /// Requires 1 to 8 non-empty prompts with distinct, well-formed colors.
    /// Prompts without a color get the first palette entry not already taken.
    pub fn new(specs: Vec<PromptSpec>) -> Result<Self> {
        if specs.is_empty() || specs.len() > MAX_PROMPTS {
            return Err(AnnotextError::InvalidPrompt(format!(
                "expected 1 to {} prompts, got {}",
                MAX_PROMPTS,
                specs.len()
            )));
        }

        let mut taken: Vec<String> = Vec::new();
        for (i, spec) in specs.iter().enumerate() {
            if spec.text.trim().is_empty() {
                return Err(AnnotextError::InvalidPrompt(format!("prompt {} is empty", i)));
            }
            if let Some(color) = &spec.color {
                if !HEX_COLOR.is_match(color) {
                    return Err(AnnotextError::InvalidPrompt(format!(
                        "prompt {} has invalid color {:?}",
                        i, color
                    )));
                }
                let key = color.to_ascii_lowercase();
                if taken.contains(&key) {
                    return Err(AnnotextError::InvalidPrompt(format!(
                        "color {} is used by more than one prompt",
                        color
                    )));
                }
                taken.push(key);
            }
        }

        let mut palette = DEFAULT_PALETTE
            .iter()
            .filter(|c| !taken.contains(&c.to_string()));
        let mut prompts = Vec::with_capacity(specs.len());
        for (index, spec) in specs.into_iter().enumerate() {
            let color = match spec.color {
                Some(color) => color,
                // At most 8 prompts, so the palette cannot run dry
                None => palette
                    .next()
                    .map(|c| c.to_string())
                    .ok_or_else(|| AnnotextError::InvalidPrompt("no free color left".into()))?,
            };
            prompts.push((PromptTag { index, color }, spec.text.trim().to_string()));
        }

        Ok(Self { prompts })
    }

    /// The five standard research prompts for a topic
    ///
    /// Thesis and section goal are optional and fall back to the topic.
    pub fn from_topic(topic: &str, thesis: &str, section_goal: &str) -> Result<Self> {
        let root = topic.trim();
        if root.is_empty() {
            return Err(AnnotextError::InvalidPrompt("topic is empty".into()));
        }
        let thesis = non_empty_or(thesis, root);
        let goal = non_empty_or(section_goal, root);

        Self::new(vec![
            PromptSpec::new(format!("Find direct evidence supporting this thesis claim: {}", thesis)),
            PromptSpec::new(format!("Find counterevidence or limitations related to: {}", goal)),
            PromptSpec::new(format!("Extract methodology-relevant passages connected to: {}", root)),
            PromptSpec::new(format!(
                "Find passages that establish chronology and causal sequence for: {}",
                root
            )),
            PromptSpec::new(format!(
                "Find high-quality quotation candidates suitable for citation on: {}",
                root
            )),
        ])
    }

    pub fn len(&self) -> usize {
        self.prompts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PromptTag, &str)> {
        self.prompts.iter().map(|(tag, text)| (tag, text.as_str()))
    }
}

fn non_empty_or<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    match value.trim() {
        "" => fallback,
        trimmed => trimmed,
    }
}

/// A prompt whose run failed outright
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptFailure {
    pub prompt_index: usize,
    pub prompt_color: String,
    pub error: String,
}

/// Combined output of a multi-prompt analysis
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiPromptReport {
    /// All prompts' annotations, grouped in prompt order
    pub annotations: Vec<FinalAnnotation>,
    /// Per-prompt run reports, in prompt order
    pub runs: Vec<RunReport>,
    pub failures: Vec<PromptFailure>,
}

impl MultiPromptReport {
    /// Annotations produced by one prompt
    pub fn for_prompt(&self, index: usize) -> impl Iterator<Item = &FinalAnnotation> {
        self.annotations
            .iter()
            .filter(move |a| a.prompt_index == Some(index))
    }
}

/// Fans a document out to one run per prompt
#[derive(Clone)]
pub struct MultiPromptCoordinator {
    orchestrator: RunOrchestrator,
}

impl MultiPromptCoordinator {
    pub fn new(orchestrator: RunOrchestrator) -> Self {
        Self { orchestrator }
    }

    /// Run every prompt against `doc`
    ///
    /// Individual prompt failures are reported in the result. Only when every
    /// prompt fails does this return an error (the first prompt's).
    pub async fn analyze(
        &self,
        doc: &SourceDocument,
        prompts: &PromptSet,
        thoroughness: Thoroughness,
        cancel: &CancellationToken,
    ) -> Result<MultiPromptReport> {
        let workers = self.orchestrator.config().concurrency.prompt_workers.max(1);
        info!(
            "Analyzing {} with {} prompts ({} at a time)",
            doc.id(),
            prompts.len(),
            workers
        );

        let mut outcomes: Vec<(PromptTag, Result<RunReport>)> = stream::iter(prompts.iter())
            .map(|(tag, text)| {
                let run = AnalysisRun::new(doc.id(), text, thoroughness).with_prompt(tag);
                let tag = tag.clone();
                let doc = doc.clone();
                let token = cancel.child_token();
                async move {
                    let result = self.orchestrator.run(doc, run, token).await;
                    (tag, result)
                }
            })
            .buffer_unordered(workers)
            .collect()
            .await;
        outcomes.sort_by_key(|(tag, _)| tag.index);

        let mut report = MultiPromptReport {
            annotations: Vec::new(),
            runs: Vec::new(),
            failures: Vec::new(),
        };
        let mut first_error = None;

        for (tag, outcome) in outcomes {
            match outcome {
                Ok(mut run_report) => {
                    for annotation in &mut run_report.annotations {
                        annotation.prompt_index = Some(tag.index);
                        annotation.prompt_color = Some(tag.color.clone());
                    }
                    report.annotations.extend(run_report.annotations.iter().cloned());
                    report.runs.push(run_report);
                }
                Err(e) => {
                    warn!("Prompt {} ({}) failed: {}", tag.index, tag.color, e);
                    report.failures.push(PromptFailure {
                        prompt_index: tag.index,
                        prompt_color: tag.color.clone(),
                        error: e.to_string(),
                    });
                    first_error.get_or_insert(e);
                }
            }
        }

        if report.runs.is_empty() {
            if let Some(e) = first_error {
                return Err(e);
            }
        }
        Ok(report)
    }
}
