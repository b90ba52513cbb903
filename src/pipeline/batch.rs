//! Batch analysis across documents
//!
//! Runs the single-document pipeline (one intent, or a prompt set) over many
//! documents with its own bounded pool, filters each document's annotations by
//! the batch constraints, persists what is retained, and reports a status per
//! document. One document failing never fails the batch.

use super::multi_prompt::{MultiPromptCoordinator, PromptSet};
use super::orchestrator::RunOrchestrator;
use crate::error::Result;
use crate::storage::DocumentStore;
use crate::types::{AnalysisRun, AnnotationCategory, FinalAnnotation, RunStage, Thoroughness};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Filters applied to each document's annotations
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchConstraints {
    /// Allowed categories; empty allows all
    #[serde(default)]
    pub categories: Vec<AnnotationCategory>,

    /// Keep at most this many per document, highest confidence first
    #[serde(default)]
    pub max_per_document: Option<usize>,

    #[serde(default)]
    pub min_confidence: Option<f32>,
}

impl BatchConstraints {
    /// Filter one document's annotations; the result is in document order
    pub fn apply(&self, annotations: Vec<FinalAnnotation>) -> Vec<FinalAnnotation> {
        let mut kept: Vec<FinalAnnotation> = annotations
            .into_iter()
            .filter(|a| self.categories.is_empty() || self.categories.contains(&a.category))
            .filter(|a| {
                self.min_confidence
                    .map_or(true, |min| a.confidence_score >= min)
            })
            .collect();

        if let Some(max) = self.max_per_document {
            kept.sort_by(|a, b| {
                b.confidence_score
                    .partial_cmp(&a.confidence_score)
                    .unwrap_or(Ordering::Equal)
                    .then(a.final_start.cmp(&b.final_start))
            });
            kept.truncate(max);
        }

        kept.sort_by_key(|a| (a.final_start, a.final_end));
        kept
    }
}

/// What each document in a batch is analyzed with
#[derive(Debug, Clone)]
pub enum BatchMode {
    Intent(String),
    Prompts(PromptSet),
}

/// Per-document batch outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Succeeded,
    /// Some chunks or prompts failed, or the run was cancelled
    PartiallyFailed,
    Failed,
}

/// Result for one document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    pub document_id: String,
    pub status: BatchStatus,
    /// Annotations kept after filtering
    pub retained: usize,
    pub annotations: Vec<FinalAnnotation>,
    pub runs: Vec<AnalysisRun>,
    pub failed_chunks: usize,
    pub sampled_chunks: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BatchResult {
    fn failed(document_id: &str, error: String) -> Self {
        Self {
            document_id: document_id.to_string(),
            status: BatchStatus::Failed,
            retained: 0,
            annotations: Vec::new(),
            runs: Vec::new(),
            failed_chunks: 0,
            sampled_chunks: 0,
            error: Some(error),
        }
    }
}

/// Runs the pipeline over many documents
#[derive(Clone)]
pub struct BatchCoordinator {
    orchestrator: RunOrchestrator,
    store: Arc<dyn DocumentStore>,
}

impl BatchCoordinator {
    pub fn new(orchestrator: RunOrchestrator, store: Arc<dyn DocumentStore>) -> Self {
        Self {
            orchestrator,
            store,
        }
    }

    /// Analyze every document; duplicates in `document_ids` run once
    pub async fn run(
        &self,
        document_ids: &[String],
        mode: &BatchMode,
        constraints: &BatchConstraints,
        thoroughness: Thoroughness,
        cancel: &CancellationToken,
    ) -> BTreeMap<String, BatchResult> {
        let mut seen = HashSet::new();
        let unique: Vec<&String> = document_ids.iter().filter(|id| seen.insert(*id)).collect();
        let workers = self.orchestrator.config().concurrency.document_workers.max(1);
        info!(
            "Batch over {} documents ({} at a time)",
            unique.len(),
            workers
        );

        let results: Vec<BatchResult> = stream::iter(unique)
            .map(|id| {
                let token = cancel.child_token();
                async move {
                    self.analyze_document(id, mode, constraints, thoroughness, token)
                        .await
                }
            })
            .buffer_unordered(workers)
            .collect()
            .await;

        let succeeded = results
            .iter()
            .filter(|r| r.status == BatchStatus::Succeeded)
            .count();
        info!("Batch finished: {} of {} documents succeeded", succeeded, results.len());

        results
            .into_iter()
            .map(|r| (r.document_id.clone(), r))
            .collect()
    }

    async fn analyze_document(
        &self,
        document_id: &str,
        mode: &BatchMode,
        constraints: &BatchConstraints,
        thoroughness: Thoroughness,
        cancel: CancellationToken,
    ) -> BatchResult {
        let doc = match self.store.get_document_text(document_id).await {
            Ok(doc) => doc,
            Err(e) => {
                warn!("Batch: could not load {}: {}", document_id, e);
                return BatchResult::failed(document_id, e.to_string());
            }
        };

        let (reports, failed_prompts) = match mode {
            BatchMode::Intent(intent) => {
                let run = AnalysisRun::new(document_id, intent.as_str(), thoroughness);
                match self.orchestrator.run(doc, run, cancel).await {
                    Ok(report) => (vec![report], 0),
                    Err(e) => return BatchResult::failed(document_id, e.to_string()),
                }
            }
            BatchMode::Prompts(prompts) => {
                let coordinator = MultiPromptCoordinator::new(self.orchestrator.clone());
                match coordinator.analyze(&doc, prompts, thoroughness, &cancel).await {
                    Ok(report) => (report.runs, report.failures.len()),
                    Err(e) => return BatchResult::failed(document_id, e.to_string()),
                }
            }
        };

        let failed_chunks: usize = reports.iter().map(|r| r.diagnostics.failed_chunks).sum();
        let sampled_chunks: usize = reports.iter().map(|r| r.diagnostics.sampled_chunks).sum();
        let cancelled = reports.iter().any(|r| r.status == RunStage::Cancelled);

        let runs: Vec<AnalysisRun> = reports.iter().map(|r| r.run.clone()).collect();
        let all: Vec<FinalAnnotation> = reports.into_iter().flat_map(|r| r.annotations).collect();
        let annotations = constraints.apply(all);

        let mut status = if failed_chunks > 0 || failed_prompts > 0 || cancelled {
            BatchStatus::PartiallyFailed
        } else {
            BatchStatus::Succeeded
        };
        let mut error = None;
        if let Err(e) = self.persist(document_id, &runs, &annotations).await {
            warn!("Batch: could not persist {}: {}", document_id, e);
            status = BatchStatus::Failed;
            error = Some(e.to_string());
        }

        BatchResult {
            document_id: document_id.to_string(),
            status,
            retained: annotations.len(),
            annotations,
            runs,
            failed_chunks,
            sampled_chunks,
            error,
        }
    }

    /// Persist each run with the retained annotations it produced
    async fn persist(
        &self,
        document_id: &str,
        runs: &[AnalysisRun],
        annotations: &[FinalAnnotation],
    ) -> Result<()> {
        for run in runs {
            let own: Vec<FinalAnnotation> = annotations
                .iter()
                .filter(|a| a.analysis_run_id == run.id)
                .cloned()
                .collect();
            self.store.persist_annotations(document_id, run, &own).await?;
        }
        Ok(())
    }
}
