//! Annotation service
//!
//! The operations the pipeline exposes to route and CLI layers. Each one
//! loads the document from the store, drives the pipeline, and persists the
//! finished runs. Failed runs persist nothing; cancelled runs persist the
//! annotations of chunks that finished before the signal.

use crate::config::PipelineConfig;
use crate::error::Result;
use crate::pipeline::{
    BatchConstraints, BatchCoordinator, BatchMode, BatchResult, MultiPromptCoordinator,
    MultiPromptReport, PromptSet, PromptSpec, RunHandle, RunOrchestrator,
};
use crate::services::{CompletionGateway, FallbackGateway};
use crate::storage::DocumentStore;
use crate::types::{AnalysisRun, RunReport, Thoroughness};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Entry point for analysis operations
#[derive(Clone)]
pub struct AnnotationService {
    store: Arc<dyn DocumentStore>,
    orchestrator: RunOrchestrator,
}

impl AnnotationService {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        gateway: Arc<dyn CompletionGateway>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            orchestrator: RunOrchestrator::new(gateway, Arc::new(config)),
        }
    }

    /// Build the service with the configured provider fallback chain
    pub fn from_config(store: Arc<dyn DocumentStore>, config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let gateway = FallbackGateway::from_settings(&config.providers)?;
        info!(
            "Using {} completion provider(s)",
            gateway.provider_count()
        );
        Ok(Self::new(store, Arc::new(gateway), config))
    }

    pub fn config(&self) -> &PipelineConfig {
        self.orchestrator.config()
    }

    /// Analyze one document against a research intent
    pub async fn analyze_document(
        &self,
        document_id: &str,
        intent: &str,
        thoroughness: Thoroughness,
    ) -> Result<RunReport> {
        self.analyze_document_with_cancel(document_id, intent, thoroughness, CancellationToken::new())
            .await
    }

    pub async fn analyze_document_with_cancel(
        &self,
        document_id: &str,
        intent: &str,
        thoroughness: Thoroughness,
        cancel: CancellationToken,
    ) -> Result<RunReport> {
        let doc = self.store.get_document_text(document_id).await?;
        let run = AnalysisRun::new(document_id, intent, thoroughness);
        let report = self.orchestrator.run(doc, run, cancel).await?;
        self.persist(&report).await?;
        Ok(report)
    }

    /// Start an analysis in the background
    ///
    /// Observe or cancel it through the handle, then pass the handle to
    /// [`AnnotationService::finish`] to collect and persist the result.
    pub async fn start_analysis(
        &self,
        document_id: &str,
        intent: &str,
        thoroughness: Thoroughness,
    ) -> Result<RunHandle> {
        let doc = self.store.get_document_text(document_id).await?;
        let run = AnalysisRun::new(document_id, intent, thoroughness);
        Ok(self.orchestrator.start(doc, run, CancellationToken::new()))
    }

    /// Wait for a started analysis and persist its annotations
    pub async fn finish(&self, handle: RunHandle) -> Result<RunReport> {
        let report = handle.wait().await?;
        self.persist(&report).await?;
        Ok(report)
    }

    /// Analyze one document with several independent prompts
    pub async fn analyze_multi_prompt(
        &self,
        document_id: &str,
        prompts: Vec<PromptSpec>,
        thoroughness: Thoroughness,
        cancel: &CancellationToken,
    ) -> Result<MultiPromptReport> {
        let prompts = PromptSet::new(prompts)?;
        self.analyze_prompt_set(document_id, &prompts, thoroughness, cancel)
            .await
    }

    /// Analyze one document with an already validated prompt set
    pub async fn analyze_prompt_set(
        &self,
        document_id: &str,
        prompts: &PromptSet,
        thoroughness: Thoroughness,
        cancel: &CancellationToken,
    ) -> Result<MultiPromptReport> {
        let doc = self.store.get_document_text(document_id).await?;
        let coordinator = MultiPromptCoordinator::new(self.orchestrator.clone());
        let report = coordinator
            .analyze(&doc, prompts, thoroughness, cancel)
            .await?;
        for run in &report.runs {
            self.persist(run).await?;
        }
        Ok(report)
    }

    /// Analyze many documents under shared constraints
    pub async fn batch_analyze(
        &self,
        document_ids: &[String],
        mode: &BatchMode,
        constraints: &BatchConstraints,
        thoroughness: Thoroughness,
        cancel: &CancellationToken,
    ) -> BTreeMap<String, BatchResult> {
        BatchCoordinator::new(self.orchestrator.clone(), self.store.clone())
            .run(document_ids, mode, constraints, thoroughness, cancel)
            .await
    }

    async fn persist(&self, report: &RunReport) -> Result<()> {
        self.store
            .persist_annotations(&report.run.document_id, &report.run, &report.annotations)
            .await
    }
}
