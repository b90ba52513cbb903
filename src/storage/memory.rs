//! In-process document store

use super::{DocumentStore, StoredRun};
use crate::error::{AnnotextError, Result};
use crate::types::{AnalysisRun, FinalAnnotation, SourceDocument};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

/// Documents and persisted runs held in memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    documents: RwLock<HashMap<String, SourceDocument>>,
    runs: RwLock<HashMap<String, Vec<StoredRun>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a document
    pub async fn insert_document(&self, document_id: impl Into<String>, text: &str) {
        let id = document_id.into();
        let doc = SourceDocument::new(id.clone(), text);
        self.documents.write().await.insert(id, doc);
    }

    /// Runs persisted for a document, in persistence order
    pub async fn runs_for(&self, document_id: &str) -> Vec<StoredRun> {
        self.runs
            .read()
            .await
            .get(document_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Total persisted annotations for a document
    pub async fn annotation_count(&self, document_id: &str) -> usize {
        self.runs
            .read()
            .await
            .get(document_id)
            .map(|runs| runs.iter().map(|r| r.annotations.len()).sum())
            .unwrap_or(0)
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get_document_text(&self, document_id: &str) -> Result<SourceDocument> {
        self.documents
            .read()
            .await
            .get(document_id)
            .cloned()
            .ok_or_else(|| AnnotextError::DocumentNotFound(document_id.to_string()))
    }

    async fn persist_annotations(
        &self,
        document_id: &str,
        run: &AnalysisRun,
        annotations: &[FinalAnnotation],
    ) -> Result<()> {
        debug!(
            "Persisting {} annotations for run {} on {}",
            annotations.len(),
            run.id,
            document_id
        );
        self.runs
            .write()
            .await
            .entry(document_id.to_string())
            .or_default()
            .push(StoredRun {
                run: run.clone(),
                annotations: annotations.to_vec(),
            });
        Ok(())
    }
}
