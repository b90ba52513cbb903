//! Storage collaborator for annotext
//!
//! The pipeline only reads document text and hands finished runs back for
//! persistence. [`MemoryStore`] keeps everything in process; [`FsStore`]
//! reads plain-text documents from a directory and writes one JSON file per
//! run.

pub mod fs;
pub mod memory;

use crate::error::Result;
use crate::types::{AnalysisRun, FinalAnnotation, SourceDocument};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use fs::FsStore;
pub use memory::MemoryStore;

/// Document source and annotation sink
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Load a document's full text
    async fn get_document_text(&self, document_id: &str) -> Result<SourceDocument>;

    /// Persist the final annotations of one analysis run
    async fn persist_annotations(
        &self,
        document_id: &str,
        run: &AnalysisRun,
        annotations: &[FinalAnnotation],
    ) -> Result<()>;
}

/// A persisted run with its annotations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRun {
    pub run: AnalysisRun,
    pub annotations: Vec<FinalAnnotation>,
}
