//! Annotext - Multi-phase annotation extraction for long documents
//!
//! Points an LLM-backed extraction pipeline at a document and a research
//! intent and returns highlighted passages, classified by type, with
//! confidence scores and provenance:
//! - Overlapping, offset-tracked chunking with sentence-boundary snapping
//! - Thoroughness-controlled sampling across the whole document
//! - Candidate generation, hard verification and soft scoring passes
//! - Every highlight reconciled to exact character offsets in the source
//! - Concurrent multi-prompt runs and multi-document batches
//!
//! # Architecture
//!
//! - **Types**: documents, chunks, the candidate → final annotation progression
//! - **Services**: completion gateway trait, provider gateways, fallback, retry
//! - **Pipeline**: the stages and the orchestrators that drive them
//! - **Storage**: document source and annotation sink
//!
//! # Example
//!
//! ```ignore
//! use annotext_core::{AnnotationService, MemoryStore, PipelineConfig, Thoroughness};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(MemoryStore::new());
//!     store.insert_document("treaty", &std::fs::read_to_string("treaty.txt")?).await;
//!
//!     let service = AnnotationService::from_config(store, PipelineConfig::default())?;
//!     let report = service
//!         .analyze_document("treaty", "territorial concessions", Thoroughness::Standard)
//!         .await?;
//!
//!     for annotation in &report.annotations {
//!         println!("[{}] {}", annotation.category, annotation.highlighted_text);
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod pipeline;
pub mod service;
pub mod services;
pub mod storage;
pub mod types;

// Re-export commonly used types
pub use config::PipelineConfig;
pub use error::{AnnotextError, Result};
pub use pipeline::{
    BatchConstraints, BatchMode, BatchResult, BatchStatus, MultiPromptReport, PromptSet,
    PromptSpec, RunEvent, RunHandle, RunOrchestrator,
};
pub use service::AnnotationService;
pub use services::{CompletionGateway, CompletionRequest, FallbackGateway};
pub use storage::{DocumentStore, FsStore, MemoryStore};
pub use types::{
    AnalysisRun, AnnotationCategory, FinalAnnotation, RunDiagnostics, RunId, RunReport, RunStage,
    SourceDocument, TextChunk, Thoroughness,
};
