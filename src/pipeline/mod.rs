//! Annotation extraction pipeline
//!
//! Stages, leaves first:
//! - [`chunker`]: overlapping, offset-tracked windows
//! - [`sampler`]: which chunks a run analyzes
//! - [`generator`]: candidate highlights per chunk
//! - [`resolver`]: quotes mapped back to document offsets
//! - [`hard_verifier`]: approve, reject or reclassify
//! - [`soft_verifier`]: confidence and boundary refinement
//! - [`orchestrator`]: one run over one document
//! - [`multi_prompt`]: several independent runs, tagged per prompt
//! - [`batch`]: many documents under shared constraints

pub mod batch;
pub mod budget;
pub mod chunker;
pub mod events;
pub mod generator;
pub mod hard_verifier;
pub mod multi_prompt;
pub mod ocr;
pub mod orchestrator;
pub mod prompts;
pub mod resolver;
pub mod sampler;
pub mod soft_verifier;

use crate::services::{CompletionGateway, RetryPolicy};
use tokio_util::sync::CancellationToken;

pub use batch::{BatchConstraints, BatchCoordinator, BatchMode, BatchResult, BatchStatus};
pub use chunker::chunk_document;
pub use events::{EventBroadcaster, RunEvent};
pub use multi_prompt::{MultiPromptCoordinator, MultiPromptReport, PromptSet, PromptSpec};
pub use orchestrator::{RunHandle, RunOrchestrator};
pub use sampler::sample_chunks;

/// What every gateway pass of a run needs
#[derive(Clone, Copy)]
pub struct PassContext<'a> {
    pub gateway: &'a dyn CompletionGateway,
    pub policy: &'a RetryPolicy,
    pub cancel: &'a CancellationToken,
    /// Research intent, or the explicit prompt in multi-prompt mode
    pub intent: &'a str,
}
