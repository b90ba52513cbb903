//! Run orchestration
//!
//! Drives one analysis run over one document:
//!
//! ```text
//! sampling → generating → resolving → hard-verifying → soft-verifying → complete
//!                                                                    ↘ failed | cancelled
//! ```
//!
//! Every sampled chunk goes through the stages as its own task, bounded by a
//! semaphore sized for the provider's rate limits. Chunk tasks report their
//! stage over a channel; the run stage is the earliest stage of any unfinished
//! chunk and never moves backwards. Results are merged only after every chunk
//! task has settled.

use super::chunker::chunk_document;
use super::events::{EventBroadcaster, RunEvent};
use super::generator::generate_candidates;
use super::hard_verifier::verify_candidates;
use super::resolver::resolve_candidates;
use super::sampler::sample_chunks;
use super::soft_verifier::finalize_candidates;
use super::PassContext;
use crate::config::PipelineConfig;
use crate::error::{AnnotextError, Result};
use crate::services::{CompletionGateway, RetryPolicy};
use crate::types::{
    AnalysisRun, ChunkFailure, FinalAnnotation, RunDiagnostics, RunId, RunReport, RunStage,
    SourceDocument, TextChunk,
};
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How one chunk task ended
#[derive(Debug)]
enum ChunkOutcome {
    Completed {
        annotations: Vec<FinalAnnotation>,
        diagnostics: RunDiagnostics,
    },
    Failed {
        failure: ChunkFailure,
        diagnostics: RunDiagnostics,
    },
    Cancelled,
}

/// Runs the single-document pipeline
#[derive(Clone)]
pub struct RunOrchestrator {
    gateway: Arc<dyn CompletionGateway>,
    config: Arc<PipelineConfig>,
}

impl RunOrchestrator {
    pub fn new(gateway: Arc<dyn CompletionGateway>, config: Arc<PipelineConfig>) -> Self {
        Self { gateway, config }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run to a terminal state without observers
    pub async fn run(
        &self,
        doc: SourceDocument,
        run: AnalysisRun,
        cancel: CancellationToken,
    ) -> Result<RunReport> {
        let (stage_tx, _stage_rx) = watch::channel(RunStage::Sampling);
        self.run_observed(doc, run, cancel, &EventBroadcaster::new(16), &stage_tx)
            .await
    }

    /// Start a run in the background and return its handle
    pub fn start(
        &self,
        doc: SourceDocument,
        run: AnalysisRun,
        cancel: CancellationToken,
    ) -> RunHandle {
        let run_id = run.id;
        let events = EventBroadcaster::default();
        let (stage_tx, stage_rx) = watch::channel(RunStage::Sampling);

        let orchestrator = self.clone();
        let task_events = events.clone();
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            orchestrator
                .run_observed(doc, run, task_cancel, &task_events, &stage_tx)
                .await
        });

        RunHandle {
            run_id,
            stage: stage_rx,
            events,
            cancel,
            task,
        }
    }

    /// Run to a terminal state, publishing events and stage changes
    ///
    /// Returns `Ok` for complete and cancelled runs (a cancelled report keeps
    /// the annotations of chunks that finished first). A blank document, or a
    /// run where no sampled chunk produced a single candidate, is an error.
    pub async fn run_observed(
        &self,
        doc: SourceDocument,
        run: AnalysisRun,
        cancel: CancellationToken,
        events: &EventBroadcaster,
        stage_tx: &watch::Sender<RunStage>,
    ) -> Result<RunReport> {
        let mut tracker = StageTracker::new(run.id, events, stage_tx);

        if doc.is_blank() {
            let reason = format!("document {} has no text", doc.id());
            warn!("Run {} failed: {}", run.id, reason);
            tracker.finish(RunStage::Failed);
            events.publish(RunEvent::run_failed(run.id, reason));
            return Err(AnnotextError::EmptyDocument(doc.id().to_string()));
        }

        let chunks = chunk_document(&doc, &self.config.chunking);
        let sampled = sample_chunks(&chunks, run.thoroughness, &self.config.sampling);
        let mut diagnostics = RunDiagnostics {
            total_chunks: chunks.len(),
            sampled_chunks: sampled.len(),
            ..Default::default()
        };
        info!(
            "Run {} on {}: analyzing {} of {} chunks ({})",
            run.id,
            doc.id(),
            sampled.len(),
            chunks.len(),
            run.thoroughness
        );

        let run = Arc::new(run);
        let mut annotations = Vec::new();
        tracker.begin(sampled.len());

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<(usize, RunStage)>();
        let permits = Arc::new(Semaphore::new(self.config.concurrency.chunk_workers.max(1)));
        let policy = RetryPolicy::from(&self.config.retry);

        let mut pending: FuturesUnordered<_> = sampled
            .into_iter()
            .enumerate()
            .map(|(slot, chunk)| {
                let task = ChunkTask {
                    slot,
                    chunk,
                    gateway: self.gateway.clone(),
                    config: self.config.clone(),
                    doc: doc.clone(),
                    run: run.clone(),
                    policy,
                    cancel: cancel.clone(),
                    permits: permits.clone(),
                    progress: progress_tx.clone(),
                };
                let chunk_id = task.chunk.id.clone();
                let handle = tokio::spawn(task.process());
                async move { (slot, chunk_id, handle.await) }
            })
            .collect();
        drop(progress_tx);

        loop {
            tokio::select! {
                Some((slot, stage)) = progress_rx.recv() => tracker.chunk_stage(slot, stage),
                joined = pending.next() => {
                    let Some((slot, chunk_id, joined)) = joined else { break };
                    tracker.chunk_done(slot);

                    let outcome = joined.unwrap_or_else(|e| {
                        error!("Chunk task for {} panicked: {}", chunk_id, e);
                        ChunkOutcome::Failed {
                            failure: ChunkFailure {
                                chunk_id: chunk_id.clone(),
                                stage: RunStage::Generating,
                                reason: format!("task aborted: {}", e),
                            },
                            diagnostics: RunDiagnostics::default(),
                        }
                    });

                    match outcome {
                        ChunkOutcome::Completed { annotations: found, diagnostics: chunk_diag } => {
                            diagnostics.completed_chunks += 1;
                            diagnostics.absorb(&chunk_diag);
                            events.publish(RunEvent::chunk_completed(run.id, &chunk_id, found.len()));
                            annotations.extend(found);
                        }
                        ChunkOutcome::Failed { failure, diagnostics: chunk_diag } => {
                            warn!(
                                "Chunk {} failed during {}: {}",
                                failure.chunk_id, failure.stage, failure.reason
                            );
                            diagnostics.failed_chunks += 1;
                            diagnostics.absorb(&chunk_diag);
                            events.publish(RunEvent::chunk_failed(
                                run.id,
                                &failure.chunk_id,
                                failure.stage,
                                &failure.reason,
                            ));
                            diagnostics.failures.push(failure);
                        }
                        ChunkOutcome::Cancelled => diagnostics.cancelled_chunks += 1,
                    }
                }
            }
        }

        let run = Arc::try_unwrap(run).unwrap_or_else(|shared| (*shared).clone());

        if cancel.is_cancelled() {
            info!(
                "Run {} cancelled with {} annotations from {} completed chunks",
                run.id,
                annotations.len(),
                diagnostics.completed_chunks
            );
            tracker.finish(RunStage::Cancelled);
            events.publish(RunEvent::run_cancelled(run.id, annotations.len()));
            return Ok(RunReport {
                run,
                status: RunStage::Cancelled,
                annotations,
                diagnostics,
            });
        }

        if diagnostics.completed_chunks == 0 || diagnostics.candidates_generated == 0 {
            let reason = match diagnostics.failures.first() {
                Some(first) if diagnostics.completed_chunks == 0 => format!(
                    "all {} sampled chunks failed (first: {})",
                    diagnostics.sampled_chunks, first.reason
                ),
                _ if diagnostics.sampled_chunks == 0 => {
                    "document produced no usable chunks".to_string()
                }
                _ => format!(
                    "no chunk produced a candidate ({} of {} sampled chunks failed, {} malformed entries)",
                    diagnostics.failed_chunks,
                    diagnostics.sampled_chunks,
                    diagnostics.malformed_candidates
                ),
            };
            warn!("Run {} failed: {}", run.id, reason);
            tracker.finish(RunStage::Failed);
            events.publish(RunEvent::run_failed(run.id, &reason));
            return Err(AnnotextError::RunFailed {
                run_id: run.id.to_string(),
                reason,
                failed_chunks: diagnostics.failed_chunks,
                sampled_chunks: diagnostics.sampled_chunks,
            });
        }

        info!(
            "Run {} complete: {} annotations ({} of {} chunks failed)",
            run.id,
            annotations.len(),
            diagnostics.failed_chunks,
            diagnostics.sampled_chunks
        );
        tracker.finish(RunStage::Complete);
        events.publish(RunEvent::run_complete(run.id, annotations.len()));
        Ok(RunReport {
            run,
            status: RunStage::Complete,
            annotations,
            diagnostics,
        })
    }
}

/// Everything a chunk task owns
struct ChunkTask {
    slot: usize,
    chunk: TextChunk,
    gateway: Arc<dyn CompletionGateway>,
    config: Arc<PipelineConfig>,
    doc: SourceDocument,
    run: Arc<AnalysisRun>,
    policy: RetryPolicy,
    cancel: CancellationToken,
    permits: Arc<Semaphore>,
    progress: mpsc::UnboundedSender<(usize, RunStage)>,
}

impl ChunkTask {
    async fn process(self) -> ChunkOutcome {
        let _permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return ChunkOutcome::Cancelled,
            permit = self.permits.acquire() => match permit {
                Ok(permit) => permit,
                Err(_) => return ChunkOutcome::Cancelled,
            },
        };

        let ctx = PassContext {
            gateway: self.gateway.as_ref(),
            policy: &self.policy,
            cancel: &self.cancel,
            intent: &self.run.intent,
        };
        let mut diagnostics = RunDiagnostics::default();
        let tag = self.run.prompt_tag();

        self.report(RunStage::Generating);
        let generated = match generate_candidates(
            ctx,
            &self.chunk,
            tag.as_ref(),
            self.config.generation.max_candidates_per_chunk,
        )
        .await
        {
            Ok(generated) => generated,
            Err(e) => return self.fail(RunStage::Generating, e, diagnostics),
        };
        diagnostics.candidates_generated += generated.candidates.len();
        diagnostics.malformed_candidates += generated.malformed;

        if self.cancel.is_cancelled() {
            return ChunkOutcome::Cancelled;
        }
        self.report(RunStage::Resolving);
        let resolved = resolve_candidates(&generated.candidates, &self.chunk, &mut diagnostics);

        if self.cancel.is_cancelled() {
            return ChunkOutcome::Cancelled;
        }
        self.report(RunStage::HardVerifying);
        let verified = match verify_candidates(
            ctx,
            &self.chunk,
            resolved,
            &self.config.verification,
            &mut diagnostics,
        )
        .await
        {
            Ok(verified) => verified,
            Err(e) => return self.fail(RunStage::HardVerifying, e, diagnostics),
        };

        if self.cancel.is_cancelled() {
            return ChunkOutcome::Cancelled;
        }
        self.report(RunStage::SoftVerifying);
        match finalize_candidates(
            ctx,
            &self.doc,
            &self.run,
            verified,
            &self.config.verification,
            &mut diagnostics,
        )
        .await
        {
            Ok(annotations) => {
                debug!("{} produced {} annotations", self.chunk.id, annotations.len());
                ChunkOutcome::Completed {
                    annotations,
                    diagnostics,
                }
            }
            Err(e) => self.fail(RunStage::SoftVerifying, e, diagnostics),
        }
    }

    fn report(&self, stage: RunStage) {
        // The orchestrator loop outlives every task, so a send can only fail during teardown
        let _ = self.progress.send((self.slot, stage));
    }

    fn fail(&self, stage: RunStage, error: AnnotextError, diagnostics: RunDiagnostics) -> ChunkOutcome {
        if matches!(error, AnnotextError::Cancelled) {
            return ChunkOutcome::Cancelled;
        }
        ChunkOutcome::Failed {
            failure: ChunkFailure {
                chunk_id: self.chunk.id.clone(),
                stage,
                reason: error.to_string(),
            },
            diagnostics,
        }
    }
}

/// Aggregate stage over in-flight chunks
struct StageTracker<'a> {
    run_id: RunId,
    events: &'a EventBroadcaster,
    stage_tx: &'a watch::Sender<RunStage>,
    current: RunStage,
    /// Stage per sampled chunk; `None` once the chunk has settled
    chunks: Vec<Option<RunStage>>,
}

impl<'a> StageTracker<'a> {
    fn new(
        run_id: RunId,
        events: &'a EventBroadcaster,
        stage_tx: &'a watch::Sender<RunStage>,
    ) -> Self {
        stage_tx.send_replace(RunStage::Sampling);
        Self {
            run_id,
            events,
            stage_tx,
            current: RunStage::Sampling,
            chunks: Vec::new(),
        }
    }

    /// Chunks are queued for generation
    fn begin(&mut self, chunk_count: usize) {
        self.chunks = vec![Some(RunStage::Generating); chunk_count];
        self.advance(RunStage::Generating);
    }

    fn chunk_stage(&mut self, slot: usize, stage: RunStage) {
        if let Some(entry @ Some(_)) = self.chunks.get_mut(slot) {
            *entry = Some(stage);
            self.recompute();
        }
    }

    fn chunk_done(&mut self, slot: usize) {
        if let Some(entry) = self.chunks.get_mut(slot) {
            *entry = None;
            self.recompute();
        }
    }

    fn recompute(&mut self) {
        if let Some(earliest) = self.chunks.iter().flatten().min().copied() {
            self.advance(earliest);
        }
    }

    fn advance(&mut self, to: RunStage) {
        if to <= self.current || self.current.is_terminal() {
            return;
        }
        let from = self.current;
        self.current = to;
        self.stage_tx.send_replace(to);
        self.events
            .publish(RunEvent::stage_changed(self.run_id, from, to));
    }

    fn finish(&mut self, terminal: RunStage) {
        self.advance(terminal);
    }
}

/// Progress and cancellation handle for a background run
pub struct RunHandle {
    run_id: RunId,
    stage: watch::Receiver<RunStage>,
    events: EventBroadcaster,
    cancel: CancellationToken,
    task: JoinHandle<Result<RunReport>>,
}

impl RunHandle {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Current aggregate stage
    pub fn stage(&self) -> RunStage {
        *self.stage.borrow()
    }

    /// Receiver that resolves on every stage change
    pub fn watch_stage(&self) -> watch::Receiver<RunStage> {
        self.stage.clone()
    }

    /// Subscribe to progress events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    /// Request cooperative cancellation
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the run to reach a terminal state
    pub async fn wait(self) -> Result<RunReport> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(AnnotextError::Other(format!("run task aborted: {}", e))),
        }
    }
}
