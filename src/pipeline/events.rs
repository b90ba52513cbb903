//! Run progress events
//!
//! Each run publishes typed events on a broadcast channel. Any caller (CLI,
//! web layer) can subscribe without the pipeline knowing about transports.

use crate::types::{RunId, RunStage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Progress event for one run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RunEvent {
    /// Aggregate run stage moved forward
    StageChanged {
        run_id: RunId,
        from: RunStage,
        to: RunStage,
        timestamp: DateTime<Utc>,
    },
    /// A chunk finished soft verification
    ChunkCompleted {
        run_id: RunId,
        chunk_id: String,
        annotations: usize,
        timestamp: DateTime<Utc>,
    },
    /// A chunk was skipped after exhausting retries
    ChunkFailed {
        run_id: RunId,
        chunk_id: String,
        stage: RunStage,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    RunComplete {
        run_id: RunId,
        annotation_count: usize,
        timestamp: DateTime<Utc>,
    },
    RunFailed {
        run_id: RunId,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    /// Cancelled; `annotation_count` covers chunks finished before the signal
    RunCancelled {
        run_id: RunId,
        annotation_count: usize,
        timestamp: DateTime<Utc>,
    },
}

impl RunEvent {
    pub fn stage_changed(run_id: RunId, from: RunStage, to: RunStage) -> Self {
        Self::StageChanged {
            run_id,
            from,
            to,
            timestamp: Utc::now(),
        }
    }

    pub fn chunk_completed(run_id: RunId, chunk_id: impl Into<String>, annotations: usize) -> Self {
        Self::ChunkCompleted {
            run_id,
            chunk_id: chunk_id.into(),
            annotations,
            timestamp: Utc::now(),
        }
    }

    pub fn chunk_failed(
        run_id: RunId,
        chunk_id: impl Into<String>,
        stage: RunStage,
        reason: impl Into<String>,
    ) -> Self {
        Self::ChunkFailed {
            run_id,
            chunk_id: chunk_id.into(),
            stage,
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn run_complete(run_id: RunId, annotation_count: usize) -> Self {
        Self::RunComplete {
            run_id,
            annotation_count,
            timestamp: Utc::now(),
        }
    }

    pub fn run_failed(run_id: RunId, reason: impl Into<String>) -> Self {
        Self::RunFailed {
            run_id,
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn run_cancelled(run_id: RunId, annotation_count: usize) -> Self {
        Self::RunCancelled {
            run_id,
            annotation_count,
            timestamp: Utc::now(),
        }
    }

    pub fn run_id(&self) -> RunId {
        match self {
            Self::StageChanged { run_id, .. }
            | Self::ChunkCompleted { run_id, .. }
            | Self::ChunkFailed { run_id, .. }
            | Self::RunComplete { run_id, .. }
            | Self::RunFailed { run_id, .. }
            | Self::RunCancelled { run_id, .. } => *run_id,
        }
    }

    /// True for the last event a run publishes
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::RunComplete { .. } | Self::RunFailed { .. } | Self::RunCancelled { .. }
        )
    }

    /// Single-line JSON, for log streams
    pub fn to_json_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{:?}", self))
    }
}

/// Broadcast channel for run events
#[derive(Debug, Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<RunEvent>,
}

impl EventBroadcaster {
    /// Create new broadcaster with channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish to current subscribers; having none is not an error
    pub fn publish(&self, event: RunEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization_tags() {
        let run_id = RunId::new();
        let json = RunEvent::stage_changed(run_id, RunStage::Generating, RunStage::Resolving)
            .to_json_line();
        assert!(json.contains("\"type\":\"stage-changed\""));
        assert!(json.contains("\"to\":\"resolving\""));

        let json = RunEvent::chunk_failed(run_id, "chunk-0001", RunStage::HardVerifying, "timeout")
            .to_json_line();
        assert!(json.contains("\"type\":\"chunk-failed\""));
        assert!(json.contains("\"stage\":\"hard-verifying\""));
    }

    #[test]
    fn test_terminal_events() {
        let run_id = RunId::new();
        assert!(RunEvent::run_complete(run_id, 3).is_terminal());
        assert!(RunEvent::run_cancelled(run_id, 0).is_terminal());
        assert!(!RunEvent::chunk_completed(run_id, "chunk-0000", 1).is_terminal());
        assert_eq!(RunEvent::run_failed(run_id, "empty").run_id(), run_id);
    }

    #[tokio::test]
    async fn test_broadcast_without_and_with_subscribers() {
        let events = EventBroadcaster::default();
        let run_id = RunId::new();
        assert_eq!(events.publish(RunEvent::run_complete(run_id, 0)), 0);

        let mut rx = events.subscribe();
        assert_eq!(events.subscriber_count(), 1);
        assert_eq!(events.publish(RunEvent::run_complete(run_id, 2)), 1);
        let received = rx.recv().await.unwrap();
        assert!(matches!(received, RunEvent::RunComplete { annotation_count: 2, .. }));
    }
}
