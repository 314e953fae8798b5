//! Run log: ordered timeline of every decision a run takes.
//!
//! A `RunLog` is created per invocation and passed by `&mut` into each stage.
//! Nothing global is counted or patched; whoever owns the log owns the history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::BatchOutcome;

// ---------------------------------------------------------------------------
// RunLog
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLog {
    pub run_id: String,
    pub mode: String,
    pub started_at: DateTime<Utc>,
    events: Vec<RunEvent>,
    seq: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub seq: u32,
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    CandidatesRanked {
        target_type: String,
        documents: usize,
        skipped_without_embedding: usize,
    },
    LlmCall {
        document_id: String,
        purpose: String,
    },
    RepairAttempt {
        document_id: String,
        attempt: usize,
    },
    ElementRejected {
        document_id: String,
        reason: String,
    },
    ClassificationSkipped {
        document_id: String,
        target_type: String,
        reason: String,
    },
    DocumentClassified {
        document_id: String,
        target_type: String,
        accepted: usize,
        rejected: usize,
    },
    TopicStage {
        stage: String,
        documents: usize,
        detail: String,
    },
    TopicLabeled {
        model: String,
        topic_id: i32,
        topic_name: String,
    },
    IdentityUnresolved {
        model: String,
        topic_id: i32,
        signature: String,
        documents: usize,
    },
    Persisted {
        sink: String,
        entity: String,
        succeeded: usize,
        failed: usize,
    },
}

impl RunLog {
    pub fn new(run_id: impl Into<String>, mode: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            mode: mode.into(),
            started_at: Utc::now(),
            events: Vec::new(),
            seq: 0,
        }
    }

    /// A log with a fresh v4 run id.
    pub fn start(mode: impl Into<String>) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), mode)
    }

    pub fn log(&mut self, kind: EventKind) {
        self.events.push(RunEvent {
            seq: self.seq,
            ts: Utc::now(),
            kind,
        });
        self.seq += 1;
    }

    pub fn persisted(&mut self, sink: &str, entity: &str, outcome: BatchOutcome) {
        self.log(EventKind::Persisted {
            sink: sink.to_string(),
            entity: entity.to_string(),
            succeeded: outcome.succeeded,
            failed: outcome.failed,
        });
    }

    pub fn events(&self) -> &[RunEvent] {
        &self.events
    }

    /// Number of events matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&EventKind) -> bool) -> usize {
        self.events.iter().filter(|e| predicate(&e.kind)).count()
    }
}
