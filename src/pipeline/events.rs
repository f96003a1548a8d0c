//! Progress events for external observers.
//!
//! Events are advisory: routing never depends on them, and a closed or
//! missing receiver is ignored. Each job numbers its events from 0 so
//! consumers can check ordering.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::stage::StageId;
use super::state::PipelineStatus;

/// Status of one stage as reported to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Event payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// A stage changed status.
    Stage {
        stage: StageId,
        status: StageStatus,
        message: Option<String>,
        /// Fraction of the pipeline done, in `[0, 1]`.
        progress: f32,
    },
    /// The final artifact of a completed job.
    Artifact {
        file_name: String,
        code: String,
        attempt: u32,
    },
    /// The failure of a failed job.
    Error {
        stage: Option<StageId>,
        category: String,
        message: String,
    },
    /// Last event of every job.
    Finished { status: PipelineStatus },
}

/// One progress event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: Uuid,
    /// Per-job sequence number, starting at 0.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl ProgressEvent {
    pub fn is_final(&self) -> bool {
        matches!(self.kind, EventKind::Finished { .. })
    }
}

/// Sends numbered events for one job.
#[derive(Debug)]
pub struct ProgressSink {
    job_id: Uuid,
    tx: Option<mpsc::Sender<ProgressEvent>>,
    sequence: AtomicU64,
}

impl ProgressSink {
    pub fn new(job_id: Uuid, tx: mpsc::Sender<ProgressEvent>) -> Self {
        Self {
            job_id,
            tx: Some(tx),
            sequence: AtomicU64::new(0),
        }
    }

    /// A sink that drops every event.
    pub fn disabled(job_id: Uuid) -> Self {
        Self {
            job_id,
            tx: None,
            sequence: AtomicU64::new(0),
        }
    }

    /// A sink and its receiving end.
    pub fn channel(job_id: Uuid, buffer: usize) -> (Self, mpsc::Receiver<ProgressEvent>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self::new(job_id, tx), rx)
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Events emitted so far.
    pub fn emitted(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    pub async fn emit(&self, kind: EventKind) {
        let event = ProgressEvent {
            job_id: self.job_id,
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
            timestamp: Utc::now(),
            kind,
        };
        if let Some(tx) = &self.tx {
            // Ignore send errors (receiver may have been dropped)
            let _ = tx.send(event).await;
        }
    }

    pub async fn stage(
        &self,
        stage: StageId,
        status: StageStatus,
        message: Option<String>,
        progress: f32,
    ) {
        self.emit(EventKind::Stage {
            stage,
            status,
            message,
            progress,
        })
        .await;
    }
}
