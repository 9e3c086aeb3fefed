//! Serializable summaries of verification rounds.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{FailureKind, VerificationError, WorkerIndex};

/// One failed worker, flattened for output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureRecord {
    pub index: WorkerIndex,
    pub kind: FailureKind,
    pub message: String,
}

impl From<&VerificationError> for FailureRecord {
    fn from(err: &VerificationError) -> Self {
        Self {
            index: err.index(),
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Outcome of one `verify` round.
#[derive(Debug, Clone, Serialize)]
pub struct VerificationReport {
    pub run_id: Uuid,
    pub task_id: String,
    pub count: usize,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub failures: Vec<FailureRecord>,
}

impl VerificationReport {
    pub fn new(
        run_id: Uuid,
        task_id: impl Into<String>,
        count: usize,
        started_at: DateTime<Utc>,
        duration_ms: u64,
        errs: &[VerificationError],
    ) -> Self {
        Self {
            run_id,
            task_id: task_id.into(),
            count,
            started_at,
            duration_ms,
            failures: errs.iter().map(FailureRecord::from).collect(),
        }
    }

    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }

    /// Worker indices that failed, in report order.
    pub fn failed_indices(&self) -> Vec<WorkerIndex> {
        self.failures.iter().map(|f| f.index).collect()
    }
}
