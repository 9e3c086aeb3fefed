//! Per-worker verification failures.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::runtime::RuntimeError;

/// Identity of one concurrent worker within a harness run.
pub type WorkerIndex = usize;

/// Everything that can go wrong for one worker.
///
/// At most one of these is produced per worker. Every variant carries the
/// worker index so a drained list can be inspected without extra context.
#[derive(Debug, thiserror::Error)]
pub enum VerificationError {
    #[error("worker {index}: failed to create process: {source}")]
    Spawn {
        index: WorkerIndex,
        #[source]
        source: RuntimeError,
    },

    #[error("worker {index}: failed to register for process exit: {source}")]
    WaitRegistration {
        index: WorkerIndex,
        #[source]
        source: RuntimeError,
    },

    #[error("worker {index}: failed to start process: {source}")]
    Start {
        index: WorkerIndex,
        #[source]
        source: RuntimeError,
    },

    #[error("worker {index}: runtime failed to report exit status: {message}")]
    Runtime { index: WorkerIndex, message: String },

    #[error("worker {index}: exit code: {code}")]
    NonZeroExit { index: WorkerIndex, code: u32 },

    #[error("worker {index}: expected {expected:?}, got: {actual:?}")]
    OutputMismatch {
        index: WorkerIndex,
        expected: String,
        actual: String,
    },

    #[error("worker {index}: process did not exit within {after:?}")]
    Timeout { index: WorkerIndex, after: Duration },

    #[error("worker {index}: cancelled while waiting for process exit")]
    Cancelled { index: WorkerIndex },

    #[error("worker {index}: worker panicked: {message}")]
    Panicked { index: WorkerIndex, message: String },
}

/// Field-less classification of a [`VerificationError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Spawn,
    WaitRegistration,
    Start,
    Runtime,
    NonZeroExit,
    OutputMismatch,
    Timeout,
    Cancelled,
    Panicked,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Spawn => "spawn",
            FailureKind::WaitRegistration => "wait_registration",
            FailureKind::Start => "start",
            FailureKind::Runtime => "runtime",
            FailureKind::NonZeroExit => "non_zero_exit",
            FailureKind::OutputMismatch => "output_mismatch",
            FailureKind::Timeout => "timeout",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Panicked => "panicked",
        };
        f.write_str(s)
    }
}

impl VerificationError {
    pub fn index(&self) -> WorkerIndex {
        match self {
            VerificationError::Spawn { index, .. }
            | VerificationError::WaitRegistration { index, .. }
            | VerificationError::Start { index, .. }
            | VerificationError::Runtime { index, .. }
            | VerificationError::NonZeroExit { index, .. }
            | VerificationError::OutputMismatch { index, .. }
            | VerificationError::Timeout { index, .. }
            | VerificationError::Cancelled { index }
            | VerificationError::Panicked { index, .. } => *index,
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            VerificationError::Spawn { .. } => FailureKind::Spawn,
            VerificationError::WaitRegistration { .. } => FailureKind::WaitRegistration,
            VerificationError::Start { .. } => FailureKind::Start,
            VerificationError::Runtime { .. } => FailureKind::Runtime,
            VerificationError::NonZeroExit { .. } => FailureKind::NonZeroExit,
            VerificationError::OutputMismatch { .. } => FailureKind::OutputMismatch,
            VerificationError::Timeout { .. } => FailureKind::Timeout,
            VerificationError::Cancelled { .. } => FailureKind::Cancelled,
            VerificationError::Panicked { .. } => FailureKind::Panicked,
        }
    }
}

/// Truncate a string to at most `max_bytes` bytes, appending "..." if
/// truncated.
pub(crate) fn truncate_snippet(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_owned();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    let mut truncated = s[..end].to_owned();
    truncated.push_str("...");
    truncated
}
