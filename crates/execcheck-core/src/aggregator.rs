//! Bounded, non-blocking collection of worker errors.
//!
//! Backed by a bounded `mpsc` channel sized to the worker count. Workers
//! insert with `try_send`, so an insert never waits; the harness drains with
//! `try_recv` once every worker has been joined, so the drain never waits
//! for items that will not come.

use tokio::sync::mpsc::{self, error::TrySendError};

use crate::error::VerificationError;

/// Why an insert was refused. The rejected error is handed back.
#[derive(Debug, thiserror::Error)]
pub enum AggregatorError {
    #[error("error aggregator is full; rejected: {0}")]
    Full(VerificationError),

    #[error("error aggregator is closed; rejected: {0}")]
    Closed(VerificationError),
}

/// Cloneable insertion handle given to each worker.
#[derive(Debug, Clone)]
pub struct ErrorReporter {
    tx: mpsc::Sender<VerificationError>,
}

impl ErrorReporter {
    /// Insert an error without blocking.
    pub fn insert(&self, err: VerificationError) -> Result<(), AggregatorError> {
        self.tx.try_send(err).map_err(|e| match e {
            TrySendError::Full(err) => AggregatorError::Full(err),
            TrySendError::Closed(err) => AggregatorError::Closed(err),
        })
    }
}

/// Collection point for the errors of one harness run.
#[derive(Debug)]
pub struct ErrorAggregator {
    tx: mpsc::Sender<VerificationError>,
    rx: mpsc::Receiver<VerificationError>,
    capacity: usize,
}

impl ErrorAggregator {
    /// Create an aggregator holding up to `capacity` errors (at least one).
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        Self { tx, rx, capacity }
    }

    /// Maximum number of errors held before `insert` reports `Full`.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// A handle workers use to insert.
    pub fn reporter(&self) -> ErrorReporter {
        ErrorReporter {
            tx: self.tx.clone(),
        }
    }

    /// Insert an error without blocking.
    pub fn insert(&self, err: VerificationError) -> Result<(), AggregatorError> {
        self.reporter().insert(err)
    }

    /// Remove and return everything inserted so far, without blocking.
    ///
    /// Order follows insertion, which is arbitrary across concurrent
    /// producers.
    pub fn drain(&mut self) -> Vec<VerificationError> {
        let mut errs = Vec::new();
        while let Ok(err) = self.rx.try_recv() {
            errs.push(err);
        }
        errs
    }
}
