//! Concurrent harness: runs `count` workers against one shared task and
//! collects every failure.
//!
//! ```text
//! verify(task, count)
//!     |
//!     +-- JoinSet::spawn(run_process(task, 0)) --+
//!     +-- JoinSet::spawn(run_process(task, 1)) --+--> ErrorReporter::insert
//!     +-- ...                                    |
//!     |                                          v
//!     +-- join_next() until empty         ErrorAggregator
//!     |                                          |
//!     +-- drain() <------------------------------+
//! ```
//!
//! Completion is tracked by the `JoinSet`, not by counting errors, so a run
//! where nothing fails finishes as soon as the last worker returns.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use crate::aggregator::ErrorAggregator;
use crate::error::VerificationError;
use crate::report::VerificationReport;
use crate::runner::{RunnerConfig, Scenario, run_process};
use crate::runtime::Task;

/// Run `count` workers concurrently against `task` and return every
/// failure, ordered by worker index.
///
/// Always waits for all workers, even after the first failure. An empty
/// result means every worker passed.
pub async fn verify(
    task: Arc<dyn Task>,
    count: usize,
    scenario: &Scenario,
    config: &RunnerConfig,
    cancel: CancellationToken,
) -> Vec<VerificationError> {
    if count == 0 {
        return Vec::new();
    }

    info!(task_id = %task.id(), count, "launching workers");

    let mut aggregator = ErrorAggregator::with_capacity(count);
    let scenario = Arc::new(scenario.clone());
    let config = Arc::new(config.clone());
    let mut workers = JoinSet::new();
    let mut indices = HashMap::with_capacity(count);

    for index in 0..count {
        let task = Arc::clone(&task);
        let scenario = Arc::clone(&scenario);
        let config = Arc::clone(&config);
        let cancel = cancel.clone();
        let reporter = aggregator.reporter();

        let handle = workers.spawn(async move {
            if let Some(err) = run_process(task.as_ref(), index, &scenario, &config, &cancel).await
            {
                if let Err(e) = reporter.insert(err) {
                    error!(index, error = %e, "failed to record worker error");
                }
            }
        });
        indices.insert(handle.id(), index);
    }

    while let Some(joined) = workers.join_next().await {
        let Err(join_err) = joined else {
            continue;
        };
        let Some(&index) = indices.get(&join_err.id()) else {
            error!(error = %join_err, "unknown worker failed to join");
            continue;
        };
        let message = if join_err.is_panic() {
            panic_message(join_err.into_panic())
        } else {
            join_err.to_string()
        };
        error!(index, message = %message, "worker panicked");
        if let Err(e) = aggregator.insert(VerificationError::Panicked { index, message }) {
            error!(index, error = %e, "failed to record worker panic");
        }
    }

    let mut errs = aggregator.drain();
    errs.sort_by_key(VerificationError::index);

    info!(task_id = %task.id(), count, failures = errs.len(), "all workers finished");
    errs
}

/// Like [`verify`], but wraps the outcome in a [`VerificationReport`].
pub async fn verify_report(
    task: Arc<dyn Task>,
    count: usize,
    scenario: &Scenario,
    config: &RunnerConfig,
    cancel: CancellationToken,
) -> VerificationReport {
    let run_id = Uuid::new_v4();
    let task_id = task.id().to_string();
    let started_at = Utc::now();
    let start = Instant::now();

    let errs = verify(task, count, scenario, config, cancel).await;

    let duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
    VerificationReport::new(run_id, task_id, count, started_at, duration_ms, &errs)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
