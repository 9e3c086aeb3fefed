//! Repeated verification rounds for flake hunting.

use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::harness::verify_report;
use crate::report::VerificationReport;
use crate::runner::{RunnerConfig, Scenario};
use crate::runtime::Task;

/// How many rounds to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StressConfig {
    /// Number of rounds. With `until_fails`, an upper bound where `0`
    /// means no bound.
    pub iterations: usize,
    /// Stop at the first failing round.
    pub until_fails: bool,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            iterations: 1,
            until_fails: false,
        }
    }
}

/// Outcome of a stress run.
#[derive(Debug, Clone, Serialize)]
pub struct StressReport {
    pub rounds: Vec<VerificationReport>,
    /// Set when cancellation stopped the run early.
    pub interrupted: bool,
}

impl StressReport {
    /// At least one process was checked and nothing failed.
    ///
    /// A run with no rounds, or with rounds of zero workers, verified
    /// nothing and does not pass.
    pub fn passed(&self) -> bool {
        !self.interrupted
            && self.verified_anything()
            && self.rounds.iter().all(VerificationReport::passed)
    }

    /// Whether any round ran at least one worker.
    pub fn verified_anything(&self) -> bool {
        self.rounds.iter().any(|r| r.count > 0)
    }

    /// Number of rounds with at least one failure.
    pub fn failed_rounds(&self) -> usize {
        self.rounds.iter().filter(|r| !r.passed()).count()
    }
}

/// Run `verify` rounds against the same task.
pub async fn run_stress(
    task: Arc<dyn Task>,
    count: usize,
    scenario: &Scenario,
    runner_config: &RunnerConfig,
    stress: &StressConfig,
    cancel: CancellationToken,
) -> StressReport {
    let mut rounds = Vec::new();
    let mut interrupted = false;

    for round in 0.. {
        let bounded = !stress.until_fails || stress.iterations > 0;
        if bounded && round >= stress.iterations {
            break;
        }
        if cancel.is_cancelled() {
            interrupted = true;
            break;
        }

        let report = verify_report(
            Arc::clone(&task),
            count,
            scenario,
            runner_config,
            cancel.clone(),
        )
        .await;

        let failed = !report.passed();
        if failed {
            warn!(
                round,
                failures = report.failures.len(),
                "verification round failed"
            );
        } else {
            info!(round, duration_ms = report.duration_ms, "verification round passed");
        }
        rounds.push(report);

        if cancel.is_cancelled() {
            interrupted = true;
            break;
        }
        if failed && stress.until_fails {
            break;
        }
    }

    StressReport {
        rounds,
        interrupted,
    }
}
