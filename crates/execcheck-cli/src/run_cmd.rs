//! `execcheck run` command: verify stdout isolation against a container.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use execcheck_core::fixture::Fixture;
use execcheck_core::runtime::{DockerTask, Task};
use execcheck_core::stress::{StressConfig, StressReport, run_stress};
use execcheck_core::{RunnerConfig, Scenario};

use crate::config::ResolvedConfig;

/// How a run ended, mapped to the process exit code by `main`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Passed,
    Failed,
    Interrupted,
}

impl RunOutcome {
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Passed => 0,
            Self::Failed => 1,
            Self::Interrupted => 130,
        }
    }

    fn from_report(report: &StressReport) -> Self {
        if report.interrupted {
            Self::Interrupted
        } else if report.passed() {
            Self::Passed
        } else {
            Self::Failed
        }
    }
}

/// Options for one invocation of `run`.
#[derive(Debug)]
pub struct RunArgs {
    pub config: ResolvedConfig,
    /// Attach to an existing running container instead of creating one.
    pub container: Option<String>,
    pub until_fails: bool,
    pub json: bool,
}

/// Install the Ctrl+C handler: first signal cancels, second force-exits.
fn install_signal_handler() -> CancellationToken {
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    let got_first_signal = Arc::new(AtomicBool::new(false));

    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            if got_first_signal.swap(true, Ordering::SeqCst) {
                eprintln!("\nForce exit.");
                std::process::exit(130);
            }
            eprintln!("\nCancelling in-flight processes (Ctrl+C again to force)...");
            cancel_clone.cancel();
        }
    });

    cancel
}

/// Run the run command.
pub async fn run_verify(args: RunArgs) -> Result<RunOutcome> {
    let RunArgs {
        config,
        container,
        until_fails,
        json,
    } = args;

    let cancel = install_signal_handler();

    let (task, fixture): (Arc<dyn Task>, Option<Fixture>) = match container {
        Some(id) => {
            let task = DockerTask::connect(config.fixture.docker.clone(), id.clone())
                .await
                .with_context(|| format!("cannot attach to container {id}"))?;
            (Arc::new(task), None)
        }
        None => {
            let fixture = Fixture::setup(&config.fixture).await?;
            (fixture.task(), Some(fixture))
        }
    };

    if !json {
        println!("Verifying stdout isolation in {}", task.id());
        println!("  Workers per round: {}", config.count);
        match config.timeout {
            Some(t) => println!("  Process timeout: {}s", t.as_secs()),
            None => println!("  Process timeout: none"),
        }
        if until_fails {
            println!("  Rounds: until first failure");
        } else {
            println!("  Rounds: {}", config.repeat);
        }
    }

    let stress = StressConfig {
        iterations: config.repeat,
        until_fails,
    };
    let runner = RunnerConfig {
        timeout: config.timeout,
    };

    let report = run_stress(
        task,
        config.count,
        &Scenario::default(),
        &runner,
        &stress,
        cancel,
    )
    .await;

    // Teardown runs before any output error can return early.
    if let Some(fixture) = fixture {
        if let Err(e) = fixture.teardown().await {
            warn!(error = %format!("{e:#}"), "fixture teardown failed");
        }
    }

    if json {
        let out = serde_json::to_string_pretty(&report).context("failed to serialize report")?;
        println!("{out}");
    } else {
        print_summary(&report);
    }

    Ok(RunOutcome::from_report(&report))
}

fn print_summary(report: &StressReport) {
    for (round, r) in report.rounds.iter().enumerate() {
        if r.passed() {
            continue;
        }
        println!();
        println!(
            "Round {}: {} of {} workers failed",
            round + 1,
            r.failures.len(),
            r.count
        );
        for failure in &r.failures {
            println!("  [{}] {}: {}", failure.index, failure.kind, failure.message);
        }
    }

    println!();
    let total = report.rounds.len();
    match RunOutcome::from_report(report) {
        RunOutcome::Passed => println!("All {total} round(s) passed."),
        RunOutcome::Failed if !report.verified_anything() => {
            println!("No process was verified; nothing passed.")
        }
        RunOutcome::Failed => println!("{} of {total} round(s) failed.", report.failed_rounds()),
        RunOutcome::Interrupted => {
            println!("Interrupted after {total} round(s); in-flight processes were cleaned up.")
        }
    }
}
