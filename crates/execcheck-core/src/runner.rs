//! Single-worker process runner.
//!
//! [`run_process`] drives one process through its whole life inside a
//! shared task: create with a fresh [`OutputSink`], register for exit,
//! start, wait, validate, and delete. It returns at most one
//! [`VerificationError`].

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{VerificationError, WorkerIndex, truncate_snippet};
use crate::runtime::{ExitNotification, ExitStatus, Process, ProcessIo, ProcessSpec, Task};
use crate::sink::OutputSink;

/// Default exec id prefix; worker `i` runs as `say-hello-<i>`.
pub const DEFAULT_ID_PREFIX: &str = "say-hello";
/// Default marker every worker's stdout must contain.
pub const DEFAULT_MARKER: &str = "hi stdout";
/// Default bound on how long a worker waits for its process to exit.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Maximum bytes of captured output carried in an output-mismatch error.
pub const MISMATCH_SNIPPET_BYTES: usize = 1024;

/// What each worker runs and what it expects to see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scenario {
    /// Prefix of the exec id; the worker index is appended.
    pub id_prefix: String,
    /// Executable path followed by its arguments.
    pub args: Vec<String>,
    /// Working directory inside the container.
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    /// Substring stdout must contain.
    pub expected_marker: String,
    /// Per-worker replacement argument vectors.
    overrides: BTreeMap<WorkerIndex, Vec<String>>,
}

impl Default for Scenario {
    /// `/bin/echo "hi stdout"` in `/`, expecting `hi stdout`.
    fn default() -> Self {
        Self {
            id_prefix: DEFAULT_ID_PREFIX.to_string(),
            args: vec!["/bin/echo".to_string(), DEFAULT_MARKER.to_string()],
            cwd: PathBuf::from("/"),
            env: Vec::new(),
            expected_marker: DEFAULT_MARKER.to_string(),
            overrides: BTreeMap::new(),
        }
    }
}

impl Scenario {
    /// Replace the command every worker runs.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Replace the substring stdout must contain.
    pub fn with_marker(mut self, marker: impl Into<String>) -> Self {
        self.expected_marker = marker.into();
        self
    }

    /// Replace the exec id prefix.
    pub fn with_id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.id_prefix = prefix.into();
        self
    }

    /// Run in `cwd` inside the container.
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = cwd.into();
        self
    }

    /// Add an environment variable for every worker.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Run `args` instead of the shared command for worker `index` only.
    pub fn with_override<I, S>(mut self, index: WorkerIndex, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.overrides
            .insert(index, args.into_iter().map(Into::into).collect());
        self
    }

    /// Exec id for worker `index`.
    pub fn exec_id(&self, index: WorkerIndex) -> String {
        format!("{}-{}", self.id_prefix, index)
    }

    /// Process spec for worker `index`.
    pub fn spec_for(&self, index: WorkerIndex) -> ProcessSpec {
        let args = self.overrides.get(&index).unwrap_or(&self.args);
        ProcessSpec {
            args: args.clone(),
            cwd: self.cwd.clone(),
            env: self.env.clone(),
        }
    }
}

/// Per-worker tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerConfig {
    /// Bound on the exit wait. `None` waits forever.
    pub timeout: Option<Duration>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            timeout: Some(DEFAULT_TIMEOUT),
        }
    }
}

enum ExitWait {
    Exited(ExitStatus),
    TimedOut(Duration),
    Cancelled,
}

async fn await_exit(
    exit: ExitNotification,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> ExitWait {
    let deadline = async {
        match timeout {
            Some(after) => tokio::time::sleep(after).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        biased;
        status = exit.recv() => ExitWait::Exited(status),
        _ = cancel.cancelled() => ExitWait::Cancelled,
        _ = deadline => ExitWait::TimedOut(timeout.unwrap_or_default()),
    }
}

/// Run worker `index` of `scenario` against `task`.
///
/// Once the process exists it is always deleted with a forced kill, and a
/// failed delete is logged without replacing the result.
pub async fn run_process(
    task: &dyn Task,
    index: WorkerIndex,
    scenario: &Scenario,
    config: &RunnerConfig,
    cancel: &CancellationToken,
) -> Option<VerificationError> {
    if cancel.is_cancelled() {
        return Some(VerificationError::Cancelled { index });
    }

    let exec_id = scenario.exec_id(index);
    let spec = scenario.spec_for(index);
    let stdout = OutputSink::new();

    let mut process = match task
        .exec(&exec_id, &spec, ProcessIo::stdout_only(stdout.clone()))
        .await
    {
        Ok(process) => process,
        Err(source) => {
            warn!(index, exec_id = %exec_id, error = %source, "failed to create process");
            return Some(VerificationError::Spawn { index, source });
        }
    };

    let result = drive(process.as_mut(), index, scenario, config, cancel, &stdout).await;

    if let Err(e) = process.delete(true).await {
        warn!(index, exec_id = %exec_id, error = %e, "failed to delete process (ignored)");
    }

    match &result {
        Some(err) => warn!(index, exec_id = %exec_id, kind = %err.kind(), error = %err, "worker failed"),
        None => debug!(index, exec_id = %exec_id, "worker passed"),
    }

    result
}

async fn drive(
    process: &mut dyn Process,
    index: WorkerIndex,
    scenario: &Scenario,
    config: &RunnerConfig,
    cancel: &CancellationToken,
    stdout: &OutputSink,
) -> Option<VerificationError> {
    // Registering before start means a process that exits immediately
    // cannot finish before anyone is listening.
    let exit = match process.wait().await {
        Ok(exit) => exit,
        Err(source) => return Some(VerificationError::WaitRegistration { index, source }),
    };

    if let Err(source) = process.start().await {
        return Some(VerificationError::Start { index, source });
    }

    let status = match await_exit(exit, config.timeout, cancel).await {
        ExitWait::Exited(status) => status,
        ExitWait::TimedOut(after) => return Some(VerificationError::Timeout { index, after }),
        ExitWait::Cancelled => return Some(VerificationError::Cancelled { index }),
    };

    if let Some(message) = status.error {
        return Some(VerificationError::Runtime { index, message });
    }

    if status.code != 0 {
        return Some(VerificationError::NonZeroExit {
            index,
            code: status.code,
        });
    }

    if !stdout.contains(scenario.expected_marker.as_bytes()) {
        return Some(VerificationError::OutputMismatch {
            index,
            expected: scenario.expected_marker.clone(),
            actual: truncate_snippet(&stdout.to_string_lossy(), MISMATCH_SNIPPET_BYTES),
        });
    }

    None
}
