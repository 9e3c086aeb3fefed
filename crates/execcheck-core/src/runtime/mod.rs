//! Container runtime capability surface.
//!
//! The harness never talks to a runtime directly. It consumes a running
//! [`Task`] that can create processes, and the [`Process`] handles those
//! calls return. Backends (Docker, in-memory fakes) implement both traits.
//!
//! # Lifecycle
//!
//! ```text
//! Task::exec(id, spec, io) --> Box<dyn Process>   (created, not running)
//!     |
//!     +-- wait()    --> ExitNotification          (only before start)
//!     +-- start()                                  (exactly once)
//!     +-- delete(kill)                             (best-effort, any time)
//! ```
//!
//! `wait` must be registered before `start`. A backend is free to drop the
//! exit status of a process nobody is waiting on.

pub mod docker;

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::sink::OutputSink;

pub use docker::{DockerProcess, DockerTask};

/// What to execute inside the task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    /// Executable path followed by its arguments.
    pub args: Vec<String>,
    /// Working directory inside the container.
    pub cwd: PathBuf,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
}

impl ProcessSpec {
    /// Spec for `args` run in `cwd` with no extra environment.
    pub fn new<I, S>(args: I, cwd: impl Into<PathBuf>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            cwd: cwd.into(),
            env: Vec::new(),
        }
    }

    /// Add an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// The executable, if any argument was given.
    pub fn program(&self) -> Option<&str> {
        self.args.first().map(String::as_str)
    }
}

/// Where an output stream goes.
#[derive(Debug, Clone, Default)]
pub enum StreamTarget {
    /// Read and throw away.
    #[default]
    Discard,
    /// Append everything to the given sink.
    Sink(OutputSink),
}

impl StreamTarget {
    /// Whether the stream is thrown away.
    pub fn is_discard(&self) -> bool {
        matches!(self, StreamTarget::Discard)
    }
}

/// The three standard streams of a process.
#[derive(Debug, Clone, Default)]
pub struct ProcessIo {
    /// Bytes written to stdin before it is closed. `None` means null stdin.
    pub stdin: Option<Vec<u8>>,
    pub stdout: StreamTarget,
    pub stderr: StreamTarget,
}

impl ProcessIo {
    /// Null stdin, stdout into `sink`, stderr discarded.
    pub fn stdout_only(sink: OutputSink) -> Self {
        Self {
            stdin: None,
            stdout: StreamTarget::Sink(sink),
            stderr: StreamTarget::Discard,
        }
    }
}

/// How a process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitStatus {
    /// Set when the platform could not produce a real exit code.
    pub error: Option<String>,
    pub code: u32,
}

impl ExitStatus {
    /// A normal exit with `code`.
    pub fn exited(code: u32) -> Self {
        Self { error: None, code }
    }

    /// No usable exit code; `message` says why.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            code: u32::MAX,
        }
    }

    /// Exit code zero.
    pub fn success(&self) -> bool {
        self.error.is_none() && self.code == 0
    }
}

/// One-shot delivery of a process's [`ExitStatus`].
#[derive(Debug)]
pub struct ExitNotification {
    rx: oneshot::Receiver<ExitStatus>,
}

/// Sending half of an [`ExitNotification`], held by the backend.
#[derive(Debug)]
pub struct ExitNotifier {
    tx: oneshot::Sender<ExitStatus>,
}

impl ExitNotification {
    /// Create a connected notifier/notification pair.
    pub fn channel() -> (ExitNotifier, ExitNotification) {
        let (tx, rx) = oneshot::channel();
        (ExitNotifier { tx }, ExitNotification { rx })
    }

    /// Wait for the exit status.
    ///
    /// If the backend drops its notifier without sending, the result is an
    /// [`ExitStatus`] carrying an error rather than a hang.
    pub async fn recv(self) -> ExitStatus {
        match self.rx.await {
            Ok(status) => status,
            Err(_) => ExitStatus::failed("exit notification dropped before delivery"),
        }
    }
}

impl ExitNotifier {
    /// Deliver the status. Returns `false` if the waiter is gone.
    pub fn notify(self, status: ExitStatus) -> bool {
        self.tx.send(status).is_ok()
    }
}

/// Errors reported by a runtime backend.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("process {0:?} already exists in task")]
    AlreadyExists(String),

    #[error("process {0:?} not found in task")]
    NotFound(String),

    #[error("invalid process state: {0}")]
    InvalidState(String),

    #[error("process spec has no arguments")]
    EmptyArgs,

    #[error("{command} failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("{0}")]
    Other(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A running container task that processes can be created in.
///
/// Implementations must allow concurrent `exec` calls from many workers.
#[async_trait]
pub trait Task: Send + Sync {
    /// Identifier of the underlying container/task.
    fn id(&self) -> &str;

    /// Create (but do not start) a process named `exec_id`.
    async fn exec(
        &self,
        exec_id: &str,
        spec: &ProcessSpec,
        io: ProcessIo,
    ) -> Result<Box<dyn Process>, RuntimeError>;
}

/// A process created inside a [`Task`].
#[async_trait]
pub trait Process: Send + Sync {
    /// The id this process was created with.
    fn id(&self) -> &str;

    /// Register for the exit notification. Only valid before [`start`].
    ///
    /// [`start`]: Process::start
    async fn wait(&mut self) -> Result<ExitNotification, RuntimeError>;

    /// Start the process.
    async fn start(&mut self) -> Result<(), RuntimeError>;

    /// Release the process, killing it first when `kill` is set.
    async fn delete(&mut self, kill: bool) -> Result<(), RuntimeError>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn Task, _: &dyn Process) {}
};
