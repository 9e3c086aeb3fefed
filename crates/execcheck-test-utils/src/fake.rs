//! In-memory task backend.
//!
//! Processes "run" by interpreting their argument vector (see
//! [`interpret`]) and writing the result into the stdout target. Failure
//! switches are keyed by exec id so a single worker can be broken while its
//! siblings run normally.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use execcheck_core::runtime::{
    ExitNotification, ExitNotifier, ExitStatus, Process, ProcessIo, ProcessSpec, RuntimeError,
    StreamTarget, Task,
};

/// Every call the fake saw, by exec id.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    /// Ids passed to `exec`, including failed attempts.
    pub exec_attempts: Vec<String>,
    /// Ids of processes that were successfully created.
    pub created: Vec<String>,
    pub waited: Vec<String>,
    pub started: Vec<String>,
    /// Ids `delete` was called for, including failed deletes.
    pub deleted: Vec<String>,
}

#[derive(Debug, Default)]
struct Switches {
    fail_exec: HashSet<String>,
    fail_wait: HashSet<String>,
    fail_start: HashSet<String>,
    fail_delete: HashSet<String>,
    runtime_error: HashSet<String>,
    hang: HashSet<String>,
    panic_on_exec: HashSet<String>,
    exit_delay: Duration,
    instant_exit: bool,
}

#[derive(Debug, Default)]
struct Shared {
    switches: Switches,
    live: Mutex<HashSet<String>>,
    journal: Mutex<Journal>,
    running: AtomicUsize,
    peak_running: AtomicUsize,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

impl Shared {
    fn record(&self, f: impl FnOnce(&mut Journal)) {
        f(&mut lock(&self.journal));
    }

    fn enter_running(&self) {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_running.fetch_max(now, Ordering::SeqCst);
    }

    fn leave_running(&self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Scriptable in-memory [`Task`].
///
/// Configure with the builder methods, then share it as `Arc<FakeTask>`;
/// clone that into an `Arc<dyn Task>` for the harness and keep the original
/// to read the [`Journal`] afterwards.
#[derive(Debug)]
pub struct FakeTask {
    id: String,
    shared: Arc<Shared>,
}

impl Default for FakeTask {
    fn default() -> Self {
        Self::new("fake-task")
    }
}

impl FakeTask {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            shared: Arc::new(Shared::default()),
        }
    }

    fn switches(&mut self) -> &mut Switches {
        // Only called while building, before any process holds the Arc.
        &mut Arc::get_mut(&mut self.shared)
            .expect("FakeTask must be configured before use")
            .switches
    }

    /// `exec` fails for this id.
    pub fn fail_exec(mut self, exec_id: impl Into<String>) -> Self {
        self.switches().fail_exec.insert(exec_id.into());
        self
    }

    /// `wait` fails for this id.
    pub fn fail_wait(mut self, exec_id: impl Into<String>) -> Self {
        self.switches().fail_wait.insert(exec_id.into());
        self
    }

    /// `start` fails for this id.
    pub fn fail_start(mut self, exec_id: impl Into<String>) -> Self {
        self.switches().fail_start.insert(exec_id.into());
        self
    }

    /// `delete` fails for this id (the call is still journaled).
    pub fn fail_delete(mut self, exec_id: impl Into<String>) -> Self {
        self.switches().fail_delete.insert(exec_id.into());
        self
    }

    /// The exit notification for this id carries an error.
    pub fn runtime_error(mut self, exec_id: impl Into<String>) -> Self {
        self.switches().runtime_error.insert(exec_id.into());
        self
    }

    /// This process never exits until it is deleted.
    pub fn hang(mut self, exec_id: impl Into<String>) -> Self {
        self.switches().hang.insert(exec_id.into());
        self
    }

    /// `exec` panics for this id.
    pub fn panic_on_exec(mut self, exec_id: impl Into<String>) -> Self {
        self.switches().panic_on_exec.insert(exec_id.into());
        self
    }

    /// Delay between start and exit.
    pub fn exit_delay(mut self, delay: Duration) -> Self {
        self.switches().exit_delay = delay;
        self
    }

    /// Processes finish inside `start`, before it returns. A waiter
    /// registered after `start` would never hear about the exit.
    pub fn instant_exit(mut self) -> Self {
        self.switches().instant_exit = true;
        self
    }

    /// Snapshot of the call journal.
    pub fn journal(&self) -> Journal {
        lock(&self.shared.journal).clone()
    }

    /// Highest number of processes running at the same time.
    pub fn peak_running(&self) -> usize {
        self.shared.peak_running.load(Ordering::SeqCst)
    }

    /// Number of exec ids currently reserved.
    pub fn live_count(&self) -> usize {
        lock(&self.shared.live).len()
    }
}

#[async_trait]
impl Task for FakeTask {
    fn id(&self) -> &str {
        &self.id
    }

    async fn exec(
        &self,
        exec_id: &str,
        spec: &ProcessSpec,
        io: ProcessIo,
    ) -> Result<Box<dyn Process>, RuntimeError> {
        let shared = &self.shared;
        shared.record(|j| j.exec_attempts.push(exec_id.to_string()));

        if shared.switches.panic_on_exec.contains(exec_id) {
            panic!("fake exec panic for {exec_id}");
        }
        if shared.switches.fail_exec.contains(exec_id) {
            return Err(RuntimeError::Other(format!("fake exec failure for {exec_id}")));
        }
        if spec.args.is_empty() {
            return Err(RuntimeError::EmptyArgs);
        }
        if !lock(&shared.live).insert(exec_id.to_string()) {
            return Err(RuntimeError::AlreadyExists(exec_id.to_string()));
        }
        shared.record(|j| j.created.push(exec_id.to_string()));

        Ok(Box::new(FakeProcess {
            exec_id: exec_id.to_string(),
            spec: spec.clone(),
            io: Some(io),
            notifier: None,
            started: false,
            deleted: false,
            kill: CancellationToken::new(),
            shared: Arc::clone(shared),
        }))
    }
}

struct FakeProcess {
    exec_id: String,
    spec: ProcessSpec,
    io: Option<ProcessIo>,
    notifier: Option<ExitNotifier>,
    started: bool,
    deleted: bool,
    kill: CancellationToken,
    shared: Arc<Shared>,
}

/// Run `args` against the fake's tiny command set.
///
/// Returns `(stdout, exit code)`. Unknown programs exit 127.
pub fn interpret(args: &[String]) -> (Vec<u8>, u32) {
    let Some(program) = args.first() else {
        return (Vec::new(), 127);
    };
    let rest = &args[1..];
    match program.rsplit('/').next().unwrap_or(program) {
        "echo" => (format!("{}\n", rest.join(" ")).into_bytes(), 0),
        "true" => (Vec::new(), 0),
        "false" => (Vec::new(), 1),
        "sh" if rest.first().map(String::as_str) == Some("-c") => {
            interpret_script(rest.get(1).map(String::as_str).unwrap_or(""))
        }
        _ => (Vec::new(), 127),
    }
}

fn interpret_script(script: &str) -> (Vec<u8>, u32) {
    let mut out = Vec::new();
    for stmt in script.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        let (cmd, arg) = stmt.split_once(' ').unwrap_or((stmt, ""));
        let arg = arg.trim().trim_matches(|c| c == '"' || c == '\'');
        match cmd {
            "echo" => {
                out.extend_from_slice(arg.as_bytes());
                out.push(b'\n');
            }
            "exit" => return (out, arg.parse().unwrap_or(2)),
            "true" => {}
            _ => return (out, 127),
        }
    }
    (out, 0)
}

/// Write the process's output and compute its status.
fn run_to_exit(shared: &Shared, exec_id: &str, spec: &ProcessSpec, io: &ProcessIo) -> ExitStatus {
    if shared.switches.runtime_error.contains(exec_id) {
        return ExitStatus::failed(format!("fake runtime failure for {exec_id}"));
    }
    let (stdout, code) = interpret(&spec.args);
    if let StreamTarget::Sink(sink) = &io.stdout {
        sink.append(&stdout);
    }
    ExitStatus::exited(code)
}

#[async_trait]
impl Process for FakeProcess {
    fn id(&self) -> &str {
        &self.exec_id
    }

    async fn wait(&mut self) -> Result<ExitNotification, RuntimeError> {
        self.shared.record(|j| j.waited.push(self.exec_id.clone()));
        if self.started || self.deleted {
            return Err(RuntimeError::InvalidState(format!(
                "cannot wait on {}: already started",
                self.exec_id
            )));
        }
        if self.shared.switches.fail_wait.contains(&self.exec_id) {
            return Err(RuntimeError::Other(format!("fake wait failure for {}", self.exec_id)));
        }
        let (notifier, notification) = ExitNotification::channel();
        self.notifier = Some(notifier);
        Ok(notification)
    }

    async fn start(&mut self) -> Result<(), RuntimeError> {
        if self.started || self.deleted {
            return Err(RuntimeError::InvalidState(format!(
                "cannot start {}: already started",
                self.exec_id
            )));
        }
        if self.shared.switches.fail_start.contains(&self.exec_id) {
            return Err(RuntimeError::Other(format!("fake start failure for {}", self.exec_id)));
        }
        let io = self.io.take().unwrap_or_default();
        self.started = true;
        self.shared.record(|j| j.started.push(self.exec_id.clone()));
        self.shared.enter_running();

        let hangs = self.shared.switches.hang.contains(&self.exec_id);

        if self.shared.switches.instant_exit && !hangs {
            let status = run_to_exit(&self.shared, &self.exec_id, &self.spec, &io);
            self.shared.leave_running();
            // Without a registered waiter the status is lost, like a real
            // runtime reaping an unobserved process.
            if let Some(notifier) = self.notifier.take() {
                notifier.notify(status);
            }
            return Ok(());
        }

        let shared = Arc::clone(&self.shared);
        let exec_id = self.exec_id.clone();
        let spec = self.spec.clone();
        let kill = self.kill.clone();
        let notifier = self.notifier.take();
        let delay = self.shared.switches.exit_delay;

        tokio::spawn(async move {
            let finished = async {
                if hangs {
                    std::future::pending::<()>().await;
                }
                tokio::time::sleep(delay).await;
            };
            let status = tokio::select! {
                _ = finished => run_to_exit(&shared, &exec_id, &spec, &io),
                _ = kill.cancelled() => ExitStatus::failed("process killed"),
            };
            shared.leave_running();
            if let Some(notifier) = notifier {
                notifier.notify(status);
            }
        });

        Ok(())
    }

    async fn delete(&mut self, kill: bool) -> Result<(), RuntimeError> {
        self.shared.record(|j| j.deleted.push(self.exec_id.clone()));
        if self.deleted {
            return Err(RuntimeError::NotFound(self.exec_id.clone()));
        }
        if kill {
            self.kill.cancel();
        }
        self.notifier.take();
        self.deleted = true;
        lock(&self.shared.live).remove(&self.exec_id);

        if self.shared.switches.fail_delete.contains(&self.exec_id) {
            return Err(RuntimeError::Other(format!("fake delete failure for {}", self.exec_id)));
        }
        Ok(())
    }
}
