//! Docker CLI runtime backend.
//!
//! Each [`DockerProcess`] is one `docker exec` invocation against a running
//! container. Creation only reserves the exec id; the `docker exec` client is
//! spawned on [`Process::start`], and a monitor task streams its output into
//! the configured sinks and delivers the exit status to the registered
//! waiter.
//!
//! The daemon keeps an exec'd command alive when its client dies, so the
//! command is started through a `/bin/sh` wrapper that reports its
//! in-container pid on the first stderr line. A forced delete of a process
//! that is still running kills that pid with a second `docker exec` before
//! the client is reaped. The container must therefore ship `/bin/sh` and
//! `kill`.

use std::collections::HashSet;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    ExitNotification, ExitNotifier, ExitStatus, Process, ProcessIo, ProcessSpec, RuntimeError,
    StreamTarget, Task,
};

/// Exec ids currently reserved in a task.
type LiveSet = Arc<Mutex<HashSet<String>>>;

/// Prefix of the stderr line carrying the in-container pid.
const PID_PREFIX: &str = "execcheck-pid:";

/// Reports `$$` and replaces itself with the real command.
const PID_WRAPPER: &str = r#"echo "execcheck-pid:$$" >&2; exec "$@""#;

/// How long a forced delete waits for the pid report of a fresh process.
const PID_REPORT_WAIT: Duration = Duration::from_secs(2);

/// A running Docker container used as a task.
#[derive(Debug, Clone)]
pub struct DockerTask {
    docker: String,
    container_id: String,
    live: LiveSet,
}

impl DockerTask {
    /// Wrap a container, using `docker` from `$PATH`.
    pub fn new(container_id: impl Into<String>) -> Self {
        Self::with_binary("docker", container_id)
    }

    /// Wrap a container using a specific docker binary.
    pub fn with_binary(docker: impl Into<String>, container_id: impl Into<String>) -> Self {
        Self {
            docker: docker.into(),
            container_id: container_id.into(),
            live: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Wrap a container after checking that it is running.
    pub async fn connect(
        docker: impl Into<String>,
        container_id: impl Into<String>,
    ) -> Result<Self, RuntimeError> {
        let task = Self::with_binary(docker, container_id);
        let output = Command::new(&task.docker)
            .args(["inspect", "--format", "{{.State.Running}}", &task.container_id])
            .output()
            .await?;

        if !output.status.success() {
            return Err(RuntimeError::Command {
                command: format!("docker inspect {}", task.container_id),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        if String::from_utf8_lossy(&output.stdout).trim() != "true" {
            return Err(RuntimeError::InvalidState(format!(
                "container {} is not running",
                task.container_id
            )));
        }

        Ok(task)
    }

    fn reserve(&self, exec_id: &str) -> Result<(), RuntimeError> {
        let mut live = self.live.lock().unwrap_or_else(|p| p.into_inner());
        if !live.insert(exec_id.to_string()) {
            return Err(RuntimeError::AlreadyExists(exec_id.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Task for DockerTask {
    fn id(&self) -> &str {
        &self.container_id
    }

    async fn exec(
        &self,
        exec_id: &str,
        spec: &ProcessSpec,
        io: ProcessIo,
    ) -> Result<Box<dyn Process>, RuntimeError> {
        if spec.args.is_empty() {
            return Err(RuntimeError::EmptyArgs);
        }
        self.reserve(exec_id)?;

        debug!(
            container_id = %self.container_id,
            exec_id = exec_id,
            args = ?spec.args,
            "created docker exec process"
        );

        Ok(Box::new(DockerProcess {
            exec_id: exec_id.to_string(),
            docker: self.docker.clone(),
            container_id: self.container_id.clone(),
            spec: spec.clone(),
            io: Some(io),
            state: ProcState::Created,
            notifier: None,
            cancel: CancellationToken::new(),
            monitor: None,
            pid: None,
            live: Arc::clone(&self.live),
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcState {
    Created,
    Running,
    Deleted,
}

/// One `docker exec` process.
#[derive(Debug)]
pub struct DockerProcess {
    exec_id: String,
    docker: String,
    container_id: String,
    spec: ProcessSpec,
    io: Option<ProcessIo>,
    state: ProcState,
    notifier: Option<ExitNotifier>,
    cancel: CancellationToken,
    monitor: Option<JoinHandle<()>>,
    /// In-container pid, once the wrapper has reported it.
    pid: Option<watch::Receiver<Option<u32>>>,
    live: LiveSet,
}

impl DockerProcess {
    /// Arguments passed to the docker binary for this process.
    fn exec_args(&self, interactive: bool) -> Vec<String> {
        let mut args = vec!["exec".to_string()];
        if interactive {
            args.push("-i".to_string());
        }
        args.push("-w".to_string());
        args.push(self.spec.cwd.to_string_lossy().into_owned());
        for (key, value) in &self.spec.env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        args.push(self.container_id.clone());
        args.extend(
            ["/bin/sh", "-c", PID_WRAPPER, "sh"]
                .into_iter()
                .map(String::from),
        );
        args.extend(self.spec.args.iter().cloned());
        args
    }

    /// Kill the command inside the container.
    ///
    /// Failure is logged: the process may have exited on its own meanwhile.
    async fn kill_in_container(&mut self) {
        let Some(rx) = self.pid.as_mut() else {
            return;
        };
        let pid = match tokio::time::timeout(PID_REPORT_WAIT, rx.wait_for(Option::is_some)).await
        {
            Ok(Ok(pid)) => *pid,
            _ => None,
        };
        let Some(pid) = pid else {
            warn!(exec_id = %self.exec_id, "in-container pid unknown, only the exec client is killed");
            return;
        };

        let pid = pid.to_string();
        match Command::new(&self.docker)
            .args(["exec", &self.container_id, "kill", "-9", &pid])
            .output()
            .await
        {
            Ok(output) if output.status.success() => {
                debug!(exec_id = %self.exec_id, pid = %pid, "killed process in container");
            }
            Ok(output) => {
                debug!(
                    exec_id = %self.exec_id,
                    pid = %pid,
                    stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                    "kill in container failed"
                );
            }
            Err(e) => {
                warn!(exec_id = %self.exec_id, error = %e, "failed to run kill in container");
            }
        }
    }

    fn release(&self) {
        let mut live = self.live.lock().unwrap_or_else(|p| p.into_inner());
        live.remove(&self.exec_id);
    }
}

fn stdio_for(target: &StreamTarget) -> Stdio {
    match target {
        StreamTarget::Discard => Stdio::null(),
        StreamTarget::Sink(_) => Stdio::piped(),
    }
}

#[async_trait]
impl Process for DockerProcess {
    fn id(&self) -> &str {
        &self.exec_id
    }

    async fn wait(&mut self) -> Result<ExitNotification, RuntimeError> {
        if self.state != ProcState::Created {
            return Err(RuntimeError::InvalidState(format!(
                "cannot wait on {}: already started or deleted",
                self.exec_id
            )));
        }
        if self.notifier.is_some() {
            return Err(RuntimeError::InvalidState(format!(
                "a waiter is already registered for {}",
                self.exec_id
            )));
        }
        let (notifier, notification) = ExitNotification::channel();
        self.notifier = Some(notifier);
        Ok(notification)
    }

    async fn start(&mut self) -> Result<(), RuntimeError> {
        if self.state != ProcState::Created {
            return Err(RuntimeError::InvalidState(format!(
                "cannot start {}: already started or deleted",
                self.exec_id
            )));
        }
        let io = self
            .io
            .take()
            .ok_or_else(|| RuntimeError::InvalidState(format!("{} has no stdio", self.exec_id)))?;

        let args = self.exec_args(io.stdin.is_some());
        let child = Command::new(&self.docker)
            .args(&args)
            .stdin(if io.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(stdio_for(&io.stdout))
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let (pid_tx, pid_rx) = watch::channel(None);
        self.pid = Some(pid_rx);

        self.state = ProcState::Running;
        debug!(exec_id = %self.exec_id, "started docker exec");

        let notifier = self.notifier.take();
        let cancel = self.cancel.clone();
        let exec_id = self.exec_id.clone();
        self.monitor = Some(tokio::spawn(async move {
            let status = supervise(child, io, pid_tx, cancel).await;
            match notifier {
                Some(notifier) => {
                    if !notifier.notify(status) {
                        debug!(exec_id = %exec_id, "exit waiter went away before delivery");
                    }
                }
                None => {
                    debug!(exec_id = %exec_id, status = ?status, "no waiter registered, exit status dropped");
                }
            }
        }));

        Ok(())
    }

    async fn delete(&mut self, kill: bool) -> Result<(), RuntimeError> {
        match self.state {
            ProcState::Deleted => return Err(RuntimeError::NotFound(self.exec_id.clone())),
            ProcState::Created => {}
            ProcState::Running => {
                let finished = self.monitor.as_ref().is_none_or(|m| m.is_finished());
                if !finished && !kill {
                    return Err(RuntimeError::InvalidState(format!(
                        "{} is still running",
                        self.exec_id
                    )));
                }
                if !finished {
                    self.kill_in_container().await;
                }
                self.cancel.cancel();
                if let Some(monitor) = self.monitor.take() {
                    if let Err(e) = monitor.await {
                        warn!(exec_id = %self.exec_id, error = %e, "exec monitor task failed");
                    }
                }
            }
        }

        // Any waiter on a never-started process resolves instead of hanging.
        self.notifier.take();
        self.state = ProcState::Deleted;
        self.release();
        debug!(exec_id = %self.exec_id, "deleted docker exec process");
        Ok(())
    }
}

impl Drop for DockerProcess {
    fn drop(&mut self) {
        if self.state != ProcState::Deleted {
            self.cancel.cancel();
            self.release();
        }
    }
}

/// Stream the child's output into its sinks and wait for it, killing the
/// client if `cancel` fires first.
async fn supervise(
    mut child: Child,
    io: ProcessIo,
    pid_tx: watch::Sender<Option<u32>>,
    cancel: CancellationToken,
) -> ExitStatus {
    let stdin_pipe = child.stdin.take();
    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();
    let ProcessIo {
        stdin,
        stdout,
        stderr,
    } = io;

    let outcome = {
        let feed = async move {
            if let (Some(mut pipe), Some(bytes)) = (stdin_pipe, stdin) {
                if let Err(e) = pipe.write_all(&bytes).await {
                    debug!(error = %e, "failed to write exec stdin");
                }
                // Dropping the pipe closes stdin.
            }
        };
        let run = async {
            let (_, _, _, status) = tokio::join!(
                feed,
                forward(stdout_pipe, stdout),
                forward_stderr(stderr_pipe, stderr, pid_tx),
                child.wait()
            );
            status
        };
        tokio::select! {
            status = run => Some(status),
            _ = cancel.cancelled() => None,
        }
    };

    match outcome {
        Some(Ok(status)) => match status.code() {
            Some(code) => ExitStatus::exited(code as u32),
            None => ExitStatus::failed(format!("process terminated without exit code ({status})")),
        },
        Some(Err(e)) => ExitStatus::failed(format!("failed to wait on docker exec: {e}")),
        None => {
            if let Err(e) = child.kill().await {
                debug!(error = %e, "failed to kill docker exec client");
            }
            ExitStatus::failed("process killed")
        }
    }
}

async fn forward<R>(pipe: Option<R>, target: StreamTarget)
where
    R: AsyncRead + Unpin,
{
    let (Some(mut pipe), StreamTarget::Sink(mut sink)) = (pipe, target) else {
        return;
    };
    if let Err(e) = tokio::io::copy(&mut pipe, &mut sink).await {
        warn!(error = %e, "failed to stream exec output");
    }
}

/// Like [`forward`], but strips the wrapper's pid line and publishes it.
async fn forward_stderr(
    pipe: Option<ChildStderr>,
    target: StreamTarget,
    pid_tx: watch::Sender<Option<u32>>,
) {
    let Some(pipe) = pipe else {
        return;
    };
    let mut reader = BufReader::new(pipe);
    let mut first = Vec::new();
    if let Err(e) = reader.read_until(b'\n', &mut first).await {
        warn!(error = %e, "failed to read exec stderr");
        return;
    }

    let reported = std::str::from_utf8(&first)
        .ok()
        .and_then(|line| line.trim_end().strip_prefix(PID_PREFIX))
        .and_then(|pid| pid.parse::<u32>().ok());
    match reported {
        Some(pid) => {
            pid_tx.send_replace(Some(pid));
        }
        None => {
            if let StreamTarget::Sink(sink) = &target {
                sink.append(&first);
            }
        }
    }

    let copied = match target {
        StreamTarget::Sink(mut sink) => tokio::io::copy(&mut reader, &mut sink).await,
        StreamTarget::Discard => tokio::io::copy(&mut reader, &mut tokio::io::sink()).await,
    };
    if let Err(e) = copied {
        warn!(error = %e, "failed to stream exec stderr");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::OutputSink;

    fn spec() -> ProcessSpec {
        ProcessSpec::new(["/bin/echo", "hi stdout"], "/")
    }

    #[tokio::test]
    async fn exec_rejects_empty_args() {
        let task = DockerTask::new("c1");
        let result = task
            .exec("p", &ProcessSpec::new(Vec::<String>::new(), "/"), ProcessIo::default())
            .await;
        assert!(matches!(result, Err(RuntimeError::EmptyArgs)));
    }

    #[tokio::test]
    async fn exec_rejects_duplicate_ids() {
        let task = DockerTask::new("c1");
        let _first = task.exec("say-hello-0", &spec(), ProcessIo::default()).await.unwrap();
        let second = task.exec("say-hello-0", &spec(), ProcessIo::default()).await;
        assert!(matches!(second, Err(RuntimeError::AlreadyExists(id)) if id == "say-hello-0"));
    }

    #[tokio::test]
    async fn delete_releases_id() {
        let task = DockerTask::new("c1");
        let mut proc = task.exec("p", &spec(), ProcessIo::default()).await.unwrap();
        proc.delete(true).await.unwrap();
        assert!(task.exec("p", &spec(), ProcessIo::default()).await.is_ok());
    }

    #[tokio::test]
    async fn drop_releases_id() {
        let task = DockerTask::new("c1");
        let proc = task.exec("p", &spec(), ProcessIo::default()).await.unwrap();
        drop(proc);
        assert!(task.exec("p", &spec(), ProcessIo::default()).await.is_ok());
    }

    #[tokio::test]
    async fn second_delete_is_not_found() {
        let task = DockerTask::new("c1");
        let mut proc = task.exec("p", &spec(), ProcessIo::default()).await.unwrap();
        proc.delete(true).await.unwrap();
        assert!(matches!(proc.delete(true).await, Err(RuntimeError::NotFound(_))));
    }

    #[tokio::test]
    async fn double_wait_is_rejected() {
        let task = DockerTask::new("c1");
        let mut proc = task.exec("p", &spec(), ProcessIo::default()).await.unwrap();
        let _n = proc.wait().await.unwrap();
        assert!(matches!(proc.wait().await, Err(RuntimeError::InvalidState(_))));
    }

    #[tokio::test]
    async fn start_with_missing_binary_fails() {
        let task = DockerTask::with_binary("/nonexistent/docker-binary-for-tests", "c1");
        let mut proc = task
            .exec("p", &spec(), ProcessIo::stdout_only(OutputSink::new()))
            .await
            .unwrap();
        let _n = proc.wait().await.unwrap();
        assert!(matches!(proc.start().await, Err(RuntimeError::Io(_))));
        proc.delete(true).await.unwrap();
    }

    #[test]
    fn exec_args_layout() {
        let proc = DockerProcess {
            exec_id: "p".to_string(),
            docker: "docker".to_string(),
            container_id: "c1".to_string(),
            spec: spec().env("A", "1"),
            io: None,
            state: ProcState::Created,
            notifier: None,
            cancel: CancellationToken::new(),
            monitor: None,
            pid: None,
            live: Arc::new(Mutex::new(HashSet::new())),
        };
        assert_eq!(
            proc.exec_args(false),
            vec![
                "exec",
                "-w",
                "/",
                "-e",
                "A=1",
                "c1",
                "/bin/sh",
                "-c",
                PID_WRAPPER,
                "sh",
                "/bin/echo",
                "hi stdout"
            ]
        );
        assert_eq!(proc.exec_args(true)[1], "-i");
    }

    /// Runs `docker exec` locally through a shell script standing in for
    /// the docker client.
    ///
    /// Like the daemon, the script keeps the command running when the
    /// client itself is killed.
    #[cfg(target_os = "linux")]
    mod local_exec {
        use std::os::unix::fs::PermissionsExt;
        use std::path::PathBuf;
        use std::time::Duration;

        use tempfile::TempDir;

        use super::*;
        use crate::error::VerificationError;
        use crate::harness::verify;
        use crate::runner::{RunnerConfig, Scenario, run_process};

        const SHIM: &str = r#"#!/bin/sh
[ "$1" = exec ] || exit 2
shift
dir=/
while :; do
    case "$1" in
        -i) shift ;;
        -w) dir=$2; shift 2 ;;
        -e) export "$2"; shift 2 ;;
        *) break ;;
    esac
done
shift
cd "$dir" || exit 126
"$@" <&0 &
wait $!
"#;

        struct Shim {
            dir: TempDir,
        }

        impl Shim {
            fn new() -> Self {
                let dir = TempDir::new().unwrap();
                let path = dir.path().join("docker");
                std::fs::write(&path, SHIM).unwrap();
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
                Self { dir }
            }

            fn task(&self) -> DockerTask {
                DockerTask::with_binary(self.dir.path().join("docker").to_string_lossy(), "c1")
            }

            fn path(&self, name: &str) -> PathBuf {
                self.dir.path().join(name)
            }
        }

        fn alive(pid: &str) -> bool {
            match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
                // The state letter follows the parenthesised command name.
                Ok(stat) => !stat
                    .rsplit(')')
                    .next()
                    .is_some_and(|rest| rest.trim_start().starts_with('Z')),
                Err(_) => false,
            }
        }

        fn config(timeout: Duration) -> RunnerConfig {
            RunnerConfig {
                timeout: Some(timeout),
            }
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
        async fn stdout_reaches_each_sink() {
            let shim = Shim::new();
            let task: Arc<dyn Task> = Arc::new(shim.task());

            let errs = verify(
                task,
                10,
                &Scenario::default(),
                &config(Duration::from_secs(10)),
                CancellationToken::new(),
            )
            .await;

            assert!(errs.is_empty(), "{errs:?}");
        }

        #[tokio::test]
        async fn output_is_complete_when_exit_is_delivered() {
            let shim = Shim::new();
            let task = shim.task();
            let sink = OutputSink::new();
            let spec = ProcessSpec::new(["/bin/sh", "-c", "seq 1 20000"], "/");

            let mut proc = task
                .exec("p", &spec, ProcessIo::stdout_only(sink.clone()))
                .await
                .unwrap();
            let exit = proc.wait().await.unwrap();
            proc.start().await.unwrap();
            let status = exit.recv().await;
            proc.delete(true).await.unwrap();

            assert!(status.success(), "{status:?}");
            let out = sink.to_string_lossy();
            assert_eq!(out.lines().count(), 20000);
            assert!(out.ends_with("20000\n"));
        }

        #[tokio::test]
        async fn non_zero_exit_is_mapped() {
            let shim = Shim::new();
            let task = shim.task();
            let scenario = Scenario::default().with_args(["/bin/sh", "-c", "exit 7"]);

            let err = run_process(
                &task,
                0,
                &scenario,
                &config(Duration::from_secs(10)),
                &CancellationToken::new(),
            )
            .await
            .expect("should fail");

            assert!(
                matches!(err, VerificationError::NonZeroExit { index: 0, code: 7 }),
                "{err:?}"
            );
        }

        #[tokio::test]
        async fn stderr_excludes_pid_report_and_stdin_is_fed() {
            let shim = Shim::new();
            let task = shim.task();
            let stdout = OutputSink::new();
            let stderr = OutputSink::new();
            let io = ProcessIo {
                stdin: Some(b"piped in\n".to_vec()),
                stdout: StreamTarget::Sink(stdout.clone()),
                stderr: StreamTarget::Sink(stderr.clone()),
            };
            let spec = ProcessSpec::new(["/bin/sh", "-c", "cat; echo oops >&2"], "/");

            let mut proc = task.exec("p", &spec, io).await.unwrap();
            let exit = proc.wait().await.unwrap();
            proc.start().await.unwrap();
            let status = exit.recv().await;
            proc.delete(true).await.unwrap();

            assert!(status.success(), "{status:?}");
            assert_eq!(stdout.to_string_lossy(), "piped in\n");
            assert_eq!(stderr.to_string_lossy(), "oops\n");
        }

        #[tokio::test]
        async fn delete_without_kill_refuses_running_process() {
            let shim = Shim::new();
            let task = shim.task();
            let spec = ProcessSpec::new(["sleep", "30"], "/");

            let mut proc = task.exec("p", &spec, ProcessIo::default()).await.unwrap();
            let _exit = proc.wait().await.unwrap();
            proc.start().await.unwrap();

            assert!(matches!(
                proc.delete(false).await,
                Err(RuntimeError::InvalidState(_))
            ));
            proc.delete(true).await.unwrap();
        }

        #[tokio::test]
        async fn timed_out_process_is_killed_in_container() {
            let shim = Shim::new();
            let task = shim.task();
            let pid_file = shim.path("pid");
            let script = format!("echo $$ > {}; exec sleep 30", pid_file.display());
            let scenario = Scenario::default().with_args(["/bin/sh", "-c", script.as_str()]);

            let err = run_process(
                &task,
                0,
                &scenario,
                &config(Duration::from_millis(500)),
                &CancellationToken::new(),
            )
            .await
            .expect("should time out");
            assert!(matches!(err, VerificationError::Timeout { index: 0, .. }), "{err:?}");

            let pid = std::fs::read_to_string(&pid_file).unwrap();
            let pid = pid.trim();
            let mut still_alive = alive(pid);
            for _ in 0..40 {
                if !still_alive {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
                still_alive = alive(pid);
            }
            if still_alive {
                // Do not leak the sleeper into the rest of the test run.
                let _ = std::process::Command::new("kill").args(["-9", pid]).status();
            }
            assert!(!still_alive, "pid {pid} survived a forced delete");
        }
    }
}
