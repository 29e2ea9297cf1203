//! External assistant process runner.
//!
//! Launches the assistant CLI with a deterministic argument list:
//!
//! ```text
//! <host_cli> [host_cli_args…] -p [--output-format stream-json --verbose]
//!            --permission-mode bypassPermissions [--continue] <prompt>
//! ```
//!
//! Each call to [`ProcessRunner::spawn`] starts exactly one process with
//! stdin closed, stdout and stderr piped, and `kill_on_drop(true)` so a
//! dropped handle never leaves an orphan behind.
//!
//! A [`RunningProcess`] tracks its lifecycle through [`ProcessState`]; every
//! change goes through [`RunningProcess::apply`], so "exited" and "aborted"
//! can never both claim the handle.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::GlobalConfig;
use crate::{AppError, Result};

/// Time an aborted process gets to exit after `SIGTERM` before it is killed.
pub const ABORT_GRACE: Duration = Duration::from_secs(3);

/// Output style requested from the assistant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationMode {
    /// Line-delimited JSON events (`--output-format stream-json --verbose`).
    Streaming,
    /// Plain text on stdout.
    Plain,
    /// One-shot project initialization (`init --output-format json`).
    Init,
}

/// Everything needed to launch one assistant run.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Prompt passed as the final argument (ignored for [`InvocationMode::Init`]).
    pub prompt: String,
    /// Directory the process starts in.
    pub working_dir: PathBuf,
    /// Follow-up turn in an existing conversation.
    pub continue_chat: bool,
    /// Output style.
    pub mode: InvocationMode,
}

impl Invocation {
    /// A streaming run of `prompt` in `working_dir`.
    #[must_use]
    pub fn streaming(
        prompt: impl Into<String>,
        working_dir: impl Into<PathBuf>,
        continue_chat: bool,
    ) -> Self {
        Self {
            prompt: prompt.into(),
            working_dir: working_dir.into(),
            continue_chat,
            mode: InvocationMode::Streaming,
        }
    }

    /// A plain-text run of `prompt` in `working_dir`.
    #[must_use]
    pub fn plain(
        prompt: impl Into<String>,
        working_dir: impl Into<PathBuf>,
        continue_chat: bool,
    ) -> Self {
        Self {
            mode: InvocationMode::Plain,
            ..Self::streaming(prompt, working_dir, continue_chat)
        }
    }

    /// A project initialization run in `working_dir`.
    #[must_use]
    pub fn init(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            prompt: String::new(),
            working_dir: working_dir.into(),
            continue_chat: false,
            mode: InvocationMode::Init,
        }
    }
}

/// Compose the argument list for an invocation.
#[must_use]
pub fn build_args(extra: &[String], invocation: &Invocation) -> Vec<String> {
    let mut args: Vec<String> = extra.to_vec();

    if invocation.mode == InvocationMode::Init {
        args.extend(["init", "--output-format", "json"].map(String::from));
        return args;
    }

    args.push("-p".into());
    if invocation.mode == InvocationMode::Streaming {
        args.extend(["--output-format", "stream-json", "--verbose"].map(String::from));
    }
    args.extend(["--permission-mode", "bypassPermissions"].map(String::from));
    if invocation.continue_chat {
        args.push("--continue".into());
    }
    args.push(invocation.prompt.clone());
    args
}

/// Lifecycle of a launched process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Not yet launched.
    Idle,
    /// Launched and not yet reaped.
    Running,
    /// Termination signal sent; waiting for exit.
    Terminating,
    /// Exit observed.
    Terminated,
}

/// Input to the process state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The OS process started.
    Spawn,
    /// Caller requested termination.
    Abort,
    /// Exit status observed.
    Exit,
}

impl ProcessState {
    /// Resulting state, or `None` when the transition does not apply.
    #[must_use]
    pub fn next(self, transition: Transition) -> Option<Self> {
        match (self, transition) {
            (Self::Idle, Transition::Spawn) => Some(Self::Running),
            (Self::Running, Transition::Abort) => Some(Self::Terminating),
            (Self::Running | Self::Terminating, Transition::Exit) => Some(Self::Terminated),
            _ => None,
        }
    }
}

/// Final status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReport {
    /// Exit code; `None` when ended by a signal.
    pub code: Option<i32>,
    /// Whether the run was aborted by the caller.
    pub aborted: bool,
}

impl ExitReport {
    /// Whether the process exited cleanly with code 0.
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Launches assistant processes using the configured binary.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    host_cli: String,
    host_cli_args: Vec<String>,
}

impl ProcessRunner {
    /// Runner for an explicit binary and leading arguments.
    #[must_use]
    pub fn new(host_cli: impl Into<String>, host_cli_args: Vec<String>) -> Self {
        Self {
            host_cli: host_cli.into(),
            host_cli_args,
        }
    }

    /// Runner configured from [`GlobalConfig`].
    #[must_use]
    pub fn from_config(config: &GlobalConfig) -> Self {
        Self::new(config.host_cli.clone(), config.host_cli_args.clone())
    }

    /// Launch one process for `invocation`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Spawn` when the binary is missing, not executable,
    /// or the working directory is unusable.
    pub fn spawn(&self, invocation: &Invocation) -> Result<RunningProcess> {
        let args = build_args(&self.host_cli_args, invocation);

        let mut cmd = Command::new(&self.host_cli);
        cmd.args(&args)
            .current_dir(&invocation.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|err| {
            AppError::Spawn(format!("failed to launch {}: {err}", self.host_cli))
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        info!(
            pid = child.id().unwrap_or(0),
            host_cli = %self.host_cli,
            cwd = %invocation.working_dir.display(),
            continue_chat = invocation.continue_chat,
            "assistant process spawned"
        );

        let mut process = RunningProcess {
            child,
            stdout,
            stderr,
            state: ProcessState::Idle,
        };
        process.apply(Transition::Spawn);
        Ok(process)
    }
}

/// Handle to one launched assistant process.
#[derive(Debug)]
pub struct RunningProcess {
    child: Child,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    state: ProcessState,
}

impl RunningProcess {
    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// OS process id while the process is alive.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Take the stdout pipe; `None` after the first call.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// Take the stderr pipe; `None` after the first call.
    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.stderr.take()
    }

    /// Single authoritative state transition. Returns `false` when ignored.
    pub fn apply(&mut self, transition: Transition) -> bool {
        match self.state.next(transition) {
            Some(next) => {
                debug!(from = ?self.state, to = ?next, "process state transition");
                self.state = next;
                true
            }
            None => false,
        }
    }

    /// Ask the process to terminate.
    ///
    /// Idempotent: a no-op unless the process is still running.
    pub fn abort(&mut self) {
        if !self.apply(Transition::Abort) {
            return;
        }
        if !self.send_terminate() {
            if let Err(err) = self.child.start_kill() {
                warn!(%err, "failed to kill assistant process");
            }
        }
    }

    /// Wait for the process to exit.
    ///
    /// After [`abort`](Self::abort) the process gets [`ABORT_GRACE`] to
    /// exit before it is force-killed, so this always completes.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Process` if the exit status cannot be collected.
    pub async fn wait(&mut self) -> Result<ExitReport> {
        let aborted = self.state == ProcessState::Terminating;
        let waited = if aborted {
            if let Ok(waited) = tokio::time::timeout(ABORT_GRACE, self.child.wait()).await {
                waited
            } else {
                warn!(pid = self.pid().unwrap_or(0), "process ignored SIGTERM, killing");
                self.child.kill().await.ok();
                self.child.wait().await
            }
        } else {
            self.child.wait().await
        };
        let status = waited
            .map_err(|err| AppError::Process(format!("failed to wait for assistant: {err}")))?;

        self.apply(Transition::Exit);
        let report = ExitReport {
            code: status.code(),
            aborted,
        };
        info!(exit_code = ?report.code, aborted, "assistant process exited");
        Ok(report)
    }

    /// Read all of stdout as text and wait for exit.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if stdout cannot be read, or `AppError::Process`
    /// if the exit status cannot be collected.
    pub async fn collect_output(&mut self) -> Result<(String, ExitReport)> {
        let mut output = String::new();
        if let Some(mut stdout) = self.take_stdout() {
            let mut bytes = Vec::new();
            stdout.read_to_end(&mut bytes).await?;
            output = String::from_utf8_lossy(&bytes).into_owned();
        }
        let report = self.wait().await?;
        Ok((output, report))
    }

    #[cfg(unix)]
    fn send_terminate(&self) -> bool {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.pid().and_then(|p| i32::try_from(p).ok()) else {
            return false;
        };
        match kill(Pid::from_raw(pid), Signal::SIGTERM) {
            Ok(()) => true,
            Err(err) => {
                warn!(pid, %err, "failed to send SIGTERM");
                false
            }
        }
    }

    #[cfg(not(unix))]
    fn send_terminate(&self) -> bool {
        false
    }
}

/// Drain stderr line by line into the log. Never parsed as protocol data.
#[must_use]
pub fn spawn_stderr_logger(request_id: String, stderr: ChildStderr) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => warn!(request_id, stderr = %line, "assistant stderr"),
                Ok(None) => break,
                Err(err) => {
                    debug!(request_id, %err, "stderr reader stopped");
                    break;
                }
            }
        }
    })
}
