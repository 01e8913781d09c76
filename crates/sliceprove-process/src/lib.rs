//! External command execution.
//!
//! Every external tool (compiler, slicer, instrumenter, verifier) runs
//! through the [`Executor`] trait: the command's combined stdout and stderr
//! is delivered line by line, as raw bytes, to a caller-supplied sink while
//! the process runs. [`SystemExecutor`] is the real implementation on top of
//! `tokio::process`; tests substitute scripted executors so the rest of the
//! system stays headless-testable.
//!
//! Timeouts are hard: when the wall-clock budget expires the child gets
//! SIGTERM, a short grace period, then SIGKILL. Cancellation is cooperative
//! through [`CancelToken`] and surfaces as [`SupervisorError::Interrupted`],
//! which is distinct from a tool failure.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Notify};
use tokio::time;
use tracing::{debug, warn};

/// Grace period between SIGTERM and SIGKILL on timeout or cancellation.
pub const TERM_GRACE: Duration = Duration::from_millis(500);

/// A command to run: argv, working directory, environment and budget.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub argv: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub envs: Vec<(String, String)>,
    /// Wall-clock budget; `None` means unlimited.
    pub budget: Option<Duration>,
}

impl CommandSpec {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            cwd: None,
            envs: Vec::new(),
            budget: None,
        }
    }

    pub fn with_cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn with_budget(mut self, budget: Option<Duration>) -> Self {
        self.budget = budget;
        self
    }

    /// The command line as one string, for logs and error messages.
    pub fn display(&self) -> String {
        self.argv.join(" ")
    }
}

/// How a supervised process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOutcome {
    /// Exit code; 0 when the process was killed by a signal.
    pub exit_code: i32,
    /// Terminating signal; 0 when the process exited normally.
    pub signal: i32,
    /// The wall-clock budget expired and the process was killed.
    pub timed_out: bool,
}

impl RunOutcome {
    pub fn success(&self) -> bool {
        !self.timed_out && self.signal == 0 && self.exit_code == 0
    }
}

/// Receives output lines (raw bytes, including the trailing newline if the
/// line had one) while the process runs. Never called after `run` returns.
pub trait LineSink: Send {
    fn line(&mut self, line: &[u8]);
}

impl<F> LineSink for F
where
    F: FnMut(&[u8]) + Send,
{
    fn line(&mut self, line: &[u8]) {
        self(line)
    }
}

/// Cooperative cancellation shared between the CLI signal handler and
/// everything that runs external commands.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; wakes every pending [`cancelled`](Self::cancelled)
    /// wait.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // register with the Notify before checking the flag; an unpolled
        // Notified never receives notify_waiters, so a cancel landing
        // between the check and the first poll would be lost
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

/// Errors from running an external command.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("empty command line")]
    EmptyCommand,
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("i/o error while supervising `{command}`: {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
    /// The run was cancelled from outside; not a tool failure.
    #[error("interrupted")]
    Interrupted,
}

/// Runs commands and streams their output.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn run(
        &self,
        spec: &CommandSpec,
        sink: &mut dyn LineSink,
        cancel: &CancelToken,
    ) -> Result<RunOutcome, SupervisorError>;
}

/// Real executor on top of `tokio::process::Command`.
#[derive(Debug, Clone)]
pub struct SystemExecutor {
    grace: Duration,
}

impl Default for SystemExecutor {
    fn default() -> Self {
        Self { grace: TERM_GRACE }
    }
}

impl SystemExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// SIGTERM, wait out the grace period, then SIGKILL. Returns the final
    /// exit status.
    async fn terminate(&self, child: &mut Child, command: &str) -> Result<RunOutcome, SupervisorError> {
        if let Some(pid) = child.id() {
            // give the tool a chance to flush and clean up
            unsafe { libc::kill(pid as i32, libc::SIGTERM) };
            if let Ok(status) = time::timeout(self.grace, child.wait()).await {
                let status = status.map_err(|source| SupervisorError::Io {
                    command: command.to_string(),
                    source,
                })?;
                return Ok(outcome_of(status, true));
            }
            warn!(command, "process ignored SIGTERM, killing");
        }
        child.start_kill().map_err(|source| SupervisorError::Io {
            command: command.to_string(),
            source,
        })?;
        let status = child.wait().await.map_err(|source| SupervisorError::Io {
            command: command.to_string(),
            source,
        })?;
        Ok(outcome_of(status, true))
    }
}

enum Stop {
    Eof,
    Cancelled,
}

async fn drain(
    rx: &mut mpsc::Receiver<Vec<u8>>,
    sink: &mut dyn LineSink,
    cancel: &CancelToken,
) -> Stop {
    loop {
        tokio::select! {
            line = rx.recv() => match line {
                Some(line) => sink.line(&line),
                None => return Stop::Eof,
            },
            _ = cancel.cancelled() => return Stop::Cancelled,
        }
    }
}

async fn pump_lines<R>(reader: R, tx: mpsc::Sender<Vec<u8>>)
where
    R: AsyncRead + Unpin + Send,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                if tx.send(buf.clone()).await.is_err() {
                    break;
                }
            }
        }
    }
}

fn outcome_of(status: std::process::ExitStatus, timed_out: bool) -> RunOutcome {
    use std::os::unix::process::ExitStatusExt;
    RunOutcome {
        exit_code: status.code().unwrap_or(0),
        signal: status.signal().unwrap_or(0),
        timed_out,
    }
}

#[async_trait]
impl Executor for SystemExecutor {
    async fn run(
        &self,
        spec: &CommandSpec,
        sink: &mut dyn LineSink,
        cancel: &CancelToken,
    ) -> Result<RunOutcome, SupervisorError> {
        if cancel.is_cancelled() {
            return Err(SupervisorError::Interrupted);
        }
        let (program, args) = spec.argv.split_first().ok_or(SupervisorError::EmptyCommand)?;
        let command_line = spec.display();
        debug!(command = %command_line, "|> spawning");

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }
        for (key, value) in &spec.envs {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            program: program.clone(),
            source,
        })?;

        // merge stdout and stderr into one ordered line stream
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_lines(stderr, tx.clone()));
        }
        drop(tx);

        let stop = match spec.budget {
            Some(budget) => match time::timeout(budget, drain(&mut rx, sink, cancel)).await {
                Ok(stop) => stop,
                Err(_) => {
                    debug!(command = %command_line, "budget expired");
                    return self.terminate(&mut child, &command_line).await;
                }
            },
            None => drain(&mut rx, sink, cancel).await,
        };

        match stop {
            Stop::Cancelled => {
                let _ = self.terminate(&mut child, &command_line).await;
                Err(SupervisorError::Interrupted)
            }
            Stop::Eof => {
                let status = child.wait().await.map_err(|source| SupervisorError::Io {
                    command: command_line.clone(),
                    source,
                })?;
                let outcome = outcome_of(status, false);
                debug!(
                    command = %command_line,
                    exit_code = outcome.exit_code,
                    signal = outcome.signal,
                    "process finished"
                );
                Ok(outcome)
            }
        }
    }
}

/// Look up an executable: a path with a directory component is checked
/// directly, a bare name is searched on `PATH`.
pub fn find_executable(name: &str) -> Option<PathBuf> {
    use std::os::unix::fs::PermissionsExt;

    fn is_executable(path: &Path) -> bool {
        path.metadata()
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }

    let direct = Path::new(name);
    if direct.components().count() > 1 {
        return is_executable(direct).then(|| direct.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}
