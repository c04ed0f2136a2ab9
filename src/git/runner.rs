//! Git process execution.
//!
//! Uses the git CLI directly. Every invocation captures stdout and stderr in
//! full, is bounded by a timeout, and can be interrupted through a
//! [`CancelSignal`]. On unix the child runs in its own process group so that
//! termination also reaches anything git spawned (hooks, helpers, pagers).

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use super::error::GitError;

/// Exit code reported for a command killed by its timeout (same as coreutils `timeout`)
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Exit code reported when the process was terminated by a signal
pub const SIGNALLED_EXIT_CODE: i32 = -1;

const TIMEOUT_MESSAGE_PREFIX: &str = "git command timed out after";

/// Outcome of one git process invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    /// True when the process exited with code 0
    pub success: bool,
    /// Captured stdout, trimmed
    pub output: String,
    /// Captured stderr, trimmed
    pub error: String,
    pub exit_code: i32,
}

impl CommandResult {
    /// Build a result from a finished process
    pub fn from_exit(exit_code: i32, stdout: &str, stderr: &str) -> Self {
        Self {
            success: exit_code == 0,
            output: stdout.trim().to_string(),
            error: stderr.trim().to_string(),
            exit_code,
        }
    }

    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: String::new(),
            exit_code: 0,
        }
    }

    pub fn failure(exit_code: i32, error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: error.into(),
            exit_code,
        }
    }

    /// Result reported when a command exceeded its time budget
    pub fn timed_out(timeout: Duration, command_line: &str) -> Self {
        Self::failure(
            TIMEOUT_EXIT_CODE,
            format!(
                "{TIMEOUT_MESSAGE_PREFIX} {} seconds: {command_line}",
                timeout.as_secs_f64()
            ),
        )
    }

    /// Check if this result comes from a timeout rather than a normal exit
    pub fn is_timeout(&self) -> bool {
        !self.success
            && self.exit_code == TIMEOUT_EXIT_CODE
            && self.error.starts_with(TIMEOUT_MESSAGE_PREFIX)
    }
}

/// Create a connected cancellation handle/signal pair
pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (sender, receiver) = watch::channel(false);
    (CancelHandle { sender }, CancelSignal { receiver })
}

/// Sending side of a cancellation signal, held by whoever may cancel
#[derive(Debug)]
pub struct CancelHandle {
    sender: watch::Sender<bool>,
}

impl CancelHandle {
    /// Fire the signal. Returns false when no task is listening anymore.
    pub fn cancel(&self) -> bool {
        self.sender.send(true).is_ok()
    }
}

/// Receiving side of a cancellation signal, passed down to process execution
#[derive(Debug, Clone)]
pub struct CancelSignal {
    receiver: watch::Receiver<bool>,
}

impl CancelSignal {
    /// A signal that never fires
    pub fn never() -> Self {
        let (_handle, signal) = cancel_pair();
        signal
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolve once the signal fires; pends forever if the handle is dropped first
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        let closed = receiver.wait_for(|cancelled| *cancelled).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::never()
    }
}

/// Abstraction over git process execution, so the service can be driven
/// without a real git binary in tests.
#[async_trait]
pub trait GitRunner: Send + Sync {
    /// Name or path of the executable this runner invokes
    fn executable(&self) -> &str;

    /// Locate the executable on disk
    fn resolve_executable(&self) -> Result<PathBuf, GitError>;

    /// Run git with `args` in `cwd`.
    ///
    /// Non-zero exits and timeouts come back as `Ok` with `success == false`.
    /// `Err` is reserved for spawn failures and cancellation.
    async fn run(
        &self,
        args: &[String],
        cwd: &Path,
        timeout: Duration,
        cancel: &CancelSignal,
    ) -> Result<CommandResult, GitError>;
}

/// Runner backed by the system git binary
#[derive(Debug, Clone)]
pub struct SystemGitRunner {
    executable: String,
}

impl SystemGitRunner {
    pub fn new(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
        }
    }
}

impl Default for SystemGitRunner {
    fn default() -> Self {
        Self::new("git")
    }
}

enum Exit {
    Finished(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

enum Drain {
    Finished(String, String),
    /// Always `Exit::TimedOut` or `Exit::Cancelled`
    Interrupted(Exit),
}

#[async_trait]
impl GitRunner for SystemGitRunner {
    fn executable(&self) -> &str {
        &self.executable
    }

    fn resolve_executable(&self) -> Result<PathBuf, GitError> {
        which::which(&self.executable)
            .map_err(|_| GitError::ExecutableNotFound(self.executable.clone()))
    }

    async fn run(
        &self,
        args: &[String],
        cwd: &Path,
        timeout: Duration,
        cancel: &CancelSignal,
    ) -> Result<CommandResult, GitError> {
        let command_line = format_command(&self.executable, args);
        if cancel.is_cancelled() {
            debug!(command = %command_line, "Skipping git command, already cancelled");
            return Err(GitError::Cancelled);
        }
        debug!(command = %command_line, cwd = %cwd.display(), "Running git command");

        let mut command = Command::new(&self.executable);
        command
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|source| GitError::Spawn {
            executable: self.executable.clone(),
            source,
        })?;
        // The group id outlives the leader once it has been reaped
        let pgid = child.id();
        let deadline = Instant::now() + timeout;

        let mut stdout = tokio::spawn(read_pipe(child.stdout.take()));
        let mut stderr = tokio::spawn(read_pipe(child.stderr.take()));

        let exit = tokio::select! {
            status = child.wait() => Exit::Finished(status),
            () = tokio::time::sleep_until(deadline) => Exit::TimedOut,
            () = cancel.cancelled() => Exit::Cancelled,
        };

        let status = match exit {
            Exit::Finished(status) => status.map_err(|source| GitError::Spawn {
                executable: self.executable.clone(),
                source,
            })?,
            interrupted => {
                terminate(&mut child, pgid).await;
                stdout.abort();
                stderr.abort();
                return interrupted_result(&interrupted, timeout, &command_line);
            }
        };

        // Hooks and credential helpers can hold the pipes open after git exits
        let drain = tokio::select! {
            (out, err) = async { tokio::join!(&mut stdout, &mut stderr) } => {
                Drain::Finished(out.unwrap_or_default(), err.unwrap_or_default())
            }
            () = tokio::time::sleep_until(deadline) => Drain::Interrupted(Exit::TimedOut),
            () = cancel.cancelled() => Drain::Interrupted(Exit::Cancelled),
        };

        let (stdout, stderr) = match drain {
            Drain::Finished(stdout, stderr) => (stdout, stderr),
            Drain::Interrupted(interrupted) => {
                terminate(&mut child, pgid).await;
                stdout.abort();
                stderr.abort();
                return interrupted_result(&interrupted, timeout, &command_line);
            }
        };

        let result = CommandResult::from_exit(
            status.code().unwrap_or(SIGNALLED_EXIT_CODE),
            &stdout,
            &stderr,
        );

        if !result.success {
            warn!(
                command = %command_line,
                exit_code = result.exit_code,
                error = %result.error,
                "Git command failed"
            );
        }

        Ok(result)
    }
}

fn interrupted_result(
    exit: &Exit,
    timeout: Duration,
    command_line: &str,
) -> Result<CommandResult, GitError> {
    if matches!(exit, Exit::TimedOut) {
        error!(command = %command_line, ?timeout, "Git command timed out");
        Ok(CommandResult::timed_out(timeout, command_line))
    } else {
        warn!(command = %command_line, "Git command cancelled");
        Err(GitError::Cancelled)
    }
}

/// Kill the process group, then the child itself, and reap it
async fn terminate(child: &mut Child, pgid: Option<u32>) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Some(pgid) = pgid {
            if let Err(e) = killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
                debug!(pgid, "killpg failed: {}", e);
            }
        }
    }
    #[cfg(not(unix))]
    let _ = pgid;

    if let Err(e) = child.kill().await {
        debug!("Failed to kill git process: {}", e);
    }
}

async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        if let Err(e) = pipe.read_to_end(&mut buf).await {
            debug!("Failed to read git output: {}", e);
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Render an argument vector for logs and error messages
pub(crate) fn format_command(executable: &str, args: &[String]) -> String {
    std::iter::once(executable)
        .chain(args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}
