//! Child-process helpers shared across the workspace.
//!
//! Covers the three patterns the transfer adapter needs:
//! - building commands that stay windowless on Windows
//! - capturing the output of a short-lived command under a hard timeout
//! - waiting on a long-running child with cancellation support

use std::ffi::OsStr;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Child;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

impl NoWindowExt for std::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.creation_flags(CREATE_NO_WINDOW);
        }
    }
}

impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `std::process::Command` with `CREATE_NO_WINDOW` applied on Windows.
pub fn std_command(program: impl AsRef<OsStr>) -> std::process::Command {
    let mut cmd = std::process::Command::new(program);
    cmd.no_window();
    cmd
}

/// Create a `tokio::process::Command` with `CREATE_NO_WINDOW` applied on Windows.
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window();
    cmd
}

/// Captured output of a finished short-lived command.
#[derive(Debug)]
pub struct CapturedOutput {
    /// Exit code, `None` if the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CapturedOutput {
    /// Whether the command exited with status zero.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Run a command to completion, capturing stdout and stderr, bounded by a
/// hard timeout.
///
/// If `stdin` is provided, the bytes are written to the child's stdin and
/// the pipe is closed before waiting. Returns `Ok(None)` when the timeout
/// elapses; the child is killed before returning so no orphan survives a
/// hung invocation.
pub async fn run_with_timeout(
    mut command: tokio::process::Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
) -> std::io::Result<Option<CapturedOutput>> {
    command.stdout(Stdio::piped()).stderr(Stdio::piped());
    command.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });

    let mut child = command.spawn()?;

    if let Some(bytes) = stdin
        && let Some(mut sink) = child.stdin.take()
    {
        sink.write_all(bytes).await?;
        // Dropping the handle closes the pipe so the child sees EOF.
        drop(sink);
    }

    // Drain both pipes concurrently with the wait; a child that fills a
    // pipe buffer would otherwise never exit.
    let stdout_task = tokio::spawn(slurp(child.stdout.take()));
    let stderr_task = tokio::spawn(slurp(child.stderr.take()));

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => {
            let status = status?;
            let stdout = stdout_task.await.unwrap_or_default();
            let stderr = stderr_task.await.unwrap_or_default();
            Ok(Some(CapturedOutput {
                exit_code: status.code(),
                stdout,
                stderr,
            }))
        }
        Err(_) => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "Command timed out, killing child"
            );
            if let Err(e) = child.kill().await {
                error!("Failed to kill timed-out child: {}", e);
            }
            stdout_task.abort();
            stderr_task.abort();
            Ok(None)
        }
    }
}

async fn slurp(reader: Option<impl tokio::io::AsyncRead + Unpin>) -> String {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        let _ = reader.read_to_end(&mut buf).await;
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Spawn a task that waits for a long-running child to exit and sends the
/// result through a oneshot channel.
///
/// If the cancellation token fires first, the child is killed and `None`
/// is sent instead of an exit code.
///
/// # Returns
/// A receiver yielding:
/// * `Some(exit_code)` - the process exited on its own
/// * `None` - the process was cancelled and killed
pub fn spawn_process_waiter(
    mut child: Child,
    cancellation_token: CancellationToken,
) -> oneshot::Receiver<Option<i32>> {
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let exit_code = tokio::select! {
            _ = cancellation_token.cancelled() => {
                if let Err(e) = child.kill().await {
                    error!("Failed to kill cancelled child: {}", e);
                }
                None
            }
            status = child.wait() => {
                match status {
                    Ok(exit_status) => {
                        let code = exit_status.code();
                        if let Some(c) = code
                            && c != 0
                        {
                            warn!(code = c, "Process exited with non-zero status");
                        }
                        code
                    }
                    Err(e) => {
                        error!("Error waiting for process: {}", e);
                        Some(-1)
                    }
                }
            }
        };
        let _ = tx.send(exit_code);
    });

    rx
}
