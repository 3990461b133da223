//! External transfer tool adapter.
//!
//! Wraps the vendor's `lnd` delivery client behind a trait seam so the
//! pipeline can be driven by a scripted tool in tests. Every invocation is
//! scoped to a caller-supplied working directory; the adapter never touches
//! the process-wide working directory, which would not be safe under
//! concurrent tasks.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::settings::{Settings, validate_tool_path};
use crate::{Error, Result};

/// Buffered line capacity for an in-flight transfer.
const TRANSFER_LINE_BUFFER: usize = 256;

/// Output of an in-flight transfer process.
pub struct TransferStream {
    /// Output lines, stdout and stderr interleaved in arrival order.
    /// Closes when the process exits or is killed.
    pub lines: mpsc::Receiver<String>,
    /// Final exit code; yields `None` when the transfer was cancelled.
    pub exit: oneshot::Receiver<Option<i32>>,
}

/// Boundary trait for the external transfer tool.
#[async_trait]
pub trait TransferTool: Send + Sync {
    /// Log in to the vendor. Bounded by a hard timeout.
    async fn authenticate(&self, account: &str, secret: &str, dir: &Path) -> Result<()>;

    /// List remote files under a delivery path. Bounded by a hard timeout.
    ///
    /// Returns the captured listing text.
    async fn enumerate(&self, remote_path: &str, dir: &Path) -> Result<String>;

    /// Start transferring a delivery into `dir`.
    ///
    /// No artificial timeout; the returned stream lives until the child
    /// exits. Cancelling the token kills the child process.
    async fn transfer(
        &self,
        remote_path: &str,
        dir: &Path,
        cancel: CancellationToken,
    ) -> Result<TransferStream>;

    /// Whether the tool binary exists and is executable.
    fn is_available(&self) -> bool;

    /// Tool version string, if it could be probed.
    fn version(&self) -> Option<String>;
}

/// Adapter for the vendor's `lnd` command-line client.
pub struct LndTool {
    binary_path: PathBuf,
    auth_timeout: Duration,
    list_timeout: Duration,
    /// Cached version string, probed at construction.
    version: Option<String>,
}

impl LndTool {
    /// Create an adapter with default timeouts.
    pub fn new(binary_path: impl Into<PathBuf>) -> Self {
        Self::with_timeouts(
            binary_path,
            Duration::from_secs(60),
            Duration::from_secs(120),
        )
    }

    /// Create an adapter configured from settings.
    pub fn from_settings(settings: &Settings) -> Self {
        Self::with_timeouts(
            settings.lnd_path.clone(),
            Duration::from_secs(settings.auth_timeout_secs),
            Duration::from_secs(settings.list_timeout_secs),
        )
    }

    /// Create an adapter with explicit login/listing timeouts.
    pub fn with_timeouts(
        binary_path: impl Into<PathBuf>,
        auth_timeout: Duration,
        list_timeout: Duration,
    ) -> Self {
        let binary_path = binary_path.into();
        let version = Self::detect_version(&binary_path);
        Self {
            binary_path,
            auth_timeout,
            list_timeout,
            version,
        }
    }

    /// Probe the tool version (first output line of `lnd --version`).
    fn detect_version(path: &Path) -> Option<String> {
        let mut cmd = process_utils::std_command(path);
        cmd.arg("--version");
        cmd.output().ok().and_then(|output| {
            String::from_utf8(output.stdout)
                .ok()
                .and_then(|s| s.lines().next().map(|l| l.trim().to_string()))
        })
    }

    fn login_args(account: &str) -> Vec<String> {
        vec![
            "login".to_string(),
            "-u".to_string(),
            account.to_string(),
            "-p".to_string(),
        ]
    }

    fn list_args(remote_path: &str) -> Vec<String> {
        vec!["list".to_string(), remote_path.to_string()]
    }

    fn copy_args(remote_path: &str) -> Vec<String> {
        vec![
            "cp".to_string(),
            "-d".to_string(),
            remote_path.to_string(),
            "./".to_string(),
        ]
    }

    /// Pick the most useful diagnostic from a failed invocation.
    fn failure_output(output: &process_utils::CapturedOutput) -> String {
        let stderr = output.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        let stdout = output.stdout.trim();
        if !stdout.is_empty() {
            return stdout.to_string();
        }
        format!("exit code {:?}", output.exit_code)
    }
}

#[async_trait]
impl TransferTool for LndTool {
    async fn authenticate(&self, account: &str, secret: &str, dir: &Path) -> Result<()> {
        let mut cmd = process_utils::tokio_command(&self.binary_path);
        cmd.args(Self::login_args(account)).current_dir(dir);

        debug!(account = %account, "Authenticating against vendor");

        // The secret goes through the child's stdin, never the command line.
        let secret_line = format!("{}\n", secret);
        let output =
            process_utils::run_with_timeout(cmd, Some(secret_line.as_bytes()), self.auth_timeout)
                .await
                .map_err(|e| Error::Authentication(e.to_string()))?
                .ok_or_else(|| Error::timeout("login", self.auth_timeout.as_secs()))?;

        if output.success() {
            Ok(())
        } else {
            Err(Error::Authentication(Self::failure_output(&output)))
        }
    }

    async fn enumerate(&self, remote_path: &str, dir: &Path) -> Result<String> {
        let mut cmd = process_utils::tokio_command(&self.binary_path);
        cmd.args(Self::list_args(remote_path)).current_dir(dir);

        debug!(remote = %remote_path, "Listing remote files");

        let output = process_utils::run_with_timeout(cmd, None, self.list_timeout)
            .await
            .map_err(|e| Error::Enumeration(e.to_string()))?
            .ok_or_else(|| Error::timeout("listing", self.list_timeout.as_secs()))?;

        if output.success() {
            Ok(output.stdout)
        } else {
            Err(Error::Enumeration(Self::failure_output(&output)))
        }
    }

    async fn transfer(
        &self,
        remote_path: &str,
        dir: &Path,
        cancel: CancellationToken,
    ) -> Result<TransferStream> {
        let mut cmd = process_utils::tokio_command(&self.binary_path);
        cmd.args(Self::copy_args(remote_path))
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        info!(remote = %remote_path, dir = %dir.display(), "Starting transfer");

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Transfer(format!("Failed to spawn transfer tool: {}", e)))?;

        let (line_tx, line_rx) = mpsc::channel::<String>(TRANSFER_LINE_BUFFER);

        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, line_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, line_tx);
        }

        let exit = process_utils::spawn_process_waiter(child, cancel);

        Ok(TransferStream {
            lines: line_rx,
            exit,
        })
    }

    fn is_available(&self) -> bool {
        validate_tool_path(&self.binary_path).is_ok()
    }

    fn version(&self) -> Option<String> {
        self.version.clone()
    }
}

/// Forward lines from a child pipe into the shared line channel.
///
/// The reader task ends at EOF; once both pipe readers have dropped their
/// senders the channel closes and the consumer sees the end of output.
fn forward_lines(
    reader: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    tx: mpsc::Sender<String>,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).await.is_err() {
                break;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_args_shape() {
        assert_eq!(LndTool::login_args("X1-Z01-J1"), ["login", "-u", "X1-Z01-J1", "-p"]);
    }

    #[test]
    fn test_list_and_copy_args_shape() {
        assert_eq!(LndTool::list_args("oss://CP1/"), ["list", "oss://CP1/"]);
        assert_eq!(
            LndTool::copy_args("oss://CP1/"),
            ["cp", "-d", "oss://CP1/", "./"]
        );
    }

    #[test]
    fn test_unavailable_for_missing_binary() {
        let tool = LndTool::new("/definitely/not/here/lnd");
        assert!(!tool.is_available());
        assert!(tool.version().is_none());
    }

    #[cfg(unix)]
    mod scripted {
        use super::*;
        use std::os::unix::fs::PermissionsExt;
        use tempfile::TempDir;

        /// Write an executable shell script standing in for the lnd binary.
        ///
        /// The script answers the version probe immediately so adapter
        /// construction never waits on the scripted body.
        fn fake_tool(dir: &TempDir, body: &str) -> PathBuf {
            let path = dir.path().join("lnd");
            let script = format!(
                "#!/bin/sh\nif [ \"$1\" = \"--version\" ]; then echo 'lnd 2.0.0'; exit 0; fi\n{}\n",
                body
            );
            std::fs::write(&path, script).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        #[tokio::test]
        async fn test_authenticate_success() {
            let dir = TempDir::new().unwrap();
            let tool = LndTool::new(fake_tool(&dir, "cat > /dev/null; exit 0"));

            assert!(tool.is_available());
            assert_eq!(tool.version().as_deref(), Some("lnd 2.0.0"));
            let result = tool.authenticate("acct", "pw", dir.path()).await;
            assert!(result.is_ok());
        }

        #[tokio::test]
        async fn test_authenticate_failure_carries_stderr() {
            let dir = TempDir::new().unwrap();
            let tool = LndTool::new(fake_tool(
                &dir,
                "cat > /dev/null; echo 'invalid credentials' >&2; exit 1",
            ));

            let err = tool.authenticate("acct", "pw", dir.path()).await.unwrap_err();
            match err {
                Error::Authentication(msg) => assert_eq!(msg, "invalid credentials"),
                other => panic!("unexpected error: {:?}", other),
            }
        }

        #[tokio::test]
        async fn test_authenticate_timeout() {
            let dir = TempDir::new().unwrap();
            let tool = LndTool::with_timeouts(
                fake_tool(&dir, "sleep 30"),
                Duration::from_millis(200),
                Duration::from_secs(1),
            );

            let err = tool.authenticate("acct", "pw", dir.path()).await.unwrap_err();
            assert!(matches!(err, Error::Timeout { .. }));
        }

        #[tokio::test]
        async fn test_enumerate_returns_listing() {
            let dir = TempDir::new().unwrap();
            let tool = LndTool::new(fake_tool(&dir, "echo sample_1.fq.gz; echo MD5.txt"));

            let listing = tool.enumerate("oss://CP1/", dir.path()).await.unwrap();
            assert!(listing.contains("sample_1.fq.gz"));
            assert!(listing.contains("MD5.txt"));
        }

        #[tokio::test]
        async fn test_transfer_streams_lines_and_exit_code() {
            let dir = TempDir::new().unwrap();
            let tool = LndTool::new(fake_tool(
                &dir,
                "echo 'downloading 50%'; echo 'done'; exit 0",
            ));

            let mut stream = tool
                .transfer("oss://CP1/", dir.path(), CancellationToken::new())
                .await
                .unwrap();

            let mut lines = Vec::new();
            while let Some(line) = stream.lines.recv().await {
                lines.push(line);
            }
            assert_eq!(lines, ["downloading 50%", "done"]);
            assert_eq!(stream.exit.await.unwrap(), Some(0));
        }

        #[tokio::test]
        async fn test_transfer_cancellation_kills_child() {
            let dir = TempDir::new().unwrap();
            let tool = LndTool::new(fake_tool(&dir, "echo started; exec sleep 30"));

            let token = CancellationToken::new();
            let mut stream = tool
                .transfer("oss://CP1/", dir.path(), token.clone())
                .await
                .unwrap();

            assert_eq!(stream.lines.recv().await.as_deref(), Some("started"));
            token.cancel();

            assert_eq!(stream.exit.await.unwrap(), None);
        }
    }
}
