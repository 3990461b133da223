//! The per-task stage pipeline.
//!
//! Runs login, listing, download, and verification strictly in sequence
//! for one task, funneling every record mutation through the task store.
//! Failures are caught at stage boundaries and turn into a terminal
//! Failed status; nothing escapes the execution unit.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::store::TaskStore;
use super::task::{TaskStatus, TransferEvent};
use super::tool::TransferTool;
use crate::validate;
use crate::{Error, Result};

const PROGRESS_AFTER_LOGIN: f64 = 20.0;
const PROGRESS_AFTER_LISTING: f64 = 30.0;
const PROGRESS_AFTER_TRANSFER: f64 = 90.0;

/// Listing artifact persisted alongside the task directory.
const LISTING_FILENAME: &str = "file_list.txt";
/// Verification report persisted alongside the task directory.
const REPORT_FILENAME: &str = "validation_report.txt";

/// Path of a task artifact, kept next to the task directory so it never
/// mixes with the delivered files.
fn artifact_path(dir: &Path, name: &str) -> std::path::PathBuf {
    match (dir.parent(), dir.file_name()) {
        (Some(parent), Some(dir_name)) => {
            parent.join(format!("{}.{}", dir_name.to_string_lossy(), name))
        }
        _ => dir.join(name),
    }
}

/// Map a tool-reported percentage onto the downloading progress band.
///
/// The tool's own progress output is a heuristic, so the estimate stays
/// inside [30, 90] and the milestones bound it on both sides.
fn transfer_progress(percent: f64) -> f64 {
    let span = PROGRESS_AFTER_TRANSFER - PROGRESS_AFTER_LISTING;
    (PROGRESS_AFTER_LISTING + (percent / 100.0) * span)
        .clamp(PROGRESS_AFTER_LISTING, PROGRESS_AFTER_TRANSFER)
}

/// Best-effort percentage extraction from a tool output line.
///
/// Takes the last whitespace-separated token before a `%` sign. Lines that
/// don't parse are simply ignored; progress then stays at the last
/// milestone rather than failing the transfer.
fn parse_percent(line: &str) -> Option<f64> {
    let idx = line.find('%')?;
    let token = line[..idx].split_whitespace().last()?;
    let token = token.trim_start_matches(['(', '[']);
    token
        .parse::<f64>()
        .ok()
        .filter(|p| (0.0..=100.0).contains(p))
}

/// Executes the stage pipeline for one task.
pub(super) struct StageRunner {
    pub store: Arc<TaskStore>,
    pub tool: Arc<dyn TransferTool>,
    pub events: broadcast::Sender<TransferEvent>,
    pub cancel: CancellationToken,
    pub auto_validate: bool,
    pub task_id: String,
}

impl StageRunner {
    /// Run the pipeline to a terminal state.
    pub async fn run(self) {
        let _ = self.store.update(&self.task_id, |task| {
            task.started_at = Some(Utc::now());
        });

        if let Err(e) = self.execute().await {
            self.fail(e);
        }
    }

    async fn execute(&self) -> Result<()> {
        let task = self
            .store
            .get(&self.task_id)
            .ok_or_else(|| Error::not_found("task", &self.task_id))?;
        let request = task.request;
        let dir = task.target_dir;

        if !self.enter_stage(TaskStatus::LoggingIn, "Logging in") {
            return Ok(());
        }
        self.tool
            .authenticate(&request.account, &request.secret, &dir)
            .await?;
        self.log("Login succeeded");
        self.set_progress(PROGRESS_AFTER_LOGIN);

        if !self.enter_stage(TaskStatus::Listing, "Listing remote files") {
            return Ok(());
        }
        let listing = self.tool.enumerate(&request.remote_path, &dir).await?;
        tokio::fs::write(artifact_path(&dir, LISTING_FILENAME), &listing).await?;
        self.log("Remote file listing saved");
        self.set_progress(PROGRESS_AFTER_LISTING);

        if !self.enter_stage(TaskStatus::Downloading, "Downloading files") {
            return Ok(());
        }
        if !self.download(&request.remote_path, &dir).await? {
            // Cancelled mid-transfer; status is already terminal.
            return Ok(());
        }

        if !self.enter_stage(TaskStatus::Validating, "Validating files") {
            return Ok(());
        }
        self.validate_files(&dir).await;

        self.complete();
        Ok(())
    }

    /// Consume the transfer's output stream until the child exits.
    ///
    /// Returns `Ok(false)` when the transfer was cancelled.
    async fn download(&self, remote_path: &str, dir: &Path) -> Result<bool> {
        let mut stream = self
            .tool
            .transfer(remote_path, dir, self.cancel.clone())
            .await?;

        while let Some(line) = stream.lines.recv().await {
            if let Some(percent) = parse_percent(&line) {
                self.set_progress(transfer_progress(percent));
            }
            self.log(&line);
        }

        match stream.exit.await {
            Ok(Some(0)) => {
                self.log("File download finished");
                self.set_progress(PROGRESS_AFTER_TRANSFER);
                Ok(true)
            }
            Ok(None) => {
                self.log("Transfer process terminated");
                Ok(false)
            }
            // The tool's line-oriented output carries no reliable final
            // diagnostic, so the error stays generic.
            Ok(Some(_)) | Err(_) => Err(Error::Transfer("download failed".to_string())),
        }
    }

    /// Advisory verification: problems are logged as warnings, never fatal.
    async fn validate_files(&self, dir: &Path) {
        let task_dir = dir.to_path_buf();
        let auto_validate = self.auto_validate;

        let outcome = tokio::task::spawn_blocking(move || {
            if !auto_validate {
                let stats = validate::directory_stats(&task_dir);
                return validate::VerificationReport {
                    text: String::new(),
                    checks: Vec::new(),
                    stats,
                };
            }
            let report = validate::verify_directory(&task_dir);
            let report_path = artifact_path(&task_dir, REPORT_FILENAME);
            if let Err(e) = std::fs::write(&report_path, &report.text) {
                warn!(dir = %task_dir.display(), error = %e, "Could not write validation report");
            }
            report
        })
        .await;

        let report = match outcome {
            Ok(report) => report,
            Err(e) => {
                warn!(task_id = %self.task_id, error = %e, "Verification did not run");
                self.log(&format!("Warning: verification skipped: {}", e));
                return;
            }
        };

        self.log(&format!(
            "Downloaded {} files ({})",
            report.stats.total_files,
            validate::format_size(report.stats.total_size)
        ));

        if auto_validate && report.checks.is_empty() {
            self.log("No checksum manifest found");
        }
        for check in &report.checks {
            if check.all_passed() {
                self.log(&format!(
                    "Checksum manifest {} verified ({} files)",
                    check.manifest.display(),
                    check.passed.len()
                ));
            } else {
                warn!(
                    task_id = %self.task_id,
                    manifest = %check.manifest.display(),
                    failed = check.failed.len(),
                    missing = check.missing.len(),
                    "Checksum verification reported problems"
                );
                self.log(&format!(
                    "Warning: manifest {} had {} failed and {} unreadable entries",
                    check.manifest.display(),
                    check.failed.len(),
                    check.missing.len()
                ));
            }
        }
    }

    /// Move to a new stage unless the task has already reached a terminal
    /// state (e.g. cancelled between stages). Returns whether it applied.
    fn enter_stage(&self, status: TaskStatus, step: &str) -> bool {
        let mut applied = false;
        let _ = self.store.update(&self.task_id, |task| {
            if task.status.is_terminal() {
                return;
            }
            task.status = status;
            task.current_step = step.to_string();
            task.append_log(step);
            applied = true;
        });
        if applied {
            info!(task_id = %self.task_id, status = %status, "Stage started");
            self.notify_status(status);
        }
        applied
    }

    fn set_progress(&self, value: f64) {
        let mut raised_to = None;
        let _ = self.store.update(&self.task_id, |task| {
            if task.status.is_terminal() {
                return;
            }
            let before = task.progress;
            task.raise_progress(value);
            if task.progress > before {
                raised_to = Some(task.progress);
            }
        });
        if let Some(progress) = raised_to {
            let _ = self.events.send(TransferEvent::Progress {
                task_id: self.task_id.clone(),
                progress,
            });
        }
    }

    fn log(&self, message: &str) {
        let _ = self.store.update(&self.task_id, |task| {
            task.append_log(message);
        });
    }

    fn complete(&self) {
        let mut applied = false;
        let _ = self.store.update(&self.task_id, |task| {
            if task.status.is_terminal() {
                return;
            }
            task.status = TaskStatus::Completed;
            task.current_step = "Download complete".to_string();
            task.raise_progress(100.0);
            task.finished_at = Some(Utc::now());
            if let Some(started) = task.started_at {
                let elapsed = Utc::now() - started;
                task.append_log(&format!("Task completed in {}s", elapsed.num_seconds()));
            }
            applied = true;
        });
        if applied {
            info!(task_id = %self.task_id, "Transfer task completed");
            self.notify_status(TaskStatus::Completed);
            let _ = self.events.send(TransferEvent::Progress {
                task_id: self.task_id.clone(),
                progress: 100.0,
            });
        }
    }

    fn fail(&self, cause: Error) {
        let message = cause.to_string();
        let mut applied = false;
        let _ = self.store.update(&self.task_id, |task| {
            if task.status.is_terminal() {
                return;
            }
            task.status = TaskStatus::Failed;
            task.error_message = message.clone();
            task.finished_at = Some(Utc::now());
            task.append_log(&format!("Task failed: {}", message));
            applied = true;
        });
        if applied {
            error!(task_id = %self.task_id, error = %message, "Transfer task failed");
            self.notify_status(TaskStatus::Failed);
        }
    }

    fn notify_status(&self, status: TaskStatus) {
        let _ = self.events.send(TransferEvent::StatusChanged {
            task_id: self.task_id.clone(),
            status,
        });
    }
}
