//! Transfer task record and related types.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::request::DeliveryRequest;

/// Log lines are capped at this many entries...
const LOG_CAP: usize = 1000;
/// ...and truncated down to the most recent this many when the cap is hit.
const LOG_KEEP: usize = 800;

/// Status of a transfer task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, not yet started.
    Pending,
    /// Authenticating against the vendor.
    LoggingIn,
    /// Listing remote files.
    Listing,
    /// Transfer in progress.
    Downloading,
    /// Post-transfer checksum verification.
    Validating,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Cancelled by request.
    Cancelled,
}

impl TaskStatus {
    /// Whether this status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::LoggingIn => "logging_in",
            Self::Listing => "listing",
            Self::Downloading => "downloading",
            Self::Validating => "validating",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One end-to-end transfer job.
///
/// Owned by the [`TaskStore`](super::store::TaskStore); readers only ever
/// see cloned snapshots, and all mutation funnels through the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferTask {
    /// Opaque unique identifier, time-derived plus the account name.
    pub id: String,
    /// The validated delivery request; immutable after creation.
    pub request: DeliveryRequest,
    /// Directory dedicated to this task, never shared between tasks.
    pub target_dir: PathBuf,
    pub status: TaskStatus,
    /// Progress estimate in [0, 100]; meaningless once status is terminal.
    pub progress: f64,
    /// Human-readable label of the active stage.
    pub current_step: String,
    /// Timestamped log lines, append-only, capped.
    pub log: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Set only on failure; the single source of truth for why.
    pub error_message: String,
}

impl TransferTask {
    /// Create a fresh Pending record.
    pub fn new(id: impl Into<String>, request: DeliveryRequest, target_dir: PathBuf) -> Self {
        Self {
            id: id.into(),
            request,
            target_dir,
            status: TaskStatus::Pending,
            progress: 0.0,
            current_step: String::new(),
            log: Vec::new(),
            started_at: None,
            finished_at: None,
            error_message: String::new(),
        }
    }

    /// Append a timestamped log line, enforcing the cap.
    pub fn append_log(&mut self, message: &str) {
        let line = format!("[{}] {}", Utc::now().format("%Y-%m-%d %H:%M:%S"), message);
        self.log.push(line);
        if self.log.len() > LOG_CAP {
            self.log.drain(..self.log.len() - LOG_KEEP);
        }
    }

    /// Raise the progress estimate, clamped to [0, 100].
    ///
    /// Writes below the current value are ignored so the estimate never
    /// moves backwards within a run.
    pub fn raise_progress(&mut self, value: f64) {
        let clamped = value.clamp(0.0, 100.0);
        if clamped > self.progress {
            self.progress = clamped;
        }
    }
}

/// Events broadcast to subscribers on every status or progress mutation.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// Task status changed.
    StatusChanged { task_id: String, status: TaskStatus },
    /// Progress estimate moved.
    Progress { task_id: String, progress: f64 },
}
