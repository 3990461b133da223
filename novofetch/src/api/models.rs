//! API request and response models.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::transfer::{TaskStatus, TransferTask};

/// Task summary returned by list/create endpoints.
///
/// The delivery secret never leaves the process; responses carry only the
/// displayable request fields.
#[derive(Debug, Serialize)]
pub struct TaskResponse {
    pub id: String,
    pub status: TaskStatus,
    pub progress: f64,
    pub current_step: String,
    pub remote_path: String,
    pub account: String,
    pub target_dir: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error_message: String,
}

impl From<TransferTask> for TaskResponse {
    fn from(task: TransferTask) -> Self {
        Self {
            id: task.id,
            status: task.status,
            progress: task.progress,
            current_step: task.current_step,
            remote_path: task.request.remote_path,
            account: task.request.account,
            target_dir: task.target_dir.to_string_lossy().into_owned(),
            started_at: task.started_at,
            finished_at: task.finished_at,
            error_message: task.error_message,
        }
    }
}

/// Task detail including the accumulated log.
#[derive(Debug, Serialize)]
pub struct TaskDetailResponse {
    #[serde(flatten)]
    pub summary: TaskResponse,
    pub log: Vec<String>,
}

impl From<TransferTask> for TaskDetailResponse {
    fn from(task: TransferTask) -> Self {
        let log = task.log.clone();
        Self {
            summary: TaskResponse::from(task),
            log,
        }
    }
}

/// Health endpoint response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub tool_available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_version: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::DeliveryRequest;
    use std::path::PathBuf;

    #[test]
    fn test_task_response_redacts_secret() {
        let task = TransferTask::new(
            "task_1_acct",
            DeliveryRequest::new("oss://CP1/", "acct", "hunter2"),
            PathBuf::from("/data/acct_1"),
        );

        let json = serde_json::to_string(&TaskResponse::from(task)).unwrap();
        assert!(!json.contains("hunter2"));
        assert!(json.contains("oss://CP1/"));
    }

    #[test]
    fn test_empty_error_message_omitted() {
        let task = TransferTask::new(
            "task_1_acct",
            DeliveryRequest::new("oss://CP1/", "acct", "pw"),
            PathBuf::from("/data/acct_1"),
        );

        let json = serde_json::to_string(&TaskResponse::from(task)).unwrap();
        assert!(!json.contains("error_message"));
    }
}
