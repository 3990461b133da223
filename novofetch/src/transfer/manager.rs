//! Transfer Manager implementation.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{Semaphore, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::pipeline::StageRunner;
use super::request::DeliveryRequest;
use super::store::TaskStore;
use super::task::{TaskStatus, TransferEvent, TransferTask};
use super::tool::TransferTool;
use crate::settings::Settings;
use crate::{Error, Result};

/// Broadcast capacity for task events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Execution-unit bookkeeping for a started task.
struct RunningTask {
    /// Cancelling this also kills the task's in-flight transfer process.
    cancel: CancellationToken,
    #[allow(dead_code)]
    handle: JoinHandle<()>,
}

/// The public-facing transfer coordinator.
///
/// Owns the task store and spawns one execution unit per started task.
/// Constructed once from settings by the process entry point and shared
/// behind an `Arc`; reconfiguring means constructing a new instance.
pub struct TransferManager {
    store: Arc<TaskStore>,
    tool: Arc<dyn TransferTool>,
    /// Root under which per-task directories are created.
    download_root: PathBuf,
    auto_validate: bool,
    /// Caps how many transfers run at the same time.
    slots: Arc<Semaphore>,
    /// Execution units of started, not-yet-removed tasks.
    running: DashMap<String, RunningTask>,
    events: broadcast::Sender<TransferEvent>,
}

impl TransferManager {
    /// Create a manager bound to a tool adapter and settings.
    pub fn new(tool: Arc<dyn TransferTool>, settings: &Settings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store: Arc::new(TaskStore::new()),
            tool,
            download_root: settings.download_root.clone(),
            auto_validate: settings.auto_validate,
            slots: Arc::new(Semaphore::new(settings.max_concurrent_tasks.max(1))),
            running: DashMap::new(),
            events,
        }
    }

    /// Subscribe to status/progress events for all tasks.
    ///
    /// Delivery is lossy for subscribers that fall behind; a slow
    /// subscriber never blocks a running task.
    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.events.subscribe()
    }

    /// Snapshot of one task.
    pub fn get(&self, id: &str) -> Option<TransferTask> {
        self.store.get(id)
    }

    /// Snapshot of all tasks.
    pub fn list(&self) -> Vec<TransferTask> {
        self.store.list()
    }

    /// Register a new Pending task with its own download directory.
    pub fn create_task(&self, request: DeliveryRequest) -> Result<TransferTask> {
        request.validate()?;

        let target_dir = self.allocate_task_dir(&request.account)?;
        let task = self.store.create(request, target_dir);
        let _ = self.store.update(&task.id, |t| {
            t.append_log(&format!("Task created: {}", t.id));
        });

        info!(task_id = %task.id, dir = %task.target_dir.display(), "Task created");
        Ok(self.store.get(&task.id).unwrap_or(task))
    }

    /// Start a Pending task's execution unit. Returns immediately.
    ///
    /// A missing tool binary is detected here, before anything is spawned:
    /// the task is marked Failed with a descriptive error.
    pub fn start_task(&self, id: &str) -> Result<()> {
        let task = self
            .store
            .get(id)
            .ok_or_else(|| Error::not_found("task", id))?;
        if task.status != TaskStatus::Pending {
            return Err(Error::invalid_state(id, task.status.as_str()));
        }

        if !self.tool.is_available() {
            let message = "transfer tool is not available; check the configured path".to_string();
            let _ = self.store.update(id, |t| {
                t.status = TaskStatus::Failed;
                t.error_message = message.clone();
                t.finished_at = Some(Utc::now());
                t.append_log(&format!("Task failed: {}", message));
            });
            self.notify_status(id, TaskStatus::Failed);
            warn!(task_id = %id, "Refusing to start task: tool unavailable");
            return Err(Error::config(message));
        }

        let cancel = CancellationToken::new();
        let runner = StageRunner {
            store: self.store.clone(),
            tool: self.tool.clone(),
            events: self.events.clone(),
            cancel: cancel.clone(),
            auto_validate: self.auto_validate,
            task_id: id.to_string(),
        };

        let slots = self.slots.clone();
        let store = self.store.clone();
        let task_id = id.to_string();
        let handle = tokio::spawn(async move {
            if slots.available_permits() == 0 {
                let _ = store.update(&task_id, |t| {
                    t.append_log("Waiting for a free transfer slot");
                });
            }
            let Ok(_permit) = slots.acquire_owned().await else {
                // Semaphore closed: the process is shutting down.
                return;
            };

            // The task may have been cancelled while queued.
            match store.get(&task_id) {
                Some(t) if t.status == TaskStatus::Pending => {}
                _ => {
                    debug!(task_id = %task_id, "Task no longer pending, not running pipeline");
                    return;
                }
            }

            runner.run().await;
        });

        self.running.insert(
            id.to_string(),
            RunningTask {
                cancel,
                handle,
            },
        );

        info!(task_id = %id, "Task started");
        Ok(())
    }

    /// Cancel a non-terminal task.
    ///
    /// Flips the status immediately; if a transfer process is in flight,
    /// its cancellation token kills it.
    pub fn cancel_task(&self, id: &str) -> Result<()> {
        let task = self
            .store
            .get(id)
            .ok_or_else(|| Error::not_found("task", id))?;
        if task.status.is_terminal() {
            return Err(Error::invalid_state(id, task.status.as_str()));
        }

        let _ = self.store.update(id, |t| {
            t.status = TaskStatus::Cancelled;
            t.current_step = "Cancelled".to_string();
            t.finished_at = Some(Utc::now());
            t.append_log("Task cancelled");
        });
        self.notify_status(id, TaskStatus::Cancelled);

        if let Some(running) = self.running.get(id) {
            running.cancel.cancel();
        }

        info!(task_id = %id, "Task cancelled");
        Ok(())
    }

    /// Remove a terminal task and release its execution-unit handle.
    pub fn remove_task(&self, id: &str) -> Result<()> {
        self.store.remove(id)?;
        self.running.remove(id);
        info!(task_id = %id, "Task removed");
        Ok(())
    }

    /// Cancel every non-terminal task, e.g. on process shutdown.
    pub fn shutdown(&self) {
        for task in self.store.list() {
            if !task.status.is_terminal()
                && let Err(e) = self.cancel_task(&task.id)
            {
                debug!(task_id = %task.id, error = %e, "Shutdown cancel skipped");
            }
        }
    }

    /// Derive a fresh task directory from the account and the current time.
    fn allocate_task_dir(&self, account: &str) -> Result<PathBuf> {
        let base = format!("{}_{}", account, Utc::now().timestamp_millis());
        let mut dir = self.download_root.join(&base);
        let mut bump = 0u32;
        while dir.exists() {
            bump += 1;
            dir = self.download_root.join(format!("{}_{}", base, bump));
        }
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    fn notify_status(&self, id: &str, status: TaskStatus) {
        let _ = self.events.send(TransferEvent::StatusChanged {
            task_id: id.to_string(),
            status,
        });
    }
}
