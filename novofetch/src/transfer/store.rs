//! The authoritative, concurrently-accessed collection of transfer tasks.

use std::path::PathBuf;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::request::DeliveryRequest;
use super::task::TransferTask;
use crate::{Error, Result};

/// Synchronized store of all [`TransferTask`] records, keyed by task id.
///
/// Reads return cloned snapshots and are safe from any thread while a task
/// is running; every mutation goes through [`TaskStore::update`], which
/// runs under the record's map-entry lock so readers never observe a
/// partially-written record.
pub struct TaskStore {
    tasks: DashMap<String, TransferTask>,
    /// Last id timestamp handed out, to keep ids strictly monotonic.
    last_id_millis: Mutex<i64>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self {
            tasks: DashMap::new(),
            last_id_millis: Mutex::new(0),
        }
    }

    /// Allocate an id and insert a fresh Pending record.
    ///
    /// Returns a snapshot of the inserted record.
    pub fn create(&self, request: DeliveryRequest, target_dir: PathBuf) -> TransferTask {
        let id = self.allocate_id(&request.account);
        let task = TransferTask::new(id.clone(), request, target_dir);
        self.tasks.insert(id, task.clone());
        task
    }

    /// Derive a unique id from the current time and the account name.
    ///
    /// The millisecond component is bumped past the last one handed out,
    /// so two tasks created in the same instant never collide.
    fn allocate_id(&self, account: &str) -> String {
        let mut last = self.last_id_millis.lock();
        let mut millis = Utc::now().timestamp_millis();
        if millis <= *last {
            millis = *last + 1;
        }
        *last = millis;
        format!("task_{}_{}", millis, account)
    }

    /// Snapshot of one record.
    pub fn get(&self, id: &str) -> Option<TransferTask> {
        self.tasks.get(id).map(|entry| entry.value().clone())
    }

    /// Snapshot of all records, ordered by id (creation order).
    pub fn list(&self) -> Vec<TransferTask> {
        let mut tasks: Vec<TransferTask> =
            self.tasks.iter().map(|entry| entry.value().clone()).collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        tasks
    }

    /// Mutate one record under its entry lock.
    ///
    /// This is the only mutation path; execution units never hold a live
    /// reference into the map.
    pub fn update<F>(&self, id: &str, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut TransferTask),
    {
        let mut entry = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| Error::not_found("task", id))?;
        mutate(entry.value_mut());
        Ok(())
    }

    /// Remove a record; fails while the task is non-terminal.
    pub fn remove(&self, id: &str) -> Result<TransferTask> {
        // remove_if holds the entry lock across the status check, so a
        // concurrent status change cannot slip in between.
        match self
            .tasks
            .remove_if(id, |_, task| task.status.is_terminal())
        {
            Some((_, task)) => Ok(task),
            None => match self.get(id) {
                Some(task) => Err(Error::invalid_state(id, task.status.as_str())),
                None => Err(Error::not_found("task", id)),
            },
        }
    }
}

impl Default for TaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::task::TaskStatus;

    fn request() -> DeliveryRequest {
        DeliveryRequest::new("oss://CP1/X1-Z01/", "X1-Z01-J1", "pw")
    }

    #[test]
    fn test_create_inserts_pending_record() {
        let store = TaskStore::new();
        let task = store.create(request(), PathBuf::from("/tmp/t"));

        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.id.starts_with("task_"));
        assert!(task.id.ends_with("X1-Z01-J1"));
        assert!(store.get(&task.id).is_some());
    }

    #[test]
    fn test_ids_are_unique_for_same_account() {
        let store = TaskStore::new();
        let a = store.create(request(), PathBuf::from("/tmp/a"));
        let b = store.create(request(), PathBuf::from("/tmp/b"));
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_get_returns_snapshot_not_live_reference() {
        let store = TaskStore::new();
        let task = store.create(request(), PathBuf::from("/tmp/t"));

        let mut snapshot = store.get(&task.id).unwrap();
        snapshot.progress = 99.0;

        assert_eq!(store.get(&task.id).unwrap().progress, 0.0);
    }

    #[test]
    fn test_update_unknown_id_fails() {
        let store = TaskStore::new();
        let result = store.update("task_0_nobody", |task| task.progress = 1.0);
        assert!(matches!(result, Err(Error::NotFound { .. })));
    }

    #[test]
    fn test_update_is_visible_to_readers() {
        let store = TaskStore::new();
        let task = store.create(request(), PathBuf::from("/tmp/t"));

        store
            .update(&task.id, |t| {
                t.status = TaskStatus::Downloading;
                t.raise_progress(42.0);
            })
            .unwrap();

        let seen = store.get(&task.id).unwrap();
        assert_eq!(seen.status, TaskStatus::Downloading);
        assert_eq!(seen.progress, 42.0);
    }

    #[test]
    fn test_remove_non_terminal_fails_and_keeps_record() {
        let store = TaskStore::new();
        let task = store.create(request(), PathBuf::from("/tmp/t"));

        assert!(matches!(
            store.remove(&task.id),
            Err(Error::InvalidState { .. })
        ));
        assert!(store.get(&task.id).is_some());

        store
            .update(&task.id, |t| t.status = TaskStatus::Downloading)
            .unwrap();
        assert!(store.remove(&task.id).is_err());
        assert_eq!(store.list().len(), 1);
    }

    #[test]
    fn test_remove_terminal_succeeds() {
        let store = TaskStore::new();
        let task = store.create(request(), PathBuf::from("/tmp/t"));
        store
            .update(&task.id, |t| t.status = TaskStatus::Completed)
            .unwrap();

        assert!(store.remove(&task.id).is_ok());
        assert!(store.get(&task.id).is_none());
    }

    #[test]
    fn test_list_orders_by_creation() {
        let store = TaskStore::new();
        let a = store.create(request(), PathBuf::from("/tmp/a"));
        let b = store.create(request(), PathBuf::from("/tmp/b"));

        let listed = store.list();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, a.id);
        assert_eq!(listed[1].id, b.id);
    }
}
