//! Task records with a status index.
//!
//! A record lives at `task/<id>`; `task-status/<status>/<id>` marks its
//! current status so listing by status never scans every record.

use std::sync::Arc;

use chrono::Utc;

use super::{KvStore, StoreError, blocking, format};
use crate::schema::{SessionStatus, TaskRecord};

pub const TASK_PREFIX: &str = "task/";
const STATUS_PREFIX: &str = "task-status/";

/// Injected replacement for a process-wide task map.
#[derive(Clone)]
pub struct TaskRegistry {
    store: Arc<dyn KvStore>,
    compress: bool,
}

impl TaskRegistry {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            compress: false,
        }
    }

    /// LZ4-compress records written from now on. Reads accept either form.
    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    fn record_key(task_id: &str) -> String {
        format!("{}{}", TASK_PREFIX, task_id)
    }

    fn index_key(status: SessionStatus, task_id: &str) -> String {
        format!("{}{}/{}", STATUS_PREFIX, status, task_id)
    }

    /// Replace the whole record and move its status index entry.
    pub fn put(&self, record: &TaskRecord) -> Result<(), StoreError> {
        let previous = self.get(&record.task_id)?;

        let mut record = record.clone();
        record.updated_at = Utc::now();
        let bytes = format::encode(&record, self.compress)?;
        self.store.put(&Self::record_key(&record.task_id), &bytes)?;
        self.store
            .put(&Self::index_key(record.status, &record.task_id), &[])?;

        if let Some(prev) = previous
            && prev.status != record.status
        {
            self.store
                .delete(&Self::index_key(prev.status, &record.task_id))?;
        }
        Ok(())
    }

    /// [`put`](Self::put) on the blocking pool, for callers on async workers.
    pub async fn put_async(&self, record: TaskRecord) -> Result<(), StoreError> {
        let registry = self.clone();
        blocking(move || registry.put(&record)).await
    }

    pub fn get(&self, task_id: &str) -> Result<Option<TaskRecord>, StoreError> {
        match self.store.get(&Self::record_key(task_id))? {
            Some(bytes) => Ok(Some(format::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Like [`get`](Self::get) but a missing record is an error.
    pub fn require(&self, task_id: &str) -> Result<TaskRecord, StoreError> {
        self.get(task_id)?
            .ok_or_else(|| StoreError::NotFound(task_id.to_string()))
    }

    pub fn list_by_status(&self, status: SessionStatus) -> Result<Vec<TaskRecord>, StoreError> {
        let prefix = format!("{}{}/", STATUS_PREFIX, status);
        let mut records = Vec::new();
        for key in self.store.list_by_prefix(&prefix)? {
            let Some(task_id) = key.strip_prefix(&prefix) else {
                continue;
            };
            // Index entries can briefly outlive a deleted record.
            if let Some(record) = self.get(task_id)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    pub fn list_all(&self) -> Result<Vec<TaskRecord>, StoreError> {
        let mut records = Vec::new();
        for key in self.store.list_by_prefix(TASK_PREFIX)? {
            if let Some(task_id) = key.strip_prefix(TASK_PREFIX)
                && let Some(record) = self.get(task_id)?
            {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Remove a record and its index entry. Returns whether it existed.
    pub fn delete(&self, task_id: &str) -> Result<bool, StoreError> {
        let Some(record) = self.get(task_id)? else {
            return Ok(false);
        };
        self.store.delete(&Self::record_key(task_id))?;
        self.store
            .delete(&Self::index_key(record.status, task_id))?;
        Ok(true)
    }
}
