//! In-memory task store
//!
//! Reference implementation of the store contract: a mutex-guarded vector of
//! records. Nothing survives the process, which makes it the natural store
//! for tests and for embedders that treat deferred work as best-effort.

use tokio::sync::Mutex;
use tracing::debug;

use super::{NewTask, ReadFilter, TaskStore, TaskUpdate};
use crate::record::TaskRecord;
use crate::Result;

#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<Vec<TaskRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl TaskStore for MemoryStore {
    async fn read(&self, filter: &ReadFilter) -> Result<Vec<TaskRecord>> {
        let records = self.records.lock().await;
        Ok(records
            .iter()
            .filter(|record| filter.matches(record))
            .cloned()
            .collect())
    }

    async fn create(&self, task: NewTask) -> Result<()> {
        let mut records = self.records.lock().await;
        let id = records.iter().map(|record| record.id).max().unwrap_or(0) + 1;
        debug!(queue = %task.queue, id, "Created task");
        records.push(TaskRecord {
            id,
            queue: task.queue,
            run_at: task.run_at,
            initial_run_at: task.initial_run_at,
            expire_at: task.expire_at,
            attempts: 0,
            last_fail_at: None,
            last_error: None,
            data: task.data,
        });
        Ok(())
    }

    async fn update(&self, id: i64, changes: &TaskUpdate) -> Result<()> {
        let mut records = self.records.lock().await;
        if let Some(record) = records.iter_mut().find(|record| record.id == id) {
            changes.apply(record);
        }
        Ok(())
    }

    async fn delete(&self, id: i64) -> Result<()> {
        let mut records = self.records.lock().await;
        records.retain(|record| record.id != id);
        Ok(())
    }
}
