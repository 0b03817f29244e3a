//! Task persistence contract and the bundled stores
//!
//! Any object implementing [`TaskStore`] can back a queue. The crate bundles
//! three: an in-memory store, a delimited-file store, and a SQLite store.
//! Stores must be safe under concurrent read/create/update/delete from many
//! workers; each bundled store documents how it achieves that.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::record::TaskRecord;
use crate::Result;

pub mod file;
pub mod memory;
pub mod sqlite;

/// Field values for a new record. The store assigns the id: the next integer
/// above the highest existing one, starting at 1.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub queue: String,
    pub run_at: Option<DateTime<Utc>>,
    pub initial_run_at: Option<DateTime<Utc>>,
    pub expire_at: Option<DateTime<Utc>>,
    /// Payload in its serialized JSON string form.
    pub data: Option<String>,
}

/// Exact-match filter for [`TaskStore::read`]. Every populated field must
/// match the stored value; an empty filter matches everything. `data` is
/// compared in its stored string form, so callers serialize before filtering.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadFilter {
    pub id: Option<i64>,
    pub queue: Option<String>,
    pub data: Option<String>,
}

impl ReadFilter {
    /// Matches every record in the store.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn by_id(id: i64) -> Self {
        Self {
            id: Some(id),
            ..Self::default()
        }
    }

    pub fn by_queue(queue: &str) -> Self {
        Self {
            queue: Some(queue.to_string()),
            ..Self::default()
        }
    }

    /// Filter on the payload. `value` is serialized to the stored JSON string
    /// form before comparison.
    pub fn by_data<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self {
            data: Some(serde_json::to_string(value)?),
            ..Self::default()
        })
    }

    pub fn matches(&self, record: &TaskRecord) -> bool {
        self.id.map_or(true, |id| record.id == id)
            && self
                .queue
                .as_ref()
                .map_or(true, |queue| record.queue == *queue)
            && self.data.as_ref().map_or(true, |data| {
                record.data.as_ref().is_some_and(|stored| stored == data)
            })
    }
}

impl fmt::Display for ReadFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut wrote = false;
        if let Some(id) = self.id {
            write!(f, "id={id}")?;
            wrote = true;
        }
        if let Some(queue) = &self.queue {
            write!(f, "{}queue={queue}", if wrote { " " } else { "" })?;
            wrote = true;
        }
        if let Some(data) = &self.data {
            write!(f, "{}data={data}", if wrote { " " } else { "" })?;
            wrote = true;
        }
        if !wrote {
            write!(f, "(all tasks)")?;
        }
        Ok(())
    }
}

/// Partial update merged into the record with a given id. An outer `None`
/// leaves the column untouched; `Some(None)` clears a nullable column.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub run_at: Option<Option<DateTime<Utc>>>,
    pub initial_run_at: Option<Option<DateTime<Utc>>>,
    pub expire_at: Option<Option<DateTime<Utc>>>,
    pub attempts: Option<u32>,
    pub last_fail_at: Option<Option<DateTime<Utc>>>,
    pub last_error: Option<Option<String>>,
    pub data: Option<Option<String>>,
}

impl TaskUpdate {
    /// Snapshot of every mutable column, for writing a mutated record back
    /// whole.
    pub fn from_record(record: &TaskRecord) -> Self {
        Self {
            run_at: Some(record.run_at),
            initial_run_at: Some(record.initial_run_at),
            expire_at: Some(record.expire_at),
            attempts: Some(record.attempts),
            last_fail_at: Some(record.last_fail_at),
            last_error: Some(record.last_error.clone()),
            data: Some(record.data.clone()),
        }
    }

    pub fn apply(&self, record: &mut TaskRecord) {
        if let Some(run_at) = self.run_at {
            record.run_at = run_at;
        }
        if let Some(initial_run_at) = self.initial_run_at {
            record.initial_run_at = initial_run_at;
        }
        if let Some(expire_at) = self.expire_at {
            record.expire_at = expire_at;
        }
        if let Some(attempts) = self.attempts {
            record.attempts = attempts;
        }
        if let Some(last_fail_at) = self.last_fail_at {
            record.last_fail_at = last_fail_at;
        }
        if let Some(last_error) = &self.last_error {
            record.last_error = last_error.clone();
        }
        if let Some(data) = &self.data {
            record.data = data.clone();
        }
    }
}

/// Persistence contract a queue's store must satisfy. All four operations
/// must be safely callable from multiple workers at once.
#[async_trait]
pub trait TaskStore: fmt::Debug + Send + Sync {
    /// Records whose fields match every populated filter field exactly.
    async fn read(&self, filter: &ReadFilter) -> Result<Vec<TaskRecord>>;

    /// Persists a new record under the next free id.
    async fn create(&self, task: NewTask) -> Result<()>;

    /// Merges `changes` into the record with `id`; no-op when absent.
    async fn update(&self, id: i64, changes: &TaskUpdate) -> Result<()>;

    /// Removes the record with `id`; no-op when absent.
    async fn delete(&self, id: i64) -> Result<()>;
}

// A shared handle to a store is itself a store, so callers can keep a handle
// for inspection while the scheduler owns another.
#[async_trait]
impl<S: TaskStore + ?Sized> TaskStore for Arc<S> {
    async fn read(&self, filter: &ReadFilter) -> Result<Vec<TaskRecord>> {
        (**self).read(filter).await
    }

    async fn create(&self, task: NewTask) -> Result<()> {
        (**self).create(task).await
    }

    async fn update(&self, id: i64, changes: &TaskUpdate) -> Result<()> {
        (**self).update(id, changes).await
    }

    async fn delete(&self, id: i64) -> Result<()> {
        (**self).delete(id).await
    }
}
