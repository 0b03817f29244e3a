//! SQLite-backed task store
//!
//! One `tasks` table mirrors the record. Times are stored as ISO-8601 text,
//! id allocation runs inside the same transaction as the insert, and the
//! connection sits behind an async mutex so the store can be shared by every
//! worker in the process.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use tokio::sync::Mutex;

use super::{NewTask, ReadFilter, TaskStore, TaskUpdate};
use crate::record::TaskRecord;
use crate::Result;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).with_context(|| {
            format!("Failed to open task database {}", path.as_ref().display())
        })?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)
            .context("Failed to set database busy timeout")?;
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY,
                queue TEXT NOT NULL,

                -- Scheduling
                run_at TEXT,
                initial_run_at TEXT,
                expire_at TEXT,

                -- Attempt tracking
                attempts INTEGER NOT NULL DEFAULT 0,
                last_fail_at TEXT,
                last_error TEXT,

                -- Payload, in its serialized JSON form
                data TEXT
            )
            "#,
            [],
        )
        .context("Failed to create tasks table")?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_tasks_queue
             ON tasks(queue, run_at)",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

#[async_trait::async_trait]
impl TaskStore for SqliteStore {
    async fn read(&self, filter: &ReadFilter) -> Result<Vec<TaskRecord>> {
        let conn = self.conn.lock().await;

        let mut clauses: Vec<&str> = Vec::new();
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(id) = filter.id {
            clauses.push("id = ?");
            values.push(Box::new(id));
        }
        if let Some(queue) = &filter.queue {
            clauses.push("queue = ?");
            values.push(Box::new(queue.clone()));
        }
        if let Some(data) = &filter.data {
            clauses.push("data = ?");
            values.push(Box::new(data.clone()));
        }

        let mut sql = String::from(
            "SELECT id, queue, run_at, initial_run_at, expire_at,
                    attempts, last_fail_at, last_error, data
             FROM tasks",
        );
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY id ASC");

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), row_to_record)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to read task rows")
    }

    async fn create(&self, task: NewTask) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn
            .transaction()
            .context("Failed to start create transaction")?;
        let id: i64 = tx.query_row("SELECT COALESCE(MAX(id), 0) + 1 FROM tasks", [], |row| {
            row.get(0)
        })?;
        tx.execute(
            "INSERT INTO tasks (
                 id, queue, run_at, initial_run_at, expire_at,
                 attempts, last_fail_at, last_error, data
             ) VALUES (?1, ?2, ?3, ?4, ?5, 0, NULL, NULL, ?6)",
            params![
                id,
                task.queue,
                task.run_at,
                task.initial_run_at,
                task.expire_at,
                task.data
            ],
        )?;
        tx.commit().context("Failed to commit task create")
    }

    async fn update(&self, id: i64, changes: &TaskUpdate) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn
            .transaction()
            .context("Failed to start update transaction")?;
        let existing = tx
            .query_row(
                "SELECT id, queue, run_at, initial_run_at, expire_at,
                        attempts, last_fail_at, last_error, data
                 FROM tasks WHERE id = ?1",
                params![id],
                row_to_record,
            )
            .optional()?;

        if let Some(mut record) = existing {
            changes.apply(&mut record);
            tx.execute(
                "UPDATE tasks
                 SET queue = ?1, run_at = ?2, initial_run_at = ?3, expire_at = ?4,
                     attempts = ?5, last_fail_at = ?6, last_error = ?7, data = ?8
                 WHERE id = ?9",
                params![
                    record.queue,
                    record.run_at,
                    record.initial_run_at,
                    record.expire_at,
                    i64::from(record.attempts),
                    record.last_fail_at,
                    record.last_error,
                    record.data,
                    id
                ],
            )?;
        }
        tx.commit().context("Failed to commit task update")
    }

    async fn delete(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM tasks WHERE id = ?1", params![id])?;
        Ok(())
    }
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<TaskRecord> {
    Ok(TaskRecord {
        id: row.get(0)?,
        queue: row.get(1)?,
        run_at: row.get(2)?,
        initial_run_at: row.get(3)?,
        expire_at: row.get(4)?,
        attempts: row.get::<_, i64>(5)? as u32,
        last_fail_at: row.get(6)?,
        last_error: row.get(7)?,
        data: row.get(8)?,
    })
}
