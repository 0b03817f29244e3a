//! Delimited-file task store
//!
//! One comma-separated text file holds every record: a quoted header line in
//! the fixed column order, then one quoted row per task. Times are ISO-8601,
//! an empty field encodes null, embedded quotes use the doubled-quote
//! convention, and the payload column is written verbatim (the upper layer
//! hands it over as a JSON string).
//!
//! Every operation, reads included, runs inside a file transaction that
//! holds two locks at once: an in-process mutex shared by every store
//! instance pointing at the same path, and an exclusive OS advisory lock on
//! the open descriptor. Advisory locks are only honored cooperatively on
//! some systems and do nothing for threads within one process, so both
//! halves are required.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};

use anyhow::Context;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{NewTask, ReadFilter, TaskStore, TaskUpdate};
use crate::record::TaskRecord;
use crate::Result;

/// File name used when the store is pointed at a directory.
pub const DEFAULT_FILE_NAME: &str = "tasks.csv";

/// On-disk column order. This is the format contract: reordering columns is
/// a format version change.
const COLUMNS: [&str; 9] = [
    "id",
    "queue",
    "run_at",
    "initial_run_at",
    "expire_at",
    "attempts",
    "last_fail_at",
    "last_error",
    "data",
];

/// Process-wide table of per-path locks. Every store instance targeting the
/// same file must serialize through the same mutex, so the table is keyed by
/// the absolutized path and lives for the lifetime of the process. This is
/// the only module-level state in the crate.
static PATH_LOCKS: OnceLock<StdMutex<HashMap<PathBuf, Arc<Mutex<()>>>>> = OnceLock::new();

fn path_lock(path: &Path) -> Arc<Mutex<()>> {
    let table = PATH_LOCKS.get_or_init(|| StdMutex::new(HashMap::new()));
    let mut table = table.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    table.entry(path.to_path_buf()).or_default().clone()
}

/// Task store backed by a single delimited text file.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    /// Creates a store targeting `path`. An existing directory (or a path
    /// with a trailing separator) gets the default file name appended; a
    /// path without an extension gets `.csv` appended. The store is
    /// immutable after construction; the file itself is created lazily on
    /// first use.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: resolve_store_path(path.as_ref()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs `transform` inside the file transaction: in-process lock, open
    /// (creating the file and its parents on demand), OS advisory lock,
    /// read, transform, and for writes rewind-write-truncate. Both locks are
    /// released on every exit path.
    async fn transact<T>(
        &self,
        write: bool,
        transform: impl FnOnce(&str) -> Result<(T, Option<String>)>,
    ) -> Result<T> {
        let lock = path_lock(&self.path);
        let _guard = lock.lock().await;

        let mut file = self
            .open(write)
            .with_context(|| format!("Failed to open store file {}", self.path.display()))?;
        fs2::FileExt::lock_exclusive(&file)
            .with_context(|| format!("Failed to lock store file {}", self.path.display()))?;

        let outcome = run_locked(&mut file, transform);
        let _ = fs2::FileExt::unlock(&file);
        outcome.with_context(|| format!("Store file transaction failed on {}", self.path.display()))
    }

    fn open(&self, write: bool) -> io::Result<File> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        if write {
            return OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&self.path);
        }
        match File::open(&self.path) {
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                OpenOptions::new()
                    .write(true)
                    .create(true)
                    .open(&self.path)?;
                File::open(&self.path)
            }
            other => other,
        }
    }
}

fn run_locked<T>(
    file: &mut File,
    transform: impl FnOnce(&str) -> Result<(T, Option<String>)>,
) -> Result<T> {
    let mut content = String::new();
    file.read_to_string(&mut content)?;

    let (value, new_content) = transform(&content)?;

    if let Some(new_content) = new_content {
        file.seek(SeekFrom::Start(0))?;
        file.write_all(new_content.as_bytes())?;
        file.set_len(new_content.len() as u64)?;
    }
    Ok(value)
}

#[async_trait::async_trait]
impl TaskStore for FileStore {
    async fn read(&self, filter: &ReadFilter) -> Result<Vec<TaskRecord>> {
        self.transact(false, |content| {
            let records = parse_records(content)?;
            Ok((
                records
                    .into_iter()
                    .filter(|record| filter.matches(record))
                    .collect(),
                None,
            ))
        })
        .await
    }

    async fn create(&self, task: NewTask) -> Result<()> {
        self.transact(true, move |content| {
            let mut records = parse_records(content)?;
            let id = records.iter().map(|record| record.id).max().unwrap_or(0) + 1;
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
            Ok(((), Some(encode_records(&records))))
        })
        .await
    }

    async fn update(&self, id: i64, changes: &TaskUpdate) -> Result<()> {
        self.transact(true, |content| {
            let mut records = parse_records(content)?;
            match records.iter_mut().find(|record| record.id == id) {
                Some(record) => {
                    changes.apply(record);
                    Ok(((), Some(encode_records(&records))))
                }
                None => Ok(((), None)),
            }
        })
        .await
    }

    async fn delete(&self, id: i64) -> Result<()> {
        self.transact(true, |content| {
            let mut records = parse_records(content)?;
            records.retain(|record| record.id != id);
            Ok(((), Some(encode_records(&records))))
        })
        .await
    }
}

fn resolve_store_path(path: &Path) -> PathBuf {
    let trailing_separator = path
        .as_os_str()
        .to_string_lossy()
        .ends_with(std::path::MAIN_SEPARATOR);
    let mut resolved = if path.is_dir() || trailing_separator {
        path.join(DEFAULT_FILE_NAME)
    } else {
        path.to_path_buf()
    };
    if resolved.extension().is_none() {
        resolved.set_extension("csv");
    }
    if resolved.is_absolute() {
        resolved
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(&resolved))
            .unwrap_or(resolved)
    }
}

// ---------------------------------------------------------------------------
// On-disk codec

fn encode_records(records: &[TaskRecord]) -> String {
    let mut out = String::new();
    push_row(&mut out, COLUMNS.iter().map(|column| column.to_string()));
    for record in records {
        push_row(
            &mut out,
            [
                record.id.to_string(),
                record.queue.clone(),
                encode_time(record.run_at),
                encode_time(record.initial_run_at),
                encode_time(record.expire_at),
                record.attempts.to_string(),
                encode_time(record.last_fail_at),
                record.last_error.clone().unwrap_or_default(),
                record.data.clone().unwrap_or_default(),
            ]
            .into_iter(),
        );
    }
    out
}

/// Every field is quoted on write; embedded quotes are doubled.
fn push_row(out: &mut String, fields: impl Iterator<Item = String>) {
    let mut first = true;
    for field in fields {
        if !first {
            out.push(',');
        }
        first = false;
        out.push('"');
        out.push_str(&field.replace('"', "\"\""));
        out.push('"');
    }
    out.push('\n');
}

fn encode_time(time: Option<DateTime<Utc>>) -> String {
    time.map(|time| time.to_rfc3339()).unwrap_or_default()
}

fn parse_time(field: &str) -> Result<Option<DateTime<Utc>>> {
    if field.is_empty() {
        return Ok(None);
    }
    let parsed = DateTime::parse_from_rfc3339(field)
        .with_context(|| format!("Invalid timestamp field '{field}'"))?;
    Ok(Some(parsed.with_timezone(&Utc)))
}

/// A blank file yields no records; the first row is the header and is
/// skipped. Blank lines anywhere are ignored.
fn parse_records(content: &str) -> Result<Vec<TaskRecord>> {
    let rows = split_rows(content)?;
    rows.into_iter()
        .skip(1)
        .enumerate()
        .map(|(index, row)| {
            record_from_row(&row).with_context(|| format!("Corrupt store row {}", index + 1))
        })
        .collect()
}

fn record_from_row(row: &[String]) -> Result<TaskRecord> {
    if row.len() != COLUMNS.len() {
        anyhow::bail!("Expected {} fields, found {}", COLUMNS.len(), row.len());
    }
    Ok(TaskRecord {
        id: row[0]
            .parse()
            .with_context(|| format!("Invalid id field '{}'", row[0]))?,
        queue: row[1].clone(),
        run_at: parse_time(&row[2])?,
        initial_run_at: parse_time(&row[3])?,
        expire_at: parse_time(&row[4])?,
        attempts: row[5]
            .parse()
            .with_context(|| format!("Invalid attempts field '{}'", row[5]))?,
        last_fail_at: parse_time(&row[6])?,
        last_error: (!row[7].is_empty()).then(|| row[7].clone()),
        data: (!row[8].is_empty()).then(|| row[8].clone()),
    })
}

/// Character-level row scanner. Quoted fields may embed commas, doubled
/// quotes, and newlines (stack traces in the error column require all
/// three), so a line-based split is not enough.
fn split_rows(content: &str) -> Result<Vec<Vec<String>>> {
    let mut rows = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    // True once the current line saw any field content or separator, so
    // blank lines can be told apart from a row with one empty field.
    let mut line_started = false;
    let mut chars = content.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    field.push('"');
                } else {
                    in_quotes = false;
                }
            } else {
                field.push(c);
            }
            continue;
        }
        match c {
            '"' => {
                in_quotes = true;
                line_started = true;
            }
            ',' => {
                row.push(std::mem::take(&mut field));
                line_started = true;
            }
            '\r' => {}
            '\n' => {
                if line_started {
                    row.push(std::mem::take(&mut field));
                    rows.push(std::mem::take(&mut row));
                }
                line_started = false;
            }
            _ => {
                field.push(c);
                line_started = true;
            }
        }
    }
    if in_quotes {
        anyhow::bail!("Unterminated quoted field");
    }
    if line_started {
        row.push(field);
        rows.push(row);
    }
    Ok(rows)
}
