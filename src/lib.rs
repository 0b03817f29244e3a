//! Storage-agnostic, in-process job scheduler
//!
//! Clients define named queues, each bound to a handler type that performs
//! one unit of work. Tasks are deferred with an optional earliest-run time,
//! latest-expiry time, and an opaque JSON payload; per-queue workers discover
//! due tasks from a pluggable task store and run them, applying timeout
//! enforcement, retry backoff, expiry, and permanent-failure policies.
//!
//! The crate ships three task stores (in-memory, delimited file, SQLite) and
//! three ways to drive the workers: single-stepped for tests, one worker task
//! per queue for embedding in a host process, and a detached daemon with a
//! pid file for standalone deployments.

use chrono::{DateTime, Utc};

pub mod clock;
pub mod executor;
pub mod handler;
pub mod queue;
pub mod record;
pub mod runtime;
pub mod scheduler;
pub mod store;
pub mod worker;

#[cfg(test)]
mod tests;

// Re-export the types that make up the client-facing surface.
pub use clock::{Clock, SystemClock};
pub use handler::{HandlerFactory, TaskContext, TaskHandler};
pub use queue::QueueDef;
pub use record::{FailureOutcome, TaskRecord};
pub use runtime::WorkPlan;
pub use scheduler::{Defer, Scheduler, SchedulerBuilder};
pub use store::{
    file::FileStore, memory::MemoryStore, sqlite::SqliteStore, NewTask, ReadFilter, TaskStore,
    TaskUpdate,
};

/// Result type alias used throughout the crate
pub type Result<T> = anyhow::Result<T>;

/// Error kinds the scheduler raises
///
/// Client-facing operations surface these to the caller; execution errors are
/// recorded on the task record instead and never escape a worker loop.
#[derive(Debug, thiserror::Error)]
pub enum SchedulingError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Malformed task: {0}")]
    MalformedTask(String),

    #[error("Unknown queue: {0}")]
    UnknownQueue(String),

    #[error("No task matches {0}")]
    NoMatch(String),

    #[error("{count} tasks match {filter}; the filter must select exactly one")]
    Ambiguous { filter: String, count: usize },

    #[error("run_at {run_at} falls after expire_at {expire_at}")]
    InvalidSchedule {
        run_at: DateTime<Utc>,
        expire_at: DateTime<Utc>,
    },

    #[error("No attempts remain")]
    AttemptsExhausted,

    #[error("Task expired at {0}")]
    TaskExpired(DateTime<Utc>),

    #[error("Task handler exceeded the {0:?} queue timeout")]
    Timeout(std::time::Duration),

    #[error("A process with pid {0} already owns the pid file")]
    ProcessExists(i32),
}
