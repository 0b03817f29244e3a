//! Queue definitions and the task-selection read side
//!
//! A queue binds a name, a handler factory, an execution policy, and a task
//! store. Definitions are declared on the scheduler builder and validated
//! once; the built [`Queue`] is immutable afterwards and shared by the
//! worker, the executor, and the client API.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde_json::Value;
use tracing::debug;

use crate::clock::Clock;
use crate::handler::HandlerFactory;
use crate::record::TaskRecord;
use crate::store::{NewTask, ReadFilter, TaskStore};
use crate::{Result, SchedulingError};

/// Default handler timeout: one hour.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3600);
/// Default cap on attempts before a task finally fails.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 20;
/// Default pause between store polls.
pub const DEFAULT_POLL_PERIOD: Duration = Duration::from_secs(10);

/// Declaration of a queue, consumed by the scheduler builder.
pub struct QueueDef {
    name: String,
    factory: Arc<dyn HandlerFactory>,
    timeout: Option<Duration>,
    max_attempts: Option<Option<u32>>,
    poll_period: Option<Duration>,
    store: Option<Arc<dyn TaskStore>>,
}

impl QueueDef {
    pub fn new(name: &str, factory: impl HandlerFactory + 'static) -> Self {
        Self {
            name: name.to_string(),
            factory: Arc::new(factory),
            timeout: None,
            max_attempts: None,
            poll_period: None,
            store: None,
        }
    }

    /// Upper bound on one handler run; elapse records a timeout failure.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Attempts before the task finally fails. Must be at least 1.
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(Some(max_attempts));
        self
    }

    /// Retry forever (until the task expires or is cancelled).
    pub fn unbounded_attempts(mut self) -> Self {
        self.max_attempts = Some(None);
        self
    }

    pub fn poll_period(mut self, poll_period: Duration) -> Self {
        self.poll_period = Some(poll_period);
        self
    }

    /// Store for this queue alone; queues without one use the scheduler's
    /// default store.
    pub fn store(mut self, store: impl TaskStore + 'static) -> Self {
        self.store = Some(Arc::new(store));
        self
    }
}

/// Trims the raw name and collapses every run of non-alphanumeric
/// characters into a single underscore.
pub(crate) fn normalize_name(raw: &str) -> String {
    let mut name = String::with_capacity(raw.len());
    for c in raw.trim().chars() {
        if c.is_alphanumeric() {
            name.push(c);
        } else if !name.ends_with('_') {
            name.push('_');
        }
    }
    name
}

/// A validated queue, immutable after construction.
pub struct Queue {
    name: String,
    factory: Arc<dyn HandlerFactory>,
    timeout: Duration,
    max_attempts: Option<u32>,
    poll_period: Duration,
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
}

impl Queue {
    pub(crate) fn build(
        def: QueueDef,
        default_store: Option<Arc<dyn TaskStore>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let name = normalize_name(&def.name);
        if name.is_empty() {
            return Err(SchedulingError::Config(format!(
                "Queue name '{}' normalizes to nothing",
                def.name
            ))
            .into());
        }
        let max_attempts = def.max_attempts.unwrap_or(Some(DEFAULT_MAX_ATTEMPTS));
        if max_attempts == Some(0) {
            return Err(SchedulingError::Config(format!(
                "Queue '{name}' max_attempts must be at least 1"
            ))
            .into());
        }
        let store = def.store.or(default_store).ok_or_else(|| {
            SchedulingError::Config(format!(
                "Queue '{name}' has no store and no default store is configured"
            ))
        })?;

        Ok(Self {
            name,
            factory: def.factory,
            timeout: def.timeout.unwrap_or(DEFAULT_TIMEOUT),
            max_attempts,
            poll_period: def.poll_period.unwrap_or(DEFAULT_POLL_PERIOD),
            store,
            clock,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    pub fn poll_period(&self) -> Duration {
        self.poll_period
    }

    pub(crate) fn factory(&self) -> &dyn HandlerFactory {
        self.factory.as_ref()
    }

    pub(crate) fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// The next runnable task: minimum `run_at` first, ties broken
    /// arbitrarily. Returns `None` when nothing is due.
    pub(crate) async fn next_task(&self) -> Result<Option<TaskRecord>> {
        let now = self.clock.now();
        let mut due: Vec<TaskRecord> = self
            .store
            .read(&ReadFilter::by_queue(&self.name))
            .await?
            .into_iter()
            .filter(|record| record.runnable(now))
            .collect();

        // Shuffling first keeps the stable sort at its average cost even
        // when the store hands records back pre-sorted.
        due.shuffle(&mut rand::rng());
        due.sort_by_key(|record| record.run_at);

        if due.is_empty() {
            debug!(queue = %self.name, "No runnable tasks");
        }
        Ok(due.into_iter().next())
    }

    /// Exactly one record matching `filter` within this queue, or
    /// `NoMatch`/`Ambiguous`.
    pub(crate) async fn fetch_task(&self, filter: &ReadFilter) -> Result<TaskRecord> {
        let mut filter = filter.clone();
        filter.queue = Some(self.name.clone());

        let mut matches = self.store.read(&filter).await?;
        match matches.len() {
            0 => Err(SchedulingError::NoMatch(filter.to_string()).into()),
            1 => Ok(matches.remove(0)),
            count => Err(SchedulingError::Ambiguous {
                filter: filter.to_string(),
                count,
            }
            .into()),
        }
    }

    /// Validates and persists a new task for this queue.
    pub(crate) async fn create(
        &self,
        run_at: DateTime<Utc>,
        expire_at: Option<DateTime<Utc>>,
        data: Option<&Value>,
    ) -> Result<()> {
        match (self.factory.needs_data(), data) {
            (true, None) => {
                return Err(SchedulingError::MalformedTask(format!(
                    "Queue '{}' handlers declare data; deferring without it is an error",
                    self.name
                ))
                .into());
            }
            (false, Some(_)) => {
                return Err(SchedulingError::MalformedTask(format!(
                    "Queue '{}' handlers do not declare data; remove the payload",
                    self.name
                ))
                .into());
            }
            _ => {}
        }
        if let Some(expire_at) = expire_at {
            if run_at > expire_at {
                return Err(SchedulingError::InvalidSchedule { run_at, expire_at }.into());
            }
        }

        let data = data.map(serde_json::to_string).transpose()?;
        self.store
            .create(NewTask {
                queue: self.name.clone(),
                run_at: Some(run_at),
                initial_run_at: Some(run_at),
                expire_at,
                data,
            })
            .await
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("max_attempts", &self.max_attempts)
            .field("poll_period", &self.poll_period)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}
