//! Client-facing scheduler API
//!
//! The scheduler is built once from queue definitions, is immutable
//! afterwards, and clones cheaply: handlers receive a clone so deferred work
//! can schedule follow-on work. Operations: defer, reschedule, cancel, and
//! work (which hands back a [`WorkPlan`](crate::runtime::WorkPlan)).

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::clock::{Clock, SystemClock};
use crate::queue::{normalize_name, Queue, QueueDef};
use crate::runtime::WorkPlan;
use crate::store::{ReadFilter, TaskStore, TaskUpdate};
use crate::{Result, SchedulingError};

/// Options for one deferral. `run_at` defaults to now, `expire_at` to never.
#[derive(Debug, Clone, Default)]
pub struct Defer {
    run_at: Option<DateTime<Utc>>,
    expire_at: Option<DateTime<Utc>>,
    data: Option<Value>,
}

impl Defer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Earliest time the task may run.
    pub fn run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    /// Time after which the task must not run.
    pub fn expire_at(mut self, expire_at: DateTime<Utc>) -> Self {
        self.expire_at = Some(expire_at);
        self
    }

    /// Payload handed to the handler. Serialized once here; the stored form
    /// is the JSON string.
    pub fn data<T: Serialize>(mut self, value: &T) -> Result<Self> {
        self.data = Some(serde_json::to_value(value)?);
        Ok(self)
    }
}

struct SchedulerInner {
    queues: Vec<Arc<Queue>>,
    container: Option<Arc<dyn Any + Send + Sync>>,
    clock: Arc<dyn Clock>,
}

/// Cheap-to-clone façade over the immutable scheduler configuration.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::new()
    }

    /// Persists a new task. The queue name may be omitted only when exactly
    /// one queue is defined.
    pub async fn defer(&self, queue: Option<&str>, defer: Defer) -> Result<()> {
        let queue = self.queue(queue)?;
        let run_at = defer.run_at.unwrap_or_else(|| self.inner.clock.now());
        queue.create(run_at, defer.expire_at, defer.data.as_ref()).await
    }

    /// Starts a reschedule of the single task matching `filter`. Finish with
    /// [`RescheduleRequest::to`].
    pub fn reschedule(&self, queue: &str, filter: ReadFilter) -> RescheduleRequest {
        RescheduleRequest {
            scheduler: self.clone(),
            queue: queue.to_string(),
            filter,
        }
    }

    /// Removes the single task matching `filter`.
    pub async fn cancel(&self, queue: &str, filter: ReadFilter) -> Result<()> {
        let queue = self.queue(Some(queue))?;
        let record = queue.fetch_task(&filter).await?;
        queue.store().delete(record.id).await
    }

    /// A work plan over the named queues, or over all queues in declaration
    /// order when none are named.
    pub fn work(&self, queues: &[&str]) -> Result<WorkPlan> {
        let selected = if queues.is_empty() {
            self.inner.queues.clone()
        } else {
            queues
                .iter()
                .copied()
                .map(|name| self.queue(Some(name)).map(Arc::clone))
                .collect::<Result<Vec<_>>>()?
        };
        Ok(WorkPlan::new(self.clone(), selected))
    }

    pub fn queue_names(&self) -> Vec<&str> {
        self.inner.queues.iter().map(|queue| queue.name()).collect()
    }

    fn queue(&self, name: Option<&str>) -> Result<&Arc<Queue>> {
        match name {
            Some(raw) => {
                let name = normalize_name(raw);
                self.inner
                    .queues
                    .iter()
                    .find(|queue| queue.name() == name)
                    .ok_or_else(|| SchedulingError::UnknownQueue(name).into())
            }
            None if self.inner.queues.len() == 1 => Ok(&self.inner.queues[0]),
            None => Err(SchedulingError::UnknownQueue(
                "omitting the queue name requires exactly one queue".to_string(),
            )
            .into()),
        }
    }

    pub(crate) fn queues(&self) -> &[Arc<Queue>] {
        &self.inner.queues
    }

    pub(crate) fn container(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.inner.container.clone()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("queues", &self.queue_names())
            .finish_non_exhaustive()
    }
}

/// Pending reschedule bound to a queue and filter.
pub struct RescheduleRequest {
    scheduler: Scheduler,
    queue: String,
    filter: ReadFilter,
}

impl RescheduleRequest {
    /// Applies the reschedule: a new `run_at` resets the attempt count and
    /// failure state; passing only `expire_at` replaces the expiry; passing
    /// neither backs the task off.
    pub async fn to(
        self,
        run_at: Option<DateTime<Utc>>,
        expire_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let queue = self.scheduler.queue(Some(&self.queue))?;
        let mut record = queue.fetch_task(&self.filter).await?;
        record.reschedule(run_at, expire_at)?;
        queue
            .store()
            .update(record.id, &TaskUpdate::from_record(&record))
            .await
    }
}

/// Collects queue definitions and assembles the immutable scheduler.
pub struct SchedulerBuilder {
    queues: Vec<QueueDef>,
    default_store: Option<Arc<dyn TaskStore>>,
    container: Option<Arc<dyn Any + Send + Sync>>,
    clock: Arc<dyn Clock>,
}

impl SchedulerBuilder {
    pub fn new() -> Self {
        Self {
            queues: Vec::new(),
            default_store: None,
            container: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn define_queue(mut self, def: QueueDef) -> Self {
        self.queues.push(def);
        self
    }

    /// Store used by every queue that does not bring its own.
    pub fn default_store(mut self, store: impl TaskStore + 'static) -> Self {
        self.default_store = Some(Arc::new(store));
        self
    }

    /// Arbitrary user state handed to every handler through its context.
    pub fn container(mut self, container: impl Any + Send + Sync) -> Self {
        self.container = Some(Arc::new(container));
        self
    }

    /// Replaces the wall clock; the scenario tests drive time by hand.
    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn build(self) -> Result<Scheduler> {
        if self.queues.is_empty() {
            return Err(
                SchedulingError::Config("At least one queue must be defined".to_string()).into(),
            );
        }

        let mut queues: Vec<Arc<Queue>> = Vec::with_capacity(self.queues.len());
        for def in self.queues {
            let queue = Queue::build(def, self.default_store.clone(), self.clock.clone())?;
            if queues.iter().any(|prior| prior.name() == queue.name()) {
                return Err(SchedulingError::Config(format!(
                    "Queue '{}' is defined twice",
                    queue.name()
                ))
                .into());
            }
            queues.push(Arc::new(queue));
        }

        Ok(Scheduler {
            inner: Arc::new(SchedulerInner {
                queues,
                container: self.container,
                clock: self.clock,
            }),
        })
    }
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
