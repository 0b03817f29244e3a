//! Single-attempt task execution
//!
//! The executor owns the work of one attempt: count it, shortcut expired
//! tasks, run a fresh handler under the queue timeout, then record the
//! outcome through the store and dispatch the matching handler hook. Handler
//! failures never propagate past the executor; they land on the record.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::Context;
use futures_util::FutureExt;
use serde_json::Value;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::handler::{TaskContext, TaskHandler};
use crate::queue::Queue;
use crate::record::{FailureOutcome, TaskRecord};
use crate::scheduler::Scheduler;
use crate::store::TaskUpdate;
use crate::{Result, SchedulingError};

/// Runs one attempt of one task and records the outcome.
pub struct TaskExecutor {
    queue: Arc<Queue>,
    scheduler: Scheduler,
}

impl TaskExecutor {
    pub(crate) fn new(queue: Arc<Queue>, scheduler: Scheduler) -> Self {
        Self { queue, scheduler }
    }

    /// Executes one attempt of `record`. The returned error covers
    /// infrastructure problems only (store failures, exhausted-attempts
    /// preconditions); handler failures are recorded on the task.
    pub(crate) async fn execute(&self, mut record: TaskRecord) -> Result<()> {
        record.add_attempt(self.queue.max_attempts())?;

        let mut handler = self.queue.factory().create();
        let ctx = self.build_context(&record)?;

        let now = self.queue.clock().now();
        let expired = record.expire_at.filter(|&expire_at| now > expire_at);

        let result = match expired {
            // The deadline passed before the task was picked up; fail it
            // without invoking the handler.
            Some(expire_at) => Err(SchedulingError::TaskExpired(expire_at).into()),
            None => self.run_with_timeout(handler.as_mut(), &ctx).await,
        };

        match result {
            Ok(value) => self.record_success(record, handler.as_mut(), &ctx, value).await,
            Err(error) => self.record_failure(record, handler.as_mut(), &ctx, error).await,
        }
    }

    fn build_context(&self, record: &TaskRecord) -> Result<TaskContext> {
        let data = record
            .data
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .with_context(|| format!("Task {} carries undecodable data", record.id))?;
        Ok(TaskContext {
            queue: self.queue.name().to_string(),
            data,
            scheduler: self.scheduler.clone(),
            container: self.scheduler.container(),
        })
    }

    /// Races the handler against the queue timeout. The handler future is
    /// dropped on elapse; user code that cannot be preempted is at least no
    /// longer waited for.
    async fn run_with_timeout(
        &self,
        handler: &mut dyn TaskHandler,
        ctx: &TaskContext,
    ) -> Result<Value> {
        let timeout = self.queue.timeout();
        tokio::select! {
            result = AssertUnwindSafe(handler.run(ctx)).catch_unwind() => match result {
                Ok(outcome) => outcome,
                Err(panic) => Err(anyhow::anyhow!(
                    "Task handler panicked: {}",
                    panic_message(&panic)
                )),
            },
            _ = sleep(timeout) => Err(SchedulingError::Timeout(timeout).into()),
        }
    }

    async fn record_success(
        &self,
        mut record: TaskRecord,
        handler: &mut dyn TaskHandler,
        ctx: &TaskContext,
        value: Value,
    ) -> Result<()> {
        record.clear_fails();
        info!(
            queue = %self.queue.name(),
            id = record.id,
            attempts = record.attempts,
            "Task completed successfully"
        );
        guard_hook(
            self.queue.name(),
            record.id,
            "success",
            handler.on_success(ctx, &value),
        )
        .await;
        self.queue.store().delete(record.id).await
    }

    async fn record_failure(
        &self,
        mut record: TaskRecord,
        handler: &mut dyn TaskHandler,
        ctx: &TaskContext,
        cause: anyhow::Error,
    ) -> Result<()> {
        let now = self.queue.clock().now();
        match record.failure(&cause, now, self.queue.max_attempts()) {
            FailureOutcome::Retry => {
                error!(
                    queue = %self.queue.name(),
                    id = record.id,
                    attempts = record.attempts,
                    error = format!("{cause:#}"),
                    "Task failed; retry scheduled"
                );
                guard_hook(self.queue.name(), record.id, "fail", handler.on_fail(ctx, &cause))
                    .await;
            }
            FailureOutcome::Final => {
                error!(
                    queue = %self.queue.name(),
                    id = record.id,
                    attempts = record.attempts,
                    error = format!("{cause:#}"),
                    "Task failed permanently"
                );
                guard_hook(
                    self.queue.name(),
                    record.id,
                    "final_fail",
                    handler.on_final_fail(ctx, &cause),
                )
                .await;
            }
        }
        self.queue
            .store()
            .update(record.id, &TaskUpdate::from_record(&record))
            .await
    }
}

/// Hook dispatch is guarded: a failing or panicking hook is logged and
/// swallowed, and the recorded task state stands as computed.
async fn guard_hook(
    queue: &str,
    id: i64,
    hook: &str,
    dispatch: impl std::future::Future<Output = anyhow::Result<()>>,
) {
    match AssertUnwindSafe(dispatch).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => {
            warn!(queue, id, hook, error = format!("{error:#}"), "Task hook failed");
        }
        Err(panic) => {
            warn!(
                queue,
                id,
                hook,
                error = panic_message(&panic),
                "Task hook panicked"
            );
        }
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
