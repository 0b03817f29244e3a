//! Per-queue worker loop
//!
//! One worker owns one queue: sleep a poll period, fetch the next runnable
//! task, hand it to the executor, repeat. Within a queue at most one task
//! runs at a time; parallelism comes from running one worker per queue.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::{debug, error};

use crate::executor::TaskExecutor;
use crate::queue::Queue;
use crate::scheduler::Scheduler;
use crate::Result;

pub struct QueueWorker {
    queue: Arc<Queue>,
    executor: TaskExecutor,
}

impl QueueWorker {
    pub(crate) fn new(queue: Arc<Queue>, scheduler: Scheduler) -> Self {
        Self {
            executor: TaskExecutor::new(queue.clone(), scheduler),
            queue,
        }
    }

    pub fn queue_name(&self) -> &str {
        self.queue.name()
    }

    /// Runs the next due task, if any. Returns whether one ran.
    pub(crate) async fn work_one(&self) -> Result<bool> {
        match self.queue.next_task().await? {
            Some(record) => {
                debug!(queue = %self.queue.name(), id = record.id, "Picked up task");
                self.executor.execute(record).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// The poll loop: sleep one poll period, work one task, repeat until
    /// halted through the shutdown channel. Errors never terminate the loop;
    /// store failures are logged and the next poll tries again.
    pub(crate) async fn work(self, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                _ = sleep(self.queue.poll_period()) => {
                    if let Err(error) = self.work_one().await {
                        error!(
                            queue = %self.queue.name(),
                            error = format!("{error:#}"),
                            "Worker iteration failed"
                        );
                    }
                }
                _ = shutdown.recv() => {
                    debug!(queue = %self.queue.name(), "Worker halted");
                    break;
                }
            }
        }
    }
}
