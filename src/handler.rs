//! Task handler contract
//!
//! Users supply one handler type per queue. `run` is mandatory; the hooks
//! default to no-ops so a handler implements only what it reacts to. A fresh
//! handler is built for every attempt, so handlers never need interior
//! synchronization of their own.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::scheduler::Scheduler;

/// Execution context handed to every attempt.
///
/// This replaces late-bound attribute injection: everything a handler may
/// need arrives in one struct. Log output is attributed automatically; the
/// executor runs handlers inside a span carrying the queue name.
#[derive(Clone)]
pub struct TaskContext {
    /// Name of the queue the task runs under.
    pub queue: String,
    /// Deserialized payload, when the queue's handler declares one.
    pub data: Option<Value>,
    /// Handle for deferring follow-on work from inside a handler. Opaque:
    /// handlers use the client API on it and nothing else.
    pub scheduler: Scheduler,
    /// User state shared across handlers, as configured at setup.
    pub container: Option<Arc<dyn Any + Send + Sync>>,
}

/// One unit of work.
///
/// A failed `run` (or one that outlives the queue timeout) is recorded on
/// the task record and retried with backoff until attempts run out or the
/// task expires. Hook errors are logged and swallowed; they never change
/// what was recorded.
#[async_trait]
pub trait TaskHandler: Send {
    async fn run(&mut self, ctx: &TaskContext) -> anyhow::Result<Value>;

    /// Invoked after a successful run with the value `run` produced.
    async fn on_success(&mut self, _ctx: &TaskContext, _result: &Value) -> anyhow::Result<()> {
        Ok(())
    }

    /// Invoked after a failed attempt that will be retried.
    async fn on_fail(&mut self, _ctx: &TaskContext, _error: &anyhow::Error) -> anyhow::Result<()> {
        Ok(())
    }

    /// Invoked when the task fails for the last time, whether through
    /// exhausted attempts, expiry, or a failure past the expiry time.
    async fn on_final_fail(
        &mut self,
        _ctx: &TaskContext,
        _error: &anyhow::Error,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Builds a fresh handler for every attempt and declares its capabilities.
pub trait HandlerFactory: Send + Sync {
    fn create(&self) -> Box<dyn TaskHandler>;

    /// Whether handlers from this factory take a payload. Declaring data
    /// makes it mandatory at defer time; not declaring it forbids it.
    fn needs_data(&self) -> bool {
        false
    }
}
