//! Shared helpers for the crate's tests: a hand-driven clock and scripted
//! handlers that record everything they observe.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::Value;

use crate::clock::Clock;
use crate::handler::{HandlerFactory, TaskContext, TaskHandler};
use crate::scheduler::Defer;

/// Fixed test epoch.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 14, 9, 0, 0).unwrap()
}

/// Clock that only moves when a test advances it.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap() = to;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now = *now + by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Everything the scripted handlers observed.
#[derive(Debug, Default)]
pub struct CallLog {
    pub runs: usize,
    pub queues: Vec<String>,
    pub seen_data: Vec<Option<Value>>,
    pub successes: Vec<Value>,
    pub fails: Vec<String>,
    pub final_fails: Vec<String>,
}

pub type SharedLog = Arc<Mutex<CallLog>>;

pub fn new_log() -> SharedLog {
    Arc::default()
}

#[derive(Debug, Clone)]
pub enum Behavior {
    Succeed(Value),
    Fail(&'static str),
    Panic(&'static str),
    Sleep(std::time::Duration),
    /// Defer a follow-on task into the named queue, then succeed.
    DeferTo(&'static str),
}

pub struct ScriptedHandler {
    log: SharedLog,
    behavior: Behavior,
    failing_hooks: bool,
}

#[async_trait]
impl TaskHandler for ScriptedHandler {
    async fn run(&mut self, ctx: &TaskContext) -> anyhow::Result<Value> {
        {
            let mut log = self.log.lock().unwrap();
            log.runs += 1;
            log.queues.push(ctx.queue.clone());
            log.seen_data.push(ctx.data.clone());
        }
        match &self.behavior {
            Behavior::Succeed(value) => Ok(value.clone()),
            Behavior::Fail(message) => Err(anyhow::anyhow!("{message}")),
            Behavior::Panic(message) => panic!("{message}"),
            Behavior::Sleep(duration) => {
                tokio::time::sleep(*duration).await;
                Ok(Value::Null)
            }
            Behavior::DeferTo(target) => {
                ctx.scheduler.defer(Some(*target), Defer::new()).await?;
                Ok(Value::Null)
            }
        }
    }

    async fn on_success(&mut self, _ctx: &TaskContext, result: &Value) -> anyhow::Result<()> {
        self.log.lock().unwrap().successes.push(result.clone());
        if self.failing_hooks {
            anyhow::bail!("success hook failed");
        }
        Ok(())
    }

    async fn on_fail(&mut self, _ctx: &TaskContext, error: &anyhow::Error) -> anyhow::Result<()> {
        self.log.lock().unwrap().fails.push(error.to_string());
        if self.failing_hooks {
            anyhow::bail!("fail hook failed");
        }
        Ok(())
    }

    async fn on_final_fail(
        &mut self,
        _ctx: &TaskContext,
        error: &anyhow::Error,
    ) -> anyhow::Result<()> {
        self.log.lock().unwrap().final_fails.push(error.to_string());
        if self.failing_hooks {
            anyhow::bail!("final_fail hook failed");
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ScriptedFactory {
    log: SharedLog,
    behavior: Behavior,
    needs_data: bool,
    failing_hooks: bool,
}

impl ScriptedFactory {
    pub fn new(log: &SharedLog, behavior: Behavior) -> Self {
        Self {
            log: log.clone(),
            behavior,
            needs_data: false,
            failing_hooks: false,
        }
    }

    /// A factory whose handlers declare the data capability.
    pub fn with_data(log: &SharedLog, behavior: Behavior) -> Self {
        Self {
            needs_data: true,
            ..Self::new(log, behavior)
        }
    }

    /// Every hook reports itself and then fails.
    pub fn failing_hooks(mut self) -> Self {
        self.failing_hooks = true;
        self
    }
}

impl HandlerFactory for ScriptedFactory {
    fn create(&self) -> Box<dyn TaskHandler> {
        Box::new(ScriptedHandler {
            log: self.log.clone(),
            behavior: self.behavior.clone(),
            failing_hooks: self.failing_hooks,
        })
    }

    fn needs_data(&self) -> bool {
        self.needs_data
    }
}
