//! Task records and their lifecycle rules
//!
//! A [`TaskRecord`] is the persisted state of one scheduled task. This module
//! owns the state machine: attempt counting, retry backoff, expiry, and the
//! transition into permanent failure. Records are pure data; the current time
//! is always passed in so the clock stays at the edges.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{Result, SchedulingError};

/// Delay in seconds added before every retry, independent of the attempt
/// count. Prevents tight thrash on immediately-failing tasks.
const BACKOFF_FLOOR_SECS: i64 = 30;

/// The outcome of recording a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// The task was backed off and will be retried.
    Retry,
    /// The task is finally failed; `run_at` is now cleared and the record is
    /// retained for inspection but never attempted again.
    Final,
}

/// Persisted state of one scheduled task.
///
/// `data` is carried in its serialized JSON string form; callers serialize
/// before writing and before filtering on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Unique within a store; assigned by the store on create.
    pub id: i64,
    /// Normalized queue name.
    pub queue: String,
    /// Earliest time the task may be attempted. `None` means finally failed:
    /// neither retried nor expired further.
    pub run_at: Option<DateTime<Utc>>,
    /// The `run_at` as originally requested; only an explicit reschedule with
    /// a new `run_at` touches it.
    pub initial_run_at: Option<DateTime<Utc>>,
    /// Time after which the task must not be attempted. `None` = no expiry.
    pub expire_at: Option<DateTime<Utc>>,
    /// Completed attempts.
    pub attempts: u32,
    /// Time of the most recent failure; set and cleared together with
    /// `last_error`.
    pub last_fail_at: Option<DateTime<Utc>>,
    /// Rendered message and trace of the most recent failure.
    pub last_error: Option<String>,
    /// Opaque JSON payload in its serialized form.
    pub data: Option<String>,
}

impl TaskRecord {
    /// A task is runnable when its `run_at` has arrived and it has not
    /// expired. `run_at == now` is runnable; `expire_at == now` is not yet
    /// expired.
    pub fn runnable(&self, now: DateTime<Utc>) -> bool {
        match self.run_at {
            Some(run_at) => run_at <= now && !self.expired(now),
            None => false,
        }
    }

    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        self.expire_at.is_some_and(|expire_at| now > expire_at)
    }

    /// Finally-failed tasks are retained with `run_at` cleared.
    pub fn finally_failed(&self) -> bool {
        self.run_at.is_none()
    }

    pub fn successful(&self) -> bool {
        self.attempts > 0 && self.last_error.is_none() && !self.finally_failed()
    }

    pub fn attempts_left(&self, max_attempts: Option<u32>) -> bool {
        max_attempts.map_or(true, |max| self.attempts < max)
    }

    /// Counts a new attempt. Callers invoke this at the start of each
    /// execution; exhausted records are a precondition violation.
    pub fn add_attempt(&mut self, max_attempts: Option<u32>) -> Result<()> {
        if !self.attempts_left(max_attempts) {
            return Err(SchedulingError::AttemptsExhausted.into());
        }
        self.attempts += 1;
        Ok(())
    }

    /// Records a failed attempt and decides its fate: backoff-and-retry when
    /// attempts remain and the task has not expired, otherwise permanent
    /// failure.
    pub fn failure(
        &mut self,
        error: &anyhow::Error,
        now: DateTime<Utc>,
        max_attempts: Option<u32>,
    ) -> FailureOutcome {
        self.last_fail_at = Some(now);
        self.last_error = Some(format!("{error:?}"));

        if self.attempts_left(max_attempts) && !self.expired(now) {
            self.backoff();
            FailureOutcome::Retry
        } else {
            self.run_at = None;
            FailureOutcome::Final
        }
    }

    /// Reschedules the task. Three modes:
    ///
    /// * both `None`: backoff only, `run_at += 30 + attempts^4` seconds;
    /// * `expire_at` alone: replace the expiry;
    /// * `run_at` set: replace `run_at` and `initial_run_at`, clear failure
    ///   state, and reset the attempt count. Rejected when the resulting
    ///   `run_at` would fall after the new or retained `expire_at`.
    pub fn reschedule(
        &mut self,
        run_at: Option<DateTime<Utc>>,
        expire_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        match (run_at, expire_at) {
            (None, None) => self.backoff(),
            (None, Some(expire_at)) => self.expire_at = Some(expire_at),
            (Some(run_at), expire_at) => {
                let effective_expiry = expire_at.or(self.expire_at);
                if let Some(expire_at) = effective_expiry {
                    if run_at > expire_at {
                        return Err(SchedulingError::InvalidSchedule { run_at, expire_at }.into());
                    }
                }
                if expire_at.is_some() {
                    self.expire_at = expire_at;
                }
                self.run_at = Some(run_at);
                self.initial_run_at = Some(run_at);
                self.attempts = 0;
                self.clear_fails();
            }
        }
        Ok(())
    }

    pub fn clear_fails(&mut self) {
        self.last_fail_at = None;
        self.last_error = None;
    }

    /// Pushes `run_at` back by `30 + attempts^4` seconds. The additive floor
    /// prevents tight thrash; the fourth-power term decays the retry rate
    /// near-geometrically.
    fn backoff(&mut self) {
        if let Some(run_at) = self.run_at {
            let delay = BACKOFF_FLOOR_SECS + i64::from(self.attempts).pow(4);
            self.run_at = Some(run_at + Duration::seconds(delay));
        }
    }
}
