//! Time source abstraction
//!
//! Everything that asks "is this task due yet?" goes through a [`Clock`] so
//! the scenario tests can drive time by hand. Production code always runs on
//! [`SystemClock`].

use chrono::{DateTime, Utc};

/// A source of the current UTC time.
pub trait Clock: std::fmt::Debug + Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
