//! Recurrence descriptors.
//!
//! A `Schedule` is a pure value: given a reference time it computes the next
//! due timestamp strictly after it. Used at enqueue time for the first due
//! time and by the runner when re-arming a recurring action.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::cron::CronExpr;
use crate::error::{HookqError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schedule {
    /// Runs once at `at`.
    Single { at: DateTime<Utc> },
    /// Runs at `start + k * every_secs` for k = 0, 1, 2, ...
    Interval {
        start: DateTime<Utc>,
        every_secs: u64,
    },
    /// Runs at every wall-clock minute (UTC) matching `expression`.
    Cron { expression: String },
}

impl Schedule {
    pub fn single(at: DateTime<Utc>) -> Self {
        Schedule::Single { at }
    }

    pub fn interval(start: DateTime<Utc>, every_secs: u64) -> Self {
        Schedule::Interval { start, every_secs }
    }

    pub fn cron(expression: impl Into<String>) -> Self {
        Schedule::Cron {
            expression: expression.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Schedule::Single { .. } => "single",
            Schedule::Interval { .. } => "interval",
            Schedule::Cron { .. } => "cron",
        }
    }

    pub fn is_recurring(&self) -> bool {
        !matches!(self, Schedule::Single { .. })
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Schedule::Single { .. } => Ok(()),
            Schedule::Interval { every_secs, .. } => {
                if *every_secs == 0 {
                    return Err(HookqError::InvalidSchedule(
                        "interval must be at least one second".into(),
                    ));
                }
                if *every_secs > i64::MAX as u64 / 1000 {
                    return Err(HookqError::InvalidSchedule(format!(
                        "interval of {every_secs}s is too large"
                    )));
                }
                Ok(())
            }
            Schedule::Cron { expression } => CronExpr::parse(expression).map(|_| ()),
        }
    }

    /// The due time assigned when the action is enqueued at `now`.
    ///
    /// Single and interval schedules are due at their own anchor (which may
    /// be in the past, making them immediately due). Cron schedules are due
    /// at the first match after `now`.
    pub fn first_due(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        self.validate()?;
        match self {
            Schedule::Single { at } => Ok(*at),
            Schedule::Interval { start, .. } => Ok(*start),
            Schedule::Cron { expression } => CronExpr::parse(expression)?
                .next_after(now)
                .ok_or_else(|| {
                    HookqError::InvalidSchedule(format!(
                        "cron expression '{expression}' never matches"
                    ))
                }),
        }
    }

    /// The next occurrence strictly after `after`, or `None` when the
    /// schedule has no further occurrence.
    ///
    /// Interval occurrences stay on the grid anchored at `start`, so the
    /// k-th run is due at `start + k * every` no matter how late earlier
    /// runs finished.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Single { at } => (*at > after).then_some(*at),
            Schedule::Interval { start, every_secs } => {
                if *every_secs == 0 {
                    return None;
                }
                if after < *start {
                    return Some(*start);
                }
                let every_ms = (*every_secs as i64).checked_mul(1000)?;
                let elapsed_ms = (after - *start).num_milliseconds();
                let k = elapsed_ms / every_ms + 1;
                start.checked_add_signed(Duration::milliseconds(k.checked_mul(every_ms)?))
            }
            Schedule::Cron { expression } => CronExpr::parse(expression).ok()?.next_after(after),
        }
    }
}
