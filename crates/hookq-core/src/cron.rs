//! Five-field cron expressions: `minute hour day-of-month month day-of-week`.
//!
//! Each field accepts `*`, `N`, `A-B`, `*/S`, `A-B/S`, `N/S` and comma lists.
//! Months accept `jan`..`dec`, weekdays accept `sun`..`sat`, and weekday `7`
//! is Sunday. When both day fields are restricted a day matches if either
//! does, as in classic cron. All evaluation happens in UTC.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};
use std::fmt;

use crate::error::{HookqError, Result};

const MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const DAY_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

/// How far ahead `next_after` searches before giving up.
const SEARCH_HORIZON_DAYS: i64 = 366 * 5;

/// A parsed cron expression. Each field is a bitmask of allowed values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    source: String,
    minutes: u64,
    hours: u64,
    days: u64,
    months: u64,
    weekdays: u64,
    dom_star: bool,
    dow_star: bool,
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self> {
        let parts: Vec<&str> = expr.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(HookqError::InvalidSchedule(format!(
                "cron expression '{expr}' needs 5 fields (minute hour day-of-month month day-of-week)"
            )));
        }

        let minutes = parse_field(parts[0], 0, 59, &[], 0)?;
        let hours = parse_field(parts[1], 0, 23, &[], 0)?;
        let days = parse_field(parts[2], 1, 31, &[], 0)?;
        let months = parse_field(parts[3], 1, 12, &MONTH_NAMES, 1)?;
        let mut weekdays = parse_field(parts[4], 0, 7, &DAY_NAMES, 0)?;
        // 7 is an alias for Sunday
        if weekdays & (1 << 7) != 0 {
            weekdays = (weekdays & !(1 << 7)) | 1;
        }

        Ok(Self {
            source: parts.join(" "),
            minutes,
            hours,
            days,
            months,
            weekdays,
            dom_star: parts[2].starts_with('*'),
            dow_star: parts[4].starts_with('*'),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// The first matching minute strictly after `after`, or `None` if nothing
    /// matches within the search horizon (e.g. `0 0 30 2 *`).
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut t = after.with_nanosecond(0)?.with_second(0)? + Duration::minutes(1);
        let limit = after + Duration::days(SEARCH_HORIZON_DAYS);

        while t <= limit {
            if !has_bit(self.months, t.month()) {
                t = start_of_next_month(t)?;
                continue;
            }
            if !self.day_matches(t) {
                t = start_of_day(t.date_naive().succ_opt()?)?;
                continue;
            }
            if !has_bit(self.hours, t.hour()) {
                t = (t + Duration::hours(1)).with_minute(0)?;
                continue;
            }
            if !has_bit(self.minutes, t.minute()) {
                t += Duration::minutes(1);
                continue;
            }
            return Some(t);
        }
        None
    }

    fn day_matches(&self, t: DateTime<Utc>) -> bool {
        let dom = has_bit(self.days, t.day());
        let dow = has_bit(self.weekdays, t.weekday().num_days_from_sunday());
        if self.dom_star || self.dow_star {
            dom && dow
        } else {
            dom || dow
        }
    }
}

impl fmt::Display for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl std::str::FromStr for CronExpr {
    type Err = HookqError;

    fn from_str(s: &str) -> Result<Self> {
        CronExpr::parse(s)
    }
}

// ---------------------------------------------------------------------------
// Field parsing
// ---------------------------------------------------------------------------

fn parse_field(field: &str, min: u32, max: u32, names: &[&str], name_base: u32) -> Result<u64> {
    let mut mask = 0u64;
    for part in field.split(',') {
        if part.is_empty() {
            return Err(invalid(field, "empty list element"));
        }

        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| invalid(field, &format!("bad step '{step}'")))?;
                if step == 0 {
                    return Err(invalid(field, "step must be positive"));
                }
                if step > max - min {
                    return Err(invalid(field, &format!("step {step} out of range 1-{}", max - min)));
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            (
                parse_value(a, min, max, names, name_base)?,
                parse_value(b, min, max, names, name_base)?,
            )
        } else {
            let v = parse_value(range, min, max, names, name_base)?;
            // `N/S` runs from N to the end of the field
            if step > 1 {
                (v, max)
            } else {
                (v, v)
            }
        };

        if lo > hi {
            return Err(invalid(field, &format!("range {lo}-{hi} is reversed")));
        }

        let mut v = lo;
        while v <= hi {
            mask |= 1 << v;
            match v.checked_add(step) {
                Some(next) => v = next,
                None => break,
            }
        }
    }
    Ok(mask)
}

fn parse_value(s: &str, min: u32, max: u32, names: &[&str], name_base: u32) -> Result<u32> {
    let lower = s.to_ascii_lowercase();
    if let Some(i) = names.iter().position(|n| *n == lower) {
        return Ok(i as u32 + name_base);
    }
    let v: u32 = s
        .parse()
        .map_err(|_| invalid(s, "not a number or known name"))?;
    if v < min || v > max {
        return Err(invalid(s, &format!("out of range {min}-{max}")));
    }
    Ok(v)
}

fn invalid(field: &str, why: &str) -> HookqError {
    HookqError::InvalidSchedule(format!("cron field '{field}': {why}"))
}

// ---------------------------------------------------------------------------
// Date helpers
// ---------------------------------------------------------------------------

fn has_bit(mask: u64, v: u32) -> bool {
    mask & (1 << v) != 0
}

fn start_of_day(date: NaiveDate) -> Option<DateTime<Utc>> {
    date.and_hms_opt(0, 0, 0)
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn start_of_next_month(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    start_of_day(NaiveDate::from_ymd_opt(year, month, 1)?)
}
