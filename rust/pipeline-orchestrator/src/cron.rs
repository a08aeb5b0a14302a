//! Cron expression parsing and evaluation.
//!
//! Standard five-field format: `minute hour day month weekday`. Each field
//! is a comma-separated union of `*`, `n`, `a-b`, `*/n` and `a-b/n`.
//! Day-of-month and day-of-week are both constraints (AND), unlike the OR
//! rule some cron dialects apply. All evaluation happens in UTC.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Days, NaiveDate, Timelike, Utc};
use thiserror::Error;

/// Days searched before an expression is declared unsatisfiable.
/// Covers a full 28-year cycle of weekday/leap-year combinations.
const SEARCH_HORIZON_DAYS: u64 = 366 * 28;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronError {
    #[error("cron expression must have 5 fields, found {found}: '{expression}'")]
    FieldCount { expression: String, found: usize },

    #[error("invalid {field} field '{value}': {reason}")]
    Field {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("cron expression '{0}' never fires")]
    NeverFires(String),
}

#[derive(Debug, Clone, Copy)]
struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
}

const MINUTE: FieldSpec = FieldSpec { name: "minute", min: 0, max: 59 };
const HOUR: FieldSpec = FieldSpec { name: "hour", min: 0, max: 23 };
const DAY: FieldSpec = FieldSpec { name: "day-of-month", min: 1, max: 31 };
const MONTH: FieldSpec = FieldSpec { name: "month", min: 1, max: 12 };
const WEEKDAY: FieldSpec = FieldSpec { name: "day-of-week", min: 0, max: 6 };

/// The set of values one field accepts, as a bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CronField {
    bits: u64,
}

impl CronField {
    fn matches(self, value: u32) -> bool {
        value < 64 && self.bits & (1 << value) != 0
    }

    /// Accepted values in ascending order.
    fn values(self) -> impl Iterator<Item = u32> {
        (0..64u32).filter(move |v| self.matches(*v))
    }
}

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
    source: String,
    minute: CronField,
    hour: CronField,
    day: CronField,
    month: CronField,
    weekday: CronField,
}

/// Cron expression parser.
#[derive(Debug)]
pub struct CronParser;

impl CronParser {
    /// Parse a cron expression string.
    ///
    /// # Examples
    ///
    /// - `0 0 * * *` - Daily at midnight
    /// - `*/15 * * * *` - Every 15 minutes
    /// - `0 9-17/2 * * 1-5` - Every other hour 9am-5pm, Monday-Friday
    /// - `0,30 6 1,15 * *` - 06:00 and 06:30 on the 1st and 15th
    pub fn parse(expr: &str) -> Result<CronExpression, CronError> {
        let parts: Vec<&str> = expr.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(CronError::FieldCount {
                expression: expr.to_string(),
                found: parts.len(),
            });
        }

        Ok(CronExpression {
            source: expr.to_string(),
            minute: Self::parse_field(parts[0], MINUTE)?,
            hour: Self::parse_field(parts[1], HOUR)?,
            day: Self::parse_field(parts[2], DAY)?,
            month: Self::parse_field(parts[3], MONTH)?,
            weekday: Self::parse_field(parts[4], WEEKDAY)?,
        })
    }

    fn parse_field(field: &str, spec: FieldSpec) -> Result<CronField, CronError> {
        let mut bits = 0u64;
        for item in field.split(',') {
            let (start, end, step) = Self::parse_item(item, spec)
                .map_err(|reason| CronError::Field {
                    field: spec.name,
                    value: field.to_string(),
                    reason,
                })?;
            for value in (start..=end).step_by(step as usize) {
                bits |= 1 << value;
            }
        }
        Ok(CronField { bits })
    }

    /// One comma-separated item as an inclusive range plus a step.
    fn parse_item(item: &str, spec: FieldSpec) -> Result<(u32, u32, u32), String> {
        if item.is_empty() {
            return Err("empty list item".to_string());
        }

        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step = Self::parse_number(step)?;
                if step == 0 || step > spec.max {
                    return Err(format!("step must be 1-{}", spec.max));
                }
                (range, Some(step))
            }
            None => (item, None),
        };

        let (start, end) = if range == "*" {
            (spec.min, spec.max)
        } else if let Some((start, end)) = range.split_once('-') {
            let start = Self::parse_bounded(start, spec)?;
            let end = Self::parse_bounded(end, spec)?;
            if start > end {
                return Err(format!("range start {start} is after end {end}"));
            }
            (start, end)
        } else {
            if step.is_some() {
                return Err("step needs '*' or a range before '/'".to_string());
            }
            let value = Self::parse_bounded(range, spec)?;
            (value, value)
        };

        Ok((start, end, step.unwrap_or(1)))
    }

    fn parse_bounded(value: &str, spec: FieldSpec) -> Result<u32, String> {
        let number = Self::parse_number(value)?;
        if number < spec.min || number > spec.max {
            return Err(format!("value {number} outside {}-{}", spec.min, spec.max));
        }
        Ok(number)
    }

    fn parse_number(value: &str) -> Result<u32, String> {
        if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
            return Err(format!("'{value}' is not a number"));
        }
        value.parse().map_err(|e| format!("'{value}': {e}"))
    }
}

impl CronExpression {
    /// The expression text exactly as parsed.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Check if the cron expression matches the given time (to the minute).
    pub fn matches(&self, time: &DateTime<Utc>) -> bool {
        self.minute.matches(time.minute())
            && self.hour.matches(time.hour())
            && self.date_matches(time.date_naive())
    }

    fn date_matches(&self, date: NaiveDate) -> bool {
        self.month.matches(date.month())
            && self.day.matches(date.day())
            && self.weekday.matches(date.weekday().num_days_from_sunday())
    }

    /// The earliest trigger strictly after `after`.
    ///
    /// Returns `None` when no date within the search horizon satisfies the
    /// day, month and weekday fields together (e.g. `0 0 30 2 *`).
    pub fn next_after(&self, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = after.with_second(0)?.with_nanosecond(0)? + chrono::Duration::minutes(1);
        let start_date = start.date_naive();

        for offset in 0..SEARCH_HORIZON_DAYS {
            let date = start_date.checked_add_days(Days::new(offset))?;
            if !self.date_matches(date) {
                continue;
            }

            let (hour_floor, minute_floor) = if offset == 0 {
                (start.hour(), start.minute())
            } else {
                (0, 0)
            };
            for hour in self.hour.values().filter(|h| *h >= hour_floor) {
                let floor = if hour == hour_floor { minute_floor } else { 0 };
                if let Some(minute) = self.minute.values().find(|m| *m >= floor) {
                    return date.and_hms_opt(hour, minute, 0).map(|t| t.and_utc());
                }
            }
        }
        None
    }

    /// Whether a trigger falls in `(last_evaluated, now]`.
    pub fn is_due(&self, now: &DateTime<Utc>, last_evaluated: &DateTime<Utc>) -> bool {
        self.next_after(last_evaluated)
            .is_some_and(|next| next <= *now)
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl FromStr for CronExpression {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CronParser::parse(s)
    }
}

/// The earliest trigger of `expression` strictly after `after`.
pub fn next_trigger(expression: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>, CronError> {
    CronParser::parse(expression)?
        .next_after(&after)
        .ok_or_else(|| CronError::NeverFires(expression.to_string()))
}

/// Whether `expression` has a trigger in `(last_evaluated, now]`.
///
/// Several missed triggers in that window still count once.
pub fn is_due(
    expression: &str,
    now: DateTime<Utc>,
    last_evaluated: DateTime<Utc>,
) -> Result<bool, CronError> {
    Ok(CronParser::parse(expression)?.is_due(&now, &last_evaluated))
}
