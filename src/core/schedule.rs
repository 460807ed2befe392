//! Cron expression parsing and next occurrence calculation.
//!
//! Supports the standard five-field syntax (`minute hour day-of-month month
//! day-of-week`) and the usual shortcuts (`@daily`, `@hourly`, ...). Schedules
//! are evaluated in an IANA timezone and always yield UTC instants.
//!
//! Everything here is pure: no clocks are read except by [`Schedule::next`].

use chrono::{
    DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc,
};
use chrono_tz::Tz;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// How far ahead `next_after` searches before giving up.
const MAX_SEARCH_YEARS: i32 = 10;

/// Errors that can occur when parsing or using schedules.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    /// Invalid cron expression.
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),

    /// Invalid timezone.
    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),

    /// No more occurrences.
    #[error("no more occurrences")]
    NoMoreOccurrences,
}

/// Set of allowed values for one cron field, as a bitmask.
#[derive(Clone, Copy, PartialEq, Eq)]
struct FieldSet(u64);

impl FieldSet {
    fn contains(&self, value: u32) -> bool {
        value < 64 && self.0 & (1 << value) != 0
    }

    fn insert(&mut self, value: u32) {
        self.0 |= 1 << value;
    }

    fn values(&self) -> impl Iterator<Item = u32> + '_ {
        (0..64).filter(|v| self.contains(*v))
    }
}

impl fmt::Debug for FieldSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.values()).finish()
    }
}

#[derive(Clone, Copy)]
struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
}

const MINUTE: FieldSpec = FieldSpec {
    name: "minute",
    min: 0,
    max: 59,
    names: &[],
};
const HOUR: FieldSpec = FieldSpec {
    name: "hour",
    min: 0,
    max: 23,
    names: &[],
};
const DAY_OF_MONTH: FieldSpec = FieldSpec {
    name: "day-of-month",
    min: 1,
    max: 31,
    names: &[],
};
const MONTH: FieldSpec = FieldSpec {
    name: "month",
    min: 1,
    max: 12,
    names: &[
        "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
    ],
};
// 7 is accepted as an alias for Sunday and folded to 0 after parsing.
const DAY_OF_WEEK: FieldSpec = FieldSpec {
    name: "day-of-week",
    min: 0,
    max: 7,
    names: &["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"],
};

/// A parsed five-field cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minutes: FieldSet,
    hours: FieldSet,
    days_of_month: FieldSet,
    months: FieldSet,
    days_of_week: FieldSet,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronExpr {
    /// Parse a five-field expression or one of the `@` shortcuts.
    pub fn parse(expression: &str) -> Result<Self, ScheduleError> {
        let trimmed = expression.trim();
        if trimmed.starts_with('@') {
            return Self::parse_shortcut(trimmed);
        }

        let fields: Vec<&str> = trimmed.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(ScheduleError::InvalidCron(format!(
                "expected 5 fields, got {}",
                fields.len()
            )));
        }

        let mut days_of_week = parse_field(fields[4], DAY_OF_WEEK)?;
        if days_of_week.contains(7) {
            days_of_week.0 &= !(1 << 7);
            days_of_week.insert(0);
        }

        let expr = Self {
            minutes: parse_field(fields[0], MINUTE)?,
            hours: parse_field(fields[1], HOUR)?,
            days_of_month: parse_field(fields[2], DAY_OF_MONTH)?,
            months: parse_field(fields[3], MONTH)?,
            days_of_week,
            dom_restricted: !fields[2].starts_with('*'),
            dow_restricted: !fields[4].starts_with('*'),
        };
        expr.ensure_satisfiable()?;
        Ok(expr)
    }

    fn parse_shortcut(expression: &str) -> Result<Self, ScheduleError> {
        match expression.to_lowercase().as_str() {
            "@yearly" | "@annually" => Self::parse("0 0 1 1 *"),
            "@monthly" => Self::parse("0 0 1 * *"),
            "@weekly" => Self::parse("0 0 * * 0"),
            "@daily" | "@midnight" => Self::parse("0 0 * * *"),
            "@hourly" => Self::parse("0 * * * *"),
            _ => Err(ScheduleError::InvalidCron(format!(
                "unknown shortcut: {}",
                expression
            ))),
        }
    }

    /// Reject day-of-month restrictions that no selected month can satisfy,
    /// such as `0 0 30 2 *`.
    fn ensure_satisfiable(&self) -> Result<(), ScheduleError> {
        if !self.dom_restricted || self.dow_restricted {
            return Ok(());
        }
        let earliest_day = self.days_of_month.values().next().unwrap_or(u32::MAX);
        if self.months.values().any(|m| earliest_day <= max_days_in_month(m)) {
            Ok(())
        } else {
            Err(ScheduleError::InvalidCron(
                "day-of-month never occurs in the selected months".into(),
            ))
        }
    }

    fn matches_day(&self, date: NaiveDate) -> bool {
        let dom = self.days_of_month.contains(date.day());
        let dow = self
            .days_of_week
            .contains(date.weekday().num_days_from_sunday());
        if self.dom_restricted && self.dow_restricted {
            dom || dow
        } else {
            dom && dow
        }
    }

    /// Whether a local wall-clock minute matches this expression.
    pub fn matches(&self, local: &NaiveDateTime) -> bool {
        self.months.contains(local.month())
            && self.matches_day(local.date())
            && self.hours.contains(local.hour())
            && self.minutes.contains(local.minute())
    }

    /// First matching local minute at or after `start`, bounded by `limit`.
    fn next_local(&self, start: NaiveDateTime, limit: NaiveDateTime) -> Option<NaiveDateTime> {
        let mut t = start;
        while t <= limit {
            if !self.months.contains(t.month()) {
                t = start_of_next_month(t.date())?;
                continue;
            }
            if !self.matches_day(t.date()) {
                t = t.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.hours.contains(t.hour()) {
                t = t.date().and_hms_opt(t.hour(), 0, 0)? + Duration::hours(1);
                continue;
            }
            if !self.minutes.contains(t.minute()) {
                t += Duration::minutes(1);
                continue;
            }
            return Some(t);
        }
        None
    }
}

fn parse_field(field: &str, spec: FieldSpec) -> Result<FieldSet, ScheduleError> {
    let mut set = FieldSet(0);
    for part in field.split(',') {
        let invalid = || {
            ScheduleError::InvalidCron(format!("invalid {} field: {}", spec.name, field))
        };

        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().map_err(|_| invalid())?;
                if step == 0 {
                    return Err(invalid());
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (start, end) = if range == "*" {
            (spec.min, spec.max)
        } else if let Some((a, b)) = range.split_once('-') {
            (parse_value(a, spec)?, parse_value(b, spec)?)
        } else {
            let value = parse_value(range, spec)?;
            // `a/n` means from `a` to the end of the field.
            if step.is_some() {
                (value, spec.max)
            } else {
                (value, value)
            }
        };

        if start > end {
            return Err(invalid());
        }

        let step = step.unwrap_or(1);
        let mut value = start;
        while value <= end {
            set.insert(value);
            value += step;
        }
    }
    Ok(set)
}

fn parse_value(token: &str, spec: FieldSpec) -> Result<u32, ScheduleError> {
    let value = match token.parse::<u32>() {
        Ok(v) => v,
        Err(_) => spec
            .names
            .iter()
            .position(|name| name.eq_ignore_ascii_case(token))
            .map(|idx| idx as u32 + if spec.min == 1 { 1 } else { 0 })
            .ok_or_else(|| {
                ScheduleError::InvalidCron(format!("invalid {} value: {}", spec.name, token))
            })?,
    };
    if value < spec.min || value > spec.max {
        return Err(ScheduleError::InvalidCron(format!(
            "{} value {} out of range {}-{}",
            spec.name, value, spec.min, spec.max
        )));
    }
    Ok(value)
}

fn max_days_in_month(month: u32) -> u32 {
    match month {
        2 => 29,
        4 | 6 | 9 | 11 => 30,
        _ => 31,
    }
}

fn start_of_next_month(date: NaiveDate) -> Option<NaiveDateTime> {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)
}

/// A cron schedule bound to a timezone.
#[derive(Debug, Clone, PartialEq)]
pub struct Schedule {
    expression: String,
    timezone: Tz,
    cron: CronExpr,
}

impl Schedule {
    /// Create a new UTC schedule from a cron expression.
    pub fn new(expression: impl Into<String>) -> Result<Self, ScheduleError> {
        Self::with_timezone(expression, "UTC")
    }

    /// Create a new schedule with a specific timezone.
    pub fn with_timezone(
        expression: impl Into<String>,
        timezone: impl AsRef<str>,
    ) -> Result<Self, ScheduleError> {
        let expression = expression.into();
        let timezone = timezone.as_ref();
        let tz = Tz::from_str(timezone)
            .map_err(|_| ScheduleError::InvalidTimezone(timezone.to_string()))?;
        let cron = CronExpr::parse(&expression)?;

        Ok(Self {
            expression,
            timezone: tz,
            cron,
        })
    }

    /// Get the first fire time strictly after the given instant.
    ///
    /// Local times that do not exist (DST gaps) are skipped; ambiguous local
    /// times resolve to their earliest instant.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
        let local = after.with_timezone(&self.timezone).naive_local();
        let mut cursor = local
            .date()
            .and_hms_opt(local.hour(), local.minute(), 0)
            .ok_or(ScheduleError::NoMoreOccurrences)?
            + Duration::minutes(1);
        let limit = NaiveDate::from_ymd_opt(local.year() + MAX_SEARCH_YEARS, 1, 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .ok_or(ScheduleError::NoMoreOccurrences)?;

        loop {
            let candidate = self
                .cron
                .next_local(cursor, limit)
                .ok_or(ScheduleError::NoMoreOccurrences)?;

            let resolved = match self.timezone.from_local_datetime(&candidate) {
                LocalResult::Single(dt) => Some(dt),
                LocalResult::Ambiguous(earliest, _) => Some(earliest),
                LocalResult::None => None,
            };

            if let Some(dt) = resolved {
                let utc = dt.with_timezone(&Utc);
                if utc > after {
                    return Ok(utc);
                }
            }
            cursor = candidate + Duration::minutes(1);
        }
    }

    /// Get the next occurrence from now.
    pub fn next(&self) -> Result<DateTime<Utc>, ScheduleError> {
        self.next_after(Utc::now())
    }

    /// Get the next N occurrences after the given time.
    pub fn next_n_after(
        &self,
        after: DateTime<Utc>,
        n: usize,
    ) -> Result<Vec<DateTime<Utc>>, ScheduleError> {
        let mut results = Vec::with_capacity(n);
        let mut current = after;
        for _ in 0..n {
            current = self.next_after(current)?;
            results.push(current);
        }
        Ok(results)
    }

    /// Count fire times in `[from, until]`, stopping at `cap`.
    pub fn occurrences_between(
        &self,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
        cap: usize,
    ) -> usize {
        let mut count = 0;
        let mut current = from - Duration::seconds(1);
        while count < cap {
            match self.next_after(current) {
                Ok(next) if next <= until => {
                    count += 1;
                    current = next;
                }
                _ => break,
            }
        }
        count
    }

    /// Get the original expression string.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Get the timezone name.
    pub fn timezone(&self) -> &str {
        self.timezone.name()
    }
}
