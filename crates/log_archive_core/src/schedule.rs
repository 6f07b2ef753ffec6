//! Recurring schedule evaluation and the Trigger that turns a firing into a
//! run request.
//!
//! Expressions follow the `cron(...)` / `rate(...)` forms used by managed
//! schedulers and are evaluated in a fixed UTC offset. Fire times are always
//! derived from wall-clock time, so a late or slow firing never shifts the
//! instants that follow it.

use std::str::FromStr;
use std::time::Duration as StdDuration;

use chrono::{
    DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc,
};

use crate::contract::{RunRequest, ValidationError};

pub const DEFAULT_SCHEDULE_EXPRESSION: &str = "cron(0 * * * ? *)";
pub const DEFAULT_UTC_OFFSET: &str = "+09:00";
pub const MAX_SCHEDULE_YEAR: i32 = 2199;
pub const DEFAULT_MAX_EVENT_AGE: StdDuration = StdDuration::from_secs(60);
pub const DEFAULT_RETRY_DELAY: StdDuration = StdDuration::from_secs(1);

const MONTH_NAMES: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const WEEKDAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

#[derive(Debug, Clone, PartialEq, Eq)]
struct FieldSet {
    min: u32,
    allowed: Vec<bool>,
}

impl FieldSet {
    fn contains(&self, value: u32) -> bool {
        value
            .checked_sub(self.min)
            .and_then(|offset| self.allowed.get(offset as usize))
            .copied()
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    minutes: FieldSet,
    hours: FieldSet,
    days_of_month: Option<FieldSet>,
    months: FieldSet,
    days_of_week: Option<FieldSet>,
    years: FieldSet,
}

impl CronSchedule {
    fn parse(body: &str) -> Result<Self, ValidationError> {
        let fields = body.split_whitespace().collect::<Vec<_>>();
        let [minutes, hours, days_of_month, months, days_of_week, years] = fields.as_slice() else {
            return Err(ValidationError::new(format!(
                "cron expression needs 6 fields, got {}",
                fields.len()
            )));
        };

        let days_of_month = parse_day_field(days_of_month, 1, 31, &[])?;
        let days_of_week = parse_day_field(days_of_week, 1, 7, &WEEKDAY_NAMES)?;
        if days_of_month.is_some() == days_of_week.is_some() {
            return Err(ValidationError::new(
                "exactly one of day-of-month and day-of-week must be '?'",
            ));
        }

        Ok(Self {
            minutes: parse_field(minutes, 0, 59, &[])?,
            hours: parse_field(hours, 0, 23, &[])?,
            days_of_month,
            months: parse_field(months, 1, 12, &MONTH_NAMES)?,
            days_of_week,
            years: parse_field(years, 1970, MAX_SCHEDULE_YEAR as u32, &[])?,
        })
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        match (&self.days_of_month, &self.days_of_week) {
            (Some(days), _) => days.contains(date.day()),
            (None, Some(weekdays)) => weekdays.contains(date.weekday().number_from_sunday()),
            (None, None) => true,
        }
    }

    fn next_local_after(&self, local: NaiveDateTime) -> Option<NaiveDateTime> {
        let mut candidate = local.with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);

        loop {
            let year = candidate.year();
            if year > MAX_SCHEDULE_YEAR {
                return None;
            }
            if !self.years.contains(year as u32) {
                candidate = NaiveDate::from_ymd_opt(year + 1, 1, 1)?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.months.contains(candidate.month()) {
                candidate = first_of_next_month(candidate.date())?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.day_matches(candidate.date()) {
                candidate = candidate.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.hours.contains(candidate.hour()) {
                candidate = candidate.with_minute(0)? + Duration::hours(1);
                continue;
            }
            if !self.minutes.contains(candidate.minute()) {
                candidate += Duration::minutes(1);
                continue;
            }
            return Some(candidate);
        }
    }
}

fn first_of_next_month(date: NaiveDate) -> Option<NaiveDate> {
    if date.month() == 12 {
        NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(date.year(), date.month() + 1, 1)
    }
}

fn parse_day_field(
    text: &str,
    min: u32,
    max: u32,
    names: &[&str],
) -> Result<Option<FieldSet>, ValidationError> {
    if text == "?" {
        return Ok(None);
    }
    parse_field(text, min, max, names).map(Some)
}

fn parse_field(
    text: &str,
    min: u32,
    max: u32,
    names: &[&str],
) -> Result<FieldSet, ValidationError> {
    let mut allowed = vec![false; (max - min + 1) as usize];

    for element in text.split(',') {
        let (range, step) = match element.split_once('/') {
            Some((range, step)) => {
                let step = step
                    .parse::<u32>()
                    .ok()
                    .filter(|step| *step > 0)
                    .ok_or_else(|| ValidationError::new(format!("invalid step in '{element}'")))?;
                (range, Some(step))
            }
            None => (element, None),
        };

        let (start, end) = if range == "*" {
            (min, max)
        } else if let Some((start, end)) = range.split_once('-') {
            (
                parse_value(start, min, max, names)?,
                parse_value(end, min, max, names)?,
            )
        } else {
            let start = parse_value(range, min, max, names)?;
            // `a/n` runs from `a` to the end of the field.
            (start, if step.is_some() { max } else { start })
        };

        if start > end {
            return Err(ValidationError::new(format!(
                "range '{element}' runs backwards"
            )));
        }

        let step = step.unwrap_or(1) as usize;
        for value in (start..=end).step_by(step) {
            allowed[(value - min) as usize] = true;
        }
    }

    Ok(FieldSet { min, allowed })
}

fn parse_value(text: &str, min: u32, max: u32, names: &[&str]) -> Result<u32, ValidationError> {
    let upper = text.to_ascii_uppercase();
    let value = match names.iter().position(|name| *name == upper) {
        Some(index) => min + index as u32,
        None => text.parse::<u32>().map_err(|_| {
            ValidationError::new(format!("unsupported schedule field value '{text}'"))
        })?,
    };

    if value < min || value > max {
        return Err(ValidationError::new(format!(
            "value {value} is outside {min}-{max}"
        )));
    }
    Ok(value)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ScheduleKind {
    Cron(CronSchedule),
    Rate(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleExpression {
    source: String,
    kind: ScheduleKind,
}

impl ScheduleExpression {
    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl std::fmt::Display for ScheduleExpression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.source)
    }
}

impl FromStr for ScheduleExpression {
    type Err = ValidationError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let source = text.trim().to_string();
        let kind = if let Some(body) = strip_call(&source, "cron") {
            ScheduleKind::Cron(CronSchedule::parse(body)?)
        } else if let Some(body) = strip_call(&source, "rate") {
            ScheduleKind::Rate(parse_rate(body)?)
        } else {
            return Err(ValidationError::new(format!(
                "schedule expression must be cron(...) or rate(...), got '{source}'"
            )));
        };

        Ok(Self { source, kind })
    }
}

fn strip_call<'a>(text: &'a str, name: &str) -> Option<&'a str> {
    text.strip_prefix(name)?
        .trim_start()
        .strip_prefix('(')?
        .strip_suffix(')')
        .map(str::trim)
}

fn parse_rate(body: &str) -> Result<Duration, ValidationError> {
    let Some((value, unit)) = body.split_once(char::is_whitespace) else {
        return Err(ValidationError::new(format!(
            "rate expression needs a value and a unit, got '{body}'"
        )));
    };
    let value = value
        .parse::<i64>()
        .ok()
        .filter(|value| *value > 0)
        .ok_or_else(|| ValidationError::new("rate value must be a positive integer"))?;

    let period = match unit.trim() {
        "minute" | "minutes" => Duration::try_minutes(value),
        "hour" | "hours" => Duration::try_hours(value),
        "day" | "days" => Duration::try_days(value),
        other => return Err(ValidationError::new(format!("unsupported rate unit '{other}'"))),
    };
    period.ok_or_else(|| ValidationError::new("rate value is too large"))
}

pub fn parse_utc_offset(text: &str) -> Result<FixedOffset, ValidationError> {
    let text = text.trim();
    if text.eq_ignore_ascii_case("z") || text.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0).ok_or_else(|| ValidationError::new("invalid offset"));
    }

    let invalid =
        || ValidationError::new(format!("UTC offset must look like +09:00, got '{text}'"));
    let (sign, rest) = match text.as_bytes().first() {
        Some(b'+') => (1, &text[1..]),
        Some(b'-') => (-1, &text[1..]),
        _ => return Err(invalid()),
    };
    let (hours, minutes) = rest.split_once(':').unwrap_or((rest, "0"));
    let hours = hours.parse::<i32>().map_err(|_| invalid())?;
    let minutes = minutes.parse::<i32>().map_err(|_| invalid())?;
    if !(0..=23).contains(&hours) || !(0..=59).contains(&minutes) {
        return Err(invalid());
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(invalid)
}

/// A schedule expression bound to the fixed timezone it is evaluated in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    expression: ScheduleExpression,
    offset: FixedOffset,
}

impl Schedule {
    pub fn new(expression: ScheduleExpression, offset: FixedOffset) -> Self {
        Self { expression, offset }
    }

    pub fn parse(expression: &str, utc_offset: &str) -> Result<Self, ValidationError> {
        Ok(Self::new(expression.parse()?, parse_utc_offset(utc_offset)?))
    }

    pub fn expression(&self) -> &ScheduleExpression {
        &self.expression
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// First fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match &self.expression.kind {
            ScheduleKind::Cron(cron) => {
                let local = after.with_timezone(&self.offset).naive_local();
                let next = cron.next_local_after(local)?;
                self.offset
                    .from_local_datetime(&next)
                    .single()
                    .map(|instant| instant.with_timezone(&Utc))
            }
            ScheduleKind::Rate(period) => {
                // Multiples of the period counted from the epoch in local time,
                // so daily rates land on local midnight.
                let period = period.num_seconds();
                let local_seconds = after.timestamp() + i64::from(self.offset.local_minus_utc());
                let next_local = (local_seconds.div_euclid(period) + 1).checked_mul(period)?;
                DateTime::from_timestamp(next_local - i64::from(self.offset.local_minus_utc()), 0)
            }
        }
    }
}

/// Produces the run request for each firing. Holds no state beyond the
/// request template and performs no discovery or upload itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    template: RunRequest,
}

impl Trigger {
    pub fn new(template: RunRequest) -> Self {
        Self { template }
    }

    pub fn fire(&self) -> RunRequest {
        self.template.clone()
    }
}

/// Delivery policy for a fired request: at most one retry, abandoned once the
/// event is older than `max_event_age`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchPolicy {
    max_retry_attempts: u8,
    max_event_age: StdDuration,
    retry_delay: StdDuration,
}

impl DispatchPolicy {
    pub fn new(
        max_retry_attempts: u8,
        max_event_age: StdDuration,
        retry_delay: StdDuration,
    ) -> Result<Self, ValidationError> {
        if max_retry_attempts > 1 {
            return Err(ValidationError::new(
                "dispatch retry attempts must be 0 or 1",
            ));
        }
        if max_event_age.is_zero() {
            return Err(ValidationError::new(
                "dispatch max event age must be positive",
            ));
        }

        Ok(Self {
            max_retry_attempts,
            max_event_age,
            retry_delay,
        })
    }

    pub fn max_attempts(&self) -> u32 {
        1 + u32::from(self.max_retry_attempts)
    }

    pub fn max_event_age(&self) -> StdDuration {
        self.max_event_age
    }

    pub fn retry_delay(&self) -> StdDuration {
        self.retry_delay
    }

    /// Whether another attempt may start given the event's current age.
    pub fn allows_retry(&self, attempts_made: u32, event_age: StdDuration) -> bool {
        attempts_made < self.max_attempts()
            && event_age.saturating_add(self.retry_delay) < self.max_event_age
    }
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            max_retry_attempts: 0,
            max_event_age: DEFAULT_MAX_EVENT_AGE,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(year: i32, month: u32, day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, month, day, hour, minute, 0)
            .single()
            .expect("valid timestamp")
    }

    fn upcoming(schedule: &Schedule, after: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        let mut fires = Vec::with_capacity(count);
        let mut cursor = after;
        while fires.len() < count {
            let Some(next) = schedule.next_after(cursor) else {
                break;
            };
            fires.push(next);
            cursor = next;
        }
        fires
    }

    fn tokyo(expression: &str) -> Schedule {
        Schedule::parse(expression, "+09:00").expect("schedule should parse")
    }

    #[test]
    fn hourly_cron_fires_on_the_hour() {
        let schedule = tokyo(DEFAULT_SCHEDULE_EXPRESSION);

        assert_eq!(
            schedule.next_after(utc(2026, 10, 19, 3, 17)),
            Some(utc(2026, 10, 19, 4, 0))
        );
        assert_eq!(
            schedule.next_after(utc(2026, 10, 19, 4, 0)),
            Some(utc(2026, 10, 19, 5, 0))
        );
    }

    #[test]
    fn cron_is_evaluated_in_the_fixed_offset() {
        // 02:30 every day in +09:00 is 17:30 UTC the previous day.
        let schedule = tokyo("cron(30 2 * * ? *)");

        assert_eq!(
            schedule.next_after(utc(2026, 10, 19, 0, 0)),
            Some(utc(2026, 10, 19, 17, 30))
        );
    }

    #[test]
    fn cron_supports_steps_lists_and_names() {
        let schedule = tokyo("cron(0/20 9-10 ? JAN,OCT MON-FRI 2026)");
        let fires = upcoming(&schedule, utc(2026, 10, 16, 23, 0), 4);

        // 2026-10-17 and 18 are a weekend in +09:00; Monday the 19th follows.
        assert_eq!(
            fires,
            vec![
                utc(2026, 10, 19, 0, 0),
                utc(2026, 10, 19, 0, 20),
                utc(2026, 10, 19, 0, 40),
                utc(2026, 10, 19, 1, 0),
            ]
        );
    }

    #[test]
    fn cron_rolls_over_month_and_year() {
        let schedule = Schedule::parse("cron(15 0 1 * ? *)", "+00:00").expect("should parse");

        assert_eq!(
            schedule.next_after(utc(2026, 12, 1, 0, 15)),
            Some(utc(2027, 1, 1, 0, 15))
        );
    }

    #[test]
    fn cron_without_future_fire_returns_none() {
        let schedule = Schedule::parse("cron(0 0 1 1 ? 2020)", "Z").expect("should parse");
        assert_eq!(schedule.next_after(utc(2026, 1, 1, 0, 0)), None);
    }

    #[test]
    fn rejects_invalid_cron_expressions() {
        for expression in [
            "cron(0 * * * *)",
            "cron(0 * * * * *)",
            "cron(0 * ? * ? *)",
            "cron(60 * * * ? *)",
            "cron(0 * L * ? *)",
            "cron(0/0 * * * ? *)",
            "cron(30-10 * * * ? *)",
            "every hour",
            "rate(0 minutes)",
            "rate(9999999999999 days)",
            "rate(999999999999999 minutes)",
        ] {
            assert!(
                expression.parse::<ScheduleExpression>().is_err(),
                "{expression} should be rejected"
            );
        }
    }

    #[test]
    fn oversized_rate_is_rejected_not_overflowed() {
        let error = "rate(9999999999999 days)"
            .parse::<ScheduleExpression>()
            .expect_err("rate should be rejected");
        assert!(error.to_string().contains("too large"));
    }

    #[test]
    fn rate_fires_on_epoch_aligned_multiples() {
        let schedule = Schedule::parse("rate(15 minutes)", "+09:00").expect("should parse");

        assert_eq!(
            schedule.next_after(utc(2026, 10, 19, 3, 7)),
            Some(utc(2026, 10, 19, 3, 15))
        );
        assert_eq!(
            schedule.next_after(utc(2026, 10, 19, 3, 15)),
            Some(utc(2026, 10, 19, 3, 30))
        );
    }

    #[test]
    fn daily_rate_lands_on_local_midnight() {
        let schedule = Schedule::parse("rate(1 day)", "+09:00").expect("should parse");
        assert_eq!(
            schedule.next_after(utc(2026, 10, 19, 3, 0)),
            Some(utc(2026, 10, 19, 15, 0))
        );
    }

    #[test]
    fn fire_times_do_not_drift_after_late_evaluation() {
        let schedule = tokyo("rate(30 minutes)");

        // Evaluating 29 minutes late still yields the next aligned slot.
        let on_time = schedule.next_after(utc(2026, 10, 19, 3, 0));
        let late = schedule.next_after(utc(2026, 10, 19, 3, 29));
        assert_eq!(on_time, late);
    }

    #[test]
    fn parses_offsets() {
        assert_eq!(parse_utc_offset("+09:00").expect("ok").local_minus_utc(), 9 * 3600);
        assert_eq!(parse_utc_offset("-05:30").expect("ok").local_minus_utc(), -(5 * 3600 + 1800));
        assert_eq!(parse_utc_offset("UTC").expect("ok").local_minus_utc(), 0);
        assert!(parse_utc_offset("Asia/Tokyo").is_err());
        assert!(parse_utc_offset("+25:00").is_err());
    }

    #[test]
    fn trigger_fires_its_template() {
        let request = RunRequest::new("database-1", "archive-bucket", 30).expect("valid request");
        let trigger = Trigger::new(request.clone());

        assert_eq!(trigger.fire(), request);
        assert_eq!(trigger.fire(), trigger.fire());
    }

    #[test]
    fn dispatch_policy_bounds_retries_and_staleness() {
        let policy = DispatchPolicy::new(1, StdDuration::from_secs(60), StdDuration::from_secs(1))
            .expect("policy should be valid");

        assert_eq!(policy.max_attempts(), 2);
        assert!(policy.allows_retry(1, StdDuration::from_secs(10)));
        assert!(!policy.allows_retry(1, StdDuration::from_secs(59)));
        assert!(!policy.allows_retry(2, StdDuration::ZERO));

        assert!(DispatchPolicy::new(2, StdDuration::from_secs(60), StdDuration::ZERO).is_err());
        assert!(DispatchPolicy::new(0, StdDuration::ZERO, StdDuration::ZERO).is_err());
        assert!(!DispatchPolicy::default().allows_retry(1, StdDuration::ZERO));
    }
}
