//! Schedule expressions.
//!
//! Two forms are accepted:
//! - cron: 5 fields (`min hour dom month dow`), 6 fields (with seconds) or
//!   the full 7-field form understood by the `cron` crate;
//! - fixed interval: `every <n><unit>` with unit `s`, `m`, `h` or `d`.
//!
//! The 5-field form uses crontab day-of-week numbering (0 or 7 is Sunday,
//! 1 is Monday). The 6- and 7-field forms use the `cron` crate's numbering
//! (1 is Sunday). Day names mean the same in every form.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("schedule expression is empty")]
    Empty,

    #[error("invalid cron expression '{expression}': {reason}")]
    Cron { expression: String, reason: String },

    #[error("invalid interval '{0}': expected `every <n><s|m|h|d>` with n > 0")]
    Interval(String),
}

/// A parsed schedule. Keeps the original expression for display.
#[derive(Debug, Clone)]
pub enum TaskSchedule {
    Cron {
        expression: String,
        schedule: Box<cron::Schedule>,
    },
    Every {
        expression: String,
        interval: Duration,
    },
}

impl TaskSchedule {
    pub fn parse(expression: &str) -> Result<Self, ScheduleError> {
        let trimmed = expression.trim();
        if trimmed.is_empty() {
            return Err(ScheduleError::Empty);
        }

        if let Some(rest) = trimmed.strip_prefix("every ") {
            let interval = parse_interval(rest.trim())
                .ok_or_else(|| ScheduleError::Interval(trimmed.to_string()))?;
            return Ok(Self::Every {
                expression: trimmed.to_string(),
                interval,
            });
        }

        // The cron crate wants `sec min hour dom month dow [year]`.
        let fields: Vec<&str> = trimmed.split_whitespace().collect();
        let normalized = match fields.as_slice() {
            [min, hour, dom, month, dow] => {
                format!("0 {min} {hour} {dom} {month} {} *", crontab_day_of_week(dow))
            }
            [_, _, _, _, _, _] => format!("{trimmed} *"),
            _ => trimmed.to_string(),
        };

        let schedule = cron::Schedule::from_str(&normalized).map_err(|e| ScheduleError::Cron {
            expression: trimmed.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self::Cron {
            expression: trimmed.to_string(),
            schedule: Box::new(schedule),
        })
    }

    pub fn expression(&self) -> &str {
        match self {
            Self::Cron { expression, .. } | Self::Every { expression, .. } => expression,
        }
    }

    /// First fire time strictly after `after`.
    ///
    /// Interval schedules are anchored to `after`, so a run that overran its
    /// slot does not produce a burst of catch-up executions.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Cron { schedule, .. } => schedule.after(&after).next(),
            Self::Every { interval, .. } => after.checked_add_signed(*interval),
        }
    }
}

impl FromStr for TaskSchedule {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for TaskSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.expression())
    }
}

/// Rewrite a crontab day-of-week field (Sunday = 0 or 7) into the `cron`
/// crate's numbering (Sunday = 1). Names and wildcards pass through.
fn crontab_day_of_week(field: &str) -> String {
    field
        .split(',')
        .map(crontab_day_item)
        .collect::<Vec<_>>()
        .join(",")
}

fn crontab_day_item(item: &str) -> String {
    let (base, step) = match item.split_once('/') {
        Some((base, step)) => (base, Some(step)),
        None => (item, None),
    };
    let with_step = |base: String| match step {
        Some(step) => format!("{base}/{step}"),
        None => base,
    };

    if let Ok(day) = base.parse::<u8>() {
        return with_step(shift_day(day).map_or_else(|| base.to_string(), |d| d.to_string()));
    }

    let Some((lo, hi)) = base.split_once('-') else {
        return item.to_string();
    };
    let (Ok(lo), Ok(hi)) = (lo.parse::<u8>(), hi.parse::<u8>()) else {
        return item.to_string();
    };
    if lo > hi || hi > 7 {
        // out of range; leave it for the cron parser to reject
        return item.to_string();
    }
    if hi < 7 || lo == 0 {
        // 0-7 covers Sunday through its start
        return with_step(format!("{}-{}", lo + 1, (hi + 1).min(7)));
    }

    // `lo-7` ends on Sunday, which wraps to the front of the week
    let shifted = with_step(format!("{}-7", lo + 1));
    let step = step.and_then(|s| s.parse::<u8>().ok()).unwrap_or(1).max(1);
    if (7 - lo) % step == 0 {
        format!("{shifted},1")
    } else {
        shifted
    }
}

fn shift_day(day: u8) -> Option<u8> {
    match day {
        0 | 7 => Some(1),
        1..=6 => Some(day + 1),
        _ => None,
    }
}

fn parse_interval(raw: &str) -> Option<Duration> {
    let split = raw.find(|c: char| !c.is_ascii_digit())?;
    let (digits, unit) = raw.split_at(split);
    let n: i64 = digits.parse().ok()?;
    if n <= 0 {
        return None;
    }
    match unit {
        "s" => Duration::try_seconds(n),
        "m" => Duration::try_minutes(n),
        "h" => Duration::try_hours(n),
        "d" => Duration::try_days(n),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, m, 0).single().unwrap()
    }

    #[test]
    fn five_field_cron_is_accepted() {
        let schedule = TaskSchedule::parse("0 2 * * *").unwrap();
        assert_eq!(schedule.expression(), "0 2 * * *");
        assert_eq!(schedule.next_after(at(1, 0)), Some(at(2, 0)));
        assert_eq!(
            schedule.next_after(at(2, 0)),
            Some(Utc.with_ymd_and_hms(2024, 3, 2, 2, 0, 0).single().unwrap())
        );
    }

    #[test]
    fn six_field_cron_includes_seconds() {
        let schedule = TaskSchedule::parse("30 */15 * * * *").unwrap();
        let next = schedule.next_after(at(10, 0)).unwrap();
        assert_eq!(next, at(10, 0) + Duration::seconds(30));
    }

    #[test]
    fn interval_schedule_adds_to_reference() {
        let schedule = TaskSchedule::parse("every 15m").unwrap();
        assert_eq!(schedule.next_after(at(10, 7)), Some(at(10, 22)));

        let daily: TaskSchedule = "every 1d".parse().unwrap();
        assert_eq!(daily.next_after(at(0, 0)), Some(at(0, 0) + Duration::days(1)));
    }

    #[test]
    fn invalid_expressions_are_rejected() {
        assert_eq!(TaskSchedule::parse("   ").unwrap_err(), ScheduleError::Empty);
        assert!(matches!(
            TaskSchedule::parse("every 0s"),
            Err(ScheduleError::Interval(_))
        ));
        assert!(matches!(
            TaskSchedule::parse("every 5w"),
            Err(ScheduleError::Interval(_))
        ));
        assert!(matches!(
            TaskSchedule::parse("every m"),
            Err(ScheduleError::Interval(_))
        ));
        assert!(matches!(
            TaskSchedule::parse("61 * * * *"),
            Err(ScheduleError::Cron { .. })
        ));
        assert!(matches!(
            TaskSchedule::parse("not a schedule"),
            Err(ScheduleError::Cron { .. })
        ));
    }

    #[test]
    fn crontab_sunday_is_zero_or_seven() {
        // 2024-03-03 is a Sunday
        let sunday = Utc.with_ymd_and_hms(2024, 3, 3, 3, 0, 0).single().unwrap();
        for expression in ["0 3 * * 0", "0 3 * * 7", "0 3 * * SUN"] {
            let schedule = TaskSchedule::parse(expression).unwrap();
            assert_eq!(schedule.next_after(at(12, 0)), Some(sunday), "{expression}");
        }
    }

    #[test]
    fn crontab_weekday_range_skips_the_weekend() {
        let schedule = TaskSchedule::parse("0 9 * * 1-5").unwrap();
        let saturday = Utc.with_ymd_and_hms(2026, 10, 17, 12, 0, 0).single().unwrap();
        let monday = Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).single().unwrap();
        assert_eq!(schedule.next_after(saturday), Some(monday));

        // Friday 2024-03-01 at noon: next is Monday, not Saturday
        let next = schedule.next_after(at(12, 0)).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).single().unwrap());
    }

    #[test]
    fn crontab_day_fields_are_renumbered() {
        assert_eq!(crontab_day_of_week("*"), "*");
        assert_eq!(crontab_day_of_week("1"), "2");
        assert_eq!(crontab_day_of_week("0,6"), "1,7");
        assert_eq!(crontab_day_of_week("1-5"), "2-6");
        assert_eq!(crontab_day_of_week("0-6"), "1-7");
        assert_eq!(crontab_day_of_week("5-7"), "6-7,1");
        assert_eq!(crontab_day_of_week("1-7/2"), "2-7/2,1");
        assert_eq!(crontab_day_of_week("2-7/2"), "3-7/2");
        assert_eq!(crontab_day_of_week("*/2"), "*/2");
        assert_eq!(crontab_day_of_week("MON-FRI"), "MON-FRI");
        assert_eq!(crontab_day_of_week("9"), "9");
    }

    #[test]
    fn six_field_cron_keeps_native_day_numbers() {
        // cron-crate numbering: 1 is Sunday
        let schedule = TaskSchedule::parse("0 0 3 * * 1").unwrap();
        let sunday = Utc.with_ymd_and_hms(2024, 3, 3, 3, 0, 0).single().unwrap();
        assert_eq!(schedule.next_after(at(12, 0)), Some(sunday));
    }
}
