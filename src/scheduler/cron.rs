//! Five-field cron expressions: minute hour day-of-month month day-of-week.
//!
//! Each field accepts `*`, a value, a range `a-b`, a step `*/n` or `a-b/n`,
//! and comma-separated lists of those. Day-of-week runs 0-6 from Sunday; 7 is
//! accepted as Sunday. When both day fields are restricted a day matching
//! either one fires, as in classic cron.

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};

use super::ScheduleError;

/// Upper bound on the search for the next fire time.
const MAX_LOOKAHEAD_DAYS: i64 = 366 * 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CronSchedule {
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    dom_restricted: bool,
    dow_restricted: bool,
}

fn invalid(expression: &str, message: impl Into<String>) -> ScheduleError {
    ScheduleError::InvalidCron {
        expression: expression.to_string(),
        message: message.into(),
    }
}

fn parse_field(expression: &str, field: &str, min: u32, max: u32) -> Result<u64, ScheduleError> {
    let mut bits = 0u64;
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| invalid(expression, format!("bad step in '{part}'")))?;
                if step == 0 {
                    return Err(invalid(expression, format!("zero step in '{part}'")));
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (start, end) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            let a: u32 = a
                .parse()
                .map_err(|_| invalid(expression, format!("bad range in '{part}'")))?;
            let b: u32 = b
                .parse()
                .map_err(|_| invalid(expression, format!("bad range in '{part}'")))?;
            (a, b)
        } else {
            let v: u32 = range
                .parse()
                .map_err(|_| invalid(expression, format!("bad value '{part}'")))?;
            // `5/10` means from 5 to the end in steps of 10.
            if step > 1 { (v, max) } else { (v, v) }
        };

        if start < min || end > max || start > end {
            return Err(invalid(
                expression,
                format!("'{part}' outside {min}-{max}"),
            ));
        }
        let mut v = start;
        while v <= end {
            bits |= 1 << v;
            v += step;
        }
    }
    Ok(bits)
}

impl CronSchedule {
    pub(crate) fn parse(expression: &str) -> Result<Self, ScheduleError> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        let [minute, hour, dom, month, dow] = fields[..] else {
            return Err(invalid(
                expression,
                format!("expected 5 fields, found {}", fields.len()),
            ));
        };

        let mut days_of_week = parse_field(expression, dow, 0, 7)?;
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week | 1) & !(1 << 7);
        }

        Ok(Self {
            minutes: parse_field(expression, minute, 0, 59)?,
            hours: parse_field(expression, hour, 0, 23)?,
            days_of_month: parse_field(expression, dom, 1, 31)?,
            months: parse_field(expression, month, 1, 12)?,
            days_of_week,
            dom_restricted: dom != "*",
            dow_restricted: dow != "*",
        })
    }

    fn day_matches(&self, t: &DateTime<Utc>) -> bool {
        let dom = self.days_of_month & (1 << t.day()) != 0;
        let dow = self.days_of_week & (1 << t.weekday().num_days_from_sunday()) != 0;
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }

    /// First matching minute strictly after `after`.
    pub(crate) fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = after.with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);
        let limit = start + Duration::days(MAX_LOOKAHEAD_DAYS);
        let mut t = start;

        while t < limit {
            if self.months & (1 << t.month()) == 0 {
                let (year, month) = if t.month() == 12 {
                    (t.year() + 1, 1)
                } else {
                    (t.year(), t.month() + 1)
                };
                t = Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()?;
                continue;
            }
            if !self.day_matches(&t) {
                t = (t + Duration::days(1)).with_hour(0)?.with_minute(0)?;
                continue;
            }
            if self.hours & (1 << t.hour()) == 0 {
                t = (t + Duration::hours(1)).with_minute(0)?;
                continue;
            }
            if self.minutes & (1 << t.minute()) == 0 {
                t += Duration::minutes(1);
                continue;
            }
            return Some(t);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_every_fifteen_minutes() {
        let cron = CronSchedule::parse("*/15 * * * *").unwrap();
        assert_eq!(
            cron.next_after(utc(2024, 3, 1, 10, 7)),
            Some(utc(2024, 3, 1, 10, 15))
        );
        assert_eq!(
            cron.next_after(utc(2024, 3, 1, 10, 45)),
            Some(utc(2024, 3, 1, 11, 0))
        );
    }

    #[test]
    fn test_weekdays_at_nine() {
        let cron = CronSchedule::parse("0 9 * * 1-5").unwrap();
        // 2024-03-01 is a Friday.
        assert_eq!(
            cron.next_after(utc(2024, 3, 1, 10, 0)),
            Some(utc(2024, 3, 4, 9, 0))
        );
    }

    #[test]
    fn test_month_rollover_and_lists() {
        let cron = CronSchedule::parse("30 0 1 1,7 *").unwrap();
        assert_eq!(
            cron.next_after(utc(2024, 2, 10, 0, 0)),
            Some(utc(2024, 7, 1, 0, 30))
        );
        assert_eq!(
            cron.next_after(utc(2024, 7, 1, 0, 30)),
            Some(utc(2025, 1, 1, 0, 30))
        );
    }

    #[test]
    fn test_sunday_as_seven() {
        let cron = CronSchedule::parse("0 0 * * 7").unwrap();
        // 2024-03-03 is a Sunday.
        assert_eq!(
            cron.next_after(utc(2024, 3, 1, 0, 0)),
            Some(utc(2024, 3, 3, 0, 0))
        );
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(CronSchedule::parse("61 * * * *").is_err());
        assert!(CronSchedule::parse("* * *").is_err());
        assert!(CronSchedule::parse("*/0 * * * *").is_err());
        assert!(CronSchedule::parse("5-1 * * * *").is_err());
        assert!(CronSchedule::parse("a * * * *").is_err());
    }

    #[test]
    fn test_impossible_date_has_no_next() {
        let cron = CronSchedule::parse("0 0 31 2 *").unwrap();
        assert_eq!(cron.next_after(utc(2024, 1, 1, 0, 0)), None);
    }
}
