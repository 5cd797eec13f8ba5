use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, Timelike, Utc};

use crate::{MonoopsError, MonoopsResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Upper bound on search steps, enough to cross several leap years.
const MAX_SEARCH_STEPS: usize = 100_000;

const MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];

const DAY_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A parsed five-field cron expression, evaluated in UTC.
///
/// Fields are minute, hour, day of month, month and day of week. Each accepts `*`, numbers,
/// ranges (`1-5`), lists (`1,15`) and steps (`*/10`, `0-30/5`). Months and weekdays also accept
/// three-letter names, and `@hourly`, `@daily`, `@weekly`, `@monthly` and `@yearly` are
/// recognised. As in classic cron, when both day fields are restricted a day matching either one
/// fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    minutes: [bool; 60],
    hours: [bool; 24],
    days_of_month: [bool; 32],
    months: [bool; 13],
    days_of_week: [bool; 7],
    day_of_month_restricted: bool,
    day_of_week_restricted: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl CronSchedule {
    /// Parses an expression.
    pub fn parse(expression: &str) -> MonoopsResult<Self> {
        let invalid = |reason: String| MonoopsError::InvalidCronExpression {
            expression: expression.to_string(),
            reason,
        };

        let expanded = match expression.trim() {
            "@yearly" | "@annually" => "0 0 1 1 *",
            "@monthly" => "0 0 1 * *",
            "@weekly" => "0 0 * * 0",
            "@daily" | "@midnight" => "0 0 * * *",
            "@hourly" => "0 * * * *",
            other => other,
        };

        let fields: Vec<&str> = expanded.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(invalid(format!("expected 5 fields, found {}", fields.len())));
        }

        let mut minutes = [false; 60];
        let mut hours = [false; 24];
        let mut days_of_month = [false; 32];
        let mut months = [false; 13];
        let mut dow = [false; 8];

        parse_field(fields[0], 0, 59, &[], &mut minutes).map_err(&invalid)?;
        parse_field(fields[1], 0, 23, &[], &mut hours).map_err(&invalid)?;
        parse_field(fields[2], 1, 31, &[], &mut days_of_month).map_err(&invalid)?;
        parse_field(fields[3], 1, 12, &MONTH_NAMES, &mut months).map_err(&invalid)?;
        parse_field(fields[4], 0, 7, &DAY_NAMES, &mut dow).map_err(&invalid)?;

        // 7 is another name for Sunday.
        let mut days_of_week = [false; 7];
        days_of_week.copy_from_slice(&dow[..7]);
        days_of_week[0] |= dow[7];

        Ok(Self {
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            day_of_month_restricted: !fields[2].starts_with('*'),
            day_of_week_restricted: !fields[4].starts_with('*'),
        })
    }

    /// The first trigger time strictly after `after`, or `None` if the expression never fires
    /// (e.g. `0 0 30 2 *`).
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = after.naive_utc().with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);
        let mut t = start;

        for _ in 0..MAX_SEARCH_STEPS {
            if !self.months[t.month() as usize] {
                let (year, month) = if t.month() == 12 {
                    (t.year() + 1, 1)
                } else {
                    (t.year(), t.month() + 1)
                };
                t = NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)?;
                continue;
            }

            if !self.day_matches(&t) {
                t = (t.date() + Duration::days(1)).and_hms_opt(0, 0, 0)?;
                continue;
            }

            if !self.hours[t.hour() as usize] {
                t = t.with_minute(0)? + Duration::hours(1);
                continue;
            }

            if !self.minutes[t.minute() as usize] {
                t += Duration::minutes(1);
                continue;
            }

            return Some(t.and_utc());
        }

        None
    }

    fn day_matches(&self, t: &NaiveDateTime) -> bool {
        let dom = self.days_of_month[t.day() as usize];
        let dow = self.days_of_week[t.weekday().num_days_from_sunday() as usize];
        match (self.day_of_month_restricted, self.day_of_week_restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn parse_field(
    field: &str,
    min: u32,
    max: u32,
    names: &[&str],
    slots: &mut [bool],
) -> Result<(), String> {
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid step '{}'", step))?;
                if step == 0 {
                    return Err("step must be positive".to_string());
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (start, end) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            (value(a, min, max, names)?, value(b, min, max, names)?)
        } else {
            let start = value(range, min, max, names)?;
            // `5/15` runs from 5 to the end of the field.
            (start, if part.contains('/') { max } else { start })
        };

        if start > end {
            return Err(format!("range {}-{} is reversed", start, end));
        }

        for v in (start..=end).step_by(step as usize) {
            slots[v as usize] = true;
        }
    }
    Ok(())
}

fn value(token: &str, min: u32, max: u32, names: &[&str]) -> Result<u32, String> {
    let lower = token.to_ascii_lowercase();
    let parsed = match names.iter().position(|n| *n == lower) {
        // Month names start at 1, weekday names at 0.
        Some(i) => i as u32 + min,
        None => u32::from_str(token).map_err(|_| format!("invalid value '{}'", token))?,
    };
    if parsed < min || parsed > max {
        return Err(format!("{} is outside {}-{}", parsed, min, max));
    }
    Ok(parsed)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl FromStr for CronSchedule {
    type Err = MonoopsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn test_every_fifteen_minutes() -> anyhow::Result<()> {
        let schedule = CronSchedule::parse("*/15 * * * *")?;
        assert_eq!(schedule.next_after(at(2024, 1, 1, 10, 7)), Some(at(2024, 1, 1, 10, 15)));
        assert_eq!(schedule.next_after(at(2024, 1, 1, 10, 45)), Some(at(2024, 1, 1, 11, 0)));
        Ok(())
    }

    #[test]
    fn test_daily_rolls_over_month_and_year() -> anyhow::Result<()> {
        let schedule = CronSchedule::parse("30 2 * * *")?;
        assert_eq!(schedule.next_after(at(2024, 12, 31, 3, 0)), Some(at(2025, 1, 1, 2, 30)));
        assert_eq!(schedule.next_after(at(2024, 12, 31, 2, 29)), Some(at(2024, 12, 31, 2, 30)));
        Ok(())
    }

    #[test]
    fn test_named_weekdays_and_months() -> anyhow::Result<()> {
        // 2024-03-01 is a Friday.
        let schedule = CronSchedule::parse("0 9 * mar-apr mon-fri")?;
        assert_eq!(schedule.next_after(at(2024, 3, 1, 10, 0)), Some(at(2024, 3, 4, 9, 0)));

        let sunday = CronSchedule::parse("0 0 * * 7")?;
        assert_eq!(sunday.next_after(at(2024, 3, 1, 0, 0)), Some(at(2024, 3, 3, 0, 0)));
        Ok(())
    }

    #[test]
    fn test_restricted_day_fields_are_ored() -> anyhow::Result<()> {
        // The 15th, or any Monday.
        let schedule = CronSchedule::parse("0 0 15 * 1")?;
        assert_eq!(schedule.next_after(at(2024, 3, 1, 0, 0)), Some(at(2024, 3, 4, 0, 0)));
        assert_eq!(schedule.next_after(at(2024, 3, 12, 0, 0)), Some(at(2024, 3, 15, 0, 0)));
        Ok(())
    }

    #[test]
    fn test_leap_day_and_impossible_dates() -> anyhow::Result<()> {
        let leap = CronSchedule::parse("0 0 29 2 *")?;
        assert_eq!(leap.next_after(at(2025, 1, 1, 0, 0)), Some(at(2028, 2, 29, 0, 0)));

        let never = CronSchedule::parse("0 0 30 2 *")?;
        assert_eq!(never.next_after(at(2025, 1, 1, 0, 0)), None);
        Ok(())
    }

    #[test]
    fn test_macros() -> anyhow::Result<()> {
        assert_eq!(CronSchedule::parse("@daily")?, CronSchedule::parse("0 0 * * *")?);
        assert_eq!(CronSchedule::parse("@hourly")?, CronSchedule::parse("0 * * * *")?);
        Ok(())
    }

    #[test]
    fn test_rejects_malformed_expressions() {
        for expression in ["* * * *", "60 * * * *", "*/0 * * * *", "5-1 * * * *", "a * * * *"] {
            assert!(
                matches!(
                    CronSchedule::parse(expression),
                    Err(MonoopsError::InvalidCronExpression { .. })
                ),
                "{}",
                expression
            );
        }
    }
}
