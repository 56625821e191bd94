//! Cron utility functions for parsing trigger schedules
//!
//! Triggers accept the standard 5-field form (`minute hour dom month dow`)
//! as well as the 6/7-field form with a leading seconds field understood by
//! the `cron` crate. 5-field expressions are normalized before parsing.

use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;

use crate::errors::{AppError, AppResult};

/// Rewrite a 5-field expression into the seconds-first form
///
/// Numeric day-of-week values use the POSIX numbering (0 or 7 = Sunday) and
/// are shifted to the 1-based numbering of the `cron` crate (1 = Sunday).
/// Expressions with 6 or 7 fields are returned unchanged.
pub fn normalize_expression(expression: &str) -> String {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() != 5 {
        return fields.join(" ");
    }

    format!(
        "0 {} {} {} {} {}",
        fields[0],
        fields[1],
        fields[2],
        fields[3],
        convert_day_of_week(fields[4])
    )
}

fn convert_day_of_week(field: &str) -> String {
    field
        .split(',')
        .map(convert_day_of_week_part)
        .collect::<Vec<_>>()
        .join(",")
}

fn convert_day_of_week_part(part: &str) -> String {
    let (range, step) = match part.split_once('/') {
        Some((range, step)) => (range, Some(step)),
        None => (part, None),
    };
    let with_step = |converted: String| match step {
        Some(step) => format!("{converted}/{step}"),
        None => converted,
    };

    if let Some((start, end)) = range.split_once('-') {
        return match (start.parse::<u8>(), end.parse::<u8>()) {
            // 7 shifts to 1, which would invert the range: spell the days out instead
            (Ok(start), Ok(7)) if start <= 7 => expand_days(start, 7, step),
            (Ok(start), Ok(end)) => with_step(format!("{}-{}", shift_day(start), shift_day(end))),
            _ => part.to_string(),
        };
    }

    match range.parse::<u8>() {
        Ok(day) => with_step(shift_day(day).to_string()),
        Err(_) => part.to_string(),
    }
}

/// List the days of `start..=end` (POSIX numbering) in 1-based form, deduplicated
fn expand_days(start: u8, end: u8, step: Option<&str>) -> String {
    let step = match step {
        None => 1,
        Some(raw) => match raw.parse::<usize>() {
            Ok(step) if step > 0 => step,
            // Left for the parser to reject
            _ => return format!("{start}-{end}/{raw}"),
        },
    };

    let mut days: Vec<u8> = (start..=end).step_by(step).map(shift_day).collect();
    days.sort_unstable();
    days.dedup();
    days.iter()
        .map(u8::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

fn shift_day(day: u8) -> u8 {
    day % 7 + 1
}

/// Parse a trigger schedule, accepting 5, 6 or 7 fields
pub fn parse_schedule(expression: &str) -> AppResult<Schedule> {
    let normalized = normalize_expression(expression);
    if normalized.is_empty() {
        return Err(AppError::validation("Cron expression is empty"));
    }
    Schedule::from_str(&normalized).map_err(|e| {
        AppError::validation(format!("Invalid cron expression '{expression}': {e}"))
    })
}

/// Next firing strictly after `after`
pub fn next_after(schedule: &Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&after).next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike, Weekday};

    #[test]
    fn test_five_field_expression_gets_seconds() {
        assert_eq!(normalize_expression("0 * * * *"), "0 0 * * * *");
        assert_eq!(normalize_expression("*/15 2 * * *"), "0 */15 2 * * *");
    }

    #[test]
    fn test_six_field_expression_unchanged() {
        assert_eq!(normalize_expression("0 0 */12 * * *"), "0 0 */12 * * *");
    }

    #[test]
    fn test_day_of_week_conversion() {
        assert_eq!(normalize_expression("0 9 * * 1-5"), "0 0 9 * * 2-6");
        assert_eq!(normalize_expression("0 9 * * 0"), "0 0 9 * * 1");
        assert_eq!(normalize_expression("0 9 * * 7"), "0 0 9 * * 1");
        assert_eq!(normalize_expression("0 9 * * 5-7"), "0 0 9 * * 1,6,7");
        assert_eq!(normalize_expression("0 9 * * 0-6"), "0 0 9 * * 1-7");
        assert_eq!(normalize_expression("0 9 * * 0-7"), "0 0 9 * * 1,2,3,4,5,6,7");
        assert_eq!(normalize_expression("0 9 * * 1-7/2"), "0 0 9 * * 1,2,4,6");
        assert_eq!(normalize_expression("0 9 * * MON,WED"), "0 0 9 * * MON,WED");
        assert_eq!(normalize_expression("0 9 * * *"), "0 0 9 * * *");
    }

    #[test]
    fn test_weekday_schedule_fires_on_monday() {
        let schedule = parse_schedule("30 9 * * 1").unwrap();
        // 2026-03-01 is a Sunday
        let sunday = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let next = next_after(&schedule, sunday).unwrap();

        assert_eq!(next.weekday(), Weekday::Mon);
        assert_eq!(next.hour(), 9);
        assert_eq!(next.minute(), 30);
    }

    #[test]
    fn test_full_week_range_fires_next_day() {
        // 2026-03-02 is a Monday
        let monday = Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap();

        for expression in ["0 9 * * 0-7", "0 9 * * 0-6"] {
            let schedule = parse_schedule(expression).unwrap();
            let next = next_after(&schedule, monday).unwrap();
            assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 3, 9, 0, 0).unwrap());
            assert_eq!(next.weekday(), Weekday::Tue);
        }
    }

    #[test]
    fn test_stepped_range_ending_on_sunday() {
        // Monday, Wednesday, Friday, Sunday
        let schedule = parse_schedule("0 9 * * 1-7/2").unwrap();
        let monday = Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap();

        let weekdays: Vec<Weekday> = schedule
            .after(&monday)
            .take(4)
            .map(|at| at.weekday())
            .collect();
        assert_eq!(
            weekdays,
            vec![Weekday::Wed, Weekday::Fri, Weekday::Sun, Weekday::Mon]
        );
    }

    #[test]
    fn test_hourly_schedule_next_run() {
        let schedule = parse_schedule("0 * * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 15, 0).unwrap();
        assert_eq!(
            next_after(&schedule, now).unwrap(),
            Utc.with_ymd_and_hms(2026, 3, 1, 13, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_invalid_expressions_rejected() {
        assert!(matches!(
            parse_schedule("not a cron"),
            Err(AppError::Validation { .. })
        ));
        assert!(parse_schedule("").is_err());
        assert!(parse_schedule("61 * * * *").is_err());
    }
}
