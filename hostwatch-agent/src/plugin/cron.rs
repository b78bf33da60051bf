use chrono::{DateTime, TimeZone, Timelike};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CronError {
    #[error("invalid cron expression '{expr}': {reason}")]
    Invalid { expr: String, reason: String },
}

const WEEKDAYS: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

/// Cron expression evaluated at minute granularity.
///
/// Accepts the classic 5-field form (`min hour dom month dow`, Sunday = 0 or 7)
/// as well as the 6/7-field form with seconds (and year) understood natively by
/// the `cron` crate.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expr: String,
    schedule: cron::Schedule,
}

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        let invalid = |reason: String| CronError::Invalid {
            expr: expr.to_string(),
            reason,
        };
        let fields: Vec<&str> = expr.split_whitespace().collect();
        let normalized = match fields.len() {
            5 => {
                let weekdays = translate_weekdays(fields[4]).map_err(invalid)?;
                format!("0 {} {} {} {} {}", fields[0], fields[1], fields[2], fields[3], weekdays)
            }
            6 | 7 => fields.join(" "),
            n => return Err(invalid(format!("expected 5 to 7 fields, got {n}"))),
        };
        let schedule = cron::Schedule::from_str(&normalized).map_err(|e| invalid(e.to_string()))?;
        Ok(Self {
            expr: expr.to_string(),
            schedule,
        })
    }

    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// True when the minute containing `at` is part of the schedule.
    pub fn matches<Tz: TimeZone>(&self, at: &DateTime<Tz>) -> bool {
        self.schedule.includes(truncate_to_minute(at))
    }
}

pub fn truncate_to_minute<Tz: TimeZone>(at: &DateTime<Tz>) -> DateTime<Tz> {
    at.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or_else(|| at.clone())
}

// The cron crate numbers weekdays 1-7 from Sunday; classic cron uses 0-6 (7 = Sunday).
// Numbers are rewritten to names so both notations mean the same day.
fn translate_weekdays(field: &str) -> Result<String, String> {
    let parts = field
        .split(',')
        .map(translate_weekday_part)
        .collect::<Result<Vec<_>, String>>()?;
    Ok(parts.join(","))
}

fn translate_weekday_part(part: &str) -> Result<String, String> {
    let (range, step) = match part.split_once('/') {
        Some((range, step)) => (range, Some(step)),
        None => (part, None),
    };
    if let Some((start, end)) = range.split_once('-') {
        if let (Ok(start), Ok(7)) = (start.parse::<usize>(), end.parse::<usize>()) {
            return list_weekdays(part, start, step);
        }
    }
    let range = range
        .split('-')
        .map(weekday_name)
        .collect::<Result<Vec<_>, _>>()?
        .join("-");
    Ok(match step {
        Some(step) => format!("{range}/{step}"),
        None => range,
    })
}

// `Fri-Sun` would run backwards once 7 becomes a name, so ranges ending in 7
// are spelled out day by day.
fn list_weekdays(part: &str, start: usize, step: Option<&str>) -> Result<String, String> {
    let step = match step {
        Some(step) => step
            .parse::<usize>()
            .ok()
            .filter(|step| *step > 0)
            .ok_or_else(|| format!("invalid step in day of week '{part}'"))?,
        None => 1,
    };
    if start > 7 {
        return Err(format!("day of week {start} out of range"));
    }
    let mut days: Vec<&str> = Vec::new();
    for day in (start..=7).step_by(step) {
        let name = WEEKDAYS[day % 7];
        if !days.contains(&name) {
            days.push(name);
        }
    }
    Ok(days.join(","))
}

fn weekday_name(token: &str) -> Result<String, String> {
    match token.parse::<usize>() {
        Ok(day) if day <= 7 => Ok(WEEKDAYS[day % 7].to_string()),
        Ok(day) => Err(format!("day of week {day} out of range")),
        Err(_) => Ok(token.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn at(day: u32, hour: u32, minute: u32, second: u32) -> DateTime<Utc> {
        // January 2024: the 1st is a Monday, the 7th a Sunday
        Utc.with_ymd_and_hms(2024, 1, day, hour, minute, second).unwrap()
    }

    #[test]
    fn test_every_five_minutes() {
        let cron = CronSchedule::parse("*/5 * * * *").unwrap();
        assert!(cron.matches(&at(1, 10, 5, 0)));
        assert!(cron.matches(&at(1, 10, 0, 59)));
        assert!(!cron.matches(&at(1, 10, 7, 0)));
    }

    #[test]
    fn test_weekday_numbers_follow_classic_cron() {
        let weekdays = CronSchedule::parse("0 9 * * 1-5").unwrap();
        assert!(weekdays.matches(&at(1, 9, 0, 30)));
        assert!(!weekdays.matches(&at(7, 9, 0, 0)));

        let sunday = CronSchedule::parse("30 8 * * 0").unwrap();
        assert!(sunday.matches(&at(7, 8, 30, 0)));
        assert!(!sunday.matches(&at(1, 8, 30, 0)));

        let sunday_alias = CronSchedule::parse("30 8 * * 7").unwrap();
        assert!(sunday_alias.matches(&at(7, 8, 30, 0)));

        let weekend = CronSchedule::parse("0 9 * * 5-7").unwrap();
        assert!(weekend.matches(&at(5, 9, 0, 0)));
        assert!(weekend.matches(&at(6, 9, 0, 0)));
        assert!(weekend.matches(&at(7, 9, 0, 0)));
        assert!(!weekend.matches(&at(4, 9, 0, 0)));

        let every_day = CronSchedule::parse("0 9 * * 1-7").unwrap();
        for day in 1..=7 {
            assert!(every_day.matches(&at(day, 9, 0, 0)), "day {day}");
        }
    }

    #[test]
    fn test_seconds_form_passes_through() {
        let cron = CronSchedule::parse("0 15 10 * * *").unwrap();
        assert!(cron.matches(&at(3, 10, 15, 0)));
        assert!(!cron.matches(&at(3, 10, 16, 0)));
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(CronSchedule::parse("every minute").is_err());
        assert!(CronSchedule::parse("* * *").is_err());
        assert!(CronSchedule::parse("61 * * * *").is_err());
        assert!(CronSchedule::parse("0 0 * * 9").is_err());
    }

    #[test]
    fn test_translate_weekdays() {
        assert_eq!(translate_weekdays("*").unwrap(), "*");
        assert_eq!(translate_weekdays("0,6").unwrap(), "Sun,Sat");
        assert_eq!(translate_weekdays("1-5/2").unwrap(), "Mon-Fri/2");
        assert_eq!(translate_weekdays("*/2").unwrap(), "*/2");
        assert_eq!(translate_weekdays("Mon").unwrap(), "Mon");
        assert_eq!(translate_weekdays("5-7").unwrap(), "Fri,Sat,Sun");
        assert_eq!(translate_weekdays("1-7/2").unwrap(), "Mon,Wed,Fri,Sun");
        assert_eq!(translate_weekdays("0-7").unwrap(), "Sun,Mon,Tue,Wed,Thu,Fri,Sat");
        assert_eq!(translate_weekdays("1,6-7").unwrap(), "Mon,Sat,Sun");
        assert!(translate_weekdays("5-7/0").is_err());
    }
}
