//! Cron expression parsing and next-fire computation.
//!
//! Accepts six-field expressions with a leading seconds field and classic
//! five-field expressions, which fire at second zero. Evaluation is in UTC.

use std::{fmt, str::FromStr};

use ::cron::Schedule;
use chrono::{DateTime, Utc};

use crate::error::{DeliveryError, Result};

/// A parsed, validated cron schedule.
#[derive(Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: Schedule,
}

impl CronSchedule {
    /// Parses an expression.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::InvalidCron` if the expression does not parse.
    pub fn parse(expression: &str) -> Result<Self> {
        let expression = expression.trim();
        let normalized = normalize(expression);
        let schedule = Schedule::from_str(&normalized)
            .map_err(|e| DeliveryError::invalid_cron(expression, e.to_string()))?;

        Ok(Self { expression: expression.to_string(), schedule })
    }

    /// Returns the first fire time strictly after `reference`.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::InvalidCron` if the schedule never fires
    /// again, e.g. a fixed year in the past.
    pub fn next_after(&self, reference: DateTime<Utc>) -> Result<DateTime<Utc>> {
        self.schedule.after(&reference).next().ok_or_else(|| {
            DeliveryError::invalid_cron(&self.expression, "schedule never fires again")
        })
    }
}

impl fmt::Debug for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CronSchedule").field("expression", &self.expression).finish()
    }
}

/// Parses `expression` and computes its next fire time after `reference`.
///
/// # Errors
///
/// Returns `DeliveryError::InvalidCron` if the expression is invalid or
/// exhausted.
pub fn next_fire_after(expression: &str, reference: DateTime<Utc>) -> Result<DateTime<Utc>> {
    CronSchedule::parse(expression)?.next_after(reference)
}

fn normalize(expression: &str) -> String {
    if expression.split_whitespace().count() == 5 {
        format!("0 {expression}")
    } else {
        expression.to_string()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Timelike};

    use super::*;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, m, s).unwrap()
    }

    #[test]
    fn every_second_fires_one_second_later() {
        let schedule = CronSchedule::parse("*/1 * * * * *").unwrap();
        assert_eq!(schedule.next_after(at(10, 0, 0)).unwrap(), at(10, 0, 1));
    }

    #[test]
    fn next_is_strictly_after_reference() {
        let schedule = CronSchedule::parse("0 */5 * * * *").unwrap();
        let reference = at(10, 5, 0);

        let next = schedule.next_after(reference).unwrap();

        assert!(next > reference);
        assert_eq!(next, at(10, 10, 0));
    }

    #[test]
    fn sub_second_reference_rounds_up() {
        let schedule = CronSchedule::parse("* * * * * *").unwrap();
        let reference = at(10, 0, 0) + Duration::milliseconds(400);

        assert_eq!(schedule.next_after(reference).unwrap(), at(10, 0, 1));
    }

    #[test]
    fn five_field_expressions_fire_on_the_minute() {
        let schedule = CronSchedule::parse("*/15 * * * *").unwrap();
        let next = schedule.next_after(at(10, 7, 30)).unwrap();

        assert_eq!(next, at(10, 15, 0));
        assert_eq!(next.second(), 0);
    }

    #[test]
    fn repeated_evaluation_is_stable() {
        let schedule = CronSchedule::parse("0 0 * * * *").unwrap();
        let reference = at(10, 30, 0);

        let first = schedule.next_after(reference).unwrap();
        assert_eq!(schedule.next_after(reference).unwrap(), first);
    }

    #[test]
    fn garbage_is_invalid() {
        let err = CronSchedule::parse("hello world").unwrap_err();
        assert!(matches!(err, DeliveryError::InvalidCron { .. }));
        assert!(err.to_string().contains("hello world"));
    }

    #[test]
    fn out_of_range_field_is_invalid() {
        assert!(CronSchedule::parse("0 61 * * * *").is_err());
    }

    #[test]
    fn past_year_never_fires() {
        let err = next_fire_after("0 0 0 1 1 * 2001", at(0, 0, 0)).unwrap_err();
        assert!(matches!(err, DeliveryError::InvalidCron { .. }));
    }
}
