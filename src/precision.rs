//! # Event Date Precision
//!
//! Maps an arbitrary timestamp onto the start of the bucket it belongs to.
//! Truncation happens in calendar terms (start of hour, day, week, month or
//! year), so the result depends on the time zone the calendar is read in.

use crate::error::{MetricError, Result};
use chrono::{Datelike, Days, Duration, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Bucketing granularity of a series.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventDatePrecision {
    Hour,
    Day,
    /// Weeks starting on Monday.
    Week,
    WeekSunday,
    WeekMonday,
    Month,
    Year,
    /// Everything lands in the single bucket at epoch 0.
    #[default]
    None,
}

impl EventDatePrecision {
    pub const ALL: [EventDatePrecision; 8] = [
        EventDatePrecision::Hour,
        EventDatePrecision::Day,
        EventDatePrecision::Week,
        EventDatePrecision::WeekSunday,
        EventDatePrecision::WeekMonday,
        EventDatePrecision::Month,
        EventDatePrecision::Year,
        EventDatePrecision::None,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventDatePrecision::Hour => "HOUR",
            EventDatePrecision::Day => "DAY",
            EventDatePrecision::Week => "WEEK",
            EventDatePrecision::WeekSunday => "WEEK_SUNDAY",
            EventDatePrecision::WeekMonday => "WEEK_MONDAY",
            EventDatePrecision::Month => "MONTH",
            EventDatePrecision::Year => "YEAR",
            EventDatePrecision::None => "NONE",
        }
    }

    /// Truncate `millis` to the start of its bucket in the given zone.
    pub fn truncate_in<Tz: TimeZone>(self, millis: i64, tz: &Tz) -> Result<i64> {
        let local = tz
            .timestamp_millis_opt(millis)
            .single()
            .ok_or(MetricError::InvalidTimestamp(millis))?
            .naive_local();
        let date = local.date();
        let invalid = || MetricError::InvalidTimestamp(millis);

        let start: NaiveDateTime = match self {
            EventDatePrecision::None => return Ok(0),
            EventDatePrecision::Hour => date
                .and_hms_opt(local.hour(), 0, 0)
                .ok_or_else(invalid)?,
            EventDatePrecision::Day => start_of_day(date),
            EventDatePrecision::Week | EventDatePrecision::WeekMonday => {
                let back = date.weekday().num_days_from_monday() as u64;
                start_of_day(date.checked_sub_days(Days::new(back)).ok_or_else(invalid)?)
            }
            EventDatePrecision::WeekSunday => {
                let back = date.weekday().num_days_from_sunday() as u64;
                start_of_day(date.checked_sub_days(Days::new(back)).ok_or_else(invalid)?)
            }
            EventDatePrecision::Month => start_of_day(date.with_day(1).ok_or_else(invalid)?),
            EventDatePrecision::Year => {
                start_of_day(NaiveDate::from_ymd_opt(date.year(), 1, 1).ok_or_else(invalid)?)
            }
        };

        // Ambiguous local times take the earlier instant; times inside a DST
        // gap move forward past it.
        let resolved = tz
            .from_local_datetime(&start)
            .earliest()
            .or_else(|| tz.from_local_datetime(&(start + Duration::hours(1))).earliest())
            .ok_or_else(invalid)?;
        Ok(resolved.timestamp_millis())
    }
}

fn start_of_day(date: NaiveDate) -> NaiveDateTime {
    date.and_time(chrono::NaiveTime::MIN)
}

impl fmt::Display for EventDatePrecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventDatePrecision {
    type Err = MetricError;

    fn from_str(s: &str) -> Result<Self> {
        let upper = s.trim().to_ascii_uppercase();
        EventDatePrecision::ALL
            .into_iter()
            .find(|p| p.as_str() == upper)
            .ok_or_else(|| MetricError::Config(format!("unknown event date precision {:?}", s)))
    }
}

/// Calendar used to interpret bucket boundaries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Calendar {
    /// The writer's local time zone.
    #[default]
    Local,
    Utc,
    /// A fixed offset east of UTC, in seconds.
    Offset { seconds: i32 },
}

impl Calendar {
    pub fn truncate(&self, precision: EventDatePrecision, millis: i64) -> Result<i64> {
        match *self {
            Calendar::Local => precision.truncate_in(millis, &chrono::Local),
            Calendar::Utc => precision.truncate_in(millis, &chrono::Utc),
            Calendar::Offset { seconds } => {
                let offset = FixedOffset::east_opt(seconds).ok_or_else(|| {
                    MetricError::Config(format!("utc offset {} out of range", seconds))
                })?;
                precision.truncate_in(millis, &offset)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2024-03-13T15:47:12.345Z, a Wednesday
    const WEDNESDAY: i64 = 1_710_344_832_345;

    fn utc(precision: EventDatePrecision, millis: i64) -> i64 {
        Calendar::Utc.truncate(precision, millis).unwrap()
    }

    #[test]
    fn test_hour_and_day() {
        assert_eq!(utc(EventDatePrecision::Hour, WEDNESDAY), 1_710_342_000_000);
        assert_eq!(utc(EventDatePrecision::Day, WEDNESDAY), 1_710_288_000_000);
    }

    #[test]
    fn test_weeks() {
        // Monday 2024-03-11 and Sunday 2024-03-10
        assert_eq!(utc(EventDatePrecision::Week, WEDNESDAY), 1_710_115_200_000);
        assert_eq!(utc(EventDatePrecision::WeekMonday, WEDNESDAY), 1_710_115_200_000);
        assert_eq!(utc(EventDatePrecision::WeekSunday, WEDNESDAY), 1_710_028_800_000);
    }

    #[test]
    fn test_week_on_its_first_day_stays_put() {
        let sunday = 1_710_028_800_000 + 5_000;
        assert_eq!(utc(EventDatePrecision::WeekSunday, sunday), 1_710_028_800_000);
        assert_eq!(utc(EventDatePrecision::WeekMonday, sunday), 1_709_510_400_000);
    }

    #[test]
    fn test_month_and_year() {
        assert_eq!(utc(EventDatePrecision::Month, WEDNESDAY), 1_709_251_200_000);
        assert_eq!(utc(EventDatePrecision::Year, WEDNESDAY), 1_704_067_200_000);
    }

    #[test]
    fn test_none_is_epoch() {
        assert_eq!(utc(EventDatePrecision::None, WEDNESDAY), 0);
    }

    #[test]
    fn test_truncation_is_idempotent() {
        for precision in EventDatePrecision::ALL {
            let once = utc(precision, WEDNESDAY);
            assert_eq!(utc(precision, once), once, "{}", precision);
        }
    }

    #[test]
    fn test_fixed_offset_shifts_day_boundary() {
        // 15:47Z is 00:47 on the 14th at +09:00
        let tokyo = Calendar::Offset { seconds: 9 * 3600 };
        let start = tokyo.truncate(EventDatePrecision::Day, WEDNESDAY).unwrap();
        assert_eq!(start, 1_710_342_000_000);
    }

    #[test]
    fn test_parse_and_serde_names() {
        assert_eq!("week_sunday".parse::<EventDatePrecision>().unwrap(), EventDatePrecision::WeekSunday);
        assert!("fortnight".parse::<EventDatePrecision>().is_err());
        let json = serde_json::to_string(&EventDatePrecision::WeekMonday).unwrap();
        assert_eq!(json, "\"WEEK_MONDAY\"");
    }
}
