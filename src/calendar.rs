//! Calendar arithmetic on top of the millisecond timeline.
//!
//! Everything here is pure: callers pass `now` explicitly. Recurring windows are
//! anchored on the UTC midnight of the target date; only rendering and the
//! caller-facing "today" depend on the caller's IANA zone.

use chrono::{DateTime, Datelike, Days, Months, NaiveDate, NaiveTime, Timelike, Utc};
use chrono_tz::Tz;

use crate::engine::EngineError;
use crate::model::{Ms, DAY_MS, MINUTE_MS};

/// Parse an IANA zone identifier (e.g. `"Europe/Berlin"`).
pub fn parse_timezone(name: &str) -> Result<Tz, EngineError> {
    name.parse::<Tz>()
        .map_err(|_| EngineError::InvalidTimezone(name.to_string()))
}

/// Weekday index with Sunday = 0.
pub fn week_day(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_sunday() as u8
}

/// 00:00 UTC of `date`.
pub fn utc_midnight(date: NaiveDate) -> Ms {
    date.and_time(NaiveTime::MIN).and_utc().timestamp_millis()
}

pub fn to_utc(ms: Ms) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
}

/// Calendar date of an instant in UTC.
pub fn utc_date(ms: Ms) -> Option<NaiveDate> {
    to_utc(ms).map(|dt| dt.date_naive())
}

/// `HH:MM` wall-clock rendering of an instant in `tz`.
pub fn format_hhmm(ms: Ms, tz: Tz) -> Option<String> {
    to_utc(ms).map(|dt| dt.with_timezone(&tz).format("%H:%M").to_string())
}

/// Latest instant a reservation may start at: `now + months + extra_days`,
/// using calendar months.
pub fn horizon_limit(now: Ms, months: u32, extra_days: u64) -> Option<Ms> {
    to_utc(now)?
        .checked_add_months(Months::new(months))?
        .checked_add_days(Days::new(extra_days))
        .map(|dt| dt.timestamp_millis())
}

/// Parse `HH:MM` into ms after midnight. `24:00` is accepted as end of day.
pub fn parse_time_of_day(s: &str) -> Option<Ms> {
    let s = s.trim();
    if s == "24:00" {
        return Some(DAY_MS);
    }
    let t = NaiveTime::parse_from_str(s, "%H:%M").ok()?;
    Some(t.num_seconds_from_midnight() as Ms * 1000)
}

/// Inverse of [`parse_time_of_day`].
pub fn format_time_of_day(offset: Ms) -> String {
    let minutes = offset / MINUTE_MS;
    format!("{:02}:{:02}", minutes / 60, minutes % 60)
}

pub fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok()
}
