use std::ops::{Add, Sub};

use chrono::{DateTime, NaiveDate, NaiveTime, TimeDelta, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub const SECONDS_PER_DAY: u32 = 24 * 60 * 60;

/// Seconds since the reference midnight of a service day.
///
/// GTFS allows values past `24:00:00` for trips that run after midnight but
/// belong to the previous service day, so this is not a wall-clock time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Time(u32);

impl From<u32> for Time {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<NaiveTime> for Time {
    fn from(value: NaiveTime) -> Self {
        Self(value.num_seconds_from_midnight())
    }
}

impl Add<u32> for Time {
    type Output = Self;

    fn add(self, rhs: u32) -> Self::Output {
        Self(self.0.saturating_add(rhs))
    }
}

impl Sub<Time> for Time {
    type Output = i64;

    fn sub(self, rhs: Self) -> Self::Output {
        i64::from(self.0) - i64::from(rhs.0)
    }
}

impl Time {
    pub const MIDNIGHT: Time = Time(0);

    pub const fn from_seconds(secs: u32) -> Self {
        Self(secs)
    }

    /// Saturates instead of overflowing on out of range parts.
    pub const fn from_hms_parts(hours: u32, minutes: u32, seconds: u32) -> Self {
        Self(
            hours
                .saturating_mul(3600)
                .saturating_add(minutes.saturating_mul(60))
                .saturating_add(seconds),
        )
    }

    pub const fn as_seconds(&self) -> u32 {
        self.0
    }

    /// True for `24:00:00` and later.
    pub const fn is_past_midnight(&self) -> bool {
        self.0 >= SECONDS_PER_DAY
    }

    pub fn to_hms_string(&self) -> String {
        let h = self.0 / 3600;
        let m = (self.0 % 3600) / 60;
        let s = self.0 % 60;
        format!("{:02}:{:02}:{:02}", h, m, s)
    }

    /// Parses `H:MM:SS` / `HH:MM:SS`, accepting hours past 23.
    pub fn from_hms(time: &str) -> Option<Self> {
        const HOUR_TO_SEC: u32 = 60 * 60;
        const MINUTE_TO_SEC: u32 = 60;
        let mut split = time.trim().split(':');
        let hours: u32 = split.next()?.parse().ok()?;
        let minutes: u32 = split.next()?.parse().ok()?;
        let seconds: u32 = split.next()?.parse().ok()?;
        if split.next().is_some() || minutes > 59 || seconds > 59 {
            return None;
        }
        let secs = hours
            .checked_mul(HOUR_TO_SEC)?
            .checked_add(minutes * MINUTE_TO_SEC + seconds)?;
        Some(Self(secs))
    }

    /// Parses `HH:MM` or `HH:MM:SS` wall-clock values used in config files.
    pub fn from_clock(time: &str) -> Option<Self> {
        let time = time.trim();
        let parsed = NaiveTime::parse_from_str(time, "%H:%M:%S")
            .or_else(|_| NaiveTime::parse_from_str(time, "%H:%M"))
            .ok()?;
        Some(parsed.into())
    }
}

impl Serialize for Time {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hms_string())
    }
}

impl<'de> Deserialize<'de> for Time {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Time::from_hms(&raw)
            .or_else(|| Time::from_clock(&raw))
            .ok_or_else(|| serde::de::Error::custom(format!("invalid time of day: {raw}")))
    }
}

/// Resolves a service-day offset to an absolute instant.
///
/// GTFS measures stop times from "noon minus 12h" of the service date, which
/// only differs from local midnight on days with a DST transition.
pub fn service_instant(date: NaiveDate, time: Time, tz: Tz) -> Option<DateTime<Utc>> {
    let noon = date.and_hms_opt(12, 0, 0)?;
    let local_noon = tz.from_local_datetime(&noon).earliest()?;
    let reference = local_noon.with_timezone(&Utc) - TimeDelta::hours(12);
    Some(reference + TimeDelta::seconds(i64::from(time.as_seconds())))
}

/// Local calendar date and wall-clock time of `instant` in `tz`.
pub fn local_date_time(instant: DateTime<Utc>, tz: Tz) -> (NaiveDate, Time) {
    let local = instant.with_timezone(&tz);
    (
        local.date_naive(),
        Time::from_seconds(local.num_seconds_from_midnight()),
    )
}

/// Instant of a local wall-clock time on `date`. Ambiguous times resolve to
/// the earlier instant; times skipped by DST resolve to the following hour.
pub fn local_instant(date: NaiveDate, time: Time, tz: Tz) -> Option<DateTime<Utc>> {
    let secs = time.as_seconds() % SECONDS_PER_DAY;
    let days = time.as_seconds() / SECONDS_PER_DAY;
    let date = date.checked_add_days(chrono::Days::new(u64::from(days)))?;
    let naive = date.and_time(NaiveTime::from_num_seconds_from_midnight_opt(secs, 0)?);
    match tz.from_local_datetime(&naive).earliest() {
        Some(local) => Some(local.with_timezone(&Utc)),
        None => tz
            .from_local_datetime(&(naive + TimeDelta::hours(1)))
            .earliest()
            .map(|local| local.with_timezone(&Utc)),
    }
}

/// Parses a GTFS `YYYYMMDD` date.
pub fn parse_gtfs_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y%m%d").ok()
}
