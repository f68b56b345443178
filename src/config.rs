//! Runtime configuration.
//!
//! Every tunable has a default so a config file only needs the fields it
//! changes. Values are treated as already validated by whoever wrote them.

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;

use crate::shared::Time;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Which source answers arrival requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Static schedule merged with the optional GTFS-RT feed.
    #[default]
    Gtfs,
    /// External prediction API, falling back to [`Mode::Gtfs`].
    Mint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub stop_id: Option<String>,
    pub stop_name: Option<String>,
    pub refresh_interval_secs: u64,
    pub max_arrivals: usize,
    pub data_source: DataSourceConfig,
    pub schedule: ScheduleConfig,
    pub realtime: RealtimeConfig,
    pub cache: CacheConfig,
    pub quiet_hours: Option<QuietHours>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stop_id: None,
            stop_name: None,
            refresh_interval_secs: 30,
            max_arrivals: 8,
            data_source: Default::default(),
            schedule: Default::default(),
            realtime: Default::default(),
            cache: Default::default(),
            quiet_hours: None,
        }
    }
}

impl Config {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, self::Error> {
        let raw = fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, self::Error> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    /// Oldest cache entry that is still served as fresh.
    pub fn max_staleness(&self) -> Duration {
        self.cache
            .max_staleness_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.refresh_interval())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSourceConfig {
    pub mode: Mode,
    pub gtfs_url: Option<String>,
    pub gtfs_rt_url: Option<String>,
    pub mint_api_url: String,
    pub mint_system_id: u32,
    pub predictor_timeout_secs: u64,
    /// Pads predictor results with later scheduled departures when an index
    /// is loaded.
    pub supplement_with_schedule: bool,
}

impl Default for DataSourceConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Gtfs,
            gtfs_url: None,
            gtfs_rt_url: None,
            mint_api_url: "http://localhost:8000".into(),
            mint_system_id: 1,
            predictor_timeout_secs: 10,
            supplement_with_schedule: true,
        }
    }
}

impl DataSourceConfig {
    pub fn predictor_timeout(&self) -> Duration {
        Duration::from_secs(self.predictor_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Overrides the agency time zone of the bundle.
    pub timezone: Option<Tz>,
    /// Queries before this wall-clock time still see the previous service
    /// day's trips past `24:00:00`.
    pub day_rollover: Time,
    /// Query window length. `None` means until the end of the service day.
    pub lookahead_secs: Option<u32>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            timezone: None,
            day_rollover: Time::from_hms_parts(3, 0, 0),
            lookahead_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    pub fetch_timeout_secs: u64,
    /// Snapshots older than this are flagged stale but still used.
    pub stale_after_secs: u64,
    /// Snapshots older than this are ignored entirely.
    pub stale_ceiling_secs: u64,
    /// How far in the past an adjusted arrival may be before it counts as
    /// departed.
    pub departed_tolerance_secs: u64,
    /// Scheduled departures this far in the past are still merged so that
    /// delayed vehicles show up.
    pub delay_lookbehind_secs: u64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_secs: 10,
            stale_after_secs: 5 * 60,
            stale_ceiling_secs: 10 * 60,
            departed_tolerance_secs: 0,
            delay_lookbehind_secs: 30 * 60,
        }
    }
}

impl RealtimeConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Defaults to the refresh interval.
    pub max_staleness_secs: Option<u64>,
    pub pruned_path: PathBuf,
    pub pruned_max_age_secs: u64,
    pub bundle_timeout_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_staleness_secs: None,
            pruned_path: PathBuf::from("cache/gtfs/pruned.json"),
            pruned_max_age_secs: 24 * 60 * 60,
            bundle_timeout_secs: 60,
        }
    }
}

impl CacheConfig {
    pub fn pruned_max_age(&self) -> Duration {
        Duration::from_secs(self.pruned_max_age_secs)
    }

    pub fn bundle_timeout(&self) -> Duration {
        Duration::from_secs(self.bundle_timeout_secs)
    }
}

/// Wall-clock window, possibly wrapping midnight (`23:00` to `05:00`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuietHours {
    pub start: Time,
    pub end: Time,
    #[serde(default = "QuietHours::default_interval")]
    pub refresh_interval_secs: u64,
}

impl QuietHours {
    fn default_interval() -> u64 {
        5 * 60
    }

    pub fn contains(&self, time: Time) -> bool {
        if self.start <= self.end {
            self.start <= time && time <= self.end
        } else {
            time >= self.start || time <= self.end
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }
}
