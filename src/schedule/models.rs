use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::{cmp::Ordering, collections::BTreeSet, sync::Arc};

use crate::shared::time::Time;

/// A physical point where passengers board, keyed by the id both data
/// sources share.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stop {
    pub id: Arc<str>,
    /// Human-readable name (e.g., "Main St & 4th Ave").
    pub name: Arc<str>,
    /// Short public code printed on the stop pole, when the feed has one.
    pub code: Option<Arc<str>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub id: Arc<str>,
    pub short_name: Option<Arc<str>>,
    pub long_name: Option<Arc<str>>,
    pub color: Option<Arc<str>>,
}

impl Route {
    /// The name riders see: short name, then long name, then the id.
    pub fn label(&self) -> Arc<str> {
        self.short_name
            .clone()
            .or_else(|| self.long_name.clone())
            .unwrap_or_else(|| self.id.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trip {
    pub id: Arc<str>,
    pub route_id: Arc<str>,
    pub service_id: Arc<str>,
    pub headsign: Option<Arc<str>>,
}

/// One call of a trip at a stop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopTime {
    pub trip_id: Arc<str>,
    pub stop_id: Arc<str>,
    pub sequence: u32,
    /// Arrival time, or departure time when the feed leaves arrival empty.
    pub time: Time,
    pub headsign: Option<Arc<str>>,
}

/// Days a service id runs.
///
/// Exception dates always win over the weekday pattern and validity range.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceCalendar {
    pub service_id: Arc<str>,
    /// Bit 0 is Monday, bit 6 is Sunday.
    pub weekdays: u8,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub added: BTreeSet<NaiveDate>,
    pub removed: BTreeSet<NaiveDate>,
}

impl ServiceCalendar {
    pub fn new(service_id: Arc<str>) -> Self {
        Self {
            service_id,
            ..Default::default()
        }
    }

    pub fn runs_on_weekday(&self, date: NaiveDate) -> bool {
        let bit = date.weekday().num_days_from_monday();
        self.weekdays & (1 << bit) != 0
    }

    pub fn is_active(&self, date: NaiveDate) -> bool {
        if self.removed.contains(&date) {
            return false;
        }
        if self.added.contains(&date) {
            return true;
        }
        if self.start_date.is_some_and(|start| date < start)
            || self.end_date.is_some_and(|end| date > end)
        {
            return false;
        }
        self.runs_on_weekday(date)
    }
}

/// A scheduled call at a stop on a specific service day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledDeparture {
    pub trip_id: Arc<str>,
    pub stop_id: Arc<str>,
    pub stop_sequence: u32,
    pub route_id: Arc<str>,
    pub route_label: Arc<str>,
    pub route_color: Option<Arc<str>>,
    pub headsign: Option<Arc<str>>,
    pub service_date: NaiveDate,
    /// Offset from the service day's reference midnight, may exceed 24h.
    pub time: Time,
    pub scheduled_at: DateTime<Utc>,
}

impl ScheduledDeparture {
    /// Absolute time, then route id, then trip id.
    pub fn order(&self, other: &Self) -> Ordering {
        self.scheduled_at
            .cmp(&other.scheduled_at)
            .then_with(|| self.route_id.cmp(&other.route_id))
            .then_with(|| self.trip_id.cmp(&other.trip_id))
    }
}
