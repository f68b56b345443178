//! Joins real-time trip updates onto scheduled departures.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::{cmp::Ordering, sync::Arc, time::Duration};

use crate::{
    config::RealtimeConfig,
    realtime::{FeedSnapshot, Prediction, TripUpdate},
    schedule::ScheduledDeparture,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArrivalSource {
    Scheduled,
    RealtimeAdjusted,
    ExternalPredicted,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum Freshness {
    #[default]
    Fresh,
    /// Derived from data last updated at `as_of`.
    Stale { as_of: DateTime<Utc> },
}

impl Freshness {
    pub fn is_stale(&self) -> bool {
        matches!(self, Freshness::Stale { .. })
    }
}

/// One vehicle expected at a stop, whatever the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Arrival {
    pub stop_id: Arc<str>,
    pub route_id: Arc<str>,
    pub route_label: Arc<str>,
    pub route_color: Option<Arc<str>>,
    pub trip_id: Option<Arc<str>>,
    pub headsign: Option<Arc<str>>,
    pub predicted_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Signed, positive means late.
    pub delay_seconds: Option<i32>,
    pub source: ArrivalSource,
    pub freshness: Freshness,
}

impl Arrival {
    pub fn scheduled(departure: &ScheduledDeparture) -> Self {
        Self {
            stop_id: departure.stop_id.clone(),
            route_id: departure.route_id.clone(),
            route_label: departure.route_label.clone(),
            route_color: departure.route_color.clone(),
            trip_id: Some(departure.trip_id.clone()),
            headsign: departure.headsign.clone(),
            predicted_at: departure.scheduled_at,
            scheduled_at: Some(departure.scheduled_at),
            delay_seconds: None,
            source: ArrivalSource::Scheduled,
            freshness: Freshness::Fresh,
        }
    }

    /// Whole minutes until arrival, rounded down and never negative.
    pub fn minutes_until(&self, now: DateTime<Utc>) -> i64 {
        (self.predicted_at - now).num_minutes().max(0)
    }

    /// Predicted time, then route id, then trip id.
    pub fn order(&self, other: &Self) -> Ordering {
        self.predicted_at
            .cmp(&other.predicted_at)
            .then_with(|| self.route_id.cmp(&other.route_id))
            .then_with(|| self.trip_id.cmp(&other.trip_id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeOptions {
    /// Adjusted arrivals from feeds older than this are marked stale.
    pub stale_after: Duration,
    /// Feeds older than this are ignored.
    pub stale_ceiling: Duration,
    /// How far before `now` an arrival may be before it counts as departed.
    pub departed_tolerance: Duration,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(5 * 60),
            stale_ceiling: Duration::from_secs(10 * 60),
            departed_tolerance: Duration::ZERO,
        }
    }
}

impl From<&RealtimeConfig> for MergeOptions {
    fn from(config: &RealtimeConfig) -> Self {
        Self {
            stale_after: config.stale_after(),
            stale_ceiling: Duration::from_secs(config.stale_ceiling_secs),
            departed_tolerance: Duration::from_secs(config.departed_tolerance_secs),
        }
    }
}

enum Outcome {
    Cancelled,
    Unchanged,
    Adjusted(DateTime<Utc>, i32),
}

/// [`merge_with`] using the default thresholds.
pub fn merge(
    departures: &[ScheduledDeparture],
    feed: Option<&FeedSnapshot>,
    now: DateTime<Utc>,
) -> Vec<Arrival> {
    merge_with(departures, feed, now, &MergeOptions::default())
}

/// Applies `feed` to `departures` and returns what is still to come,
/// ordered by predicted time.
///
/// A feed older than the ceiling is treated as absent. Cancelled trips and
/// skipped stops are left out.
pub fn merge_with(
    departures: &[ScheduledDeparture],
    feed: Option<&FeedSnapshot>,
    now: DateTime<Utc>,
    options: &MergeOptions,
) -> Vec<Arrival> {
    let feed = feed.filter(|feed| feed.age(now) <= options.stale_ceiling);
    // A reused snapshot ages after decoding, so staleness is judged at `now`
    let stale_as_of = feed
        .filter(|feed| feed.stale || feed.age(now) > options.stale_after)
        .map(|feed| feed.timestamp);
    let tolerance = TimeDelta::from_std(options.departed_tolerance).unwrap_or(TimeDelta::MAX);
    let cutoff = now.checked_sub_signed(tolerance).unwrap_or(DateTime::<Utc>::MIN_UTC);

    let mut arrivals: Vec<Arrival> = departures
        .iter()
        .filter_map(|departure| {
            let update = feed.and_then(|feed| feed.trip(&departure.trip_id, departure.service_date));
            let mut arrival = Arrival::scheduled(departure);
            match update.map_or(Outcome::Unchanged, |update| apply(update, departure)) {
                Outcome::Cancelled => return None,
                Outcome::Unchanged => {}
                Outcome::Adjusted(predicted_at, delay) => {
                    arrival.predicted_at = predicted_at;
                    arrival.delay_seconds = Some(delay);
                    arrival.source = ArrivalSource::RealtimeAdjusted;
                    if let Some(as_of) = stale_as_of {
                        arrival.freshness = Freshness::Stale { as_of };
                    }
                }
            }
            (arrival.predicted_at >= cutoff).then_some(arrival)
        })
        .collect();

    arrivals.sort_by(|a, b| a.order(b));
    arrivals
}

fn apply(update: &TripUpdate, departure: &ScheduledDeparture) -> Outcome {
    if update.cancelled {
        return Outcome::Cancelled;
    }
    let scheduled = departure.scheduled_at;
    let stop = update.stop_update(departure.stop_sequence, &departure.stop_id);
    if stop.is_some_and(|stop| stop.skipped) {
        return Outcome::Cancelled;
    }
    let prediction = stop.map_or(Prediction::NoData, |stop| stop.prediction);
    match prediction {
        Prediction::Time(at) => {
            let delay = (at - scheduled).num_seconds();
            let delay = i32::try_from(delay).unwrap_or(if delay < 0 { i32::MIN } else { i32::MAX });
            Outcome::Adjusted(at, delay)
        }
        Prediction::Delay(delay) => Outcome::Adjusted(shift(scheduled, delay), delay),
        Prediction::NoData => match update.propagated_delay(departure.stop_sequence) {
            Some(delay) => Outcome::Adjusted(shift(scheduled, delay), delay),
            None => Outcome::Unchanged,
        },
    }
}

fn shift(at: DateTime<Utc>, delay: i32) -> DateTime<Utc> {
    at + TimeDelta::seconds(i64::from(delay))
}
