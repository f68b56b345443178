use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use chrono_tz::Tz;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};

mod models;
pub mod source;
pub use models::*;

use crate::{
    config::ScheduleConfig,
    shared::time::{SECONDS_PER_DAY, Time, local_date_time, local_instant, service_instant},
};

/// Flat form of a schedule, as parsed from a bundle or read from the pruned
/// cache file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduleTables {
    /// Time zone declared by the bundle's agency, if any.
    pub timezone: Option<Tz>,
    pub stops: Vec<Stop>,
    pub routes: Vec<Route>,
    pub trips: Vec<Trip>,
    pub calendars: Vec<ServiceCalendar>,
    pub stop_times: Vec<StopTime>,
}

/// Immutable, stop-keyed view over one loaded schedule.
///
/// A reload builds a new index and swaps it in whole; entries are never
/// mutated after construction.
#[derive(Debug, Clone)]
pub struct ScheduleIndex {
    options: ScheduleConfig,
    timezone: Tz,
    agency_timezone: Option<Tz>,
    built_at: DateTime<Utc>,
    stops: HashMap<Arc<str>, Stop>,
    routes: HashMap<Arc<str>, Route>,
    trips: HashMap<Arc<str>, Trip>,
    calendars: HashMap<Arc<str>, ServiceCalendar>,
    // Sorted by time within each stop
    stop_times: HashMap<Arc<str>, Box<[StopTime]>>,
}

impl ScheduleIndex {
    pub fn from_tables(tables: ScheduleTables, options: ScheduleConfig) -> Self {
        let timezone = options.timezone.or(tables.timezone).unwrap_or(Tz::UTC);

        let stops = tables
            .stops
            .into_iter()
            .map(|stop| (stop.id.clone(), stop))
            .collect();
        let routes = tables
            .routes
            .into_iter()
            .map(|route| (route.id.clone(), route))
            .collect();
        let trips = tables
            .trips
            .into_iter()
            .map(|trip| (trip.id.clone(), trip))
            .collect();
        let calendars = tables
            .calendars
            .into_iter()
            .map(|calendar| (calendar.service_id.clone(), calendar))
            .collect();

        let mut by_stop: HashMap<Arc<str>, Vec<StopTime>> = HashMap::new();
        tables.stop_times.into_iter().for_each(|stop_time| {
            by_stop
                .entry(stop_time.stop_id.clone())
                .or_default()
                .push(stop_time);
        });
        by_stop.par_iter_mut().for_each(|(_, stop_times)| {
            stop_times.sort_by(|a, b| {
                a.time
                    .cmp(&b.time)
                    .then_with(|| a.trip_id.cmp(&b.trip_id))
                    .then_with(|| a.sequence.cmp(&b.sequence))
            });
        });
        let stop_times = by_stop
            .into_iter()
            .map(|(stop_id, stop_times)| (stop_id, stop_times.into_boxed_slice()))
            .collect();

        Self {
            options,
            timezone,
            agency_timezone: tables.timezone,
            built_at: Utc::now(),
            stops,
            routes,
            trips,
            calendars,
            stop_times,
        }
    }

    /// Flattens the index back into tables, sorted by id so the output is
    /// stable across runs.
    pub fn to_tables(&self) -> ScheduleTables {
        let mut stops: Vec<Stop> = self.stops.values().cloned().collect();
        stops.sort_by(|a, b| a.id.cmp(&b.id));
        let mut routes: Vec<Route> = self.routes.values().cloned().collect();
        routes.sort_by(|a, b| a.id.cmp(&b.id));
        let mut trips: Vec<Trip> = self.trips.values().cloned().collect();
        trips.sort_by(|a, b| a.id.cmp(&b.id));
        let mut calendars: Vec<ServiceCalendar> = self.calendars.values().cloned().collect();
        calendars.sort_by(|a, b| a.service_id.cmp(&b.service_id));
        let mut stop_times: Vec<StopTime> =
            self.stop_times.values().flat_map(|st| st.iter()).cloned().collect();
        stop_times.sort_by(|a, b| {
            a.stop_id
                .cmp(&b.stop_id)
                .then_with(|| a.time.cmp(&b.time))
                .then_with(|| a.trip_id.cmp(&b.trip_id))
        });
        ScheduleTables {
            timezone: self.agency_timezone,
            stops,
            routes,
            trips,
            calendars,
            stop_times,
        }
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    pub fn options(&self) -> &ScheduleConfig {
        &self.options
    }

    pub fn stop(&self, id: &str) -> Option<&Stop> {
        self.stops.get(id)
    }

    pub fn route(&self, id: &str) -> Option<&Route> {
        self.routes.get(id)
    }

    pub fn trip(&self, id: &str) -> Option<&Trip> {
        self.trips.get(id)
    }

    pub fn stop_count(&self) -> usize {
        self.stops.len()
    }

    pub fn trip_count(&self) -> usize {
        self.trips.len()
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    pub fn is_service_active(&self, service_id: &str, date: NaiveDate) -> bool {
        self.calendars
            .get(service_id)
            .is_some_and(|calendar| calendar.is_active(date))
    }

    /// Next `limit` departures from `stop_id` at or after the local wall-clock
    /// time `after` on calendar day `date`.
    ///
    /// Before the day rollover the previous service day's trips past
    /// `24:00:00` are candidates as well. Unknown stops yield nothing.
    pub fn departures_after(
        &self,
        stop_id: &str,
        after: Time,
        date: NaiveDate,
        limit: usize,
    ) -> Vec<ScheduledDeparture> {
        match local_instant(date, after, self.timezone) {
            Some(instant) => self.collect_departures(stop_id, instant, instant, date, after, limit),
            None => Vec::new(),
        }
    }

    /// Same as [`Self::departures_after`], starting from an absolute instant.
    pub fn departures_from(
        &self,
        stop_id: &str,
        instant: DateTime<Utc>,
        limit: usize,
    ) -> Vec<ScheduledDeparture> {
        self.departures_since(stop_id, instant, instant, limit)
    }

    /// Departures at or after `since` that fall in the window of `now`.
    ///
    /// The service day, rollover and lookahead are taken from `now`, so an
    /// earlier `since` only widens the window backwards.
    pub fn departures_since(
        &self,
        stop_id: &str,
        since: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Vec<ScheduledDeparture> {
        let since = since.min(now);
        let (date, wall) = local_date_time(now, self.timezone);
        self.collect_departures(stop_id, since, now, date, wall, limit)
    }

    fn collect_departures(
        &self,
        stop_id: &str,
        since: DateTime<Utc>,
        now: DateTime<Utc>,
        date: NaiveDate,
        wall: Time,
        limit: usize,
    ) -> Vec<ScheduledDeparture> {
        let Some(stop_times) = self.stop_times.get(stop_id) else {
            return Vec::new();
        };
        if limit == 0 {
            return Vec::new();
        }

        let end = self.window_end(date, now);
        let (since_date, _) = local_date_time(since, self.timezone);
        let include_previous = wall < self.options.day_rollover || since_date < date;
        let mut service_days: Vec<NaiveDate> = Vec::with_capacity(3);
        if include_previous && let Some(previous) = date.pred_opt() {
            service_days.push(previous);
        }
        service_days.push(date);
        if let Some(next) = date.succ_opt()
            && service_instant(next, Time::MIDNIGHT, self.timezone).is_some_and(|at| at < end)
        {
            service_days.push(next);
        }

        let mut departures: Vec<ScheduledDeparture> = Vec::new();
        for service_date in service_days {
            let Some(base) = service_instant(service_date, Time::MIDNIGHT, self.timezone) else {
                continue;
            };
            let offset = (since - base).num_seconds().max(0);
            let offset = u32::try_from(offset).unwrap_or(u32::MAX);
            let start = stop_times.partition_point(|st| st.time.as_seconds() < offset);

            for stop_time in &stop_times[start..] {
                let at = base + TimeDelta::seconds(i64::from(stop_time.time.as_seconds()));
                if at >= end {
                    break;
                }
                if at < since {
                    continue;
                }
                // Yesterday's evening calls only count inside a window that
                // reaches back before midnight
                if service_date < date && !stop_time.time.is_past_midnight() && since_date == date {
                    continue;
                }
                let Some(trip) = self.trips.get(&stop_time.trip_id) else {
                    continue;
                };
                if !self.is_service_active(&trip.service_id, service_date) {
                    continue;
                }
                departures.push(self.departure(stop_time, trip, service_date, at));
            }
        }

        departures.sort_by(|a, b| a.order(b));
        departures.dedup_by(|a, b| {
            a.trip_id == b.trip_id && a.stop_id == b.stop_id && a.scheduled_at == b.scheduled_at
        });
        departures.truncate(limit);
        departures
    }

    fn window_end(&self, date: NaiveDate, after: DateTime<Utc>) -> DateTime<Utc> {
        if let Some(lookahead) = self.options.lookahead_secs {
            return after + TimeDelta::seconds(i64::from(lookahead));
        }
        let end_of_day = Time::from_seconds(SECONDS_PER_DAY) + self.options.day_rollover.as_seconds();
        service_instant(date, end_of_day, self.timezone)
            .filter(|end| *end > after)
            .unwrap_or_else(|| after + TimeDelta::days(1))
    }

    fn departure(
        &self,
        stop_time: &StopTime,
        trip: &Trip,
        service_date: NaiveDate,
        scheduled_at: DateTime<Utc>,
    ) -> ScheduledDeparture {
        let route = self.routes.get(&trip.route_id);
        ScheduledDeparture {
            trip_id: trip.id.clone(),
            stop_id: stop_time.stop_id.clone(),
            stop_sequence: stop_time.sequence,
            route_id: trip.route_id.clone(),
            route_label: route.map_or_else(|| trip.route_id.clone(), Route::label),
            route_color: route.and_then(|route| route.color.clone()),
            headsign: stop_time.headsign.clone().or_else(|| trip.headsign.clone()),
            service_date,
            time: stop_time.time,
            scheduled_at,
        }
    }
}
