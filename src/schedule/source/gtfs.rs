use crate::{
    config::ScheduleConfig,
    gtfs::{self, Gtfs, models::GtfsCalendar},
    schedule::{Route, ScheduleIndex, ScheduleTables, ServiceCalendar, Stop, StopTime, Trip},
    shared::time::{Time, parse_gtfs_date},
};
use chrono_tz::Tz;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Instant,
};
use tracing::{debug, warn};

fn non_empty(value: Option<String>) -> Option<Arc<str>> {
    value.filter(|val| !val.is_empty()).map(|val| val.into())
}

impl ScheduleIndex {
    /// Parses a full bundle and indexes it. Depending on the size of the
    /// bundle this can be a long blocking call.
    pub fn load(gtfs: &Gtfs, options: ScheduleConfig) -> Result<Self, gtfs::Error> {
        let now = Instant::now();
        let tables = ScheduleTables::load_gtfs(gtfs)?;
        let index = Self::from_tables(tables, options);
        debug!(
            "Indexed {} stops, {} routes, {} trips in {:?}",
            index.stop_count(),
            index.route_count(),
            index.trip_count(),
            now.elapsed()
        );
        Ok(index)
    }
}

impl ScheduleTables {
    pub fn load_gtfs(gtfs: &Gtfs) -> Result<Self, gtfs::Error> {
        let mut tables = Self::default();
        tables.load_timezone(gtfs)?;
        tables.load_stops(gtfs)?;
        tables.load_routes(gtfs)?;
        tables.load_trips(gtfs)?;
        tables.load_calendars(gtfs)?;
        tables.load_stop_times(gtfs)?;
        Ok(tables)
    }

    fn load_timezone(&mut self, gtfs: &Gtfs) -> Result<(), gtfs::Error> {
        if !gtfs.has_file(&gtfs.config().agency_path)? {
            debug!("No agency file, time zone comes from config or UTC");
            return Ok(());
        }
        let mut timezone: Option<String> = None;
        gtfs.stream_agencies(|(_, agency)| {
            if timezone.is_none() && !agency.agency_timezone.is_empty() {
                timezone = Some(agency.agency_timezone);
            }
        })?;
        if let Some(name) = timezone {
            let tz: Tz = name
                .parse()
                .map_err(|_| gtfs::Error::InvalidTimezone(name.clone()))?;
            self.timezone = Some(tz);
        }
        Ok(())
    }

    fn load_stops(&mut self, gtfs: &Gtfs) -> Result<(), gtfs::Error> {
        debug!("Loading stops...");
        let now = Instant::now();
        let mut seen: HashSet<Arc<str>> = HashSet::new();
        let mut stops: Vec<Stop> = Vec::new();
        gtfs.stream_stops(|(_, stop)| {
            let id: Arc<str> = stop.stop_id.into();
            if !seen.insert(id.clone()) {
                return;
            }
            stops.push(Stop {
                id,
                name: stop.stop_name.unwrap_or_default().into(),
                code: non_empty(stop.stop_code),
            });
        })?;
        self.stops = stops;
        debug!("Loading stops took {:?}", now.elapsed());
        Ok(())
    }

    fn load_routes(&mut self, gtfs: &Gtfs) -> Result<(), gtfs::Error> {
        debug!("Loading routes...");
        let now = Instant::now();
        let mut routes: Vec<Route> = Vec::new();
        gtfs.stream_routes(|(_, route)| {
            routes.push(Route {
                id: route.route_id.into(),
                short_name: non_empty(route.route_short_name),
                long_name: non_empty(route.route_long_name),
                color: non_empty(route.route_color),
            });
        })?;
        self.routes = routes;
        debug!("Loading routes took {:?}", now.elapsed());
        Ok(())
    }

    fn load_trips(&mut self, gtfs: &Gtfs) -> Result<(), gtfs::Error> {
        debug!("Loading trips...");
        let now = Instant::now();
        let mut trips: Vec<Trip> = Vec::new();
        gtfs.stream_trips(|(_, trip)| {
            trips.push(Trip {
                id: trip.trip_id.into(),
                route_id: trip.route_id.into(),
                service_id: trip.service_id.into(),
                headsign: non_empty(trip.trip_headsign),
            });
        })?;
        self.trips = trips;
        debug!("Loading trips took {:?}", now.elapsed());
        Ok(())
    }

    fn load_calendars(&mut self, gtfs: &Gtfs) -> Result<(), gtfs::Error> {
        debug!("Loading calendars...");
        let now = Instant::now();
        let config = gtfs.config();
        let has_calendar = gtfs.has_file(&config.calendar_path)?;
        let has_calendar_dates = gtfs.has_file(&config.calendar_dates_path)?;
        if !has_calendar && !has_calendar_dates {
            return Err(gtfs::Error::MissingCalendar(
                config.calendar_path.clone(),
                config.calendar_dates_path.clone(),
            ));
        }

        let mut calendars: HashMap<Arc<str>, ServiceCalendar> = HashMap::new();
        if has_calendar {
            gtfs.stream_calendar(|(_, row)| {
                let calendar = parse_calendar(row, &config.calendar_path)?;
                calendars.insert(calendar.service_id.clone(), calendar);
                Ok(())
            })?;
        }
        if has_calendar_dates {
            gtfs.stream_calendar_dates(|(_, row)| {
                let date = parse_gtfs_date(&row.date).ok_or_else(|| gtfs::Error::InvalidDate {
                    file: config.calendar_dates_path.clone(),
                    service_id: row.service_id.clone(),
                    value: row.date.clone(),
                })?;
                let service_id: Arc<str> = row.service_id.into();
                let calendar = calendars
                    .entry(service_id.clone())
                    .or_insert_with(|| ServiceCalendar::new(service_id));
                match row.exception_type {
                    1 => {
                        calendar.added.insert(date);
                    }
                    2 => {
                        calendar.removed.insert(date);
                    }
                    other => warn!(
                        "Ignoring exception type {other} for service {}",
                        calendar.service_id
                    ),
                }
                Ok(())
            })?;
        }

        self.calendars = calendars.into_values().collect();
        debug!("Loading calendars took {:?}", now.elapsed());
        Ok(())
    }

    fn load_stop_times(&mut self, gtfs: &Gtfs) -> Result<(), gtfs::Error> {
        debug!("Loading stop times...");
        let now = Instant::now();
        let file = gtfs.config().stop_times_path.clone();
        let trip_ids: HashSet<Arc<str>> = self.trips.iter().map(|trip| trip.id.clone()).collect();
        let mut stop_ids: HashSet<Arc<str>> = self.stops.iter().map(|stop| stop.id.clone()).collect();
        let mut stop_times: Vec<StopTime> = Vec::new();
        let mut orphans = 0usize;
        let mut untimed = 0usize;

        gtfs.stream_stop_times(|(_, row)| {
            let Some(trip_id) = trip_ids.get(row.trip_id.as_str()).cloned() else {
                orphans += 1;
                return Ok(());
            };
            let raw_time = row
                .arrival_time
                .filter(|val| !val.is_empty())
                .or(row.departure_time.filter(|val| !val.is_empty()));
            let Some(raw_time) = raw_time else {
                untimed += 1;
                return Ok(());
            };
            let time = Time::from_hms(&raw_time).ok_or_else(|| gtfs::Error::InvalidTime {
                file: file.clone(),
                trip_id: row.trip_id.clone(),
                value: raw_time.clone(),
            })?;
            // Share one allocation per stop id across all of its stop times
            let stop_id = match stop_ids.get(row.stop_id.as_str()) {
                Some(id) => id.clone(),
                None => {
                    let id: Arc<str> = row.stop_id.into();
                    stop_ids.insert(id.clone());
                    id
                }
            };
            stop_times.push(StopTime {
                trip_id,
                stop_id,
                sequence: row.stop_sequence,
                time,
                headsign: non_empty(row.stop_headsign),
            });
            Ok(())
        })?;

        if orphans > 0 {
            warn!("Skipped {orphans} stop times referencing unknown trips");
        }
        if untimed > 0 {
            debug!("Skipped {untimed} stop times without arrival or departure time");
        }
        self.stop_times = stop_times;
        debug!("Loading stop times took {:?}", now.elapsed());
        Ok(())
    }
}

fn parse_calendar(row: GtfsCalendar, file: &str) -> Result<ServiceCalendar, gtfs::Error> {
    let invalid = |value: &str| gtfs::Error::InvalidDate {
        file: file.to_string(),
        service_id: row.service_id.clone(),
        value: value.to_string(),
    };
    let start_date = parse_gtfs_date(&row.start_date).ok_or_else(|| invalid(&row.start_date))?;
    let end_date = parse_gtfs_date(&row.end_date).ok_or_else(|| invalid(&row.end_date))?;
    let weekdays = [
        row.monday,
        row.tuesday,
        row.wednesday,
        row.thursday,
        row.friday,
        row.saturday,
        row.sunday,
    ]
    .iter()
    .enumerate()
    .fold(0u8, |bits, (i, day)| if *day == 1 { bits | (1 << i) } else { bits });

    Ok(ServiceCalendar {
        service_id: row.service_id.as_str().into(),
        weekdays,
        start_date: Some(start_date),
        end_date: Some(end_date),
        ..Default::default()
    })
}
