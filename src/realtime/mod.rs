use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use gtfs_realtime::{FeedMessage, trip_update::StopTimeUpdate};
use prost::Message;
use std::{collections::HashMap, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, warn};

use crate::shared::{
    net::{FetchError, fetch_bytes},
    time::parse_gtfs_date,
};

/// Feeds above this size are rejected before decoding.
pub const MAX_FEED_SIZE: usize = 50 * 1024 * 1024;

// GTFS-RT enum values, see gtfs-realtime.proto
const TRIP_CANCELED: i32 = 3;
const TRIP_DELETED: i32 = 7;
const STOP_SKIPPED: i32 = 1;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("Could not decode feed: {0}")]
    Decode(#[from] prost::DecodeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prediction {
    /// Signed offset from the scheduled time, in seconds.
    Delay(i32),
    Time(DateTime<Utc>),
    NoData,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopUpdate {
    pub stop_sequence: Option<u32>,
    pub stop_id: Option<Arc<str>>,
    pub skipped: bool,
    pub prediction: Prediction,
}

impl StopUpdate {
    fn matches(&self, sequence: u32, stop_id: &str) -> bool {
        match (self.stop_sequence, &self.stop_id) {
            (Some(seq), _) => seq == sequence,
            (None, Some(id)) => &**id == stop_id,
            (None, None) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TripUpdate {
    pub trip_id: Arc<str>,
    /// Service day the update applies to, when the producer set one.
    pub start_date: Option<NaiveDate>,
    pub cancelled: bool,
    pub delay: Option<i32>,
    pub stops: Vec<StopUpdate>,
}

impl TripUpdate {
    pub fn applies_to(&self, service_date: NaiveDate) -> bool {
        self.start_date.is_none_or(|date| date == service_date)
    }

    pub fn stop_update(&self, sequence: u32, stop_id: &str) -> Option<&StopUpdate> {
        self.stops.iter().find(|update| update.matches(sequence, stop_id))
    }

    /// Delay carried over from the closest earlier stop that reported one,
    /// else the trip-level delay.
    pub fn propagated_delay(&self, sequence: u32) -> Option<i32> {
        self.stops
            .iter()
            .filter(|update| update.stop_sequence.is_some_and(|seq| seq < sequence))
            .max_by_key(|update| update.stop_sequence)
            .and_then(|update| match update.prediction {
                Prediction::Delay(delay) => Some(delay),
                _ => None,
            })
            .or(self.delay)
    }

    fn from_proto(update: gtfs_realtime::TripUpdate) -> Option<Self> {
        let trip_id = update.trip.trip_id.filter(|id| !id.is_empty())?;
        let start_date = match update.trip.start_date.as_deref() {
            None | Some("") => None,
            Some(raw) => {
                let parsed = parse_gtfs_date(raw);
                if parsed.is_none() {
                    warn!("Ignoring invalid start date {raw:?} on trip {trip_id}");
                }
                parsed
            }
        };
        let cancelled = matches!(
            update.trip.schedule_relationship,
            Some(TRIP_CANCELED) | Some(TRIP_DELETED)
        );
        Some(Self {
            trip_id: trip_id.into(),
            start_date,
            cancelled,
            delay: update.delay,
            stops: update.stop_time_update.into_iter().map(stop_update).collect(),
        })
    }
}

fn stop_update(update: StopTimeUpdate) -> StopUpdate {
    // Arrival wins over departure, and within an event the absolute time
    // wins over the delay.
    let prediction = [update.arrival, update.departure]
        .into_iter()
        .flatten()
        .find_map(|event| match (event.time, event.delay) {
            (Some(time), _) => DateTime::from_timestamp(time, 0).map(Prediction::Time),
            (None, Some(delay)) => Some(Prediction::Delay(delay)),
            (None, None) => None,
        })
        .unwrap_or(Prediction::NoData);
    StopUpdate {
        stop_sequence: update.stop_sequence,
        stop_id: update.stop_id.filter(|id| !id.is_empty()).map(Into::into),
        skipped: update.schedule_relationship == Some(STOP_SKIPPED),
        prediction,
    }
}

/// One decoded GTFS-RT trip updates feed. Replaced whole on every fetch.
#[derive(Debug, Clone)]
pub struct FeedSnapshot {
    /// Header timestamp, or the fetch time when the producer left it out.
    pub timestamp: DateTime<Utc>,
    pub fetched_at: DateTime<Utc>,
    /// Older than the stale threshold at decode time. Still usable.
    pub stale: bool,
    trips: HashMap<Arc<str>, Vec<TripUpdate>>,
}

impl FeedSnapshot {
    pub fn decode(
        bytes: &[u8],
        fetched_at: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<Self, self::Error> {
        let message = FeedMessage::decode(bytes)?;
        Ok(Self::from_message(message, fetched_at, stale_after))
    }

    pub fn from_message(
        message: FeedMessage,
        fetched_at: DateTime<Utc>,
        stale_after: Duration,
    ) -> Self {
        let timestamp = message
            .header
            .timestamp
            .filter(|ts| *ts > 0)
            .and_then(|ts| i64::try_from(ts).ok())
            .and_then(|ts| DateTime::from_timestamp(ts, 0))
            .unwrap_or(fetched_at);

        let updates = message
            .entity
            .into_iter()
            .filter(|entity| entity.is_deleted != Some(true))
            .filter_map(|entity| entity.trip_update)
            .filter_map(TripUpdate::from_proto);
        Self::new(timestamp, fetched_at, stale_after, updates)
    }

    pub fn new<I>(
        timestamp: DateTime<Utc>,
        fetched_at: DateTime<Utc>,
        stale_after: Duration,
        updates: I,
    ) -> Self
    where
        I: IntoIterator<Item = TripUpdate>,
    {
        let mut trips: HashMap<Arc<str>, Vec<TripUpdate>> = HashMap::new();
        for update in updates {
            trips.entry(update.trip_id.clone()).or_default().push(update);
        }
        let mut snapshot = Self {
            timestamp,
            fetched_at,
            stale: false,
            trips,
        };
        snapshot.stale = snapshot.age(fetched_at) > stale_after;
        snapshot
    }

    /// Time since the feed timestamp, never negative.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.timestamp)
            .max(TimeDelta::zero())
            .to_std()
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.trips.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.trips.is_empty()
    }

    /// The update for `trip_id` on `service_date`, if the feed has one.
    pub fn trip(&self, trip_id: &str, service_date: NaiveDate) -> Option<&TripUpdate> {
        self.trips
            .get(trip_id)?
            .iter()
            .find(|update| update.applies_to(service_date))
    }
}

#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<FeedSnapshot, self::Error>;
}

/// Fetches and decodes GTFS-RT trip update feeds over HTTP.
#[derive(Debug, Clone)]
pub struct FeedReader {
    client: reqwest::Client,
    stale_after: Duration,
}

impl Default for FeedReader {
    fn default() -> Self {
        Self {
            client: reqwest::Client::new(),
            stale_after: Duration::from_secs(5 * 60),
        }
    }
}

impl FeedReader {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }
}

#[async_trait]
impl FeedSource for FeedReader {
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<FeedSnapshot, self::Error> {
        let bytes = fetch_bytes(&self.client, url, &[], timeout, MAX_FEED_SIZE).await?;
        let snapshot = FeedSnapshot::decode(&bytes, Utc::now(), self.stale_after)?;
        debug!(
            "Decoded {} trip updates from {url}, feed age {:?}",
            snapshot.len(),
            snapshot.age(snapshot.fetched_at)
        );
        Ok(snapshot)
    }
}
