use chrono::{DateTime, TimeDelta, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::{
    config::{Config, Mode},
    merge::{Arrival, Freshness, MergeOptions, merge_with},
    predictor::{Predictor, PredictorClient},
    realtime::{FeedReader, FeedSnapshot, FeedSource},
    schedule::ScheduleIndex,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("No stop configured")]
    NoStop,
    #[error("No schedule is loaded")]
    NoIndex,
    #[error("Stop {0} is not in the schedule")]
    UnknownStop(String),
    #[error("Arrivals for stop {stop_id} are unavailable: {reason}")]
    Unavailable { stop_id: String, reason: String },
}

/// Shared slot holding the current schedule. Readers get an `Arc` to a
/// complete index; a reload replaces it whole.
///
/// The lock only guards the pointer: a write is a single assignment and a
/// read a single clone, so neither waits on parsing or queries.
#[derive(Debug, Clone, Default)]
pub struct IndexHandle(Arc<RwLock<Option<Arc<ScheduleIndex>>>>);

impl IndexHandle {
    pub fn new() -> Self {
        Default::default()
    }

    pub async fn get(&self) -> Option<Arc<ScheduleIndex>> {
        self.0.read().await.clone()
    }

    pub async fn install(&self, index: ScheduleIndex) {
        self.replace(Arc::new(index)).await;
    }

    pub async fn replace(&self, index: Arc<ScheduleIndex>) {
        *self.0.write().await = Some(index);
    }

    pub async fn is_loaded(&self) -> bool {
        self.0.read().await.is_some()
    }
}

/// What the provider hands to the web layer and the renderer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrivalBoard {
    pub stop_id: Arc<str>,
    pub stop_name: Option<Arc<str>>,
    pub arrivals: Vec<Arrival>,
    pub fetched_at: DateTime<Utc>,
    /// Source that produced the arrivals, which differs from the configured
    /// mode after a fallback.
    pub mode: Mode,
    pub fallback: bool,
    pub freshness: Freshness,
}

impl ArrivalBoard {
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.fetched_at)
            .max(TimeDelta::zero())
            .to_std()
            .unwrap_or_default()
    }

    /// Copy of this board flagged as stale since it was fetched.
    pub fn to_stale(&self) -> Self {
        let as_of = match self.freshness {
            Freshness::Stale { as_of } => as_of,
            Freshness::Fresh => self.fetched_at,
        };
        let mut board = self.clone();
        board.freshness = Freshness::Stale { as_of };
        board
            .arrivals
            .iter_mut()
            .filter(|arrival| !arrival.freshness.is_stale())
            .for_each(|arrival| arrival.freshness = Freshness::Stale { as_of });
        board
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredictorHealth {
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderStatus {
    pub mode: Mode,
    pub stop_id: Option<String>,
    pub index_loaded: bool,
    pub index_built_at: Option<DateTime<Utc>>,
    pub stop_count: usize,
    pub trip_count: usize,
    pub feed_timestamp: Option<DateTime<Utc>>,
    pub feed_age_secs: Option<u64>,
    pub predictor: PredictorHealth,
    pub cached_boards: usize,
    pub refreshes_in_flight: usize,
}

type CacheKey = (Arc<str>, Mode);

/// Boards kept at once. The stop comes from the request, so the cache is
/// bounded and evicts expired, then oldest, entries first.
pub const MAX_CACHED_BOARDS: usize = 64;

/// Answers arrival requests for a stop, caching one board per
/// `(stop id, mode)` and falling back when a source fails.
///
/// Refreshes of the same key are single-flight: concurrent callers wait for
/// the refresh in progress and share its board.
pub struct ArrivalProvider {
    config: Config,
    merge_options: MergeOptions,
    index: IndexHandle,
    predictor: Arc<dyn Predictor>,
    feed_source: Arc<dyn FeedSource>,
    // Held for one lookup, insert or eviction, never across a fetch
    cache: RwLock<HashMap<CacheKey, Arc<ArrivalBoard>>>,
    in_flight: Mutex<HashMap<CacheKey, Arc<Mutex<()>>>>,
    feed: RwLock<Option<Arc<FeedSnapshot>>>,
    predictor_health: RwLock<PredictorHealth>,
}

impl ArrivalProvider {
    pub fn new(config: Config) -> Self {
        let predictor = PredictorClient::from_config(&config.data_source);
        let feed_source = FeedReader::new().with_stale_after(config.realtime.stale_after());
        Self {
            merge_options: MergeOptions::from(&config.realtime),
            config,
            index: IndexHandle::new(),
            predictor: Arc::new(predictor),
            feed_source: Arc::new(feed_source),
            cache: Default::default(),
            in_flight: Default::default(),
            feed: Default::default(),
            predictor_health: Default::default(),
        }
    }

    pub fn with_predictor(mut self, predictor: Arc<dyn Predictor>) -> Self {
        self.predictor = predictor;
        self
    }

    pub fn with_feed_source(mut self, feed_source: Arc<dyn FeedSource>) -> Self {
        self.feed_source = feed_source;
        self
    }

    pub fn with_index_handle(mut self, index: IndexHandle) -> Self {
        self.index = index;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn mode(&self) -> Mode {
        self.config.data_source.mode
    }

    pub fn index(&self) -> &IndexHandle {
        &self.index
    }

    pub async fn install_index(&self, index: ScheduleIndex) {
        info!(
            "Installing schedule with {} stops and {} trips",
            index.stop_count(),
            index.trip_count()
        );
        self.index.install(index).await;
    }

    /// Zone of wall-clock times: the loaded schedule's, else the configured
    /// one, else UTC.
    pub async fn timezone(&self) -> Tz {
        match self.index.get().await {
            Some(index) => index.timezone(),
            None => self.config.schedule.timezone.unwrap_or(Tz::UTC),
        }
    }

    /// Board for the configured stop.
    pub async fn arrivals(&self) -> Result<Arc<ArrivalBoard>, self::Error> {
        let stop_id = self.configured_stop()?;
        self.arrivals_at(&stop_id, Utc::now()).await
    }

    pub async fn arrivals_for(&self, stop_id: &str) -> Result<Arc<ArrivalBoard>, self::Error> {
        self.arrivals_at(stop_id, Utc::now()).await
    }

    /// Cached board if younger than the staleness limit, else a refresh.
    pub async fn arrivals_at(
        &self,
        stop_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Arc<ArrivalBoard>, self::Error> {
        let key: CacheKey = (stop_id.into(), self.mode());
        if let Some(board) = self.fresh_entry(&key, now).await {
            return Ok(board);
        }

        let flight = self.flight(&key).await;
        let result = {
            let _guard = flight.lock().await;
            // Whoever held the lock before us may have just refreshed
            match self.fresh_entry(&key, now).await {
                Some(board) => {
                    debug!("Reusing board refreshed while waiting for {stop_id}");
                    Ok(board)
                }
                None => self.refresh(&key, now).await,
            }
        };
        self.release(&key, flight).await;
        result
    }

    /// Forces a refresh of the configured stop, ignoring cache age.
    pub async fn refresh_now(&self) -> Result<Arc<ArrivalBoard>, self::Error> {
        let stop_id = self.configured_stop()?;
        self.refresh_stop(&stop_id, Utc::now()).await
    }

    /// Forces a refresh of `stop_id`. A refresh finished by someone else
    /// after `now` is reused.
    pub async fn refresh_stop(
        &self,
        stop_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Arc<ArrivalBoard>, self::Error> {
        let key: CacheKey = (stop_id.into(), self.mode());
        let flight = self.flight(&key).await;
        let result = {
            let _guard = flight.lock().await;
            let current = self.cache.read().await.get(&key).cloned();
            match current {
                Some(board) if board.fetched_at >= now => Ok(board),
                _ => self.refresh(&key, now).await,
            }
        };
        self.release(&key, flight).await;
        result
    }

    pub async fn status(&self) -> ProviderStatus {
        let index = self.index.get().await;
        let feed = self.feed.read().await.clone();
        let now = Utc::now();
        ProviderStatus {
            mode: self.mode(),
            stop_id: self.config.stop_id.clone(),
            index_loaded: index.is_some(),
            index_built_at: index.as_ref().map(|index| index.built_at()),
            stop_count: index.as_ref().map_or(0, |index| index.stop_count()),
            trip_count: index.as_ref().map_or(0, |index| index.trip_count()),
            feed_timestamp: feed.as_ref().map(|feed| feed.timestamp),
            feed_age_secs: feed.as_ref().map(|feed| feed.age(now).as_secs()),
            predictor: self.predictor_health.read().await.clone(),
            cached_boards: self.cache.read().await.len(),
            refreshes_in_flight: self.in_flight.lock().await.len(),
        }
    }

    /// Probes the predictor and records the outcome.
    pub async fn check_predictor(&self) -> bool {
        let result = self.predictor.health().await;
        let ok = result.is_ok();
        self.record_predictor(result.map_err(|err| err.to_string()), Utc::now())
            .await;
        ok
    }

    fn configured_stop(&self) -> Result<String, self::Error> {
        self.config.stop_id.clone().ok_or(Error::NoStop)
    }

    async fn fresh_entry(&self, key: &CacheKey, now: DateTime<Utc>) -> Option<Arc<ArrivalBoard>> {
        let max_staleness = self.config.max_staleness();
        self.cache
            .read()
            .await
            .get(key)
            .filter(|board| board.age(now) < max_staleness)
            .cloned()
    }

    async fn flight(&self, key: &CacheKey) -> Arc<Mutex<()>> {
        self.in_flight
            .lock()
            .await
            .entry(key.clone())
            .or_default()
            .clone()
    }

    /// Drops the flight entry for `key` once no other caller holds it.
    async fn release(&self, key: &CacheKey, flight: Arc<Mutex<()>>) {
        let mut in_flight = self.in_flight.lock().await;
        // Clones are only handed out under this lock, so the count is exact
        if Arc::strong_count(&flight) <= 2 {
            in_flight.remove(key);
        }
    }

    // Caller holds the flight lock for `key`
    async fn refresh(&self, key: &CacheKey, now: DateTime<Utc>) -> Result<Arc<ArrivalBoard>, self::Error> {
        let (stop_id, mode) = key;
        let result = match mode {
            Mode::Mint => self.mint_board(stop_id, now).await,
            Mode::Gtfs => self.gtfs_board(stop_id, now).await,
        };

        match result {
            Ok(board) => {
                let board = Arc::new(board);
                {
                    let mut cache = self.cache.write().await;
                    if cache.len() >= MAX_CACHED_BOARDS && !cache.contains_key(key) {
                        self.evict(&mut cache, now);
                    }
                    cache.insert(key.clone(), board.clone());
                }
                debug!(
                    "Refreshed {} arrivals for stop {stop_id} from {:?}",
                    board.arrivals.len(),
                    board.mode
                );
                Ok(board)
            }
            Err(err) => {
                let previous = self.cache.read().await.get(key).cloned();
                match previous {
                    Some(previous) => {
                        warn!("Serving stale arrivals for stop {stop_id}: {err}");
                        Ok(Arc::new(previous.to_stale()))
                    }
                    None => {
                        error!("No arrivals for stop {stop_id}: {err}");
                        Err(err)
                    }
                }
            }
        }
    }

    /// Makes room for one board. The configured stop is kept.
    fn evict(&self, cache: &mut HashMap<CacheKey, Arc<ArrivalBoard>>, now: DateTime<Utc>) {
        let max_staleness = self.config.max_staleness();
        let configured = self.config.stop_id.as_deref();
        let keep = |(stop_id, _): &CacheKey| configured == Some(&**stop_id);
        cache.retain(|key, board| keep(key) || board.age(now) < max_staleness);
        while cache.len() >= MAX_CACHED_BOARDS {
            let oldest = cache
                .iter()
                .filter(|(key, _)| !keep(key))
                .min_by_key(|(_, board)| board.fetched_at)
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => {
                    cache.remove(&key);
                }
                None => break,
            }
        }
        debug!("Evicted cached boards, {} left", cache.len());
    }

    async fn mint_board(&self, stop_id: &Arc<str>, now: DateTime<Utc>) -> Result<ArrivalBoard, self::Error> {
        let limit = self.config.max_arrivals;
        match self.predictor.predict(stop_id, limit).await {
            Ok(mut arrivals) => {
                self.record_predictor(Ok(()), now).await;
                let index = self.index.get().await;
                if self.config.data_source.supplement_with_schedule
                    && let Some(index) = &index
                {
                    self.supplement(index, stop_id, &mut arrivals, now);
                }
                Ok(ArrivalBoard {
                    stop_id: stop_id.clone(),
                    stop_name: self.stop_name(index.as_deref(), stop_id),
                    arrivals,
                    fetched_at: now,
                    mode: Mode::Mint,
                    fallback: false,
                    freshness: Freshness::Fresh,
                })
            }
            Err(err) => {
                warn!("Predictor failed for stop {stop_id}, falling back to schedule: {err}");
                self.record_predictor(Err(err.to_string()), now).await;
                let mut board = self.gtfs_board(stop_id, now).await.map_err(|fallback| {
                    Error::Unavailable {
                        stop_id: stop_id.to_string(),
                        reason: format!("predictor: {err}; schedule: {fallback}"),
                    }
                })?;
                board.fallback = true;
                Ok(board)
            }
        }
    }

    async fn gtfs_board(&self, stop_id: &Arc<str>, now: DateTime<Utc>) -> Result<ArrivalBoard, self::Error> {
        let index = self.index.get().await.ok_or(Error::NoIndex)?;
        if index.stop(stop_id).is_none() {
            return Err(Error::UnknownStop(stop_id.to_string()));
        }
        let feed = self.current_feed().await;

        // Departures this far back may still be running late
        let lookbehind = Duration::from_secs(self.config.realtime.delay_lookbehind_secs);
        let since = TimeDelta::from_std(lookbehind)
            .ok()
            .and_then(|lookbehind| now.checked_sub_signed(lookbehind))
            .unwrap_or(now);
        let departures = index.departures_since(stop_id, since, now, usize::MAX);
        let mut arrivals = merge_with(&departures, feed.as_deref(), now, &self.merge_options);
        arrivals.truncate(self.config.max_arrivals);

        let freshness = arrivals
            .iter()
            .map(|arrival| arrival.freshness)
            .find(Freshness::is_stale)
            .unwrap_or_default();
        Ok(ArrivalBoard {
            stop_id: stop_id.clone(),
            stop_name: self.stop_name(Some(&*index), stop_id),
            arrivals,
            fetched_at: now,
            mode: Mode::Gtfs,
            fallback: false,
            freshness,
        })
    }

    /// Appends scheduled arrivals later than the last prediction until the
    /// board is full.
    fn supplement(
        &self,
        index: &ScheduleIndex,
        stop_id: &str,
        arrivals: &mut Vec<Arrival>,
        now: DateTime<Utc>,
    ) {
        let limit = self.config.max_arrivals;
        if arrivals.len() >= limit || index.stop(stop_id).is_none() {
            return;
        }
        let last = arrivals.last().map_or(now, |arrival| arrival.predicted_at);
        let departures = index.departures_from(stop_id, now, usize::MAX);
        let extra = merge_with(&departures, None, now, &self.merge_options)
            .into_iter()
            .filter(|arrival| arrival.predicted_at > last)
            .take(limit - arrivals.len());
        arrivals.extend(extra);
    }

    /// Fetches the configured feed, keeping the last good snapshot when the
    /// fetch fails.
    async fn current_feed(&self) -> Option<Arc<FeedSnapshot>> {
        let Some(url) = self.config.data_source.gtfs_rt_url.as_deref() else {
            return None;
        };
        match self
            .feed_source
            .fetch(url, self.config.realtime.fetch_timeout())
            .await
        {
            Ok(snapshot) => {
                let snapshot = Arc::new(snapshot);
                *self.feed.write().await = Some(snapshot.clone());
                Some(snapshot)
            }
            Err(err) => {
                warn!("Real-time feed unavailable, using last snapshot: {err}");
                self.feed.read().await.clone()
            }
        }
    }

    fn stop_name(&self, index: Option<&ScheduleIndex>, stop_id: &str) -> Option<Arc<str>> {
        index
            .and_then(|index| index.stop(stop_id))
            .map(|stop| stop.name.clone())
            .filter(|name| !name.is_empty())
            .or_else(|| self.config.stop_name.as_deref().map(Into::into))
    }

    async fn record_predictor(&self, result: Result<(), String>, now: DateTime<Utc>) {
        let mut health = self.predictor_health.write().await;
        match result {
            Ok(()) => health.last_success = Some(now),
            Err(err) => {
                health.last_failure = Some(now);
                health.last_error = Some(err);
            }
        }
    }
}
