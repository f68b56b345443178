mod common;

use async_trait::async_trait;
use bsds::{
    config::{Config, Mode, QuietHours},
    merge::{Arrival, ArrivalSource, Freshness},
    predictor::{self, Predictor},
    provider::{self, ArrivalProvider, MAX_CACHED_BOARDS},
    realtime::{self, FeedSnapshot, FeedSource, TripUpdate},
    refresh,
    shared::{FetchError, Time},
};
use chrono::{DateTime, TimeDelta, Utc};
use common::{Bundle, local, monday};
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

#[derive(Default)]
struct FakePredictor {
    calls: AtomicUsize,
    failing: AtomicBool,
    arrivals: Vec<Arrival>,
    delay: Duration,
}

#[async_trait]
impl Predictor for FakePredictor {
    async fn predict(&self, _stop_id: &str, limit: usize) -> Result<Vec<Arrival>, predictor::Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(predictor::Error::Fetch(FetchError::Status {
                url: "http://predictor.test".to_string(),
                status: 500,
            }));
        }
        Ok(self.arrivals.iter().take(limit).cloned().collect())
    }

    async fn health(&self) -> Result<(), predictor::Error> {
        if self.failing.load(Ordering::SeqCst) {
            Err(predictor::Error::Response("down".to_string()))
        } else {
            Ok(())
        }
    }
}

#[derive(Default)]
struct FakeFeed {
    calls: AtomicUsize,
    failing: AtomicBool,
    updates: Vec<TripUpdate>,
    timestamp: Option<DateTime<Utc>>,
}

#[async_trait]
impl FeedSource for FakeFeed {
    async fn fetch(&self, url: &str, _timeout: Duration) -> Result<FeedSnapshot, realtime::Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: 503,
            }
            .into());
        }
        let timestamp = self.timestamp.unwrap_or_else(Utc::now);
        Ok(FeedSnapshot::new(
            timestamp,
            timestamp,
            Duration::from_secs(300),
            self.updates.clone(),
        ))
    }
}

fn config(mode: Mode) -> Config {
    let mut config = Config::default();
    config.stop_id = Some("S1".to_string());
    config.data_source.mode = mode;
    config
}

fn predicted(route: &str, at: DateTime<Utc>) -> Arrival {
    Arrival {
        stop_id: "S1".into(),
        route_id: route.into(),
        route_label: route.into(),
        route_color: None,
        trip_id: None,
        headsign: None,
        predicted_at: at,
        scheduled_at: None,
        delay_seconds: Some(0),
        source: ArrivalSource::ExternalPredicted,
        freshness: Freshness::Fresh,
    }
}

async fn provider_with(config: Config, predictor: Arc<FakePredictor>, with_index: bool) -> ArrivalProvider {
    let provider = ArrivalProvider::new(config).with_predictor(predictor);
    if with_index {
        provider.install_index(Bundle::sample().index()).await;
    }
    provider
}

#[tokio::test]
async fn gtfs_mode_serves_schedule() {
    let provider = provider_with(config(Mode::Gtfs), Arc::default(), true).await;
    let board = provider.arrivals_at("S1", local(monday(), 7, 50)).await.unwrap();
    assert_eq!(board.mode, Mode::Gtfs);
    assert!(!board.fallback);
    assert_eq!(board.stop_name.as_deref(), Some("Main St & 4th Ave"));
    assert_eq!(board.arrivals.len(), 5);
    assert!(board.arrivals.iter().all(|a| a.source == ArrivalSource::Scheduled));
}

#[tokio::test]
async fn gtfs_mode_respects_max_arrivals() {
    let mut config = config(Mode::Gtfs);
    config.max_arrivals = 2;
    let provider = provider_with(config, Arc::default(), true).await;
    let board = provider.arrivals_at("S1", local(monday(), 7, 50)).await.unwrap();
    assert_eq!(board.arrivals.len(), 2);
}

#[tokio::test]
async fn cached_board_reused_within_staleness() {
    let predictor = Arc::new(FakePredictor {
        arrivals: vec![predicted("4", local(monday(), 8, 3))],
        ..Default::default()
    });
    let provider = provider_with(config(Mode::Mint), predictor.clone(), false).await;
    let now = local(monday(), 8, 0);

    let first = provider.arrivals_at("S1", now).await.unwrap();
    let second = provider
        .arrivals_at("S1", now + TimeDelta::seconds(10))
        .await
        .unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(predictor.calls.load(Ordering::SeqCst), 1);

    let third = provider
        .arrivals_at("S1", now + TimeDelta::seconds(31))
        .await
        .unwrap();
    assert!(!Arc::ptr_eq(&first, &third));
    assert_eq!(predictor.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn predictor_failure_falls_back_to_schedule() {
    let predictor = Arc::new(FakePredictor::default());
    predictor.failing.store(true, Ordering::SeqCst);
    let provider = provider_with(config(Mode::Mint), predictor, true).await;

    // T3 at 09:00 and LATE are the two departures left
    let board = provider.arrivals_at("S1", local(monday(), 8, 30)).await.unwrap();
    assert!(board.fallback);
    assert_eq!(board.mode, Mode::Gtfs);
    assert_eq!(board.arrivals.len(), 2);
    assert!(board.arrivals.iter().all(|a| a.source == ArrivalSource::Scheduled));

    let status = provider.status().await;
    assert!(status.predictor.last_failure.is_some());
    assert!(status.predictor.last_success.is_none());
}

#[tokio::test]
async fn both_sources_failing_serves_stale_entry() {
    let predictor = Arc::new(FakePredictor {
        arrivals: vec![predicted("4", local(monday(), 8, 3))],
        ..Default::default()
    });
    let provider = provider_with(config(Mode::Mint), predictor.clone(), false).await;
    let t0 = local(monday(), 8, 0);
    let fresh = provider.arrivals_at("S1", t0).await.unwrap();
    assert_eq!(fresh.freshness, Freshness::Fresh);

    predictor.failing.store(true, Ordering::SeqCst);
    let stale = provider
        .arrivals_at("S1", t0 + TimeDelta::minutes(1))
        .await
        .unwrap();
    assert_eq!(stale.freshness, Freshness::Stale { as_of: t0 });
    assert_eq!(stale.arrivals.len(), 1);
    assert!(stale.arrivals[0].freshness.is_stale());
}

#[tokio::test]
async fn both_sources_failing_without_entry_is_error() {
    let predictor = Arc::new(FakePredictor::default());
    predictor.failing.store(true, Ordering::SeqCst);
    let provider = provider_with(config(Mode::Mint), predictor, false).await;
    let result = provider.arrivals_at("S1", local(monday(), 8, 0)).await;
    assert!(matches!(result, Err(provider::Error::Unavailable { .. })));
}

#[tokio::test]
async fn gtfs_mode_without_index_is_error() {
    let provider = provider_with(config(Mode::Gtfs), Arc::default(), false).await;
    let result = provider.arrivals_at("S1", local(monday(), 8, 0)).await;
    assert_eq!(result.unwrap_err(), provider::Error::NoIndex);
}

#[tokio::test]
async fn unknown_stop_is_error() {
    let provider = provider_with(config(Mode::Gtfs), Arc::default(), true).await;
    let result = provider.arrivals_at("S404", local(monday(), 8, 0)).await;
    assert_eq!(result.unwrap_err(), provider::Error::UnknownStop("S404".to_string()));
}

#[tokio::test]
async fn empty_predictions_are_a_valid_board() {
    let mut config = config(Mode::Mint);
    config.data_source.supplement_with_schedule = false;
    let provider = provider_with(config, Arc::default(), true).await;
    let board = provider.arrivals_at("S1", local(monday(), 8, 0)).await.unwrap();
    assert!(board.arrivals.is_empty());
    assert!(!board.fallback);
}

#[tokio::test]
async fn concurrent_requests_share_one_refresh() {
    let predictor = Arc::new(FakePredictor {
        arrivals: vec![predicted("4", local(monday(), 8, 3))],
        delay: Duration::from_millis(50),
        ..Default::default()
    });
    let provider = Arc::new(provider_with(config(Mode::Mint), predictor.clone(), false).await);
    let now = local(monday(), 8, 0);

    let handles: Vec<_> = (0..5)
        .map(|_| {
            let provider = provider.clone();
            tokio::spawn(async move { provider.arrivals_at("S1", now).await })
        })
        .collect();
    let mut boards = Vec::new();
    for handle in handles {
        boards.push(handle.await.unwrap().unwrap());
    }

    assert_eq!(predictor.calls.load(Ordering::SeqCst), 1);
    assert!(boards.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
}

#[tokio::test]
async fn predictions_supplemented_with_schedule() {
    let predictor = Arc::new(FakePredictor {
        arrivals: vec![predicted("1", local(monday(), 8, 5))],
        ..Default::default()
    });
    let mut config = config(Mode::Mint);
    config.max_arrivals = 3;
    let provider = provider_with(config, predictor, true).await;

    let board = provider.arrivals_at("S1", local(monday(), 7, 50)).await.unwrap();
    let sources: Vec<_> = board.arrivals.iter().map(|a| a.source).collect();
    assert_eq!(
        sources,
        [
            ArrivalSource::ExternalPredicted,
            ArrivalSource::Scheduled,
            ArrivalSource::Scheduled
        ]
    );
    assert_eq!(board.arrivals[1].trip_id.as_deref(), Some("T4"));
    assert_eq!(board.arrivals[2].trip_id.as_deref(), Some("T2"));
}

#[tokio::test]
async fn feed_failure_keeps_last_snapshot() {
    let now = local(monday(), 7, 50);
    let cancelled = TripUpdate {
        trip_id: "T1".into(),
        start_date: Some(monday()),
        cancelled: true,
        delay: None,
        stops: Vec::new(),
    };
    let feed = Arc::new(FakeFeed {
        updates: vec![cancelled],
        timestamp: Some(now),
        ..Default::default()
    });

    let mut config = config(Mode::Gtfs);
    config.data_source.gtfs_rt_url = Some("http://feed.test/trip-updates".to_string());
    let provider = provider_with(config, Arc::default(), true)
        .await
        .with_feed_source(feed.clone());

    let board = provider.arrivals_at("S1", now).await.unwrap();
    assert_eq!(board.arrivals[0].trip_id.as_deref(), Some("T4"));

    feed.failing.store(true, Ordering::SeqCst);
    let board = provider
        .refresh_stop("S1", now + TimeDelta::minutes(1))
        .await
        .unwrap();
    assert_eq!(feed.calls.load(Ordering::SeqCst), 2);
    assert_eq!(board.arrivals[0].trip_id.as_deref(), Some("T4"));

    let status = provider.status().await;
    assert_eq!(status.feed_timestamp, Some(now));
    assert!(status.index_loaded);
    assert_eq!(status.stop_count, 3);
}

#[tokio::test]
async fn refresh_now_ignores_cache_age() {
    let predictor = Arc::new(FakePredictor {
        arrivals: vec![predicted("4", Utc::now() + TimeDelta::minutes(3))],
        ..Default::default()
    });
    let provider = provider_with(config(Mode::Mint), predictor.clone(), false).await;
    provider.arrivals().await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    provider.refresh_now().await.unwrap();
    assert_eq!(predictor.calls.load(Ordering::SeqCst), 2);
    assert_eq!(provider.status().await.cached_boards, 1);
}

#[tokio::test]
async fn missing_stop_config_is_error() {
    let mut config = config(Mode::Gtfs);
    config.stop_id = None;
    let provider = provider_with(config, Arc::default(), true).await;
    assert_eq!(provider.arrivals().await.unwrap_err(), provider::Error::NoStop);
}

#[tokio::test]
async fn health_check_records_outcome() {
    let predictor = Arc::new(FakePredictor::default());
    let provider = provider_with(config(Mode::Mint), predictor.clone(), false).await;
    assert!(provider.check_predictor().await);
    predictor.failing.store(true, Ordering::SeqCst);
    assert!(!provider.check_predictor().await);
    let health = provider.status().await.predictor;
    assert!(health.last_success.is_some());
    assert_eq!(health.last_error.as_deref(), Some("Invalid predictor response: down"));
}

#[tokio::test]
async fn gtfs_board_just_after_midnight() {
    let provider = provider_with(config(Mode::Gtfs), Arc::default(), true).await;
    let tuesday = monday().succ_opt().unwrap();

    // The lookbehind reaches back into Monday
    let board = provider.arrivals_at("S1", local(tuesday, 0, 25)).await.unwrap();
    let ids: Vec<_> = board.arrivals.iter().filter_map(|a| a.trip_id.as_deref()).collect();
    assert_eq!(ids, ["T1", "T4", "T2", "T3", "LATE"]);
    assert_eq!(board.arrivals[0].predicted_at, local(tuesday, 8, 0));
    assert_eq!(board.arrivals[0].route_color.as_deref(), Some("FF0000"));
}

#[tokio::test]
async fn lookbehind_keeps_late_evening_trip_delayed_past_midnight() {
    let tuesday = monday().succ_opt().unwrap();
    let delayed = TripUpdate {
        trip_id: "LATE".into(),
        start_date: Some(monday()),
        cancelled: false,
        delay: Some(10 * 60),
        stops: Vec::new(),
    };
    let now = local(tuesday, 0, 25);
    let feed = Arc::new(FakeFeed {
        updates: vec![delayed],
        timestamp: Some(now),
        ..Default::default()
    });
    let mut config = config(Mode::Gtfs);
    config.data_source.gtfs_rt_url = Some("http://feed.test/trip-updates".to_string());
    let provider = provider_with(config, Arc::default(), true)
        .await
        .with_feed_source(feed);

    let board = provider.arrivals_at("S1", now).await.unwrap();
    let first = &board.arrivals[0];
    assert_eq!(first.trip_id.as_deref(), Some("LATE"));
    assert_eq!(first.predicted_at, local(tuesday, 0, 30));
    assert_eq!(first.source, ArrivalSource::RealtimeAdjusted);
}

#[tokio::test]
async fn cache_stays_bounded() {
    let predictor = Arc::new(FakePredictor {
        arrivals: vec![predicted("4", local(monday(), 8, 3))],
        ..Default::default()
    });
    let provider = provider_with(config(Mode::Mint), predictor.clone(), false).await;
    let now = local(monday(), 8, 0);

    provider.arrivals_at("S1", now).await.unwrap();
    for i in 0..1000 {
        provider.arrivals_at(&format!("junk-{i}"), now).await.unwrap();
    }

    let status = provider.status().await;
    assert!(status.cached_boards <= MAX_CACHED_BOARDS);
    assert_eq!(status.refreshes_in_flight, 0);
    // The configured stop survives eviction
    provider.arrivals_at("S1", now).await.unwrap();
    assert_eq!(predictor.calls.load(Ordering::SeqCst), 1001);
}

#[tokio::test]
async fn failed_requests_leave_nothing_behind() {
    let provider = provider_with(config(Mode::Gtfs), Arc::default(), true).await;
    for i in 0..100 {
        let result = provider.arrivals_at(&format!("junk-{i}"), local(monday(), 8, 0)).await;
        assert!(result.is_err());
    }
    let status = provider.status().await;
    assert_eq!(status.cached_boards, 0);
    assert_eq!(status.refreshes_in_flight, 0);
}

#[tokio::test]
async fn quiet_hours_follow_schedule_zone() {
    let mut config = config(Mode::Gtfs);
    config.quiet_hours = Some(QuietHours {
        start: Time::from_hms_parts(23, 0, 0),
        end: Time::from_hms_parts(5, 0, 0),
        refresh_interval_secs: 600,
    });
    let provider = provider_with(config, Arc::default(), false).await;
    assert_eq!(provider.timezone().await, chrono_tz::Tz::UTC);

    provider.install_index(Bundle::sample().index()).await;
    let tz = provider.timezone().await;
    assert_eq!(tz, common::TZ);

    let night = local(monday(), 23, 30);
    let evening = local(monday(), 17, 30);
    assert_eq!(refresh::interval_at(provider.config(), tz, night), Duration::from_secs(600));
    assert_eq!(refresh::interval_at(provider.config(), tz, evening), Duration::from_secs(30));
}
