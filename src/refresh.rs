//! Background refresh of the configured stop and the offline schedule.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::{sync::Arc, time::Duration};
use tokio::{task::JoinHandle, time::Instant};
use tracing::{debug, info, warn};

use crate::{
    config::Config, offline::OfflineCache, provider::ArrivalProvider, shared::time::local_date_time,
};

/// How often the pruned schedule is checked for expiry.
pub const REVALIDATE_EVERY: Duration = Duration::from_secs(60 * 60);

/// Refresh interval in effect at `now`, longer during quiet hours. Quiet
/// hours are wall-clock times in `tz`.
pub fn interval_at(config: &Config, tz: Tz, now: DateTime<Utc>) -> Duration {
    let (_, wall) = local_date_time(now, tz);
    match &config.quiet_hours {
        Some(quiet) if quiet.contains(wall) => quiet.refresh_interval(),
        _ => config.refresh_interval(),
    }
}

pub fn spawn(provider: Arc<ArrivalProvider>, offline: Option<OfflineCache>) -> JoinHandle<()> {
    tokio::spawn(run(provider, offline))
}

/// Refreshes forever. Failures are logged and retried on the next tick.
pub async fn run(provider: Arc<ArrivalProvider>, offline: Option<OfflineCache>) {
    let mut last_revalidation = Instant::now();
    loop {
        tick(&provider).await;

        if let Some(offline) = &offline
            && last_revalidation.elapsed() >= REVALIDATE_EVERY
        {
            last_revalidation = Instant::now();
            revalidate(&provider, offline).await;
        }

        let tz = provider.timezone().await;
        let interval = interval_at(provider.config(), tz, Utc::now());
        debug!("Next refresh in {interval:?}");
        tokio::time::sleep(interval).await;
    }
}

async fn tick(provider: &ArrivalProvider) {
    if provider.config().stop_id.is_none() {
        return;
    }
    match provider.refresh_now().await {
        Ok(board) => debug!(
            "Refreshed {} arrivals for stop {}",
            board.arrivals.len(),
            board.stop_id
        ),
        Err(err) => warn!("Background refresh failed: {err}"),
    }
}

async fn revalidate(provider: &ArrivalProvider, offline: &OfflineCache) {
    match offline.revalidate(Utc::now()).await {
        Ok(Some(index)) => {
            info!("Pruned schedule rebuilt");
            provider.install_index(index).await;
        }
        Ok(None) => debug!("Pruned schedule is still fresh"),
        Err(err) => warn!("Could not revalidate pruned schedule: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::QuietHours, shared::Time};

    #[test]
    fn quiet_hours_stretch_interval() {
        let config = Config {
            quiet_hours: Some(QuietHours {
                start: Time::from_hms_parts(23, 0, 0),
                end: Time::from_hms_parts(5, 0, 0),
                refresh_interval_secs: 600,
            }),
            ..Default::default()
        };
        let chicago = chrono_tz::America::Chicago;

        // 08:00 UTC is 02:00 in Chicago in January
        let night = DateTime::parse_from_rfc3339("2026-01-10T08:00:00Z").unwrap().to_utc();
        assert_eq!(interval_at(&config, chicago, night), Duration::from_secs(600));
        let day = DateTime::parse_from_rfc3339("2026-01-10T18:00:00Z").unwrap().to_utc();
        assert_eq!(interval_at(&config, chicago, day), Duration::from_secs(30));
        // 23:30 UTC is quiet in UTC but 17:30 in Chicago
        let evening = DateTime::parse_from_rfc3339("2026-01-10T23:30:00Z").unwrap().to_utc();
        assert_eq!(interval_at(&config, Tz::UTC, evening), Duration::from_secs(600));
        assert_eq!(interval_at(&config, chicago, evening), Duration::from_secs(30));
    }
}
