//! Pruned on-disk copy of the static schedule.
//!
//! Only the configured stops, and the trips, routes and calendars that
//! serve them, are kept so the device can start without downloading the
//! full bundle.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    config::{Config, ScheduleConfig},
    gtfs::{self, Gtfs},
    schedule::{ScheduleIndex, ScheduleTables},
    shared::net::{FetchError, fetch_bytes},
};

/// Bumped whenever the file layout changes.
pub const BUNDLE_VERSION: u32 = 1;
const MAX_BUNDLE_SIZE: usize = 512 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Parse(#[from] gtfs::Error),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("Pruned file has version {found}, expected {expected}")]
    Version { found: u32, expected: u32 },
    #[error("No pruned file and no bundle url configured")]
    NoSource,
}

/// Keeps the parts of `tables` needed to answer queries for `stop_ids`.
/// An empty `stop_ids` keeps everything.
pub fn prune<S: AsRef<str>>(tables: ScheduleTables, stop_ids: &[S]) -> ScheduleTables {
    if stop_ids.is_empty() {
        return tables;
    }
    let wanted: HashSet<&str> = stop_ids.iter().map(AsRef::as_ref).collect();

    let stop_times: Vec<_> = tables
        .stop_times
        .into_iter()
        .filter(|st| wanted.contains(&*st.stop_id))
        .collect();
    let trip_ids: HashSet<Arc<str>> = stop_times.iter().map(|st| st.trip_id.clone()).collect();
    let trips: Vec<_> = tables
        .trips
        .into_iter()
        .filter(|trip| trip_ids.contains(&trip.id))
        .collect();
    let route_ids: HashSet<Arc<str>> = trips.iter().map(|trip| trip.route_id.clone()).collect();
    let service_ids: HashSet<Arc<str>> = trips.iter().map(|trip| trip.service_id.clone()).collect();

    ScheduleTables {
        timezone: tables.timezone,
        stops: tables
            .stops
            .into_iter()
            .filter(|stop| wanted.contains(&*stop.id))
            .collect(),
        routes: tables
            .routes
            .into_iter()
            .filter(|route| route_ids.contains(&route.id))
            .collect(),
        trips,
        calendars: tables
            .calendars
            .into_iter()
            .filter(|calendar| service_ids.contains(&calendar.service_id))
            .collect(),
        stop_times,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrunedBundle {
    pub version: u32,
    pub built_at: DateTime<Utc>,
    /// Bundle url the copy was built from.
    pub source_url: Option<String>,
    pub stop_ids: Vec<String>,
    pub tables: ScheduleTables,
}

impl PrunedBundle {
    pub fn new(
        tables: ScheduleTables,
        stop_ids: Vec<String>,
        source_url: Option<String>,
        built_at: DateTime<Utc>,
    ) -> Self {
        Self {
            version: BUNDLE_VERSION,
            built_at,
            source_url,
            tables: prune(tables, &stop_ids),
            stop_ids,
        }
    }

    /// Younger than `max_age` and built from `source_url`.
    pub fn is_fresh(&self, max_age: Duration, source_url: Option<&str>, now: DateTime<Utc>) -> bool {
        if source_url.is_some() && self.source_url.as_deref() != source_url {
            return false;
        }
        let max_age = TimeDelta::from_std(max_age).unwrap_or(TimeDelta::MAX);
        now - self.built_at <= max_age
    }

    pub fn into_index(self, options: ScheduleConfig) -> ScheduleIndex {
        ScheduleIndex::from_tables(self.tables, options)
    }

    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self, self::Error> {
        let raw = tokio::fs::read(path).await?;
        let bundle: PrunedBundle = serde_json::from_slice(&raw)?;
        if bundle.version != BUNDLE_VERSION {
            return Err(Error::Version {
                found: bundle.version,
                expected: BUNDLE_VERSION,
            });
        }
        Ok(bundle)
    }

    /// Writes next to `path` first and renames over it, so readers see
    /// either the old or the new file.
    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), self::Error> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, serde_json::to_vec(self)?).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

/// Reads a pruned file and indexes it.
pub async fn load_pruned<P: AsRef<Path>>(
    path: P,
    options: ScheduleConfig,
) -> Result<ScheduleIndex, self::Error> {
    Ok(PrunedBundle::load(path).await?.into_index(options))
}

/// Keeps the pruned file current, rebuilding it from the bundle url once it
/// expires.
#[derive(Debug, Clone)]
pub struct OfflineCache {
    client: reqwest::Client,
    path: PathBuf,
    source_url: Option<String>,
    stop_ids: Vec<String>,
    max_age: Duration,
    timeout: Duration,
    options: ScheduleConfig,
}

impl OfflineCache {
    pub fn from_config(config: &Config) -> Self {
        Self {
            client: reqwest::Client::new(),
            path: config.cache.pruned_path.clone(),
            source_url: config.data_source.gtfs_url.clone(),
            stop_ids: config.stop_id.iter().cloned().collect(),
            max_age: config.cache.pruned_max_age(),
            timeout: config.cache.bundle_timeout(),
            options: config.schedule.clone(),
        }
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current schedule: the pruned file while fresh, else a rebuilt one.
    /// When the rebuild fails an expired file is still served.
    pub async fn ensure(&self, now: DateTime<Utc>) -> Result<ScheduleIndex, self::Error> {
        let cached = match self.read_cached().await {
            Some(bundle) if bundle.is_fresh(self.max_age, self.source_url.as_deref(), now) => {
                debug!("Pruned file {:?} built at {} is fresh", self.path, bundle.built_at);
                return Ok(bundle.into_index(self.options.clone()));
            }
            other => other,
        };

        if self.source_url.is_none() {
            return match cached {
                Some(bundle) => {
                    warn!("Pruned file is expired and no bundle url is configured");
                    Ok(bundle.into_index(self.options.clone()))
                }
                None => Err(Error::NoSource),
            };
        }

        match self.rebuild(now).await {
            Ok(bundle) => Ok(bundle.into_index(self.options.clone())),
            Err(err) => match cached {
                Some(bundle) => {
                    warn!("Could not rebuild pruned file, serving copy from {}: {err}", bundle.built_at);
                    Ok(bundle.into_index(self.options.clone()))
                }
                None => Err(err),
            },
        }
    }

    /// Rebuilds the pruned file if it has expired. `None` means the file on
    /// disk is still fresh and the loaded schedule can stay.
    pub async fn revalidate(&self, now: DateTime<Utc>) -> Result<Option<ScheduleIndex>, self::Error> {
        if let Some(bundle) = self.read_cached().await
            && bundle.is_fresh(self.max_age, self.source_url.as_deref(), now)
        {
            return Ok(None);
        }
        let bundle = self.rebuild(now).await?;
        Ok(Some(bundle.into_index(self.options.clone())))
    }

    async fn read_cached(&self) -> Option<PrunedBundle> {
        match PrunedBundle::load(&self.path).await {
            Ok(bundle) => Some(bundle),
            Err(Error::Io(err)) if err.kind() == io::ErrorKind::NotFound => None,
            Err(err) => {
                warn!("Ignoring unreadable pruned file {:?}: {err}", self.path);
                None
            }
        }
    }

    /// Downloads the full bundle, prunes it and replaces the file.
    pub async fn rebuild(&self, now: DateTime<Utc>) -> Result<PrunedBundle, self::Error> {
        let url = self.source_url.clone().ok_or(Error::NoSource)?;
        info!("Downloading schedule bundle from {url}");
        let bytes = fetch_bytes(&self.client, &url, &[], self.timeout, MAX_BUNDLE_SIZE).await?;

        let stop_ids = self.stop_ids.clone();
        let bundle = tokio::task::spawn_blocking(move || -> Result<PrunedBundle, self::Error> {
            let parse = Instant::now();
            let gtfs = Gtfs::new().from_bytes(bytes.to_vec());
            let tables = ScheduleTables::load_gtfs(&gtfs)?;
            debug!("Parsing bundle took {:?}", parse.elapsed());
            Ok(PrunedBundle::new(tables, stop_ids, Some(url), now))
        })
        .await??;

        bundle.save(&self.path).await?;
        info!(
            "Saved pruned schedule with {} trips to {:?}",
            bundle.tables.trips.len(),
            self.path
        );
        Ok(bundle)
    }
}
