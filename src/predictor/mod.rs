use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::Deserialize;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    config::DataSourceConfig,
    merge::{Arrival, ArrivalSource, Freshness},
    shared::net::{FetchError, fetch_bytes},
};

const MAX_RESPONSE_SIZE: usize = 5 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("Invalid predictor response: {0}")]
    Response(String),
}

/// Source of live arrival predictions for a stop.
#[async_trait]
pub trait Predictor: Send + Sync {
    async fn predict(&self, stop_id: &str, limit: usize) -> Result<Vec<Arrival>, self::Error>;

    async fn health(&self) -> Result<(), self::Error>;
}

#[derive(Debug, Deserialize)]
struct RawResponse {
    stop_id: Option<String>,
    #[serde(default)]
    arrivals: Vec<RawArrival>,
}

#[derive(Debug, Deserialize)]
struct RawArrival {
    route_name: Option<String>,
    route_id: Option<String>,
    route_color: Option<String>,
    headsign: Option<String>,
    trip_id: Option<String>,
    stop_id: Option<String>,
    predicted_minutes: Option<f64>,
    predicted_time: Option<RawTime>,
    current_delay_minutes: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawTime {
    Epoch(f64),
    Text(String),
}

impl RawTime {
    fn resolve(&self) -> Option<DateTime<Utc>> {
        match self {
            RawTime::Epoch(secs) if secs.is_finite() && secs.abs() < i64::MAX as f64 => {
                DateTime::from_timestamp(secs.round() as i64, 0)
            }
            RawTime::Epoch(_) => None,
            RawTime::Text(raw) => DateTime::parse_from_rfc3339(raw.trim())
                .ok()
                .map(|at| at.with_timezone(&Utc)),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<Arc<str>> {
    value
        .map(|val| val.trim().to_string())
        .filter(|val| !val.is_empty())
        .map(Into::into)
}

/// `None` for values that do not fit a `TimeDelta`.
fn minutes_delta(minutes: f64) -> Option<TimeDelta> {
    let secs = (minutes * 60.0).round();
    if !secs.is_finite() || secs.abs() >= i64::MAX as f64 {
        return None;
    }
    TimeDelta::try_seconds(secs as i64)
}

impl RawArrival {
    fn into_arrival(self, fallback_stop: Option<&Arc<str>>, received_at: DateTime<Utc>) -> Option<Arrival> {
        let stop_id = non_empty(self.stop_id).or_else(|| fallback_stop.cloned())?;
        let route_label = non_empty(self.route_name)?;
        let predicted_at = match (&self.predicted_time, self.predicted_minutes) {
            (Some(time), _) => time.resolve()?,
            (None, Some(minutes)) => received_at.checked_add_signed(minutes_delta(minutes)?)?,
            _ => return None,
        };
        let delay_seconds = self
            .current_delay_minutes
            .and_then(minutes_delta)
            .and_then(|delay| i32::try_from(delay.num_seconds()).ok());
        Some(Arrival {
            stop_id,
            route_id: non_empty(self.route_id).unwrap_or_else(|| route_label.clone()),
            route_label,
            route_color: non_empty(self.route_color),
            trip_id: non_empty(self.trip_id),
            headsign: non_empty(self.headsign),
            predicted_at,
            scheduled_at: None,
            delay_seconds,
            source: ArrivalSource::ExternalPredicted,
            freshness: Freshness::Fresh,
        })
    }
}

/// Turns a predictor response body into ordered arrivals.
///
/// Entries lacking a stop, a route label or a predicted time are skipped.
/// An empty list is a valid answer; a non-empty list with no usable entry is
/// not.
pub fn normalize(
    body: &[u8],
    received_at: DateTime<Utc>,
    limit: usize,
) -> Result<Vec<Arrival>, self::Error> {
    let response: RawResponse =
        serde_json::from_slice(body).map_err(|err| Error::Response(err.to_string()))?;
    let fallback_stop = non_empty(response.stop_id);
    let total = response.arrivals.len();

    let mut arrivals: Vec<Arrival> = Vec::with_capacity(total);
    for (i, raw) in response.arrivals.into_iter().enumerate() {
        match raw.into_arrival(fallback_stop.as_ref(), received_at) {
            Some(arrival) => arrivals.push(arrival),
            None => warn!("Skipping predictor entry {i}: missing stop, route or time"),
        }
    }
    if total > 0 && arrivals.is_empty() {
        return Err(Error::Response(format!("none of {total} entries were usable")));
    }

    arrivals.sort_by(|a, b| a.order(b));
    arrivals.truncate(limit);
    Ok(arrivals)
}

/// HTTP client for the external arrival prediction API.
#[derive(Debug, Clone)]
pub struct PredictorClient {
    client: reqwest::Client,
    base_url: String,
    system_id: u32,
    timeout: Duration,
}

impl PredictorClient {
    pub fn new(base_url: impl Into<String>, system_id: u32) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            system_id,
            timeout: Duration::from_secs(10),
        }
    }

    pub fn from_config(config: &DataSourceConfig) -> Self {
        Self::new(config.mint_api_url.clone(), config.mint_system_id)
            .with_timeout(config.predictor_timeout())
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, segments: &[&str]) -> Result<reqwest::Url, self::Error> {
        let invalid = |reason: String| {
            Error::Fetch(FetchError::InvalidUrl {
                url: self.base_url.clone(),
                reason,
            })
        };
        let mut url = reqwest::Url::parse(&self.base_url).map_err(|err| invalid(err.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| invalid("cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

#[async_trait]
impl Predictor for PredictorClient {
    async fn predict(&self, stop_id: &str, limit: usize) -> Result<Vec<Arrival>, self::Error> {
        let url = self.endpoint(&["api", "predictions", "stop", stop_id, "arrivals"])?;
        let query = [("system_id", self.system_id.to_string())];
        let body = fetch_bytes(&self.client, url.as_str(), &query, self.timeout, MAX_RESPONSE_SIZE).await?;
        let arrivals = normalize(&body, Utc::now(), limit)?;
        debug!("Predictor returned {} arrivals for stop {stop_id}", arrivals.len());
        Ok(arrivals)
    }

    async fn health(&self) -> Result<(), self::Error> {
        let url = self.endpoint(&["api", "health"])?;
        fetch_bytes(&self.client, url.as_str(), &[], self.timeout, MAX_RESPONSE_SIZE).await?;
        Ok(())
    }
}
