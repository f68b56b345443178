use bsds::{
    config::Mode,
    merge::{Arrival, Freshness},
    provider::ArrivalBoard,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArrivalDto {
    #[serde(flatten)]
    pub arrival: Arrival,
    pub minutes: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardDto {
    pub stop_id: String,
    pub stop_name: Option<String>,
    pub arrivals: Vec<ArrivalDto>,
    pub fetched_at: DateTime<Utc>,
    pub mode: Mode,
    pub fallback: bool,
    pub freshness: Freshness,
}

impl BoardDto {
    pub fn from(board: &ArrivalBoard, now: DateTime<Utc>) -> Self {
        let arrivals = board
            .arrivals
            .iter()
            .map(|arrival| ArrivalDto {
                minutes: arrival.minutes_until(now),
                arrival: arrival.clone(),
            })
            .collect();
        Self {
            stop_id: board.stop_id.to_string(),
            stop_name: board.stop_name.as_deref().map(str::to_string),
            arrivals,
            fetched_at: board.fetched_at,
            mode: board.mode,
            fallback: board.fallback,
            freshness: board.freshness,
        }
    }
}
