//! Arrival board core for a single transit stop.
//!
//! The static GTFS bundle is indexed by stop ([`schedule::ScheduleIndex`]), real-time
//! trip updates are decoded into a [`realtime::FeedSnapshot`] and joined onto the
//! schedule by [`merge::merge`]. The [`provider::ArrivalProvider`] chooses between the
//! external predictor and that GTFS path, caches the result and falls back when a
//! source fails.

pub mod config;
pub mod gtfs;
pub mod merge;
pub mod offline;
pub mod predictor;
pub mod provider;
pub mod realtime;
pub mod refresh;
pub mod schedule;
pub mod shared;

pub mod prelude {
    pub use crate::config::{Config, Mode};
    pub use crate::gtfs::Gtfs;
    pub use crate::merge::{Arrival, ArrivalSource, Freshness, merge};
    pub use crate::predictor::PredictorClient;
    pub use crate::provider::{ArrivalBoard, ArrivalProvider, IndexHandle};
    pub use crate::realtime::{FeedReader, FeedSnapshot};
    pub use crate::schedule::{ScheduleIndex, ScheduledDeparture};
    pub use crate::shared::{FetchError, Time};
}
