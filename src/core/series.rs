//! OHLCV points and the result envelope every source returns

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::source::SourceId;

/// One bar of a price series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    #[serde(rename = "t")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "o")]
    pub open: f64,
    #[serde(rename = "h")]
    pub high: f64,
    #[serde(rename = "l")]
    pub low: f64,
    #[serde(rename = "c")]
    pub close: f64,
    #[serde(rename = "v")]
    pub volume: u64,
}

impl SeriesPoint {
    pub fn new(
        timestamp: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: u64,
    ) -> Self {
        SeriesPoint {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        }
    }
}

/// A fetched series together with its provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResult {
    pub points: Vec<SeriesPoint>,
    pub source_id: SourceId,
    pub fetched_at: DateTime<Utc>,
    /// Set exactly when the data did not come from a real market source.
    pub degraded: bool,
}

impl FetchResult {
    pub fn new(points: Vec<SeriesPoint>, source_id: SourceId, fetched_at: DateTime<Utc>) -> Self {
        FetchResult {
            points,
            source_id,
            fetched_at,
            degraded: source_id.is_synthetic(),
        }
    }

    pub fn last_point(&self) -> Option<&SeriesPoint> {
        self.points.last()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}
