//! Source identity and the fetch contract every adapter implements

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::str::FromStr;

use crate::core::error::FetchError;
use crate::core::request::{DataRequest, Interval};
use crate::core::series::FetchResult;

/// Where a series came from. `Synthetic` is never a network source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceId {
    Primary,
    Secondary,
    Tertiary,
    Synthetic,
}

impl SourceId {
    pub const NETWORK: [SourceId; 3] = [SourceId::Primary, SourceId::Secondary, SourceId::Tertiary];

    pub const fn as_str(self) -> &'static str {
        match self {
            SourceId::Primary => "primary",
            SourceId::Secondary => "secondary",
            SourceId::Tertiary => "tertiary",
            SourceId::Synthetic => "synthetic",
        }
    }

    pub const fn is_synthetic(self) -> bool {
        matches!(self, SourceId::Synthetic)
    }
}

impl Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "primary" => Ok(SourceId::Primary),
            "secondary" => Ok(SourceId::Secondary),
            "tertiary" => Ok(SourceId::Tertiary),
            "synthetic" => Ok(SourceId::Synthetic),
            other => Err(format!("unknown source '{other}'")),
        }
    }
}

/// A remote provider of OHLCV series.
///
/// Implementations perform exactly one attempt per call; throttling, retries and
/// timeouts are applied around them by the caller.
#[async_trait]
pub trait SeriesSource: Send + Sync {
    fn id(&self) -> SourceId;

    /// Whether the source can serve the given interval at all.
    fn supports(&self, _interval: Interval) -> bool {
        true
    }

    async fn fetch_series(&self, request: &DataRequest) -> Result<FetchResult, FetchError>;
}
