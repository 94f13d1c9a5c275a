//! Resilient multi-source OHLCV retrieval.
//!
//! [`DataService`] looks a request up in a two-tier cache, then asks each
//! configured source in priority order, validating and scoring what comes
//! back. When every source fails it answers with a reproducible synthetic
//! series flagged as degraded, so callers always get data plus a trust signal.

pub mod core;
pub mod providers;
pub mod service;
pub mod store;

pub use crate::core::{
    DataError, DataRequest, DataServiceConfig, FetchError, FetchResult, Interval, Period,
    QualityScore, RequestClass, SeriesPoint, SeriesSource, SourceId, Symbol,
};
pub use crate::service::{DataService, QuoteResponse, SeriesResponse};
pub use crate::store::CacheStore;
