//! Core domain types and contracts

pub mod cache;
pub mod config;
pub mod error;
pub mod log;
pub mod quality;
pub mod request;
pub mod series;
pub mod source;
pub mod validate;

// Re-export main types for cleaner imports
pub use cache::{CacheEntry, CacheError, KeyValueCollection};
pub use config::DataServiceConfig;
pub use error::{DataError, FetchError};
pub use quality::{QualityFactor, QualityPolicy, QualityScore, QualityScorer};
pub use request::{DataRequest, Interval, Period, RequestClass, Symbol};
pub use series::{FetchResult, SeriesPoint};
pub use source::{SeriesSource, SourceId};
pub use validate::{Validator, Violation};
