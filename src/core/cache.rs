use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use thiserror::Error;

use crate::core::request::{DataRequest, RequestClass};
use crate::core::series::FetchResult;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("storage error: {0}")]
    Storage(#[from] fjall::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A cached series. The payload is shared and never mutated once stored.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub payload: Arc<FetchResult>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(key: String, payload: Arc<FetchResult>, ttl: Duration, now: DateTime<Utc>) -> Self {
        CacheEntry {
            key,
            payload,
            created_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Derives the cache key for a request.
///
/// The key is `SYMBOL:<hash>`; the symbol prefix lets a whole symbol be
/// invalidated at once. `as_of` is rounded down to `bucket` so requests made
/// within the same bucket share an entry.
pub fn cache_key(request: &DataRequest, class: RequestClass, bucket: Duration) -> String {
    let bucket_secs = bucket.num_seconds().max(1);
    let bucket_start = request.as_of().timestamp().div_euclid(bucket_secs) * bucket_secs;

    let mut hasher = blake3::Hasher::new();
    hasher.update(request.symbol().as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(request.period().as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(request.interval().as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(class.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(&bucket_start.to_le_bytes());
    let digest = hasher.finalize().to_hex();

    format!("{}:{}", request.symbol(), &digest[..32])
}

/// Prefix shared by every key of one symbol.
pub fn symbol_prefix(symbol: &str) -> String {
    format!("{symbol}:")
}

/// One tier of the cache.
#[async_trait]
pub trait KeyValueCollection: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError>;
    async fn put(&self, entry: &CacheEntry) -> Result<(), CacheError>;
    async fn remove(&self, key: &str) -> Result<(), CacheError>;
    /// Removes every key starting with `prefix`, returning how many were dropped.
    async fn remove_prefix(&self, prefix: &str) -> Result<usize, CacheError>;
    async fn clear(&self) -> Result<(), CacheError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::request::{Interval, Period, Symbol};
    use chrono::TimeZone;

    fn request(symbol: &str, minute: u32) -> DataRequest {
        DataRequest::new(
            Symbol::parse(symbol).unwrap(),
            Period::OneMonth,
            Interval::Daily,
            Utc.with_ymd_and_hms(2024, 3, 4, 10, minute, 0).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_key_is_stable_within_bucket() {
        let bucket = Duration::hours(1);
        let a = cache_key(&request("abc", 5), RequestClass::Historical, bucket);
        let b = cache_key(&request("ABC", 55), RequestClass::Historical, bucket);
        assert_eq!(a, b);
        assert!(a.starts_with(&symbol_prefix("ABC")));
    }

    #[test]
    fn test_key_differs_by_class_and_symbol() {
        let bucket = Duration::hours(1);
        let historical = cache_key(&request("ABC", 5), RequestClass::Historical, bucket);
        let quote = cache_key(&request("ABC", 5), RequestClass::Quote, bucket);
        let other = cache_key(&request("XYZ", 5), RequestClass::Historical, bucket);
        assert_ne!(historical, quote);
        assert_ne!(historical, other);
    }

    #[test]
    fn test_entry_expiry() {
        let now = Utc.with_ymd_and_hms(2024, 3, 4, 10, 0, 0).unwrap();
        let payload = Arc::new(FetchResult::new(
            vec![],
            crate::core::source::SourceId::Primary,
            now,
        ));
        let entry = CacheEntry::new("k".into(), payload, Duration::seconds(10), now);
        assert!(!entry.is_expired_at(now + Duration::seconds(10)));
        assert!(entry.is_expired_at(now + Duration::seconds(11)));
    }
}
