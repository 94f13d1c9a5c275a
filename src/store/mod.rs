//! Two-tier series cache

pub mod disk;
pub mod memory;

use chrono::{DateTime, Duration, Utc};
use disk::DiskCollection;
use memory::MemoryCollection;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::core::cache::{CacheEntry, KeyValueCollection, symbol_prefix};
use crate::core::config::DataServiceConfig;
use crate::core::series::FetchResult;

/// Memory tier in front of an optional durable tier, addressed by the same keys.
///
/// Durable-tier failures never reach the caller: they are logged and the store
/// behaves as if that tier had missed.
pub struct CacheStore {
    memory: MemoryCollection,
    durable: Option<DiskCollection>,
}

impl CacheStore {
    pub fn memory_only() -> Self {
        Self {
            memory: MemoryCollection::new(),
            durable: None,
        }
    }

    pub fn with_durable(durable: DiskCollection) -> Self {
        Self {
            memory: MemoryCollection::new(),
            durable: Some(durable),
        }
    }

    /// Opens a durable tier at `path`, falling back to memory only if that fails.
    pub fn open(path: &Path) -> Self {
        match DiskCollection::open(path) {
            Ok(durable) => Self::with_durable(durable),
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "Durable cache unavailable, using memory only"
                );
                Self::memory_only()
            }
        }
    }

    pub fn from_config(config: &DataServiceConfig) -> Self {
        if !config.cache.persist {
            return Self::memory_only();
        }
        match config.default_data_path() {
            Ok(path) => Self::open(&path.join("cache")),
            Err(e) => {
                warn!(error = %e, "Could not determine a data directory, using memory only");
                Self::memory_only()
            }
        }
    }

    pub fn is_persistent(&self) -> bool {
        self.durable.is_some()
    }

    pub async fn get(&self, key: &str) -> Option<Arc<FetchResult>> {
        self.get_at(key, Utc::now()).await
    }

    /// Looks `key` up as of `now`. Expired entries are misses.
    pub async fn get_at(&self, key: &str, now: DateTime<Utc>) -> Option<Arc<FetchResult>> {
        if let Ok(Some(entry)) = self.memory.get(key).await {
            if !entry.is_expired_at(now) {
                debug!(key, "Cache HIT (memory)");
                return Some(entry.payload);
            }
            debug!(key, "Cache entry expired");
            let _ = self.memory.remove(key).await;
        }

        let durable = self.durable.as_ref()?;
        match durable.get(key).await {
            Ok(Some(entry)) if !entry.is_expired_at(now) => {
                debug!(key, "Cache HIT (disk)");
                let _ = self.memory.put(&entry).await;
                Some(entry.payload)
            }
            Ok(Some(_)) => {
                debug!(key, "Cache entry expired on disk");
                if let Err(e) = durable.remove(key).await {
                    warn!(key, error = %e, "Failed to drop expired disk entry");
                }
                None
            }
            Ok(None) => {
                debug!(key, "Cache MISS");
                None
            }
            Err(e) => {
                warn!(key, error = %e, "Unreadable disk entry treated as miss");
                None
            }
        }
    }

    pub async fn put(&self, key: &str, result: Arc<FetchResult>, ttl: Duration) {
        self.put_at(key, result, ttl, Utc::now()).await
    }

    pub async fn put_at(
        &self,
        key: &str,
        result: Arc<FetchResult>,
        ttl: Duration,
        now: DateTime<Utc>,
    ) {
        let entry = CacheEntry::new(key.to_string(), result, ttl, now);
        let _ = self.memory.put(&entry).await;
        if let Some(durable) = &self.durable {
            if let Err(e) = durable.put(&entry).await {
                warn!(key, error = %e, "Failed to write disk entry");
            }
        }
        debug!(key, "Cache PUT");
    }

    pub async fn invalidate(&self, key: &str) {
        let _ = self.memory.remove(key).await;
        if let Some(durable) = &self.durable {
            if let Err(e) = durable.remove(key).await {
                warn!(key, error = %e, "Failed to remove disk entry");
            }
        }
    }

    /// Drops every entry cached for `symbol`, returning how many memory entries went.
    pub async fn invalidate_symbol(&self, symbol: &str) -> usize {
        let prefix = symbol_prefix(symbol);
        let removed = self.memory.remove_prefix(&prefix).await.unwrap_or(0);
        if let Some(durable) = &self.durable {
            if let Err(e) = durable.remove_prefix(&prefix).await {
                warn!(symbol, error = %e, "Failed to invalidate disk entries");
            }
        }
        debug!(symbol, removed, "Cache invalidated for symbol");
        removed
    }

    pub async fn clear(&self) {
        let _ = self.memory.clear().await;
        if let Some(durable) = &self.durable {
            if let Err(e) = durable.clear().await {
                warn!(error = %e, "Failed to clear disk cache");
            }
        }
        debug!("Cache CLEAR");
    }

    /// Sweeps expired entries from both tiers. Lookups never depend on this.
    pub async fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut purged = self.memory.purge_expired(now).await;
        if let Some(durable) = &self.durable {
            match durable.purge_expired(now) {
                Ok(count) => purged += count,
                Err(e) => warn!(error = %e, "Failed to purge disk cache"),
            }
        }
        purged
    }

    /// Number of entries in the memory tier, expired ones included.
    pub async fn len(&self) -> usize {
        self.memory.len().await
    }

    pub async fn is_empty(&self) -> bool {
        self.memory.is_empty().await
    }
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::memory_only()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::series::SeriesPoint;
    use crate::core::source::SourceId;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn result() -> Arc<FetchResult> {
        let points = vec![SeriesPoint::new(
            Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
            10.0,
            12.0,
            9.5,
            11.25,
            300,
        )];
        Arc::new(FetchResult::new(points, SourceId::Primary, Utc::now()))
    }

    #[tokio::test]
    async fn test_put_then_get_returns_equal_result() {
        let store = CacheStore::memory_only();
        let stored = result();
        store.put("ABC:1", stored.clone(), Duration::seconds(60)).await;
        assert_eq!(store.get("ABC:1").await, Some(stored));
        assert!(store.get("ABC:2").await.is_none());
    }

    #[tokio::test]
    async fn test_expired_entry_is_a_miss() {
        let store = CacheStore::memory_only();
        let now = Utc::now();
        store
            .put_at("ABC:1", result(), Duration::seconds(10), now)
            .await;
        assert!(store.get_at("ABC:1", now + Duration::seconds(10)).await.is_some());
        assert!(store.get_at("ABC:1", now + Duration::seconds(11)).await.is_none());
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn test_durable_tier_repopulates_memory() {
        let dir = tempdir().unwrap();
        let store = CacheStore::open(dir.path());
        assert!(store.is_persistent());

        let stored = result();
        store.put("ABC:1", stored.clone(), Duration::seconds(60)).await;
        store.memory.clear().await.unwrap();
        assert_eq!(store.len().await, 0);

        assert_eq!(store.get("ABC:1").await, Some(stored));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_unreadable_disk_entry_is_a_miss_until_overwritten() {
        let dir = tempdir().unwrap();
        let store = CacheStore::open(dir.path());
        let durable = store.durable.as_ref().unwrap();
        durable.insert_raw("ABC:1", b"{\"key\": truncated").unwrap();

        assert!(store.get("ABC:1").await.is_none());
        assert_eq!(store.len().await, 0);

        let stored = result();
        store.put("ABC:1", stored.clone(), Duration::seconds(60)).await;
        store.memory.clear().await.unwrap();
        assert_eq!(store.get("ABC:1").await, Some(stored));
    }

    #[tokio::test]
    async fn test_invalidate_symbol_only_touches_that_symbol() {
        let dir = tempdir().unwrap();
        let store = CacheStore::open(dir.path());
        store.put("ABC:1", result(), Duration::seconds(60)).await;
        store.put("ABC:2", result(), Duration::seconds(60)).await;
        store.put("XYZ:1", result(), Duration::seconds(60)).await;

        assert_eq!(store.invalidate_symbol("ABC").await, 2);
        assert!(store.get("ABC:1").await.is_none());
        assert!(store.get("XYZ:1").await.is_some());

        store.invalidate("XYZ:1").await;
        assert!(store.get("XYZ:1").await.is_none());
    }

    #[tokio::test]
    async fn test_clear_and_purge() {
        let store = CacheStore::memory_only();
        let now = Utc::now();
        store.put_at("A:1", result(), Duration::seconds(-1), now).await;
        store.put_at("B:1", result(), Duration::seconds(60), now).await;
        assert_eq!(store.purge_expired().await, 1);
        assert_eq!(store.len().await, 1);

        store.clear().await;
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_unopenable_path_degrades_to_memory() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let store = CacheStore::open(&blocker.join("cache"));
        assert!(!store.is_persistent());
        store.put("ABC:1", result(), Duration::seconds(60)).await;
        assert!(store.get("ABC:1").await.is_some());
    }

    #[test]
    fn test_from_config_without_persistence() {
        let mut config = DataServiceConfig::default();
        config.cache.persist = false;
        assert!(!CacheStore::from_config(&config).is_persistent());
    }
}
