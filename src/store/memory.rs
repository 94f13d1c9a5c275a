use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use crate::core::cache::{CacheEntry, CacheError, KeyValueCollection};

/// In-process tier: a map behind an async read/write lock.
#[derive(Default)]
pub struct MemoryCollection {
    inner: RwLock<HashMap<String, CacheEntry>>,
}

impl MemoryCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    /// Drops every entry that expired before `now`.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut map = self.inner.write().await;
        let before = map.len();
        map.retain(|_, entry| !entry.is_expired_at(now));
        let purged = before - map.len();
        debug!(purged, "Purged expired memory entries");
        purged
    }
}

#[async_trait]
impl KeyValueCollection for MemoryCollection {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self.inner.read().await.get(key).cloned())
    }

    async fn put(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        self.inner
            .write()
            .await
            .insert(entry.key.clone(), entry.clone());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), CacheError> {
        self.inner.write().await.remove(key);
        Ok(())
    }

    async fn remove_prefix(&self, prefix: &str) -> Result<usize, CacheError> {
        let mut map = self.inner.write().await;
        let before = map.len();
        map.retain(|key, _| !key.starts_with(prefix));
        Ok(before - map.len())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.inner.write().await.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::series::FetchResult;
    use crate::core::source::SourceId;
    use chrono::Duration;
    use std::sync::Arc;

    fn entry(key: &str, ttl_secs: i64) -> CacheEntry {
        let now = Utc::now();
        let payload = Arc::new(FetchResult::new(vec![], SourceId::Primary, now));
        CacheEntry::new(key.to_string(), payload, Duration::seconds(ttl_secs), now)
    }

    #[tokio::test]
    async fn test_collection_get_put() {
        let collection = MemoryCollection::new();
        assert!(collection.get("key1").await.unwrap().is_none());

        collection.put(&entry("key1", 60)).await.unwrap();
        let found = collection.get("key1").await.unwrap().unwrap();
        assert_eq!(found.key, "key1");
        assert!(collection.get("key2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_collection_remove_prefix() {
        let collection = MemoryCollection::new();
        collection.put(&entry("ABC:1", 60)).await.unwrap();
        collection.put(&entry("ABC:2", 60)).await.unwrap();
        collection.put(&entry("ABCD:1", 60)).await.unwrap();

        assert_eq!(collection.remove_prefix("ABC:").await.unwrap(), 2);
        assert_eq!(collection.len().await, 1);
        assert!(collection.get("ABCD:1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_collection_purge_and_clear() {
        let collection = MemoryCollection::new();
        collection.put(&entry("old", -5)).await.unwrap();
        collection.put(&entry("new", 60)).await.unwrap();

        assert_eq!(collection.purge_expired(Utc::now()).await, 1);
        assert_eq!(collection.len().await, 1);

        collection.clear().await.unwrap();
        assert!(collection.is_empty().await);
    }
}
