use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use crate::core::cache::{CacheEntry, CacheError, KeyValueCollection};
use crate::core::series::{FetchResult, SeriesPoint};
use crate::core::source::SourceId;

const PARTITION: &str = "series";

/// Self-contained on-disk form of one entry.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheRecord {
    key: String,
    source_id: SourceId,
    fetched_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    points: Vec<SeriesPoint>,
}

impl From<&CacheEntry> for CacheRecord {
    fn from(entry: &CacheEntry) -> Self {
        CacheRecord {
            key: entry.key.clone(),
            source_id: entry.payload.source_id,
            fetched_at: entry.payload.fetched_at,
            created_at: entry.created_at,
            expires_at: entry.expires_at,
            points: entry.payload.points.clone(),
        }
    }
}

impl From<CacheRecord> for CacheEntry {
    fn from(record: CacheRecord) -> Self {
        CacheEntry {
            key: record.key,
            payload: Arc::new(FetchResult::new(
                record.points,
                record.source_id,
                record.fetched_at,
            )),
            created_at: record.created_at,
            expires_at: record.expires_at,
        }
    }
}

/// Durable tier backed by a fjall keyspace, one JSON record per key.
pub struct DiskCollection {
    keyspace: Keyspace,
    partition: PartitionHandle,
}

impl DiskCollection {
    pub fn open(path: &Path) -> Result<Self, CacheError> {
        std::fs::create_dir_all(path)?;
        let keyspace = fjall::Config::new(path).open()?;
        let partition = keyspace.open_partition(PARTITION, PartitionCreateOptions::default())?;
        Ok(Self {
            keyspace,
            partition,
        })
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<Vec<u8>>, CacheError> {
        let mut keys = Vec::new();
        for item in self.partition.prefix(prefix) {
            let (key, _) = item?;
            keys.push(key.to_vec());
        }
        Ok(keys)
    }

    /// Drops records that expired before `now`. Unreadable records are dropped as well.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, CacheError> {
        let mut dead = Vec::new();
        for item in self.partition.iter() {
            let (key, value) = item?;
            let expired = serde_json::from_slice::<CacheRecord>(&value)
                .map(|record| now > record.expires_at)
                .unwrap_or(true);
            if expired {
                dead.push(key.to_vec());
            }
        }
        for key in &dead {
            self.partition.remove(key.as_slice())?;
        }
        debug!(purged = dead.len(), "Purged expired disk entries");
        Ok(dead.len())
    }

    #[cfg(test)]
    pub(crate) fn insert_raw(&self, key: &str, bytes: &[u8]) -> Result<(), CacheError> {
        self.partition.insert(key, bytes)?;
        Ok(())
    }
}

#[async_trait]
impl KeyValueCollection for DiskCollection {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        match self.partition.get(key)? {
            Some(value) => {
                let record: CacheRecord = serde_json::from_slice(&value)?;
                Ok(Some(record.into()))
            }
            None => Ok(None),
        }
    }

    async fn put(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        let bytes = serde_json::to_vec(&CacheRecord::from(entry))?;
        self.partition.insert(entry.key.as_str(), bytes)?;
        self.keyspace.persist(PersistMode::Buffer)?;
        debug!(key = %entry.key, "Disk PUT");
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), CacheError> {
        self.partition.remove(key)?;
        Ok(())
    }

    async fn remove_prefix(&self, prefix: &str) -> Result<usize, CacheError> {
        let keys = self.keys_with_prefix(prefix)?;
        for key in &keys {
            self.partition.remove(key.as_slice())?;
        }
        Ok(keys.len())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.remove_prefix("").await.map(|_| ())
    }
}
