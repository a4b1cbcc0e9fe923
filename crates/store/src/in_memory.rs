//! In-memory backend, useful for testing and ephemeral sessions.

use async_trait::async_trait;
use parley_core::error::StoreError;
use parley_core::storage::{StorageBackend, StorageQuery};
use std::collections::BTreeMap;
use tokio::sync::RwLock;

/// A storage backend that keeps every row in an ordered map.
/// Nothing survives the process.
pub struct InMemoryBackend {
    rows: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(BTreeMap::new()),
        }
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageBackend for InMemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.rows.read().await.get(key).cloned())
    }

    async fn write(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.rows.write().await.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.rows.write().await.remove(key).is_some())
    }

    async fn query(&self, query: StorageQuery) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let rows = self.rows.read().await;
        let matching = rows
            .range(query.prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&query.prefix))
            .map(|(k, v)| (k.clone(), v.clone()));

        let mut results: Vec<(String, Vec<u8>)> = matching.collect();
        if let Some(limit) = query.limit {
            if query.tail {
                let skip = results.len().saturating_sub(limit);
                results.drain(..skip);
            } else {
                results.truncate(limit);
            }
        }
        Ok(results)
    }
}
