//! Storage trait: the persistence boundary.
//!
//! The entity store and the settings registry persist through this narrow
//! key/value interface. Keys are `/`-separated paths; [`StorageQuery`] is an
//! ordered prefix scan, which is all the relational lookups need.
//!
//! Implementations: SQLite (sqlx) and in-memory (for testing and ephemeral
//! sessions).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// An ordered scan over keys sharing a prefix.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageQuery {
    pub prefix: String,

    /// Maximum rows returned; `None` means all
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,

    /// Take the last `limit` rows instead of the first; rows still come back
    /// in ascending key order
    #[serde(default)]
    pub tail: bool,
}

impl StorageQuery {
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            ..Self::default()
        }
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn tail(mut self) -> Self {
        self.tail = true;
        self
    }
}

/// The core StorageBackend trait.
///
/// Any failure to reach the underlying engine is reported as
/// [`StoreError::Unavailable`]; callers decide whether to retry.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// The backend name (e.g., "sqlite", "memory").
    fn name(&self) -> &str;

    /// Read the value stored under `key`.
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Insert or replace the value stored under `key`.
    async fn write(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    /// Remove `key`. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Rows whose key starts with the prefix, in key order.
    async fn query(&self, query: StorageQuery) -> Result<Vec<(String, Vec<u8>)>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_builder() {
        let q = StorageQuery::prefix("message/").limit(10).tail();
        assert_eq!(q.prefix, "message/");
        assert_eq!(q.limit, Some(10));
        assert!(q.tail);
    }

    #[test]
    fn default_query_is_unbounded() {
        let q = StorageQuery::prefix("user/");
        assert!(q.limit.is_none());
        assert!(!q.tail);
    }
}
