//! Storage backends and the entity store for Parley.

pub mod entity_store;
pub mod in_memory;
pub mod locks;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use entity_store::{EntityStore, MessageQuery, SELF_NATIVE_ID, SELF_PLATFORM};
pub use in_memory::InMemoryBackend;
pub use locks::KeyedLocks;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteBackend;

use parley_core::error::StoreError;
use parley_core::storage::StorageBackend;
use std::sync::Arc;

/// Open the backend named in configuration ("sqlite" or "memory").
///
/// `path` is the SQLite database file; ignored for the in-memory backend.
pub async fn open(backend: &str, path: &str) -> Result<Arc<dyn StorageBackend>, StoreError> {
    match backend {
        "memory" => Ok(Arc::new(InMemoryBackend::new())),
        #[cfg(feature = "sqlite")]
        "sqlite" => {
            let url = if path.starts_with("sqlite:") {
                path.to_string()
            } else {
                format!("sqlite://{path}")
            };
            Ok(Arc::new(SqliteBackend::new(&url).await?))
        }
        other => Err(StoreError::Unavailable(format!(
            "Unknown storage backend '{other}'"
        ))),
    }
}
