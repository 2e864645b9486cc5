//! Storage factory for creating storage instances from configuration.

use std::sync::Arc;

use super::config::StorageConfig;
use super::in_memory::InMemoryStorage;
use super::postgres::PostgresStorage;
use super::{Storage, StorageResult};

/// Creates a storage instance based on the provided configuration.
///
/// For [`StorageConfig::Postgres`] this opens the configured connections
/// eagerly, so connectivity problems surface here rather than on first use.
pub async fn create_storage(config: &StorageConfig) -> StorageResult<Arc<dyn Storage>> {
    match config {
        StorageConfig::InMemory => Ok(Arc::new(InMemoryStorage::new())),
        StorageConfig::Postgres(pg_config) => {
            let storage = PostgresStorage::connect(pg_config).await?;
            Ok(Arc::new(storage))
        }
    }
}
