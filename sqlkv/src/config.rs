//! Configuration options for key-value operations.

use std::time::Duration;

use common::{RetryPolicy, StorageConfig};
use serde::{Deserialize, Serialize};

/// Configuration for opening a [`KeyValueDb`](crate::KeyValueDb).
///
/// ```json
/// {
///   "storage": { "type": "Postgres", "url": "postgres://root@localhost:26257/kv" },
///   "batch_size": 500,
///   "retry": { "max_attempts": 5, "base_delay": "20ms" },
///   "operation_timeout": "30s"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage backend configuration.
    pub storage: StorageConfig,

    /// Number of records fetched per round trip while iterating.
    pub batch_size: usize,

    /// Retry budget for compare-and-swap transactions aborted by conflicts.
    pub retry: RetryPolicy,

    /// Upper bound for every operation, and for every batch fetched during
    /// iteration. `None` waits indefinitely.
    #[serde(with = "humantime_serde")]
    pub operation_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            batch_size: 10_000,
            retry: RetryPolicy::default(),
            operation_timeout: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use common::PostgresStorageConfig;

    use super::*;

    #[test]
    fn should_fill_defaults_for_empty_config() {
        let config: Config = serde_json::from_str("{}").unwrap();

        assert_eq!(config, Config::default());
        assert_eq!(config.batch_size, 10_000);
        assert_eq!(config.storage, StorageConfig::InMemory);
        assert_eq!(config.operation_timeout, None);
    }

    #[test]
    fn should_deserialize_full_config() {
        // given
        let json = r#"{
            "storage": { "type": "Postgres", "url": "postgres://localhost/kv", "connections": 2 },
            "batch_size": 500,
            "retry": { "max_attempts": 5, "base_delay": "20ms" },
            "operation_timeout": "30s"
        }"#;

        // when
        let config: Config = serde_json::from_str(json).unwrap();

        // then
        assert_eq!(
            config.storage,
            StorageConfig::Postgres(PostgresStorageConfig {
                url: "postgres://localhost/kv".to_string(),
                connections: 2,
            })
        );
        assert_eq!(config.batch_size, 500);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay, Duration::from_millis(20));
        assert_eq!(config.operation_timeout, Some(Duration::from_secs(30)));
    }
}
