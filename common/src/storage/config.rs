//! Storage backend configuration.

use serde::{Deserialize, Serialize};

/// Selects and configures the storage backend.
///
/// Serialized as an internally tagged enum:
///
/// ```json
/// { "type": "Postgres", "url": "postgres://root@localhost:26257/defaultdb", "connections": 8 }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StorageConfig {
    /// Process-local storage, lost when dropped. Intended for tests.
    #[default]
    InMemory,
    /// A PostgreSQL-compatible database (PostgreSQL or CockroachDB).
    Postgres(PostgresStorageConfig),
}

/// Connection settings for the Postgres backend.
///
/// The database must already contain the `pathdata` table:
///
/// ```sql
/// CREATE TABLE pathdata (
///     bucket   BYTEA NOT NULL,
///     fullpath BYTEA NOT NULL,
///     metadata BYTEA NOT NULL,
///     PRIMARY KEY (bucket, fullpath)
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostgresStorageConfig {
    /// libpq-style connection string or `postgres://` URL.
    pub url: String,
    /// Number of connections opened up front and shared by all callers.
    #[serde(default = "default_connections")]
    pub connections: usize,
}

fn default_connections() -> usize {
    4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_default_to_in_memory() {
        assert_eq!(StorageConfig::default(), StorageConfig::InMemory);
    }

    #[test]
    fn should_deserialize_tagged_in_memory() {
        let config: StorageConfig = serde_json::from_str(r#"{"type":"InMemory"}"#).unwrap();

        assert_eq!(config, StorageConfig::InMemory);
    }

    #[test]
    fn should_deserialize_postgres_with_default_connections() {
        // given
        let json = r#"{"type":"Postgres","url":"postgres://root@localhost:26257/kv"}"#;

        // when
        let config: StorageConfig = serde_json::from_str(json).unwrap();

        // then
        assert_eq!(
            config,
            StorageConfig::Postgres(PostgresStorageConfig {
                url: "postgres://root@localhost:26257/kv".to_string(),
                connections: 4,
            })
        );
    }
}
