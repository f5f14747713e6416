//! Process configuration
//!
//! - `DATABASE_URL` - SQLite URL (default: sqlite://batch-registry.db)
//! - `MAX_DB_CONNECTIONS` - Pool size (default: 5)
//! - `HASH_SCHEME` - `compat` or `domain_separated` (default: compat)

use crate::crypto::HashScheme;
use crate::infra::{Result, SqliteRecordStore};

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub scheme: HashScheme,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://batch-registry.db".to_string(),
            max_connections: 5,
            scheme: HashScheme::Compat,
        }
    }
}

impl RegistryConfig {
    /// Load configuration from environment.
    ///
    /// An unknown `HASH_SCHEME` is an error rather than a silent default,
    /// since it changes every root.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let database_url = std::env::var("DATABASE_URL").unwrap_or(defaults.database_url);

        let max_connections = std::env::var("MAX_DB_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_connections);

        let scheme = match std::env::var("HASH_SCHEME") {
            Ok(value) => value.parse()?,
            Err(_) => defaults.scheme,
        };

        Ok(Self {
            database_url,
            max_connections,
            scheme,
        })
    }

    /// Open the store and apply pending migrations
    pub async fn open_store(&self) -> Result<SqliteRecordStore> {
        let store = SqliteRecordStore::connect(&self.database_url, self.max_connections).await?;
        store.initialize().await?;
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RegistryConfig::default();
        assert_eq!(config.max_connections, 5);
        assert_eq!(config.scheme, HashScheme::Compat);
    }
}
