//! Metadata store abstraction and implementation for packyard.
//!
//! This crate provides the control-plane data model:
//! - Release ledger (install/rollback attempts and their terminal status)
//! - Append-only object revisions and current-state pointers
//! - Install lock leases
//! - The built-in tenant configuration object table

pub mod error;
pub mod ledger;
pub mod models;
pub mod repos;
pub mod store;

pub use error::{MetadataError, MetadataResult};
pub use store::{MetadataStore, SqliteStore};

use packyard_core::config::{DEFAULT_SQLITE_BUSY_TIMEOUT_MS, MetadataConfig};
use std::sync::Arc;
use std::time::Duration;

/// Create a metadata store from configuration.
pub async fn from_config(config: &MetadataConfig) -> MetadataResult<Arc<dyn MetadataStore>> {
    match config {
        MetadataConfig::Sqlite {
            path,
            query_timeout_secs,
            busy_timeout_ms,
        } => {
            let busy_timeout = Duration::from_millis(
                busy_timeout_ms.unwrap_or(DEFAULT_SQLITE_BUSY_TIMEOUT_MS),
            );
            let store =
                SqliteStore::with_busy_timeout(path, *query_timeout_secs, busy_timeout).await?;
            Ok(Arc::new(store) as Arc<dyn MetadataStore>)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_from_config_sqlite() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("nested").join("packyard.db");
        let config = MetadataConfig::Sqlite {
            path: db_path.clone(),
            query_timeout_secs: None,
            busy_timeout_ms: Some(1_000),
        };

        let store = from_config(&config).await.unwrap();
        store.health_check().await.unwrap();
        assert!(db_path.exists());
    }
}
