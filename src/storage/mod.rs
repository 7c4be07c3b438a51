// Re-export the storage trait
pub use crate::storage_traits::TokenStore;

use crate::config::{StoreBackend, StoreConfig};
use crate::error::{CustodyError, Result};
use std::sync::Arc;

mod memory;
pub use memory::MemoryTokenStore;

// Export implementations
#[cfg(feature = "sqlite")]
mod sqlite;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteTokenStore;

#[cfg(feature = "rocksdb")]
mod rocksdb;
#[cfg(feature = "rocksdb")]
pub use self::rocksdb::RocksDbTokenStore;

/// Open the backend named in the configuration
pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn TokenStore>> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryTokenStore::new())),
        #[cfg(feature = "sqlite")]
        StoreBackend::Sqlite => Ok(Arc::new(
            SqliteTokenStore::open(&config.path, config.max_connections).await?,
        )),
        #[cfg(feature = "rocksdb")]
        StoreBackend::Rocksdb => Ok(Arc::new(RocksDbTokenStore::new(&config.path)?)),
        #[allow(unreachable_patterns)]
        other => Err(CustodyError::Config(format!(
            "store backend {:?} is not compiled in",
            other
        ))),
    }
}
