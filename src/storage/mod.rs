//! Storage abstraction: scalar values with TTL, append-only lists and key
//! enumeration over file, Redis, in-memory and hybrid backends.

pub mod error;
pub mod file;
pub mod hybrid;
pub mod locks;
pub mod memory;
pub mod pattern;
pub mod redis;
pub mod traits;
pub mod ttl;

pub use error::{Result, StorageError};
pub use file::FileStorage;
pub use hybrid::{HybridStorage, MigrationReport, SecondaryWrite};
pub use locks::KeyLocks;
pub use memory::InMemoryStorage;
pub use pattern::KeyPattern;
pub use redis::RedisStorage;
pub use traits::{list_range, slice_list, Storage};

use crate::config::{StorageBackend, StorageConfig};
use std::sync::Arc;

/// Create the storage backend selected by `config.backend`.
pub async fn create_storage(config: &StorageConfig) -> Result<Arc<dyn Storage>> {
    let storage: Arc<dyn Storage> = match config.backend {
        StorageBackend::Hybrid => Arc::new(create_hybrid_storage(config).await?),
        single => open_backend(single, config).await?,
    };
    tracing::info!(backend = storage.name(), "storage ready");
    Ok(storage)
}

/// Build the `[storage.hybrid]` composition regardless of `config.backend`.
pub async fn create_hybrid_storage(config: &StorageConfig) -> Result<HybridStorage> {
    let primary = open_backend(config.hybrid.primary, config).await?;
    let secondary = match config.hybrid.secondary {
        Some(kind) => Some(open_backend(kind, config).await?),
        None => None,
    };
    Ok(HybridStorage::new(primary, secondary).with_sync(config.hybrid.sync))
}

async fn open_backend(kind: StorageBackend, config: &StorageConfig) -> Result<Arc<dyn Storage>> {
    match kind {
        StorageBackend::File => Ok(Arc::new(
            FileStorage::open(config.resolved_data_dir()).await?,
        )),
        StorageBackend::Redis => Ok(Arc::new(RedisStorage::with_prefix(
            &config.redis_url,
            &config.key_prefix,
        )?)),
        StorageBackend::Memory => Ok(Arc::new(InMemoryStorage::new())),
        StorageBackend::Hybrid => Err(StorageError::backend(
            "hybrid",
            "a hybrid backend cannot be nested inside another",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HybridConfig;

    #[tokio::test]
    async fn factory_memory() {
        let config = StorageConfig {
            backend: StorageBackend::Memory,
            ..StorageConfig::default()
        };
        let storage = create_storage(&config).await.unwrap();
        assert_eq!(storage.name(), "memory");
    }

    #[tokio::test]
    async fn factory_file_uses_data_dir() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = StorageConfig {
            backend: StorageBackend::File,
            data_dir: tmp.path().to_string_lossy().into_owned(),
            ..StorageConfig::default()
        };
        let storage = create_storage(&config).await.unwrap();
        assert_eq!(storage.name(), "file");
        assert!(tmp.path().join("values").is_dir());
    }

    #[tokio::test]
    async fn factory_hybrid_applies_sync_flag() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = StorageConfig {
            backend: StorageBackend::Hybrid,
            data_dir: tmp.path().to_string_lossy().into_owned(),
            hybrid: HybridConfig {
                primary: StorageBackend::Memory,
                secondary: Some(StorageBackend::File),
                sync: true,
            },
            ..StorageConfig::default()
        };
        let hybrid = create_hybrid_storage(&config).await.unwrap();
        assert!(hybrid.sync_enabled());
        assert_eq!(hybrid.primary().name(), "memory");
        assert_eq!(hybrid.secondary().map(|s| s.name()), Some("file"));

        let storage = create_storage(&config).await.unwrap();
        assert_eq!(storage.name(), "hybrid");
    }

    #[tokio::test]
    async fn factory_rejects_nested_hybrid() {
        let config = StorageConfig {
            backend: StorageBackend::Hybrid,
            hybrid: HybridConfig {
                primary: StorageBackend::Hybrid,
                secondary: None,
                sync: false,
            },
            ..StorageConfig::default()
        };
        assert!(matches!(
            create_storage(&config).await,
            Err(StorageError::Backend { .. })
        ));
    }
}
