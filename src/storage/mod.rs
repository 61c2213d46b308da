//! # Storage
//!
//! Pluggable async persistence behind the [`StorageAdapter`] trait. History
//! and the state store only ever see `Arc<dyn StorageAdapter>`; which backend
//! sits behind it is decided once, from config, by [`build_storage`].

pub mod adapter;
pub mod adapters;

use std::sync::Arc;

use log::{info, warn};

pub use adapter::{StorageAdapter, StorageError};
pub use adapters::{FileStorage, MemoryStorage};

use crate::core::config::{ResolvedConfig, StorageBackend};

/// Build a storage adapter from a resolved config.
///
/// A file store that cannot be opened falls back to memory so navigation
/// keeps working without persistence.
pub fn build_storage(config: &ResolvedConfig) -> Arc<dyn StorageAdapter> {
    match config.storage {
        StorageBackend::Memory => Arc::new(MemoryStorage::new()),
        StorageBackend::File => {
            let dir = config
                .storage_dir
                .clone()
                .or_else(FileStorage::default_dir);
            let Some(dir) = dir else {
                warn!("No storage directory available, falling back to memory storage");
                return Arc::new(MemoryStorage::new());
            };
            match FileStorage::open(&dir) {
                Ok(storage) => {
                    info!("Using file storage at {}", dir.display());
                    Arc::new(storage)
                }
                Err(e) => {
                    warn!("Failed to open file storage at {}: {}", dir.display(), e);
                    Arc::new(MemoryStorage::new())
                }
            }
        }
    }
}

/// Moves an unreadable record aside under a unique backup key and removes
/// the original. Best effort: failures are only logged.
pub(crate) async fn quarantine(storage: &dyn StorageAdapter, key: &str, raw: &str) {
    let backup_key = format!("{}.corrupt-{}", key, uuid::Uuid::new_v4());
    warn!("Corrupt record under {}, moved to {}", key, backup_key);
    if let Err(e) = storage.set_item(&backup_key, raw).await {
        warn!("Failed to write quarantine copy {}: {}", backup_key, e);
    }
    if let Err(e) = storage.remove_item(key).await {
        warn!("Failed to remove corrupt record {}: {}", key, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_quarantine_moves_record_aside() {
        let storage = MemoryStorage::new();
        storage.set_item("history_P", "not json").await.unwrap();

        quarantine(&storage, "history_P", "not json").await;

        let keys = storage.keys();
        assert_eq!(keys.len(), 1);
        assert!(keys[0].starts_with("history_P.corrupt-"));
        assert_eq!(storage.get_item("history_P").await.unwrap(), None);
    }

    #[test]
    fn test_build_storage_memory_backend() {
        let config = ResolvedConfig::default();
        let storage = build_storage(&config);
        assert_eq!(storage.name(), "memory");
    }

    #[test]
    fn test_build_storage_file_backend() {
        let dir = tempfile::tempdir().unwrap();
        let config = ResolvedConfig {
            storage: StorageBackend::File,
            storage_dir: Some(dir.path().join("flow")),
            ..Default::default()
        };
        let storage = build_storage(&config);
        assert_eq!(storage.name(), "file");
    }
}
