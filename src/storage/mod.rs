//! Content-addressed storage.
//!
//! Publications and evidence ciphertext are stored by CID. The backend is
//! picked at construction from `[storage]`: `MemoryStore` for ephemeral
//! nodes, `FileStore` for durable ones.

pub mod file;
pub mod memory;
pub mod traits;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use traits::{ContentRef, StorageBackend, StorageError, StorageResult};

use crate::config::{ConfigError, StorageConfig, StorageKind};
use std::sync::Arc;

/// Open the backend described by `config`.
pub async fn open_backend(config: &StorageConfig) -> Result<Arc<dyn StorageBackend>, ConfigError> {
    match config.backend {
        StorageKind::Memory => Ok(Arc::new(MemoryStore::new())),
        StorageKind::File => {
            let path = config.path.as_ref().ok_or_else(|| {
                ConfigError::Invalid("storage.path is required for the file backend".to_string())
            })?;
            let store = FileStore::open(path)
                .await
                .map_err(|e| ConfigError::Invalid(format!("cannot open {}: {}", path.display(), e)))?;
            Ok(Arc::new(store))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_open_file_backend() {
        let dir = TempDir::new().unwrap();
        let config = StorageConfig {
            backend: StorageKind::File,
            path: Some(dir.path().join("content")),
        };
        let store = open_backend(&config).await.unwrap();
        let r = store.add(b"x").await.unwrap();
        assert!(dir.path().join("content").join(r.to_string()).exists());
    }

    #[tokio::test]
    async fn test_open_file_backend_without_path() {
        let config = StorageConfig {
            backend: StorageKind::File,
            path: None,
        };
        assert!(open_backend(&config).await.is_err());
    }
}
