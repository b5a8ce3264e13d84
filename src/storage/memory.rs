//! Ephemeral in-process store.

use super::traits::*;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// In-memory store; content is lost when the process exits.
#[derive(Clone, Default)]
pub struct MemoryStore {
    blobs: Arc<Mutex<HashMap<ContentRef, Vec<u8>>>>,
    offline: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the storage network being unreachable.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_online(&self) -> StorageResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StorageError::Unavailable("memory store offline".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl StorageBackend for MemoryStore {
    async fn add(&self, data: &[u8]) -> StorageResult<ContentRef> {
        self.check_online()?;
        let content_ref = ContentRef::for_bytes(data);
        self.blobs
            .lock()
            .entry(content_ref.clone())
            .or_insert_with(|| data.to_vec());
        Ok(content_ref)
    }

    async fn get(&self, content_ref: &ContentRef) -> StorageResult<Vec<u8>> {
        self.check_online()?;
        self.blobs
            .lock()
            .get(content_ref)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(content_ref.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_add_get() {
        let store = MemoryStore::new();
        let r = store.add(b"leaflet").await.unwrap();
        assert_eq!(store.get(&r).await.unwrap(), b"leaflet");
    }

    #[tokio::test]
    async fn test_add_is_idempotent() {
        let store = MemoryStore::new();
        let a = store.add(b"same").await.unwrap();
        let b = store.add(b"same").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_content() {
        let store = MemoryStore::new();
        let r = ContentRef::for_bytes(b"never stored");
        assert!(matches!(
            store.get(&r).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_offline_is_retryable() {
        let store = MemoryStore::new();
        store.set_offline(true);
        let err = store.add(b"x").await.unwrap_err();
        assert!(err.is_retryable());
    }
}
