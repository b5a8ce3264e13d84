//! Durable store: one file per CID under a root directory.

use super::traits::*;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, error};

#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub async fn open(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, content_ref: &ContentRef) -> PathBuf {
        self.root.join(content_ref.to_string())
    }
}

#[async_trait]
impl StorageBackend for FileStore {
    async fn add(&self, data: &[u8]) -> StorageResult<ContentRef> {
        let content_ref = ContentRef::for_bytes(data);
        let path = self.blob_path(&content_ref);

        if fs::try_exists(&path).await? {
            return Ok(content_ref);
        }

        // Write then rename so readers never see a partial blob
        let tmp = path.with_extension(format!("tmp-{}", rand::random::<u64>()));
        fs::write(&tmp, data).await?;
        fs::rename(&tmp, &path).await?;

        debug!(cid = %content_ref, bytes = data.len(), "blob stored");
        Ok(content_ref)
    }

    async fn get(&self, content_ref: &ContentRef) -> StorageResult<Vec<u8>> {
        let data = match fs::read(self.blob_path(content_ref)).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StorageError::NotFound(content_ref.clone()))
            }
            Err(e) => return Err(e.into()),
        };

        if !content_ref.matches(&data) {
            error!(cid = %content_ref, "stored blob does not match its content reference");
            return Err(StorageError::Corrupted(content_ref.clone()));
        }
        Ok(data)
    }
}
