//! Trait abstraction for content-addressed storage.

use async_trait::async_trait;
use cid::Cid;
use multihash_codetable::{Code, MultihashDigest};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Multicodec for raw bytes.
const RAW_CODEC: u64 = 0x55;

/// CIDv1 (raw codec, sha2-256) naming a stored blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentRef(Cid);

impl ContentRef {
    /// Reference for `data`. Deterministic: same bytes, same reference.
    pub fn for_bytes(data: &[u8]) -> Self {
        Self(Cid::new_v1(RAW_CODEC, Code::Sha2_256.digest(data)))
    }

    /// `true` when `data` hashes to this reference.
    pub fn matches(&self, data: &[u8]) -> bool {
        *self == Self::for_bytes(data)
    }

    pub fn cid(&self) -> &Cid {
        &self.0
    }
}

impl fmt::Display for ContentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ContentRef {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Cid::try_from(s)
            .map(Self)
            .map_err(|e| StorageError::InvalidRef(format!("{}: {}", s, e)))
    }
}

impl TryFrom<String> for ContentRef {
    type Error = StorageError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ContentRef> for String {
    fn from(value: ContentRef) -> Self {
        value.to_string()
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Content not found: {0}")]
    NotFound(ContentRef),

    #[error("Stored content does not match {0}")]
    Corrupted(ContentRef),

    #[error("Invalid content reference {0}")]
    InvalidRef(String),

    #[error("Storage operation timed out")]
    Timeout,

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout)
    }
}

/// Content-addressed blob store.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Store `data`, returning its content reference.
    async fn add(&self, data: &[u8]) -> StorageResult<ContentRef>;

    /// Fetch the bytes named by `content_ref`.
    async fn get(&self, content_ref: &ContentRef) -> StorageResult<Vec<u8>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_ref_is_cidv1_raw() {
        let r = ContentRef::for_bytes(b"hello");
        let s = r.to_string();
        // base32 CIDv1 raw/sha2-256 prefix
        assert!(s.starts_with("bafkrei"), "{}", s);
        assert_eq!(r.cid().codec(), RAW_CODEC);
    }

    #[test]
    fn test_content_ref_deterministic() {
        assert_eq!(ContentRef::for_bytes(b"a"), ContentRef::for_bytes(b"a"));
        assert_ne!(ContentRef::for_bytes(b"a"), ContentRef::for_bytes(b"b"));
        assert!(ContentRef::for_bytes(b"a").matches(b"a"));
        assert!(!ContentRef::for_bytes(b"a").matches(b"b"));
    }

    #[test]
    fn test_parse_and_serde() {
        let r = ContentRef::for_bytes(b"article body");
        let parsed: ContentRef = r.to_string().parse().unwrap();
        assert_eq!(parsed, r);

        let json = serde_json::to_string(&r).unwrap();
        assert_eq!(json, format!("\"{}\"", r));
        let back: ContentRef = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r);
    }

    #[test]
    fn test_parse_garbage() {
        assert!(matches!(
            "not-a-cid".parse::<ContentRef>(),
            Err(StorageError::InvalidRef(_))
        ));
    }
}
