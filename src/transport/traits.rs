//! Trait abstraction for the gossip (pub/sub) transport.

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport unavailable: {0}")]
    Unavailable(String),

    #[error("Transport operation timed out")]
    Timeout,

    #[error("Message rejected: {0}")]
    Rejected(String),
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout)
    }
}

/// Topic-based gossip with a bounded per-topic store.
#[async_trait]
pub trait GossipTransport: Send + Sync {
    /// Broadcast `payload` to every subscriber of `topic`.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> TransportResult<()>;

    /// Stream of payloads published to `topic` after this call.
    async fn subscribe(&self, topic: &str) -> TransportResult<BoxStream<'static, Vec<u8>>>;

    /// Up to `limit` stored payloads for `topic`, newest first.
    async fn query_history(&self, topic: &str, limit: usize) -> TransportResult<Vec<Vec<u8>>>;
}
