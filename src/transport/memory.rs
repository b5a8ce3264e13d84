//! In-process gossip: a broadcast channel plus bounded history per topic.

use super::traits::*;
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::warn;

const CHANNEL_CAPACITY: usize = 256;

struct Topic {
    sender: broadcast::Sender<Vec<u8>>,
    history: VecDeque<Vec<u8>>,
}

impl Topic {
    fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            history: VecDeque::new(),
        }
    }
}

/// Gossip transport shared by every handle cloned from it.
#[derive(Clone)]
pub struct InMemoryGossip {
    topics: Arc<Mutex<HashMap<String, Topic>>>,
    retention: usize,
    offline: Arc<AtomicBool>,
    stalled: Arc<AtomicBool>,
}

impl InMemoryGossip {
    pub fn new(retention: usize) -> Self {
        Self {
            topics: Arc::new(Mutex::new(HashMap::new())),
            retention,
            offline: Arc::new(AtomicBool::new(false)),
            stalled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Simulate the gossip network being unreachable.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Accept requests but never answer.
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    async fn check_online(&self) -> TransportResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable("gossip offline".to_string()));
        }
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

impl Default for InMemoryGossip {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[async_trait]
impl GossipTransport for InMemoryGossip {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> TransportResult<()> {
        self.check_online().await?;

        let mut topics = self.topics.lock();
        let entry = topics.entry(topic.to_string()).or_insert_with(Topic::new);

        entry.history.push_back(payload.clone());
        while entry.history.len() > self.retention {
            entry.history.pop_front();
        }

        // No receivers is fine: the message is still in history
        let _ = entry.sender.send(payload);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> TransportResult<BoxStream<'static, Vec<u8>>> {
        self.check_online().await?;

        let receiver = {
            let mut topics = self.topics.lock();
            topics
                .entry(topic.to_string())
                .or_insert_with(Topic::new)
                .sender
                .subscribe()
        };

        let topic = topic.to_string();
        let stream = BroadcastStream::new(receiver).filter_map(move |item| {
            let topic = topic.clone();
            async move {
                match item {
                    Ok(payload) => Some(payload),
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        warn!(topic = %topic, skipped, "gossip subscriber lagged");
                        None
                    }
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn query_history(&self, topic: &str, limit: usize) -> TransportResult<Vec<Vec<u8>>> {
        self.check_online().await?;

        let topics = self.topics.lock();
        Ok(topics
            .get(topic)
            .map(|t| t.history.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}
