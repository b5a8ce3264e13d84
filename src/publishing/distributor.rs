//! Content distribution: content-addressed storage plus gossip broadcast.
//!
//! Storage is best-effort (a publish degrades to gossip-only when storage is
//! down); the broadcast is not, and a publish only returns once it has gone
//! out. Subscribers are kept in a lock-guarded registry that the delivery
//! task snapshots before invoking callbacks, so (un)subscribing can race
//! with delivery.

use super::types::*;
use crate::config::TimeoutConfig;
use crate::crypto::{aead, record_id};
use crate::identity::Address;
use crate::retry::{retry_with_backoff, with_timeout, RetryPolicy};
use crate::secrets::{AccessPolicy, SecretBackend, SecretError, SecretHandle, SecretValue};
use crate::serialization::{from_cbor, to_cbor, SerializationError};
use crate::storage::{StorageBackend, StorageError};
use crate::transport::{GossipTransport, TransportError, PUBLICATIONS_TOPIC};
use futures::StreamExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

pub type PublicationCallback = Arc<dyn Fn(&Publication) + Send + Sync>;

/// Returned by `subscribe`; pass to `unsubscribe` to stop delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

#[derive(Debug, Error)]
pub enum PublishError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Secret(#[from] SecretError),

    #[error(transparent)]
    Serialization(#[from] SerializationError),

    #[error("Publication {0} not found")]
    NotFound(String),

    #[error("Draft could not be decrypted")]
    DraftCorrupted,
}

impl PublishError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_retryable(),
            Self::Storage(e) => e.is_retryable(),
            Self::Secret(e) => e.is_retryable(),
            _ => false,
        }
    }
}

pub type PublishResult<T> = Result<T, PublishError>;

struct Subscriber {
    author: Option<Address>,
    callback: PublicationCallback,
}

type Registry = Arc<RwLock<HashMap<SubscriptionHandle, Subscriber>>>;
type Index = Arc<RwLock<HashMap<String, Publication>>>;

pub struct ContentDistributor {
    storage: Arc<dyn StorageBackend>,
    transport: Arc<dyn GossipTransport>,
    secrets: Arc<dyn SecretBackend>,
    draft_key: Zeroizing<[u8; 32]>,
    timeouts: TimeoutConfig,
    retry: RetryPolicy,
    history_scan: usize,
    subscribers: Registry,
    index: Index,
    next_subscription: AtomicU64,
    delivery: JoinHandle<()>,
}

impl ContentDistributor {
    /// Subscribe to the publications topic and start the delivery task.
    pub async fn start(
        storage: Arc<dyn StorageBackend>,
        transport: Arc<dyn GossipTransport>,
        secrets: Arc<dyn SecretBackend>,
        draft_key: &[u8; 32],
        timeouts: TimeoutConfig,
        retry: RetryPolicy,
        history_scan: usize,
    ) -> PublishResult<Self> {
        let stream = with_timeout(
            timeouts.transport,
            transport.subscribe(PUBLICATIONS_TOPIC),
            || TransportError::Timeout,
        )
        .await?;

        let subscribers: Registry = Arc::new(RwLock::new(HashMap::new()));
        let index: Index = Arc::new(RwLock::new(HashMap::new()));
        let delivery = tokio::spawn(deliver(stream, subscribers.clone(), index.clone()));

        Ok(Self {
            storage,
            transport,
            secrets,
            draft_key: Zeroizing::new(*draft_key),
            timeouts,
            retry,
            history_scan,
            subscribers,
            index,
            next_subscription: AtomicU64::new(1),
            delivery,
        })
    }

    async fn broadcast(&self, message: &PublicationMessage) -> PublishResult<()> {
        let payload = to_cbor(message)?;
        retry_with_backoff(
            &self.retry,
            || {
                with_timeout(
                    self.timeouts.transport,
                    self.transport.publish(PUBLICATIONS_TOPIC, payload.clone()),
                    || TransportError::Timeout,
                )
            },
            TransportError::is_retryable,
        )
        .await?;
        Ok(())
    }

    /// Store and broadcast a new publication.
    pub async fn publish(
        &self,
        title: &str,
        content: &str,
        category: Category,
        author: &Address,
        author_score: Option<f64>,
    ) -> PublishResult<Publication> {
        let stored = retry_with_backoff(
            &self.retry,
            || {
                with_timeout(
                    self.timeouts.storage,
                    self.storage.add(content.as_bytes()),
                    || StorageError::Timeout,
                )
            },
            StorageError::is_retryable,
        )
        .await;

        let content_ref = match stored {
            Ok(content_ref) => Some(content_ref),
            Err(e) => {
                warn!(author = %author, error = %e, "storage unavailable, publishing over gossip only");
                None
            }
        };

        let timestamp = crate::unix_millis();
        let id_source = content_ref
            .as_ref()
            .map(|r| r.to_string().into_bytes())
            .unwrap_or_else(|| content.as_bytes().to_vec());

        let publication = Publication {
            id: record_id(&id_source, author, timestamp),
            title: title.to_string(),
            content: content.to_string(),
            author: author.clone(),
            timestamp,
            content_ref,
            category,
            signatures: Vec::new(),
            author_score,
        };

        self.broadcast(&PublicationMessage::Published(publication.clone()))
            .await?;

        self.index
            .write()
            .insert(publication.id.clone(), publication.clone());

        info!(
            id = %publication.id,
            category = %publication.category,
            stored = publication.content_ref.is_some(),
            "publication broadcast"
        );
        Ok(publication)
    }

    fn register(&self, author: Option<Address>, callback: PublicationCallback) -> SubscriptionHandle {
        let handle = SubscriptionHandle(self.next_subscription.fetch_add(1, Ordering::SeqCst));
        self.subscribers
            .write()
            .insert(handle, Subscriber { author, callback });
        handle
    }

    /// Deliver every newly observed publication to `callback`.
    ///
    /// Delivery is at-least-once; callers dedup by `Publication::id`.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionHandle
    where
        F: Fn(&Publication) + Send + Sync + 'static,
    {
        self.register(None, Arc::new(callback))
    }

    /// Like `subscribe`, restricted to one author.
    pub fn subscribe_to_author<F>(&self, author: &Address, callback: F) -> SubscriptionHandle
    where
        F: Fn(&Publication) + Send + Sync + 'static,
    {
        self.register(Some(author.clone()), Arc::new(callback))
    }

    /// Returns `false` if the handle was not registered.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.subscribers.write().remove(&handle).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Recent publications, newest first, with co-signatures applied.
    ///
    /// Best-effort: only what the transport still retains is returned.
    pub async fn query_history(&self, limit: usize) -> PublishResult<Vec<Publication>> {
        let raw = retry_with_backoff(
            &self.retry,
            || {
                with_timeout(
                    self.timeouts.transport,
                    self.transport.query_history(PUBLICATIONS_TOPIC, self.history_scan),
                    || TransportError::Timeout,
                )
            },
            TransportError::is_retryable,
        )
        .await?;

        let mut publications = Vec::new();
        let mut cosigns: Vec<(String, WitnessSignature)> = Vec::new();
        for bytes in raw {
            match from_cbor::<PublicationMessage>(&bytes) {
                Ok(PublicationMessage::Published(p)) => publications.push(p),
                Ok(PublicationMessage::CoSigned {
                    publication_id,
                    signature,
                }) => cosigns.push((publication_id, signature)),
                Ok(PublicationMessage::Reported(_)) => {}
                Err(e) => debug!(error = %e, "skipping malformed history entry"),
            }
        }

        // History is newest-first, so co-signatures come out reversed
        for (publication_id, signature) in cosigns.into_iter().rev() {
            if let Some(p) = publications.iter_mut().find(|p| p.id == publication_id) {
                p.add_signature(signature);
            }
        }

        // At-least-once gossip can leave duplicates in history
        let mut seen = std::collections::HashSet::new();
        publications.retain(|p| seen.insert(p.id.clone()));
        publications.truncate(limit);
        Ok(publications)
    }

    /// Publications in `category` whose author scored at least `min_score`.
    pub async fn search(
        &self,
        category: Option<Category>,
        min_score: Option<f64>,
    ) -> PublishResult<Vec<Publication>> {
        let publications = self.query_history(self.history_scan).await?;
        Ok(publications
            .into_iter()
            .filter(|p| category.map_or(true, |c| p.category == c))
            .filter(|p| min_score.map_or(true, |min| p.author_score.unwrap_or(0.0) >= min))
            .collect())
    }

    /// Look up a publication this node has seen.
    pub async fn get(&self, publication_id: &str) -> PublishResult<Publication> {
        if let Some(p) = self.index.read().get(publication_id).cloned() {
            return Ok(p);
        }
        self.query_history(self.history_scan)
            .await?
            .into_iter()
            .find(|p| p.id == publication_id)
            .ok_or_else(|| PublishError::NotFound(publication_id.to_string()))
    }

    /// Append a witness signature to a publication and announce it.
    pub async fn co_sign(
        &self,
        publication_id: &str,
        witness: &Address,
        signature: &str,
    ) -> PublishResult<Publication> {
        let mut publication = self.get(publication_id).await?;
        let signature = WitnessSignature {
            witness: witness.clone(),
            signature: signature.to_string(),
            signed_at: crate::unix_millis(),
        };

        if !publication.add_signature(signature.clone()) {
            debug!(id = %publication_id, witness = %witness, "witness already signed");
            return Ok(publication);
        }

        self.broadcast(&PublicationMessage::CoSigned {
            publication_id: publication_id.to_string(),
            signature,
        })
        .await?;

        self.index
            .write()
            .insert(publication.id.clone(), publication.clone());
        info!(id = %publication_id, witness = %witness, "publication co-signed");
        Ok(publication)
    }

    /// File an abuse report against a publication.
    pub async fn report(
        &self,
        publication_id: &str,
        reporter: &Address,
        reason: &str,
    ) -> PublishResult<AbuseReport> {
        self.get(publication_id).await?;

        let report = AbuseReport {
            publication_id: publication_id.to_string(),
            reporter: reporter.clone(),
            reason: reason.to_string(),
            reported_at: crate::unix_millis(),
        };
        self.broadcast(&PublicationMessage::Reported(report.clone()))
            .await?;

        info!(id = %publication_id, "abuse report filed");
        Ok(report)
    }

    /// Encrypt a draft and store it as a secret only `owner` can read.
    pub async fn save_draft(&self, owner: &Address, draft: &Draft) -> PublishResult<SecretHandle> {
        let plaintext = Zeroizing::new(to_cbor(draft)?);
        let sealed =
            aead::seal(&self.draft_key[..], &plaintext).map_err(|_| PublishError::DraftCorrupted)?;

        let handle = retry_with_backoff(
            &self.retry,
            || {
                with_timeout(
                    self.timeouts.compute,
                    self.secrets.store_secret(
                        SecretValue::Blob(sealed.clone()),
                        AccessPolicy::owner_only(owner.clone()),
                    ),
                    || SecretError::Timeout,
                )
            },
            SecretError::is_retryable,
        )
        .await?;

        debug!(owner = %owner, handle = %handle, "draft saved");
        Ok(handle)
    }

    /// Load a draft saved by `requester`.
    pub async fn load_draft(
        &self,
        handle: &SecretHandle,
        requester: &Address,
    ) -> PublishResult<Draft> {
        let value = retry_with_backoff(
            &self.retry,
            || {
                with_timeout(
                    self.timeouts.compute,
                    self.secrets.retrieve(handle, requester),
                    || SecretError::Timeout,
                )
            },
            SecretError::is_retryable,
        )
        .await?;

        let SecretValue::Blob(sealed) = value else {
            return Err(PublishError::DraftCorrupted);
        };
        let plaintext = Zeroizing::new(
            aead::open(&self.draft_key[..], &sealed).map_err(|_| PublishError::DraftCorrupted)?,
        );
        Ok(from_cbor(&plaintext)?)
    }

    /// Stop the delivery task. Subscribers receive nothing afterwards.
    pub fn shutdown(&self) {
        self.delivery.abort();
    }
}

impl Drop for ContentDistributor {
    fn drop(&mut self) {
        self.delivery.abort();
    }
}

async fn deliver(
    mut stream: futures::stream::BoxStream<'static, Vec<u8>>,
    subscribers: Registry,
    index: Index,
) {
    while let Some(bytes) = stream.next().await {
        let message = match from_cbor::<PublicationMessage>(&bytes) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "dropping malformed publication message");
                continue;
            }
        };

        match message {
            PublicationMessage::Published(publication) => {
                index
                    .write()
                    .entry(publication.id.clone())
                    .or_insert_with(|| publication.clone());

                let snapshot: Vec<(Option<Address>, PublicationCallback)> = subscribers
                    .read()
                    .values()
                    .map(|s| (s.author.clone(), s.callback.clone()))
                    .collect();

                for (author, callback) in snapshot {
                    if author.as_ref().map_or(true, |a| *a == publication.author) {
                        callback(&publication);
                    }
                }
            }
            PublicationMessage::CoSigned {
                publication_id,
                signature,
            } => {
                if let Some(p) = index.write().get_mut(&publication_id) {
                    p.add_signature(signature);
                }
            }
            PublicationMessage::Reported(report) => {
                debug!(id = %report.publication_id, "abuse report observed");
            }
        }
    }
}
