//! Encrypted evidence vault.
//!
//! Evidence is encrypted client-side under a fresh AES-256-GCM data key.
//! The ciphertext goes to content-addressed storage; the data key goes to
//! the secret backend, whose access policy (owner plus authorized viewers)
//! is the only thing standing between a requester and the key. Downloads
//! are checked against the plaintext hash recorded at upload and fail hard
//! on mismatch.

use super::types::*;
use crate::config::TimeoutConfig;
use crate::crypto::{aead, content_hash, record_id, AeadError};
use crate::identity::{Address, IdentityScore};
use crate::policy::{ActionKind, Denied, PolicyThresholds};
use crate::retry::{retry_with_backoff, with_timeout, RetryPolicy};
use crate::secrets::{AccessPolicy, SecretBackend, SecretError, SecretValue};
use crate::serialization::to_cbor;
use crate::storage::{StorageBackend, StorageError};
use crate::transport::{GossipTransport, TransportError, VAULT_TOPIC};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use zeroize::Zeroizing;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("Evidence {0} not found")]
    NotFound(String),

    #[error("{requester} is not authorized for evidence {evidence_id}")]
    Unauthorized {
        evidence_id: String,
        requester: Address,
    },

    #[error("Integrity violation on evidence {0}: content refused")]
    IntegrityViolation(String),

    #[error(transparent)]
    Denied(#[from] Denied),

    #[error("The owner's access to their own evidence cannot be revoked")]
    CannotRevokeOwner,

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Secret(SecretError),

    #[error(transparent)]
    Encryption(#[from] AeadError),

    #[error("Export failed: {0}")]
    Export(String),
}

impl VaultError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Storage(e) => e.is_retryable(),
            Self::Secret(e) => e.is_retryable(),
            _ => false,
        }
    }
}

pub type VaultResult<T> = Result<T, VaultError>;

pub struct EvidenceVault {
    storage: Arc<dyn StorageBackend>,
    secrets: Arc<dyn SecretBackend>,
    transport: Arc<dyn GossipTransport>,
    policy: PolicyThresholds,
    timeouts: TimeoutConfig,
    retry: RetryPolicy,
    records: RwLock<HashMap<String, EvidenceRecord>>,
    collections: RwLock<HashMap<String, Collection>>,
    /// Serializes viewer-set changes so concurrent grants don't drop each other.
    acl: Mutex<()>,
}

impl EvidenceVault {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        secrets: Arc<dyn SecretBackend>,
        transport: Arc<dyn GossipTransport>,
        policy: PolicyThresholds,
        timeouts: TimeoutConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            storage,
            secrets,
            transport,
            policy,
            timeouts,
            retry,
            records: RwLock::new(HashMap::new()),
            collections: RwLock::new(HashMap::new()),
            acl: Mutex::new(()),
        }
    }

    fn record(&self, evidence_id: &str) -> VaultResult<EvidenceRecord> {
        self.records
            .read()
            .get(evidence_id)
            .cloned()
            .ok_or_else(|| VaultError::NotFound(evidence_id.to_string()))
    }

    async fn announce(&self, message: &VaultMessage) {
        let payload = match to_cbor(message) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "vault announcement not encoded");
                return;
            }
        };
        let sent = retry_with_backoff(
            &self.retry,
            || {
                with_timeout(
                    self.timeouts.transport,
                    self.transport.publish(VAULT_TOPIC, payload.clone()),
                    || TransportError::Timeout,
                )
            },
            TransportError::is_retryable,
        )
        .await;
        if let Err(e) = sent {
            warn!(error = %e, "vault announcement not broadcast");
        }
    }

    async fn set_viewers(
        &self,
        record: &EvidenceRecord,
        viewers: BTreeSet<Address>,
    ) -> VaultResult<()> {
        let policy = AccessPolicy::with_readers(record.owner.clone(), viewers.iter().cloned());
        retry_with_backoff(
            &self.retry,
            || {
                with_timeout(
                    self.timeouts.compute,
                    self.secrets.update_permissions(&record.key_handle, policy.clone()),
                    || SecretError::Timeout,
                )
            },
            SecretError::is_retryable,
        )
        .await
        .map_err(VaultError::Secret)?;

        if let Some(stored) = self.records.write().get_mut(&record.id) {
            stored.authorized_viewers = viewers;
        }
        Ok(())
    }

    /// Encrypt and store evidence. `viewers` may read it besides the owner.
    pub async fn upload(
        &self,
        owner: &Address,
        data: &[u8],
        metadata: EvidenceMetadata,
        viewers: impl IntoIterator<Item = Address>,
    ) -> VaultResult<EvidenceRecord> {
        let hash = content_hash(data);
        let key = aead::generate_key()?;
        let sealed = aead::seal(&key[..], data)?;

        let content_ref = retry_with_backoff(
            &self.retry,
            || {
                with_timeout(
                    self.timeouts.storage,
                    self.storage.add(&sealed),
                    || StorageError::Timeout,
                )
            },
            StorageError::is_retryable,
        )
        .await?;

        let authorized_viewers: BTreeSet<Address> =
            viewers.into_iter().filter(|v| v != owner).collect();
        let key_policy =
            AccessPolicy::with_readers(owner.clone(), authorized_viewers.iter().cloned());

        let key_handle = retry_with_backoff(
            &self.retry,
            || {
                with_timeout(
                    self.timeouts.compute,
                    self.secrets
                        .store_secret(SecretValue::Blob(key.to_vec()), key_policy.clone()),
                    || SecretError::Timeout,
                )
            },
            SecretError::is_retryable,
        )
        .await
        .map_err(VaultError::Secret)?;

        let timestamp = crate::unix_millis();
        let record = EvidenceRecord {
            id: record_id(content_ref.to_string().as_bytes(), owner, timestamp),
            evidence_type: metadata.evidence_type,
            title: metadata.title,
            description: metadata.description,
            location: metadata.location,
            tags: metadata.tags,
            timestamp,
            owner: owner.clone(),
            content_ref,
            content_hash: hash,
            size: data.len(),
            authorized_viewers,
            custody: Vec::new(),
            key_handle,
        };

        self.records
            .write()
            .insert(record.id.clone(), record.clone());

        info!(
            evidence = %record.id,
            kind = %record.evidence_type,
            viewers = record.authorized_viewers.len(),
            "evidence uploaded"
        );

        self.announce(&VaultMessage::EvidenceAnnounced {
            id: record.id.clone(),
            evidence_type: record.evidence_type,
            owner: record.owner.clone(),
            content_hash: record.content_hash.clone(),
            timestamp,
        })
        .await;

        Ok(record)
    }

    /// Give `viewer` access. The granter must be able to view the evidence
    /// and hold a score that permits granting access.
    pub async fn grant_access(
        &self,
        evidence_id: &str,
        granter: &IdentityScore,
        viewer: &Address,
    ) -> VaultResult<EvidenceRecord> {
        self.policy.check(granter.score, ActionKind::GrantAccess)?;

        let _acl = self.acl.lock().await;
        let record = self.record(evidence_id)?;
        if !record.can_view(&granter.address) {
            warn!(evidence = %evidence_id, granter = %granter.address, "grant by non-viewer refused");
            return Err(VaultError::Unauthorized {
                evidence_id: evidence_id.to_string(),
                requester: granter.address.clone(),
            });
        }
        if record.can_view(viewer) {
            return Ok(record);
        }

        let mut viewers = record.authorized_viewers.clone();
        viewers.insert(viewer.clone());
        self.set_viewers(&record, viewers).await?;

        info!(evidence = %evidence_id, viewer = %viewer, "access granted");
        self.announce(&VaultMessage::AccessGranted {
            evidence_id: evidence_id.to_string(),
            viewer: viewer.clone(),
            granted_by: granter.address.clone(),
            granted_at: crate::unix_millis(),
        })
        .await;

        self.record(evidence_id)
    }

    /// Remove `viewer`. Only the owner may revoke.
    pub async fn revoke_access(
        &self,
        evidence_id: &str,
        owner: &Address,
        viewer: &Address,
    ) -> VaultResult<EvidenceRecord> {
        let _acl = self.acl.lock().await;
        let record = self.record(evidence_id)?;
        if record.owner != *owner {
            return Err(VaultError::Unauthorized {
                evidence_id: evidence_id.to_string(),
                requester: owner.clone(),
            });
        }
        if *viewer == record.owner {
            return Err(VaultError::CannotRevokeOwner);
        }
        if !record.authorized_viewers.contains(viewer) {
            return Ok(record);
        }

        let mut viewers = record.authorized_viewers.clone();
        viewers.remove(viewer);
        self.set_viewers(&record, viewers).await?;

        info!(evidence = %evidence_id, viewer = %viewer, "access revoked");
        self.record(evidence_id)
    }

    /// Decrypt evidence for `requester`, verifying its integrity.
    pub async fn download(&self, evidence_id: &str, requester: &Address) -> VaultResult<Vec<u8>> {
        let record = self.record(evidence_id)?;

        let key = retry_with_backoff(
            &self.retry,
            || {
                with_timeout(
                    self.timeouts.compute,
                    self.secrets.retrieve(&record.key_handle, requester),
                    || SecretError::Timeout,
                )
            },
            SecretError::is_retryable,
        )
        .await
        .map_err(|e| match e {
            SecretError::Unauthorized { .. } => {
                warn!(evidence = %evidence_id, requester = %requester, "download refused");
                VaultError::Unauthorized {
                    evidence_id: evidence_id.to_string(),
                    requester: requester.clone(),
                }
            }
            other => VaultError::Secret(other),
        })?;
        let SecretValue::Blob(key) = key else {
            return Err(VaultError::IntegrityViolation(evidence_id.to_string()));
        };
        let key = Zeroizing::new(key);

        let sealed = retry_with_backoff(
            &self.retry,
            || {
                with_timeout(
                    self.timeouts.storage,
                    self.storage.get(&record.content_ref),
                    || StorageError::Timeout,
                )
            },
            StorageError::is_retryable,
        )
        .await
        .map_err(|e| match e {
            StorageError::Corrupted(_) => {
                error!(evidence = %evidence_id, "stored ciphertext corrupted");
                VaultError::IntegrityViolation(evidence_id.to_string())
            }
            other => VaultError::Storage(other),
        })?;

        let plaintext = aead::open(&key[..], &sealed).map_err(|_| {
            error!(evidence = %evidence_id, "evidence failed authenticated decryption");
            VaultError::IntegrityViolation(evidence_id.to_string())
        })?;

        if content_hash(&plaintext) != record.content_hash {
            error!(evidence = %evidence_id, "evidence hash mismatch");
            return Err(VaultError::IntegrityViolation(evidence_id.to_string()));
        }
        Ok(plaintext)
    }

    /// Add a chain-of-custody signature. Signatures are never removed, and
    /// a witness signs at most once.
    pub async fn witness(
        &self,
        evidence_id: &str,
        witness: &IdentityScore,
        signature: &str,
    ) -> VaultResult<EvidenceRecord> {
        self.policy.check(witness.score, ActionKind::Witness)?;

        let mut records = self.records.write();
        let record = records
            .get_mut(evidence_id)
            .ok_or_else(|| VaultError::NotFound(evidence_id.to_string()))?;

        if record.custody.iter().all(|s| s.witness != witness.address) {
            record.custody.push(CustodySignature {
                witness: witness.address.clone(),
                signature: signature.to_string(),
                signed_at: crate::unix_millis(),
            });
            info!(evidence = %evidence_id, witnesses = record.custody.len(), "custody signature added");
        }
        Ok(record.clone())
    }

    pub fn get(&self, evidence_id: &str) -> VaultResult<EvidenceRecord> {
        self.record(evidence_id)
    }

    /// Matching records, newest first.
    pub fn search(&self, query: &EvidenceQuery) -> Vec<EvidenceRecord> {
        let mut found: Vec<EvidenceRecord> = self
            .records
            .read()
            .values()
            .filter(|r| query.matches(r))
            .cloned()
            .collect();
        found.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        found
    }

    /// Group existing evidence under a name.
    pub fn create_collection(
        &self,
        owner: &Address,
        name: &str,
        description: &str,
        evidence_ids: Vec<String>,
    ) -> VaultResult<Collection> {
        {
            let records = self.records.read();
            if let Some(missing) = evidence_ids.iter().find(|id| !records.contains_key(*id)) {
                return Err(VaultError::NotFound(missing.clone()));
            }
        }

        let created_at = crate::unix_millis();
        let collection = Collection {
            id: record_id(name.as_bytes(), owner, created_at),
            name: name.to_string(),
            description: description.to_string(),
            owner: owner.clone(),
            evidence_ids,
            created_at,
        };
        self.collections
            .write()
            .insert(collection.id.clone(), collection.clone());
        Ok(collection)
    }

    pub fn collection(&self, collection_id: &str) -> Option<Collection> {
        self.collections.read().get(collection_id).cloned()
    }

    /// JSON package of metadata, hashes, and custody chains for the given
    /// evidence. The requester must be able to view every item.
    pub fn export_package(&self, evidence_ids: &[String], requester: &Address) -> VaultResult<String> {
        let records = self.records.read();
        let mut items = Vec::with_capacity(evidence_ids.len());
        for id in evidence_ids {
            let record = records
                .get(id)
                .ok_or_else(|| VaultError::NotFound(id.clone()))?;
            if !record.can_view(requester) {
                return Err(VaultError::Unauthorized {
                    evidence_id: id.clone(),
                    requester: requester.clone(),
                });
            }
            items.push(PackageItem::from(record));
        }

        let package = EvidencePackage {
            generated_at: crate::unix_millis(),
            generated_by: requester.clone(),
            items,
        };
        serde_json::to_string_pretty(&package).map_err(|e| VaultError::Export(e.to_string()))
    }
}
