//! Threshold key custody.
//!
//! A signing key is split M-of-N with FROST (Ed25519) across custodians.
//! The caller's secret is consumed by `split_key` and wiped on return; from
//! then on signatures are produced by running the two FROST rounds against
//! at least `threshold` custodians, so the full key is never rebuilt.
//!
//! Custodians are a trait seam. `LocalCustodian` is the in-process stand-in
//! used by the service and tests; it can be taken offline or stalled to
//! exercise the threshold-not-met path.

use crate::identity::Address;
use async_trait::async_trait;
use frost_ed25519 as frost;
use frost_ed25519::Identifier;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

#[derive(Debug, Error)]
pub enum CustodyError {
    #[error("Key bundle {0} not found")]
    UnknownBundle(String),

    #[error("Invalid threshold {threshold} of {parties}")]
    InvalidThreshold { threshold: u16, parties: u16 },

    #[error("{requested} custodians requested but only {available} configured")]
    NotEnoughCustodians { requested: u16, available: usize },

    #[error("Invalid signing key: {0}")]
    InvalidKey(String),

    #[error("Threshold not met: {responded} of {required} custodians responded")]
    ThresholdNotMet { required: u16, responded: usize },

    #[error("Key bundle {0} has been revoked")]
    RevokedKey(String),

    #[error("{requester} does not own key bundle {bundle_id}")]
    Unauthorized {
        bundle_id: String,
        requester: Address,
    },

    #[error("Custodian unavailable: {0}")]
    CustodianUnavailable(String),

    #[error("Custodian has no share for bundle {0}")]
    ShareMissing(String),

    #[error("Custodian operation timed out")]
    Timeout,

    #[error("Threshold signing failed: {0}")]
    Signing(String),
}

impl CustodyError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::CustodianUnavailable(_) | Self::Timeout)
    }
}

pub type CustodyResult<T> = Result<T, CustodyError>;

fn signing_error(e: impl std::fmt::Display) -> CustodyError {
    CustodyError::Signing(e.to_string())
}

/// A party holding one key share.
///
/// Shares, commitments, and packages cross this seam serialized, the way
/// they would travel to a remote custodian.
#[async_trait]
pub trait Custodian: Send + Sync {
    fn name(&self) -> &str;

    /// Take custody of a serialized FROST key package.
    async fn hold_share(&self, bundle_id: &str, key_package: Zeroizing<Vec<u8>>)
        -> CustodyResult<()>;

    /// Round one: fresh nonces for `session`, returning the commitments.
    async fn commit(&self, bundle_id: &str, session: &str) -> CustodyResult<Vec<u8>>;

    /// Round two: a signature share over the serialized signing package.
    async fn sign(
        &self,
        bundle_id: &str,
        session: &str,
        signing_package: &[u8],
    ) -> CustodyResult<Vec<u8>>;

    /// Drop the nonces of a signing session that will not reach round two.
    async fn abandon(&self, bundle_id: &str, session: &str) -> CustodyResult<()>;

    /// Drop the share for a revoked or failed bundle.
    async fn discard(&self, bundle_id: &str) -> CustodyResult<()>;
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Availability {
    Online,
    Offline,
    Stalled,
}

/// In-process custodian.
#[derive(Clone)]
pub struct LocalCustodian {
    name: String,
    shares: Arc<Mutex<HashMap<String, frost::keys::KeyPackage>>>,
    nonces: Arc<Mutex<HashMap<(String, String), frost::round1::SigningNonces>>>,
    offline: Arc<AtomicBool>,
    stalled: Arc<AtomicBool>,
}

impl LocalCustodian {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shares: Arc::new(Mutex::new(HashMap::new())),
            nonces: Arc::new(Mutex::new(HashMap::new())),
            offline: Arc::new(AtomicBool::new(false)),
            stalled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Refuse every request.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Accept requests but never answer.
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    pub fn holds(&self, bundle_id: &str) -> bool {
        self.shares.lock().contains_key(bundle_id)
    }

    pub fn share_count(&self) -> usize {
        self.shares.lock().len()
    }

    /// Signing sessions with nonces still held.
    pub fn open_sessions(&self) -> usize {
        self.nonces.lock().len()
    }

    fn availability(&self) -> Availability {
        if self.offline.load(Ordering::SeqCst) {
            Availability::Offline
        } else if self.stalled.load(Ordering::SeqCst) {
            Availability::Stalled
        } else {
            Availability::Online
        }
    }

    async fn ready(&self) -> CustodyResult<()> {
        match self.availability() {
            Availability::Online => Ok(()),
            Availability::Offline => Err(CustodyError::CustodianUnavailable(self.name.clone())),
            Availability::Stalled => std::future::pending().await,
        }
    }
}

#[async_trait]
impl Custodian for LocalCustodian {
    fn name(&self) -> &str {
        &self.name
    }

    async fn hold_share(
        &self,
        bundle_id: &str,
        key_package: Zeroizing<Vec<u8>>,
    ) -> CustodyResult<()> {
        self.ready().await?;
        let package = frost::keys::KeyPackage::deserialize(&key_package).map_err(signing_error)?;
        self.shares
            .lock()
            .insert(bundle_id.to_string(), package);
        Ok(())
    }

    async fn commit(&self, bundle_id: &str, session: &str) -> CustodyResult<Vec<u8>> {
        self.ready().await?;
        let (nonces, commitments) = {
            let shares = self.shares.lock();
            let package = shares
                .get(bundle_id)
                .ok_or_else(|| CustodyError::ShareMissing(bundle_id.to_string()))?;
            frost::round1::commit(package.signing_share(), &mut rand::rngs::OsRng)
        };
        self.nonces
            .lock()
            .insert((bundle_id.to_string(), session.to_string()), nonces);
        commitments.serialize().map_err(signing_error)
    }

    async fn sign(
        &self,
        bundle_id: &str,
        session: &str,
        signing_package: &[u8],
    ) -> CustodyResult<Vec<u8>> {
        self.ready().await?;
        let signing_package =
            frost::SigningPackage::deserialize(signing_package).map_err(signing_error)?;

        // Nonces are single-use
        let nonces = self
            .nonces
            .lock()
            .remove(&(bundle_id.to_string(), session.to_string()))
            .ok_or_else(|| CustodyError::Signing(format!("no commitment for session {session}")))?;

        let shares = self.shares.lock();
        let package = shares
            .get(bundle_id)
            .ok_or_else(|| CustodyError::ShareMissing(bundle_id.to_string()))?;
        let share = frost::round2::sign(&signing_package, &nonces, package).map_err(signing_error)?;
        Ok(share.serialize())
    }

    async fn abandon(&self, bundle_id: &str, session: &str) -> CustodyResult<()> {
        self.nonces
            .lock()
            .remove(&(bundle_id.to_string(), session.to_string()));
        Ok(())
    }

    async fn discard(&self, bundle_id: &str) -> CustodyResult<()> {
        self.shares.lock().remove(bundle_id);
        self.nonces
            .lock()
            .retain(|(bundle, _), _| bundle != bundle_id);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BundleStatus {
    Active,
    Revoked,
}

/// Where one share lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareHandle {
    pub custodian: String,
    /// Hex FROST identifier.
    pub identifier: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyShareBundle {
    pub id: String,
    pub owner: Address,
    pub threshold: u16,
    pub parties: u16,
    pub handles: Vec<ShareHandle>,
    /// Hex group verifying key.
    pub verifying_key: String,
    pub status: BundleStatus,
}

struct BundleEntry {
    bundle: KeyShareBundle,
    pubkeys: frost::keys::PublicKeyPackage,
    signers: Vec<(Identifier, Arc<dyn Custodian>)>,
}

pub struct KeyCustodyManager {
    custodians: Vec<Arc<dyn Custodian>>,
    bundles: RwLock<HashMap<String, BundleEntry>>,
    signing_timeout: Duration,
}

impl KeyCustodyManager {
    pub fn new(custodians: Vec<Arc<dyn Custodian>>, signing_timeout: Duration) -> Self {
        Self {
            custodians,
            bundles: RwLock::new(HashMap::new()),
            signing_timeout,
        }
    }

    /// `count` in-process custodians.
    pub fn local(count: usize, signing_timeout: Duration) -> (Self, Vec<LocalCustodian>) {
        let locals: Vec<LocalCustodian> = (0..count)
            .map(|i| LocalCustodian::new(format!("custodian-{}", i + 1)))
            .collect();
        let custodians = locals
            .iter()
            .map(|c| Arc::new(c.clone()) as Arc<dyn Custodian>)
            .collect();
        (Self::new(custodians, signing_timeout), locals)
    }

    pub fn custodian_count(&self) -> usize {
        self.custodians.len()
    }

    /// Split `secret` (a serialized Ed25519 signing scalar) `threshold`-of-
    /// `parties` across the first `parties` custodians. The secret is wiped
    /// when this returns, whether or not the split succeeded.
    pub async fn split_key(
        &self,
        owner: &Address,
        secret: Zeroizing<Vec<u8>>,
        parties: u16,
        threshold: u16,
    ) -> CustodyResult<KeyShareBundle> {
        if threshold < 2 || threshold > parties {
            return Err(CustodyError::InvalidThreshold { threshold, parties });
        }
        if usize::from(parties) > self.custodians.len() {
            return Err(CustodyError::NotEnoughCustodians {
                requested: parties,
                available: self.custodians.len(),
            });
        }

        let (shares, pubkeys) = {
            let key = frost::SigningKey::deserialize(&secret)
                .map_err(|e| CustodyError::InvalidKey(e.to_string()))?;
            drop(secret);
            frost::keys::split(
                &key,
                parties,
                threshold,
                frost::keys::IdentifierList::Default,
                &mut rand::rngs::OsRng,
            )
            .map_err(signing_error)?
        };

        let bundle_id = hex::encode(rand::random::<[u8; 16]>());
        let mut signers = Vec::with_capacity(shares.len());
        let mut handles = Vec::with_capacity(shares.len());

        for ((identifier, share), custodian) in shares.into_iter().zip(&self.custodians) {
            // A custodian that timed out may still have stored its share
            signers.push((identifier, Arc::clone(custodian)));
            if let Err(e) = self.hand_over(&bundle_id, custodian.as_ref(), share).await {
                warn!(bundle = %bundle_id, custodian = custodian.name(), error = %e, "split aborted");
                self.discard_shares(&bundle_id, &signers).await;
                return Err(e);
            }
            handles.push(ShareHandle {
                custodian: custodian.name().to_string(),
                identifier: hex::encode(identifier.serialize()),
            });
        }

        let verifying_key = match pubkeys.verifying_key().serialize() {
            Ok(key) => key,
            Err(e) => {
                self.discard_shares(&bundle_id, &signers).await;
                return Err(signing_error(e));
            }
        };
        let bundle = KeyShareBundle {
            id: bundle_id.clone(),
            owner: owner.clone(),
            threshold,
            parties,
            handles,
            verifying_key: hex::encode(verifying_key),
            status: BundleStatus::Active,
        };

        info!(bundle = %bundle_id, threshold, parties, "key split across custodians");

        self.bundles.write().insert(
            bundle_id,
            BundleEntry {
                bundle: bundle.clone(),
                pubkeys,
                signers,
            },
        );
        Ok(bundle)
    }

    async fn hand_over(
        &self,
        bundle_id: &str,
        custodian: &dyn Custodian,
        share: frost::keys::SecretShare,
    ) -> CustodyResult<()> {
        let package = frost::keys::KeyPackage::try_from(share).map_err(signing_error)?;
        let bytes = Zeroizing::new(package.serialize().map_err(signing_error)?);
        timeout(self.signing_timeout, custodian.hold_share(bundle_id, bytes))
            .await
            .map_err(|_| CustodyError::Timeout)?
    }

    /// Ask every custodian in `signers` to drop its share, best-effort.
    async fn discard_shares(&self, bundle_id: &str, signers: &[(Identifier, Arc<dyn Custodian>)]) {
        let replies = join_all(signers.iter().map(|(_, custodian)| async move {
            let reply = timeout(self.signing_timeout, custodian.discard(bundle_id)).await;
            (custodian.name(), reply)
        }))
        .await;
        for (name, reply) in replies {
            match reply {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(custodian = name, error = %e, "share not discarded"),
                Err(_) => warn!(custodian = name, "share discard timed out"),
            }
        }
    }

    pub fn bundle(&self, bundle_id: &str) -> CustodyResult<KeyShareBundle> {
        self.bundles
            .read()
            .get(bundle_id)
            .map(|entry| entry.bundle.clone())
            .ok_or_else(|| CustodyError::UnknownBundle(bundle_id.to_string()))
    }

    /// Threshold-sign `payload`. Custodians that don't answer within the
    /// signing timeout are skipped; fewer than `threshold` answers fails.
    pub async fn sign_blind(&self, bundle_id: &str, payload: &[u8]) -> CustodyResult<Vec<u8>> {
        let (threshold, pubkeys, signers) = {
            let bundles = self.bundles.read();
            let entry = bundles
                .get(bundle_id)
                .ok_or_else(|| CustodyError::UnknownBundle(bundle_id.to_string()))?;
            if entry.bundle.status == BundleStatus::Revoked {
                return Err(CustodyError::RevokedKey(bundle_id.to_string()));
            }
            (
                entry.bundle.threshold,
                entry.pubkeys.clone(),
                entry.signers.clone(),
            )
        };
        let session = hex::encode(rand::random::<[u8; 16]>());

        let result = self
            .run_session(bundle_id, &session, payload, threshold, &pubkeys, &signers)
            .await;

        // Drop whatever nonces a custodian still holds for this session
        join_all(signers.iter().map(|(_, custodian)| {
            let session = session.as_str();
            async move {
                match timeout(self.signing_timeout, custodian.abandon(bundle_id, session)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!(custodian = custodian.name(), error = %e, "session not abandoned"),
                    Err(_) => debug!(custodian = custodian.name(), "session abandon timed out"),
                }
            }
        }))
        .await;

        result
    }

    async fn run_session(
        &self,
        bundle_id: &str,
        session: &str,
        payload: &[u8],
        threshold: u16,
        pubkeys: &frost::keys::PublicKeyPackage,
        signers: &[(Identifier, Arc<dyn Custodian>)],
    ) -> CustodyResult<Vec<u8>> {
        // Round one: gather commitments from whoever answers in time
        let responses = join_all(signers.iter().map(|(identifier, custodian)| {
            async move {
                let reply = timeout(self.signing_timeout, custodian.commit(bundle_id, session)).await;
                (*identifier, Arc::clone(custodian), reply)
            }
        }))
        .await;

        let mut commitments = BTreeMap::new();
        let mut chosen = Vec::new();
        for (identifier, custodian, reply) in responses {
            match reply {
                Ok(Ok(bytes)) if chosen.len() < usize::from(threshold) => {
                    let parsed = frost::round1::SigningCommitments::deserialize(&bytes)
                        .map_err(signing_error)?;
                    commitments.insert(identifier, parsed);
                    chosen.push((identifier, custodian));
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => debug!(custodian = custodian.name(), error = %e, "no commitment"),
                Err(_) => debug!(custodian = custodian.name(), "commitment timed out"),
            }
        }
        if chosen.len() < usize::from(threshold) {
            warn!(bundle = %bundle_id, responded = chosen.len(), required = threshold, "threshold not met");
            return Err(CustodyError::ThresholdNotMet {
                required: threshold,
                responded: chosen.len(),
            });
        }

        let signing_package = frost::SigningPackage::new(commitments, payload);
        let package_bytes = signing_package.serialize().map_err(signing_error)?;

        // Round two: every chosen custodian must answer
        let responses = join_all(chosen.iter().map(|(identifier, custodian)| {
            let package_bytes = package_bytes.as_slice();
            async move {
                let reply = timeout(
                    self.signing_timeout,
                    custodian.sign(bundle_id, session, package_bytes),
                )
                .await;
                (*identifier, reply)
            }
        }))
        .await;

        let mut shares = BTreeMap::new();
        for (identifier, reply) in responses {
            if let Ok(Ok(bytes)) = reply {
                let share =
                    frost::round2::SignatureShare::deserialize(&bytes).map_err(signing_error)?;
                shares.insert(identifier, share);
            }
        }
        if shares.len() < usize::from(threshold) {
            warn!(bundle = %bundle_id, responded = shares.len(), required = threshold, "threshold not met in signing round");
            return Err(CustodyError::ThresholdNotMet {
                required: threshold,
                responded: shares.len(),
            });
        }

        let signature =
            frost::aggregate(&signing_package, &shares, pubkeys).map_err(signing_error)?;
        info!(bundle = %bundle_id, signers = shares.len(), "payload threshold-signed");
        signature.serialize().map_err(signing_error)
    }

    /// Check `signature` over `payload` against the bundle's group key.
    pub fn verify(&self, bundle_id: &str, payload: &[u8], signature: &[u8]) -> CustodyResult<bool> {
        let bundles = self.bundles.read();
        let entry = bundles
            .get(bundle_id)
            .ok_or_else(|| CustodyError::UnknownBundle(bundle_id.to_string()))?;
        let Ok(signature) = frost::Signature::deserialize(signature) else {
            return Ok(false);
        };
        Ok(entry
            .pubkeys
            .verifying_key()
            .verify(payload, &signature)
            .is_ok())
    }

    /// Revoke a bundle. Only its owner may; custodians are told to drop
    /// their shares, best-effort.
    pub async fn revoke(&self, bundle_id: &str, requester: &Address) -> CustodyResult<KeyShareBundle> {
        let (bundle, signers) = {
            let mut bundles = self.bundles.write();
            let entry = bundles
                .get_mut(bundle_id)
                .ok_or_else(|| CustodyError::UnknownBundle(bundle_id.to_string()))?;
            if entry.bundle.owner != *requester {
                return Err(CustodyError::Unauthorized {
                    bundle_id: bundle_id.to_string(),
                    requester: requester.clone(),
                });
            }
            entry.bundle.status = BundleStatus::Revoked;
            (entry.bundle.clone(), entry.signers.clone())
        };

        info!(bundle = %bundle_id, "key bundle revoked");

        self.discard_shares(bundle_id, &signers).await;
        Ok(bundle)
    }
}

/// A fresh random Ed25519 signing scalar, serialized for `split_key`.
pub fn generate_signing_secret() -> Zeroizing<Vec<u8>> {
    Zeroizing::new(frost::SigningKey::new(&mut rand::rngs::OsRng).serialize())
}
