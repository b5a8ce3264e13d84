//! Social recovery of a member's key.
//!
//! The member escrows a key with a set of guardians. The escrowed copy sits
//! in the secret backend under an identity only this manager reads as, so no
//! guardian can fetch it alone; once `threshold` guardians have approved,
//! any approving guardian can recover it for the member.

use crate::identity::Address;
use crate::retry::{retry_with_backoff, with_timeout, RetryPolicy};
use crate::secrets::{AccessPolicy, SecretBackend, SecretError, SecretHandle, SecretValue};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};
use zeroize::Zeroizing;

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("Recovery plan {0} not found")]
    UnknownPlan(String),

    #[error("Invalid recovery threshold {threshold} of {guardians} guardians")]
    InvalidThreshold { threshold: u16, guardians: usize },

    #[error("Invalid guardians: {0}")]
    InvalidGuardians(String),

    #[error("{requester} is not a guardian of recovery plan {plan_id}")]
    NotGuardian { plan_id: String, requester: Address },

    #[error("Recovery needs {required} approvals, has {approvals}")]
    NotApproved { required: u16, approvals: usize },

    #[error(transparent)]
    Secret(#[from] SecretError),
}

impl RecoveryError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Secret(e) if e.is_retryable())
    }
}

pub type RecoveryResult<T> = Result<T, RecoveryError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryPlan {
    pub id: String,
    pub owner: Address,
    pub guardians: Vec<Address>,
    pub threshold: u16,
    pub created_at: u64,
}

struct PlanEntry {
    plan: RecoveryPlan,
    handle: SecretHandle,
    approvals: BTreeSet<Address>,
}

pub struct SocialRecovery {
    secrets: Arc<dyn SecretBackend>,
    plans: RwLock<HashMap<String, PlanEntry>>,
    timeout: Duration,
    retry: RetryPolicy,
}

/// The identity the escrowed secret is readable by.
fn escrow_identity(plan_id: &str) -> Address {
    Address::new(format!("recovery:{plan_id}"))
}

impl SocialRecovery {
    pub fn new(secrets: Arc<dyn SecretBackend>, timeout: Duration, retry: RetryPolicy) -> Self {
        Self {
            secrets,
            plans: RwLock::new(HashMap::new()),
            timeout,
            retry,
        }
    }

    /// Escrow `secret` so that `threshold` of `guardians` can recover it.
    pub async fn setup(
        &self,
        owner: &Address,
        secret: Zeroizing<Vec<u8>>,
        guardians: Vec<Address>,
        threshold: u16,
    ) -> RecoveryResult<RecoveryPlan> {
        if guardians.iter().any(|g| g == owner) {
            return Err(RecoveryError::InvalidGuardians(
                "owner cannot guard their own key".to_string(),
            ));
        }
        let unique: BTreeSet<&Address> = guardians.iter().collect();
        if unique.len() != guardians.len() {
            return Err(RecoveryError::InvalidGuardians("duplicate guardian".to_string()));
        }
        if threshold == 0 || usize::from(threshold) > guardians.len() {
            return Err(RecoveryError::InvalidThreshold {
                threshold,
                guardians: guardians.len(),
            });
        }

        let created_at = crate::unix_millis();
        let id = hex::encode(rand::random::<[u8; 16]>());
        let policy = AccessPolicy::owner_only(escrow_identity(&id));

        let handle = retry_with_backoff(
            &self.retry,
            || {
                with_timeout(
                    self.timeout,
                    self.secrets
                        .store_secret(SecretValue::Blob(secret.to_vec()), policy.clone()),
                    || SecretError::Timeout,
                )
            },
            SecretError::is_retryable,
        )
        .await?;

        let plan = RecoveryPlan {
            id: id.clone(),
            owner: owner.clone(),
            guardians,
            threshold,
            created_at,
        };
        info!(plan = %id, guardians = plan.guardians.len(), threshold, "social recovery set up");

        self.plans.write().insert(
            id,
            PlanEntry {
                plan: plan.clone(),
                handle,
                approvals: BTreeSet::new(),
            },
        );
        Ok(plan)
    }

    pub fn plan(&self, plan_id: &str) -> RecoveryResult<RecoveryPlan> {
        self.plans
            .read()
            .get(plan_id)
            .map(|entry| entry.plan.clone())
            .ok_or_else(|| RecoveryError::UnknownPlan(plan_id.to_string()))
    }

    /// Record `guardian`'s approval; returns the approval count.
    pub fn approve(&self, plan_id: &str, guardian: &Address) -> RecoveryResult<usize> {
        let mut plans = self.plans.write();
        let entry = plans
            .get_mut(plan_id)
            .ok_or_else(|| RecoveryError::UnknownPlan(plan_id.to_string()))?;
        if !entry.plan.guardians.contains(guardian) {
            warn!(plan = %plan_id, requester = %guardian, "recovery approval refused");
            return Err(RecoveryError::NotGuardian {
                plan_id: plan_id.to_string(),
                requester: guardian.clone(),
            });
        }
        entry.approvals.insert(guardian.clone());
        Ok(entry.approvals.len())
    }

    /// Hand the escrowed secret to an approving guardian once the threshold
    /// is met.
    pub async fn recover(
        &self,
        plan_id: &str,
        guardian: &Address,
    ) -> RecoveryResult<Zeroizing<Vec<u8>>> {
        let handle = {
            let plans = self.plans.read();
            let entry = plans
                .get(plan_id)
                .ok_or_else(|| RecoveryError::UnknownPlan(plan_id.to_string()))?;
            if !entry.approvals.contains(guardian) {
                return Err(RecoveryError::NotGuardian {
                    plan_id: plan_id.to_string(),
                    requester: guardian.clone(),
                });
            }
            if entry.approvals.len() < usize::from(entry.plan.threshold) {
                return Err(RecoveryError::NotApproved {
                    required: entry.plan.threshold,
                    approvals: entry.approvals.len(),
                });
            }
            entry.handle.clone()
        };

        let escrow = escrow_identity(plan_id);
        let value = retry_with_backoff(
            &self.retry,
            || {
                with_timeout(
                    self.timeout,
                    self.secrets.retrieve(&handle, &escrow),
                    || SecretError::Timeout,
                )
            },
            SecretError::is_retryable,
        )
        .await?;

        info!(plan = %plan_id, guardian = %guardian, "key recovered");
        match value {
            SecretValue::Blob(bytes) => Ok(Zeroizing::new(bytes)),
            SecretValue::Vector(_) => Err(RecoveryError::Secret(SecretError::InvalidInput(
                "escrowed key is not a blob".to_string(),
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::LocalSecretVault;

    fn recovery() -> (SocialRecovery, LocalSecretVault) {
        let secrets = LocalSecretVault::new(3);
        let recovery = SocialRecovery::new(
            Arc::new(secrets.clone()),
            Duration::from_millis(200),
            RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
        );
        (recovery, secrets)
    }

    fn guardians() -> Vec<Address> {
        ["0xana", "0xben", "0xcat"].into_iter().map(Address::new).collect()
    }

    #[tokio::test]
    async fn test_threshold_approvals_recover_key() {
        let (recovery, _) = recovery();
        let alice = Address::new("0xalice");
        let [ana, ben, _cat]: [Address; 3] = guardians().try_into().unwrap();

        let plan = recovery
            .setup(&alice, Zeroizing::new(b"wallet key".to_vec()), guardians(), 2)
            .await
            .unwrap();

        assert_eq!(recovery.approve(&plan.id, &ana).unwrap(), 1);
        assert!(matches!(
            recovery.recover(&plan.id, &ana).await,
            Err(RecoveryError::NotApproved {
                required: 2,
                approvals: 1
            })
        ));

        assert_eq!(recovery.approve(&plan.id, &ben).unwrap(), 2);
        let key = recovery.recover(&plan.id, &ben).await.unwrap();
        assert_eq!(&key[..], b"wallet key");
    }

    #[tokio::test]
    async fn test_no_guardian_reads_the_escrow_directly() {
        let (recovery, secrets) = recovery();
        let plan = recovery
            .setup(
                &Address::new("0xalice"),
                Zeroizing::new(b"wallet key".to_vec()),
                guardians(),
                2,
            )
            .await
            .unwrap();

        let handle = recovery.plans.read()[&plan.id].handle.clone();
        for guardian in guardians() {
            assert!(matches!(
                secrets.retrieve(&handle, &guardian).await,
                Err(SecretError::Unauthorized { .. })
            ));
        }
    }

    #[tokio::test]
    async fn test_strangers_cannot_approve_or_recover() {
        let (recovery, _) = recovery();
        let plan = recovery
            .setup(
                &Address::new("0xalice"),
                Zeroizing::new(b"k".to_vec()),
                guardians(),
                1,
            )
            .await
            .unwrap();
        let mallory = Address::new("0xmallory");

        assert!(matches!(
            recovery.approve(&plan.id, &mallory),
            Err(RecoveryError::NotGuardian { .. })
        ));
        recovery.approve(&plan.id, &Address::new("0xana")).unwrap();
        assert!(matches!(
            recovery.recover(&plan.id, &mallory).await,
            Err(RecoveryError::NotGuardian { .. })
        ));
    }

    #[tokio::test]
    async fn test_invalid_setup() {
        let (recovery, _) = recovery();
        let alice = Address::new("0xalice");
        let key = || Zeroizing::new(b"k".to_vec());

        assert!(matches!(
            recovery.setup(&alice, key(), guardians(), 4).await,
            Err(RecoveryError::InvalidThreshold { .. })
        ));
        assert!(matches!(
            recovery.setup(&alice, key(), guardians(), 0).await,
            Err(RecoveryError::InvalidThreshold { .. })
        ));
        assert!(matches!(
            recovery.setup(&alice, key(), vec![alice.clone()], 1).await,
            Err(RecoveryError::InvalidGuardians(_))
        ));
        let twice = vec![Address::new("0xana"), Address::new("0xANA")];
        assert!(matches!(
            recovery.setup(&alice, key(), twice, 1).await,
            Err(RecoveryError::InvalidGuardians(_))
        ));
        assert!(matches!(
            recovery.approve("missing", &alice),
            Err(RecoveryError::UnknownPlan(_))
        ));
    }

    #[tokio::test]
    async fn test_secret_outage_is_retryable() {
        let (recovery, secrets) = recovery();
        secrets.set_offline(true);
        let err = recovery
            .setup(
                &Address::new("0xalice"),
                Zeroizing::new(b"k".to_vec()),
                guardians(),
                2,
            )
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
