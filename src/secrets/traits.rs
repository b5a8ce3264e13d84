//! Trait abstraction for the secret-computation backend.
//!
//! A secret is stored split across nodes; no single node can read it. Who
//! may reconstruct it is decided by its `AccessPolicy`, and the only other
//! way to learn anything about it is a permitted `Program`, which returns
//! an aggregate over many secrets.

use crate::identity::Address;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

/// Opaque reference to a stored secret.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SecretHandle(String);

impl SecretHandle {
    pub fn generate() -> Self {
        Self(hex::encode(rand::random::<[u8; 16]>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SecretHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A secret value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretValue {
    /// Opaque bytes (keys, drafts).
    Blob(Vec<u8>),
    /// Integers mod 2^64; summable by programs.
    Vector(Vec<u64>),
}

/// Computations the backend can run over secrets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Program {
    /// Element-wise sum of equal-length vectors.
    Tally,
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tally => f.write_str("tally"),
        }
    }
}

/// Who may read a secret and which programs may consume it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AccessPolicy {
    /// May always retrieve. `None` means nobody can.
    pub owner: Option<Address>,
    pub readers: BTreeSet<Address>,
    pub programs: BTreeSet<Program>,
}

impl AccessPolicy {
    pub fn owner_only(owner: Address) -> Self {
        Self {
            owner: Some(owner),
            ..Default::default()
        }
    }

    pub fn with_readers(owner: Address, readers: impl IntoIterator<Item = Address>) -> Self {
        Self {
            owner: Some(owner),
            readers: readers.into_iter().collect(),
            programs: BTreeSet::new(),
        }
    }

    /// Unreadable by anyone; only `program` may consume it.
    pub fn compute_only(program: Program) -> Self {
        Self {
            owner: None,
            readers: BTreeSet::new(),
            programs: [program].into_iter().collect(),
        }
    }

    pub fn can_read(&self, requester: &Address) -> bool {
        self.owner.as_ref() == Some(requester) || self.readers.contains(requester)
    }
}

pub type SecretResult<T> = Result<T, SecretError>;

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("{requester} is not authorized to read secret {handle}")]
    Unauthorized {
        handle: SecretHandle,
        requester: Address,
    },

    #[error("Secret {0} not found")]
    NotFound(SecretHandle),

    #[error("Program {program} is not permitted on secret {handle}")]
    ProgramNotPermitted {
        program: Program,
        handle: SecretHandle,
    },

    #[error("Invalid compute input: {0}")]
    InvalidInput(String),

    #[error("Secret backend unavailable: {0}")]
    Unavailable(String),

    #[error("Secret backend timed out")]
    Timeout,
}

impl SecretError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout)
    }
}

#[async_trait]
pub trait SecretBackend: Send + Sync {
    async fn store_secret(
        &self,
        value: SecretValue,
        policy: AccessPolicy,
    ) -> SecretResult<SecretHandle>;

    /// Reconstruct a secret for `requester`, enforcing its policy.
    async fn retrieve(&self, handle: &SecretHandle, requester: &Address)
        -> SecretResult<SecretValue>;

    /// Replace the policy of an existing secret. The owner cannot change.
    async fn update_permissions(
        &self,
        handle: &SecretHandle,
        policy: AccessPolicy,
    ) -> SecretResult<()>;

    /// Run `program` over the secrets in `bindings`, returning only the result.
    async fn compute(&self, program: Program, bindings: &[SecretHandle]) -> SecretResult<Vec<u64>>;
}
