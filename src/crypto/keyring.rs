//! Operator keys derived from a BIP-39 mnemonic.
//!
//! ```text
//! BIP-39 mnemonic
//!         │
//!         ▼
//! Mnemonic::to_seed("")  → [u8; 64]
//!         │
//!         ▼
//! HKDF-SHA256(salt="resistnet-master-v1", seed)
//!         │
//!         ├─► expand("voter-dedup")      → voter_pepper
//!         └─► expand("draft-encryption") → draft_encryption_key
//! ```
//!
//! The mnemonic itself is never stored. Derived keys are zeroized on drop.

use bip39::Mnemonic;
use hkdf::Hkdf;
use sha2::Sha256;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

const MASTER_SALT: &[u8] = b"resistnet-master-v1";

mod purposes {
    pub const VOTER_DEDUP: &[u8] = b"voter-dedup";
    pub const DRAFT_ENCRYPTION: &[u8] = b"draft-encryption";
}

#[derive(Debug, Error)]
pub enum KeyringError {
    #[error("Invalid mnemonic: {0}")]
    InvalidMnemonic(String),

    #[error("Key derivation failed: {0}")]
    DerivationFailed(String),
}

#[derive(Zeroize, ZeroizeOnDrop)]
pub struct ResistKeyring {
    /// Pepper for HMAC voter deduplication in the tally engine.
    voter_pepper: [u8; 32],

    /// AES-256-GCM key for drafts held in the secret backend.
    draft_encryption_key: [u8; 32],
}

impl ResistKeyring {
    pub fn from_mnemonic(mnemonic: &str) -> Result<Self, KeyringError> {
        let parsed =
            Mnemonic::parse(mnemonic).map_err(|e| KeyringError::InvalidMnemonic(e.to_string()))?;
        let seed = zeroize::Zeroizing::new(parsed.to_seed(""));

        let hkdf = Hkdf::<Sha256>::new(Some(MASTER_SALT), &seed[..]);

        Ok(Self {
            voter_pepper: derive_key(&hkdf, purposes::VOTER_DEDUP)?,
            draft_encryption_key: derive_key(&hkdf, purposes::DRAFT_ENCRYPTION)?,
        })
    }

    /// Keyring with random keys, for nodes started without an operator
    /// mnemonic. Voter dedup then only holds for the process lifetime.
    pub fn ephemeral() -> Self {
        use rand::RngCore;
        let mut rng = rand::rngs::OsRng;
        let mut keyring = Self {
            voter_pepper: [0u8; 32],
            draft_encryption_key: [0u8; 32],
        };
        rng.fill_bytes(&mut keyring.voter_pepper);
        rng.fill_bytes(&mut keyring.draft_encryption_key);
        keyring
    }

    pub fn voter_pepper(&self) -> &[u8; 32] {
        &self.voter_pepper
    }

    pub fn draft_encryption_key(&self) -> &[u8; 32] {
        &self.draft_encryption_key
    }
}

fn derive_key(hkdf: &Hkdf<Sha256>, info: &[u8]) -> Result<[u8; 32], KeyringError> {
    let mut key = [0u8; 32];
    hkdf.expand(info, &mut key)
        .map_err(|e| KeyringError::DerivationFailed(format!("{:?}", e)))?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Standard BIP-39 test vector, never for real use
    const TEST_MNEMONIC: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon art";

    #[test]
    fn test_invalid_mnemonic_rejected() {
        assert!(matches!(
            ResistKeyring::from_mnemonic("not a real mnemonic"),
            Err(KeyringError::InvalidMnemonic(_))
        ));
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let a = ResistKeyring::from_mnemonic(TEST_MNEMONIC).unwrap();
        let b = ResistKeyring::from_mnemonic(TEST_MNEMONIC).unwrap();
        assert_eq!(a.voter_pepper(), b.voter_pepper());
        assert_eq!(a.draft_encryption_key(), b.draft_encryption_key());
    }

    #[test]
    fn test_keys_are_domain_separated() {
        let keyring = ResistKeyring::from_mnemonic(TEST_MNEMONIC).unwrap();
        assert_ne!(keyring.voter_pepper(), keyring.draft_encryption_key());
    }

    #[test]
    fn test_different_mnemonics_differ() {
        let zoo = "zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo vote";
        let a = ResistKeyring::from_mnemonic(TEST_MNEMONIC).unwrap();
        let b = ResistKeyring::from_mnemonic(zoo).unwrap();
        assert_ne!(a.voter_pepper(), b.voter_pepper());
    }

    #[test]
    fn test_ephemeral_keyrings_differ() {
        let a = ResistKeyring::ephemeral();
        let b = ResistKeyring::ephemeral();
        assert_ne!(a.voter_pepper(), b.voter_pepper());
    }
}
