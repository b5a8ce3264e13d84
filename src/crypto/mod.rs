/// Cryptographic helpers shared across components
///
/// - AES-256-GCM sealing for evidence payloads and drafts
/// - Operator key derivation from a BIP-39 mnemonic (keyring)
/// - Record identifiers for publications and evidence
pub mod aead;
pub mod keyring;

pub use aead::AeadError;
pub use keyring::{KeyringError, ResistKeyring};

use crate::identity::Address;
use sha2::{Digest, Sha256};

/// Unique record id: hex SHA-256 over content, author, time, and a random
/// salt. Identical content published twice gets two ids.
pub fn record_id(content: &[u8], author: &Address, timestamp: u64) -> String {
    let salt: [u8; 16] = rand::random();

    let mut hasher = Sha256::new();
    hasher.update(content);
    hasher.update(author.as_str().as_bytes());
    hasher.update(timestamp.to_be_bytes());
    hasher.update(salt);
    hex::encode(hasher.finalize())
}

/// `0x`-prefixed hex SHA-256, the format evidence hashes are exchanged in.
pub fn content_hash(data: &[u8]) -> String {
    format!("0x{}", hex::encode(Sha256::digest(data)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_ids_differ_for_same_input() {
        let author = Address::new("0xalice");
        let a = record_id(b"same", &author, 1);
        let b = record_id(b"same", &author, 1);
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_content_hash_format() {
        let hash = content_hash(b"");
        assert_eq!(
            hash,
            "0xe3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
