//! AES-256-GCM sealing for evidence and drafts.
//!
//! Sealed layout: `nonce (12) || ciphertext || tag (16)`. Keys are random
//! per object unless the caller supplies one (drafts use the keyring key).

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use thiserror::Error;
use zeroize::Zeroizing;

pub const KEY_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum AeadError {
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Invalid key length: expected {KEY_LEN} bytes, got {0}")]
    InvalidKeyLength(usize),
}

/// Fresh random 256-bit key.
pub fn generate_key() -> Result<Zeroizing<[u8; KEY_LEN]>, AeadError> {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    SystemRandom::new()
        .fill(&mut key[..])
        .map_err(|_| AeadError::EncryptionFailed("RNG failure".to_string()))?;
    Ok(key)
}

fn less_safe_key(key: &[u8]) -> Result<LessSafeKey, AeadError> {
    if key.len() != KEY_LEN {
        return Err(AeadError::InvalidKeyLength(key.len()));
    }
    let unbound = UnboundKey::new(&AES_256_GCM, key)
        .map_err(|e| AeadError::EncryptionFailed(format!("Key creation failed: {}", e)))?;
    Ok(LessSafeKey::new(unbound))
}

/// Encrypt `plaintext` under `key` with a random nonce.
pub fn seal(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, AeadError> {
    let key = less_safe_key(key)?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    SystemRandom::new()
        .fill(&mut nonce_bytes)
        .map_err(|_| AeadError::EncryptionFailed("RNG failure".to_string()))?;
    let nonce = Nonce::assume_unique_for_key(nonce_bytes);

    let mut in_out = plaintext.to_vec();
    key.seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)
        .map_err(|e| AeadError::EncryptionFailed(e.to_string()))?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + in_out.len());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&in_out);
    Ok(sealed)
}

/// Decrypt the output of [`seal`]. Fails on any tampering.
pub fn open(key: &[u8], sealed: &[u8]) -> Result<Vec<u8>, AeadError> {
    let key = less_safe_key(key)?;

    if sealed.len() < NONCE_LEN + AES_256_GCM.tag_len() {
        return Err(AeadError::DecryptionFailed(
            "Ciphertext too short".to_string(),
        ));
    }

    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
    let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
        .map_err(|_| AeadError::DecryptionFailed("Invalid nonce".to_string()))?;

    let mut plaintext = ciphertext.to_vec();
    key.open_in_place(nonce, Aad::empty(), &mut plaintext)
        .map_err(|e| AeadError::DecryptionFailed(e.to_string()))?;

    // Drop the authentication tag
    plaintext.truncate(plaintext.len() - AES_256_GCM.tag_len());
    Ok(plaintext)
}
