//! AES-256-GCM primitives for the vault, via `ring`.
//!
//! Every credential value is sealed under the vault's 256-bit master key
//! with a fresh random 96-bit nonce, so each row carries its own
//! `(nonce, ciphertext)` pair.  Random nonces are safe at credential-store
//! volumes (collision odds are negligible below ~2^32 seals per key).
//! Where the master key comes from is the host application's concern; the
//! vault only requires that it is 32 bytes.

use ring::aead::{self, Aad, LessSafeKey, NONCE_LEN, Nonce, UnboundKey};
use ring::rand::{SecureRandom, SystemRandom};

use crate::error::{Result, VaultError};

/// Length of the AES-256-GCM key in bytes.
pub const KEY_LEN: usize = 32;

/// Length of the AES-256-GCM nonce in bytes (96 bits).
pub const NONCE_LEN_BYTES: usize = NONCE_LEN;

/// AES-256-GCM algorithm from `ring`.
static AEAD_ALG: &aead::Algorithm = &aead::AES_256_GCM;

/// Bind the master key for one seal or open operation.
///
/// Nonces are supplied explicitly per call, so the single-shot
/// [`LessSafeKey`] API fits here; uniqueness is guaranteed by generating a
/// fresh random nonce for every seal.
fn aead_key(key: &[u8]) -> Result<LessSafeKey> {
    if key.len() != KEY_LEN {
        return Err(VaultError::InvalidKeyLength {
            expected: KEY_LEN,
            actual: key.len(),
        });
    }
    let unbound = UnboundKey::new(AEAD_ALG, key)
        .map_err(|_| VaultError::Internal("could not bind AES-256-GCM key".into()))?;
    Ok(LessSafeKey::new(unbound))
}

/// Seal `plaintext` under the master key with a fresh random nonce.
///
/// Returns `(nonce, ciphertext)`; the 128-bit authentication tag is
/// appended to the ciphertext.
pub fn encrypt(plaintext: &[u8], key: &[u8]) -> Result<([u8; NONCE_LEN_BYTES], Vec<u8>)> {
    let cipher = aead_key(key)?;

    let mut nonce_bytes = [0u8; NONCE_LEN_BYTES];
    SystemRandom::new()
        .fill(&mut nonce_bytes)
        .map_err(|_| VaultError::EncryptionFailed {
            reason: "nonce generation failed".into(),
        })?;

    let mut sealed = plaintext.to_vec();
    cipher
        .seal_in_place_append_tag(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::empty(),
            &mut sealed,
        )
        .map_err(|_| VaultError::EncryptionFailed {
            reason: "AEAD seal failed".into(),
        })?;

    Ok((nonce_bytes, sealed))
}

/// Open `ciphertext` (tag included) that was sealed under `nonce` and the
/// master key.
pub fn decrypt(nonce: &[u8; NONCE_LEN_BYTES], ciphertext: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    let cipher = aead_key(key)?;

    let mut buffer = ciphertext.to_vec();
    let opened = cipher
        .open_in_place(
            Nonce::assume_unique_for_key(*nonce),
            Aad::empty(),
            &mut buffer,
        )
        .map_err(|_| VaultError::DecryptionFailed {
            reason: "ciphertext failed authentication".into(),
        })?;

    Ok(opened.to_vec())
}

/// Generate a fresh random 256-bit master key.
pub fn generate_master_key() -> Result<[u8; KEY_LEN]> {
    let mut key = [0u8; KEY_LEN];
    SystemRandom::new()
        .fill(&mut key)
        .map_err(|_| VaultError::Internal("failed to generate random key".into()))?;
    Ok(key)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = generate_master_key().unwrap();
        let plaintext = b"opaque-access-token";

        let (nonce, ciphertext) = encrypt(plaintext, &key).unwrap();
        let decrypted = decrypt(&nonce, &ciphertext, &key).unwrap();

        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn decrypt_with_wrong_key_fails() {
        let key1 = generate_master_key().unwrap();
        let key2 = generate_master_key().unwrap();

        let (nonce, ciphertext) = encrypt(b"secret", &key1).unwrap();
        assert!(decrypt(&nonce, &ciphertext, &key2).is_err());
    }

    #[test]
    fn decrypt_with_tampered_ciphertext_fails() {
        let key = generate_master_key().unwrap();
        let (nonce, mut ciphertext) = encrypt(b"secret", &key).unwrap();
        if let Some(byte) = ciphertext.first_mut() {
            *byte ^= 0x01;
        }
        assert!(decrypt(&nonce, &ciphertext, &key).is_err());
    }

    #[test]
    fn invalid_key_length_rejected() {
        let short_key = vec![0u8; 16];
        match encrypt(b"test", &short_key) {
            Err(VaultError::InvalidKeyLength { expected, actual }) => {
                assert_eq!(expected, KEY_LEN);
                assert_eq!(actual, 16);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(decrypt(&[0u8; NONCE_LEN_BYTES], b"test", &short_key).is_err());
    }
}
