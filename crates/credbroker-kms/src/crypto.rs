//! AES-256-GCM primitives using the `ring` crate.
//!
//! Every call generates a fresh random 96-bit nonce. Callers bind ciphertext
//! to its context (scope id, key version) through the additional
//! authenticated data, so a ciphertext replayed under a different context
//! fails authentication.

use ring::aead::{self, Aad, BoundKey, NONCE_LEN, Nonce, NonceSequence, SealingKey, UnboundKey};
use ring::rand::{SecureRandom, SystemRandom};
use zeroize::Zeroizing;

use crate::error::{KmsError, Result};

/// Length of an AES-256-GCM key in bytes.
pub const KEY_LEN: usize = 32;

/// Length of the AES-256-GCM nonce in bytes (96 bits).
pub const NONCE_LEN_BYTES: usize = NONCE_LEN;

/// Length of the GCM authentication tag appended to every ciphertext.
pub const TAG_LEN: usize = 16;

static AEAD_ALG: &aead::Algorithm = &aead::AES_256_GCM;

// ---------------------------------------------------------------------------
// Nonce handling
// ---------------------------------------------------------------------------

/// A nonce sequence that yields exactly one nonce and then errors, so each
/// bound key is used for a single seal or open.
struct SingleNonce(Option<[u8; NONCE_LEN_BYTES]>);

impl SingleNonce {
    fn new(bytes: [u8; NONCE_LEN_BYTES]) -> Self {
        Self(Some(bytes))
    }
}

impl NonceSequence for SingleNonce {
    fn advance(&mut self) -> std::result::Result<Nonce, ring::error::Unspecified> {
        self.0
            .take()
            .map(Nonce::assume_unique_for_key)
            .ok_or(ring::error::Unspecified)
    }
}

// ---------------------------------------------------------------------------
// Encryption
// ---------------------------------------------------------------------------

/// Encrypt `plaintext` under `key`, authenticating `aad` alongside it.
///
/// Returns `(nonce, ciphertext)`; the ciphertext carries the 128-bit tag.
pub fn seal(plaintext: &[u8], key: &[u8], aad: &[u8]) -> Result<([u8; NONCE_LEN_BYTES], Vec<u8>)> {
    if key.len() != KEY_LEN {
        return Err(KmsError::EncryptionFailed {
            reason: format!("key must be {} bytes, got {}", KEY_LEN, key.len()),
        });
    }

    let mut nonce_bytes = [0u8; NONCE_LEN_BYTES];
    SystemRandom::new()
        .fill(&mut nonce_bytes)
        .map_err(|_| KmsError::EncryptionFailed {
            reason: "failed to generate random nonce".into(),
        })?;

    let unbound_key = UnboundKey::new(AEAD_ALG, key).map_err(|_| KmsError::EncryptionFailed {
        reason: "failed to create AES-256-GCM key".into(),
    })?;
    let mut sealing_key = SealingKey::new(unbound_key, SingleNonce::new(nonce_bytes));

    let mut in_out = plaintext.to_vec();
    sealing_key
        .seal_in_place_append_tag(Aad::from(aad), &mut in_out)
        .map_err(|_| KmsError::EncryptionFailed {
            reason: "seal_in_place failed".into(),
        })?;

    tracing::trace!(
        plaintext_len = plaintext.len(),
        ciphertext_len = in_out.len(),
        "sealed data"
    );

    Ok((nonce_bytes, in_out))
}

/// Decrypt `ciphertext` sealed by [`seal`] with the same `key` and `aad`.
///
/// The plaintext is returned in a buffer that is wiped on drop.
pub fn open(
    nonce: &[u8; NONCE_LEN_BYTES],
    ciphertext: &[u8],
    key: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    if key.len() != KEY_LEN {
        return Err(KmsError::DecryptionFailed {
            reason: format!("key must be {} bytes, got {}", KEY_LEN, key.len()),
        });
    }

    let unbound_key = UnboundKey::new(AEAD_ALG, key).map_err(|_| KmsError::DecryptionFailed {
        reason: "failed to create AES-256-GCM key".into(),
    })?;
    let mut opening_key = aead::OpeningKey::new(unbound_key, SingleNonce::new(*nonce));

    let mut in_out = Zeroizing::new(ciphertext.to_vec());
    let plaintext_len = opening_key
        .open_in_place(Aad::from(aad), &mut in_out)
        .map_err(|_| KmsError::DecryptionFailed {
            reason: "authentication failed".into(),
        })?
        .len();
    in_out.truncate(plaintext_len);

    tracing::trace!(
        ciphertext_len = ciphertext.len(),
        plaintext_len,
        "opened data"
    );

    Ok(in_out)
}

// ---------------------------------------------------------------------------
// Random bytes
// ---------------------------------------------------------------------------

/// Generate `len` cryptographically secure random bytes.
pub fn random_bytes(len: usize) -> Result<Zeroizing<Vec<u8>>> {
    let mut buf = Zeroizing::new(vec![0u8; len]);
    SystemRandom::new()
        .fill(&mut buf)
        .map_err(|_| KmsError::Internal("failed to generate random bytes".into()))?;
    Ok(buf)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let key = random_bytes(KEY_LEN).unwrap();
        let (nonce, ciphertext) = seal(b"vault token", &key, b"scope").unwrap();
        assert_eq!(ciphertext.len(), b"vault token".len() + TAG_LEN);

        let plaintext = open(&nonce, &ciphertext, &key, b"scope").unwrap();
        assert_eq!(plaintext.as_slice(), b"vault token");
    }

    #[test]
    fn open_with_wrong_key_fails() {
        let key1 = random_bytes(KEY_LEN).unwrap();
        let key2 = random_bytes(KEY_LEN).unwrap();

        let (nonce, ciphertext) = seal(b"secret", &key1, b"").unwrap();
        assert!(open(&nonce, &ciphertext, &key2, b"").is_err());
    }

    #[test]
    fn open_with_different_aad_fails() {
        let key = random_bytes(KEY_LEN).unwrap();

        let (nonce, ciphertext) = seal(b"secret", &key, b"o_1234567890").unwrap();
        let result = open(&nonce, &ciphertext, &key, b"p_1234567890");
        assert!(matches!(result, Err(KmsError::DecryptionFailed { .. })));
    }

    #[test]
    fn open_tampered_ciphertext_fails() {
        let key = random_bytes(KEY_LEN).unwrap();

        let (nonce, mut ciphertext) = seal(b"secret", &key, b"").unwrap();
        if let Some(byte) = ciphertext.first_mut() {
            *byte ^= 0x01;
        }
        assert!(open(&nonce, &ciphertext, &key, b"").is_err());
    }

    #[test]
    fn invalid_key_length_rejected() {
        let short_key = vec![0u8; 16];
        assert!(matches!(
            seal(b"test", &short_key, b""),
            Err(KmsError::EncryptionFailed { .. })
        ));
    }

    #[test]
    fn empty_plaintext_roundtrip() {
        let key = random_bytes(KEY_LEN).unwrap();
        let (nonce, ciphertext) = seal(b"", &key, b"aad").unwrap();
        let plaintext = open(&nonce, &ciphertext, &key, b"aad").unwrap();
        assert!(plaintext.is_empty());
    }
}
