//! Single-shot XChaCha20-Poly1305 sealing
//!
//! Sealed format (binary):
//! ```text
//! [24 bytes: random nonce][N bytes: ciphertext][16 bytes: Poly1305 tag]
//! ```
//!
//! Callers bind each sealed unit to its context through the AAD (blob id and
//! frame position for blob frames, segment name for index segments), so a
//! unit moved anywhere else fails authentication.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use lockbox_core::{LockboxError, LockboxResult};
use rand::RngCore;

use crate::keys::DerivedKey;
use crate::{NONCE_SIZE, TAG_SIZE};

/// Bytes added by [`seal`] on top of the plaintext.
pub const SEAL_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

/// Encrypt `plaintext` under `key`, authenticating `aad`.
///
/// Returns: `[24-byte nonce][ciphertext][16-byte tag]`
pub fn seal(key: &DerivedKey, aad: &[u8], plaintext: &[u8]) -> LockboxResult<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| LockboxError::crypto(format!("encryption failed: {e}")))?;

    let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

/// Decrypt the output of [`seal`]. Any mismatch of key, AAD or bytes is a
/// `CryptoFailure`; no partial plaintext is ever returned.
pub fn open(key: &DerivedKey, aad: &[u8], sealed: &[u8]) -> LockboxResult<Vec<u8>> {
    if sealed.len() < SEAL_OVERHEAD {
        return Err(LockboxError::crypto(format!(
            "sealed data too short: {} bytes (minimum {SEAL_OVERHEAD})",
            sealed.len()
        )));
    }

    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_SIZE);
    let nonce = XNonce::from_slice(nonce_bytes);
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());

    cipher
        .decrypt(
            nonce,
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| LockboxError::crypto("decryption failed: wrong key, corrupted data, or wrong context"))
}
