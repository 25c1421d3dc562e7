//! Key hierarchy: content key generation, domain sub-keys, key wrapping

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::kdf::PasswordKey;
use crate::{KEY_SIZE, NONCE_SIZE, TAG_SIZE};

/// A user's 256-bit content key. Zeroized on drop.
#[derive(Clone)]
pub struct ContentKey {
    bytes: [u8; KEY_SIZE],
}

impl ContentKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for ContentKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// A domain-separated sub-key of the content key. Zeroized on drop.
#[derive(Clone)]
pub struct DerivedKey {
    bytes: [u8; KEY_SIZE],
}

impl DerivedKey {
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for DerivedKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Generate a random 256-bit content key.
pub fn generate_content_key() -> ContentKey {
    let mut bytes = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut bytes);
    ContentKey::from_bytes(bytes)
}

/// Derive the blob encryption key from the content key via HKDF-SHA256.
pub fn derive_blob_key(content: &ContentKey) -> anyhow::Result<DerivedKey> {
    hkdf_derive(content.as_bytes(), b"lockbox-blob")
}

/// Derive the index segment encryption key from the content key via HKDF-SHA256.
pub fn derive_index_key(content: &ContentKey) -> anyhow::Result<DerivedKey> {
    hkdf_derive(content.as_bytes(), b"lockbox-index")
}

fn hkdf_derive(ikm: &[u8; KEY_SIZE], info: &[u8]) -> anyhow::Result<DerivedKey> {
    let hkdf = Hkdf::<Sha256>::new(None, ikm);
    let mut okm = [0u8; KEY_SIZE];
    hkdf.expand(info, &mut okm)
        .map_err(|e| anyhow::anyhow!("HKDF expand failed: {e}"))?;
    Ok(DerivedKey { bytes: okm })
}

#[derive(Debug, thiserror::Error)]
pub enum UnwrapError {
    /// Authentication failed: wrong password or tampered keystore
    #[error("key unwrapping rejected: invalid password key or corrupted data")]
    Rejected,
    #[error("malformed wrapped key: {0}")]
    Malformed(String),
}

/// Wrap (encrypt) the content key under a password key.
///
/// Output: `[24-byte nonce][ciphertext + 16-byte tag]`. `aad` binds the
/// wrapped key to its owner so keystores cannot be swapped between users.
pub fn wrap_key(wrapping: &PasswordKey, key: &ContentKey, aad: &[u8]) -> anyhow::Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(wrapping.as_bytes().into());

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: key.as_bytes().as_ref(),
                aad,
            },
        )
        .map_err(|e| anyhow::anyhow!("key wrapping failed: {e}"))?;

    let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

/// Unwrap (decrypt) a content key. Input is the output of [`wrap_key`].
pub fn unwrap_key(
    wrapping: &PasswordKey,
    wrapped: &[u8],
    aad: &[u8],
) -> Result<ContentKey, UnwrapError> {
    if wrapped.len() != NONCE_SIZE + KEY_SIZE + TAG_SIZE {
        return Err(UnwrapError::Malformed(format!(
            "wrapped key is {} bytes (expected {})",
            wrapped.len(),
            NONCE_SIZE + KEY_SIZE + TAG_SIZE
        )));
    }

    let (nonce_bytes, ciphertext) = wrapped.split_at(NONCE_SIZE);
    let nonce = XNonce::from_slice(nonce_bytes);
    let cipher = XChaCha20Poly1305::new(wrapping.as_bytes().into());

    let mut plaintext = cipher
        .decrypt(
            nonce,
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| UnwrapError::Rejected)?;

    let mut key_bytes = [0u8; KEY_SIZE];
    key_bytes.copy_from_slice(&plaintext);
    plaintext.zeroize();

    Ok(ContentKey::from_bytes(key_bytes))
}
