//! Password stretching for keystore wrapping.
//!
//! A user's password never encrypts data directly: Argon2id turns it into a
//! [`PasswordKey`] that wraps the user's random content key in the keystore.

use argon2::{Algorithm, Argon2, Params, Version};
use lockbox_core::config::CryptoConfig;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{KEY_SIZE, SALT_SIZE};

/// Key-encryption key for one keystore.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct PasswordKey {
    bytes: [u8; KEY_SIZE],
}

impl PasswordKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for PasswordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PasswordKey([REDACTED])")
    }
}

/// Argon2id cost parameters.
///
/// Stored verbatim in each keystore so a later config change never locks a
/// user out of an existing keystore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory cost in KiB (default: 65536 = 64 MiB)
    pub mem_cost_kib: u32,
    /// Time cost / iterations (default: 3)
    pub time_cost: u32,
    /// Parallelism (default: 4)
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            mem_cost_kib: 65536,
            time_cost: 3,
            parallelism: 4,
        }
    }
}

impl From<&CryptoConfig> for KdfParams {
    fn from(cfg: &CryptoConfig) -> Self {
        Self {
            mem_cost_kib: cfg.argon2_mem_cost_kib,
            time_cost: cfg.argon2_time_cost,
            parallelism: cfg.argon2_parallelism,
        }
    }
}

impl KdfParams {
    /// Cheap parameters for tests. Never use for real keystores.
    pub fn insecure_fast() -> Self {
        Self {
            mem_cost_kib: 1024,
            time_cost: 1,
            parallelism: 1,
        }
    }

    fn hasher(&self) -> anyhow::Result<Argon2<'static>> {
        let params = Params::new(
            self.mem_cost_kib,
            self.time_cost,
            self.parallelism,
            Some(KEY_SIZE),
        )
        .map_err(|e| anyhow::anyhow!("keystore KDF parameters rejected: {e}"))?;
        Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }
}

/// Stretch `password` with the keystore's salt and parameters.
///
/// Opening a keystore must use exactly the salt and params it was created
/// with; both are stored in the clear next to the wrapped key.
pub fn derive_password_key(
    password: &SecretString,
    salt: &[u8; SALT_SIZE],
    params: &KdfParams,
) -> anyhow::Result<PasswordKey> {
    let mut key = PasswordKey::from_bytes([0u8; KEY_SIZE]);
    params
        .hasher()?
        .hash_password_into(password.expose_secret().as_bytes(), salt, &mut key.bytes)
        .map_err(|e| anyhow::anyhow!("stretching keystore password: {e}"))?;
    Ok(key)
}
