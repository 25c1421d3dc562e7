//! Per-user keystores: `<secrets_root>/<username>.keystore`
//!
//! A keystore holds the user's content key wrapped under an Argon2id key
//! derived from their password. It is created on first use and never
//! rewritten afterwards, so creation only has to win a create-if-absent race.

use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use lockbox_core::{validate_component, LockboxError, LockboxResult};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::kdf::{derive_password_key, KdfParams};
use crate::keys::{
    derive_blob_key, derive_index_key, generate_content_key, unwrap_key, wrap_key, ContentKey,
    DerivedKey, UnwrapError,
};
use crate::SALT_SIZE;

const KEYSTORE_VERSION: u32 = 1;

/// On-disk keystore record (JSON)
#[derive(Debug, Serialize, Deserialize)]
struct KeystoreFile {
    version: u32,
    kdf: KdfParams,
    /// Base64 Argon2id salt
    salt: String,
    /// Base64 `[nonce][wrapped content key + tag]`
    wrapped_key: String,
}

/// Opens (or lazily creates) users' content keys.
///
/// Holds no key material: every call re-derives from the password.
#[derive(Debug, Clone)]
pub struct KeyVault {
    secrets_root: PathBuf,
    params: KdfParams,
}

impl KeyVault {
    /// `params` only apply to keystores created from now on; existing
    /// keystores carry their own.
    pub fn new(secrets_root: impl Into<PathBuf>, params: KdfParams) -> Self {
        Self {
            secrets_root: secrets_root.into(),
            params,
        }
    }

    pub fn keystore_path(&self, username: &str) -> PathBuf {
        self.secrets_root.join(format!("{username}.keystore"))
    }

    /// Return `username`'s content key, creating the keystore on first use.
    pub async fn get_or_create_key(
        &self,
        username: &str,
        password: &SecretString,
    ) -> LockboxResult<ContentKey> {
        validate_component(username)?;
        let path = self.keystore_path(username);

        match tokio::fs::read(&path).await {
            Ok(bytes) => open_keystore(username, password, bytes).await,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.create_keystore(username, password, &path).await
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Content key → blob sub-key, in one call.
    pub async fn blob_key(
        &self,
        username: &str,
        password: &SecretString,
    ) -> LockboxResult<DerivedKey> {
        let content = self.get_or_create_key(username, password).await?;
        Ok(derive_blob_key(&content)?)
    }

    /// Content key → index sub-key, in one call.
    pub async fn index_key(
        &self,
        username: &str,
        password: &SecretString,
    ) -> LockboxResult<DerivedKey> {
        let content = self.get_or_create_key(username, password).await?;
        Ok(derive_index_key(&content)?)
    }

    async fn create_keystore(
        &self,
        username: &str,
        password: &SecretString,
        path: &Path,
    ) -> LockboxResult<ContentKey> {
        let key = generate_content_key();
        let mut salt = [0u8; SALT_SIZE];
        rand::thread_rng().fill_bytes(&mut salt);

        let params = self.params.clone();
        let owner = username.to_string();
        let pw = SecretString::from(password.expose_secret());
        let key_for_wrap = key.clone();
        let wrapped = tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<u8>> {
            let wrapping = derive_password_key(&pw, &salt, &params)?;
            wrap_key(&wrapping, &key_for_wrap, owner.as_bytes())
        })
        .await
        .map_err(|e| anyhow::anyhow!("keystore KDF task failed: {e}"))??;

        let record = KeystoreFile {
            version: KEYSTORE_VERSION,
            kdf: self.params.clone(),
            salt: BASE64.encode(salt),
            wrapped_key: BASE64.encode(&wrapped),
        };
        let json = serde_json::to_vec_pretty(&record)
            .map_err(|e| LockboxError::crypto(format!("serializing keystore: {e}")))?;

        tokio::fs::create_dir_all(&self.secrets_root).await?;
        let tmp_path = self
            .secrets_root
            .join(format!(".{username}.keystore.{}.tmp", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp_path, &json).await?;

        // hard_link fails if the target exists, unlike rename
        let linked = tokio::fs::hard_link(&tmp_path, path).await;
        let _ = tokio::fs::remove_file(&tmp_path).await;

        match linked {
            Ok(()) => {
                info!(user = %username, "created keystore");
                Ok(key)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                debug!(user = %username, "lost keystore creation race, opening winner's");
                let bytes = tokio::fs::read(path).await?;
                open_keystore(username, password, bytes).await
            }
            Err(e) => Err(e.into()),
        }
    }
}

async fn open_keystore(
    username: &str,
    password: &SecretString,
    bytes: Vec<u8>,
) -> LockboxResult<ContentKey> {
    let record: KeystoreFile = serde_json::from_slice(&bytes)
        .map_err(|e| LockboxError::crypto(format!("unreadable keystore: {e}")))?;
    if record.version != KEYSTORE_VERSION {
        return Err(LockboxError::crypto(format!(
            "unsupported keystore version {}",
            record.version
        )));
    }

    let salt: [u8; SALT_SIZE] = BASE64
        .decode(&record.salt)
        .ok()
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| LockboxError::crypto("keystore salt is malformed"))?;
    let wrapped = BASE64
        .decode(&record.wrapped_key)
        .map_err(|e| LockboxError::crypto(format!("keystore key is malformed: {e}")))?;

    let owner = username.to_string();
    let pw = SecretString::from(password.expose_secret());
    tokio::task::spawn_blocking(move || {
        let wrapping = derive_password_key(&pw, &salt, &record.kdf)
            .map_err(|e| LockboxError::crypto(e.to_string()))?;
        unwrap_key(&wrapping, &wrapped, owner.as_bytes()).map_err(|e| match e {
            UnwrapError::Rejected => LockboxError::BadPassword,
            UnwrapError::Malformed(msg) => LockboxError::CryptoFailure(msg),
        })
    })
    .await
    .map_err(|e| anyhow::anyhow!("keystore KDF task failed: {e}"))?
}
