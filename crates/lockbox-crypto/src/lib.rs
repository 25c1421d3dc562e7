//! lockbox-crypto: at-rest encryption for lockbox
//!
//! Key hierarchy:
//! ```text
//! Password
//!   └── Password Key (256-bit, Argon2id, salt + params stored in the keystore)
//!         └── wraps Content Key (256-bit random, one per user, XChaCha20-Poly1305, AAD=username)
//!               ├── Blob Key  (HKDF-SHA256, domain="lockbox-blob")  → blob frames
//!               └── Index Key (HKDF-SHA256, domain="lockbox-index") → index segments
//! ```
//!
//! Nothing here is cached: callers re-open the keystore with the password for
//! every operation and drop the key when the operation ends.

pub mod frame;
pub mod kdf;
pub mod keys;
pub mod keystore;

pub use frame::{open, seal, SEAL_OVERHEAD};
pub use kdf::{derive_password_key, KdfParams, PasswordKey};
pub use keys::{derive_blob_key, derive_index_key, generate_content_key, ContentKey, DerivedKey};
pub use keystore::KeyVault;

/// Size of every symmetric key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of an XChaCha20-Poly1305 nonce (192-bit)
pub const NONCE_SIZE: usize = 24;

/// Size of a Poly1305 authentication tag
pub const TAG_SIZE: usize = 16;

/// Size of the Argon2id salt stored in a keystore
pub const SALT_SIZE: usize = 16;
