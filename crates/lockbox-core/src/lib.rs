//! lockbox-core: types shared by every lockbox crate
//!
//! - [`config`]: the `lockbox.toml` schema
//! - [`error`]: the error taxonomy surfaced to the protocol layer
//! - [`types`]: resource records, ids, blob locations

pub mod config;
pub mod error;
pub mod types;

pub use error::{LockboxError, LockboxResult};
pub use types::{BlobPath, Content, ResourceId, ResourceKind, ResourceRecord, Timestamp};

/// Reject anything that is not a single, non-traversing path component.
///
/// Usernames and segment names end up as file names under the configured
/// roots, so they must never contain separators or `..`.
pub fn validate_component(name: &str) -> LockboxResult<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
    {
        return Err(LockboxError::InvalidName(name.to_string()));
    }
    Ok(())
}
