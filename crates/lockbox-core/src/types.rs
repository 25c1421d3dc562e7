use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Opaque resource identifier (UUIDv4, rendered as 32 hex chars)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(Uuid);

impl ResourceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Option<Self> {
        Uuid::try_parse(s).ok().map(Self)
    }
}

impl Default for ResourceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Microseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        Self(micros)
    }

    /// The current time, but strictly after `self`.
    ///
    /// Modification times must advance on every touch even when two
    /// operations land in the same clock tick.
    pub fn advance(self) -> Self {
        Self::now().max(Self(self.0 + 1))
    }

    pub fn as_micros(&self) -> u64 {
        self.0
    }
}

/// Location of one blob's ciphertext, relative to the storage root:
/// `<username>/<token[0..2]>/<token>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobPath(String);

impl BlobPath {
    /// Build the sharded path for a fresh random token.
    pub fn for_token(username: &str, token: &str) -> Self {
        let shard = token.get(..2).unwrap_or("xx");
        Self(format!("{username}/{shard}/{token}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Owner component of the path.
    pub fn owner(&self) -> &str {
        self.0.split('/').next().unwrap_or_default()
    }

    /// Random token (the file name of the ciphertext).
    pub fn token(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or_default()
    }
}

impl fmt::Display for BlobPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a file's bytes live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Content {
    /// Encrypted blob in the blob store
    Blob(BlobPath),
    /// Small content kept directly in the record (imported data only;
    /// uploads always go through the blob store)
    Inline(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResourceKind {
    Folder,
    File {
        content_type: String,
        length: u64,
        content: Content,
        /// Set once the background indexer has published this file
        #[serde(default)]
        indexed: bool,
    },
}

/// A node in a user's namespace.
///
/// Parent links are ids into the metadata store, never references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub id: ResourceId,
    pub owner: String,
    pub name: String,
    /// `None` only for the user's root folder
    pub parent: Option<ResourceId>,
    pub created: Timestamp,
    pub modified: Timestamp,
    pub kind: ResourceKind,
}

impl ResourceRecord {
    pub fn new_root(owner: &str) -> Self {
        let now = Timestamp::now();
        Self {
            id: ResourceId::new(),
            owner: owner.to_string(),
            name: owner.to_string(),
            parent: None,
            created: now,
            modified: now,
            kind: ResourceKind::Folder,
        }
    }

    pub fn new_child(owner: &str, parent: ResourceId, name: &str, kind: ResourceKind) -> Self {
        let now = Timestamp::now();
        Self {
            id: ResourceId::new(),
            owner: owner.to_string(),
            name: name.to_string(),
            parent: Some(parent),
            created: now,
            modified: now,
            kind,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn is_folder(&self) -> bool {
        matches!(self.kind, ResourceKind::Folder)
    }

    pub fn content_type(&self) -> Option<&str> {
        match &self.kind {
            ResourceKind::File { content_type, .. } => Some(content_type),
            ResourceKind::Folder => None,
        }
    }

    pub fn content_length(&self) -> Option<u64> {
        match &self.kind {
            ResourceKind::File { length, .. } => Some(*length),
            ResourceKind::Folder => None,
        }
    }

    pub fn blob_path(&self) -> Option<&BlobPath> {
        match &self.kind {
            ResourceKind::File {
                content: Content::Blob(path),
                ..
            } => Some(path),
            _ => None,
        }
    }

    pub fn is_indexed(&self) -> bool {
        matches!(self.kind, ResourceKind::File { indexed: true, .. })
    }

    pub fn touch(&mut self) {
        self.modified = self.modified.advance();
    }
}
