//! Resource record storage.
//!
//! [`MetadataStore`] is the seam to whatever document store holds resource
//! records. [`JsonMetadataStore`] keeps everything in memory and, when given
//! a path, persists it as one JSON file flushed atomically via temp+rename.
//! Records carry names and structure only; content lives in the blob store.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::Context;
use lockbox_core::{LockboxError, LockboxResult, ResourceId, ResourceRecord};
use tracing::{debug, warn};

pub trait MetadataStore: Send + Sync {
    /// The owner's root folder, if it has been created.
    fn root(&self, owner: &str) -> LockboxResult<Option<ResourceRecord>>;

    fn get(&self, id: ResourceId) -> LockboxResult<Option<ResourceRecord>>;

    fn child(&self, parent: ResourceId, name: &str) -> LockboxResult<Option<ResourceRecord>>;

    /// Children ordered by name.
    fn children(&self, parent: ResourceId) -> LockboxResult<Vec<ResourceRecord>>;

    /// Fails with `ResourceAlreadyExists` if the parent already has a child
    /// of that name (or, for a root, the owner already has a root).
    fn insert(&self, record: ResourceRecord) -> LockboxResult<()>;

    /// Replace a record by id. Renames and re-parenting are allowed; a
    /// name clash under the new parent is `ResourceAlreadyExists`.
    fn update(&self, record: ResourceRecord) -> LockboxResult<()>;

    /// Remove one record. Children must have been removed first.
    fn remove(&self, id: ResourceId) -> LockboxResult<Option<ResourceRecord>>;

    /// Persist pending changes.
    fn flush(&self) -> LockboxResult<()>;
}

#[derive(Debug, Default)]
struct Records {
    by_id: HashMap<ResourceId, ResourceRecord>,
    roots: HashMap<String, ResourceId>,
    /// parent → (name → child)
    children: HashMap<ResourceId, BTreeMap<String, ResourceId>>,
    dirty: bool,
}

impl Records {
    fn link(&mut self, record: &ResourceRecord) {
        match record.parent {
            Some(parent) => {
                self.children
                    .entry(parent)
                    .or_default()
                    .insert(record.name.clone(), record.id);
            }
            None => {
                self.roots.insert(record.owner.clone(), record.id);
            }
        }
    }

    fn unlink(&mut self, record: &ResourceRecord) {
        match record.parent {
            Some(parent) => {
                if let Some(siblings) = self.children.get_mut(&parent) {
                    siblings.remove(&record.name);
                }
            }
            None => {
                self.roots.remove(&record.owner);
            }
        }
    }

    fn slot_taken(&self, record: &ResourceRecord) -> bool {
        let holder = match record.parent {
            Some(parent) => self
                .children
                .get(&parent)
                .and_then(|siblings| siblings.get(&record.name)),
            None => self.roots.get(&record.owner),
        };
        holder.is_some_and(|id| *id != record.id)
    }
}

/// In-memory record store with optional JSON persistence.
pub struct JsonMetadataStore {
    path: Option<PathBuf>,
    records: RwLock<Records>,
}

impl JsonMetadataStore {
    /// A store that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            records: RwLock::new(Records::default()),
        }
    }

    /// Load from `path`, or start empty if it does not exist yet.
    pub fn open(path: &Path) -> LockboxResult<Self> {
        let mut records = Records::default();
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading metadata: {}", path.display()))?;
            let list: Vec<ResourceRecord> = serde_json::from_str(&content)
                .with_context(|| format!("parsing metadata: {}", path.display()))?;
            for record in list {
                records.link(&record);
                records.by_id.insert(record.id, record);
            }
            debug!(path = %path.display(), records = records.by_id.len(), "metadata loaded");
        }
        Ok(Self {
            path: Some(path.to_path_buf()),
            records: RwLock::new(records),
        })
    }

    pub fn len(&self) -> usize {
        self.read().map(|r| r.by_id.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> LockboxResult<RwLockReadGuard<'_, Records>> {
        self.records
            .read()
            .map_err(|_| anyhow::anyhow!("metadata lock poisoned").into())
    }

    fn write(&self) -> LockboxResult<RwLockWriteGuard<'_, Records>> {
        self.records
            .write()
            .map_err(|_| anyhow::anyhow!("metadata lock poisoned").into())
    }
}

impl MetadataStore for JsonMetadataStore {
    fn root(&self, owner: &str) -> LockboxResult<Option<ResourceRecord>> {
        let records = self.read()?;
        Ok(records
            .roots
            .get(owner)
            .and_then(|id| records.by_id.get(id))
            .cloned())
    }

    fn get(&self, id: ResourceId) -> LockboxResult<Option<ResourceRecord>> {
        Ok(self.read()?.by_id.get(&id).cloned())
    }

    fn child(&self, parent: ResourceId, name: &str) -> LockboxResult<Option<ResourceRecord>> {
        let records = self.read()?;
        Ok(records
            .children
            .get(&parent)
            .and_then(|siblings| siblings.get(name))
            .and_then(|id| records.by_id.get(id))
            .cloned())
    }

    fn children(&self, parent: ResourceId) -> LockboxResult<Vec<ResourceRecord>> {
        let records = self.read()?;
        Ok(records
            .children
            .get(&parent)
            .map(|siblings| {
                siblings
                    .values()
                    .filter_map(|id| records.by_id.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    fn insert(&self, record: ResourceRecord) -> LockboxResult<()> {
        let mut records = self.write()?;
        if records.by_id.contains_key(&record.id) || records.slot_taken(&record) {
            return Err(LockboxError::ResourceAlreadyExists(record.name));
        }
        if let Some(parent) = record.parent {
            if !records.by_id.contains_key(&parent) {
                return Err(LockboxError::ResourceNotFound(parent.to_string()));
            }
        }
        records.link(&record);
        records.by_id.insert(record.id, record);
        records.dirty = true;
        Ok(())
    }

    fn update(&self, record: ResourceRecord) -> LockboxResult<()> {
        let mut records = self.write()?;
        let previous = records
            .by_id
            .get(&record.id)
            .cloned()
            .ok_or_else(|| LockboxError::ResourceNotFound(record.id.to_string()))?;
        if records.slot_taken(&record) {
            return Err(LockboxError::ResourceAlreadyExists(record.name));
        }
        records.unlink(&previous);
        records.link(&record);
        records.by_id.insert(record.id, record);
        records.dirty = true;
        Ok(())
    }

    fn remove(&self, id: ResourceId) -> LockboxResult<Option<ResourceRecord>> {
        let mut records = self.write()?;
        let Some(record) = records.by_id.remove(&id) else {
            return Ok(None);
        };
        records.unlink(&record);
        records.children.remove(&id);
        records.dirty = true;
        Ok(Some(record))
    }

    fn flush(&self) -> LockboxResult<()> {
        let mut records = self.write()?;
        if !records.dirty {
            return Ok(());
        }
        let Some(path) = &self.path else {
            records.dirty = false;
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating metadata dir: {}", parent.display()))?;
        }

        let mut list: Vec<&ResourceRecord> = records.by_id.values().collect();
        list.sort_by_key(|r| (r.created, r.id));
        let json = serde_json::to_string_pretty(&list).context("serializing metadata")?;

        // Atomic write: write to temp file, then rename
        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, &json)
            .with_context(|| format!("writing metadata temp: {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("renaming metadata: {}", path.display()))?;

        records.dirty = false;
        Ok(())
    }
}

impl Drop for JsonMetadataStore {
    fn drop(&mut self) {
        let dirty = self.records.get_mut().map(|r| r.dirty).unwrap_or(false);
        if dirty && self.path.is_some() {
            warn!("metadata store dropped with unflushed changes");
        }
    }
}
