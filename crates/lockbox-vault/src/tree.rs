//! Per-user namespace: path resolution and mutations over a [`MetadataStore`].
//!
//! Paths are `/`-separated; empty and `.` segments are ignored, so `"/"`,
//! `""` and `"./"` all name the user's root folder. Every mutation touches
//! the affected parent folders and flushes the store before returning.

use std::sync::{Arc, Mutex, MutexGuard};

use lockbox_core::{
    validate_component, Content, LockboxError, LockboxResult, ResourceId, ResourceKind,
    ResourceRecord,
};
use tracing::{debug, info};

use crate::metadata::MetadataStore;

/// Outcome of writing a file record.
#[derive(Debug, Clone)]
pub struct PutOutcome {
    pub record: ResourceRecord,
    /// The record's previous state when an existing file was overwritten
    pub replaced: Option<ResourceRecord>,
}

pub struct ResourceTree {
    store: Arc<dyn MetadataStore>,
    /// Serializes check-then-write sequences
    mutations: Mutex<()>,
}

impl ResourceTree {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self {
            store,
            mutations: Mutex::new(()),
        }
    }

    fn lock(&self) -> LockboxResult<MutexGuard<'_, ()>> {
        self.mutations
            .lock()
            .map_err(|_| anyhow::anyhow!("resource tree lock poisoned").into())
    }

    /// The user's root folder, created on first use.
    pub fn root(&self, owner: &str) -> LockboxResult<ResourceRecord> {
        if let Some(root) = self.store.root(owner)? {
            return Ok(root);
        }
        let _guard = self.lock()?;
        self.ensure_root(owner)
    }

    /// Caller holds the mutation lock.
    fn ensure_root(&self, owner: &str) -> LockboxResult<ResourceRecord> {
        if let Some(root) = self.store.root(owner)? {
            return Ok(root);
        }
        validate_component(owner)?;
        let root = ResourceRecord::new_root(owner);
        self.store.insert(root.clone())?;
        self.store.flush()?;
        info!(user = %owner, "created root folder");
        Ok(root)
    }

    pub fn get(&self, id: ResourceId) -> LockboxResult<ResourceRecord> {
        self.store
            .get(id)?
            .ok_or_else(|| LockboxError::ResourceNotFound(id.to_string()))
    }

    pub fn children(&self, record: &ResourceRecord) -> LockboxResult<Vec<ResourceRecord>> {
        if !record.is_folder() {
            return Ok(Vec::new());
        }
        self.store.children(record.id)
    }

    pub fn parent(&self, record: &ResourceRecord) -> LockboxResult<Option<ResourceRecord>> {
        match record.parent {
            Some(parent) => self.store.get(parent),
            None => Ok(None),
        }
    }

    /// Walk `path` from the owner's root.
    pub fn resolve(&self, owner: &str, path: &str) -> LockboxResult<ResourceRecord> {
        let root = self.root(owner)?;
        self.walk(root, path)
    }

    fn walk(&self, root: ResourceRecord, path: &str) -> LockboxResult<ResourceRecord> {
        let mut current = root;
        for segment in segments(path) {
            current = self
                .store
                .child(current.id, segment)?
                .ok_or_else(|| LockboxError::ResourceNotFound(path.to_string()))?;
        }
        Ok(current)
    }

    /// `/a/b/c` for a record, `/` for a root.
    pub fn path_of(&self, id: ResourceId) -> LockboxResult<String> {
        let mut names = Vec::new();
        let mut current = self.get(id)?;
        while let Some(parent) = current.parent {
            names.push(current.name);
            current = self.get(parent)?;
        }
        names.reverse();
        Ok(format!("/{}", names.join("/")))
    }

    pub fn mkdir(&self, owner: &str, path: &str) -> LockboxResult<ResourceRecord> {
        let (parent_path, name) = split_last(path)?;
        let _guard = self.lock()?;
        let mut parent = self.folder_at(owner, parent_path)?;
        if self.store.child(parent.id, name)?.is_some() {
            return Err(LockboxError::ResourceAlreadyExists(path.to_string()));
        }

        let folder = ResourceRecord::new_child(owner, parent.id, name, ResourceKind::Folder);
        self.store.insert(folder.clone())?;
        parent.touch();
        self.store.update(parent)?;
        self.store.flush()?;
        debug!(user = %owner, path = %path, "mkdir");
        Ok(folder)
    }

    /// Check that `path` could be written as a file: its parent folder exists
    /// and it does not name a folder.
    pub fn check_put(&self, owner: &str, path: &str) -> LockboxResult<()> {
        let (parent_path, name) = split_last(path)?;
        let _guard = self.lock()?;
        let parent = self.folder_at(owner, parent_path)?;
        match self.store.child(parent.id, name)? {
            Some(existing) if existing.is_folder() => {
                Err(LockboxError::ResourceAlreadyExists(path.to_string()))
            }
            _ => Ok(()),
        }
    }

    /// Create the file at `path`, or overwrite the existing file there.
    pub fn put_file(
        &self,
        owner: &str,
        path: &str,
        content_type: &str,
        length: u64,
        content: Content,
    ) -> LockboxResult<PutOutcome> {
        let (parent_path, name) = split_last(path)?;
        let kind = ResourceKind::File {
            content_type: content_type.to_string(),
            length,
            content,
            indexed: false,
        };

        let _guard = self.lock()?;
        let mut parent = self.folder_at(owner, parent_path)?;
        let outcome = match self.store.child(parent.id, name)? {
            Some(existing) if existing.is_folder() => {
                return Err(LockboxError::ResourceAlreadyExists(path.to_string()));
            }
            Some(existing) => {
                let mut record = existing.clone();
                record.kind = kind;
                record.touch();
                self.store.update(record.clone())?;
                PutOutcome {
                    record,
                    replaced: Some(existing),
                }
            }
            None => {
                let record = ResourceRecord::new_child(owner, parent.id, name, kind);
                self.store.insert(record.clone())?;
                PutOutcome {
                    record,
                    replaced: None,
                }
            }
        };
        parent.touch();
        self.store.update(parent)?;
        self.store.flush()?;
        Ok(outcome)
    }

    /// Move (and possibly rename) a resource to `dest_path`.
    pub fn move_resource(
        &self,
        owner: &str,
        id: ResourceId,
        dest_path: &str,
    ) -> LockboxResult<ResourceRecord> {
        let (dest_parent_path, dest_name) = split_last(dest_path)?;

        let _guard = self.lock()?;
        let mut record = self.get(id)?;
        let Some(old_parent_id) = record.parent else {
            return Err(LockboxError::InvalidName("cannot move the root folder".into()));
        };
        let mut new_parent = self.folder_at(owner, dest_parent_path)?;
        if self.store.child(new_parent.id, dest_name)?.is_some() {
            return Err(LockboxError::ResourceAlreadyExists(dest_path.to_string()));
        }
        if record.is_folder() && self.is_within(new_parent.id, record.id)? {
            return Err(LockboxError::InvalidName(format!(
                "cannot move {} into itself",
                record.name
            )));
        }

        record.parent = Some(new_parent.id);
        record.name = dest_name.to_string();
        record.touch();
        self.store.update(record.clone())?;

        if old_parent_id != new_parent.id {
            let mut old_parent = self.get(old_parent_id)?;
            old_parent.touch();
            self.store.update(old_parent)?;
        }
        new_parent.touch();
        self.store.update(new_parent)?;
        self.store.flush()?;
        debug!(user = %owner, dest = %dest_path, "moved resource");
        Ok(record)
    }

    /// Remove a resource and, for folders, everything below it (post-order).
    ///
    /// Returns every removed file so callers can drop blobs and index entries.
    pub fn delete(&self, id: ResourceId) -> LockboxResult<Vec<ResourceRecord>> {
        let _guard = self.lock()?;
        let record = self.get(id)?;
        let Some(parent_id) = record.parent else {
            return Err(LockboxError::InvalidName("cannot delete the root folder".into()));
        };

        let mut removed_files = Vec::new();
        self.remove_subtree(record, &mut removed_files)?;

        let mut parent = self.get(parent_id)?;
        parent.touch();
        self.store.update(parent)?;
        self.store.flush()?;
        Ok(removed_files)
    }

    /// Set a file's `indexed` flag, provided its content is still `content`
    /// (an overwrite in the meantime makes the flag stale).
    pub fn mark_indexed(&self, id: ResourceId, content: &Content) -> LockboxResult<bool> {
        let _guard = self.lock()?;
        let Some(mut record) = self.store.get(id)? else {
            return Ok(false);
        };
        match &mut record.kind {
            ResourceKind::File {
                content: current,
                indexed,
                ..
            } if current == content => {
                *indexed = true;
            }
            _ => return Ok(false),
        }
        self.store.update(record)?;
        self.store.flush()?;
        Ok(true)
    }

    fn remove_subtree(
        &self,
        record: ResourceRecord,
        removed_files: &mut Vec<ResourceRecord>,
    ) -> LockboxResult<()> {
        for child in self.store.children(record.id)? {
            self.remove_subtree(child, removed_files)?;
        }
        self.store.remove(record.id)?;
        if !record.is_folder() {
            removed_files.push(record);
        }
        Ok(())
    }

    /// Caller holds the mutation lock.
    fn folder_at(&self, owner: &str, path: &str) -> LockboxResult<ResourceRecord> {
        let root = self.ensure_root(owner)?;
        let folder = self.walk(root, path)?;
        if !folder.is_folder() {
            return Err(LockboxError::ResourceNotFound(format!(
                "{path} is not a folder"
            )));
        }
        Ok(folder)
    }

    /// Whether `id` is `ancestor` or lies below it.
    fn is_within(&self, id: ResourceId, ancestor: ResourceId) -> LockboxResult<bool> {
        let mut current = Some(id);
        while let Some(cur) = current {
            if cur == ancestor {
                return Ok(true);
            }
            current = self.get(cur)?.parent;
        }
        Ok(false)
    }
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty() && *s != ".")
}

/// Split into (parent path, final name). The final name must be a valid
/// component; a path with no components names the root and cannot be created.
fn split_last(path: &str) -> LockboxResult<(&str, &str)> {
    let trimmed = path.trim_end_matches('/');
    let (parent, name) = match trimmed.rfind('/') {
        Some(idx) => (&trimmed[..idx], &trimmed[idx + 1..]),
        None => ("", trimmed),
    };
    if name == "." || segments(name).next().is_none() {
        return Err(LockboxError::InvalidName(path.to_string()));
    }
    validate_component(name)?;
    Ok((parent, name))
}
