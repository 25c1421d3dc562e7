//! The facade a protocol front end (WebDAV, REST, the CLI) talks to.
//!
//! Every content-touching call takes the caller's password; nothing keyed
//! is kept between calls.

use std::sync::Arc;

use lockbox_core::config::{LockboxConfig, StorageConfig};
use lockbox_core::{Content, LockboxError, LockboxResult, ResourceId, ResourceKind, ResourceRecord};
use lockbox_crypto::{derive_blob_key, derive_index_key, KdfParams, KeyVault};
use lockbox_search::{BuiltinClassifier, BuiltinExtractor, ContentClassifier, TextExtractor};
use lockbox_storage::{reader_from_bytes, BlobReader, BlobStore};
use secrecy::SecretString;
use tokio::io::AsyncRead;
use tracing::{debug, info, warn};

use crate::indexer::{IndexJob, IndexStats, Indexer};
use crate::metadata::{JsonMetadataStore, MetadataStore};
use crate::pipeline::IngestPipeline;
use crate::tree::ResourceTree;

pub struct Vault {
    keys: KeyVault,
    blobs: BlobStore,
    tree: Arc<ResourceTree>,
    indexer: Indexer,
    pipeline: IngestPipeline,
    result_limit: usize,
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vault")
            .field("blobs", &self.blobs)
            .field("indexer", &self.indexer)
            .finish_non_exhaustive()
    }
}

impl Vault {
    /// Open the vault described by `config`, with the JSON metadata store
    /// and the built-in classifier and extractor.
    pub fn open(config: &LockboxConfig) -> LockboxResult<Self> {
        let storage = config.storage.expanded();
        let store = JsonMetadataStore::open(&storage.metadata_path)?;
        Ok(Self::with_components(
            config,
            Arc::new(store),
            Arc::new(BuiltinClassifier),
            Arc::new(BuiltinExtractor),
        ))
    }

    pub fn with_components(
        config: &LockboxConfig,
        store: Arc<dyn MetadataStore>,
        classifier: Arc<dyn ContentClassifier>,
        extractor: Arc<dyn TextExtractor>,
    ) -> Self {
        let StorageConfig {
            storage_root,
            secrets_root,
            index_root,
            ..
        } = config.storage.expanded();

        let keys = KeyVault::new(secrets_root, KdfParams::from(&config.crypto));
        let blobs = BlobStore::new(storage_root, keys.clone());
        let tree = Arc::new(ResourceTree::new(store));
        let indexer = Indexer::new(
            blobs.clone(),
            index_root,
            Arc::clone(&tree),
            extractor,
            config.index.clone(),
        );
        let pipeline = IngestPipeline::new(
            keys.clone(),
            blobs.clone(),
            Arc::clone(&tree),
            indexer.clone(),
            classifier,
            config.ingest.clone(),
        );
        Self {
            keys,
            blobs,
            tree,
            indexer,
            pipeline,
            result_limit: config.index.result_limit,
        }
    }

    pub fn get_root_folder(&self, user: &str) -> LockboxResult<ResourceRecord> {
        self.tree.root(user)
    }

    /// Children of a folder, by name. Files have none.
    pub fn get_children(&self, resource: &ResourceRecord) -> LockboxResult<Vec<ResourceRecord>> {
        self.tree.children(resource)
    }

    pub fn get_resource(&self, user: &str, path: &str) -> LockboxResult<ResourceRecord> {
        self.tree.resolve(user, path)
    }

    pub fn get_resource_by_id(&self, id: ResourceId) -> LockboxResult<ResourceRecord> {
        self.tree.get(id)
    }

    pub fn get_parent(&self, resource: &ResourceRecord) -> LockboxResult<Option<ResourceRecord>> {
        self.tree.parent(resource)
    }

    pub fn mkdir(&self, user: &str, path: &str) -> LockboxResult<ResourceRecord> {
        self.tree.mkdir(user, path)
    }

    /// Store a file. See [`IngestPipeline::upload`].
    pub async fn put<R>(
        &self,
        user: &str,
        path: &str,
        reader: R,
        length: Option<u64>,
        content_type: Option<&str>,
        password: &SecretString,
    ) -> LockboxResult<ResourceRecord>
    where
        R: AsyncRead + Unpin,
    {
        self.pipeline
            .upload(user, path, reader, length, content_type, password)
            .await
    }

    /// Stream a file's plaintext.
    pub async fn get(
        &self,
        user: &str,
        resource: &ResourceRecord,
        password: &SecretString,
    ) -> LockboxResult<BlobReader> {
        let record = self.owned(user, resource.id)?;
        match record.kind {
            ResourceKind::Folder => Err(LockboxError::InvalidName(format!(
                "{} is a folder",
                record.name
            ))),
            ResourceKind::File {
                content: Content::Blob(path),
                ..
            } => self.blobs.read(user, password, &path).await,
            ResourceKind::File {
                content: Content::Inline(bytes),
                ..
            } => {
                // inline content is plaintext in the record; still gate it on the password
                self.keys.get_or_create_key(user, password).await?;
                Ok(reader_from_bytes(bytes))
            }
        }
    }

    /// Move or rename a resource. A renamed file is queued for re-indexing,
    /// since its name is one of its indexed fields.
    pub async fn move_resource(
        &self,
        user: &str,
        password: &SecretString,
        resource: &ResourceRecord,
        dest_path: &str,
    ) -> LockboxResult<ResourceRecord> {
        let record = self.owned(user, resource.id)?;
        let content_key = self.keys.get_or_create_key(user, password).await?;
        let blob_key = derive_blob_key(&content_key)?;
        let index_key = derive_index_key(&content_key)?;
        drop(content_key);

        let moved = self.tree.move_resource(user, record.id, dest_path)?;
        if let ResourceKind::File {
            content,
            content_type,
            ..
        } = &moved.kind
        {
            if moved.name != record.name {
                let job = IndexJob::Upsert {
                    id: moved.id,
                    content: content.clone(),
                    content_type: content_type.clone(),
                    blob_key,
                    index_key,
                };
                if let Err(e) = self.indexer.submit(user, job) {
                    warn!(user = %user, resource = %moved.name, "could not queue re-indexing: {e}");
                }
            }
        }
        info!(user = %user, dest = %dest_path, "moved");
        Ok(moved)
    }

    /// Delete a resource (recursively for folders), its blobs and its
    /// index entries.
    pub async fn delete(
        &self,
        user: &str,
        password: &SecretString,
        resource: &ResourceRecord,
    ) -> LockboxResult<()> {
        let record = self.owned(user, resource.id)?;
        // check the password before touching anything
        let index_key = self.keys.index_key(user, password).await?;

        let removed = self.tree.delete(record.id)?;
        for file in &removed {
            if let Some(blob) = file.blob_path() {
                if let Err(e) = self.blobs.remove(blob).await {
                    warn!(blob = %blob, "failed to remove blob of deleted file: {e}");
                }
            }
        }

        info!(user = %user, resource = %record.name, files = removed.len(), "deleted");
        if removed.is_empty() {
            return Ok(());
        }
        let ids = removed.iter().map(|r| r.id).collect();
        if let Err(e) = self.indexer.submit(user, IndexJob::Remove { ids, index_key }) {
            warn!(user = %user, "could not queue index removal: {e}");
        }
        Ok(())
    }

    /// Ids of the user's files matching `query`, best first, at most the
    /// configured result limit.
    pub async fn search(
        &self,
        user: &str,
        password: &SecretString,
        query: &str,
    ) -> LockboxResult<Vec<ResourceId>> {
        let index_key = self.keys.index_key(user, password).await?;
        let hits = self
            .indexer
            .search(user, index_key, query, self.result_limit)
            .await?;

        // a removal may still be queued behind the query
        let live: Vec<ResourceId> = hits
            .into_iter()
            .filter(|id| self.owned(user, *id).is_ok())
            .collect();
        debug!(user = %user, hits = live.len(), "search");
        Ok(live)
    }

    /// [`search`](Self::search), rendered as paths from the user's root.
    pub async fn search_paths(
        &self,
        user: &str,
        password: &SecretString,
        query: &str,
    ) -> LockboxResult<Vec<String>> {
        let ids = self.search(user, password, query).await?;
        ids.into_iter().map(|id| self.tree.path_of(id)).collect()
    }

    /// Resolves once every index job queued so far has been applied.
    pub async fn wait_for_indexing(&self) {
        self.indexer.wait_idle().await;
    }

    pub fn index_stats(&self) -> IndexStats {
        self.indexer.stats()
    }

    /// Drain and stop the indexing workers.
    pub async fn shutdown(&self) {
        self.indexer.shutdown().await;
    }

    /// The current record for `id`, provided `user` owns it. Other users'
    /// resources are reported as missing.
    fn owned(&self, user: &str, id: ResourceId) -> LockboxResult<ResourceRecord> {
        let record = self.tree.get(id)?;
        if record.owner != user {
            return Err(LockboxError::ResourceNotFound(id.to_string()));
        }
        Ok(record)
    }
}
