//! Background indexing: one supervised worker task per user.
//!
//! Jobs for a user are applied strictly in submission order. Each job holds
//! the user's index lock (write side) for its whole open-mutate-commit;
//! searches take the read side. The lock guard is moved into the blocking
//! tantivy work, so a job that outlives its timeout keeps other writers out
//! until it actually finishes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use lockbox_core::config::IndexConfig;
use lockbox_core::{Content, LockboxError, LockboxResult, ResourceId, ResourceKind, ResourceRecord};
use lockbox_crypto::DerivedKey;
use lockbox_search::{SearchIndex, TextExtractor};
use lockbox_storage::{BlobStore, CipherDirectory};
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::pipeline::UploadState;
use crate::tree::ResourceTree;

/// tantivy's commit point; an index directory without it holds no index yet.
const INDEX_META: &str = "meta.json";

/// Work for a user's indexing worker.
///
/// Keys are derived once by the request that queued the job and dropped
/// (zeroized) when the job is done.
#[derive(Debug)]
pub enum IndexJob {
    /// (Re)index one file: drop any previous document, add the new one.
    /// The file's name is read from the tree when the job runs; a job whose
    /// `content` has since been replaced or deleted is skipped.
    Upsert {
        id: ResourceId,
        content: Content,
        content_type: String,
        blob_key: DerivedKey,
        index_key: DerivedKey,
    },
    /// Drop the documents of removed files.
    Remove {
        ids: Vec<ResourceId>,
        index_key: DerivedKey,
    },
    /// Resolves once every job queued before it has run.
    Barrier(oneshot::Sender<()>),
}

/// Counters since startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexStats {
    pub indexed: u64,
    pub removed: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    indexed: AtomicU64,
    removed: AtomicU64,
    failed: AtomicU64,
}

/// What a worker needs to run jobs.
struct WorkerContext {
    blobs: BlobStore,
    index_root: PathBuf,
    tree: Arc<ResourceTree>,
    extractor: Arc<dyn TextExtractor>,
    config: IndexConfig,
    locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,
    counters: Counters,
}

struct Worker {
    tx: mpsc::UnboundedSender<IndexJob>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Workers {
    by_user: HashMap<String, Worker>,
    closed: bool,
}

#[derive(Clone)]
pub struct Indexer {
    ctx: Arc<WorkerContext>,
    workers: Arc<Mutex<Workers>>,
}

impl std::fmt::Debug for Indexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Indexer")
            .field("index_root", &self.ctx.index_root)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> LockboxResult<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| anyhow::anyhow!("indexer state poisoned").into())
}

impl Indexer {
    pub fn new(
        blobs: BlobStore,
        index_root: impl Into<PathBuf>,
        tree: Arc<ResourceTree>,
        extractor: Arc<dyn TextExtractor>,
        config: IndexConfig,
    ) -> Self {
        Self {
            ctx: Arc::new(WorkerContext {
                blobs,
                index_root: index_root.into(),
                tree,
                extractor,
                config,
                locks: Mutex::new(HashMap::new()),
                counters: Counters::default(),
            }),
            workers: Arc::new(Mutex::new(Workers::default())),
        }
    }

    /// Queue a job on `user`'s worker, (re)starting the worker if needed.
    pub fn submit(&self, user: &str, job: IndexJob) -> LockboxResult<()> {
        let mut workers = lock(self.workers.as_ref())?;
        if workers.closed {
            return Err(anyhow::anyhow!("indexer is shut down").into());
        }

        let job = match workers.by_user.get(user) {
            Some(worker) => match worker.tx.send(job) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(job)) => {
                    warn!(user = %user, "index worker died, restarting");
                    job
                }
            },
            None => job,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(job)
            .map_err(|_| anyhow::anyhow!("fresh index queue closed"))?;
        let task = tokio::spawn(run_worker(Arc::clone(&self.ctx), user.to_string(), rx));
        workers.by_user.insert(user.to_string(), Worker { tx, task });
        Ok(())
    }

    /// Query `user`'s index. A user with no index yet has no hits.
    pub async fn search(
        &self,
        user: &str,
        index_key: DerivedKey,
        query: &str,
        limit: usize,
    ) -> LockboxResult<Vec<ResourceId>> {
        let guard = self.ctx.lock_for(user)?.read_owned().await;
        let dir = self.ctx.index_root.join(user);
        let writer_memory = self.ctx.config.writer_memory_bytes;
        let query = query.to_string();

        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            let dir = CipherDirectory::open(dir, index_key)?;
            if !dir.exists(INDEX_META) {
                return Ok(Vec::new());
            }
            SearchIndex::open(dir, writer_memory)?.search(&query, limit)
        })
        .await
        .map_err(|e| anyhow::anyhow!("search task failed: {e}"))?
    }

    /// Wait until every job queued before this call has finished.
    pub async fn wait_idle(&self) {
        let barriers: Vec<oneshot::Receiver<()>> = match lock(self.workers.as_ref()) {
            Ok(workers) => workers
                .by_user
                .values()
                .filter_map(|worker| {
                    let (tx, rx) = oneshot::channel();
                    worker.tx.send(IndexJob::Barrier(tx)).ok().map(|_| rx)
                })
                .collect(),
            Err(_) => Vec::new(),
        };
        for barrier in barriers {
            let _ = barrier.await;
        }

        // a timed-out job may still own its user's lock
        let locks: Vec<Arc<RwLock<()>>> = match lock(&self.ctx.locks) {
            Ok(locks) => locks.values().cloned().collect(),
            Err(_) => Vec::new(),
        };
        for user_lock in locks {
            drop(user_lock.write().await);
        }
    }

    /// Close every queue and join every worker. Queued jobs still run.
    pub async fn shutdown(&self) {
        let workers: Vec<(String, Worker)> = match lock(self.workers.as_ref()) {
            Ok(mut workers) => {
                workers.closed = true;
                workers.by_user.drain().collect()
            }
            Err(_) => Vec::new(),
        };
        for (user, Worker { tx, task }) in workers {
            drop(tx);
            if let Err(e) = task.await {
                warn!(user = %user, "index worker ended abnormally: {e}");
            }
        }
        info!(stats = ?self.stats(), "indexer stopped");
    }

    pub fn stats(&self) -> IndexStats {
        let c = &self.ctx.counters;
        IndexStats {
            indexed: c.indexed.load(Ordering::Relaxed),
            removed: c.removed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
        }
    }
}

async fn run_worker(ctx: Arc<WorkerContext>, user: String, mut rx: mpsc::UnboundedReceiver<IndexJob>) {
    debug!(user = %user, "index worker started");
    let timeout = Duration::from_secs(ctx.config.job_timeout_secs);

    while let Some(job) = rx.recv().await {
        match job {
            IndexJob::Barrier(done) => {
                let _ = done.send(());
            }
            IndexJob::Upsert {
                id,
                content,
                content_type,
                blob_key,
                index_key,
            } => {
                let Some(name) = ctx.current_name(id, &content) else {
                    debug!(user = %user, resource = %id, "content replaced before indexing, skipped");
                    continue;
                };
                let job = ctx.upsert(&user, id, &name, &content, content_type, blob_key, index_key);
                let outcome = match tokio::time::timeout(timeout, job).await {
                    Ok(result) => result,
                    Err(_) => Err(LockboxError::index(format!(
                        "timed out after {}s",
                        timeout.as_secs()
                    ))),
                };
                match outcome {
                    Ok(()) => {
                        ctx.counters.indexed.fetch_add(1, Ordering::Relaxed);
                        match ctx.tree.mark_indexed(id, &content) {
                            Ok(true) => {}
                            Ok(false) => debug!(resource = %name, "indexed content was replaced meanwhile"),
                            Err(e) => warn!(resource = %name, "failed to record indexed flag: {e}"),
                        }
                        info!(user = %user, resource = %name, state = ?UploadState::Indexed, "upload indexed");
                    }
                    Err(e) => {
                        ctx.counters.failed.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            user = %user,
                            resource = %name,
                            state = ?UploadState::IndexFailed,
                            "indexing failed: {e}"
                        );
                    }
                }
            }
            IndexJob::Remove { ids, index_key } => {
                let count = ids.len() as u64;
                match tokio::time::timeout(timeout, ctx.remove(&user, ids, index_key)).await {
                    Ok(Ok(())) => {
                        ctx.counters.removed.fetch_add(count, Ordering::Relaxed);
                        debug!(user = %user, count, "index entries removed");
                    }
                    Ok(Err(e)) => {
                        ctx.counters.failed.fetch_add(1, Ordering::Relaxed);
                        warn!(user = %user, count, "index removal failed: {e}");
                    }
                    Err(_) => {
                        ctx.counters.failed.fetch_add(1, Ordering::Relaxed);
                        warn!(user = %user, count, "index removal timed out");
                    }
                }
            }
        }
    }
    debug!(user = %user, "index worker stopped");
}

impl WorkerContext {
    fn lock_for(&self, user: &str) -> LockboxResult<Arc<RwLock<()>>> {
        let mut locks = lock(&self.locks)?;
        Ok(Arc::clone(
            locks
                .entry(user.to_string())
                .or_insert_with(|| Arc::new(RwLock::new(()))),
        ))
    }

    /// Name of file `id`, provided it still holds `content`.
    fn current_name(&self, id: ResourceId, content: &Content) -> Option<String> {
        match self.tree.get(id) {
            Ok(ResourceRecord {
                name,
                kind: ResourceKind::File {
                    content: current, ..
                },
                ..
            }) if current == *content => Some(name),
            _ => None,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn upsert(
        &self,
        user: &str,
        id: ResourceId,
        name: &str,
        content: &Content,
        content_type: String,
        blob_key: DerivedKey,
        index_key: DerivedKey,
    ) -> LockboxResult<()> {
        let bytes = match content {
            Content::Blob(path) => self.blobs.read_to_vec_with_key(blob_key, path).await?,
            Content::Inline(bytes) => bytes.clone(),
        };

        let guard = self.lock_for(user)?.write_owned().await;
        let dir = self.index_root.join(user);
        let extractor = Arc::clone(&self.extractor);
        let writer_memory = self.config.writer_memory_bytes;
        let name = name.to_string();

        tokio::task::spawn_blocking(move || {
            let _guard: OwnedRwLockWriteGuard<()> = guard;
            let mut fields = extractor.extract(&name, &bytes, &content_type)?;
            fields.insert("name".to_string(), name);
            let index = SearchIndex::open(CipherDirectory::open(dir, index_key)?, writer_memory)?;
            index.replace(id, &fields)
        })
        .await
        .map_err(|e| anyhow::anyhow!("index task failed: {e}"))?
    }

    async fn remove(
        &self,
        user: &str,
        ids: Vec<ResourceId>,
        index_key: DerivedKey,
    ) -> LockboxResult<()> {
        let guard = self.lock_for(user)?.write_owned().await;
        let dir = self.index_root.join(user);
        let writer_memory = self.config.writer_memory_bytes;

        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            let dir = CipherDirectory::open(dir, index_key)?;
            if !dir.exists(INDEX_META) {
                return Ok(());
            }
            SearchIndex::open(dir, writer_memory)?.remove_many(&ids)
        })
        .await
        .map_err(|e| anyhow::anyhow!("index task failed: {e}"))?
    }
}
