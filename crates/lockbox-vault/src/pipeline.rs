//! Upload ingestion.
//!
//! ```text
//! reader ──► TeeReader ──► BlobStore (encrypt, frame by frame)
//!               │
//!               └─► probe task (first N bytes) ──► ContentClassifier
//! ```
//!
//! Blob write, then metadata commit, then an index job on the user's
//! worker. The upload returns once the metadata is committed; indexing
//! failures never roll back the stored file.

use std::sync::Arc;
use std::time::Duration;

use lockbox_core::config::IngestConfig;
use lockbox_core::{Content, LockboxResult, ResourceRecord};
use lockbox_crypto::{derive_blob_key, derive_index_key, KeyVault};
use lockbox_search::{ContentClassifier, OCTET_STREAM};
use lockbox_storage::BlobStore;
use secrecy::SecretString;
use tokio::io::AsyncRead;
use tracing::{debug, info, warn};

use crate::indexer::{IndexJob, Indexer};
use crate::tee::tee_with_probe;
use crate::tree::ResourceTree;

/// Where an upload is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    /// Streaming into the blob store
    Receiving,
    /// Waiting for the content-type probe
    Detecting,
    /// Committing the resource record
    Persisting,
    /// Searchable
    Indexed,
    /// Stored, but not searchable
    IndexFailed,
}

pub struct IngestPipeline {
    keys: KeyVault,
    blobs: BlobStore,
    tree: Arc<ResourceTree>,
    indexer: Indexer,
    classifier: Arc<dyn ContentClassifier>,
    config: IngestConfig,
}

impl IngestPipeline {
    pub fn new(
        keys: KeyVault,
        blobs: BlobStore,
        tree: Arc<ResourceTree>,
        indexer: Indexer,
        classifier: Arc<dyn ContentClassifier>,
        config: IngestConfig,
    ) -> Self {
        Self {
            keys,
            blobs,
            tree,
            indexer,
            classifier,
            config,
        }
    }

    /// Store `reader` at `path`, creating or overwriting a file.
    ///
    /// Without a `content_type` the type is sniffed from the stream while it
    /// is being stored. `declared_length` is advisory: the stored length is
    /// what the reader actually produced.
    pub async fn upload<R>(
        &self,
        user: &str,
        path: &str,
        reader: R,
        declared_length: Option<u64>,
        content_type: Option<&str>,
        password: &SecretString,
    ) -> LockboxResult<ResourceRecord>
    where
        R: AsyncRead + Unpin,
    {
        let content_key = self.keys.get_or_create_key(user, password).await?;
        let blob_key = derive_blob_key(&content_key)?;
        let index_key = derive_index_key(&content_key)?;
        drop(content_key);

        // fail before streaming anything if the record could never be written
        self.tree.check_put(user, path)?;
        let name = file_name(path);

        debug!(user = %user, path = %path, state = ?UploadState::Receiving, "upload");
        let (written, content_type) = match content_type {
            Some(ct) => {
                let written = self.blobs.write_with_key(user, &blob_key, reader).await?;
                (written, ct.to_string())
            }
            None => {
                let (tee, probe) = tee_with_probe(reader, self.config.probe_window_bytes);
                let written = self.blobs.write_with_key(user, &blob_key, tee).await?;

                debug!(user = %user, path = %path, state = ?UploadState::Detecting, "upload");
                let timeout = Duration::from_secs(self.config.detect_timeout_secs);
                let classifier = Arc::clone(&self.classifier);
                let file_name = name.to_string();
                // timeout covers the probe drain and the classifier
                let detection = async move {
                    match probe.await {
                        Ok(probe) => {
                            tokio::task::spawn_blocking(move || {
                                classifier.detect(&file_name, &probe)
                            })
                            .await
                        }
                        Err(e) => Err(e),
                    }
                };
                let detected = match tokio::time::timeout(timeout, detection).await {
                    Ok(Ok(detected)) => detected,
                    Ok(Err(e)) => {
                        warn!(path = %path, "content type detection failed: {e}");
                        OCTET_STREAM.to_string()
                    }
                    Err(_) => {
                        warn!(path = %path, "content type detection timed out");
                        OCTET_STREAM.to_string()
                    }
                };
                let detected = if detected.is_empty() {
                    OCTET_STREAM.to_string()
                } else {
                    detected
                };
                (written, detected)
            }
        };

        debug!(user = %user, path = %path, state = ?UploadState::Persisting, "upload");
        let content = Content::Blob(written.path.clone());
        let outcome = match self.tree.put_file(
            user,
            path,
            &content_type,
            written.length,
            content.clone(),
        ) {
            Ok(outcome) => outcome,
            Err(e) => {
                if let Err(rm) = self.blobs.remove(&written.path).await {
                    warn!(blob = %written.path, "failed to remove unreferenced blob: {rm}");
                }
                return Err(e);
            }
        };

        if let Some(old) = outcome.replaced.as_ref().and_then(|r| r.blob_path()) {
            if let Err(e) = self.blobs.remove(old).await {
                warn!(blob = %old, "failed to remove replaced blob: {e}");
            }
        }

        if let Some(declared) = declared_length {
            if declared != written.length {
                warn!(
                    path = %path,
                    declared,
                    received = written.length,
                    "upload length differs from declared length"
                );
            }
        }

        let record = outcome.record;
        let job = IndexJob::Upsert {
            id: record.id,
            content,
            content_type: content_type.clone(),
            blob_key,
            index_key,
        };
        if let Err(e) = self.indexer.submit(user, job) {
            warn!(
                user = %user,
                resource = %record.name,
                state = ?UploadState::IndexFailed,
                "could not queue indexing: {e}"
            );
        }

        info!(
            user = %user,
            path = %path,
            content_type = %content_type,
            length = written.length,
            overwrite = outcome.replaced.is_some(),
            "upload stored"
        );
        Ok(record)
    }
}

fn file_name(path: &str) -> &str {
    path.trim_end_matches('/').rsplit('/').next().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::JsonMetadataStore;
    use lockbox_core::config::IndexConfig;
    use lockbox_core::LockboxError;
    use lockbox_crypto::KdfParams;
    use lockbox_search::{BuiltinClassifier, BuiltinExtractor};
    use tempfile::TempDir;

    struct Fixture {
        tmp: TempDir,
        tree: Arc<ResourceTree>,
        blobs: BlobStore,
        indexer: Indexer,
        pipeline: IngestPipeline,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let keys = KeyVault::new(tmp.path().join("secrets"), KdfParams::insecure_fast());
        let blobs = BlobStore::new(tmp.path().join("storage"), keys.clone());
        let tree = Arc::new(ResourceTree::new(Arc::new(JsonMetadataStore::in_memory())));
        let indexer = Indexer::new(
            blobs.clone(),
            tmp.path().join("indexes"),
            Arc::clone(&tree),
            Arc::new(BuiltinExtractor),
            IndexConfig::default(),
        );
        let pipeline = IngestPipeline::new(
            keys,
            blobs.clone(),
            Arc::clone(&tree),
            indexer.clone(),
            Arc::new(BuiltinClassifier),
            IngestConfig::default(),
        );
        Fixture {
            tmp,
            tree,
            blobs,
            indexer,
            pipeline,
        }
    }

    fn pw() -> SecretString {
        SecretString::from("correct horse")
    }

    fn blob_count(fx: &Fixture) -> usize {
        let root = fx.tmp.path().join("storage").join("alice");
        let Ok(shards) = std::fs::read_dir(root) else {
            return 0;
        };
        shards
            .flatten()
            .map(|shard| std::fs::read_dir(shard.path()).map(|d| d.count()).unwrap_or(0))
            .sum()
    }

    #[tokio::test]
    async fn test_detects_type_while_streaming() {
        let fx = fixture();
        let record = fx
            .pipeline
            .upload("alice", "/report.txt", &b"hello world"[..], Some(11), None, &pw())
            .await
            .unwrap();
        assert_eq!(record.content_type(), Some("text/plain"));
        assert_eq!(record.content_length(), Some(11));

        let png = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";
        let record = fx
            .pipeline
            .upload("alice", "/pic", &png[..], None, None, &pw())
            .await
            .unwrap();
        assert_eq!(record.content_type(), Some("image/png"));
        fx.indexer.shutdown().await;
    }

    #[tokio::test]
    async fn test_caller_type_wins() {
        let fx = fixture();
        let record = fx
            .pipeline
            .upload(
                "alice",
                "/data.bin",
                &b"hello"[..],
                None,
                Some("application/x-custom"),
                &pw(),
            )
            .await
            .unwrap();
        assert_eq!(record.content_type(), Some("application/x-custom"));
    }

    #[tokio::test]
    async fn test_overwrite_replaces_blob() {
        let fx = fixture();
        let first = fx
            .pipeline
            .upload("alice", "/a.txt", &b"one"[..], None, None, &pw())
            .await
            .unwrap();
        let second = fx
            .pipeline
            .upload("alice", "/a.txt", &b"two two"[..], None, None, &pw())
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert!(!fx.blobs.exists(first.blob_path().unwrap()).await);
        assert_eq!(
            fx.blobs
                .read_to_vec("alice", &pw(), second.blob_path().unwrap())
                .await
                .unwrap(),
            b"two two"
        );
        assert_eq!(blob_count(&fx), 1);
    }

    #[tokio::test]
    async fn test_rejected_uploads_leave_no_blob() {
        let fx = fixture();
        fx.tree.mkdir("alice", "/docs").unwrap();

        let err = fx
            .pipeline
            .upload("alice", "/docs", &b"x"[..], None, None, &pw())
            .await
            .unwrap_err();
        assert!(matches!(err, LockboxError::ResourceAlreadyExists(_)));

        let err = fx
            .pipeline
            .upload("alice", "/missing/a.txt", &b"x"[..], None, None, &pw())
            .await
            .unwrap_err();
        assert!(matches!(err, LockboxError::ResourceNotFound(_)));
        assert_eq!(blob_count(&fx), 0);
    }

    #[tokio::test]
    async fn test_wrong_password_stores_nothing() {
        let fx = fixture();
        fx.pipeline
            .upload("alice", "/a.txt", &b"x"[..], None, None, &pw())
            .await
            .unwrap();
        let err = fx
            .pipeline
            .upload(
                "alice",
                "/b.txt",
                &b"y"[..],
                None,
                None,
                &SecretString::from("wrong"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LockboxError::BadPassword));
        assert!(fx.tree.resolve("alice", "/b.txt").is_err());
        assert_eq!(blob_count(&fx), 1);
    }

    #[test]
    fn test_file_name() {
        assert_eq!(file_name("/docs/report.txt"), "report.txt");
        assert_eq!(file_name("report.txt"), "report.txt");
        assert_eq!(file_name("/docs/sub/"), "sub");
    }
}
