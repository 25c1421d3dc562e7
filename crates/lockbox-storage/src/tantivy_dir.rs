//! `tantivy::Directory` over a [`CipherDirectory`].
//!
//! tantivy never sees a plaintext file on disk: reads hand it a fully
//! decrypted [`OwnedBytes`], writes are buffered in memory and sealed when
//! tantivy terminates the writer.

use std::collections::HashSet;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lockbox_core::LockboxError;
use tantivy::directory::error::{DeleteError, LockError, OpenReadError, OpenWriteError};
use tantivy::directory::{
    AntiCallToken, Directory, DirectoryLock, FileHandle, Lock, OwnedBytes, TerminatingWrite,
    WatchCallback, WatchHandle, WritePtr,
};
use tracing::trace;

use crate::directory::{CipherDirectory, SegmentWriter};

const LOCK_RETRY: Duration = Duration::from_millis(5);

#[derive(Debug, Clone)]
pub struct TantivyCipherDirectory {
    inner: CipherDirectory,
    /// Lock files held by this process. Cross-process exclusion is not
    /// needed: one user's index is only ever written under the user's lock.
    locks: Arc<Mutex<HashSet<PathBuf>>>,
}

impl TantivyCipherDirectory {
    pub fn new(inner: CipherDirectory) -> Self {
        Self {
            inner,
            locks: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn cipher_directory(&self) -> &CipherDirectory {
        &self.inner
    }
}

fn segment_name(path: &Path) -> io::Result<&str> {
    path.to_str().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("non UTF-8 segment name: {}", path.display()),
        )
    })
}

impl Directory for TantivyCipherDirectory {
    fn get_file_handle(&self, path: &Path) -> Result<Arc<dyn FileHandle>, OpenReadError> {
        let bytes = self.atomic_read(path)?;
        Ok(Arc::new(OwnedBytes::new(bytes)))
    }

    fn delete(&self, path: &Path) -> Result<(), DeleteError> {
        let io_err = |io_error: io::Error| DeleteError::IoError {
            io_error: Arc::new(io_error),
            filepath: path.to_path_buf(),
        };
        let name = segment_name(path).map_err(io_err)?;
        match self.inner.delete(name) {
            Ok(()) => Ok(()),
            Err(LockboxError::ResourceNotFound(_)) => {
                Err(DeleteError::FileDoesNotExist(path.to_path_buf()))
            }
            Err(e) => Err(io_err(e.into())),
        }
    }

    fn exists(&self, path: &Path) -> Result<bool, OpenReadError> {
        let name = segment_name(path)
            .map_err(|e| OpenReadError::wrap_io_error(e, path.to_path_buf()))?;
        Ok(self.inner.exists(name))
    }

    fn open_write(&self, path: &Path) -> Result<WritePtr, OpenWriteError> {
        let wrap = |e: io::Error| OpenWriteError::wrap_io_error(e, path.to_path_buf());
        let name = segment_name(path).map_err(wrap)?;
        if self.inner.exists(name) {
            return Err(OpenWriteError::FileAlreadyExists(path.to_path_buf()));
        }
        // tantivy expects the file to exist as soon as open_write returns
        self.inner
            .write_all(name, &[])
            .map_err(|e| wrap(e.into()))?;
        let writer = self
            .inner
            .open_for_write(name)
            .map_err(|e| wrap(e.into()))?;
        trace!(segment = %name, "open_write");
        Ok(io::BufWriter::new(Box::new(SegmentSink(writer))))
    }

    fn atomic_read(&self, path: &Path) -> Result<Vec<u8>, OpenReadError> {
        let name = segment_name(path)
            .map_err(|e| OpenReadError::wrap_io_error(e, path.to_path_buf()))?;
        match self.inner.read_all(name) {
            Ok(bytes) => Ok(bytes),
            Err(LockboxError::ResourceNotFound(_)) => {
                Err(OpenReadError::FileDoesNotExist(path.to_path_buf()))
            }
            Err(e) => Err(OpenReadError::wrap_io_error(e.into(), path.to_path_buf())),
        }
    }

    fn atomic_write(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        let name = segment_name(path)?;
        self.inner.write_all(name, data).map_err(io::Error::from)
    }

    fn sync_directory(&self) -> io::Result<()> {
        self.inner.sync().map_err(io::Error::from)
    }

    fn watch(&self, _watch_callback: WatchCallback) -> tantivy::Result<WatchHandle> {
        // readers are reloaded explicitly
        Ok(WatchHandle::empty())
    }

    fn acquire_lock(&self, lock: &Lock) -> Result<DirectoryLock, LockError> {
        loop {
            {
                let mut held = self.locks.lock().map_err(|_| {
                    LockError::IoError(Arc::new(io::Error::other("lock registry poisoned")))
                })?;
                if held.insert(lock.filepath.clone()) {
                    let guard = HeldLock {
                        path: lock.filepath.clone(),
                        locks: Arc::clone(&self.locks),
                    };
                    return Ok(DirectoryLock::from(Box::new(guard)));
                }
            }
            if !lock.is_blocking {
                return Err(LockError::LockBusy);
            }
            std::thread::sleep(LOCK_RETRY);
        }
    }
}

struct HeldLock {
    path: PathBuf,
    locks: Arc<Mutex<HashSet<PathBuf>>>,
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        if let Ok(mut held) = self.locks.lock() {
            held.remove(&self.path);
        }
    }
}

/// Buffers tantivy's writes; seals once on terminate.
struct SegmentSink(SegmentWriter);

impl Write for SegmentSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        // sealing rewrites the whole segment, so only terminate persists
        Ok(())
    }
}

impl TerminatingWrite for SegmentSink {
    fn terminate_ref(&mut self, _: AntiCallToken) -> io::Result<()> {
        self.0.commit().map_err(io::Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lockbox_crypto::{derive_index_key, generate_content_key};
    use tantivy::collector::TopDocs;
    use tantivy::query::QueryParser;
    use tantivy::schema::{Schema, Value, STORED, STRING, TEXT};
    use tantivy::{doc, Index, ReloadPolicy, TantivyDocument};
    use tempfile::TempDir;

    fn cipher_dir(tmp: &TempDir) -> CipherDirectory {
        let key = derive_index_key(&generate_content_key()).unwrap();
        CipherDirectory::open(tmp.path().join("alice"), key).unwrap()
    }

    #[test]
    fn test_open_write_is_write_once() {
        let tmp = TempDir::new().unwrap();
        let dir = TantivyCipherDirectory::new(cipher_dir(&tmp));
        let path = Path::new("seg.idx");

        let mut w = dir.open_write(path).unwrap();
        w.write_all(b"abc").unwrap();
        w.terminate().unwrap();

        assert!(matches!(
            dir.open_write(path),
            Err(OpenWriteError::FileAlreadyExists(_))
        ));
        assert_eq!(dir.atomic_read(path).unwrap(), b"abc");
        let slice = dir.open_read(path).unwrap();
        assert_eq!(slice.read_bytes().unwrap().as_slice(), b"abc");
    }

    #[test]
    fn test_missing_file_contract() {
        let tmp = TempDir::new().unwrap();
        let dir = TantivyCipherDirectory::new(cipher_dir(&tmp));
        let path = Path::new("meta.json");

        assert!(!dir.exists(path).unwrap());
        assert!(matches!(
            dir.atomic_read(path),
            Err(OpenReadError::FileDoesNotExist(_))
        ));
        assert!(matches!(
            dir.delete(path),
            Err(DeleteError::FileDoesNotExist(_))
        ));
    }

    #[test]
    fn test_non_blocking_lock_is_exclusive() {
        let tmp = TempDir::new().unwrap();
        let dir = TantivyCipherDirectory::new(cipher_dir(&tmp));
        let lock = Lock {
            filepath: PathBuf::from(".tantivy-writer.lock"),
            is_blocking: false,
        };

        let held = dir.acquire_lock(&lock).unwrap();
        assert!(matches!(dir.acquire_lock(&lock), Err(LockError::LockBusy)));
        drop(held);
        assert!(dir.acquire_lock(&lock).is_ok());
    }

    #[test]
    fn test_tantivy_index_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let cdir = cipher_dir(&tmp);

        let mut builder = Schema::builder();
        let id = builder.add_text_field("id", STRING | STORED);
        let body = builder.add_text_field("body", TEXT);
        let schema = builder.build();

        {
            let index =
                Index::open_or_create(TantivyCipherDirectory::new(cdir.clone()), schema.clone())
                    .unwrap();
            let mut writer = index.writer_with_num_threads(1, 15_000_000).unwrap();
            writer
                .add_document(doc!(id => "r1", body => "the quick brown fox"))
                .unwrap();
            writer.commit().unwrap();
            writer.wait_merging_threads().unwrap();
        }

        let index = Index::open(TantivyCipherDirectory::new(cdir.clone())).unwrap();
        let reader: tantivy::IndexReader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()
            .unwrap();
        let searcher = reader.searcher();
        let query = QueryParser::for_index(&index, vec![body])
            .parse_query("fox")
            .unwrap();
        let hits = searcher.search(&query, &TopDocs::with_limit(10)).unwrap();
        assert_eq!(hits.len(), 1);
        let found: TantivyDocument = searcher.doc(hits[0].1).unwrap();
        assert_eq!(
            found.get_first(id).and_then(|v| v.as_str()),
            Some("r1")
        );

        for name in cdir.list().unwrap() {
            let raw = std::fs::read(cdir.root().join(&name)).unwrap();
            assert!(!raw.windows(5).any(|w| w == b"brown"), "{name} leaks plaintext");
        }
    }
}
