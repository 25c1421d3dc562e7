//! Encrypted blob store: `<storage_root>/<username>/<token[0..2]>/<token>`
//!
//! Blob file format (binary):
//! ```text
//! [4 bytes: magic "LBX1"][16 bytes: blob id]
//! repeated:
//!   [4 bytes: sealed length, u32 BE][24 bytes: nonce][ciphertext + 16-byte tag]
//! AAD = blob id (16) || frame index (8, BE) || final flag (1)
//! ```
//!
//! Each frame carries at most [`FRAME_SIZE`] bytes of plaintext. The last
//! frame has the final flag set (it may be empty), so truncation at a frame
//! boundary is detected as well as reordering and tampering.

use std::io;
use std::path::PathBuf;

use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use lockbox_core::{validate_component, BlobPath, LockboxError, LockboxResult};
use lockbox_crypto::{open, seal, DerivedKey, KeyVault, SEAL_OVERHEAD};
use secrecy::SecretString;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

/// Plaintext bytes per frame (64 KiB)
pub const FRAME_SIZE: usize = 64 * 1024;

const MAGIC: &[u8; 4] = b"LBX1";
const BLOB_ID_LEN: usize = 16;
const HEADER_LEN: usize = MAGIC.len() + BLOB_ID_LEN;

/// Plaintext reader over a stored blob. Frames are decrypted as it is read.
pub type BlobReader = StreamReader<BoxStream<'static, io::Result<Bytes>>, Bytes>;

/// Result of a completed blob write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobWrite {
    pub path: BlobPath,
    /// Plaintext length
    pub length: u64,
}

#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
    keys: KeyVault,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>, keys: KeyVault) -> Self {
        Self {
            root: root.into(),
            keys,
        }
    }

    /// Absolute location of a blob's ciphertext.
    pub fn full_path(&self, path: &BlobPath) -> PathBuf {
        self.root.join(path.as_str())
    }

    /// Encrypt everything `reader` yields into a fresh blob.
    ///
    /// Only one frame of plaintext is held in memory at a time. On any
    /// failure the partial ciphertext file is removed.
    pub async fn write<R>(
        &self,
        username: &str,
        password: &SecretString,
        reader: R,
    ) -> LockboxResult<BlobWrite>
    where
        R: AsyncRead + Unpin,
    {
        let key = self.keys.blob_key(username, password).await?;
        self.write_with_key(username, &key, reader).await
    }

    /// [`write`](Self::write) with an already derived blob key.
    pub async fn write_with_key<R>(
        &self,
        username: &str,
        key: &DerivedKey,
        mut reader: R,
    ) -> LockboxResult<BlobWrite>
    where
        R: AsyncRead + Unpin,
    {
        validate_component(username)?;
        let blob_id = uuid::Uuid::new_v4();
        let token = blob_id.simple().to_string();
        let blob_path = BlobPath::for_token(username, &token);
        let path = self.full_path(&blob_path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;

        match write_frames(file, key, blob_id.as_bytes(), &mut reader).await {
            Ok(length) => {
                debug!(blob = %blob_path, length, "blob written");
                Ok(BlobWrite {
                    path: blob_path,
                    length,
                })
            }
            Err(e) => {
                if let Err(rm) = fs::remove_file(&path).await {
                    warn!(blob = %blob_path, "failed to remove partial blob: {rm}");
                }
                Err(e)
            }
        }
    }

    /// Open a blob for streaming decryption.
    ///
    /// The key and the header are checked before this returns; frame
    /// errors surface from the reader as `InvalidData` I/O errors carrying a
    /// `CryptoFailure` (see [`LockboxError::from_io`]).
    pub async fn read(
        &self,
        username: &str,
        password: &SecretString,
        path: &BlobPath,
    ) -> LockboxResult<BlobReader> {
        let key = self.keys.blob_key(username, password).await?;
        self.read_with_key(key, path).await
    }

    /// [`read`](Self::read) with an already derived blob key.
    pub async fn read_with_key(&self, key: DerivedKey, path: &BlobPath) -> LockboxResult<BlobReader> {
        let mut file = BufReader::new(File::open(self.full_path(path)).await?);
        let mut header = [0u8; HEADER_LEN];
        file.read_exact(&mut header).await.map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                LockboxError::crypto(format!("blob {path}: truncated header"))
            } else {
                LockboxError::Io(e)
            }
        })?;
        if &header[..MAGIC.len()] != MAGIC {
            return Err(LockboxError::crypto(format!("blob {path}: bad magic")));
        }
        let mut blob_id = [0u8; BLOB_ID_LEN];
        blob_id.copy_from_slice(&header[MAGIC.len()..]);

        let state = FrameCursor {
            file,
            key,
            blob_id,
            index: 0,
            finished: false,
        };
        let frames = stream::try_unfold(state, |mut cursor| async move {
            let frame = cursor.next_frame().await?;
            Ok::<_, io::Error>(frame.map(|plaintext| (Bytes::from(plaintext), cursor)))
        });
        Ok(StreamReader::new(frames.boxed()))
    }

    /// Decrypt a whole blob into memory.
    pub async fn read_to_vec(
        &self,
        username: &str,
        password: &SecretString,
        path: &BlobPath,
    ) -> LockboxResult<Vec<u8>> {
        let key = self.keys.blob_key(username, password).await?;
        self.read_to_vec_with_key(key, path).await
    }

    pub async fn read_to_vec_with_key(
        &self,
        key: DerivedKey,
        path: &BlobPath,
    ) -> LockboxResult<Vec<u8>> {
        let mut reader = self.read_with_key(key, path).await?;
        let mut out = Vec::new();
        reader
            .read_to_end(&mut out)
            .await
            .map_err(LockboxError::from_io)?;
        Ok(out)
    }

    /// Delete a blob's ciphertext. A blob that is already gone is not an error.
    pub async fn remove(&self, path: &BlobPath) -> LockboxResult<()> {
        match fs::remove_file(self.full_path(path)).await {
            Ok(()) => {
                debug!(blob = %path, "blob removed");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn exists(&self, path: &BlobPath) -> bool {
        fs::try_exists(self.full_path(path)).await.unwrap_or(false)
    }
}

/// A reader over in-memory content, for records that keep their bytes inline.
pub fn reader_from_bytes(bytes: Vec<u8>) -> BlobReader {
    let chunk: io::Result<Bytes> = Ok(Bytes::from(bytes));
    StreamReader::new(stream::iter([chunk]).boxed())
}

async fn write_frames<R>(
    file: File,
    key: &DerivedKey,
    blob_id: &[u8; BLOB_ID_LEN],
    reader: &mut R,
) -> LockboxResult<u64>
where
    R: AsyncRead + Unpin,
{
    let mut out = BufWriter::new(file);
    out.write_all(MAGIC).await?;
    out.write_all(blob_id).await?;

    let mut current = vec![0u8; FRAME_SIZE];
    let mut next = vec![0u8; FRAME_SIZE];
    let mut current_len = read_full(reader, &mut current).await?;
    let mut index: u64 = 0;
    let mut total: u64 = 0;

    loop {
        // A frame is final only once we know nothing follows it
        let next_len = if current_len == FRAME_SIZE {
            read_full(reader, &mut next).await?
        } else {
            0
        };
        let is_final = next_len == 0;

        let aad = frame_aad(blob_id, index, is_final);
        let sealed = seal(key, &aad, &current[..current_len])?;
        let sealed_len = u32::try_from(sealed.len())
            .map_err(|_| LockboxError::crypto("frame exceeds u32 length"))?;
        out.write_all(&sealed_len.to_be_bytes()).await?;
        out.write_all(&sealed).await?;
        total += current_len as u64;

        if is_final {
            break;
        }
        std::mem::swap(&mut current, &mut next);
        current_len = next_len;
        index += 1;
    }

    out.flush().await?;
    out.get_ref().sync_all().await?;
    Ok(total)
}

/// Fill `buf` from `reader`, stopping early only at EOF.
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn frame_aad(blob_id: &[u8; BLOB_ID_LEN], index: u64, is_final: bool) -> [u8; BLOB_ID_LEN + 9] {
    let mut aad = [0u8; BLOB_ID_LEN + 9];
    aad[..BLOB_ID_LEN].copy_from_slice(blob_id);
    aad[BLOB_ID_LEN..BLOB_ID_LEN + 8].copy_from_slice(&index.to_be_bytes());
    aad[BLOB_ID_LEN + 8] = u8::from(is_final);
    aad
}

struct FrameCursor {
    file: BufReader<File>,
    key: DerivedKey,
    blob_id: [u8; BLOB_ID_LEN],
    index: u64,
    finished: bool,
}

impl FrameCursor {
    /// Next non-empty plaintext frame, or `None` after a verified final frame.
    async fn next_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        loop {
            if self.finished {
                let mut probe = [0u8; 1];
                if self.file.read(&mut probe).await? != 0 {
                    return Err(LockboxError::crypto("trailing bytes after final frame").into());
                }
                return Ok(None);
            }

            let mut len_bytes = [0u8; 4];
            self.file
                .read_exact(&mut len_bytes)
                .await
                .map_err(|e| truncated(e, "missing final frame"))?;
            let sealed_len = u32::from_be_bytes(len_bytes) as usize;
            if !(SEAL_OVERHEAD..=FRAME_SIZE + SEAL_OVERHEAD).contains(&sealed_len) {
                return Err(LockboxError::crypto(format!(
                    "frame {} has invalid length {sealed_len}",
                    self.index
                ))
                .into());
            }

            let mut sealed = vec![0u8; sealed_len];
            self.file
                .read_exact(&mut sealed)
                .await
                .map_err(|e| truncated(e, "truncated frame"))?;

            let plaintext = match open(
                &self.key,
                &frame_aad(&self.blob_id, self.index, false),
                &sealed,
            ) {
                Ok(pt) => pt,
                Err(_) => {
                    let pt = open(&self.key, &frame_aad(&self.blob_id, self.index, true), &sealed)
                        .map_err(|_| {
                            LockboxError::crypto(format!("frame {} failed authentication", self.index))
                        })?;
                    self.finished = true;
                    pt
                }
            };
            self.index += 1;

            if !plaintext.is_empty() {
                return Ok(Some(plaintext));
            }
        }
    }
}

fn truncated(e: io::Error, what: &str) -> io::Error {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        LockboxError::crypto(what).into()
    } else {
        e
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lockbox_crypto::KdfParams;
    use tempfile::TempDir;

    fn store(tmp: &TempDir) -> BlobStore {
        let keys = KeyVault::new(tmp.path().join("secrets"), KdfParams::insecure_fast());
        BlobStore::new(tmp.path().join("storage"), keys)
    }

    fn pw(s: &str) -> SecretString {
        SecretString::from(s)
    }

    #[test]
    fn test_frame_aad_layout() {
        let aad = frame_aad(&[7u8; BLOB_ID_LEN], 2, true);
        assert_eq!(&aad[..16], &[7u8; 16]);
        assert_eq!(&aad[16..24], &2u64.to_be_bytes());
        assert_eq!(aad[24], 1);
    }

    #[tokio::test]
    async fn test_write_layout() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);

        let written = store
            .write("alice", &pw("pw"), &b"hello world"[..])
            .await
            .unwrap();
        assert_eq!(written.length, 11);
        assert_eq!(written.path.owner(), "alice");

        let on_disk = std::fs::read(store.full_path(&written.path)).unwrap();
        assert_eq!(&on_disk[..4], MAGIC);
        // header + one frame: len prefix, nonce, 11 bytes, tag
        assert_eq!(on_disk.len(), HEADER_LEN + 4 + 11 + SEAL_OVERHEAD);
        assert!(!on_disk.windows(5).any(|w| w == b"hello"));
    }

    #[tokio::test]
    async fn test_empty_blob_has_final_frame() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);

        let written = store.write("alice", &pw("pw"), &b""[..]).await.unwrap();
        assert_eq!(written.length, 0);
        let back = store
            .read_to_vec("alice", &pw("pw"), &written.path)
            .await
            .unwrap();
        assert!(back.is_empty());
    }

    #[tokio::test]
    async fn test_exact_frame_multiple_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let data: Vec<u8> = (0..FRAME_SIZE * 2).map(|i| (i % 251) as u8).collect();

        let written = store.write("alice", &pw("pw"), &data[..]).await.unwrap();
        let back = store
            .read_to_vec("alice", &pw("pw"), &written.path)
            .await
            .unwrap();
        assert_eq!(back, data);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);

        let written = store.write("alice", &pw("pw"), &b"x"[..]).await.unwrap();
        assert!(store.exists(&written.path).await);
        store.remove(&written.path).await.unwrap();
        assert!(!store.exists(&written.path).await);
        store.remove(&written.path).await.unwrap();
    }

    #[tokio::test]
    async fn test_inline_reader() {
        let mut reader = reader_from_bytes(b"inline".to_vec());
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"inline");
    }
}
