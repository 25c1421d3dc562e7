//! Encrypted segment directory: `<index_root>/<username>/<segment>`
//!
//! Each segment is held entirely in memory while open and written back as a
//! single sealed unit:
//! ```text
//! [4 bytes: magic "LBS1"][24 bytes: nonce][ciphertext + 16-byte tag]
//! AAD = segment name
//! ```
//! Replacement is atomic: seal into a temp file next to the target, then
//! rename over it.

use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lockbox_core::{validate_component, LockboxError, LockboxResult};
use lockbox_crypto::{open, seal, DerivedKey, SEAL_OVERHEAD};
use tracing::{debug, warn};

use crate::buffer::GrowableBuffer;

const MAGIC: &[u8; 4] = b"LBS1";
const TMP_SUFFIX: &str = ".lbtmp";

/// Ciphertext bytes on top of a segment's plaintext length.
pub const SEGMENT_OVERHEAD: u64 = (MAGIC.len() + SEAL_OVERHEAD) as u64;

#[derive(Clone)]
pub struct CipherDirectory {
    root: PathBuf,
    key: Arc<DerivedKey>,
}

impl std::fmt::Debug for CipherDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherDirectory")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl CipherDirectory {
    /// Open (creating if needed) the directory at `root`, sealing with `key`.
    pub fn open(root: impl Into<PathBuf>, key: DerivedKey) -> LockboxResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            key: Arc::new(key),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, name: &str) -> LockboxResult<PathBuf> {
        validate_component(name)?;
        if name.ends_with(TMP_SUFFIX) {
            return Err(LockboxError::InvalidName(name.to_string()));
        }
        Ok(self.root.join(name))
    }

    /// Names of all segments (temp files excluded).
    pub fn list(&self) -> LockboxResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if !name.ends_with(TMP_SUFFIX) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path_of(name).map(|p| p.is_file()).unwrap_or(false)
    }

    /// Plaintext length, from the ciphertext size alone.
    pub fn file_length(&self, name: &str) -> LockboxResult<u64> {
        let path = self.path_of(name)?;
        let size = match fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(LockboxError::ResourceNotFound(name.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        size.checked_sub(SEGMENT_OVERHEAD)
            .ok_or_else(|| LockboxError::crypto(format!("segment {name} is truncated")))
    }

    /// Decrypt a whole segment. Missing segments are `ResourceNotFound`.
    pub fn read_all(&self, name: &str) -> LockboxResult<Vec<u8>> {
        self.load(name)?
            .ok_or_else(|| LockboxError::ResourceNotFound(name.to_string()))
    }

    /// Seal `bytes` and atomically replace the segment.
    pub fn write_all(&self, name: &str, bytes: &[u8]) -> LockboxResult<()> {
        let path = self.path_of(name)?;
        let sealed = seal(&self.key, name.as_bytes(), bytes)?;

        let tmp = self
            .root
            .join(format!(".{name}.{}{TMP_SUFFIX}", uuid::Uuid::new_v4().simple()));
        let result = (|| -> io::Result<()> {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(MAGIC)?;
            file.write_all(&sealed)?;
            file.sync_all()?;
            fs::rename(&tmp, &path)
        })();
        if let Err(e) = result {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        debug!(segment = %name, len = bytes.len(), "segment written");
        Ok(())
    }

    pub fn delete(&self, name: &str) -> LockboxResult<()> {
        let path = self.path_of(name)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(LockboxError::ResourceNotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Open for reading. A missing segment reads as empty.
    pub fn open_for_read(&self, name: &str) -> LockboxResult<SegmentReader> {
        let bytes = self.load(name)?.unwrap_or_default();
        Ok(SegmentReader {
            name: name.to_string(),
            buffer: GrowableBuffer::from_vec(bytes),
        })
    }

    /// Open for writing. Existing contents are loaded, so a partial rewrite
    /// keeps the bytes it does not touch.
    pub fn open_for_write(&self, name: &str) -> LockboxResult<SegmentWriter> {
        let bytes = self.load(name)?.unwrap_or_default();
        Ok(SegmentWriter {
            dir: self.clone(),
            name: name.to_string(),
            buffer: GrowableBuffer::from_vec(bytes),
            dirty: false,
        })
    }

    /// fsync the directory itself so renames are durable.
    pub fn sync(&self) -> LockboxResult<()> {
        fs::File::open(&self.root)?.sync_all()?;
        Ok(())
    }

    fn load(&self, name: &str) -> LockboxResult<Option<Vec<u8>>> {
        let path = self.path_of(name)?;
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let sealed = raw
            .strip_prefix(MAGIC.as_slice())
            .ok_or_else(|| LockboxError::crypto(format!("segment {name}: bad magic")))?;
        open(&self.key, name.as_bytes(), sealed).map(Some)
    }
}

/// Read-only view of a materialized segment.
#[derive(Debug)]
pub struct SegmentReader {
    name: String,
    buffer: GrowableBuffer,
}

impl SegmentReader {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn position(&self) -> u64 {
        self.buffer.position() as u64
    }

    pub fn length(&self) -> u64 {
        self.buffer.len() as u64
    }

    pub fn read_byte(&mut self) -> io::Result<u8> {
        self.buffer
            .get_byte()
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "end of segment"))
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer.to_vec()
    }
}

impl Read for SegmentReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.buffer.get(buf))
    }
}

impl Seek for SegmentReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        seek_buffer(&mut self.buffer, pos)
    }
}

/// Writable view of a materialized segment. Changes stay in memory until
/// [`flush`](Write::flush) or [`close`](SegmentWriter::close).
pub struct SegmentWriter {
    dir: CipherDirectory,
    name: String,
    buffer: GrowableBuffer,
    dirty: bool,
}

impl SegmentWriter {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn position(&self) -> u64 {
        self.buffer.position() as u64
    }

    pub fn length(&self) -> u64 {
        self.buffer.len() as u64
    }

    pub fn read_byte(&mut self) -> io::Result<u8> {
        self.buffer
            .get_byte()
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "end of segment"))
    }

    pub fn write_byte(&mut self, byte: u8) -> LockboxResult<()> {
        self.buffer.put_byte(byte)?;
        self.dirty = true;
        Ok(())
    }

    /// Seal and persist the segment if anything changed since the last commit.
    pub fn commit(&mut self) -> LockboxResult<()> {
        if !self.dirty {
            return Ok(());
        }
        self.dir.write_all(&self.name, self.buffer.as_slice())?;
        self.dirty = false;
        Ok(())
    }

    pub fn close(mut self) -> LockboxResult<()> {
        self.commit()
    }
}

impl Read for SegmentWriter {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.buffer.get(buf))
    }
}

impl Write for SegmentWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.put(buf)?;
        self.dirty = true;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.commit().map_err(io::Error::from)
    }
}

impl Seek for SegmentWriter {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        seek_buffer(&mut self.buffer, pos)
    }
}

impl Drop for SegmentWriter {
    fn drop(&mut self) {
        if self.dirty {
            warn!(
                segment = %self.name,
                "segment writer dropped with unflushed changes"
            );
        }
    }
}

fn seek_buffer(buffer: &mut GrowableBuffer, pos: SeekFrom) -> io::Result<u64> {
    let target = match pos {
        SeekFrom::Start(n) => Some(n),
        SeekFrom::End(delta) => (buffer.len() as u64).checked_add_signed(delta),
        SeekFrom::Current(delta) => (buffer.position() as u64).checked_add_signed(delta),
    };
    let target = target.ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "seek before start of segment")
    })?;
    let position = usize::try_from(target)
        .map_err(|_| io::Error::from(LockboxError::SegmentTooLarge(usize::MAX)))?;
    buffer.set_position(position);
    Ok(target)
}
