//! lockbox-storage: everything lockbox writes to disk, encrypted
//!
//! - [`blob`]: streamed, framed encryption of uploaded file contents
//! - [`buffer`] + [`directory`]: the in-memory, encrypted-at-rest segment
//!   files the search index lives in
//! - [`tantivy_dir`]: the `tantivy::Directory` adapter over [`directory`]

pub mod blob;
pub mod buffer;
pub mod directory;
pub mod tantivy_dir;

pub use blob::{reader_from_bytes, BlobReader, BlobStore, BlobWrite, FRAME_SIZE};
pub use buffer::GrowableBuffer;
pub use directory::{CipherDirectory, SegmentReader, SegmentWriter};
pub use tantivy_dir::TantivyCipherDirectory;
