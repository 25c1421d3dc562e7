//! lockbox-vault: the per-user encrypted file vault
//!
//! - [`metadata`]: the resource record store interface and its JSON implementation
//! - [`tree`]: path resolution and namespace mutations over the record store
//! - [`tee`] + [`pipeline`]: upload ingestion (type detection while streaming to the blob store)
//! - [`indexer`]: supervised per-user background indexing
//! - [`vault`]: the facade the protocol layer talks to

pub mod indexer;
pub mod metadata;
pub mod pipeline;
pub mod tee;
pub mod tree;
pub mod vault;

pub use indexer::{IndexJob, IndexStats, Indexer};
pub use metadata::{JsonMetadataStore, MetadataStore};
pub use pipeline::{IngestPipeline, UploadState};
pub use tree::{PutOutcome, ResourceTree};
pub use vault::Vault;
