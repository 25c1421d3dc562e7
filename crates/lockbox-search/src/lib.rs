//! lockbox-search: per-user full-text search
//!
//! Each user's index is a tantivy index living in that user's encrypted
//! segment directory. Documents are keyed by resource id and carry the
//! file name plus whatever text the [`extract::TextExtractor`] produced.

pub mod classify;
pub mod extract;
pub mod index;
pub mod schema;

pub use classify::{BuiltinClassifier, ContentClassifier, OCTET_STREAM};
pub use extract::{BuiltinExtractor, TextExtractor};
pub use index::SearchIndex;
pub use schema::IndexSchema;
