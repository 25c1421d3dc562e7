//! One user's search index.
//!
//! All calls are blocking (tantivy does its own I/O through the cipher
//! directory); callers run them on a blocking thread while holding the
//! user's index lock.

use std::collections::HashMap;

use lockbox_core::{LockboxError, LockboxResult, ResourceId};
use lockbox_storage::{CipherDirectory, TantivyCipherDirectory};
use tantivy::collector::TopDocs;
use tantivy::query::QueryParser;
use tantivy::schema::Value;
use tantivy::{Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, Term};
use tracing::debug;

use crate::schema::{IndexSchema, FIELD_BODY, FIELD_NAME, FIELD_TITLE};

/// tantivy refuses writer budgets below this (per indexing thread).
const MIN_WRITER_MEMORY: usize = 15_000_000;

pub struct SearchIndex {
    index: Index,
    fields: IndexSchema,
    writer_memory: usize,
}

impl std::fmt::Debug for SearchIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchIndex")
            .field("writer_memory", &self.writer_memory)
            .finish_non_exhaustive()
    }
}

impl SearchIndex {
    /// Open the index stored in `dir`, creating an empty one if there is none.
    pub fn open(dir: CipherDirectory, writer_memory: usize) -> LockboxResult<Self> {
        let fields = IndexSchema::build();
        let index = Index::open_or_create(TantivyCipherDirectory::new(dir), fields.schema.clone())
            .map_err(LockboxError::index)?;
        Ok(Self {
            index,
            fields,
            writer_memory: writer_memory.max(MIN_WRITER_MEMORY),
        })
    }

    /// Index a document for `id`. Does not remove an existing one first;
    /// see [`replace`](Self::replace).
    pub fn add(&self, id: ResourceId, fields: &HashMap<String, String>) -> LockboxResult<()> {
        self.commit_with(|writer| {
            writer
                .add_document(self.document(id, fields))
                .map_err(LockboxError::index)?;
            Ok(())
        })
    }

    /// Drop every document for `id`.
    pub fn remove(&self, id: ResourceId) -> LockboxResult<()> {
        self.remove_many(&[id])
    }

    pub fn remove_many(&self, ids: &[ResourceId]) -> LockboxResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.commit_with(|writer| {
            for id in ids {
                writer.delete_term(self.id_term(*id));
            }
            Ok(())
        })
    }

    /// Remove + add in a single commit: searchers see either the old
    /// document or the new one, never neither.
    pub fn replace(&self, id: ResourceId, fields: &HashMap<String, String>) -> LockboxResult<()> {
        self.commit_with(|writer| {
            writer.delete_term(self.id_term(id));
            writer
                .add_document(self.document(id, fields))
                .map_err(LockboxError::index)?;
            Ok(())
        })
    }

    /// Run a free-text query over name, title, body and meta.
    ///
    /// Malformed queries are `LockboxError::Index`.
    pub fn search(&self, query: &str, limit: usize) -> LockboxResult<Vec<ResourceId>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let parser = QueryParser::for_index(&self.index, self.fields.default_fields());
        let query = parser.parse_query(query).map_err(LockboxError::index)?;

        let searcher = self.reader()?.searcher();
        let hits = searcher
            .search(&query, &TopDocs::with_limit(limit))
            .map_err(LockboxError::index)?;

        let mut ids = Vec::with_capacity(hits.len());
        for (_score, address) in hits {
            let doc: TantivyDocument = searcher.doc(address).map_err(LockboxError::index)?;
            if let Some(id) = doc
                .get_first(self.fields.id)
                .and_then(|v| v.as_str())
                .and_then(ResourceId::parse)
            {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    pub fn num_docs(&self) -> LockboxResult<u64> {
        Ok(self.reader()?.searcher().num_docs())
    }

    fn reader(&self) -> LockboxResult<IndexReader> {
        self.index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()
            .map_err(LockboxError::index)
    }

    fn commit_with<F>(&self, apply: F) -> LockboxResult<()>
    where
        F: FnOnce(&mut IndexWriter) -> LockboxResult<()>,
    {
        let mut writer: IndexWriter = self
            .index
            .writer_with_num_threads(1, self.writer_memory)
            .map_err(LockboxError::index)?;
        if let Err(e) = apply(&mut writer) {
            let _ = writer.rollback();
            return Err(e);
        }
        let opstamp = writer.commit().map_err(LockboxError::index)?;
        writer.wait_merging_threads().map_err(LockboxError::index)?;
        debug!(opstamp, "index commit");
        Ok(())
    }

    fn id_term(&self, id: ResourceId) -> Term {
        Term::from_field_text(self.fields.id, &id.to_string())
    }

    /// `name`, `title` and `body` go to their own fields; any other
    /// extracted field is folded into `meta` as `key: value`.
    fn document(&self, id: ResourceId, fields: &HashMap<String, String>) -> TantivyDocument {
        let mut doc = TantivyDocument::new();
        doc.add_text(self.fields.id, id.to_string());

        let mut keys: Vec<&String> = fields.keys().collect();
        keys.sort();
        for key in keys {
            let value = &fields[key];
            match key.as_str() {
                FIELD_NAME => doc.add_text(self.fields.name, value),
                FIELD_TITLE => doc.add_text(self.fields.title, value),
                FIELD_BODY => doc.add_text(self.fields.body, value),
                other => doc.add_text(self.fields.meta, format!("{other}: {value}")),
            }
        }
        doc
    }
}
