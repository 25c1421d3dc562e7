//! Integration tests for the search index over encrypted segments.
//!
//! Verifies that extracted documents are searchable, that index files hold
//! no plaintext terms, and that a fresh `SearchIndex` over the same
//! directory sees previous commits.

use std::collections::HashMap;

use lockbox_core::ResourceId;
use lockbox_crypto::{derive_index_key, generate_content_key};
use lockbox_search::{BuiltinClassifier, BuiltinExtractor, ContentClassifier, SearchIndex, TextExtractor};
use lockbox_storage::CipherDirectory;
use tempfile::TempDir;

fn indexed_fields(name: &str, content: &[u8]) -> HashMap<String, String> {
    let mime = BuiltinClassifier.detect(name, content);
    let mut fields = BuiltinExtractor.extract(name, content, &mime).unwrap();
    fields.insert("name".to_string(), name.to_string());
    fields
}

#[test]
fn classified_and_extracted_documents_are_searchable() {
    let tmp = TempDir::new().unwrap();
    let key = derive_index_key(&generate_content_key()).unwrap();
    let dir = CipherDirectory::open(tmp.path().join("alice"), key).unwrap();
    let index = SearchIndex::open(dir.clone(), 15_000_000).unwrap();

    let report = ResourceId::new();
    let page = ResourceId::new();
    index
        .replace(report, &indexed_fields("report.txt", b"hello world, quarterly numbers"))
        .unwrap();
    index
        .replace(
            page,
            &indexed_fields("minutes.html", b"<html><title>Board Minutes</title><p>hello board</p></html>"),
        )
        .unwrap();

    let mut hello = index.search("hello", 10).unwrap();
    hello.sort();
    let mut expected = vec![report, page];
    expected.sort();
    assert_eq!(hello, expected);

    assert_eq!(index.search("quarterly", 10).unwrap(), vec![report]);
    assert_eq!(index.search("title:board", 10).unwrap(), vec![page]);
    assert_eq!(index.search("minutes.html", 10).unwrap(), vec![page]);
    assert_eq!(index.search("\"text/html\"", 10).unwrap(), vec![page]);

    for name in dir.list().unwrap() {
        let raw = std::fs::read(dir.root().join(&name)).unwrap();
        for term in [&b"quarterly"[..], b"hello", b"Board"] {
            assert!(
                !raw.windows(term.len()).any(|w| w == term),
                "segment {name} leaks {:?}",
                String::from_utf8_lossy(term)
            );
        }
    }
}

#[test]
fn commits_are_visible_to_a_new_handle() {
    let tmp = TempDir::new().unwrap();
    let key = derive_index_key(&generate_content_key()).unwrap();
    let dir = CipherDirectory::open(tmp.path().join("alice"), key).unwrap();

    let id = ResourceId::new();
    SearchIndex::open(dir.clone(), 15_000_000)
        .unwrap()
        .replace(id, &indexed_fields("a.txt", b"durable"))
        .unwrap();

    let reopened = SearchIndex::open(dir.clone(), 15_000_000).unwrap();
    assert_eq!(reopened.search("durable", 10).unwrap(), vec![id]);

    reopened.remove(id).unwrap();
    let again = SearchIndex::open(dir, 15_000_000).unwrap();
    assert!(again.search("durable", 10).unwrap().is_empty());
    assert_eq!(again.num_docs().unwrap(), 0);
}
