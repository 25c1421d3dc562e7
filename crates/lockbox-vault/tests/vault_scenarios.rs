//! End-to-end vault scenarios.
//!
//! Drives the `Vault` facade the way a protocol front end would: uploads
//! without a content type, reads, moves, recursive deletes and searches,
//! then checks that nothing under the storage, index or secrets roots holds
//! plaintext.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use std::time::{Duration, Instant};

use lockbox_core::config::{CryptoConfig, IndexConfig, IngestConfig, LockboxConfig, StorageConfig};
use lockbox_core::{LockboxError, LockboxResult};
use lockbox_search::{BuiltinClassifier, BuiltinExtractor, ContentClassifier, TextExtractor, OCTET_STREAM};
use lockbox_vault::{JsonMetadataStore, Vault};
use secrecy::SecretString;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;

fn config(base: &Path) -> LockboxConfig {
    LockboxConfig {
        storage: StorageConfig::under(base),
        crypto: CryptoConfig {
            argon2_mem_cost_kib: 1024,
            argon2_time_cost: 1,
            argon2_parallelism: 1,
        },
        ..LockboxConfig::default()
    }
}

fn vault(tmp: &TempDir) -> Vault {
    Vault::open(&config(tmp.path())).unwrap()
}

fn pw() -> SecretString {
    SecretString::from("alice-password")
}

async fn read_all(vault: &Vault, user: &str, path: &str, password: &SecretString) -> Vec<u8> {
    let record = vault.get_resource(user, path).unwrap();
    let mut reader = vault.get(user, &record, password).await.unwrap();
    let mut out = Vec::new();
    reader.read_to_end(&mut out).await.unwrap();
    out
}

fn files_under(root: &Path) -> Vec<std::path::PathBuf> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                out.push(path);
            }
        }
    }
    out
}

#[tokio::test]
async fn upload_read_and_search_report() {
    let tmp = TempDir::new().unwrap();
    let vault = vault(&tmp);
    vault.mkdir("alice", "/docs").unwrap();

    let record = vault
        .put("alice", "/docs/report.txt", &b"hello world"[..], Some(11), None, &pw())
        .await
        .unwrap();
    assert_eq!(record.content_type(), Some("text/plain"));
    assert_eq!(record.content_length(), Some(11));

    assert_eq!(
        read_all(&vault, "alice", "/docs/report.txt", &pw()).await,
        b"hello world"
    );

    vault.wait_for_indexing().await;
    assert_eq!(vault.search("alice", &pw(), "hello").await.unwrap(), vec![record.id]);
    assert_eq!(
        vault.search_paths("alice", &pw(), "hello").await.unwrap(),
        vec!["/docs/report.txt".to_string()]
    );
    assert!(vault.get_resource_by_id(record.id).unwrap().is_indexed());
    vault.shutdown().await;
}

#[tokio::test]
async fn mkdir_conflicts() {
    let tmp = TempDir::new().unwrap();
    let vault = vault(&tmp);

    vault.mkdir("alice", "/docs").unwrap();
    assert!(matches!(
        vault.mkdir("alice", "/docs"),
        Err(LockboxError::ResourceAlreadyExists(_))
    ));
    assert!(matches!(
        vault.mkdir("alice", "/missing/sub"),
        Err(LockboxError::ResourceNotFound(_))
    ));
}

#[tokio::test]
async fn move_keeps_bytes_and_touches_both_parents() {
    let tmp = TempDir::new().unwrap();
    let vault = vault(&tmp);
    let docs = vault.mkdir("alice", "/docs").unwrap();
    let archive = vault.mkdir("alice", "/archive").unwrap();
    let report = vault
        .put("alice", "/docs/report.txt", &b"hello world"[..], None, None, &pw())
        .await
        .unwrap();

    let docs_before = vault.get_resource_by_id(docs.id).unwrap().modified;
    let archive_before = vault.get_resource_by_id(archive.id).unwrap().modified;

    vault
        .move_resource("alice", &pw(), &report, "/archive/report.txt")
        .await
        .unwrap();

    assert!(matches!(
        vault.get_resource("alice", "/docs/report.txt"),
        Err(LockboxError::ResourceNotFound(_))
    ));
    assert_eq!(
        read_all(&vault, "alice", "/archive/report.txt", &pw()).await,
        b"hello world"
    );
    assert!(vault.get_resource_by_id(docs.id).unwrap().modified > docs_before);
    assert!(vault.get_resource_by_id(archive.id).unwrap().modified > archive_before);

    let moved = vault.get_resource("alice", "/archive/report.txt").unwrap();
    assert_eq!(
        vault.get_parent(&moved).unwrap().map(|p| p.id),
        Some(archive.id)
    );
    vault.wait_for_indexing().await;
    assert_eq!(
        vault.search_paths("alice", &pw(), "hello").await.unwrap(),
        vec!["/archive/report.txt".to_string()]
    );
}

#[tokio::test]
async fn deleting_a_folder_removes_blobs_and_index_entries() {
    let tmp = TempDir::new().unwrap();
    let vault = vault(&tmp);
    vault.mkdir("alice", "/docs").unwrap();
    vault.mkdir("alice", "/docs/sub").unwrap();
    let a = vault
        .put("alice", "/docs/a.txt", &b"alpha shared"[..], None, None, &pw())
        .await
        .unwrap();
    let b = vault
        .put("alice", "/docs/sub/b.txt", &b"beta shared"[..], None, None, &pw())
        .await
        .unwrap();
    let keep = vault
        .put("alice", "/keep.txt", &b"gamma shared"[..], None, None, &pw())
        .await
        .unwrap();
    vault.wait_for_indexing().await;
    assert_eq!(vault.search("alice", &pw(), "shared").await.unwrap().len(), 3);

    let docs = vault.get_resource("alice", "/docs").unwrap();
    vault.delete("alice", &pw(), &docs).await.unwrap();
    vault.wait_for_indexing().await;

    assert!(vault.get_resource("alice", "/docs/sub").is_err());
    assert!(vault.get_resource_by_id(a.id).is_err());
    assert!(vault.get_resource_by_id(b.id).is_err());
    assert_eq!(vault.search("alice", &pw(), "shared").await.unwrap(), vec![keep.id]);
    assert!(vault.search("alice", &pw(), "alpha").await.unwrap().is_empty());

    let blobs = files_under(&tmp.path().join("storage"));
    assert_eq!(blobs.len(), 1, "only keep.txt's blob remains: {blobs:?}");
    assert_eq!(vault.index_stats().removed, 2);

    let root = vault.get_root_folder("alice").unwrap();
    let names: Vec<String> = vault
        .get_children(&root)
        .unwrap()
        .into_iter()
        .map(|r| r.name)
        .collect();
    assert_eq!(names, vec!["keep.txt"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_uploads_are_all_searchable() {
    let tmp = TempDir::new().unwrap();
    let vault = Arc::new(vault(&tmp));
    vault.mkdir("alice", "/inbox").unwrap();

    let mut tasks = Vec::new();
    for i in 0..8 {
        let vault = Arc::clone(&vault);
        tasks.push(tokio::spawn(async move {
            let body = format!("common marker{i}");
            vault
                .put(
                    "alice",
                    &format!("/inbox/note{i}.txt"),
                    body.as_bytes(),
                    None,
                    None,
                    &pw(),
                )
                .await
                .map(|r| r.id)
        }));
    }
    let mut ids = Vec::new();
    for task in tasks {
        ids.push(task.await.unwrap().unwrap());
    }
    vault.wait_for_indexing().await;

    for i in 0..8 {
        let hits = vault
            .search("alice", &pw(), &format!("marker{i}"))
            .await
            .unwrap();
        assert_eq!(hits, vec![ids[i]], "note{i} lost");
    }
    assert_eq!(vault.index_stats().indexed, 8);
    vault.shutdown().await;
}

#[tokio::test]
async fn nothing_on_disk_holds_plaintext() {
    let tmp = TempDir::new().unwrap();
    let vault = vault(&tmp);
    let secret = b"the launch codes are zebra-kumquat";
    vault
        .put("alice", "/secret.txt", &secret[..], None, None, &pw())
        .await
        .unwrap();
    vault.wait_for_indexing().await;
    vault.shutdown().await;

    let mut checked = 0;
    for root in ["storage", "indexes", "secrets"] {
        for file in files_under(&tmp.path().join(root)) {
            let raw = std::fs::read(&file).unwrap();
            for needle in [&b"zebra"[..], b"kumquat", b"launch"] {
                assert!(
                    !raw.windows(needle.len()).any(|w| w == needle),
                    "{} leaks {:?}",
                    file.display(),
                    String::from_utf8_lossy(needle)
                );
            }
            checked += 1;
        }
    }
    assert!(checked >= 3, "expected blob, keystore and index files");

    let metadata = std::fs::read(tmp.path().join("metadata.json")).unwrap();
    assert!(!metadata.windows(5).any(|w| w == b"zebra"));
}

#[tokio::test]
async fn wrong_password_is_rejected_everywhere() {
    let tmp = TempDir::new().unwrap();
    let vault = vault(&tmp);
    let record = vault
        .put("alice", "/a.txt", &b"hello"[..], None, None, &pw())
        .await
        .unwrap();
    let wrong = SecretString::from("guess");

    assert!(matches!(
        vault.get("alice", &record, &wrong).await,
        Err(LockboxError::BadPassword)
    ));
    assert!(matches!(
        vault.search("alice", &wrong, "hello").await,
        Err(LockboxError::BadPassword)
    ));
    assert!(matches!(
        vault.delete("alice", &wrong, &record).await,
        Err(LockboxError::BadPassword)
    ));
    assert!(matches!(
        vault.move_resource("alice", &wrong, &record, "/b.txt").await,
        Err(LockboxError::BadPassword)
    ));
    assert!(vault.get_resource("alice", "/a.txt").is_ok());
}

#[tokio::test]
async fn other_users_resources_are_invisible() {
    let tmp = TempDir::new().unwrap();
    let vault = vault(&tmp);
    let record = vault
        .put("alice", "/a.txt", &b"hello"[..], None, None, &pw())
        .await
        .unwrap();
    let bob = SecretString::from("bob-password");

    assert!(matches!(
        vault.get("bob", &record, &bob).await,
        Err(LockboxError::ResourceNotFound(_))
    ));
    assert!(matches!(
        vault.move_resource("bob", &bob, &record, "/stolen.txt").await,
        Err(LockboxError::ResourceNotFound(_))
    ));
    vault.wait_for_indexing().await;
    assert!(vault.search("bob", &bob, "hello").await.unwrap().is_empty());
}

#[tokio::test]
async fn reading_a_folder_is_invalid() {
    let tmp = TempDir::new().unwrap();
    let vault = vault(&tmp);
    let docs = vault.mkdir("alice", "/docs").unwrap();
    assert!(matches!(
        vault.get("alice", &docs, &pw()).await,
        Err(LockboxError::InvalidName(_))
    ));
}

struct FailingExtractor;

impl TextExtractor for FailingExtractor {
    fn extract(&self, _: &str, _: &[u8], _: &str) -> LockboxResult<HashMap<String, String>> {
        Err(LockboxError::index("extractor crashed"))
    }
}

#[tokio::test]
async fn index_failure_keeps_the_file() {
    let tmp = TempDir::new().unwrap();
    let vault = Vault::with_components(
        &config(tmp.path()),
        Arc::new(JsonMetadataStore::in_memory()),
        Arc::new(BuiltinClassifier),
        Arc::new(FailingExtractor),
    );
    let record = vault
        .put("alice", "/a.txt", &b"hello"[..], None, None, &pw())
        .await
        .unwrap();
    vault.wait_for_indexing().await;

    assert!(!vault.get_resource_by_id(record.id).unwrap().is_indexed());
    assert_eq!(vault.index_stats().failed, 1);
    assert_eq!(read_all(&vault, "alice", "/a.txt", &pw()).await, b"hello");
    assert!(vault.search("alice", &pw(), "hello").await.unwrap().is_empty());
}

#[tokio::test]
async fn metadata_survives_reopen() {
    let tmp = TempDir::new().unwrap();
    {
        let vault = vault(&tmp);
        vault.mkdir("alice", "/docs").unwrap();
        vault
            .put("alice", "/docs/a.txt", &b"persisted"[..], None, None, &pw())
            .await
            .unwrap();
        vault.wait_for_indexing().await;
        vault.shutdown().await;
    }

    let vault = vault(&tmp);
    assert_eq!(read_all(&vault, "alice", "/docs/a.txt", &pw()).await, b"persisted");
    assert_eq!(
        vault.search_paths("alice", &pw(), "persisted").await.unwrap(),
        vec!["/docs/a.txt".to_string()]
    );
}

#[tokio::test]
async fn renamed_file_is_found_by_its_new_name() {
    let tmp = TempDir::new().unwrap();
    let vault = vault(&tmp);
    let record = vault
        .put("alice", "/quarterly.txt", &b"revenue figures"[..], None, None, &pw())
        .await
        .unwrap();
    vault.wait_for_indexing().await;

    vault
        .move_resource("alice", &pw(), &record, "/summary.txt")
        .await
        .unwrap();
    vault.wait_for_indexing().await;

    assert_eq!(
        vault.search_paths("alice", &pw(), "summary").await.unwrap(),
        vec!["/summary.txt".to_string()]
    );
    assert!(vault.search("alice", &pw(), "quarterly").await.unwrap().is_empty());
    assert_eq!(
        vault.search_paths("alice", &pw(), "revenue").await.unwrap(),
        vec!["/summary.txt".to_string()]
    );
    assert_eq!(vault.index_stats().failed, 0);
}

struct StuckClassifier;

impl ContentClassifier for StuckClassifier {
    fn detect(&self, _: &str, _: &[u8]) -> String {
        std::thread::sleep(Duration::from_secs(3));
        "text/plain".to_string()
    }
}

#[tokio::test]
async fn stuck_classifier_falls_back_to_octet_stream() {
    let tmp = TempDir::new().unwrap();
    let config = LockboxConfig {
        ingest: IngestConfig {
            detect_timeout_secs: 1,
            ..IngestConfig::default()
        },
        ..config(tmp.path())
    };
    let vault = Vault::with_components(
        &config,
        Arc::new(JsonMetadataStore::in_memory()),
        Arc::new(StuckClassifier),
        Arc::new(BuiltinExtractor),
    );

    let started = Instant::now();
    let record = vault
        .put("alice", "/a.txt", &b"hello"[..], None, None, &pw())
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_millis(2500), "upload waited on the classifier");
    assert_eq!(record.content_type(), Some(OCTET_STREAM));
    assert_eq!(read_all(&vault, "alice", "/a.txt", &pw()).await, b"hello");
}

struct StuckExtractor;

impl TextExtractor for StuckExtractor {
    fn extract(&self, _: &str, _: &[u8], _: &str) -> LockboxResult<HashMap<String, String>> {
        std::thread::sleep(Duration::from_secs(2));
        Ok(HashMap::new())
    }
}

#[tokio::test]
async fn stuck_extractor_counts_as_index_failure() {
    let tmp = TempDir::new().unwrap();
    let config = LockboxConfig {
        index: IndexConfig {
            job_timeout_secs: 1,
            ..IndexConfig::default()
        },
        ..config(tmp.path())
    };
    let vault = Vault::with_components(
        &config,
        Arc::new(JsonMetadataStore::in_memory()),
        Arc::new(BuiltinClassifier),
        Arc::new(StuckExtractor),
    );

    let record = vault
        .put("alice", "/a.txt", &b"hello"[..], None, None, &pw())
        .await
        .unwrap();
    vault.wait_for_indexing().await;

    let stats = vault.index_stats();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.indexed, 0);
    assert!(!vault.get_resource_by_id(record.id).unwrap().is_indexed());
    assert_eq!(read_all(&vault, "alice", "/a.txt", &pw()).await, b"hello");
    vault.shutdown().await;
}
