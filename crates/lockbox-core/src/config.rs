use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{LockboxError, LockboxResult};

/// Top-level configuration (loaded from lockbox.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LockboxConfig {
    pub daemon: DaemonConfig,
    pub storage: StorageConfig,
    pub crypto: CryptoConfig,
    pub index: IndexConfig,
    pub ingest: IngestConfig,
}

impl LockboxConfig {
    /// Load from a TOML file, falling back to defaults when the file is absent.
    pub fn load(path: &Path) -> LockboxResult<Self> {
        if !path.exists() {
            tracing::warn!(
                "config file not found: {}  (using defaults)",
                path.display()
            );
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
            .map_err(|e| LockboxError::Config(format!("parsing {}: {e}", path.display())))
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Log level (default: info)
    pub log_level: String,
    /// Log format: "json" or "text"
    pub log_format: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            log_format: "text".into(),
        }
    }
}

/// On-disk roots. Everything written below them is ciphertext.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Blob ciphertext: `<storage_root>/<user>/<xx>/<token>`
    pub storage_root: PathBuf,
    /// Keystores: `<secrets_root>/<user>.keystore`
    pub secrets_root: PathBuf,
    /// Index segments: `<index_root>/<user>/<segment>`
    pub index_root: PathBuf,
    /// Resource metadata (JSON). Holds names and structure, never content.
    pub metadata_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("~/.local/share/lockbox/storage"),
            secrets_root: PathBuf::from("~/.local/share/lockbox/secrets"),
            index_root: PathBuf::from("~/.local/share/lockbox/indexes"),
            metadata_path: PathBuf::from("~/.local/share/lockbox/metadata.json"),
        }
    }
}

impl StorageConfig {
    /// Copy with `~` expanded in every root.
    pub fn expanded(&self) -> Self {
        Self {
            storage_root: expand_tilde(&self.storage_root),
            secrets_root: expand_tilde(&self.secrets_root),
            index_root: expand_tilde(&self.index_root),
            metadata_path: expand_tilde(&self.metadata_path),
        }
    }

    /// All roots below one base directory (tests, throwaway vaults).
    pub fn under(base: &Path) -> Self {
        Self {
            storage_root: base.join("storage"),
            secrets_root: base.join("secrets"),
            index_root: base.join("indexes"),
            metadata_path: base.join("metadata.json"),
        }
    }
}

/// Keystore KDF configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Argon2id memory cost in KiB (default: 65536 = 64 MiB)
    pub argon2_mem_cost_kib: u32,
    /// Argon2id time cost (iterations, default: 3)
    pub argon2_time_cost: u32,
    /// Argon2id parallelism (default: 4)
    pub argon2_parallelism: u32,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            argon2_mem_cost_kib: 65536,
            argon2_time_cost: 3,
            argon2_parallelism: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Maximum hits returned per query
    pub result_limit: usize,
    /// tantivy writer memory budget in bytes
    pub writer_memory_bytes: usize,
    /// Upper bound for one extraction + index update
    pub job_timeout_secs: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            result_limit: 10,
            writer_memory_bytes: 15_000_000,
            job_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Bytes of the upload kept for content-type sniffing
    pub probe_window_bytes: usize,
    /// Upper bound for the content-type detection join
    pub detect_timeout_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            probe_window_bytes: 8192,
            detect_timeout_secs: 30,
        }
    }
}

/// Expand `~` in path to the user's home directory
pub fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        let home = std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"));
        return home.join(rest);
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[daemon]
log_level = "debug"
log_format = "json"

[storage]
storage_root = "/srv/lockbox/storage"
secrets_root = "/srv/lockbox/secret"
index_root = "/srv/lockbox/indexes"
metadata_path = "/srv/lockbox/meta.json"

[crypto]
argon2_mem_cost_kib = 131072
argon2_time_cost = 4
argon2_parallelism = 8

[index]
result_limit = 25
job_timeout_secs = 10

[ingest]
probe_window_bytes = 4096
detect_timeout_secs = 5
"#;
        let config = LockboxConfig::from_toml(toml_str).unwrap();

        assert_eq!(config.daemon.log_level, "debug");
        assert_eq!(config.daemon.log_format, "json");
        assert_eq!(
            config.storage.secrets_root,
            PathBuf::from("/srv/lockbox/secret")
        );
        assert_eq!(config.crypto.argon2_mem_cost_kib, 131072);
        assert_eq!(config.index.result_limit, 25);
        assert_eq!(config.index.writer_memory_bytes, 15_000_000);
        assert_eq!(config.ingest.probe_window_bytes, 4096);
    }

    #[test]
    fn test_parse_defaults() {
        let config = LockboxConfig::from_toml("").unwrap();

        assert_eq!(config.daemon.log_level, "info");
        assert_eq!(config.crypto.argon2_time_cost, 3);
        assert_eq!(config.index.result_limit, 10);
        assert_eq!(config.ingest.detect_timeout_secs, 30);
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = LockboxConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed = LockboxConfig::from_toml(&toml_str).unwrap();

        assert_eq!(config.storage.index_root, parsed.storage.index_root);
        assert_eq!(config.index.job_timeout_secs, parsed.index.job_timeout_secs);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = LockboxConfig::load(&tmp.path().join("absent.toml")).unwrap();
        assert_eq!(config.index.result_limit, 10);
    }

    #[test]
    fn test_load_invalid_file_is_config_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("lockbox.toml");
        std::fs::write(&path, "[index]\nresult_limit = \"many\"\n").unwrap();
        let err = LockboxConfig::load(&path).unwrap_err();
        assert!(matches!(err, LockboxError::Config(_)));
    }

    #[test]
    fn test_expand_tilde() {
        let expanded = expand_tilde(Path::new("~/.local/share/lockbox"));
        assert!(!expanded.to_string_lossy().starts_with('~'));
        assert_eq!(
            expand_tilde(Path::new("/abs/path")),
            PathBuf::from("/abs/path")
        );
    }
}
