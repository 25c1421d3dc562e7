//! lockbox: encrypted file vault CLI
//!
//! Commands:
//!   mkdir <path>                 - create a folder
//!   put <local> <path>           - upload a local file (type sniffed unless --content-type)
//!   get <path> [<local>]         - download a file (stdout when no local path)
//!   ls [<path>]                  - list a folder
//!   mv <path> <dest>             - move or rename
//!   rm <path>                    - delete (folders recursively)
//!   search <query>               - full-text search, prints matching paths
//!   config show                  - display the effective configuration
//!
//! The password comes from LOCKBOX_PASSWORD or an interactive prompt.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use secrecy::SecretString;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use lockbox_core::config::{expand_tilde, LockboxConfig};
use lockbox_core::{ResourceKind, ResourceRecord};
use lockbox_vault::Vault;

#[derive(Parser, Debug)]
#[command(
    name = "lockbox",
    version,
    about = "Encrypted per-user file vault with full-text search"
)]
struct Cli {
    /// Path to lockbox.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "LOCKBOX_CONFIG",
        default_value = "~/.config/lockbox/lockbox.toml"
    )]
    config: PathBuf,

    /// Vault user
    #[arg(long, short = 'u', env = "LOCKBOX_USER")]
    user: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOCKBOX_LOG", default_value = "warn")]
    log: String,

    /// Log format (json, text)
    #[arg(long, env = "LOCKBOX_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a folder
    Mkdir { path: String },

    /// Upload a local file
    Put {
        local: PathBuf,
        path: String,
        /// Skip content-type detection and record this type
        #[arg(long)]
        content_type: Option<String>,
    },

    /// Download a file
    Get {
        path: String,
        /// Destination (default: stdout)
        local: Option<PathBuf>,
    },

    /// List a folder
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },

    /// Move or rename a file or folder
    Mv { path: String, dest: String },

    /// Delete a file, or a folder and everything below it
    Rm { path: String },

    /// Full-text search over your files
    Search {
        query: String,
        /// Print resource ids instead of paths
        #[arg(long)]
        ids: bool,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log, &cli.log_format);

    let config_path = expand_tilde(&cli.config);
    let config = LockboxConfig::load(&config_path)
        .with_context(|| format!("loading config {}", config_path.display()))?;
    debug!(config = %config_path.display(), "configuration loaded");

    if let Commands::Config {
        action: ConfigAction::Show,
    } = &cli.command
    {
        return cmd_config_show(&config, &config_path);
    }

    let user = cli
        .user
        .clone()
        .or_else(|| std::env::var("USER").ok())
        .context("no user given; use --user or set LOCKBOX_USER")?;

    let vault = Vault::open(&config).context("opening vault")?;
    let result = run(&vault, &user, cli.command).await;
    vault.shutdown().await;
    result
}

async fn run(vault: &Vault, user: &str, command: Commands) -> Result<()> {
    match command {
        Commands::Mkdir { path } => {
            vault.mkdir(user, &path)?;
            println!("Created: {path}");
        }
        Commands::Put {
            local,
            path,
            content_type,
        } => cmd_put(vault, user, &local, &path, content_type.as_deref()).await?,
        Commands::Get { path, local } => cmd_get(vault, user, &path, local.as_deref()).await?,
        Commands::Ls { path } => cmd_ls(vault, user, &path)?,
        Commands::Mv { path, dest } => {
            let resource = vault.get_resource(user, &path)?;
            let password = read_password()?;
            vault.move_resource(user, &password, &resource, &dest).await?;
            vault.wait_for_indexing().await;
            println!("Moved: {path} → {dest}");
        }
        Commands::Rm { path } => {
            let resource = vault.get_resource(user, &path)?;
            let password = read_password()?;
            vault.delete(user, &password, &resource).await?;
            vault.wait_for_indexing().await;
            println!("Deleted: {path}");
        }
        Commands::Search { query, ids } => {
            let password = read_password()?;
            if ids {
                for id in vault.search(user, &password, &query).await? {
                    println!("{id}");
                }
            } else {
                for path in vault.search_paths(user, &password, &query).await? {
                    println!("{path}");
                }
            }
        }
        Commands::Config { .. } => anyhow::bail!("config commands do not open the vault"),
    }
    Ok(())
}

// ── `lockbox put` ─────────────────────────────────────────────────────────────

async fn cmd_put(
    vault: &Vault,
    user: &str,
    local: &Path,
    path: &str,
    content_type: Option<&str>,
) -> Result<()> {
    let file = tokio::fs::File::open(local)
        .await
        .with_context(|| format!("opening {}", local.display()))?;
    let length = file.metadata().await.ok().map(|m| m.len());
    let password = read_password()?;

    let record = vault
        .put(user, path, file, length, content_type, &password)
        .await
        .with_context(|| format!("uploading {}", local.display()))?;
    // let the background index catch up before the process exits
    vault.wait_for_indexing().await;
    let indexed = vault
        .get_resource_by_id(record.id)
        .map(|r| r.is_indexed())
        .unwrap_or(false);

    info!(path = %path, id = %record.id, "uploaded");
    println!("Uploaded: {} → {path}", local.display());
    println!("  type:    {}", record.content_type().unwrap_or("-"));
    println!("  size:    {}", fmt_bytes(record.content_length().unwrap_or(0)));
    println!("  indexed: {}", if indexed { "yes" } else { "no" });
    Ok(())
}

// ── `lockbox get` ─────────────────────────────────────────────────────────────

async fn cmd_get(vault: &Vault, user: &str, path: &str, local: Option<&Path>) -> Result<()> {
    let resource = vault.get_resource(user, path)?;
    let password = read_password()?;
    let mut reader = vault.get(user, &resource, &password).await?;

    let copied = match local {
        Some(dest) => {
            let mut file = tokio::fs::File::create(dest)
                .await
                .with_context(|| format!("creating {}", dest.display()))?;
            let n = tokio::io::copy(&mut reader, &mut file).await?;
            file.sync_all().await?;
            eprintln!("Downloaded: {path} → {} ({})", dest.display(), fmt_bytes(n));
            n
        }
        None => {
            let mut stdout = tokio::io::stdout();
            let n = tokio::io::copy(&mut reader, &mut stdout).await?;
            tokio::io::AsyncWriteExt::flush(&mut stdout).await?;
            n
        }
    };
    debug!(path = %path, bytes = copied, "download complete");
    Ok(())
}

// ── `lockbox ls` ──────────────────────────────────────────────────────────────

fn cmd_ls(vault: &Vault, user: &str, path: &str) -> Result<()> {
    let folder = vault.get_resource(user, path)?;
    let entries = if folder.is_folder() {
        vault.get_children(&folder)?
    } else {
        vec![folder]
    };
    for entry in &entries {
        println!("{}", ls_line(entry));
    }
    Ok(())
}

fn ls_line(record: &ResourceRecord) -> String {
    match &record.kind {
        ResourceKind::Folder => format!("d  {:>10}  {:<24}  {}/", "-", "-", record.name),
        ResourceKind::File {
            content_type,
            length,
            indexed,
            ..
        } => format!(
            "{}  {:>10}  {:<24}  {}",
            if *indexed { "f" } else { "f*" },
            fmt_bytes(*length),
            content_type,
            record.name
        ),
    }
}

// ── `lockbox config show` ─────────────────────────────────────────────────────

fn cmd_config_show(config: &LockboxConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!(
            "# Configuration: defaults (no file at {})",
            config_path.display()
        );
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

// ── Utilities ─────────────────────────────────────────────────────────────────

fn read_password() -> Result<SecretString> {
    if let Ok(password) = std::env::var("LOCKBOX_PASSWORD") {
        return Ok(SecretString::from(password));
    }
    let password =
        rpassword::prompt_password("lockbox password: ").context("reading password")?;
    Ok(SecretString::from(password))
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

fn fmt_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
