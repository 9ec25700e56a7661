//! `KasaDB` CLI tool for key management and operations.

#![warn(clippy::pedantic, clippy::nursery)]

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kasadb::credentials::{CredentialPolicy, HashAlgorithm};
use kasadb::db::{Database, DatabaseConfig};
use kasadb::identifier::Identifier;
use kasadb::keys::{KeyManager, KeyManagerConfig};
use kasadb_key_file::FileKeyProvider;
use std::path::{Path, PathBuf};
use tracing::{info, Level};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "kasadb")]
#[command(version, about = "KasaDB key management CLI", long_about = None)]
struct Cli {
    /// Path to the SQLite database
    #[arg(long, env = "KASADB_DATABASE", default_value = "kasadb.sqlite3", global = true)]
    database: PathBuf,

    /// Path to the master key file
    #[arg(long, env = "KASADB_MASTER_KEY", default_value = "master.key", global = true)]
    master_key: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "KASADB_LOG", default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new master key file
    Keygen,
    /// Create the database schema and an initial data key
    Init,
    /// Generate a new data key
    Rotate {
        /// Retire every other live key afterwards
        #[arg(long)]
        retire_others: bool,
    },
    /// Retire (soft-delete) a data key
    Retire {
        /// Key identifier
        key: String,
    },
    /// List data keys
    Keys,
    /// Derive a SCRAM credential record and print it as JSON
    Credentials {
        /// Password to derive from
        #[arg(long, env = "KASADB_PASSWORD", hide_env_values = true)]
        password: String,
        /// PBKDF2 hash
        #[arg(long, value_enum, default_value_t = Hash::Sha1)]
        kdf_hash: Hash,
        /// PBKDF2 iteration count
        #[arg(long, default_value_t = kasadb::credentials::DEFAULT_ITERATIONS)]
        iterations: u32,
        /// SCRAM hash
        #[arg(long, value_enum, default_value_t = Hash::Sha256)]
        scram_hash: Hash,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Hash {
    #[value(name = "sha1")]
    Sha1,
    #[value(name = "sha256")]
    Sha256,
    #[value(name = "sha384")]
    Sha384,
    #[value(name = "sha512")]
    Sha512,
}

impl From<Hash> for HashAlgorithm {
    fn from(hash: Hash) -> Self {
        match hash {
            Hash::Sha1 => Self::Sha1,
            Hash::Sha256 => Self::Sha256,
            Hash::Sha384 => Self::Sha384,
            Hash::Sha512 => Self::Sha512,
        }
    }
}

fn setup_logging(log_level: &str) -> Result<()> {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_writer(std::io::stderr)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set subscriber")?;
    Ok(())
}

fn open(database: &Path, master_key: &Path) -> Result<KeyManager> {
    let provider = FileKeyProvider::new(master_key)
        .with_context(|| format!("Failed to open master key {}", master_key.display()))?;
    let db = Database::open(DatabaseConfig::new(database))
        .with_context(|| format!("Failed to open database {}", database.display()))?;
    Ok(KeyManager::from_provider(&provider, db, KeyManagerConfig::default())?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.log_level)?;

    match cli.command {
        Commands::Keygen => {
            let provider = FileKeyProvider::init(&cli.master_key)
                .with_context(|| format!("Failed to create {}", cli.master_key.display()))?;
            info!(path = %provider.path().display(), "master key written");
            println!("{}", provider.path().display());
        }
        Commands::Init => {
            let keys = open(&cli.database, &cli.master_key)?;
            let key = keys.active().await?;
            println!("{}", key.id());
        }
        Commands::Rotate { retire_others } => {
            let keys = open(&cli.database, &cli.master_key)?;
            let fresh = keys.generate().await?;
            if retire_others {
                for (id, key) in keys.load_all().await? {
                    if id != fresh.id() && !key.is_deleted() {
                        keys.delete(&id).await?;
                    }
                }
            }
            println!("{}", fresh.id());
        }
        Commands::Retire { key } => {
            let id = Identifier::parse(&key)?;
            let keys = open(&cli.database, &cli.master_key)?;
            if keys.delete(&id).await?.is_none() {
                bail!("key {id} does not exist or is already retired");
            }
        }
        Commands::Keys => {
            let keys = open(&cli.database, &cli.master_key)?;
            let mut all: Vec<_> = keys.load_all().await?.into_values().collect();
            all.sort_by_key(|key| key.created_at());
            for key in all {
                let deleted = key.deleted_at().map_or_else(|| "-".to_string(), |at| at.to_rfc3339());
                println!("{}\t{}\t{deleted}", key.id(), key.created_at().to_rfc3339());
            }
        }
        Commands::Credentials { password, kdf_hash, iterations, scram_hash } => {
            let record = CredentialPolicy::default().derive(
                &password,
                kdf_hash.into(),
                iterations,
                scram_hash.into(),
            )?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
    }

    Ok(())
}
