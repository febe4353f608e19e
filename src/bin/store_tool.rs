use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use memocache::{FileStore, FileStoreConfig, IterDirection, KvStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "store-tool")]
#[command(about = "Inspection tooling for memocache file stores")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Key count, journal length and snapshot age
    Stats {
        dir: PathBuf,
        #[arg(long)]
        realm: Option<String>,
    },
    /// Lists entries in key order
    Dump {
        dir: PathBuf,
        #[arg(long)]
        realm: Option<String>,
        /// Hex encoded key prefix
        #[arg(long)]
        prefix: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        reverse: bool,
    },
    /// Prints a single entry
    Get {
        dir: PathBuf,
        /// Hex encoded key
        key: String,
        #[arg(long)]
        realm: Option<String>,
    },
    /// Folds the journal into a fresh snapshot
    Compact { dir: PathBuf },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Stats { dir, realm } => stats(&dir, realm.as_deref()),
        Command::Dump {
            dir,
            realm,
            prefix,
            limit,
            reverse,
        } => dump(&dir, realm.as_deref(), prefix.as_deref(), limit, reverse),
        Command::Get { dir, key, realm } => get(&dir, realm.as_deref(), &key),
        Command::Compact { dir } => compact(&dir),
    }
}

fn open_store(dir: &Path) -> Result<FileStore> {
    if !dir.is_dir() {
        return Err(anyhow!("store directory {} does not exist", dir.display()));
    }
    FileStore::open(dir, FileStoreConfig::default())
        .with_context(|| format!("failed to open store at {}", dir.display()))
}

fn parse_hex(label: &str, value: &str) -> Result<Vec<u8>> {
    hex::decode(value.trim())
        .map_err(|e: hex::FromHexError| anyhow!("invalid {} '{}': {}", label, value, e))
}

fn scoped(store: &FileStore, realm: Option<&str>) -> Result<Arc<dyn KvStore>> {
    match realm {
        Some(realm) => Ok(store.with_realm(&parse_hex("realm", realm)?)),
        None => Ok(Arc::new(store.clone())),
    }
}

fn stats(dir: &Path, realm: Option<&str>) -> Result<()> {
    let store = open_store(dir)?;
    println!("{}", store.stats()?);
    if realm.is_some() {
        let view = scoped(&store, realm)?;
        let mut keys = 0usize;
        view.iterate_keys(&[], IterDirection::Forward, &mut |_| {
            keys += 1;
            true
        })?;
        println!("realm keys: {}", keys);
    }
    Ok(())
}

fn dump(
    dir: &Path,
    realm: Option<&str>,
    prefix: Option<&str>,
    limit: Option<usize>,
    reverse: bool,
) -> Result<()> {
    let store = open_store(dir)?;
    let view = scoped(&store, realm)?;
    let prefix = match prefix {
        Some(prefix) => parse_hex("prefix", prefix)?,
        None => Vec::new(),
    };
    let direction = if reverse {
        IterDirection::Backward
    } else {
        IterDirection::Forward
    };
    let limit = limit.unwrap_or(usize::MAX);

    let mut printed = 0usize;
    view.iterate(&prefix, direction, &mut |key, value| {
        if printed >= limit {
            return false;
        }
        println!("{}\t{}", hex::encode(key), render_value(value));
        printed += 1;
        true
    })?;
    eprintln!("{} entries", printed);
    Ok(())
}

fn get(dir: &Path, realm: Option<&str>, key: &str) -> Result<()> {
    let store = open_store(dir)?;
    let view = scoped(&store, realm)?;
    let key = parse_hex("key", key)?;
    match view.get(&key)? {
        Some(value) => {
            println!("{}", render_value(&value));
            Ok(())
        }
        None => Err(anyhow!("key {} not found", hex::encode(&key))),
    }
}

fn compact(dir: &Path) -> Result<()> {
    let store = open_store(dir)?;
    store.compact()?;
    println!("{}", store.stats()?);
    Ok(())
}

/// MessagePack payloads are shown as JSON, anything else as hex
fn render_value(bytes: &[u8]) -> String {
    match rmp_serde::from_slice::<serde_json::Value>(bytes) {
        Ok(value) => value.to_string(),
        Err(_) => format!("0x{}", hex::encode(bytes)),
    }
}
