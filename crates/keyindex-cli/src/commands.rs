//! Command implementations for the keyindex operator tool.
//!
//! Every command opens the database with whatever column families it has
//! on disk, so no table or index layout needs to be configured.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use keyindex_core::{ProgressMarker, Settings};
use keyindex_storage::{
    changelog_cf, index_cf, CfKind, EntryKey, KeyValue, Storage, VersionKey,
    PROGRESS_MARKER_KEY,
};

use crate::cli::Cli;

/// Load settings and apply CLI overrides.
pub fn load_settings(cli: &Cli) -> Result<Settings> {
    let mut settings =
        Settings::load(cli.config.as_deref()).context("Failed to load configuration")?;

    if let Some(log_level) = &cli.log_level {
        settings.log_level = log_level.clone();
    }
    if let Some(db_path) = &cli.db_path {
        settings.db_path = db_path.clone();
    }
    Ok(settings)
}

/// Install the global tracing subscriber. Logs go to stderr so command
/// output stays machine-readable.
pub fn init_logging(log_level: &str) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;
    Ok(())
}

fn open(db_path: &Path) -> Result<Storage> {
    if !db_path.exists() {
        anyhow::bail!("No database at {:?}", db_path);
    }
    Storage::open_existing(db_path).with_context(|| format!("Failed to open storage at {:?}", db_path))
}

/// Status of one index namespace.
#[derive(Debug, Clone, Serialize)]
pub struct IndexSummary {
    pub name: String,
    pub last_indexed_version: u64,
    pub marker_updated_at: Option<DateTime<Utc>>,
    pub entries: u64,
}

/// Status of one entity table.
#[derive(Debug, Clone, Serialize)]
pub struct TableSummary {
    pub name: String,
    /// Entity rows, tombstones included
    pub rows: u64,
    pub version: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DbStatus {
    pub indices: Vec<IndexSummary>,
    pub tables: Vec<TableSummary>,
    pub disk_usage_bytes: u64,
}

/// Gather status for every table and index in the database.
pub fn collect_status(storage: &Storage) -> Result<DbStatus> {
    let stats = storage.get_stats()?;
    let mut indices = Vec::new();
    let mut tables = Vec::new();

    for cf in &stats.column_families {
        match CfKind::classify(&cf.name) {
            CfKind::Index(name) => {
                let marker = storage
                    .get(&cf.name, PROGRESS_MARKER_KEY)?
                    .map(|bytes| ProgressMarker::from_bytes(&bytes))
                    .transpose()?;
                let entries = if marker.is_some() {
                    cf.entries.saturating_sub(1)
                } else {
                    cf.entries
                };
                indices.push(IndexSummary {
                    name,
                    last_indexed_version: marker.as_ref().map_or(0, |m| m.last_indexed_version),
                    marker_updated_at: marker.map(|m| m.updated_at),
                    entries,
                });
            }
            CfKind::Entity(name) => {
                let version = match storage.last_key(&changelog_cf(&name)) {
                    Ok(Some(key)) => VersionKey::from_bytes(&key)?.version,
                    Ok(None) => 0,
                    Err(keyindex_storage::StorageError::ColumnFamilyNotFound(_)) => 0,
                    Err(e) => return Err(e.into()),
                };
                tables.push(TableSummary {
                    name,
                    rows: cf.entries,
                    version,
                });
            }
            CfKind::Changelog(_) | CfKind::Other(_) => {}
        }
    }

    Ok(DbStatus {
        indices,
        tables,
        disk_usage_bytes: stats.disk_usage_bytes,
    })
}

/// Print database status.
pub fn show_status(db_path: &Path, json: bool) -> Result<()> {
    let storage = open(db_path)?;
    let status = collect_status(&storage)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("Database: {:?}", db_path);
    println!("Disk usage: {} bytes", status.disk_usage_bytes);
    println!();
    println!("Tables:");
    if status.tables.is_empty() {
        println!("  (none)");
    }
    for table in &status.tables {
        println!("  {:<24} version {:>10}  rows {:>10}", table.name, table.version, table.rows);
    }
    println!();
    println!("Indices:");
    if status.indices.is_empty() {
        println!("  (none)");
    }
    for index in &status.indices {
        let updated = index
            .marker_updated_at
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "  {:<24} indexed {:>10}  entries {:>10}  marker written {}",
            index.name, index.last_indexed_version, index.entries, updated
        );
    }
    Ok(())
}

/// One printable index entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ScannedEntry {
    pub key: KeyValue,
    pub source_id: KeyValue,
    /// `None` when the entry refers to the source value
    pub value: Option<serde_json::Value>,
}

impl std::fmt::Display for ScannedEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.value {
            Some(value) => write!(f, "{}\t{}\t{}", self.key, self.source_id, value),
            None => write!(f, "{}\t{}\t-> ref {}", self.key, self.source_id, self.source_id),
        }
    }
}

/// Read entries of an index, optionally restricted to one key.
pub fn read_entries(
    storage: &Storage,
    index: &str,
    key: Option<&KeyValue>,
    limit: Option<usize>,
) -> Result<Vec<ScannedEntry>> {
    let cf = index_cf(index);
    if !storage.has_cf(&cf) {
        anyhow::bail!("Unknown index: {}", index);
    }

    let (lower, upper) = match key {
        Some(key) => {
            let (lower, upper) = EntryKey::range_for(key);
            (lower, Some(upper))
        }
        None => (Vec::new(), None),
    };

    let mut entries = Vec::new();
    for item in storage.scan(&cf, &lower, upper.as_deref(), true)? {
        if limit.is_some_and(|limit| entries.len() >= limit) {
            break;
        }
        let (raw_key, raw_value) = item?;
        if !EntryKey::is_entry_key(&raw_key) {
            continue;
        }
        let entry = EntryKey::from_bytes(&raw_key)?;
        let value = match raw_value {
            Some(bytes) if !bytes.is_empty() => Some(serde_json::from_slice(&bytes)?),
            _ => None,
        };
        entries.push(ScannedEntry {
            key: entry.index_key,
            source_id: entry.source_id,
            value,
        });
    }
    Ok(entries)
}

/// Print the entries of an index.
pub fn scan_index(db_path: &Path, index: &str, key: Option<&str>, limit: Option<usize>) -> Result<()> {
    let storage = open(db_path)?;
    let key = key.map(KeyValue::parse_lenient);
    let entries = read_entries(&storage, index, key.as_ref(), limit)?;
    for entry in &entries {
        println!("{}", entry);
    }
    info!(index = %index, entries = entries.len(), "Scan complete");
    Ok(())
}

/// Remove every entry and the progress marker of an index.
pub fn clear_index(db_path: &Path, index: &str) -> Result<()> {
    let storage = open(db_path)?;
    let cf = index_cf(index);
    if !storage.has_cf(&cf) {
        anyhow::bail!("Unknown index: {}", index);
    }
    storage.clear_cf(&cf)?;
    storage.flush()?;
    println!("Cleared index {}; it will be rebuilt on next start", index);
    Ok(())
}

/// Compact every column family.
pub fn compact(db_path: &Path) -> Result<()> {
    let storage = open(db_path)?;
    storage.compact()?;
    println!("Compaction complete");
    Ok(())
}
