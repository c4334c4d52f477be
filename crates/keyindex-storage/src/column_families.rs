//! Column family definitions for RocksDB.
//!
//! Column families are created per logical namespace:
//! - `index:<name>`: entries and the progress marker of one index (Zstd)
//! - `entity:<name>`: current values of one entity table
//! - `changelog:<name>`: latest version per entity id of one table

use rocksdb::{ColumnFamilyDescriptor, Options};

/// Prefix for index column families
pub const INDEX_CF_PREFIX: &str = "index:";

/// Prefix for entity value column families
pub const ENTITY_CF_PREFIX: &str = "entity:";

/// Prefix for entity changelog column families
pub const CHANGELOG_CF_PREFIX: &str = "changelog:";

/// Column family name for an index namespace
pub fn index_cf(name: &str) -> String {
    format!("{}{}", INDEX_CF_PREFIX, name)
}

/// Column family name for an entity table
pub fn entity_cf(name: &str) -> String {
    format!("{}{}", ENTITY_CF_PREFIX, name)
}

/// Column family name for an entity table's changelog
pub fn changelog_cf(name: &str) -> String {
    format!("{}{}", CHANGELOG_CF_PREFIX, name)
}

/// What a column family holds, derived from its name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CfKind {
    Index(String),
    Entity(String),
    Changelog(String),
    Other(String),
}

impl CfKind {
    pub fn classify(cf_name: &str) -> Self {
        if let Some(name) = cf_name.strip_prefix(INDEX_CF_PREFIX) {
            CfKind::Index(name.to_string())
        } else if let Some(name) = cf_name.strip_prefix(ENTITY_CF_PREFIX) {
            CfKind::Entity(name.to_string())
        } else if let Some(name) = cf_name.strip_prefix(CHANGELOG_CF_PREFIX) {
            CfKind::Changelog(name.to_string())
        } else {
            CfKind::Other(cf_name.to_string())
        }
    }
}

/// The set of tables and indices a database is opened with.
#[derive(Debug, Clone, Default)]
pub struct StorageLayout {
    pub tables: Vec<String>,
    pub indices: Vec<String>,
}

impl StorageLayout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entity table (entity + changelog column families)
    pub fn with_table(mut self, name: impl Into<String>) -> Self {
        self.tables.push(name.into());
        self
    }

    /// Add an index namespace
    pub fn with_index(mut self, name: impl Into<String>) -> Self {
        self.indices.push(name.into());
        self
    }

    /// All column family names this layout requires
    pub fn cf_names(&self) -> Vec<String> {
        let mut names = Vec::with_capacity(self.tables.len() * 2 + self.indices.len());
        for table in &self.tables {
            names.push(entity_cf(table));
            names.push(changelog_cf(table));
        }
        for index in &self.indices {
            names.push(index_cf(index));
        }
        names
    }
}

/// Index entries are small and highly repetitive; compress them.
fn index_options() -> Options {
    let mut opts = Options::default();
    opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
    opts
}

/// Options for a column family based on its kind
pub fn cf_options(cf_name: &str) -> Options {
    match CfKind::classify(cf_name) {
        CfKind::Index(_) => index_options(),
        _ => Options::default(),
    }
}

/// Build column family descriptors for the given names
pub fn build_cf_descriptors<I, S>(names: I) -> Vec<ColumnFamilyDescriptor>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    names
        .into_iter()
        .map(|name| ColumnFamilyDescriptor::new(name.as_ref(), cf_options(name.as_ref())))
        .collect()
}
